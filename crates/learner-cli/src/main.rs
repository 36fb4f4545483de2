use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use contracts::{KindCatalog, LearnerConfig, Trace};
use learner_api::{serve, SqliteModelStore};
use learner_core::GraphTrainer;

fn print_usage() {
    println!("learner-cli <command>");
    println!("commands:");
    println!("  train <trace_dir> <model_id> [limit] [sqlite_path]");
    println!("    trains an interaction graph from json traces and persists it");
    println!("    trace_dir may carry catalog.json and config.json overrides");
    println!("  models [sqlite_path]");
    println!("  inspect <model_id> [node_key] [sqlite_path]");
    println!("  serve [addr] [sqlite_path]");
    println!("    default addr: 127.0.0.1:8080");
}

fn default_sqlite_path() -> String {
    std::env::var("LEARNER_SQLITE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "learner_models.sqlite".to_string())
}

fn parse_sqlite_path(value: Option<&String>) -> String {
    value
        .map(String::to_string)
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(default_sqlite_path)
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn load_catalog(trace_dir: &Path) -> Result<KindCatalog, String> {
    let path = trace_dir.join("catalog.json");
    if !path.is_file() {
        return Ok(KindCatalog::default_catalog());
    }
    let raw = fs::read_to_string(&path).map_err(|err| format!("failed to read catalog: {err}"))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid catalog.json: {err}"))
}

fn load_config(trace_dir: &Path) -> Result<LearnerConfig, String> {
    let path = trace_dir.join("config.json");
    if !path.is_file() {
        return Ok(LearnerConfig::default());
    }
    let raw = fs::read_to_string(&path).map_err(|err| format!("failed to read config: {err}"))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid config.json: {err}"))
}

fn load_traces(trace_dir: &Path, limit: Option<usize>) -> Result<Vec<Trace>, String> {
    let mut paths: Vec<PathBuf> = fs::read_dir(trace_dir)
        .map_err(|err| format!("failed to read {}: {err}", trace_dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .is_some_and(|name| name != "catalog.json" && name != "config.json")
        })
        .collect();
    paths.sort();
    if let Some(limit) = limit {
        paths.truncate(limit);
    }

    let mut traces = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = fs::read_to_string(&path)
            .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
        let trace: Trace = serde_json::from_str(&raw)
            .map_err(|err| format!("invalid trace {}: {err}", path.display()))?;
        traces.push(trace);
    }
    Ok(traces)
}

fn run_train(args: &[String]) -> Result<(), String> {
    let trace_dir = args
        .get(2)
        .map(PathBuf::from)
        .ok_or_else(|| "missing trace_dir".to_string())?;
    let model_id = args
        .get(3)
        .cloned()
        .ok_or_else(|| "missing model_id".to_string())?;
    let limit = args
        .get(4)
        .map(|value| {
            value
                .parse::<usize>()
                .map_err(|_| format!("invalid limit: {value}"))
        })
        .transpose()?;
    let sqlite_path = parse_sqlite_path(args.get(5));

    let catalog = load_catalog(&trace_dir)?;
    let config = load_config(&trace_dir)?;
    let traces = load_traces(&trace_dir, limit)?;
    if traces.is_empty() {
        return Err(format!("no traces found in {}", trace_dir.display()));
    }

    let mut trainer = GraphTrainer::new(config, catalog);
    for trace in &traces {
        trainer.add_trace(trace);
    }
    let graph = trainer.finalize();

    for node in graph.nodes.values() {
        println!(
            "node {} exemplars={} success={:.2} death={:.2} outcomes={} transitions={}",
            node.key,
            node.exemplar_count,
            node.success_pct,
            node.death_pct,
            node.outcomes.len(),
            node.transitions.len()
        );
    }

    let mut store = SqliteModelStore::open(&sqlite_path)
        .map_err(|err| format!("failed to open sqlite store: {err}"))?;
    store
        .save_model(&model_id, &graph)
        .map_err(|err| format!("failed to save model: {err}"))?;

    println!(
        "trained model_id={} traces={} nodes={} sqlite={}",
        model_id,
        traces.len(),
        graph.nodes.len(),
        sqlite_path
    );
    Ok(())
}

fn run_models(args: &[String]) -> Result<(), String> {
    let sqlite_path = parse_sqlite_path(args.get(2));
    let store = SqliteModelStore::open(&sqlite_path)
        .map_err(|err| format!("failed to open sqlite store: {err}"))?;
    let summaries = store
        .list_models()
        .map_err(|err| format!("failed to list models: {err}"))?;

    if summaries.is_empty() {
        println!("no models in {sqlite_path}");
        return Ok(());
    }
    for summary in summaries {
        println!(
            "model {} nodes={} trained_at={}",
            summary.model_id, summary.node_count, summary.trained_at
        );
    }
    Ok(())
}

fn run_inspect(args: &[String]) -> Result<(), String> {
    let model_id = args
        .get(2)
        .cloned()
        .ok_or_else(|| "missing model_id".to_string())?;
    let node_key = args.get(3).cloned();
    let sqlite_path = parse_sqlite_path(args.get(4));

    let store = SqliteModelStore::open(&sqlite_path)
        .map_err(|err| format!("failed to open sqlite store: {err}"))?;
    let graph = store
        .load_model(&model_id)
        .map_err(|err| format!("failed to load model: {err}"))?;

    match node_key {
        Some(node_key) => {
            let node = graph
                .node(&node_key)
                .ok_or_else(|| format!("no such node: {node_key}"))?;
            let payload = serde_json::to_string_pretty(node)
                .map_err(|err| format!("failed to encode node: {err}"))?;
            println!("{payload}");
        }
        None => {
            for node in graph.nodes.values() {
                println!(
                    "node {} exemplars={} success={:.2} death={:.2} outcomes={} transitions={}",
                    node.key,
                    node.exemplar_count,
                    node.success_pct,
                    node.death_pct,
                    node.outcomes.len(),
                    node.transitions.len()
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("train") => {
            if let Err(err) = run_train(&args) {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        }
        Some("models") => {
            if let Err(err) = run_models(&args) {
                eprintln!("error: {err}");
                std::process::exit(2);
            }
        }
        Some("inspect") => {
            if let Err(err) = run_inspect(&args) {
                eprintln!("error: {err}");
                std::process::exit(2);
            }
        }
        Some("serve") => match parse_socket_addr(args.get(2)) {
            Ok(addr) => {
                let sqlite_path = PathBuf::from(parse_sqlite_path(args.get(3)));
                println!("serving model api on http://{addr}");
                if let Err(err) = serve(addr, sqlite_path).await {
                    eprintln!("server error: {err}");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        },
        _ => {
            print_usage();
        }
    }
}
