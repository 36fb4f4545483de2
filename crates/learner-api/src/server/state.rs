#[derive(Clone)]
struct AppState {
    inner: Arc<Mutex<ServerInner>>,
}

impl AppState {
    fn new(store: SqliteModelStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServerInner {
                store,
                cache: BTreeMap::new(),
            })),
        }
    }
}

struct ServerInner {
    store: SqliteModelStore,
    cache: BTreeMap<String, Arc<RuntimeGraph>>,
}

/// Loaded models are immutable, so they cache for the life of the server.
fn load_model(inner: &mut ServerInner, model_id: &str) -> Result<Arc<RuntimeGraph>, HttpApiError> {
    if let Some(graph) = inner.cache.get(model_id) {
        return Ok(graph.clone());
    }
    match inner.store.load_model(model_id) {
        Ok(graph) => {
            let graph = Arc::new(graph);
            inner.cache.insert(model_id.to_string(), graph.clone());
            Ok(graph)
        }
        Err(err) => Err(HttpApiError::from_persistence(model_id, err)),
    }
}
