async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelSummary>>, HttpApiError> {
    let inner = state.inner.lock().await;
    inner
        .store
        .list_models()
        .map(Json)
        .map_err(|err| HttpApiError::internal("failed to list models", Some(err.to_string())))
}

async fn get_model_summary(
    Path(model_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<QueryResponse>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let graph = load_model(&mut inner, &model_id)?;

    Ok(Json(QueryResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        query_type: "model.summary".to_string(),
        model_id,
        data: json!({
            "node_count": graph.nodes.len(),
            "config": graph.config,
        }),
    }))
}

async fn list_nodes(
    Path(model_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<QueryResponse>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let graph = load_model(&mut inner, &model_id)?;

    let nodes = graph
        .nodes
        .values()
        .map(|node| {
            json!({
                "key": node.key,
                "exemplar_count": node.exemplar_count,
                "success_pct": node.success_pct,
                "death_pct": node.death_pct,
                "outcomes": node.outcomes.len(),
                "transitions": node.transitions.len(),
                "choices": node.choices,
            })
        })
        .collect::<Vec<Value>>();

    Ok(Json(QueryResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        query_type: "model.nodes".to_string(),
        model_id,
        data: json!({ "nodes": nodes }),
    }))
}

async fn get_node_detail(
    Path((model_id, node_key)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<QueryResponse>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let graph = load_model(&mut inner, &model_id)?;

    let Some(node) = graph.node(&node_key) else {
        return Err(HttpApiError::node_not_found(&model_id, &node_key));
    };
    let data = serde_json::to_value(node)
        .map_err(|err| HttpApiError::internal("failed to encode node", Some(err.to_string())))?;

    Ok(Json(QueryResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        query_type: "model.node".to_string(),
        model_id,
        data,
    }))
}

async fn rank_candidates(
    Path(model_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<RankRequest>,
) -> Result<Json<QueryResponse>, HttpApiError> {
    let graph = {
        let mut inner = state.inner.lock().await;
        load_model(&mut inner, &model_id)?
    };

    let ranked = rank(
        &graph,
        request.agent,
        &request.snapshot,
        &request.open_decisions,
        &request.goals,
    );
    let data = serde_json::to_value(&ranked).map_err(|err| {
        HttpApiError::internal("failed to encode candidates", Some(err.to_string()))
    })?;

    Ok(Json(QueryResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        query_type: "model.rank".to_string(),
        model_id,
        data: json!({ "candidates": data }),
    }))
}
