mod agent;
mod aggregate;
mod catalog;
mod dedup;
mod delivery;
mod dispatch;
mod http;
mod llm;
mod metrics;
mod models;
mod normalize;
mod orders;
mod security;
mod store;

use agent::{Agent, TurnProcessor};
use aggregate::AggregationWindow;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::{Catalog, ImageContextCache, ProductResolver};
use dedup::DedupRegistry;
use delivery::{Delivery, GraphDelivery, LogDelivery};
use dispatch::Dispatcher;
use llm::{Inference, LlmClient};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::PageEnvelope;
use security::{Admission, SenderLimiter, SignatureState, verify_signature};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::{
    GraphProfileStore, HistoryStore, MemoryHistoryStore, MemoryOrderStore, NoProfileStore,
    OrderStore, ProfileStore, SupabaseStore,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "boutique.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let openapi: serde_json::Value =
        serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(serde_json::json!({"openapi":"3.0.3"}));

    let (agent, delivery) = build_agent();
    let state = AppState {
        agent: Arc::new(agent),
        delivery,
        limiter: Arc::new(SenderLimiter::from_env()),
        verify_token: std::env::var("VERIFY_TOKEN").unwrap_or_else(|_| "boutique-verify".into()),
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let signed = Router::new()
        .route("/webhook", post(receive_webhook))
        .route_layer(middleware::from_fn_with_state(
            SignatureState::from_env(),
            verify_signature,
        ));

    let app = Router::new()
        .route("/webhook", get(verify_webhook))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(signed)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "boutique.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Wire the full event pipeline from the environment. Collaborators degrade
/// individually: no Supabase means in-memory stores, no page token means
/// log-only delivery.
fn build_agent() -> (Agent, Arc<dyn Delivery>) {
    let catalog = Catalog::from_env();
    let image_context = Arc::new(ImageContextCache::from_env());
    let resolver = Arc::new(ProductResolver::new(catalog.clone(), image_context.clone()));
    let inference: Arc<dyn Inference> = Arc::new(LlmClient::from_env());

    let supabase = SupabaseStore::from_env();
    let order_store: Arc<dyn OrderStore> = match &supabase {
        Some(store) => Arc::new(store.clone()),
        None => {
            warn!(
                target = "boutique.api",
                "SUPABASE_URL unset; orders and history held in memory only"
            );
            Arc::new(MemoryOrderStore::default())
        }
    };
    let history: Arc<dyn HistoryStore> = match supabase {
        Some(store) => Arc::new(store),
        None => Arc::new(MemoryHistoryStore::default()),
    };
    let profiles: Arc<dyn ProfileStore> =
        GraphProfileStore::from_env().unwrap_or_else(|| Arc::new(NoProfileStore));
    let delivery: Arc<dyn Delivery> = match GraphDelivery::from_env() {
        Some(graph) => Arc::new(graph),
        None => Arc::new(LogDelivery),
    };

    let orders = Arc::new(orders::OrderAccumulator::new(order_store));
    let dispatcher = Dispatcher::new(
        resolver,
        image_context.clone(),
        orders,
        inference.clone(),
        profiles,
    );
    let processor = Arc::new(TurnProcessor::new(
        catalog,
        image_context,
        dispatcher,
        inference,
        history,
        delivery.clone(),
    ));
    let window = AggregationWindow::from_env(processor);
    (
        Agent::new(Arc::new(DedupRegistry::from_env()), window),
        delivery,
    )
}

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
    delivery: Arc<dyn Delivery>,
    limiter: Arc<SenderLimiter>,
    verify_token: String,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

/// Platform subscription handshake.
///
/// - Method: `GET`
/// - Path: `/webhook`
/// - Auth: `hub.verify_token` must match `VERIFY_TOKEN`
///
/// Echoes `hub.challenge` as plain text on success.
async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    crate::metrics::inc_requests("/webhook:get");
    match handshake_challenge(&state.verify_token, &params) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => {
            warn!(target = "boutique.api", "webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

fn handshake_challenge(
    verify_token: &str,
    params: &HashMap<String, String>,
) -> Option<String> {
    let mode = params.get("hub.mode")?;
    let token = params.get("hub.verify_token")?;
    if mode == "subscribe" && token == verify_token {
        params.get("hub.challenge").cloned()
    } else {
        None
    }
}

/// Inbound event batch.
///
/// - Method: `POST`
/// - Path: `/webhook`
/// - Auth: `X-Hub-Signature` HMAC over the raw body
///
/// Always acks with `EVENT_RECEIVED`; the platform retries anything else and
/// per-event failures are handled downstream.
async fn receive_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<PageEnvelope>,
) -> Response {
    crate::metrics::inc_requests("/webhook:post");
    if envelope.object != "page" {
        return StatusCode::NOT_FOUND.into_response();
    }

    for entry in &envelope.entry {
        for event in &entry.messaging {
            // Screen redeliveries before the limiter so retried events do
            // not consume the sender's tokens.
            if state.agent.is_duplicate(event).await {
                crate::metrics::inc_events("duplicate");
                continue;
            }
            match state.limiter.admit(&event.sender.id).await {
                Admission::Allowed => {
                    crate::metrics::inc_events("admitted");
                    state.agent.on_event(event).await;
                }
                Admission::Throttled { notify } => {
                    crate::metrics::inc_events("rate_limited");
                    if notify {
                        state
                            .delivery
                            .deliver(
                                &event.sender.id,
                                &models::OutboundResponse::text(
                                    "Dạ chị/anh nhắn hơi nhanh, em xin phép trả lời \
                                     lần lượt từng tin nhé ạ!",
                                ),
                            )
                            .await;
                    }
                }
            }
        }
    }
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "boutique-bot-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    Json((*state.openapi).clone()).into_response()
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Boutique Bot API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
