use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::CommandError;
use crate::engine::Engine;
use crate::entity::Command;

#[derive(Serialize)]
struct PingResponse {
    status: String,
}

#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    entities: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct SelectRequest {
    option: String,
}

#[derive(Deserialize)]
struct SetRequest {
    value: f64,
}

#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = match &self {
            CommandError::UnknownEntity(_) => StatusCode::NOT_FOUND,
            CommandError::IntegrationGone(_) => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::Failed(_) => StatusCode::CONFLICT,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    Json(InfoResponse {
        version: state.version.to_string(),
        hostname,
        entities: state.engine.state_snapshot().entities.len(),
    })
}

/// GET /v1/entities: every entity's last published state.
#[tracing::instrument(skip(state))]
async fn entities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.state_snapshot();
    Json(snapshot.entities.values().cloned().collect::<Vec<_>>())
}

#[tracing::instrument(skip(state))]
async fn entity(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Response {
    match state.engine.state_snapshot().entities.get(&entity_id) {
        Some(entity) => Json(entity.clone()).into_response(),
        None => CommandError::UnknownEntity(entity_id).into_response(),
    }
}

async fn run(state: &AppState, entity_id: &str, command: Command) -> Response {
    tracing::debug!("{} <- {:?}", entity_id, command);
    match state.engine.execute(entity_id, command).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

#[tracing::instrument(skip(state))]
async fn press(State(state): State<Arc<AppState>>, Path(entity_id): Path<String>) -> Response {
    run(&state, &entity_id, Command::Press).await
}

#[tracing::instrument(skip(state, request))]
async fn select(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(request): Json<SelectRequest>,
) -> Response {
    run(&state, &entity_id, Command::SelectOption(request.option)).await
}

#[tracing::instrument(skip(state, request))]
async fn set(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(request): Json<SetRequest>,
) -> Response {
    run(&state, &entity_id, Command::SetValue(request.value)).await
}

fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/entities", get(entities))
        .route("/v1/entities/:entity_id", get(entity))
        .route("/v1/entities/:entity_id/press", post(press))
        .route("/v1/entities/:entity_id/select", post(select))
        .route("/v1/entities/:entity_id/set", post(set))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the entity API on `listen:port` until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState {
        version: env!("CARGO_PKG_VERSION"),
        engine,
    });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Map;
    use serde_json::Value;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::FromIntegrationMessage;
    use crate::engine::FromIntegrationSender;
    use crate::engine::Integration;
    use crate::engine::IntegrationError;
    use crate::engine::ToIntegrationMessage;
    use crate::entity::EntityState;
    use crate::entity::Platform;

    const BUTTON: &str = "button.zonneplan_cp1_start";

    /// One button that accepts presses and rejects everything else.
    struct ButtonIntegration;

    #[async_trait]
    impl Integration for ButtonIntegration {
        fn name(&self) -> &str {
            "stub"
        }

        async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), IntegrationError> {
            tx.send(FromIntegrationMessage::EntityDiscovered {
                entity_id: BUTTON.to_string(),
                integration_name: "stub".to_string(),
            })
            .await?;
            tx.send(FromIntegrationMessage::StateChanged {
                state: EntityState {
                    entity_id: BUTTON.to_string(),
                    unique_id: "cp-1_start".to_string(),
                    name: "Start charging",
                    platform: Platform::Button,
                    available: true,
                    value: Value::Null,
                    unit: None,
                    device_class: None,
                    attributes: Map::new(),
                    options: None,
                    min: None,
                    max: None,
                    last_reset: None,
                    last_updated: None,
                },
            })
            .await?;
            Ok(())
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), IntegrationError> {
            let ToIntegrationMessage::Command { command, reply, .. } = msg;
            let _ = reply.send(match command {
                Command::Press => Ok(()),
                _ => Err("buttons can only be pressed".to_string()),
            });
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), IntegrationError> {
            Ok(())
        }
    }

    async fn router() -> Router {
        let engine = Arc::new(Engine::new());
        engine.register_integration(Box::new(ButtonIntegration)).await;
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        for _ in 0..100 {
            if !engine.state_snapshot().entities.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        create_router(Arc::new(AppState {
            version: "test",
            engine,
        }))
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (status, body) = call(router().await, get_request("/v1/ping")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_entities() {
        let (status, body) = call(router().await, get_request("/v1/entities")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["entity_id"], BUTTON);
        assert_eq!(body[0]["platform"], "button");

        let (status, body) = call(router().await, get_request(&format!("/v1/entities/{}", BUTTON))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"], true);

        let (status, body) = call(router().await, get_request("/v1/entities/sensor.nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown entity sensor.nope");
    }

    #[tokio::test]
    async fn test_commands() {
        let uri = format!("/v1/entities/{}/press", BUTTON);
        let (status, _) = call(router().await, post_request(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let uri = format!("/v1/entities/{}/set", BUTTON);
        let (status, body) = call(router().await, post_request(&uri, json!({"value": 2.0}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "buttons can only be pressed");

        let (status, _) = call(
            router().await,
            post_request("/v1/entities/select.nope/select", json!({"option": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
