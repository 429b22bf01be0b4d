use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::pdu::EntityStatePdu;
use shared::types::{RelayStatus, ServiceKey, ServiceView};
use crate::error::RelayError;
use crate::events::InboundMessage;
use crate::relay::client::RelayClient;
use crate::relay::server::RelayServer;
use crate::state::StateHandle;

#[derive(Clone)]
pub struct AppState {
    pub state: StateHandle,
    pub server: RelayServer,
    pub client: RelayClient,
    /// Timestamp stamped on the next broadcast PDU
    pub pdu_clock: Arc<AtomicU32>,
}

#[derive(Serialize)]
pub struct BroadcastResponse {
    pub sessions: usize,
    pub timestamp: u32,
}

#[derive(Serialize)]
pub struct MessageView {
    pub source: ServiceKey,
    pub received_at: DateTime<Utc>,
    pub summary: String,
    pub decoded: bool,
    pub length: usize,
}

impl From<&InboundMessage> for MessageView {
    fn from(message: &InboundMessage) -> Self {
        Self {
            source: message.source.clone(),
            received_at: message.received_at,
            summary: message.summary(),
            decoded: message.frame.is_decoded(),
            length: message.frame.bytes.len(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(get_status))
        .route("/v1/server/start", post(start_server))
        .route("/v1/server/stop", post(stop_server))
        .route("/v1/server/broadcast", post(broadcast))
        .route("/v1/services", get(get_services))
        .route("/v1/services/select", post(select_service))
        .route("/v1/services/selected", get(get_selected))
        .route("/v1/subscription", post(subscribe).delete(unsubscribe))
        .route("/v1/services/subscription", post(subscribe_to).delete(unsubscribe_from))
        .route("/v1/messages", get(get_messages))
        .with_state(state)
}

fn status_code(error: &RelayError) -> StatusCode {
    match error {
        RelayError::AlreadyListening | RelayError::AlreadySubscribed(_) | RelayError::NotListening => {
            StatusCode::CONFLICT
        }
        RelayError::NoSelection | RelayError::UnknownService(_) => StatusCode::NOT_FOUND,
        RelayError::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
        RelayError::BindFailed { .. }
        | RelayError::RegistrationFailed(_)
        | RelayError::Encode(_)
        | RelayError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn get_status(State(app): State<AppState>) -> Result<Json<RelayStatus>, RelayError> {
    app.state.status().await.map(Json)
}

async fn start_server(State(app): State<AppState>) -> Result<Json<RelayStatus>, RelayError> {
    app.server.start().await?;
    app.state.status().await.map(Json)
}

async fn stop_server(State(app): State<AppState>) -> Result<StatusCode, RelayError> {
    app.server.stop().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broadcast(State(app): State<AppState>) -> Result<Json<BroadcastResponse>, RelayError> {
    let timestamp = app.pdu_clock.fetch_add(1, Ordering::Relaxed);
    let payload = EntityStatePdu::sample(timestamp).marshal()?;
    let sessions = app.server.broadcast(payload).await?;
    tracing::info!("Sent PDU {} to {} session(s)", timestamp, sessions);
    Ok(Json(BroadcastResponse { sessions, timestamp }))
}

async fn get_services(State(app): State<AppState>) -> Result<Json<Vec<ServiceView>>, RelayError> {
    app.state.snapshot().await.map(Json)
}

async fn select_service(
    State(app): State<AppState>,
    Json(key): Json<ServiceKey>,
) -> Result<Json<ServiceView>, RelayError> {
    let entry = app.state.select(key).await?;
    Ok(Json(entry.view()))
}

async fn get_selected(State(app): State<AppState>) -> Result<Json<ServiceView>, RelayError> {
    let entry = app.state.selected().await?;
    Ok(Json(entry.view()))
}

async fn subscribe(State(app): State<AppState>) -> Result<Json<ServiceView>, RelayError> {
    app.client.subscribe_selected().await?;
    get_selected(State(app)).await
}

async fn unsubscribe(State(app): State<AppState>) -> Result<Json<ServiceView>, RelayError> {
    app.client.unsubscribe_selected().await?;
    get_selected(State(app)).await
}

async fn subscribe_to(
    State(app): State<AppState>,
    Json(key): Json<ServiceKey>,
) -> Result<StatusCode, RelayError> {
    app.client.subscribe(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unsubscribe_from(
    State(app): State<AppState>,
    Json(key): Json<ServiceKey>,
) -> Result<StatusCode, RelayError> {
    app.client.unsubscribe(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_messages(State(app): State<AppState>) -> Result<Json<Vec<MessageView>>, RelayError> {
    let messages = app.state.messages().await?;
    Ok(Json(messages.iter().map(MessageView::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use shared::codec::PduFrame;
    use shared::pdu::EncodeError;

    #[test]
    fn test_caller_misuse_maps_to_client_errors() {
        assert_eq!(status_code(&RelayError::NoSelection), StatusCode::NOT_FOUND);
        assert_eq!(status_code(&RelayError::AlreadyListening), StatusCode::CONFLICT);
        assert_eq!(
            status_code(&RelayError::AlreadySubscribed(ServiceKey::new("h", "s"))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_code(&RelayError::ConnectFailed {
                addr: "10.0.0.1:1".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_code(&RelayError::Unavailable("state thread")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_code(&RelayError::from(EncodeError::TooManyArticulationParameters(300))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_message_view() {
        let pdu = EntityStatePdu::sample(3);
        let message = InboundMessage::new(
            ServiceKey::new("h1", "A"),
            PduFrame {
                bytes: pdu.marshal().unwrap(),
                decoded: Ok(pdu),
            },
        );

        let view = MessageView::from(&message);
        assert!(view.decoded);
        assert_eq!(view.length, 144);
        assert_eq!(view.summary, "Entity State - Entity Category: 0, Location: (1, 1, 1)");
    }
}
