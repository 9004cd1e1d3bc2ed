//! Gated chat endpoint

use axum::{extract::State, http::HeaderMap, Json};
use tokio::time::timeout;
use uuid::Uuid;

use crate::{
    chat::{ChatReply, ChatRequest},
    error::{ApiError, ApiResult},
    routes::ClientIp,
    state::AppState,
};

pub async fn chat(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatReply>> {
    let outcome = state.gate.check(&client_ip, &headers).await?;
    let outcome_name = outcome.as_str();
    let principal = outcome.into_principal().inspect_err(|_| {
        tracing::debug!(client_ip = %client_ip, outcome = outcome_name, "Chat request refused");
    })?;

    if request.message.trim().is_empty() {
        return Err(ApiError::Validation("Message is empty".to_string()));
    }

    let req_id = Uuid::new_v4();
    tracing::info!(
        %req_id,
        user_id = %principal.id,
        history = request.history.len(),
        "Forwarding chat request"
    );

    let reply = timeout(state.config.chat_timeout, state.chat.reply(&request))
        .await
        .inspect_err(|_| tracing::warn!(%req_id, "Chat backend timed out"))??;

    Ok(Json(reply))
}
