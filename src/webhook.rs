use std::fmt;
use std::sync::Arc;

use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::error::UpstreamError;
use crate::llm::build_messages;
use crate::server::AppState;

// ── Inbound payload ─────────────────────────────────────────────────────────

/// Chatwoot webhook payload. Only the fields the bridge reads are modelled;
/// a field of the wrong type is treated as absent.
#[derive(Debug, Default, Deserialize)]
pub struct InboundEvent {
    #[serde(default, deserialize_with = "lenient")]
    pub event: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub message_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub conversation: Option<Reference>,
    #[serde(default, deserialize_with = "lenient")]
    pub account: Option<Reference>,
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Reference {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<Id>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Chatwoot sends numeric IDs, but some proxies stringify them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(u64),
    Text(String),
}

impl Id {
    /// IDs end up as URL path segments, so text IDs are limited to
    /// `[A-Za-z0-9_-]`.
    fn is_well_formed(&self) -> bool {
        match self {
            Id::Number(_) => true,
            Id::Text(s) => {
                !s.is_empty()
                    && s.bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            }
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::Text(s) => f.write_str(s),
        }
    }
}

impl InboundEvent {
    /// A new message from the customer, as opposed to agent or bot output.
    pub fn is_incoming_message(&self) -> bool {
        self.event.as_deref() == Some("message_created")
            && self.message_type.as_deref() == Some("incoming")
    }

    fn into_incoming(self) -> Option<IncomingMessage> {
        let conversation_id = self.conversation?.id.filter(Id::is_well_formed)?;
        let account_id = self.account?.id.filter(Id::is_well_formed)?;
        let content = self.content?;
        Some(IncomingMessage {
            account_id: account_id.to_string(),
            conversation_id: conversation_id.to_string(),
            content,
        })
    }
}

/// A customer message that passed validation and should be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub account_id: String,
    pub conversation_id: String,
    pub content: String,
}

// ── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Input problems reported back to the caller. Everything past validation
/// is answered with 200.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookRejection {
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("Missing request body")]
    MissingBody,
    #[error("Missing required fields")]
    MissingFields,
}

impl WebhookRejection {
    fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingBody | Self::MissingFields => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

fn status_response(status: &'static str) -> Response {
    (StatusCode::OK, Json(StatusBody { status })).into_response()
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Largest body read from a webhook request.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub fn check_method(method: &Method) -> Result<(), WebhookRejection> {
    if *method != Method::POST {
        return Err(WebhookRejection::MethodNotAllowed);
    }
    Ok(())
}

/// Decide whether a POST body carries a message to answer.
///
/// `Ok(None)` means the event is valid but not one the bridge reacts to.
pub fn accept(body: &[u8]) -> Result<Option<IncomingMessage>, WebhookRejection> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(WebhookRejection::MissingBody);
    }
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| WebhookRejection::MissingBody)?;
    if !value.is_object() {
        return Err(WebhookRejection::MissingBody);
    }
    let event: InboundEvent =
        serde_json::from_value(value).map_err(|_| WebhookRejection::MissingBody)?;

    if !event.is_incoming_message() {
        return Ok(None);
    }

    event
        .into_incoming()
        .map(Some)
        .ok_or(WebhookRejection::MissingFields)
}

// ── Handler ─────────────────────────────────────────────────────────────────

/// The method is checked before the body is read, so any non-POST request
/// gets a 405 whatever its body.
pub async fn handle_webhook(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let span = info_span!(
        "webhook",
        request_id = %Uuid::new_v4(),
        conversation_id = tracing::field::Empty,
    );
    process(&state, request).instrument(span).await
}

async fn process(state: &AppState, request: Request) -> Response {
    let accepted = match check_method(request.method()) {
        Ok(()) => match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
            Ok(body) => accept(&body),
            Err(_) => Err(WebhookRejection::MissingBody),
        },
        Err(rejection) => Err(rejection),
    };

    let message = match accepted {
        Ok(Some(message)) => message,
        Ok(None) => return status_response("received"),
        Err(rejection) => {
            info!("Rejected webhook request: {}", rejection);
            return rejection.into_response();
        }
    };

    Span::current().record("conversation_id", message.conversation_id.as_str());

    match reply(state, &message).await {
        Ok(()) => info!(
            "Replied to conversation {} (account {})",
            message.conversation_id, message.account_id
        ),
        Err(err) => log_upstream_failure(&err),
    }

    status_response("success")
}

/// Generate an answer for `message` and post it back to the conversation.
pub async fn reply(state: &AppState, message: &IncomingMessage) -> Result<(), UpstreamError> {
    let messages = build_messages(state.llm.system_prompt(), &message.content);
    let reply_text = state.llm.complete(&messages).await?;

    state
        .chatwoot
        .post_message(&message.account_id, &message.conversation_id, &reply_text)
        .await
}

fn log_upstream_failure(err: &UpstreamError) {
    match err.response_detail() {
        Some((status, body)) => error!(status = %status, body = %body, "{}", err),
        None => error!("{}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_json(
        value: serde_json::Value,
    ) -> Result<Option<IncomingMessage>, WebhookRejection> {
        accept(value.to_string().as_bytes())
    }

    fn incoming() -> serde_json::Value {
        serde_json::json!({
            "event": "message_created",
            "message_type": "incoming",
            "conversation": { "id": 42 },
            "account": { "id": 7 },
            "content": "Hello"
        })
    }

    #[test]
    fn test_rejects_non_post() {
        for method in [Method::GET, Method::PUT, Method::DELETE] {
            assert_eq!(check_method(&method), Err(WebhookRejection::MethodNotAllowed));
        }
        assert_eq!(check_method(&Method::POST), Ok(()));
    }

    #[test]
    fn test_rejects_missing_body() {
        assert_eq!(accept(b""), Err(WebhookRejection::MissingBody));
        assert_eq!(accept(b"  \n"), Err(WebhookRejection::MissingBody));
        assert_eq!(accept(b"not json"), Err(WebhookRejection::MissingBody));
        assert_eq!(accept(b"null"), Err(WebhookRejection::MissingBody));
        assert_eq!(accept(b"[1, 2]"), Err(WebhookRejection::MissingBody));
    }

    #[test]
    fn test_accepts_incoming_message() {
        let message = accept_json(incoming()).unwrap().unwrap();
        assert_eq!(
            message,
            IncomingMessage {
                account_id: "7".to_string(),
                conversation_id: "42".to_string(),
                content: "Hello".to_string(),
            }
        );
    }

    #[test]
    fn test_accepts_string_ids() {
        let mut body = incoming();
        body["conversation"]["id"] = "abc-1".into();
        let message = accept_json(body).unwrap().unwrap();
        assert_eq!(message.conversation_id, "abc-1");
    }

    #[test]
    fn test_accepts_ids_beyond_i64() {
        let mut body = incoming();
        body["conversation"]["id"] = u64::MAX.into();
        let message = accept_json(body).unwrap().unwrap();
        assert_eq!(message.conversation_id, "18446744073709551615");
    }

    #[test]
    fn test_rejects_ids_that_would_escape_the_path() {
        for id in ["1/../../profile?x=", "42#frag", "..", "a b", ""] {
            let mut body = incoming();
            body["conversation"]["id"] = id.into();
            assert_eq!(accept_json(body), Err(WebhookRejection::MissingFields), "{id}");
        }

        let mut negative = incoming();
        negative["account"]["id"] = (-7).into();
        assert_eq!(accept_json(negative), Err(WebhookRejection::MissingFields));
    }

    #[test]
    fn test_ignores_other_events() {
        let mut outgoing = incoming();
        outgoing["message_type"] = "outgoing".into();
        assert_eq!(accept_json(outgoing), Ok(None));

        let mut updated = incoming();
        updated["event"] = "conversation_status_changed".into();
        assert_eq!(accept_json(updated), Ok(None));

        assert_eq!(accept_json(serde_json::json!({})), Ok(None));
    }

    #[test]
    fn test_filter_runs_before_field_validation() {
        let body = serde_json::json!({ "event": "message_updated", "message_type": "incoming" });
        assert_eq!(accept_json(body), Ok(None));
    }

    #[test]
    fn test_missing_required_fields() {
        for field in ["conversation", "account", "content"] {
            let mut body = incoming();
            body.as_object_mut().unwrap().remove(field);
            assert_eq!(accept_json(body), Err(WebhookRejection::MissingFields));
        }

        let mut null_id = incoming();
        null_id["account"]["id"] = serde_json::Value::Null;
        assert_eq!(accept_json(null_id), Err(WebhookRejection::MissingFields));

        let mut null_content = incoming();
        null_content["content"] = serde_json::Value::Null;
        assert_eq!(accept_json(null_content), Err(WebhookRejection::MissingFields));
    }

    #[test]
    fn test_wrongly_typed_fields() {
        let mut bad_content = incoming();
        bad_content["content"] = serde_json::json!({ "text": "Hello" });
        assert_eq!(accept_json(bad_content), Err(WebhookRejection::MissingFields));

        let mut bad_id = incoming();
        bad_id["conversation"]["id"] = true.into();
        assert_eq!(accept_json(bad_id), Err(WebhookRejection::MissingFields));

        let mut bad_event = incoming();
        bad_event["event"] = 5.into();
        assert_eq!(accept_json(bad_event), Ok(None));
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            WebhookRejection::MethodNotAllowed.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(WebhookRejection::MissingFields.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WebhookRejection::MissingFields.to_string(),
            "Missing required fields"
        );
    }
}
