use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ModelCatalog;
use crate::error::ValidationError;
use crate::message::PromptMessage;

/// A request that passed validation and is ready to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamRequestBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Option<Vec<PromptMessage>>,
}

/// Validate a `POST /openai/stream/` body.
///
/// `messages` must be present and non-empty. `model` falls back to the
/// catalog default and otherwise must be one the relay was configured for.
pub fn validate_stream_request(
    body: &[u8],
    catalog: &ModelCatalog,
) -> Result<RelayRequest, ValidationError> {
    let json: Value = serde_json::from_slice(body)
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;
    if !json.is_object() {
        return Err(ValidationError::Malformed("expected a JSON object".to_string()));
    }

    // Presence is checked before shape so a missing field always reports as such.
    if json.get("messages").map_or(true, Value::is_null) {
        return Err(ValidationError::MissingField("messages"));
    }

    let parsed: StreamRequestBody =
        serde_json::from_value(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    let messages = match parsed.messages {
        Some(messages) if !messages.is_empty() => messages,
        _ => return Err(ValidationError::MissingField("messages")),
    };

    let model = match parsed.model {
        Some(model) if !model.trim().is_empty() => model,
        _ => catalog.default_model.clone(),
    };
    if !catalog.supports(&model) {
        return Err(ValidationError::UnsupportedModel(model));
    }

    debug!("Validated request: model={}, messages={}", model, messages.len());
    Ok(RelayRequest { model, messages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use serde_json::json;

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_missing_messages() {
        let err = validate_stream_request(&body(json!({ "model": "gpt-4o" })), &ModelCatalog::default())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("messages"));
        assert_eq!(err.to_string(), "messages is required");
    }

    #[test]
    fn test_null_and_empty_messages_count_as_missing() {
        let catalog = ModelCatalog::default();
        for value in [json!({ "messages": null }), json!({ "messages": [] })] {
            let err = validate_stream_request(&body(value), &catalog).unwrap_err();
            assert_eq!(err, ValidationError::MissingField("messages"));
        }
    }

    #[test]
    fn test_model_defaults() {
        let request = validate_stream_request(
            &body(json!({ "messages": [{ "role": "user", "content": "Hi" }] })),
            &ModelCatalog::default(),
        )
        .unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages, vec![PromptMessage::user("Hi")]);
    }

    #[test]
    fn test_explicit_model_kept() {
        let request = validate_stream_request(
            &body(json!({
                "model": "gpt-4o",
                "messages": [
                    { "role": "system", "content": "Be brief." },
                    { "role": "user", "content": "Hi" }
                ]
            })),
            &ModelCatalog::default(),
        )
        .unwrap();
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.messages[0].role, Role::System);
    }

    #[test]
    fn test_unsupported_model() {
        let err = validate_stream_request(
            &body(json!({ "model": "gpt-2", "messages": [{ "role": "user", "content": "Hi" }] })),
            &ModelCatalog::default(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedModel("gpt-2".to_string()));
    }

    #[test]
    fn test_malformed_bodies() {
        let catalog = ModelCatalog::default();
        assert!(matches!(
            validate_stream_request(b"not json", &catalog),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            validate_stream_request(b"[1, 2]", &catalog),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            validate_stream_request(&body(json!({ "messages": [{ "role": "robot", "content": "x" }] })), &catalog),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_prior_aborted_context_accepted() {
        let request = validate_stream_request(
            &body(json!({
                "messages": [
                    { "role": "user", "content": "Tell me a story" },
                    { "role": "user", "content": "Tell me a story" }
                ]
            })),
            &ModelCatalog::default(),
        )
        .unwrap();
        assert_eq!(request.messages.len(), 2);
    }
}
