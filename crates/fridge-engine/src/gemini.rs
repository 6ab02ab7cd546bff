use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fridge_contracts::conversation::{CameraImage, Role, Turn};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ApiKey;
use crate::truncate_text;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed")]
    Transport(#[source] reqwest::Error),
    #[error("model API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model API returned an invalid payload: {0}")]
    InvalidResponse(String),
    #[error("model declined to answer ({reason})")]
    Blocked { reason: String },
    #[error("model returned an empty response")]
    EmptyResponse,
}

impl ModelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModelError::Transport(source) if source.is_timeout())
    }
}

/// Everything one model call gets to see.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system_instruction: &'a str,
    /// Earlier turns, only set when history resending is enabled.
    pub history: Option<&'a [Turn]>,
    pub prompt: &'a str,
    pub image: Option<&'a CameraImage>,
}

pub trait ModelClient {
    fn model(&self) -> &str;
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, ModelError>;
}

pub struct GeminiClient {
    api_base: String,
    api_key: ApiKey,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(
        api_key: ApiKey,
        model: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl ModelClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, ModelError> {
        let endpoint = self.endpoint();
        let payload = build_payload(request);
        debug!(
            endpoint = %endpoint,
            with_image = request.image.is_some(),
            history_turns = request.history.map(<[Turn]>::len).unwrap_or(0),
            "calling model"
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.expose())])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(|err| ModelError::Transport(err.without_url()))?;
        let response_payload = response_json_or_error(response)?;
        let text = extract_text(&response_payload)?;
        info!(model = %self.model, chars = text.chars().count(), "model replied");
        Ok(text)
    }
}

/// `generateContent` body for one request.
pub fn build_payload(request: &CompletionRequest<'_>) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    for turn in request.history.unwrap_or_default() {
        push_content(&mut contents, wire_role(turn.role()), turn_parts(turn));
    }

    let mut current = vec![json!({ "text": request.prompt })];
    if let Some(image) = request.image {
        current.push(image_part(image));
    }
    push_content(&mut contents, "user", current);

    json!({
        "systemInstruction": {
            "parts": [{ "text": request.system_instruction }],
        },
        "contents": contents,
    })
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn turn_parts(turn: &Turn) -> Vec<Value> {
    let mut parts = vec![json!({ "text": turn.text() })];
    if let Some(image) = turn.image() {
        parts.push(image_part(image));
    }
    parts
}

/// Appends parts, merging into the previous content when the role repeats
/// so that roles strictly alternate on the wire.
fn push_content(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if let Some(last) = contents.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(existing) = last.get_mut("parts").and_then(Value::as_array_mut) {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({ "role": role, "parts": parts }));
}

fn image_part(image: &CameraImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type(),
            "data": BASE64.encode(image.bytes()),
        }
    })
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, ModelError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| ModelError::Transport(err.without_url()))?;
    if !status.is_success() {
        return Err(ModelError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        });
    }
    serde_json::from_str(&body).map_err(|err| ModelError::InvalidResponse(err.to_string()))
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate_text(body.trim(), 512))
}

fn extract_text(payload: &Value) -> Result<String, ModelError> {
    if let Some(reason) = payload
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ModelError::Blocked {
            reason: reason.to_string(),
        });
    }

    let Some(candidate) = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        return Err(ModelError::EmptyResponse);
    };

    let text = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return match candidate.get("finishReason").and_then(Value::as_str) {
            Some(reason) if reason != "STOP" => Err(ModelError::Blocked {
                reason: reason.to_string(),
            }),
            _ => Err(ModelError::EmptyResponse),
        };
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use fridge_contracts::conversation::{CameraImage, Turn};
    use image::{ImageFormat, Rgb, RgbImage};
    use mockito::Matcher;
    use serde_json::{json, Value};

    use super::{
        build_payload, extract_text, CompletionRequest, GeminiClient, ModelClient, ModelError,
    };
    use crate::config::ApiKey;

    fn sample_image() -> CameraImage {
        let image = RgbImage::from_pixel(4, 4, Rgb([200, 30, 30]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).expect("png");
        CameraImage::from_bytes(out.into_inner(), "http://cam/capture").expect("decode")
    }

    fn client(base: &str) -> GeminiClient {
        GeminiClient::new(
            ApiKey::new("test-gemini-key").expect("key"),
            "gemini-2.5-flash",
            base,
            Duration::from_secs(5),
        )
    }

    fn reply(text: &str) -> String {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP",
            }],
        })
        .to_string()
    }

    #[test]
    fn payload_sends_prompt_then_image_for_current_turn() {
        let image = sample_image();
        let payload = build_payload(&CompletionRequest {
            system_instruction: "Be a fridge.",
            history: None,
            prompt: "What can I cook?",
            image: Some(&image),
        });

        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            json!("Be a fridge.")
        );
        let contents = payload["contents"].as_array().expect("contents");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[0]["parts"][0]["text"], json!("What can I cook?"));
        assert_eq!(
            contents[0]["parts"][1]["inlineData"]["mimeType"],
            json!("image/png")
        );
        assert!(contents[0]["parts"][1]["inlineData"]["data"]
            .as_str()
            .map(|data| !data.is_empty())
            .unwrap_or(false));
    }

    #[test]
    fn payload_without_image_is_text_only() {
        let payload = build_payload(&CompletionRequest {
            system_instruction: "Be a fridge.",
            history: None,
            prompt: "What's in my fridge?",
            image: None,
        });
        let parts = payload["contents"][0]["parts"].as_array().expect("parts");
        assert_eq!(parts.len(), 1);
        assert!(parts[0].get("inlineData").is_none());
    }

    #[test]
    fn history_alternates_roles_on_the_wire() {
        let history = vec![
            Turn::user("Any eggs?"),
            Turn::user_image(sample_image()),
            Turn::assistant("Yes, six eggs."),
            Turn::user("And milk?"),
        ];
        let payload = build_payload(&CompletionRequest {
            system_instruction: "Be a fridge.",
            history: Some(&history),
            prompt: "What about bread?",
            image: None,
        });

        let contents = payload["contents"].as_array().expect("contents");
        let roles: Vec<&str> = contents
            .iter()
            .filter_map(|content| content["role"].as_str())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);

        // text + image-turn text + image
        assert_eq!(contents[0]["parts"].as_array().map(Vec::len), Some(3));
        assert!(contents[0]["parts"][2].get("inlineData").is_some());
        // trailing user turn from a failed call merges with the new prompt
        assert_eq!(contents[2]["parts"][0]["text"], json!("And milk?"));
        assert_eq!(contents[2]["parts"][1]["text"], json!("What about bread?"));
    }

    #[test]
    fn complete_posts_to_generate_content_with_key() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/gemini-2.5-flash:generateContent")
            .match_query(Matcher::UrlEncoded(
                "key".to_string(),
                "test-gemini-key".to_string(),
            ))
            .match_body(Matcher::PartialJson(json!({
                "contents": [{ "role": "user", "parts": [{ "text": "What can I cook?" }] }],
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply("Egusi soup with the spinach."))
            .create();

        let text = client(&server.url()).complete(&CompletionRequest {
            system_instruction: "Be a fridge.",
            history: None,
            prompt: "What can I cook?",
            image: None,
        })?;

        mock.assert();
        assert_eq!(text, "Egusi soup with the spinach.");
        Ok(())
    }

    #[test]
    fn api_errors_carry_status_and_message() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/models/gemini-2.5-flash:generateContent")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(
                json!({ "error": { "code": 400, "message": "API key not valid." } }).to_string(),
            )
            .create();

        let err = client(&server.url())
            .complete(&CompletionRequest {
                system_instruction: "Be a fridge.",
                history: None,
                prompt: "hi",
                image: None,
            })
            .unwrap_err();

        match err {
            ModelError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "API key not valid.");
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn transport_errors_do_not_leak_the_key() -> anyhow::Result<()> {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let err = client(&format!("http://127.0.0.1:{port}"))
            .complete(&CompletionRequest {
                system_instruction: "Be a fridge.",
                history: None,
                prompt: "hi",
                image: None,
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::Transport(_)));
        let mut chain = String::new();
        let mut source: Option<&dyn std::error::Error> = Some(&err);
        while let Some(cause) = source {
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        assert!(!chain.contains("test-gemini-key"));
        Ok(())
    }

    #[test]
    fn extract_text_joins_parts() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Jollof " }, { "text": "rice." }] },
            }],
        });
        assert_eq!(extract_text(&payload)?, "Jollof rice.");
        Ok(())
    }

    #[test]
    fn extract_text_reports_blocks_and_empties() {
        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert!(matches!(
            extract_text(&blocked),
            Err(ModelError::Blocked { ref reason }) if reason == "SAFETY"
        ));

        let cut = json!({ "candidates": [{ "finishReason": "RECITATION" }] });
        assert!(matches!(extract_text(&cut), Err(ModelError::Blocked { .. })));

        let empty = json!({ "candidates": [] });
        assert!(matches!(extract_text(&empty), Err(ModelError::EmptyResponse)));

        let blank = json!({
            "candidates": [{ "content": { "parts": [{ "text": "  " }] }, "finishReason": "STOP" }],
        });
        assert!(matches!(extract_text(&blank), Err(ModelError::EmptyResponse)));

        assert!(matches!(
            extract_text(&Value::Null),
            Err(ModelError::EmptyResponse)
        ));
    }

    #[test]
    fn invalid_json_is_reported() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/models/gemini-2.5-flash:generateContent")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create();

        let err = client(&server.url())
            .complete(&CompletionRequest {
                system_instruction: "Be a fridge.",
                history: None,
                prompt: "hi",
                image: None,
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidResponse(_)));
        Ok(())
    }
}
