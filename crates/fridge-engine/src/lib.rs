pub mod camera;
pub mod config;
pub mod gemini;
pub mod prompts;

use std::error::Error as StdError;
use std::time::{SystemTime, UNIX_EPOCH};

use fridge_contracts::conversation::{CameraImage, Conversation, Turn};
use fridge_contracts::events::{timestamp, EventWriter, SessionEvent};
use sha2::{Digest, Sha256};
use tracing::warn;

pub use camera::{CameraError, HttpCamera, ImageSource};
pub use config::{
    load_config, ApiKey, CameraLocator, ConfigError, ConfigSource, FridgeConfig, LiteralSecrets,
    SessionOptions,
};
pub use gemini::{CompletionRequest, GeminiClient, ModelClient, ModelError};

/// What happened during one `run_turn` call.
#[derive(Debug, Default)]
pub struct TurnReport {
    /// Indices of the turns appended by this interaction, in order.
    pub appended: Vec<usize>,
    pub camera_warning: Option<CameraError>,
    pub model_error: Option<ModelError>,
}

impl TurnReport {
    pub fn answered(&self) -> bool {
        !self.appended.is_empty() && self.model_error.is_none()
    }
}

/// One chat session: the conversation plus the collaborators that feed it.
pub struct FridgeSession {
    conversation: Conversation,
    camera: Box<dyn ImageSource>,
    model: Box<dyn ModelClient>,
    system_instruction: String,
    resend_history: bool,
    events: Option<EventWriter>,
}

impl FridgeSession {
    pub fn new(
        camera: Box<dyn ImageSource>,
        model: Box<dyn ModelClient>,
        system_instruction: impl Into<String>,
        resend_history: bool,
    ) -> Self {
        Self {
            conversation: Conversation::new(),
            camera,
            model,
            system_instruction: system_instruction.into(),
            resend_history,
            events: None,
        }
    }

    /// Wires the HTTP camera and Gemini client from loaded configuration.
    pub fn from_config(config: &FridgeConfig, options: &SessionOptions) -> Result<Self, ConfigError> {
        let camera = HttpCamera::new(config.camera.clone(), options.camera_timeout)?;
        let model = GeminiClient::new(
            config.api_key.clone(),
            options.model.clone(),
            options.api_base.clone(),
            options.model_timeout,
        );
        Ok(Self::new(
            Box::new(camera),
            Box::new(model),
            options.system_instruction.clone(),
            options.resend_history,
        ))
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self.record(SessionEvent::SessionStarted {
            model: self.model.model().to_string(),
            camera: self.camera.describe(),
            resend_history: self.resend_history,
        });
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn model_name(&self) -> &str {
        self.model.model()
    }

    pub fn camera_description(&self) -> String {
        self.camera.describe()
    }

    pub fn resend_history(&self) -> bool {
        self.resend_history
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn replace_model(&mut self, model: Box<dyn ModelClient>) {
        self.model = model;
        self.record(SessionEvent::ModelChanged {
            model: self.model.model().to_string(),
        });
    }

    /// Fetches one frame without touching the conversation.
    pub fn snapshot(&self) -> Result<CameraImage, CameraError> {
        let result = self.camera.fetch();
        self.record_fetch(&result);
        result
    }

    /// Runs one interaction: user text, camera frame, model reply.
    ///
    /// User and image turns are committed as soon as they exist; the
    /// assistant turn is only appended when the model call succeeds.
    pub fn run_turn(&mut self, prompt: &str) -> TurnReport {
        let mut report = TurnReport::default();
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return report;
        }

        let history_end = self.conversation.len();
        self.append(Turn::user(prompt), &mut report);

        let fetched = self.camera.fetch();
        self.record_fetch(&fetched);
        let image_index = match fetched {
            Ok(image) => Some(self.append(Turn::user_image(image), &mut report)),
            Err(err) => {
                warn!(error = %error_chain_text(&err, 300), "camera fetch failed; continuing text-only");
                report.camera_warning = Some(err);
                None
            }
        };

        let completion = {
            let turns = self.conversation.turns();
            let request = CompletionRequest {
                system_instruction: &self.system_instruction,
                history: self.resend_history.then(|| &turns[..history_end]),
                prompt,
                image: image_index.and_then(|index| turns[index].image()),
            };
            self.model.complete(&request)
        };

        match completion {
            Ok(text) => {
                self.append(Turn::assistant(text), &mut report);
            }
            Err(err) => {
                warn!(model = self.model.model(), error = %error_chain_text(&err, 300), "model call failed");
                self.record(SessionEvent::ModelFailed {
                    model: self.model.model().to_string(),
                    error: error_chain_text(&err, 512),
                    timeout: err.is_timeout(),
                });
                report.model_error = Some(err);
            }
        }
        report
    }

    pub fn finish(&self) {
        self.record(SessionEvent::SessionFinished {
            turns: self.conversation.len(),
        });
    }

    fn append(&mut self, turn: Turn, report: &mut TurnReport) -> usize {
        let role = turn.role();
        let text = turn.text().to_string();
        let has_image = turn.has_image();
        let index = self.conversation.push(turn);
        report.appended.push(index);
        self.record(SessionEvent::TurnAppended {
            index,
            role,
            text,
            has_image,
        });
        index
    }

    fn record_fetch(&self, result: &Result<CameraImage, CameraError>) {
        if self.events.is_none() {
            return;
        }
        let event = match result {
            Ok(image) => SessionEvent::CameraFrame {
                url: image.source_url().to_string(),
                mime_type: image.mime_type().to_string(),
                width: image.width(),
                height: image.height(),
                bytes: image.bytes().len(),
                sha256: image_digest(image),
                fetched_at: timestamp(image.fetched_at()),
            },
            Err(err) => SessionEvent::CameraFailed {
                url: err.url().to_string(),
                error: error_chain_text(err, 512),
                timeout: err.is_timeout(),
            },
        };
        self.record(event);
    }

    /// Event log failures are logged and otherwise ignored.
    fn record(&self, event: SessionEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.record(&event) {
            warn!(event = event.kind(), error = %format!("{err:#}"), "failed to write session event");
        }
    }
}

pub fn image_digest(image: &CameraImage) -> String {
    hex::encode(Sha256::digest(image.bytes()))
}

/// Top-level message followed by each distinct cause.
pub fn error_chain_text(err: &(dyn StdError + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(": "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
