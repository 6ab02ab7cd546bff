use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::prompts::DEFAULT_SYSTEM_INSTRUCTION;

pub const API_KEY_VAR: &str = "GEMINI_API_KEY";
pub const API_KEY_FALLBACK_VAR: &str = "GOOGLE_API_KEY";
pub const CAMERA_URL_VAR: &str = "CAMERA_URL";
pub const BUCKET_NAME_VAR: &str = "BUCKET_NAME";
pub const OBJECT_KEY_VAR: &str = "OBJECT_KEY";
pub const STORAGE_BASE_URL_VAR: &str = "STORAGE_BASE_URL";

pub const DEFAULT_STORAGE_BASE: &str = "https://storage.googleapis.com";
pub const DEFAULT_OBJECT_KEY: &str = "fridge-images/latest_snap.jpg";
pub const DEFAULT_SECRETS_PATH: &str = "secrets.toml";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CAMERA_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no Gemini API key configured (set GEMINI_API_KEY)")]
    MissingApiKey,
    #[error(
        "no camera configured; set CAMERA_URL for a direct camera or BUCKET_NAME for object storage"
    )]
    MissingCameraLocator,
    #[error("both CAMERA_URL and BUCKET_NAME are set; configure exactly one camera source")]
    AmbiguousCameraLocator,
    #[error("{key} is not a valid http(s) URL: {value}")]
    InvalidUrl { key: String, value: String },
    #[error("'{0}' is not a valid bucket name")]
    InvalidBucket(String),
    #[error("'{0}' is not a usable object key")]
    InvalidObjectKey(String),
    #[error("failed to read secrets file {}", path.display())]
    SecretsFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse secrets file {}", path.display())]
    SecretsFileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Gemini API key. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First four and last two characters, for display.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "…".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{head}…{tail}")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraLocator {
    /// A camera serving its current frame over HTTP, e.g. `http://<ip>/capture`.
    Direct { url: Url },
    /// A public object that the camera uploads to.
    Bucket {
        storage_base: Url,
        bucket: String,
        object_key: String,
    },
}

impl CameraLocator {
    /// Address of the frame without any cache-busting token. Bucket and
    /// object key segments are percent-encoded into the path.
    pub fn object_url(&self) -> Result<Url, ConfigError> {
        match self {
            CameraLocator::Direct { url } => Ok(url.clone()),
            CameraLocator::Bucket {
                storage_base,
                bucket,
                object_key,
            } => {
                let mut url = storage_base.clone();
                url.set_query(None);
                url.set_fragment(None);
                url.path_segments_mut()
                    .map_err(|_| ConfigError::InvalidUrl {
                        key: STORAGE_BASE_URL_VAR.to_string(),
                        value: storage_base.to_string(),
                    })?
                    .pop_if_empty()
                    .push(bucket)
                    .extend(object_key_segments(object_key));
                Ok(url)
            }
        }
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, CameraLocator::Bucket { .. })
    }
}

impl fmt::Display for CameraLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraLocator::Direct { url } => write!(f, "camera {url}"),
            CameraLocator::Bucket {
                bucket, object_key, ..
            } => write!(f, "bucket {bucket}/{object_key}"),
        }
    }
}

/// API key plus camera locator, read once at startup.
#[derive(Debug, Clone)]
pub struct FridgeConfig {
    pub api_key: ApiKey,
    pub camera: CameraLocator,
}

/// Values given directly on the command line.
#[derive(Debug, Clone, Default)]
pub struct LiteralSecrets {
    pub api_key: Option<String>,
    pub camera_url: Option<String>,
    pub bucket: Option<String>,
    pub object_key: Option<String>,
    pub storage_base_url: Option<String>,
}

impl LiteralSecrets {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            API_KEY_VAR => self.api_key.clone(),
            CAMERA_URL_VAR => self.camera_url.clone(),
            BUCKET_NAME_VAR => self.bucket.clone(),
            OBJECT_KEY_VAR => self.object_key.clone(),
            STORAGE_BASE_URL_VAR => self.storage_base_url.clone(),
            _ => None,
        }
    }
}

/// Where the secrets come from. Chosen per deployment.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Literal(LiteralSecrets),
    SecretsFile(PathBuf),
    Environment,
}

pub fn load_config(source: &ConfigSource) -> Result<FridgeConfig, ConfigError> {
    match source {
        ConfigSource::Literal(literal) => resolve_config(|key| literal.lookup(key)),
        ConfigSource::SecretsFile(path) => {
            let table = read_secrets_file(path)?;
            resolve_config(|key| table.get(key).cloned())
        }
        ConfigSource::Environment => resolve_config(|key| env::var(key).ok()),
    }
}

/// Builds the config from a key lookup. Values are trimmed and empty
/// values count as unset.
pub fn resolve_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<FridgeConfig, ConfigError> {
    let get = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let api_key = get(API_KEY_VAR)
        .or_else(|| get(API_KEY_FALLBACK_VAR))
        .and_then(ApiKey::new)
        .ok_or(ConfigError::MissingApiKey)?;

    let camera = match (get(CAMERA_URL_VAR), get(BUCKET_NAME_VAR)) {
        (Some(_), Some(_)) => return Err(ConfigError::AmbiguousCameraLocator),
        (None, None) => return Err(ConfigError::MissingCameraLocator),
        (Some(url), None) => CameraLocator::Direct {
            url: parse_http_url(CAMERA_URL_VAR, &url)?,
        },
        (None, Some(bucket)) => {
            if !is_valid_bucket_name(&bucket) {
                return Err(ConfigError::InvalidBucket(bucket));
            }
            let object_key =
                get(OBJECT_KEY_VAR).unwrap_or_else(|| DEFAULT_OBJECT_KEY.to_string());
            if object_key_segments(&object_key).next().is_none() {
                return Err(ConfigError::InvalidObjectKey(object_key));
            }
            let storage_base = get(STORAGE_BASE_URL_VAR)
                .unwrap_or_else(|| DEFAULT_STORAGE_BASE.to_string());
            let locator = CameraLocator::Bucket {
                storage_base: parse_http_url(STORAGE_BASE_URL_VAR, &storage_base)?,
                bucket,
                object_key,
            };
            locator.object_url()?;
            locator
        }
    };

    Ok(FridgeConfig { api_key, camera })
}

/// Reads top-level string keys from a TOML secrets file.
pub fn read_secrets_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::SecretsFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = raw.parse().map_err(|source| ConfigError::SecretsFileParse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(table
        .into_iter()
        .filter_map(|(key, value)| value.as_str().map(|text| (key, text.to_string())))
        .collect())
}

/// Storage bucket naming: 3 to 222 chars of `[a-z0-9._-]`, starting and
/// ending with a letter or digit.
fn is_valid_bucket_name(name: &str) -> bool {
    let edge_ok = |ch: Option<char>| ch.is_some_and(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit());
    (3..=222).contains(&name.len())
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-'))
        && edge_ok(name.chars().next())
        && edge_ok(name.chars().last())
}

fn object_key_segments(object_key: &str) -> impl Iterator<Item = &str> {
    object_key.split('/').filter(|segment| !segment.is_empty())
}

fn parse_http_url(key: &str, value: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::InvalidUrl {
        key: key.to_string(),
        value: value.to_string(),
    };
    let url = Url::parse(value).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

/// Non-secret settings for one chat session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub api_base: String,
    /// Send earlier turns (text and images) with every model call.
    pub resend_history: bool,
    pub camera_timeout: Duration,
    pub model_timeout: Duration,
    pub system_instruction: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_base: default_api_base(),
            resend_history: false,
            camera_timeout: DEFAULT_CAMERA_TIMEOUT,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

fn default_api_base() -> String {
    env::var("GEMINI_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}
