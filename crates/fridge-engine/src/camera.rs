use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fridge_contracts::conversation::CameraImage;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CACHE_CONTROL;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::{CameraLocator, ConfigError};
use crate::unix_millis;

/// Query parameter carrying the cache-busting token.
pub const CACHE_BUST_PARAM: &str = "t";

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera unreachable at {url}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("camera returned HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("camera returned an empty body from {url}")]
    EmptyBody { url: String },
    #[error("camera response from {url} is not a decodable image")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },
}

impl CameraError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CameraError::Unreachable { source, .. } if source.is_timeout())
    }

    pub fn url(&self) -> &str {
        match self {
            CameraError::Unreachable { url, .. }
            | CameraError::Status { url, .. }
            | CameraError::EmptyBody { url }
            | CameraError::Decode { url, .. } => url,
        }
    }
}

/// Something that can produce the current fridge photo.
pub trait ImageSource {
    /// One attempt, no retries.
    fn fetch(&self) -> Result<CameraImage, CameraError>;
    fn describe(&self) -> String;
}

/// Pulls the frame over HTTP from either a camera endpoint or a public
/// storage object.
#[derive(Debug)]
pub struct HttpCamera {
    locator: CameraLocator,
    base_url: Url,
    timeout: Duration,
    http: HttpClient,
    last_token: AtomicU64,
}

impl HttpCamera {
    pub fn new(locator: CameraLocator, timeout: Duration) -> Result<Self, ConfigError> {
        let base_url = locator.object_url()?;
        Ok(Self {
            locator,
            base_url,
            timeout,
            http: HttpClient::new(),
            last_token: AtomicU64::new(0),
        })
    }

    pub fn locator(&self) -> &CameraLocator {
        &self.locator
    }

    /// URL for the next fetch. Storage objects get a fresh `t=` token each
    /// call so no HTTP or CDN cache can answer with an older upload.
    pub fn request_url(&self) -> Url {
        let mut url = self.base_url.clone();
        if self.locator.is_bucket() {
            let token = self.next_cache_token();
            url.query_pairs_mut()
                .append_pair(CACHE_BUST_PARAM, &token.to_string());
        }
        url
    }

    /// Current unix millis, bumped past the previous token when the clock
    /// has not advanced.
    fn next_cache_token(&self) -> u64 {
        let now = unix_millis();
        let mut previous = self.last_token.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match self.last_token.compare_exchange_weak(
                previous,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }
}

impl ImageSource for HttpCamera {
    fn fetch(&self) -> Result<CameraImage, CameraError> {
        let url = self.request_url();
        let url_text = url.to_string();
        debug!(url = %url_text, timeout_ms = self.timeout.as_millis() as u64, "fetching camera frame");

        let response = self
            .http
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .timeout(self.timeout)
            .send()
            .map_err(|source| CameraError::Unreachable {
                url: url_text.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(CameraError::Status {
                url: url_text,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .map_err(|source| CameraError::Unreachable {
                url: url_text.clone(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(CameraError::EmptyBody { url: url_text });
        }

        let image = CameraImage::from_bytes(bytes.to_vec(), url_text.clone()).map_err(
            |source| CameraError::Decode {
                url: url_text.clone(),
                source,
            },
        )?;
        info!(
            url = %url_text,
            bytes = image.bytes().len(),
            width = image.width(),
            height = image.height(),
            mime = image.mime_type(),
            "camera frame fetched"
        );
        Ok(image)
    }

    fn describe(&self) -> String {
        self.locator.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::time::Duration;

    use image::{ImageFormat, Rgb, RgbImage};
    use mockito::Matcher;
    use url::Url;

    use super::{CameraError, HttpCamera, ImageSource, CACHE_BUST_PARAM};
    use crate::config::CameraLocator;

    fn jpeg_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(16, 12, Rgb([240, 240, 235]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Jpeg)
            .expect("jpeg encode");
        out.into_inner()
    }

    fn direct(url: &str) -> CameraLocator {
        CameraLocator::Direct {
            url: Url::parse(url).expect("url"),
        }
    }

    fn bucket(base: &str) -> CameraLocator {
        CameraLocator::Bucket {
            storage_base: Url::parse(base).expect("url"),
            bucket: "fridge-bucket".to_string(),
            object_key: "fridge-images/latest_snap.jpg".to_string(),
        }
    }

    fn token_of(url: &Url) -> Option<u64> {
        url.query_pairs()
            .find(|(key, _)| key == CACHE_BUST_PARAM)
            .and_then(|(_, value)| value.parse().ok())
    }

    #[test]
    fn direct_fetch_decodes_jpeg() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/capture")
            .with_status(200)
            .with_header("content-type", "image/jpeg")
            .with_body(jpeg_bytes())
            .create();

        let camera = HttpCamera::new(
            direct(&format!("{}/capture", server.url())),
            Duration::from_secs(5),
        )?;
        let image = camera.fetch()?;

        mock.assert();
        assert_eq!(image.mime_type(), "image/jpeg");
        assert_eq!((image.width(), image.height()), (16, 12));
        Ok(())
    }

    #[test]
    fn direct_url_is_used_verbatim() -> anyhow::Result<()> {
        let camera = HttpCamera::new(direct("http://10.15.72.125/capture"), Duration::from_secs(5))?;
        assert_eq!(camera.request_url().as_str(), "http://10.15.72.125/capture");
        assert_eq!(camera.request_url(), camera.request_url());
        assert_eq!(camera.describe(), "camera http://10.15.72.125/capture");
        Ok(())
    }

    #[test]
    fn non_200_status_is_reported() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/capture").with_status(503).create();

        let camera = HttpCamera::new(
            direct(&format!("{}/capture", server.url())),
            Duration::from_secs(5),
        )?;
        let err = camera.fetch().unwrap_err();
        assert!(matches!(err, CameraError::Status { status: 503, .. }));
        assert!(!err.is_timeout());
        Ok(())
    }

    #[test]
    fn other_success_codes_are_not_accepted() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/capture")
            .with_status(204)
            .create();

        let camera = HttpCamera::new(
            direct(&format!("{}/capture", server.url())),
            Duration::from_secs(5),
        )?;
        assert!(matches!(
            camera.fetch().unwrap_err(),
            CameraError::Status { status: 204, .. }
        ));
        Ok(())
    }

    #[test]
    fn garbage_body_is_a_decode_error() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/capture")
            .with_status(200)
            .with_body("<html>ESP32 busy</html>")
            .create();

        let camera = HttpCamera::new(
            direct(&format!("{}/capture", server.url())),
            Duration::from_secs(5),
        )?;
        assert!(matches!(camera.fetch().unwrap_err(), CameraError::Decode { .. }));
        Ok(())
    }

    #[test]
    fn empty_body_is_reported() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/capture").with_status(200).create();

        let camera = HttpCamera::new(
            direct(&format!("{}/capture", server.url())),
            Duration::from_secs(5),
        )?;
        assert!(matches!(camera.fetch().unwrap_err(), CameraError::EmptyBody { .. }));
        Ok(())
    }

    #[test]
    fn refused_connection_is_unreachable() -> anyhow::Result<()> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let camera = HttpCamera::new(
            direct(&format!("http://127.0.0.1:{port}/capture")),
            Duration::from_secs(2),
        )?;
        let err = camera.fetch().unwrap_err();
        assert!(matches!(err, CameraError::Unreachable { .. }));
        assert!(err.url().ends_with("/capture"));
        Ok(())
    }

    #[test]
    fn silent_camera_times_out() -> anyhow::Result<()> {
        // Accepts the TCP connection (kernel backlog) but never answers.
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let camera = HttpCamera::new(
            direct(&format!("http://127.0.0.1:{port}/capture")),
            Duration::from_millis(300),
        )?;
        let err = camera.fetch().unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        drop(listener);
        Ok(())
    }

    #[test]
    fn bucket_urls_differ_only_in_token() -> anyhow::Result<()> {
        let camera = HttpCamera::new(bucket("https://storage.googleapis.com"), Duration::from_secs(5))?;
        let first = camera.request_url();
        let second = camera.request_url();

        assert_ne!(first, second);
        let first_token = token_of(&first).expect("first token");
        let second_token = token_of(&second).expect("second token");
        assert!(second_token > first_token);

        let strip = |url: &Url| {
            let mut bare = url.clone();
            bare.set_query(None);
            bare
        };
        assert_eq!(strip(&first), strip(&second));
        assert_eq!(
            strip(&first).as_str(),
            "https://storage.googleapis.com/fridge-bucket/fridge-images/latest_snap.jpg"
        );
        Ok(())
    }

    #[test]
    fn bucket_fetch_sends_token_and_no_cache() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/fridge-bucket/fridge-images/latest_snap.jpg")
            .match_query(Matcher::Regex(format!("^{CACHE_BUST_PARAM}=[0-9]+$")))
            .match_header("cache-control", "no-cache")
            .with_status(200)
            .with_body(jpeg_bytes())
            .expect(2)
            .create();

        let camera = HttpCamera::new(bucket(&server.url()), Duration::from_secs(5))?;
        let first = camera.fetch()?;
        let second = camera.fetch()?;

        mock.assert();
        assert_ne!(first.source_url(), second.source_url());
        Ok(())
    }
}
