//! Configuration for a Stagecast studio.
//!
//! Values are resolved once at startup (defaults, then an optional TOML file,
//! then CLI/env overrides) and stay immutable for the lifetime of a session.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_RTC_API_PORT: u16 = 1985;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StagecastConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub signaling: SignalingConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
}

/// ICE server (STUN/TURN) entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Signaling endpoints and transport bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Persistent WebSocket channel. Empty disables the primary transport.
    pub primary_url: String,
    /// Request/response HTTP endpoint. Empty disables the secondary transport.
    pub secondary_url: String,
    /// Stream identifier sent with every publish negotiation.
    pub stream_id: String,
    /// Original `rtc://` publish URL, echoed to the media server.
    pub stream_url: Option<String>,
    pub primary_connect_timeout_ms: u64,
    pub secondary_timeout_ms: u64,
    /// Substitute a receive-only answer when no media server is reachable.
    pub allow_degraded_answer: bool,
}

/// Voice activity detection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Level (0-100) a participant must exceed to count as speaking.
    pub vad_threshold: f32,
    pub sample_interval_ms: u64,
}

/// Composite output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

impl Default for StagecastConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
            signaling: SignalingConfig::default(),
            audio: AudioConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            primary_url: "ws://127.0.0.1:8443/signal".to_string(),
            secondary_url: format!("http://127.0.0.1:{DEFAULT_RTC_API_PORT}/rtc/v1/publish/"),
            stream_id: "live/studio".to_string(),
            stream_url: None,
            primary_connect_timeout_ms: 5_000,
            secondary_timeout_ms: 10_000,
            allow_degraded_answer: true,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 30.0,
            sample_interval_ms: 100,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2_500,
        }
    }
}

impl SignalingConfig {
    pub fn primary_enabled(&self) -> bool {
        !self.primary_url.trim().is_empty()
    }

    pub fn secondary_enabled(&self) -> bool {
        !self.secondary_url.trim().is_empty()
    }

    pub fn primary_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_connect_timeout_ms)
    }

    pub fn secondary_timeout(&self) -> Duration {
        Duration::from_millis(self.secondary_timeout_ms)
    }
}

impl AudioConfig {
    /// Never zero, even for an unvalidated config.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

impl VideoConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

impl StagecastConfig {
    /// Parse a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Point the secondary transport at a publish target.
    ///
    /// Accepts either an `rtc://host[:port]/app/stream` URL or a plain
    /// `http(s)://` API endpoint.
    pub fn apply_publish_url(&mut self, raw: &str) -> Result<()> {
        let raw = raw.trim();
        if raw.starts_with("rtc://") {
            let target = PublishTarget::parse(raw)?;
            self.signaling.secondary_url = target.api_url.clone();
            self.signaling.stream_id = target.stream_id();
            self.signaling.stream_url = Some(target.stream_url);
        } else {
            let url = Url::parse(raw).map_err(|e| Error::config(format!("{raw}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::config(format!(
                    "publish url must be rtc://, http:// or https://, got {raw}"
                )));
            }
            self.signaling.secondary_url = raw.to_string();
            self.signaling.stream_url = None;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(Error::config("at least one ICE server is required"));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::config("ICE server entry without urls"));
            }
            for url in &server.urls {
                if !["stun:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme))
                {
                    return Err(Error::config(format!("unsupported ICE server url {url}")));
                }
            }
        }

        let signaling = &self.signaling;
        if !signaling.primary_enabled() && !signaling.secondary_enabled() {
            return Err(Error::config("no signaling transport configured"));
        }
        if signaling.primary_enabled() {
            check_scheme(&signaling.primary_url, &["ws", "wss"])?;
        }
        if signaling.secondary_enabled() {
            check_scheme(&signaling.secondary_url, &["http", "https"])?;
        }
        if signaling.stream_id.trim().is_empty() {
            return Err(Error::config("stream id must not be empty"));
        }
        if signaling.primary_connect_timeout_ms == 0 || signaling.secondary_timeout_ms == 0 {
            return Err(Error::config("signaling timeouts must be non-zero"));
        }

        if !(0.0..=100.0).contains(&self.audio.vad_threshold) {
            return Err(Error::config(format!(
                "vad threshold {} outside 0..=100",
                self.audio.vad_threshold
            )));
        }
        if self.audio.sample_interval_ms == 0 {
            return Err(Error::config("audio sample interval must be non-zero"));
        }

        let video = &self.video;
        if video.fps == 0 || video.fps > 120 {
            return Err(Error::config(format!("fps {} outside 1..=120", video.fps)));
        }
        if video.width == 0 || video.height == 0 || video.width % 2 != 0 || video.height % 2 != 0
        {
            return Err(Error::config(format!(
                "output resolution {}x{} must be non-zero and even",
                video.width, video.height
            )));
        }
        Ok(())
    }
}

fn check_scheme(raw: &str, allowed: &[&str]) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::config(format!("{raw}: {e}")))?;
    if allowed.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{raw}: expected scheme {}",
            allowed.join(" or ")
        )))
    }
}

/// A parsed `rtc://host[:port]/app/stream` publish URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream: String,
    /// HTTP endpoint accepting the offer.
    pub api_url: String,
    /// The original `rtc://` URL, echoed to the server as `streamurl`.
    pub stream_url: String,
}

impl PublishTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::config(format!("invalid stream url format: {raw}"));
        let url = Url::parse(raw).map_err(|_| invalid())?;
        if url.scheme() != "rtc" {
            return Err(invalid());
        }
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = url.port().unwrap_or(DEFAULT_RTC_API_PORT);

        let path = url.path().trim_start_matches('/');
        let (app, stream) = path.split_once('/').ok_or_else(invalid)?;
        if app.is_empty() || stream.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            app: app.to_string(),
            stream: stream.to_string(),
            api_url: format!("http://{host}:{port}/rtc/v1/publish/"),
            stream_url: raw.to_string(),
        })
    }

    pub fn stream_id(&self) -> String {
        format!("{}/{}", self.app, self.stream)
    }
}
