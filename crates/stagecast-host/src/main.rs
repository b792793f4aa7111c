mod console;

mod host {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use clap::Parser;
    use stagecast_common::helpers::env_bool;
    use stagecast_common::{IceServerConfig, StagecastConfig};
    use stagecast_media::{DeviceCapture, MediaRequest};
    use stagecast_rtc::ConnectionManager;
    use stagecast_studio::{speaker, Compositor, Layout, Session};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use crate::console::{self, Command};

    #[derive(Parser, Debug)]
    #[command(name = "stagecast")]
    #[command(about = "Multi-guest live studio: composites guests and publishes over WebRTC")]
    pub struct Args {
        /// TOML configuration file
        #[arg(long, env = "STAGECAST_CONFIG")]
        config: Option<PathBuf>,

        /// Publish target: rtc://host[:port]/app/stream or an http(s) publish API
        #[arg(long, env = "STAGECAST_PUBLISH_URL")]
        publish_url: Option<String>,

        /// Primary signaling WebSocket URL (empty disables it)
        #[arg(long, env = "STAGECAST_SIGNAL_URL")]
        signal_url: Option<String>,

        /// Stream id announced to the signaling server
        #[arg(long, env = "STAGECAST_STREAM_ID")]
        stream_id: Option<String>,

        /// ICE server URL; repeat or comma-separate for several
        #[arg(long = "ice-server", env = "STAGECAST_ICE_SERVERS", value_delimiter = ',')]
        ice_servers: Vec<String>,

        /// Voice activity threshold (0-100)
        #[arg(long)]
        vad_threshold: Option<f32>,

        /// Audio level sampling interval in milliseconds
        #[arg(long)]
        sample_interval_ms: Option<u64>,

        /// Output frame rate
        #[arg(long)]
        fps: Option<u32>,

        /// Output width
        #[arg(long)]
        width: Option<u32>,

        /// Output height
        #[arg(long)]
        height: Option<u32>,

        /// Output bitrate in kbps
        #[arg(long)]
        bitrate_kbps: Option<u32>,

        /// Fail instead of streaming against a synthesized answer when no
        /// media server is reachable
        #[arg(long, env = "STAGECAST_NO_DEGRADED", default_value_t = false)]
        no_degraded: bool,

        /// Capture the host camera
        #[arg(long, env = "STAGECAST_CAMERA", default_value_t = false)]
        camera: bool,

        /// Camera index or name (defaults to the first camera)
        #[arg(long, env = "STAGECAST_CAMERA_DEVICE")]
        camera_device: Option<String>,

        /// Leave the host microphone off
        #[arg(long, env = "STAGECAST_NO_MIC", default_value_t = false)]
        no_mic: bool,

        /// Initial layout
        #[arg(long, default_value = "grid-2x2")]
        layout: Layout,

        /// Start streaming immediately
        #[arg(long, default_value_t = false)]
        start: bool,
    }

    impl Args {
        /// File (or defaults), then flags and environment on top.
        fn build_config(&self) -> Result<StagecastConfig> {
            let mut config = match &self.config {
                Some(path) => StagecastConfig::load(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => StagecastConfig::default(),
            };

            if let Some(url) = &self.publish_url {
                config.apply_publish_url(url)?;
            }
            if let Some(url) = &self.signal_url {
                config.signaling.primary_url = url.clone();
            }
            if let Some(stream_id) = &self.stream_id {
                config.signaling.stream_id = stream_id.clone();
            }
            if !self.ice_servers.is_empty() {
                config.ice_servers = self
                    .ice_servers
                    .iter()
                    .map(|url| IceServerConfig {
                        urls: vec![url.trim().to_string()],
                        username: None,
                        credential: None,
                    })
                    .collect();
            }
            if let Some(threshold) = self.vad_threshold {
                config.audio.vad_threshold = threshold;
            }
            if let Some(interval) = self.sample_interval_ms {
                config.audio.sample_interval_ms = interval;
            }
            if let Some(fps) = self.fps {
                config.video.fps = fps;
            }
            if let Some(width) = self.width {
                config.video.width = width;
            }
            if let Some(height) = self.height {
                config.video.height = height;
            }
            if let Some(bitrate) = self.bitrate_kbps {
                config.video.bitrate_kbps = bitrate;
            }
            if self.no_degraded {
                config.signaling.allow_degraded_answer = false;
            }

            config.validate()?;
            Ok(config)
        }

        /// Host devices to open, or `None` when the host slot stays a
        /// placeholder.
        fn media_request(&self, config: &StagecastConfig) -> Option<MediaRequest> {
            let request = MediaRequest {
                device_id: self.camera_device.clone(),
                width: config.video.width,
                height: config.video.height,
                video: self.camera || self.camera_device.is_some(),
                audio: !self.no_mic,
            };
            (request.video || request.audio).then_some(request)
        }
    }

    pub async fn run(args: Args) -> Result<()> {
        let config = args.build_config()?;
        info!(
            "stagecast: {}x{}@{} fps, publish {} (stream '{}')",
            config.video.width,
            config.video.height,
            config.video.fps,
            config.signaling.secondary_url,
            config.signaling.stream_id
        );

        let media_request = args.media_request(&config);
        let session = Arc::new(Session::new(config));
        if let Some(request) = media_request {
            // The studio runs without host media when devices are missing.
            if let Err(e) = session.acquire_host_media(&DeviceCapture::new(), &request).await {
                warn!("host media unavailable: {}", e);
                println!("{e}");
            }
        }
        session.select_layout(args.layout);
        if env_bool("STAGECAST_AUTO_SPOTLIGHT", false) {
            session.set_auto_spotlight(true);
        }
        let manager = Arc::new(ConnectionManager::from_session(session.clone())?);

        let cancel = CancellationToken::new();
        let mut compositor = Compositor::new(session.output().clone());
        let render = tokio::spawn({
            let session = session.clone();
            let cancel = cancel.child_token();
            async move { compositor.run(session, cancel).await }
        });
        let sampling = tokio::spawn(speaker::run(session.clone(), cancel.child_token()));

        if args.start {
            console::execute(&manager, Command::Start).await;
        }

        println!("{}", console::HELP);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            match Command::parse(&line) {
                Ok(Some(command)) => {
                    if !console::execute(&manager, command).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => println!("{e}"),
            }
        }

        cancel.cancel();
        manager.shutdown().await;
        if let Err(e) = render.await {
            warn!("render loop ended abnormally: {}", e);
        }
        if let Err(e) = sampling.await {
            warn!("sampling loop ended abnormally: {}", e);
        }
        info!("stagecast: stopped");
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn args(extra: &[&str]) -> Args {
            Args::try_parse_from(std::iter::once("stagecast").chain(extra.iter().copied())).unwrap()
        }

        #[test]
        fn test_publish_url_overrides_signaling() {
            let config = args(&["--publish-url", "rtc://media.example.com:2000/live/show", "--fps", "25"])
                .build_config()
                .unwrap();
            assert_eq!(
                config.signaling.secondary_url,
                "http://media.example.com:2000/rtc/v1/publish/"
            );
            assert_eq!(config.signaling.stream_id, "live/show");
            assert_eq!(config.video.fps, 25);
        }

        #[test]
        fn test_invalid_override_is_rejected() {
            assert!(args(&["--publish-url", "ftp://nowhere"]).build_config().is_err());
            assert!(args(&["--sample-interval-ms", "0"]).build_config().is_err());
        }

        #[test]
        fn test_media_request_from_flags() {
            let config = StagecastConfig::default();
            assert!(args(&["--no-mic"]).media_request(&config).is_none());

            let request = args(&["--camera-device", "2"]).media_request(&config).unwrap();
            assert!(request.video);
            assert!(request.audio);
            assert_eq!(request.device_id.as_deref(), Some("2"));
            assert_eq!((request.width, request.height), (1280, 720));
        }
    }
}

fn main() -> anyhow::Result<()> {
    use clap::Parser;

    stagecast_common::init_tracing();
    let args = host::Args::parse();
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(host::run(args))
}
