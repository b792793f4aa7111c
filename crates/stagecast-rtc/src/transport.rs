//! Signaling transports.
//!
//! The primary transport is a persistent WebSocket carrying
//! [`SignalEnvelope`] JSON messages in both directions. The secondary
//! transport is a single HTTP request/response publish exchange.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use stagecast_common::{Error, PublishRequest, PublishResponse, Result, SignalEnvelope};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, warn};
use url::Url;

const CHANNEL_DEPTH: usize = 32;

/// An open primary channel. Reading and writing run on background tasks;
/// the channel is closed when `recv` yields `None`.
pub struct PrimaryChannel {
    outgoing: mpsc::Sender<SignalEnvelope>,
    incoming: mpsc::Receiver<SignalEnvelope>,
}

/// Far side of an in-process channel created with [`PrimaryChannel::pair`].
pub struct ChannelPeer {
    /// Envelopes sent by the local side.
    pub received: mpsc::Receiver<SignalEnvelope>,
    /// Envelopes delivered to the local side.
    pub sender: mpsc::Sender<SignalEnvelope>,
}

impl PrimaryChannel {
    pub fn new(
        outgoing: mpsc::Sender<SignalEnvelope>,
        incoming: mpsc::Receiver<SignalEnvelope>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// In-process channel pair, used by loopback setups and tests.
    pub fn pair() -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self::new(out_tx, in_rx),
            ChannelPeer {
                received: out_rx,
                sender: in_tx,
            },
        )
    }

    pub async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.outgoing
            .send(envelope)
            .await
            .map_err(|_| Error::transport("primary channel closed"))
    }

    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.incoming.recv().await
    }
}

#[async_trait]
pub trait PrimaryConnector: Send + Sync {
    async fn connect(&self, stream_id: &str) -> Result<PrimaryChannel>;
}

#[async_trait]
pub trait SecondaryExchange: Send + Sync {
    /// Unreachable servers and non-2xx replies are `Error::Transport`; an
    /// unparsable body is `Error::NegotiationProtocol`.
    async fn exchange(&self, request: &PublishRequest) -> Result<PublishResponse>;

    fn endpoint(&self) -> &str;
}

/// `{primary_url}?stream={stream_id}`
pub fn channel_url(base: &str, stream_id: &str) -> Result<String> {
    let mut url = Url::parse(base).map_err(|e| Error::config(format!("{base}: {e}")))?;
    url.query_pairs_mut().append_pair("stream", stream_id);
    Ok(url.into())
}

pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PrimaryConnector for WsConnector {
    async fn connect(&self, stream_id: &str) -> Result<PrimaryChannel> {
        let url = channel_url(&self.base_url, stream_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::transport(format!("{url}: {e}")))?;
        debug!("primary channel open: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SignalEnvelope>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<SignalEnvelope>(CHANNEL_DEPTH);

        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} envelope: {}", envelope.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("Failed to send signaling message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let envelope = match SignalEnvelope::from_json(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("Failed to parse signaling message: {}", e);
                                continue;
                            }
                        };
                        if in_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        warn!("Signaling WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            debug!("primary channel reader finished");
        });

        Ok(PrimaryChannel::new(out_tx, in_rx))
    }
}

pub struct HttpExchange {
    client: reqwest::Client,
    url: String,
}

impl HttpExchange {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::transport(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SecondaryExchange for HttpExchange {
    async fn exchange(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::transport(format!("POST {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(format!(
                "POST {} returned {}",
                self.url, status
            )));
        }
        response
            .json::<PublishResponse>()
            .await
            .map_err(|e| Error::protocol(format!("invalid publish response: {e}")))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_url_appends_stream() {
        assert_eq!(
            channel_url("ws://127.0.0.1:8443/signal", "live/studio").unwrap(),
            "ws://127.0.0.1:8443/signal?stream=live%2Fstudio"
        );
        assert!(channel_url("not a url", "x").is_err());
    }

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (mut local, mut remote) = PrimaryChannel::pair();
        local
            .send(SignalEnvelope::Offer { sdp: "v=0".into() })
            .await
            .unwrap();
        assert_eq!(
            remote.received.recv().await,
            Some(SignalEnvelope::Offer { sdp: "v=0".into() })
        );

        remote
            .sender
            .send(SignalEnvelope::Answer { sdp: "v=1".into() })
            .await
            .unwrap();
        assert_eq!(
            local.recv().await,
            Some(SignalEnvelope::Answer { sdp: "v=1".into() })
        );

        drop(remote);
        assert_eq!(local.recv().await, None);
        assert!(local.send(SignalEnvelope::Offer { sdp: String::new() }).await.is_err());
    }
}
