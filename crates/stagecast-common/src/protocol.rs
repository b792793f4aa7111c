use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Envelope exchanged over the persistent (direct) signaling channel.
///
/// Every message is self-contained: `{"type": "offer", "sdp": "..."}`,
/// `{"type": "answer", "sdp": "..."}` or
/// `{"type": "ice-candidate", "candidate": {...}}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalEnvelope {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidatePayload },
}

impl SignalEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("malformed signaling envelope: {e}")))
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Which signaling transport carried a negotiation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Persistent bidirectional channel (WebSocket).
    DirectChannel,
    /// Single request/response exchange (HTTP).
    RequestResponse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectChannel => "direct-channel",
            Self::RequestResponse => "request-response",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of the secondary (request/response) publish exchange.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    /// Endpoint the request was posted to, echoed for SRS-style servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streamurl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
}

impl PublishRequest {
    pub fn offer(sdp: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "offer".to_string(),
            stream_id: stream_id.into(),
            api: None,
            streamurl: None,
            tid: None,
        }
    }
}

/// Response of the secondary exchange. Media servers in the SRS family add a
/// numeric `code` (0 = success) and a `msg`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PublishResponse {
    #[serde(default)]
    pub sdp: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl PublishResponse {
    /// Extract the remote answer, rejecting error codes and empty bodies.
    pub fn into_answer_sdp(self) -> Result<String> {
        if let Some(code) = self.code.filter(|c| *c != 0) {
            return Err(Error::protocol(format!(
                "server rejected offer (code {code}): {}",
                self.msg.as_deref().unwrap_or("unknown error")
            )));
        }
        match self.sdp {
            Some(sdp) if !sdp.trim().is_empty() => Ok(sdp),
            _ => Err(Error::protocol("response carried no answer sdp")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let offer = SignalEnvelope::Offer {
            sdp: "v=0\r\n".into(),
        };
        let json = offer.to_json().unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0\r\n"}"#);

        let text = r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        match SignalEnvelope::from_json(text).unwrap() {
            SignalEnvelope::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_unknown_envelope_is_protocol_error() {
        let err = SignalEnvelope::from_json(r#"{"type":"bye"}"#).unwrap_err();
        assert!(matches!(err, Error::NegotiationProtocol(_)));
    }

    #[test]
    fn test_publish_request_field_names() {
        let req = PublishRequest::offer("v=0", "live/studio");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["streamId"], "live/studio");
        assert!(value.get("tid").is_none());
    }

    #[test]
    fn test_publish_response_codes() {
        let ok: PublishResponse = serde_json::from_str(r#"{"sdp":"v=0"}"#).unwrap();
        assert_eq!(ok.into_answer_sdp().unwrap(), "v=0");

        let srs_ok: PublishResponse =
            serde_json::from_str(r#"{"code":0,"sdp":"v=0"}"#).unwrap();
        assert!(srs_ok.into_answer_sdp().is_ok());

        let rejected: PublishResponse =
            serde_json::from_str(r#"{"code":400,"msg":"stream busy"}"#).unwrap();
        let err = rejected.into_answer_sdp().unwrap_err();
        assert!(err.to_string().contains("stream busy"));

        let empty = PublishResponse::default();
        assert!(empty.into_answer_sdp().is_err());
    }
}
