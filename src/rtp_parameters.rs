use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;
use webrtc::{ice_transport::ice_parameters::RTCIceParameters, rtp_transceiver::RTCPFeedback};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Detects the kind from a mime type such as `audio/opus`.
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (prefix, _) = mime_type.split_once('/')?;
        prefix.to_ascii_lowercase().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub parameter: String,
}

impl From<RTCPFeedback> for RtcpFeedback {
    fn from(value: RTCPFeedback) -> Self {
        Self {
            typ: value.typ,
            parameter: value.parameter,
        }
    }
}

/// One codec supported by the router or by a peer's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Routing capabilities of the router, or receiving capabilities of a peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

impl RtpCapabilities {
    /// Whether these capabilities contain a codec matching the given mime type and clock rate.
    pub fn supports(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.codecs.iter().any(|codec| {
            codec.mime_type.eq_ignore_ascii_case(mime_type) && codec.clock_rate == clock_rate
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// RTP parameters of a producer or a consumer. Encodings and header extensions are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
    #[serde(default)]
    pub encodings: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

impl From<RTCIceParameters> for IceParameters {
    fn from(value: RTCIceParameters) -> Self {
        Self {
            username_fragment: value.username_fragment,
            password: value.password,
            ice_lite: value.ice_lite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: IceProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    /// A synthetic sha-256 shaped fingerprint: 32 random bytes as colon separated hex. It is not the digest of any
    /// certificate, so it only fits engines which do not run a real DTLS handshake.
    pub fn generate() -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(Uuid::new_v4().as_bytes());
        let value = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<String>>()
            .join(":");
        Self {
            algorithm: "sha-256".to_owned(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything the far side needs to complete negotiation of a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_from_mime_type() {
        assert_eq!(MediaKind::from_mime_type("audio/opus"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_mime_type("Video/VP8"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime_type("application/rtx"), None);
        assert_eq!(MediaKind::from_mime_type("opus"), None);
    }

    #[test]
    fn test_parse_client_rtp_parameters() {
        // Shape sent by mediasoup-client for an opus track.
        let json = r#"{
            "mid": "0",
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": {"minptime": 10, "useinbandfec": 1},
                "rtcpFeedback": [{"type": "transport-cc", "parameter": ""}]
            }],
            "headerExtensions": [{"uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "id": 1}],
            "encodings": [{"ssrc": 1111, "dtx": false}],
            "rtcp": {"cname": "abc", "reducedSize": true}
        }"#;
        let parameters: RtpParameters = serde_json::from_str(json).unwrap();
        assert_eq!(parameters.mid.as_deref(), Some("0"));
        assert_eq!(parameters.codecs.len(), 1);
        assert_eq!(parameters.codecs[0].payload_type, 100);
        assert_eq!(parameters.codecs[0].rtcp_feedback[0].typ, "transport-cc");
        assert_eq!(parameters.encodings.len(), 1);
    }

    #[test]
    fn test_supports_is_case_insensitive() {
        let capabilities = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_owned(),
                preferred_payload_type: Some(101),
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
        };
        assert!(capabilities.supports("video/vp8", 90000));
        assert!(!capabilities.supports("video/vp8", 48000));
        assert!(!capabilities.supports("video/H264", 90000));
    }

    #[test]
    fn test_dtls_parameters_wire_format() {
        let parameters = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_owned(),
                value: "AB:CD".to_owned(),
            }],
        };
        let value = serde_json::to_value(&parameters).unwrap();
        assert_eq!(value["role"], "client");
        assert_eq!(value["fingerprints"][0]["algorithm"], "sha-256");

        let without_role: DtlsParameters =
            serde_json::from_str(r#"{"fingerprints": []}"#).unwrap();
        assert_eq!(without_role.role, DtlsRole::Auto);
    }

    #[test]
    fn test_generated_fingerprint_shape() {
        let fingerprint = DtlsFingerprint::generate();
        assert_eq!(fingerprint.algorithm, "sha-256");
        let bytes: Vec<&str> = fingerprint.value.split(':').collect();
        assert_eq!(bytes.len(), 32);
        assert!(bytes
            .iter()
            .all(|b| b.len() == 2 && u8::from_str_radix(b, 16).is_ok()));
        assert_ne!(DtlsFingerprint::generate(), fingerprint);
    }
}
