use std::net::{IpAddr, Ipv4Addr};

use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, RTCPFeedback},
};

use crate::rtp_parameters::{MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability};

/// First payload type handed out to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Codecs the router accepts. Peers receive them as the routing capabilities.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub codecs: Vec<RTCRtpCodecCapability>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            codecs: vec![
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![],
                },
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "nack".to_owned(),
                            parameter: "".to_owned(),
                        },
                        RTCPFeedback {
                            typ: "nack".to_owned(),
                            parameter: "pli".to_owned(),
                        },
                        RTCPFeedback {
                            typ: "goog-remb".to_owned(),
                            parameter: "".to_owned(),
                        },
                    ],
                },
            ],
        }
    }
}

impl MediaConfig {
    /// Builds the routing capabilities advertised to peers. Codecs whose mime type is neither audio nor video are skipped.
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        let codecs = self
            .codecs
            .iter()
            .filter_map(|codec| MediaKind::from_mime_type(&codec.mime_type).map(|kind| (kind, codec)))
            .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..)
            .map(|((kind, codec), payload_type)| RtpCodecCapability {
                kind,
                mime_type: codec.mime_type.clone(),
                preferred_payload_type: Some(payload_type),
                clock_rate: codec.clock_rate,
                channels: if codec.channels > 0 {
                    Some(codec.channels)
                } else {
                    None
                },
                parameters: serde_json::Map::new(),
                rtcp_feedback: codec
                    .rtcp_feedback
                    .iter()
                    .cloned()
                    .map(RtcpFeedback::from)
                    .collect(),
            })
            .collect();

        RtpCapabilities {
            codecs,
            header_extensions: vec![],
        }
    }
}

/// Address a transport listens on, and the address announced to peers in ICE candidates.
#[derive(Debug, Clone)]
pub struct ListenIp {
    pub ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 20000,
            max: 20200,
        }
    }
}

/// Configuration passed to the media engine for every WebRTC transport.
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub port_range: Option<PortRange>,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            listen_ips: vec![ListenIp {
                ip: localhost,
                announced_ip: Some(localhost),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            port_range: Some(PortRange::default()),
        }
    }
}
