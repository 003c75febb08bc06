use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    error::{ClientErrorKind, Error},
    rtp_parameters::{
        DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities, RtpCodecParameters,
        RtpParameters, TransportParameters,
    },
    session::TransportRole,
    signaling::message::ConsumeReply,
};

/// A track captured on the peer, ready to be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// A track received from a remote producer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Peer-side WebRTC stack.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Loads the routing capabilities pushed by the server.
    async fn load(&self, routing_capabilities: RtpCapabilities) -> Result<(), Error>;

    /// Capabilities of this device, once loaded.
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    /// Sets up the local side of a transport created by the server and returns the DTLS parameters to connect it.
    async fn create_transport(
        &self,
        role: TransportRole,
        parameters: &TransportParameters,
    ) -> Result<DtlsParameters, Error>;

    fn produce_parameters(&self, track: &LocalTrack) -> Result<RtpParameters, Error>;

    /// Instantiates the local consumer described by a `consume` reply.
    async fn consume(&self, reply: &ConsumeReply) -> Result<RemoteTrack, Error>;
}

/// Where local media comes from.
#[async_trait]
pub trait MediaSource: Send + Sync + Debug {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, Error>;
}

/// Where remote media goes.
pub trait RenderTarget: Send + Sync + Debug {
    fn attach(&self, track: RemoteTrack);
}

/// Device which keeps the negotiated state in memory and produces with the first router codec of each kind.
#[derive(Debug, Default)]
pub struct BasicDevice {
    capabilities: Mutex<Option<RtpCapabilities>>,
    next_mid: AtomicU32,
}

impl BasicDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn loaded(&self) -> Result<RtpCapabilities, Error> {
        self.rtp_capabilities().ok_or_else(|| {
            Error::new_client(
                "Device is not loaded".to_owned(),
                ClientErrorKind::DeviceNotLoaded,
            )
        })
    }
}

#[async_trait]
impl Device for BasicDevice {
    async fn load(&self, routing_capabilities: RtpCapabilities) -> Result<(), Error> {
        let mut capabilities = self
            .capabilities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(
            "Device is loaded with {} codecs",
            routing_capabilities.codecs.len()
        );
        *capabilities = Some(routing_capabilities);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.capabilities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn create_transport(
        &self,
        role: TransportRole,
        parameters: &TransportParameters,
    ) -> Result<DtlsParameters, Error> {
        self.loaded()?;
        tracing::debug!("Device {} transport {} is created", role, parameters.id);
        Ok(DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint::generate()],
        })
    }

    fn produce_parameters(&self, track: &LocalTrack) -> Result<RtpParameters, Error> {
        let capabilities = self.loaded()?;
        let codec = capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == track.kind)
            .ok_or_else(|| {
                Error::new_client(
                    format!("No {} codec in routing capabilities", track.kind),
                    ClientErrorKind::NoMatchingCodec,
                )
            })?;

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        Ok(RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(100),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            ..Default::default()
        })
    }

    async fn consume(&self, reply: &ConsumeReply) -> Result<RemoteTrack, Error> {
        Ok(RemoteTrack {
            consumer_id: reply.id.clone(),
            producer_id: reply.producer_id.clone(),
            kind: reply.kind,
            rtp_parameters: reply.rtp_parameters.clone(),
        })
    }
}
