use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::WebRtcTransportConfig,
    error::Error,
    rtp_parameters::{
        DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
        TransportParameters,
    },
};

/// In-process engine that negotiates but forwards no media.
pub mod local;

pub type OnDiedFn = Box<dyn Fn(String) + Send + Sync>;

/// Binding to the media engine which owns the router, transports, producers and consumers.
#[async_trait]
pub trait MediaEngine: Send + Sync + Debug {
    /// Codecs and parameters supported by the router.
    fn routing_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> Result<Arc<dyn TransportHandle>, Error>;

    /// Whether a peer with `rtp_capabilities` is able to receive the producer.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Set callback function called when the engine fails unrecoverably.
    async fn on_died(&self, f: OnDiedFn);
}

#[async_trait]
pub trait TransportHandle: Send + Sync + Debug {
    fn id(&self) -> String;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), Error>;
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>, Error>;
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn ConsumerHandle>, Error>;
    async fn close(&self) -> Result<(), Error>;

    /// Connection parameters for the far side.
    fn parameters(&self) -> TransportParameters {
        TransportParameters {
            id: self.id(),
            ice_parameters: self.ice_parameters(),
            ice_candidates: self.ice_candidates(),
            dtls_parameters: self.dtls_parameters(),
        }
    }
}

#[async_trait]
pub trait ProducerHandle: Send + Sync + Debug {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync + Debug {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn close(&self) -> Result<(), Error>;
}
