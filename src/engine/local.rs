use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, MutexGuard,
    },
};

use async_trait::async_trait;
use derivative::Derivative;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::ice_transport::ice_parameters::RTCIceParameters;
use webrtc_ice::rand::{generate_pwd, generate_ufrag};

use crate::{
    config::{MediaConfig, PortRange, WebRtcTransportConfig},
    error::{EngineErrorKind, Error},
    rtp_parameters::{
        DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, IceProtocol,
        MediaKind, RtpCapabilities, RtpParameters,
    },
};

use super::{ConsumerHandle, MediaEngine, OnDiedFn, ProducerHandle, TransportHandle};

const PREFERRED_PRIORITY: u32 = 1_076_302_079;
const FALLBACK_PRIORITY: u32 = 1_076_276_479;

type ProducerTable = Arc<std::sync::Mutex<HashMap<String, ProducerRecord>>>;

#[derive(Debug, Clone)]
struct ProducerRecord {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

fn lock_table(table: &ProducerTable) -> MutexGuard<'_, HashMap<String, ProducerRecord>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Media engine living inside this process. It allocates ids and ICE/DTLS material, keeps track of producers and
/// checks codec compatibility, but never opens a socket.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LocalEngine {
    capabilities: RtpCapabilities,
    producers: ProducerTable,
    port_counter: AtomicU32,
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_died_fn: Arc<Mutex<OnDiedFn>>,
}

impl LocalEngine {
    pub fn new(media_config: MediaConfig) -> Arc<Self> {
        let engine = Self {
            capabilities: media_config.rtp_capabilities(),
            producers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            port_counter: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            on_died_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
        };
        tracing::debug!("LocalEngine is created");
        Arc::new(engine)
    }

    /// Number of producers currently alive in the engine.
    pub fn producer_count(&self) -> usize {
        lock_table(&self.producers).len()
    }

    /// Stops the engine. Transports can no longer be created and the died callback fires.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("LocalEngine is closed: {}", reason);
        let callback = self.on_died_fn.lock().await;
        (callback)(reason.to_owned());
    }

    fn allocate_port(&self, range: Option<PortRange>) -> u16 {
        let range = range.unwrap_or_default();
        let width = u32::from(range.max.saturating_sub(range.min)) + 1;
        let offset = self.port_counter.fetch_add(1, Ordering::Relaxed) % width;
        // offset < width, so the sum never exceeds range.max.
        range.min + offset as u16
    }

    fn ice_candidates(config: &WebRtcTransportConfig, port: u16) -> Vec<IceCandidate> {
        let (udp_priority, tcp_priority) = if config.prefer_udp {
            (PREFERRED_PRIORITY, FALLBACK_PRIORITY)
        } else {
            (FALLBACK_PRIORITY, PREFERRED_PRIORITY)
        };

        let mut candidates = vec![];
        for (index, listen_ip) in config.listen_ips.iter().enumerate() {
            let ip = listen_ip.announced_ip.unwrap_or(listen_ip.ip).to_string();
            let index = index as u32;
            if config.enable_udp {
                candidates.push(IceCandidate {
                    foundation: format!("udpcandidate{}", index),
                    priority: udp_priority - index,
                    ip: ip.clone(),
                    protocol: IceProtocol::Udp,
                    port,
                    typ: "host".to_owned(),
                    tcp_type: None,
                });
            }
            if config.enable_tcp {
                candidates.push(IceCandidate {
                    foundation: format!("tcpcandidate{}", index),
                    priority: tcp_priority - index,
                    ip,
                    protocol: IceProtocol::Tcp,
                    port,
                    typ: "host".to_owned(),
                    tcp_type: Some("passive".to_owned()),
                });
            }
        }
        candidates
    }
}

fn is_rtx(mime_type: &str) -> bool {
    mime_type.to_ascii_lowercase().ends_with("/rtx")
}

/// RTP parameters a consumer receives for the given producer, or `None` when no media codec of the producer is
/// supported by `rtp_capabilities`.
fn consumer_rtp_parameters(
    producer: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> Option<RtpParameters> {
    let codecs: Vec<_> = producer
        .codecs
        .iter()
        .filter(|codec| rtp_capabilities.supports(&codec.mime_type, codec.clock_rate))
        .cloned()
        .collect();
    if codecs.iter().all(|codec| is_rtx(&codec.mime_type)) {
        return None;
    }

    let ssrc = Uuid::new_v4().as_u128() as u32;
    Some(RtpParameters {
        mid: None,
        codecs,
        header_extensions: producer.header_extensions.clone(),
        encodings: vec![json!({ "ssrc": ssrc })],
        rtcp: producer.rtcp.clone(),
    })
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn routing_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> Result<Arc<dyn TransportHandle>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new_engine(
                "Media engine is closed".to_owned(),
                EngineErrorKind::EngineUnavailable,
            ));
        }
        if config.listen_ips.is_empty() || !(config.enable_udp || config.enable_tcp) {
            return Err(Error::new_engine(
                "No listen address is configured".to_owned(),
                EngineErrorKind::EngineUnavailable,
            ));
        }

        let port = self.allocate_port(config.port_range);
        let ice_parameters: IceParameters = RTCIceParameters {
            username_fragment: generate_ufrag(),
            password: generate_pwd(),
            ice_lite: true,
        }
        .into();

        let transport = LocalTransport {
            id: Uuid::new_v4().to_string(),
            ice_parameters,
            ice_candidates: Self::ice_candidates(config, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint::generate()],
            },
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            router_capabilities: self.capabilities.clone(),
            producers: self.producers.clone(),
        };
        tracing::debug!("LocalTransport {} is created on port {}", transport.id, port);

        Ok(Arc::new(transport))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = lock_table(&self.producers);
        match producers.get(producer_id) {
            Some(record) => consumer_rtp_parameters(&record.rtp_parameters, rtp_capabilities).is_some(),
            None => false,
        }
    }

    async fn on_died(&self, f: OnDiedFn) {
        let mut callback = self.on_died_fn.lock().await;
        *callback = f;
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    id: String,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    connected: AtomicBool,
    closed: AtomicBool,
    router_capabilities: RtpCapabilities,
    producers: ProducerTable,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new_engine(
                format!("Transport {} is closed", self.id),
                EngineErrorKind::EngineUnavailable,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportHandle for LocalTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new_engine(
                format!("Transport {} is closed", self.id),
                EngineErrorKind::ConnectFailed,
            ));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(Error::new_engine(
                "DTLS parameters have no fingerprint".to_owned(),
                EngineErrorKind::ConnectFailed,
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::new_engine(
                format!("Transport {} is already connected", self.id),
                EngineErrorKind::ConnectFailed,
            ));
        }
        tracing::debug!("LocalTransport {} is connected", self.id);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>, Error> {
        self.ensure_open()?;

        let mut media_codecs = rtp_parameters
            .codecs
            .iter()
            .filter(|codec| !is_rtx(&codec.mime_type))
            .peekable();
        if media_codecs.peek().is_none() {
            return Err(Error::new_engine(
                "RTP parameters have no media codec".to_owned(),
                EngineErrorKind::UnsupportedCodec,
            ));
        }
        for codec in media_codecs {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
                return Err(Error::new_engine(
                    format!("Codec {} does not match kind {}", codec.mime_type, kind),
                    EngineErrorKind::UnsupportedCodec,
                ));
            }
            if !self
                .router_capabilities
                .supports(&codec.mime_type, codec.clock_rate)
            {
                return Err(Error::new_engine(
                    format!("Codec {} is not supported by the router", codec.mime_type),
                    EngineErrorKind::UnsupportedCodec,
                ));
            }
        }

        let id = Uuid::new_v4().to_string();
        lock_table(&self.producers).insert(
            id.clone(),
            ProducerRecord {
                kind,
                rtp_parameters,
            },
        );
        tracing::debug!("LocalProducer {} ({}) is created on {}", id, kind, self.id);

        Ok(Arc::new(LocalProducer {
            id,
            kind,
            producers: self.producers.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn ConsumerHandle>, Error> {
        self.ensure_open()?;

        let record = lock_table(&self.producers)
            .get(producer_id)
            .cloned()
            .ok_or_else(|| {
                Error::new_engine(
                    format!("Producer {} is not found", producer_id),
                    EngineErrorKind::CannotConsume,
                )
            })?;
        let rtp_parameters = consumer_rtp_parameters(&record.rtp_parameters, rtp_capabilities)
            .ok_or_else(|| {
                Error::new_engine(
                    format!("No common codec for producer {}", producer_id),
                    EngineErrorKind::CannotConsume,
                )
            })?;

        let consumer = LocalConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_owned(),
            kind: record.kind,
            rtp_parameters,
        };
        tracing::debug!(
            "LocalConsumer {} is created on {} for producer {}",
            consumer.id,
            self.id,
            producer_id
        );
        Ok(Arc::new(consumer))
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!("LocalTransport {} is closed", self.id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct LocalProducer {
    id: String,
    kind: MediaKind,
    producers: ProducerTable,
}

#[async_trait]
impl ProducerHandle for LocalProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> Result<(), Error> {
        lock_table(&self.producers).remove(&self.id);
        tracing::debug!("LocalProducer {} is closed", self.id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[async_trait]
impl ConsumerHandle for LocalConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn close(&self) -> Result<(), Error> {
        tracing::debug!("LocalConsumer {} is closed", self.id);
        Ok(())
    }
}
