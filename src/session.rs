use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use strum_macros::Display;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::{
    config::WebRtcTransportConfig,
    engine::{ConsumerHandle, MediaEngine, ProducerHandle, TransportHandle},
    error::{Error, SessionErrorKind},
    registry::Registry,
    rtp_parameters::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportParameters},
    signaling::message::{ConsumeReply, ServerMessage, TransportPurpose},
};

/// Role a transport plays for its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransportRole {
    Send,
    Recv,
}

/// What the peer intends to do in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RoleIntent {
    Send,
    Receive,
    Both,
}

/// Result of [`PeerSession::create_transport`]. `role` is `None` when the transport duplicates a role the session
/// already holds: it is tracked, but the designated transport stays in place.
#[derive(Debug, Clone)]
pub struct CreatedTransport {
    pub parameters: TransportParameters,
    pub role: Option<TransportRole>,
}

/// Role for a new transport given the declared purpose and the transports already designated.
pub fn assign_role(
    purpose: Option<TransportPurpose>,
    has_send: bool,
    has_recv: bool,
) -> Option<TransportRole> {
    match purpose {
        Some(TransportPurpose::Send) => (!has_send).then_some(TransportRole::Send),
        Some(TransportPurpose::Recv) => (!has_recv).then_some(TransportRole::Recv),
        None if !has_send => Some(TransportRole::Send),
        None if !has_recv => Some(TransportRole::Recv),
        None => None,
    }
}

#[derive(Debug)]
struct TransportEntry {
    handle: Arc<dyn TransportHandle>,
    connected: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    transports: HashMap<String, TransportEntry>,
    send_transport_id: Option<String>,
    recv_transport_id: Option<String>,
    role_intent: Option<RoleIntent>,
    producers: HashMap<String, Arc<dyn ProducerHandle>>,
    consumers: HashMap<String, Arc<dyn ConsumerHandle>>,
    consumed_producer_ids: HashSet<String>,
}

impl SessionState {
    fn designate(&mut self, role: TransportRole, transport_id: String) {
        match role {
            TransportRole::Send => self.send_transport_id = Some(transport_id),
            TransportRole::Recv => self.recv_transport_id = Some(transport_id),
        }
        self.role_intent = match (self.send_transport_id.is_some(), self.recv_transport_id.is_some()) {
            (true, true) => Some(RoleIntent::Both),
            _ => self.role_intent.or(Some(match role {
                TransportRole::Send => RoleIntent::Send,
                TransportRole::Recv => RoleIntent::Receive,
            })),
        };
    }
}

/// PeerSession is the server-side state of one connected peer: its transports, producers and consumers.
///
/// Operations of one session are expected to be called sequentially. [`PeerSession::close`] may run at any time;
/// results of engine calls that complete after it are closed and discarded.
#[derive(Debug)]
pub struct PeerSession {
    pub id: String,
    engine: Arc<dyn MediaEngine>,
    registry: Arc<Registry>,
    transport_config: WebRtcTransportConfig,
    closed: AtomicBool,
    state: Mutex<SessionState>,
}

impl PeerSession {
    /// Creates a session with a fresh id and registers it. `notifier` receives `newProducer` notifications.
    pub async fn open(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<Registry>,
        transport_config: WebRtcTransportConfig,
        notifier: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        registry.register(id.clone(), notifier).await;
        tracing::info!("[{}] Peer session is opened", id);

        Arc::new(Self {
            id,
            engine,
            registry,
            transport_config,
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn routing_capabilities(&self) -> RtpCapabilities {
        self.engine.routing_capabilities()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> Error {
        Error::new_session(
            format!("Session {} is closed", self.id),
            SessionErrorKind::SessionClosed,
        )
    }

    /// Creates a transport and binds it to a role, see [`assign_role`].
    pub async fn create_transport(
        &self,
        purpose: Option<TransportPurpose>,
    ) -> Result<CreatedTransport, Error> {
        self.ensure_open()?;
        let transport = self.engine.create_transport(&self.transport_config).await?;
        let transport_id = transport.id();

        let role = {
            let mut state = self.state.lock().await;
            if self.is_closed() {
                None
            } else {
                let role = assign_role(
                    purpose,
                    state.send_transport_id.is_some(),
                    state.recv_transport_id.is_some(),
                );
                state.transports.insert(
                    transport_id.clone(),
                    TransportEntry {
                        handle: transport.clone(),
                        connected: false,
                    },
                );
                if let Some(role) = role {
                    state.designate(role, transport_id.clone());
                }
                Some(role)
            }
        };

        let Some(role) = role else {
            tracing::debug!("[{}] Discarding transport {} created after close", self.id, transport_id);
            if let Err(err) = transport.close().await {
                tracing::error!("[{}] Failed to close transport {}: {}", self.id, transport_id, err);
            }
            return Err(self.closed_error());
        };

        match role {
            Some(role) => tracing::info!("[{}] Created {} transport: {}", self.id, role, transport_id),
            None => tracing::warn!(
                "[{}] Created transport {} for a role already held (purpose {:?}), it is not promoted",
                self.id,
                transport_id,
                purpose
            ),
        }

        Ok(CreatedTransport {
            parameters: transport.parameters(),
            role,
        })
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let transport = {
            let state = self.state.lock().await;
            let entry = state.transports.get(transport_id).ok_or_else(|| {
                Error::new_session(
                    format!("Transport {} is not found", transport_id),
                    SessionErrorKind::UnknownTransport,
                )
            })?;
            if entry.connected {
                return Err(Error::new_session(
                    format!("Transport {} is already connected", transport_id),
                    SessionErrorKind::AlreadyConnected,
                ));
            }
            entry.handle.clone()
        };

        transport.connect(dtls_parameters).await?;

        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Some(entry) = state.transports.get_mut(transport_id) {
            entry.connected = true;
        }
        tracing::info!("[{}] Transport connected: {}", self.id, transport_id);
        Ok(())
    }

    /// Creates a producer on the send transport and announces it to every other session. Returns the producer id.
    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, Error> {
        self.ensure_open()?;
        let transport = {
            let state = self.state.lock().await;
            state
                .transports
                .get(transport_id)
                .filter(|_| state.send_transport_id.as_deref() == Some(transport_id))
                .map(|entry| entry.handle.clone())
                .ok_or_else(|| {
                    Error::new_session(
                        format!("Send transport {} is not found", transport_id),
                        SessionErrorKind::UnknownTransport,
                    )
                })?
        };

        tracing::debug!(
            "[{}] Producing {}, codecs: {:?}",
            self.id,
            kind,
            rtp_parameters
                .codecs
                .iter()
                .map(|codec| codec.mime_type.as_str())
                .collect::<Vec<_>>()
        );
        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        let accepted = {
            let mut state = self.state.lock().await;
            if self.is_closed() {
                false
            } else {
                state.producers.insert(producer_id.clone(), producer.clone());
                true
            }
        };
        if !accepted {
            tracing::debug!("[{}] Discarding producer {} created after close", self.id, producer_id);
            if let Err(err) = producer.close().await {
                tracing::error!("[{}] Failed to close producer {}: {}", self.id, producer_id, err);
            }
            return Err(self.closed_error());
        }

        tracing::info!("[{}] Produced {}: {}", self.id, kind, producer_id);
        let notified = self.registry.notify_new_producer(&self.id, &producer_id).await;
        tracing::debug!("[{}] Producer {} announced to {} peers", self.id, producer_id, notified);

        Ok(producer_id)
    }

    /// Creates a consumer of a remote producer on the receive transport.
    pub async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumeReply, Error> {
        self.ensure_open()?;
        let transport = {
            let state = self.state.lock().await;
            let transport = state
                .recv_transport_id
                .as_ref()
                .and_then(|id| state.transports.get(id))
                .map(|entry| entry.handle.clone())
                .ok_or_else(|| {
                    Error::new_session(
                        "No receive transport".to_owned(),
                        SessionErrorKind::NoReceiveTransport,
                    )
                })?;
            if state.consumed_producer_ids.contains(producer_id) {
                return Err(Error::new_session(
                    format!("Producer {} is already consumed", producer_id),
                    SessionErrorKind::AlreadyConsuming,
                ));
            }
            transport
        };

        if !self.engine.can_consume(producer_id, rtp_capabilities) {
            return Err(Error::new_session(
                format!("Cannot consume producer {}", producer_id),
                SessionErrorKind::IncompatibleCapabilities,
            ));
        }

        tracing::debug!("[{}] Creating consumer on transport: {}", self.id, transport.id());
        let consumer = transport.consume(producer_id, rtp_capabilities).await?;
        let consumer_id = consumer.id();

        let accepted = {
            let mut state = self.state.lock().await;
            if self.is_closed() {
                false
            } else {
                state.consumed_producer_ids.insert(producer_id.to_owned());
                state.consumers.insert(consumer_id.clone(), consumer.clone());
                true
            }
        };
        if !accepted {
            tracing::debug!("[{}] Discarding consumer {} created after close", self.id, consumer_id);
            if let Err(err) = consumer.close().await {
                tracing::error!("[{}] Failed to close consumer {}: {}", self.id, consumer_id, err);
            }
            return Err(self.closed_error());
        }

        tracing::info!("[{}] Consumer created: {} {}", self.id, consumer_id, consumer.kind());
        Ok(ConsumeReply {
            id: consumer_id,
            producer_id: producer_id.to_owned(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Unregisters the session, then closes its producers, consumers and transports in that order. Only the first
    /// call does anything. Engine errors are logged.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.unregister(&self.id).await;

        let (producers, consumers, transports) = {
            let mut state = self.state.lock().await;
            state.send_transport_id = None;
            state.recv_transport_id = None;
            state.consumed_producer_ids.clear();
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.transports),
            )
        };

        for (id, producer) in producers {
            tracing::debug!("[{}] Closing producer: {}", self.id, id);
            if let Err(err) = producer.close().await {
                tracing::error!("[{}] Failed to close producer {}: {}", self.id, id, err);
            }
        }
        for (id, consumer) in consumers {
            tracing::debug!("[{}] Closing consumer: {}", self.id, id);
            if let Err(err) = consumer.close().await {
                tracing::error!("[{}] Failed to close consumer {}: {}", self.id, id, err);
            }
        }
        for (id, entry) in transports {
            tracing::debug!("[{}] Closing transport: {}", self.id, id);
            if let Err(err) = entry.handle.close().await {
                tracing::error!("[{}] Failed to close transport {}: {}", self.id, id, err);
            }
        }
        tracing::info!("[{}] Peer session is closed", self.id);
    }

    pub async fn send_transport_id(&self) -> Option<String> {
        self.state.lock().await.send_transport_id.clone()
    }

    pub async fn recv_transport_id(&self) -> Option<String> {
        self.state.lock().await.recv_transport_id.clone()
    }

    pub async fn role_intent(&self) -> Option<RoleIntent> {
        self.state.lock().await.role_intent
    }

    pub async fn transport_count(&self) -> usize {
        self.state.lock().await.transports.len()
    }

    pub async fn producer_ids(&self) -> Vec<String> {
        self.state.lock().await.producers.keys().cloned().collect()
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        tracing::debug!("PeerSession {} is dropped", self.id);
    }
}
