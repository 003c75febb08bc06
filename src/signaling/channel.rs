use std::sync::Arc;

use enclose::enc;
use strum_macros::Display;
use tokio::sync::mpsc;

use crate::{
    config::WebRtcTransportConfig,
    engine::MediaEngine,
    error::{Error, SessionErrorKind},
    registry::Registry,
    session::{CreatedTransport, PeerSession, TransportRole},
};

use super::message::{
    ClientMessage, ConnectTransportReply, Envelope, ProduceReply, Reply, ServerMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChannelState {
    /// Routing capabilities have been sent.
    Connected,
    /// A transport has been requested.
    Negotiating,
    /// A transport is connected, or media flows.
    Active,
    Closed,
}

#[derive(Debug)]
enum Inbound {
    Text(String),
    Message(ClientMessage),
    Close,
}

/// SignalingChannel speaks the `{type, data}` protocol with one peer and drives its [`PeerSession`].
///
/// Every reply and notification goes to `outbound` in the order it was produced, so a peer always sees the reply to
/// a request before anything the request caused.
#[derive(Debug)]
pub struct SignalingChannel {
    session: Arc<PeerSession>,
    registry: Arc<Registry>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: ChannelState,
}

impl SignalingChannel {
    /// Sends the routing capabilities to the peer and registers a new session for it.
    pub async fn open(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<Registry>,
        transport_config: WebRtcTransportConfig,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        // Capabilities go out before registration so they always precede any newProducer.
        if outbound
            .send(ServerMessage::RtpCapabilities(engine.routing_capabilities()))
            .is_err()
        {
            tracing::warn!("Peer went away before receiving routing capabilities");
        }
        let session =
            PeerSession::open(engine, registry.clone(), transport_config, outbound.clone()).await;

        Self {
            session,
            registry,
            outbound,
            state: ChannelState::Connected,
        }
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn send(&self, message: ServerMessage) {
        if let Err(err) = self.outbound.send(message) {
            tracing::debug!("[{}] Failed to send message: {}", self.session.id, err);
        }
    }

    /// Handles one raw text frame. A frame which is not an envelope is dropped, any other invalid frame gets an
    /// error reply under its own type.
    pub async fn handle_text(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("[{}] Dropping frame: {}", self.session.id, err);
                return;
            }
        };
        let typ = envelope.typ.clone();
        match ClientMessage::try_from(envelope) {
            Ok(message) => self.handle(message).await,
            Err(err) => {
                tracing::warn!("[{}] Rejecting {}: {}", self.session.id, typ, err);
                if self.state != ChannelState::Closed {
                    self.send(ServerMessage::rejected(&typ, &err));
                }
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) {
        if self.state == ChannelState::Closed || self.session.is_closed() {
            tracing::debug!(
                "[{}] Ignoring {} on a closed channel",
                self.session.id,
                message.message_type()
            );
            return;
        }
        tracing::debug!("[{}] Received {}", self.session.id, message.message_type());

        match message {
            ClientMessage::CreateWebRtcTransport(request) => {
                if self.state == ChannelState::Connected {
                    self.state = ChannelState::Negotiating;
                }
                let result = self.session.create_transport(request.purpose).await;
                let designated_recv = matches!(
                    result,
                    Ok(CreatedTransport {
                        role: Some(TransportRole::Recv),
                        ..
                    })
                );
                self.send(ServerMessage::CreateWebRtcTransport(Reply::from_result(
                    result.map(|created| created.parameters),
                )));
                if designated_recv {
                    self.send_producer_snapshot().await;
                }
            }
            ClientMessage::ConnectTransport(request) => {
                let result = self
                    .session
                    .connect_transport(&request.transport_id, request.dtls_parameters)
                    .await
                    .map(|()| ConnectTransportReply { connected: true });
                self.activate_on(&result);
                self.send(ServerMessage::ConnectTransport(Reply::from_result(result)));
            }
            ClientMessage::Produce(request) => {
                let result = self
                    .session
                    .produce(&request.transport_id, request.kind, request.rtp_parameters)
                    .await
                    .map(|id| ProduceReply { id });
                self.activate_on(&result);
                self.send(ServerMessage::Produce(Reply::from_result(result)));
            }
            ClientMessage::Consume(request) => {
                let result = self
                    .session
                    .consume(&request.producer_id, &request.rtp_capabilities)
                    .await;
                self.activate_on(&result);
                self.send(ServerMessage::Consume(Reply::from_result(result)));
            }
        }
    }

    fn activate_on<T>(&mut self, result: &Result<T, Error>) {
        match result {
            Ok(_) => self.state = ChannelState::Active,
            Err(err) => tracing::warn!("[{}] Request failed: {}", self.session.id, err),
        }
    }

    /// Announces every producer that already exists in other sessions.
    async fn send_producer_snapshot(&self) {
        let notices = self.registry.snapshot_other_producers(&self.session.id).await;
        tracing::debug!(
            "[{}] Sending {} existing producers",
            self.session.id,
            notices.len()
        );
        for notice in notices {
            self.send(ServerMessage::NewProducer(notice));
        }
    }

    pub async fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.session.close().await;
    }

    /// Moves the channel onto its own task. Inbound frames are handled one at a time in arrival order.
    pub fn spawn(mut self) -> ChannelHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let session = self.session.clone();

        tokio::spawn(enc!((session) async move {
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Text(text) => self.handle_text(&text).await,
                    Inbound::Message(message) => self.handle(message).await,
                    Inbound::Close => break,
                }
            }
            self.close().await;
            tracing::debug!("[{}] Signaling channel finished", session.id);
        }));

        ChannelHandle {
            session,
            inbound: tx,
        }
    }
}

/// Handle to a spawned [`SignalingChannel`]. The channel closes when [`ChannelHandle::close`] is called or every
/// handle has been dropped.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    session: Arc<PeerSession>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl ChannelHandle {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn send_text(&self, text: String) -> Result<(), Error> {
        self.push(Inbound::Text(text))
    }

    pub fn send_message(&self, message: ClientMessage) -> Result<(), Error> {
        self.push(Inbound::Message(message))
    }

    fn push(&self, inbound: Inbound) -> Result<(), Error> {
        self.inbound.send(inbound).map_err(|_| {
            Error::new_session(
                format!("Signaling channel of {} is closed", self.session.id),
                SessionErrorKind::SessionClosed,
            )
        })
    }

    /// Tears the session down right away, even while a request is still being handled.
    pub async fn close(&self) {
        self.session.close().await;
        if self.inbound.send(Inbound::Close).is_err() {
            tracing::debug!("[{}] Signaling channel runner is already stopped", self.session.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MediaConfig,
        engine::local::{tests::opus_parameters, LocalEngine},
        rtp_parameters::MediaKind,
        signaling::message::{
            ConsumeRequest, CreateTransportRequest, ProduceRequest, TransportPurpose,
        },
    };

    struct Peer {
        channel: SignalingChannel,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Peer {
        async fn open(engine: Arc<LocalEngine>, registry: Arc<Registry>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let channel =
                SignalingChannel::open(engine, registry, WebRtcTransportConfig::default(), tx).await;
            Self { channel, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = vec![];
            while let Ok(message) = self.rx.try_recv() {
                messages.push(message);
            }
            messages
        }

        async fn create_transport(&mut self, purpose: TransportPurpose) -> String {
            self.channel
                .handle(ClientMessage::CreateWebRtcTransport(CreateTransportRequest {
                    purpose: Some(purpose),
                }))
                .await;
            match self.drain().remove(0) {
                ServerMessage::CreateWebRtcTransport(Reply::Ok(parameters)) => parameters.id,
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    fn setup() -> (Arc<LocalEngine>, Arc<Registry>) {
        (
            LocalEngine::new(MediaConfig::default()),
            Arc::new(Registry::new()),
        )
    }

    #[tokio::test]
    async fn test_capabilities_are_sent_first() {
        let (engine, registry) = setup();
        let mut peer = Peer::open(engine.clone(), registry.clone()).await;

        let messages = peer.drain();
        assert_eq!(
            messages,
            vec![ServerMessage::RtpCapabilities(engine.routing_capabilities())]
        );
        assert_eq!(peer.channel.state(), ChannelState::Connected);
        assert!(registry.contains(&peer.channel.session().id).await);
    }

    #[tokio::test]
    async fn test_invalid_frames() {
        let (engine, registry) = setup();
        let mut peer = Peer::open(engine, registry).await;
        peer.drain();

        peer.channel.handle_text("{ not json").await;
        assert!(peer.drain().is_empty());

        peer.channel.handle_text(r#"{"type":"leaveRoom","data":{}}"#).await;
        let envelope = peer.drain()[0].to_envelope().unwrap();
        assert_eq!(envelope.typ, "leaveRoom");
        assert!(envelope.data["error"].is_string());

        peer.channel
            .handle_text(r#"{"type":"produce","data":{"kind":"audio"}}"#)
            .await;
        match &peer.drain()[0] {
            ServerMessage::Produce(Reply::Error { .. }) => {}
            other => panic!("unexpected message {:?}", other),
        }

        peer.channel
            .handle_text(r#"{"type":"connectTransport","data":{"transportId":"nope","dtlsParameters":{"fingerprints":[]}}}"#)
            .await;
        match &peer.drain()[0] {
            ServerMessage::ConnectTransport(Reply::Error { error }) => {
                assert!(error.contains("nope"))
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(peer.channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_recv_transport_receives_snapshot_after_reply() {
        let (engine, registry) = setup();
        let mut alice = Peer::open(engine.clone(), registry.clone()).await;
        alice.drain();

        let send = alice.create_transport(TransportPurpose::Send).await;
        assert_eq!(alice.channel.state(), ChannelState::Negotiating);
        alice
            .channel
            .handle(ClientMessage::Produce(ProduceRequest {
                transport_id: send,
                kind: MediaKind::Audio,
                rtp_parameters: opus_parameters(),
            }))
            .await;
        let producer_id = match alice.drain().remove(0) {
            ServerMessage::Produce(Reply::Ok(reply)) => reply.id,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(alice.channel.state(), ChannelState::Active);

        // Bob joins after the producer exists.
        let mut bob = Peer::open(engine.clone(), registry.clone()).await;
        bob.drain();
        bob.channel
            .handle(ClientMessage::CreateWebRtcTransport(CreateTransportRequest {
                purpose: Some(TransportPurpose::Recv),
            }))
            .await;
        let messages = bob.drain();
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0],
            ServerMessage::CreateWebRtcTransport(Reply::Ok(_))
        ));
        match &messages[1] {
            ServerMessage::NewProducer(notice) => {
                assert_eq!(notice.producer_id, producer_id);
                assert_eq!(notice.socket_id, alice.channel.session().id);
            }
            other => panic!("unexpected message {:?}", other),
        }

        bob.channel
            .handle(ClientMessage::Consume(ConsumeRequest {
                producer_id: producer_id.clone(),
                rtp_capabilities: engine.routing_capabilities(),
            }))
            .await;
        match bob.drain().remove(0) {
            ServerMessage::Consume(Reply::Ok(reply)) => assert_eq!(reply.producer_id, producer_id),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(bob.channel.state(), ChannelState::Active);
    }

    #[tokio::test]
    async fn test_send_transport_gets_no_snapshot() {
        let (engine, registry) = setup();
        let mut alice = Peer::open(engine.clone(), registry.clone()).await;
        alice.drain();
        let send = alice.create_transport(TransportPurpose::Send).await;
        alice
            .channel
            .handle(ClientMessage::Produce(ProduceRequest {
                transport_id: send,
                kind: MediaKind::Audio,
                rtp_parameters: opus_parameters(),
            }))
            .await;

        let mut bob = Peer::open(engine, registry).await;
        bob.drain();
        bob.create_transport(TransportPurpose::Send).await;
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn test_consume_without_recv_transport() {
        let (engine, registry) = setup();
        let mut peer = Peer::open(engine.clone(), registry).await;
        peer.drain();

        peer.channel
            .handle(ClientMessage::Consume(ConsumeRequest {
                producer_id: "p1".to_owned(),
                rtp_capabilities: engine.routing_capabilities(),
            }))
            .await;
        match peer.drain().remove(0) {
            ServerMessage::Consume(Reply::Error { error }) => assert_eq!(error, "No receive transport"),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(peer.channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_spawned_channel_closes() {
        let (engine, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel =
            SignalingChannel::open(engine, registry.clone(), WebRtcTransportConfig::default(), tx)
                .await;
        let handle = channel.spawn();
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::RtpCapabilities(_))
        ));

        handle
            .send_text(r#"{"type":"createWebRtcTransport"}"#.to_owned())
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::CreateWebRtcTransport(Reply::Ok(_)))
        ));

        handle.close().await;
        assert!(!registry.contains(handle.session_id()).await);
        // The runner drops its sender once it has finished.
        assert!(rx.recv().await.is_none());

        // Closing again once the runner is gone is a no-op.
        handle.close().await;
        let err = handle
            .send_text(r#"{"type":"createWebRtcTransport"}"#.to_owned())
            .unwrap_err();
        assert_eq!(err.session_kind(), Some(&SessionErrorKind::SessionClosed));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dropping_every_handle_closes_session() {
        let (engine, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel =
            SignalingChannel::open(engine, registry.clone(), WebRtcTransportConfig::default(), tx)
                .await;
        let handle = channel.spawn();
        drop(handle);

        while rx.recv().await.is_some() {}
        assert!(registry.is_empty().await);
    }
}
