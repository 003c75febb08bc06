use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use strum_macros::{Display, EnumString};
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{ClientErrorKind, Error},
    rtp_parameters::{RtpCapabilities, TransportParameters},
    session::TransportRole,
    signaling::{
        channel::ChannelState,
        message::{
            ClientMessage, ConnectTransportReply, ConnectTransportRequest, ConsumeReply,
            ConsumeRequest, CreateTransportRequest, NewProducerNotice, ProduceReply,
            ProduceRequest, Reply, ServerMessage, TransportPurpose,
        },
    },
};

use super::device::{Device, LocalTrack, MediaSource, RemoteTrack, RenderTarget};

/// What the peer does once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ClientRole {
    Send,
    Receive,
    Both,
}

impl ClientRole {
    fn sends(self) -> bool {
        matches!(self, ClientRole::Send | ClientRole::Both)
    }

    fn receives(self) -> bool {
        matches!(self, ClientRole::Receive | ClientRole::Both)
    }
}

pub type ProduceResult = Result<String, Error>;

#[derive(Debug)]
struct PendingProduce {
    track: LocalTrack,
    reply: oneshot::Sender<ProduceResult>,
}

/// ClientAgent negotiates with the server on behalf of one peer.
///
/// Replies carry no request id, so the agent correlates them with its requests by arrival order: transport
/// creations, transport connections and produce requests each have their own FIFO queue.
#[derive(Debug)]
pub struct ClientAgent {
    role: ClientRole,
    device: Arc<dyn Device>,
    source: Arc<dyn MediaSource>,
    render_target: Arc<dyn RenderTarget>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state: ChannelState,
    send_transport_id: Option<String>,
    recv_transport_id: Option<String>,
    requested_transports: VecDeque<TransportRole>,
    pending_connects: VecDeque<String>,
    pending_consumes: VecDeque<String>,
    produce_callbacks: VecDeque<PendingProduce>,
    known_producers: HashSet<String>,
    producers: Vec<(String, String)>,
    remote_tracks: Vec<RemoteTrack>,
}

impl ClientAgent {
    /// Creates an agent for a freshly opened channel. Requests are written to `outbound`.
    pub fn new(
        role: ClientRole,
        device: Arc<dyn Device>,
        source: Arc<dyn MediaSource>,
        render_target: Arc<dyn RenderTarget>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            role,
            device,
            source,
            render_target,
            outbound,
            state: ChannelState::Connected,
            send_transport_id: None,
            recv_transport_id: None,
            requested_transports: VecDeque::new(),
            pending_connects: VecDeque::new(),
            pending_consumes: VecDeque::new(),
            produce_callbacks: VecDeque::new(),
            known_producers: HashSet::new(),
            producers: vec![],
            remote_tracks: vec![],
        }
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn send_transport_id(&self) -> Option<&str> {
        self.send_transport_id.as_deref()
    }

    pub fn recv_transport_id(&self) -> Option<&str> {
        self.recv_transport_id.as_deref()
    }

    /// Producer ids waiting for the receive transport, in arrival order.
    pub fn pending_consumes(&self) -> Vec<String> {
        self.pending_consumes.iter().cloned().collect()
    }

    /// Ids of the producers created for local tracks, in confirmation order.
    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    fn send(&self, message: ClientMessage) -> Result<(), Error> {
        tracing::debug!("Sending {}", message.message_type());
        self.outbound.send(message).map_err(|_| {
            Error::new_client(
                "Signaling channel is closed".to_owned(),
                ClientErrorKind::ChannelClosed,
            )
        })
    }

    fn device_capabilities(&self) -> Result<RtpCapabilities, Error> {
        self.device.rtp_capabilities().ok_or_else(|| {
            Error::new_client(
                "Device is not loaded".to_owned(),
                ClientErrorKind::DeviceNotLoaded,
            )
        })
    }

    pub async fn handle_message(&mut self, message: ServerMessage) -> Result<(), Error> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        match message {
            ServerMessage::RtpCapabilities(capabilities) => self.on_capabilities(capabilities).await,
            ServerMessage::CreateWebRtcTransport(reply) => self.on_transport(reply).await,
            ServerMessage::ConnectTransport(reply) => self.on_connected(reply),
            ServerMessage::Produce(reply) => {
                self.on_produced(reply);
                Ok(())
            }
            ServerMessage::Consume(reply) => self.on_consumed(reply).await,
            ServerMessage::NewProducer(notice) => self.on_new_producer(notice),
            ServerMessage::Rejected { typ, error } => {
                tracing::warn!("Server rejected {}: {}", typ, error);
                Ok(())
            }
        }
    }

    async fn on_capabilities(&mut self, capabilities: RtpCapabilities) -> Result<(), Error> {
        if self.device.rtp_capabilities().is_some() {
            tracing::warn!("Routing capabilities received twice, ignoring");
            return Ok(());
        }
        self.device.load(capabilities).await?;
        tracing::info!("Device loaded, role: {}", self.role);

        if self.role.sends() {
            self.request_transport(TransportRole::Send)?;
        }
        if self.role.receives() {
            self.request_transport(TransportRole::Recv)?;
        }
        Ok(())
    }

    /// Requests a transport for the role unless one exists or is already on its way.
    fn request_transport(&mut self, role: TransportRole) -> Result<(), Error> {
        let exists = match role {
            TransportRole::Send => self.send_transport_id.is_some(),
            TransportRole::Recv => self.recv_transport_id.is_some(),
        };
        if exists || self.requested_transports.contains(&role) {
            return Ok(());
        }

        let purpose = match role {
            TransportRole::Send => TransportPurpose::Send,
            TransportRole::Recv => TransportPurpose::Recv,
        };
        self.send(ClientMessage::CreateWebRtcTransport(CreateTransportRequest {
            purpose: Some(purpose),
        }))?;
        self.requested_transports.push_back(role);
        if self.state == ChannelState::Connected {
            self.state = ChannelState::Negotiating;
        }
        Ok(())
    }

    async fn on_transport(&mut self, reply: Reply<TransportParameters>) -> Result<(), Error> {
        let Some(role) = self.requested_transports.pop_front() else {
            tracing::warn!("Unexpected createWebRtcTransport reply");
            return Ok(());
        };
        let parameters = reply.into_result().map_err(|error| {
            tracing::warn!("Failed to create {} transport: {}", role, error);
            Error::new_client(error, ClientErrorKind::Rejected)
        })?;

        let transport_id = parameters.id.clone();
        let dtls_parameters = self.device.create_transport(role, &parameters).await?;
        self.send(ClientMessage::ConnectTransport(ConnectTransportRequest {
            transport_id: transport_id.clone(),
            dtls_parameters,
        }))?;
        self.pending_connects.push_back(transport_id.clone());
        tracing::info!("{} transport is ready: {}", role, transport_id);

        match role {
            TransportRole::Send => {
                self.send_transport_id = Some(transport_id);
                self.produce_local_media().await
            }
            TransportRole::Recv => {
                self.recv_transport_id = Some(transport_id);
                while let Some(producer_id) = self.pending_consumes.pop_front() {
                    tracing::debug!("Consuming pending producer {}", producer_id);
                    self.request_consume(producer_id)?;
                }
                Ok(())
            }
        }
    }

    fn on_connected(&mut self, reply: Reply<ConnectTransportReply>) -> Result<(), Error> {
        let transport_id = self.pending_connects.pop_front().unwrap_or_default();
        match reply.into_result() {
            Ok(_) => {
                tracing::info!("Transport connected: {}", transport_id);
                self.state = ChannelState::Active;
                Ok(())
            }
            Err(error) => {
                tracing::warn!("Failed to connect transport {}: {}", transport_id, error);
                Err(Error::new_client(error, ClientErrorKind::Rejected))
            }
        }
    }

    async fn produce_local_media(&mut self) -> Result<(), Error> {
        let tracks = self.source.acquire().await?;
        tracing::debug!("Producing {} local tracks", tracks.len());
        for track in tracks {
            // Results of automatic produce requests are only logged.
            self.produce(track)?;
        }
        Ok(())
    }

    /// Asks the server to produce a local track on the send transport. The receiver resolves with the producer id
    /// once the matching reply arrives.
    pub fn produce(&mut self, track: LocalTrack) -> Result<oneshot::Receiver<ProduceResult>, Error> {
        let transport_id = self.send_transport_id.clone().ok_or_else(|| {
            Error::new_client(
                "No send transport".to_owned(),
                ClientErrorKind::NoSendTransport,
            )
        })?;
        let rtp_parameters = self.device.produce_parameters(&track)?;

        self.send(ClientMessage::Produce(ProduceRequest {
            transport_id,
            kind: track.kind,
            rtp_parameters,
        }))?;
        let (tx, rx) = oneshot::channel();
        self.produce_callbacks.push_back(PendingProduce { track, reply: tx });
        Ok(rx)
    }

    fn on_produced(&mut self, reply: Reply<ProduceReply>) {
        let Some(pending) = self.produce_callbacks.pop_front() else {
            tracing::warn!("Unexpected produce reply");
            return;
        };
        let result = match reply.into_result() {
            Ok(ProduceReply { id }) => {
                tracing::info!("Producing {} track {}: {}", pending.track.kind, pending.track.id, id);
                self.producers.push((pending.track.id.clone(), id.clone()));
                self.state = ChannelState::Active;
                Ok(id)
            }
            Err(error) => {
                tracing::warn!("Failed to produce track {}: {}", pending.track.id, error);
                Err(Error::new_client(error, ClientErrorKind::Rejected))
            }
        };
        let _ = pending.reply.send(result);
    }

    fn on_new_producer(&mut self, notice: NewProducerNotice) -> Result<(), Error> {
        let NewProducerNotice {
            producer_id,
            socket_id,
        } = notice;
        if !self.known_producers.insert(producer_id.clone()) {
            tracing::debug!("Producer {} is already known", producer_id);
            return Ok(());
        }
        tracing::info!("New producer {} from peer {}", producer_id, socket_id);

        if self.recv_transport_id.is_some() {
            return self.request_consume(producer_id);
        }
        self.pending_consumes.push_back(producer_id);
        tracing::debug!("Pending consumes: {}", self.pending_consumes.len());
        self.request_transport(TransportRole::Recv)
    }

    fn request_consume(&mut self, producer_id: String) -> Result<(), Error> {
        let rtp_capabilities = self.device_capabilities()?;
        self.send(ClientMessage::Consume(ConsumeRequest {
            producer_id,
            rtp_capabilities,
        }))
    }

    async fn on_consumed(&mut self, reply: Reply<ConsumeReply>) -> Result<(), Error> {
        let reply = reply.into_result().map_err(|error| {
            tracing::warn!("Consume error: {}", error);
            Error::new_client(error, ClientErrorKind::Rejected)
        })?;

        let track = self.device.consume(&reply).await?;
        tracing::info!("Consuming {}: {}", track.kind, track.consumer_id);
        self.render_target.attach(track.clone());
        self.remote_tracks.push(track);
        self.state = ChannelState::Active;
        Ok(())
    }

    /// Stops the agent. Outstanding produce requests resolve with an error.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.requested_transports.clear();
        self.pending_connects.clear();
        self.pending_consumes.clear();
        for pending in self.produce_callbacks.drain(..) {
            let _ = pending.reply.send(Err(Error::new_client(
                "Signaling channel is closed".to_owned(),
                ClientErrorKind::ChannelClosed,
            )));
        }
        tracing::debug!("ClientAgent is closed");
    }

    /// Handles server messages until the channel closes. Errors of single messages are logged.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) -> Self {
        while let Some(message) = inbound.recv().await {
            if let Err(err) = self.handle_message(message).await {
                tracing::error!("Failed to handle server message: {}", err);
            }
        }
        self.close();
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        client::device::BasicDevice,
        config::MediaConfig,
        rtp_parameters::{DtlsParameters, IceParameters, MediaKind, RtpParameters},
    };

    #[derive(Debug, Default)]
    struct FixedSource {
        tracks: Vec<LocalTrack>,
    }

    #[async_trait]
    impl MediaSource for FixedSource {
        async fn acquire(&self) -> Result<Vec<LocalTrack>, Error> {
            Ok(self.tracks.clone())
        }
    }

    #[derive(Debug, Default)]
    struct RecordingTarget {
        tracks: Mutex<Vec<RemoteTrack>>,
    }

    impl RenderTarget for RecordingTarget {
        fn attach(&self, track: RemoteTrack) {
            self.tracks.lock().unwrap().push(track);
        }
    }

    fn agent(
        role: ClientRole,
        tracks: Vec<LocalTrack>,
    ) -> (
        ClientAgent,
        mpsc::UnboundedReceiver<ClientMessage>,
        Arc<RecordingTarget>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = Arc::new(RecordingTarget::default());
        let agent = ClientAgent::new(
            role,
            Arc::new(BasicDevice::new()),
            Arc::new(FixedSource { tracks }),
            target.clone(),
            tx,
        );
        (agent, rx, target)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut messages = vec![];
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn transport_reply(id: &str) -> ServerMessage {
        ServerMessage::CreateWebRtcTransport(Reply::Ok(TransportParameters {
            id: id.to_owned(),
            ice_parameters: IceParameters::default(),
            ice_candidates: vec![],
            dtls_parameters: DtlsParameters::default(),
        }))
    }

    fn new_producer(id: &str) -> ServerMessage {
        ServerMessage::NewProducer(NewProducerNotice {
            producer_id: id.to_owned(),
            socket_id: "remote".to_owned(),
        })
    }

    fn capabilities() -> ServerMessage {
        ServerMessage::RtpCapabilities(MediaConfig::default().rtp_capabilities())
    }

    fn purposes(messages: &[ClientMessage]) -> Vec<Option<TransportPurpose>> {
        messages
            .iter()
            .filter_map(|message| match message {
                ClientMessage::CreateWebRtcTransport(request) => Some(request.purpose),
                _ => None,
            })
            .collect()
    }

    fn consumed(messages: &[ClientMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|message| match message {
                ClientMessage::Consume(request) => Some(request.producer_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn mic() -> LocalTrack {
        LocalTrack {
            id: "mic".to_owned(),
            kind: MediaKind::Audio,
        }
    }

    #[tokio::test]
    async fn test_role_decides_transports() {
        for (role, expected) in [
            (ClientRole::Send, vec![Some(TransportPurpose::Send)]),
            (ClientRole::Receive, vec![Some(TransportPurpose::Recv)]),
            (
                ClientRole::Both,
                vec![Some(TransportPurpose::Send), Some(TransportPurpose::Recv)],
            ),
        ] {
            let (mut agent, mut rx, _) = agent(role, vec![]);
            agent.handle_message(capabilities()).await.unwrap();
            assert_eq!(purposes(&drain(&mut rx)), expected);
            assert_eq!(agent.state(), ChannelState::Negotiating);

            // A second capability push does not request anything.
            agent.handle_message(capabilities()).await.unwrap();
            assert!(drain(&mut rx).is_empty());
        }
    }

    #[tokio::test]
    async fn test_pending_consumes_are_drained_in_order() {
        let (mut agent, mut rx, _) = agent(ClientRole::Send, vec![]);
        agent.handle_message(capabilities()).await.unwrap();
        agent.handle_message(transport_reply("send")).await.unwrap();
        drain(&mut rx);

        agent.handle_message(new_producer("p1")).await.unwrap();
        agent.handle_message(new_producer("p2")).await.unwrap();
        agent.handle_message(new_producer("p1")).await.unwrap();
        let messages = drain(&mut rx);
        // One receive transport request, no consume yet.
        assert_eq!(purposes(&messages), vec![Some(TransportPurpose::Recv)]);
        assert!(consumed(&messages).is_empty());
        assert_eq!(agent.pending_consumes(), vec!["p1".to_owned(), "p2".to_owned()]);

        agent.handle_message(transport_reply("recv")).await.unwrap();
        let messages = drain(&mut rx);
        assert!(matches!(messages[0], ClientMessage::ConnectTransport(_)));
        assert_eq!(consumed(&messages), vec!["p1".to_owned(), "p2".to_owned()]);
        assert!(agent.pending_consumes().is_empty());
        assert_eq!(agent.recv_transport_id(), Some("recv"));

        agent.handle_message(new_producer("p3")).await.unwrap();
        assert_eq!(consumed(&drain(&mut rx)), vec!["p3".to_owned()]);
    }

    #[tokio::test]
    async fn test_produce_replies_resolve_in_order() {
        let (mut agent, mut rx, _) = agent(ClientRole::Send, vec![mic()]);
        let err = agent.produce(mic()).unwrap_err();
        assert_eq!(err.client_kind(), Some(&ClientErrorKind::NoSendTransport));

        agent.handle_message(capabilities()).await.unwrap();
        agent.handle_message(transport_reply("send")).await.unwrap();
        let messages = drain(&mut rx);
        assert!(matches!(messages[1], ClientMessage::ConnectTransport(_)));
        match &messages[2] {
            ClientMessage::Produce(request) => {
                assert_eq!(request.transport_id, "send");
                assert_eq!(request.kind, MediaKind::Audio);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let camera = agent
            .produce(LocalTrack {
                id: "camera".to_owned(),
                kind: MediaKind::Video,
            })
            .unwrap();
        agent
            .handle_message(ServerMessage::Produce(Reply::Ok(ProduceReply {
                id: "audio-producer".to_owned(),
            })))
            .await
            .unwrap();
        agent
            .handle_message(ServerMessage::Produce(Reply::Ok(ProduceReply {
                id: "video-producer".to_owned(),
            })))
            .await
            .unwrap();

        assert_eq!(camera.await.unwrap().unwrap(), "video-producer");
        assert_eq!(
            agent.producer_ids(),
            vec!["audio-producer".to_owned(), "video-producer".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_produce_error_and_close() {
        let (mut agent, _rx, _) = agent(ClientRole::Send, vec![]);
        agent.handle_message(capabilities()).await.unwrap();
        agent.handle_message(transport_reply("send")).await.unwrap();

        let first = agent.produce(mic()).unwrap();
        let second = agent.produce(mic()).unwrap();
        agent
            .handle_message(ServerMessage::Produce(Reply::Error {
                error: "Codec is not supported".to_owned(),
            }))
            .await
            .unwrap();
        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.client_kind(), Some(&ClientErrorKind::Rejected));
        assert_eq!(err.to_string(), "Codec is not supported");

        agent.close();
        let err = second.await.unwrap().unwrap_err();
        assert_eq!(err.client_kind(), Some(&ClientErrorKind::ChannelClosed));
        assert_eq!(agent.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_consume_reply_attaches_track() {
        let (mut agent, _rx, target) = agent(ClientRole::Receive, vec![]);
        agent.handle_message(capabilities()).await.unwrap();
        agent.handle_message(transport_reply("recv")).await.unwrap();
        agent
            .handle_message(ServerMessage::ConnectTransport(Reply::Ok(
                ConnectTransportReply { connected: true },
            )))
            .await
            .unwrap();
        assert_eq!(agent.state(), ChannelState::Active);

        let err = agent
            .handle_message(ServerMessage::Consume(Reply::Error {
                error: "No receive transport".to_owned(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.client_kind(), Some(&ClientErrorKind::Rejected));

        agent
            .handle_message(ServerMessage::Consume(Reply::Ok(ConsumeReply {
                id: "c1".to_owned(),
                producer_id: "p1".to_owned(),
                kind: MediaKind::Video,
                rtp_parameters: RtpParameters::default(),
            })))
            .await
            .unwrap();
        let tracks = target.tracks.lock().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].producer_id, "p1");
        assert_eq!(agent.remote_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_transport_is_requested_again() {
        let (mut agent, mut rx, _) = agent(ClientRole::Send, vec![]);
        agent.handle_message(capabilities()).await.unwrap();
        agent.handle_message(transport_reply("send")).await.unwrap();
        agent.handle_message(new_producer("p1")).await.unwrap();
        drain(&mut rx);

        let err = agent
            .handle_message(ServerMessage::CreateWebRtcTransport(Reply::Error {
                error: "Media engine is closed".to_owned(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.client_kind(), Some(&ClientErrorKind::Rejected));
        assert_eq!(agent.pending_consumes(), vec!["p1".to_owned()]);

        agent.handle_message(new_producer("p2")).await.unwrap();
        assert_eq!(purposes(&drain(&mut rx)), vec![Some(TransportPurpose::Recv)]);
        assert_eq!(agent.pending_consumes(), vec!["p1".to_owned(), "p2".to_owned()]);
    }
}
