use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::{
    config::WebRtcTransportConfig,
    engine::MediaEngine,
    registry::Registry,
    signaling::{
        channel::{ChannelHandle, SignalingChannel},
        message::ServerMessage,
    },
};

/// Worker owns the media engine and the session registry shared by every signaling channel of this service.
#[derive(Debug)]
pub struct Worker {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<Registry>,
    transport_config: WebRtcTransportConfig,
    worker_event_receiver: Mutex<mpsc::UnboundedReceiver<WorkerEvent>>,
}

impl Worker {
    /// Creates a new worker on top of the engine, and starts watching the engine for failures.
    pub async fn new(
        engine: Arc<dyn MediaEngine>,
        transport_config: WebRtcTransportConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<WorkerEvent>();
        engine
            .on_died(Box::new(move |reason| {
                tracing::error!("Media engine died: {}", reason);
                let _ = tx.send(WorkerEvent::Died(reason));
            }))
            .await;

        tracing::debug!("Worker is created");
        Arc::new(Self {
            engine,
            registry: Arc::new(Registry::new()),
            transport_config,
            worker_event_receiver: Mutex::new(rx),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn engine(&self) -> Arc<dyn MediaEngine> {
        self.engine.clone()
    }

    /// Opens a signaling channel for a newly connected peer. Replies and notifications for the peer go to
    /// `outbound`.
    pub async fn open_channel(
        &self,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> ChannelHandle {
        let channel = SignalingChannel::open(
            self.engine.clone(),
            self.registry.clone(),
            self.transport_config.clone(),
            outbound,
        )
        .await;
        channel.spawn()
    }

    /// Resolves once the engine has failed, with the reason it reported. The service cannot continue after that.
    pub async fn wait_died(&self) -> String {
        let mut receiver = self.worker_event_receiver.lock().await;
        while let Some(event) = receiver.recv().await {
            match event {
                WorkerEvent::Died(reason) => return reason,
            }
        }
        // The engine dropped its callback without reporting.
        "media engine is gone".to_owned()
    }
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Died(String),
}

impl Drop for Worker {
    fn drop(&mut self) {
        tracing::debug!("Worker is dropped");
    }
}
