use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Message, StreamHandler, WrapFuture};
use actix_web::web::Data;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_web_actors::ws;
use sfu_signaling::config::{ListenIp, MediaConfig, PortRange, WebRtcTransportConfig};
use sfu_signaling::engine::local::LocalEngine;
use sfu_signaling::signaling::channel::ChannelHandle;
use sfu_signaling::signaling::message::ServerMessage;
use sfu_signaling::worker::Worker;
use tokio::sync::mpsc;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = LocalEngine::new(MediaConfig::default());
    let worker = Worker::new(engine, transport_config()).await;
    {
        let worker = worker.clone();
        tokio::spawn(async move {
            let reason = worker.wait_died().await;
            tracing::error!("Media engine worker died, exiting: {}", reason);
            std::process::exit(1);
        });
    }
    let worker_data = Data::new(worker);

    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    tracing::info!("Signaling server is listening on {}", port);

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(index)
            .app_data(worker_data.clone())
            .route("/socket", web::get().to(socket))
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}

fn transport_config() -> WebRtcTransportConfig {
    let mut config = WebRtcTransportConfig::default();
    let ip = env::var("LISTEN_IP")
        .map(|ip| ip.parse::<IpAddr>().expect("Failed to parse LISTEN_IP"))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    // Public IP address of your server.
    let announced_ip = env::var("ANNOUNCED_IP")
        .map(|ip| ip.parse::<IpAddr>().expect("Failed to parse ANNOUNCED_IP"))
        .unwrap_or(ip);
    config.listen_ips = vec![ListenIp {
        ip,
        announced_ip: Some(announced_ip),
    }];
    if let (Ok(min), Ok(max)) = (env::var("RTC_MIN_PORT"), env::var("RTC_MAX_PORT")) {
        config.port_range = Some(PortRange {
            min: min.parse().expect("Failed to parse RTC_MIN_PORT"),
            max: max.parse().expect("Failed to parse RTC_MAX_PORT"),
        });
    }
    config
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

async fn socket(
    req: HttpRequest,
    worker: Data<Arc<Worker>>,
    stream: web::Payload,
) -> impl Responder {
    let server = WebSocket::new(worker.get_ref().clone());
    ws::start(server, &req, stream)
}

struct WebSocket {
    worker: Arc<Worker>,
    channel: Option<ChannelHandle>,
}

impl WebSocket {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self {
            worker,
            channel: None,
        }
    }
}

impl Actor for WebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("New WebSocket connection is started");
        let address = ctx.address();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                address.do_send(SendingMessage(message));
            }
        });

        // Frames are held back until the channel is open.
        let worker = self.worker.clone();
        ctx.wait(
            async move { worker.open_channel(tx).await }
                .into_actor(self)
                .map(|channel, actor, _ctx| {
                    tracing::info!("Signaling channel is opened: {}", channel.session_id());
                    actor.channel = Some(channel);
                }),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("The WebSocket connection is stopped");
        if let Some(channel) = self.channel.take() {
            actix::spawn(async move {
                channel.close().await;
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::info!("pong received"),
            Ok(ws::Message::Text(text)) => match &self.channel {
                Some(channel) => {
                    if let Err(error) = channel.send_text(text.to_string()) {
                        tracing::error!("failed to pass client message: {}", error);
                        ctx.stop();
                    }
                }
                None => tracing::warn!("signaling channel is not open: {}", text),
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(error) => {
                tracing::error!("WebSocket error: {}", error);
                ctx.stop();
            }
            _ => (),
        }
    }
}

impl Handler<SendingMessage> for WebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendingMessage, ctx: &mut Self::Context) -> Self::Result {
        tracing::debug!("sending message: {:?}", msg);
        match msg.0.to_text() {
            Ok(text) => ctx.text(text),
            Err(error) => tracing::error!("failed to encode server message: {}", error),
        }
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct SendingMessage(ServerMessage);
