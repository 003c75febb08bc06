use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    error::{Error, ProtocolErrorKind},
    rtp_parameters::{
        DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportParameters,
    },
};

/// Every frame on the signaling channel is one envelope: `{ "type": ..., "data": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(typ: MessageType, data: &T) -> Result<Self, Error> {
        Ok(Self {
            typ: typ.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new_protocol(
                format!("Invalid envelope: {}", err),
                ProtocolErrorKind::MalformedMessage,
            )
        })
    }

    pub fn to_text(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    fn message_type(&self) -> Result<MessageType, Error> {
        MessageType::from_str(&self.typ).map_err(|_| {
            Error::new_protocol(
                format!("Unknown message type: {}", self.typ),
                ProtocolErrorKind::UnknownMessageType,
            )
        })
    }

    fn error(&self) -> Option<String> {
        self.data
            .get("error")
            .and_then(|error| error.as_str())
            .map(|error| error.to_owned())
    }

    fn payload<T: DeserializeOwned>(self) -> Result<T, Error> {
        // A request without data is treated as an empty object.
        let data = if self.data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.data
        };
        serde_json::from_value(data).map_err(|err| {
            Error::new_protocol(
                format!("Invalid {} payload: {}", self.typ, err),
                ProtocolErrorKind::MalformedMessage,
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum MessageType {
    RtpCapabilities,
    CreateWebRtcTransport,
    ConnectTransport,
    Produce,
    Consume,
    NewProducer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportPurpose {
    Send,
    Recv,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTransportRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<TransportPurpose>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectTransportReply {
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceReply {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReply {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducerNotice {
    pub producer_id: String,
    pub socket_id: String,
}

/// Reply data: either the result or `{ "error": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Error { error: String },
    Ok(T),
}

impl<T> Reply<T> {
    pub fn from_result(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(err) => Reply::Error {
                error: err.to_string(),
            },
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Error { error } => Err(error),
        }
    }
}

/// Messages sent by a peer to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CreateWebRtcTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::CreateWebRtcTransport(_) => MessageType::CreateWebRtcTransport,
            ClientMessage::ConnectTransport(_) => MessageType::ConnectTransport,
            ClientMessage::Produce(_) => MessageType::Produce,
            ClientMessage::Consume(_) => MessageType::Consume,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, Error> {
        let typ = self.message_type();
        match self {
            ClientMessage::CreateWebRtcTransport(data) => Envelope::new(typ, data),
            ClientMessage::ConnectTransport(data) => Envelope::new(typ, data),
            ClientMessage::Produce(data) => Envelope::new(typ, data),
            ClientMessage::Consume(data) => Envelope::new(typ, data),
        }
    }
}

impl TryFrom<Envelope> for ClientMessage {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.message_type()? {
            MessageType::CreateWebRtcTransport => {
                Ok(ClientMessage::CreateWebRtcTransport(envelope.payload()?))
            }
            MessageType::ConnectTransport => Ok(ClientMessage::ConnectTransport(envelope.payload()?)),
            MessageType::Produce => Ok(ClientMessage::Produce(envelope.payload()?)),
            MessageType::Consume => Ok(ClientMessage::Consume(envelope.payload()?)),
            typ @ (MessageType::RtpCapabilities | MessageType::NewProducer) => {
                Err(Error::new_protocol(
                    format!("{} is sent by the server only", typ),
                    ProtocolErrorKind::ProtocolViolation,
                ))
            }
        }
    }
}

/// Messages sent by the server to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    RtpCapabilities(RtpCapabilities),
    CreateWebRtcTransport(Reply<TransportParameters>),
    ConnectTransport(Reply<ConnectTransportReply>),
    Produce(Reply<ProduceReply>),
    Consume(Reply<ConsumeReply>),
    NewProducer(NewProducerNotice),
    /// Error reply to a frame whose type has no reply shape, e.g. an unknown type.
    Rejected { typ: String, error: String },
}

impl ServerMessage {
    /// Error reply of the same type as the rejected frame.
    pub fn rejected(typ: &str, err: &Error) -> Self {
        let error = err.to_string();
        match MessageType::from_str(typ) {
            Ok(MessageType::CreateWebRtcTransport) => {
                ServerMessage::CreateWebRtcTransport(Reply::Error { error })
            }
            Ok(MessageType::ConnectTransport) => ServerMessage::ConnectTransport(Reply::Error { error }),
            Ok(MessageType::Produce) => ServerMessage::Produce(Reply::Error { error }),
            Ok(MessageType::Consume) => ServerMessage::Consume(Reply::Error { error }),
            _ => ServerMessage::Rejected {
                typ: typ.to_owned(),
                error,
            },
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, Error> {
        match self {
            ServerMessage::RtpCapabilities(data) => Envelope::new(MessageType::RtpCapabilities, data),
            ServerMessage::CreateWebRtcTransport(data) => {
                Envelope::new(MessageType::CreateWebRtcTransport, data)
            }
            ServerMessage::ConnectTransport(data) => Envelope::new(MessageType::ConnectTransport, data),
            ServerMessage::Produce(data) => Envelope::new(MessageType::Produce, data),
            ServerMessage::Consume(data) => Envelope::new(MessageType::Consume, data),
            ServerMessage::NewProducer(data) => Envelope::new(MessageType::NewProducer, data),
            ServerMessage::Rejected { typ, error } => Ok(Envelope {
                typ: typ.clone(),
                data: serde_json::json!({ "error": error }),
            }),
        }
    }

    pub fn to_text(&self) -> Result<String, Error> {
        self.to_envelope()?.to_text()
    }
}

impl TryFrom<Envelope> for ServerMessage {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let typ = match envelope.message_type() {
            Ok(typ) => typ,
            Err(err) => {
                return match envelope.error() {
                    Some(error) => Ok(ServerMessage::Rejected {
                        typ: envelope.typ,
                        error,
                    }),
                    None => Err(err),
                }
            }
        };
        match typ {
            MessageType::RtpCapabilities | MessageType::NewProducer => {
                if let Some(error) = envelope.error() {
                    return Ok(ServerMessage::Rejected {
                        typ: envelope.typ,
                        error,
                    });
                }
                if typ == MessageType::RtpCapabilities {
                    Ok(ServerMessage::RtpCapabilities(envelope.payload()?))
                } else {
                    Ok(ServerMessage::NewProducer(envelope.payload()?))
                }
            }
            MessageType::CreateWebRtcTransport => {
                Ok(ServerMessage::CreateWebRtcTransport(envelope.payload()?))
            }
            MessageType::ConnectTransport => Ok(ServerMessage::ConnectTransport(envelope.payload()?)),
            MessageType::Produce => Ok(ServerMessage::Produce(envelope.payload()?)),
            MessageType::Consume => Ok(ServerMessage::Consume(envelope.payload()?)),
        }
    }
}
