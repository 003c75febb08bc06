use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    SessionError(#[from] SessionError),
    #[error(transparent)]
    EngineError(#[from] EngineError),
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),
    #[error(transparent)]
    ClientError(#[from] ClientError),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl Error {
    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }

    pub fn new_engine(message: String, kind: EngineErrorKind) -> Error {
        Error::EngineError(EngineError { kind, message })
    }

    pub fn new_protocol(message: String, kind: ProtocolErrorKind) -> Error {
        Error::ProtocolError(ProtocolError { kind, message })
    }

    pub fn new_client(message: String, kind: ClientErrorKind) -> Error {
        Error::ClientError(ClientError { kind, message })
    }

    /// Returns the session error kind, if this is a session error.
    pub fn session_kind(&self) -> Option<&SessionErrorKind> {
        match self {
            Error::SessionError(err) => Some(&err.kind),
            _ => None,
        }
    }

    /// Returns the engine error kind, if this is an engine error.
    pub fn engine_kind(&self) -> Option<&EngineErrorKind> {
        match self {
            Error::EngineError(err) => Some(&err.kind),
            _ => None,
        }
    }

    /// Returns the protocol error kind, if this is a protocol error.
    pub fn protocol_kind(&self) -> Option<&ProtocolErrorKind> {
        match self {
            Error::ProtocolError(err) => Some(&err.kind),
            _ => None,
        }
    }

    pub fn client_kind(&self) -> Option<&ClientErrorKind> {
        match self {
            Error::ClientError(err) => Some(&err.kind),
            _ => None,
        }
    }
}

/// Errors raised by [`crate::session::PeerSession`] operations.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionErrorKind {
    UnknownTransport,
    AlreadyConnected,
    NoReceiveTransport,
    IncompatibleCapabilities,
    AlreadyConsuming,
    SessionClosed,
}

/// Errors reported by a [`crate::engine::MediaEngine`] binding.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineErrorKind {
    EngineUnavailable,
    ConnectFailed,
    CannotConsume,
    UnsupportedCodec,
}

/// Errors raised while decoding or dispatching signaling messages.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    ProtocolViolation,
    MalformedMessage,
    UnknownMessageType,
}

/// Errors on the peer side of the protocol, see [`crate::client::agent::ClientAgent`].
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// The server answered a request with an error.
    Rejected,
    NoSendTransport,
    DeviceNotLoaded,
    /// The routing capabilities have no codec for a track kind.
    NoMatchingCodec,
    ChannelClosed,
}
