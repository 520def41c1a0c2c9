use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("signal error: {0}")]
    SignalError(#[from] SignalError),
    #[error("negotiation error: {0}")]
    NegotiationError(#[from] NegotiationError),
    #[error("media error: {0}")]
    MediaError(#[from] MediaError),
    #[error("router error: {0}")]
    RouterError(#[from] RouterError),
    #[error("session error: {0}")]
    SessionError(#[from] SessionError),
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    UrlError(#[from] url::ParseError),
    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Error, Debug, Clone)]
#[error("{message} ({kind})")]
pub struct SignalError {
    pub kind: SignalErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum SignalErrorKind {
    ConnectionError,
    AuthorizationError,
    RetriesExhaustedError,
    ServerError,
    ClosedError,
}

#[derive(Error, Debug)]
#[error("{message} ({kind})")]
pub struct NegotiationError {
    pub kind: NegotiationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum NegotiationErrorKind {
    PeerNotFoundError,
    SignalingStateInvalidError,
    LocalDescriptionError,
    SenderNotFoundError,
}

#[derive(Error, Debug)]
#[error("{message} ({kind})")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum MediaErrorKind {
    TrackStoppedError,
    NoLocalStreamError,
    TrackReplaceError,
}

#[derive(Error, Debug)]
#[error("{message} ({kind})")]
pub struct RouterError {
    pub kind: RouterErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum RouterErrorKind {
    UnsupportedCapabilitiesError,
    TransportNotFoundError,
    RequestFailedError,
    UnexpectedResponseError,
    SdpError,
    TransportFailedError,
}

#[derive(Error, Debug)]
#[error("{message} ({kind})")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum SessionErrorKind {
    NotConnectedError,
    ConnectTimeoutError,
    NoPreviousConnectionError,
    DisconnectedError,
    EngineStoppedError,
}

impl Error {
    pub fn new_signal(message: String, kind: SignalErrorKind) -> Error {
        Error::SignalError(SignalError { kind, message })
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Error {
        Error::NegotiationError(NegotiationError { kind, message })
    }

    pub fn new_media(message: String, kind: MediaErrorKind) -> Error {
        Error::MediaError(MediaError { kind, message })
    }

    pub fn new_router(message: String, kind: RouterErrorKind) -> Error {
        Error::RouterError(RouterError { kind, message })
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }

    /// Fatal errors end the session and are never retried internally.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::SignalError(err) => matches!(
                err.kind,
                SignalErrorKind::AuthorizationError
                    | SignalErrorKind::RetriesExhaustedError
                    | SignalErrorKind::ServerError
            ),
            Error::RouterError(err) => matches!(
                err.kind,
                RouterErrorKind::UnsupportedCapabilitiesError | RouterErrorKind::RequestFailedError
            ),
            Error::SessionError(err) => err.kind == SessionErrorKind::ConnectTimeoutError,
            _ => false,
        }
    }
}
