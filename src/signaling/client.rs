use std::{
    fmt::Debug,
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, mpsc};
use url::Url;
use uuid::Uuid;

use crate::{
    config::SignalConfig,
    error::{Error, SignalErrorKind},
};

pub const NORMAL_CLOSE: u16 = 1000;
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Message vocabulary carried over a [`SignalClient`].
pub trait SignalProtocol: Send + Sync + 'static {
    type Incoming: DeserializeOwned + Debug + Send + 'static;
    type Outgoing: Serialize + Debug + Send + Sync + 'static;

    /// Keepalive sent every ping interval while the channel is open.
    fn ping() -> Option<Self::Outgoing>;
}

/// Frames written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Frames read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

/// An open duplex channel handed out by a [`SignalConnector`].
#[derive(Debug)]
pub struct SignalChannel {
    pub sender: mpsc::UnboundedSender<Frame>,
    pub receiver: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait SignalConnector: Send + Sync + Debug {
    async fn connect(&self, url: &Url) -> Result<SignalChannel, Error>;
}

/// Where to connect and the opaque credential to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEndpoint {
    pub url: String,
    pub token: Option<String>,
}

impl SignalEndpoint {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn resolve(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&self.url)?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

#[derive(Debug)]
pub enum SignalEvent<In> {
    Open,
    Message(In),
    Closed {
        code: u16,
        reason: String,
        will_reconnect: bool,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// The channel gave up and will not reconnect.
    Fatal(Error),
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)` bounded by `cap`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// Reconnecting JSON channel to a signaling server.
#[derive(Debug)]
pub struct SignalClient<P: SignalProtocol> {
    pub id: String,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
    stop_sender: broadcast::Sender<bool>,
    _protocol: PhantomData<P>,
}

impl<P: SignalProtocol> SignalClient<P> {
    pub fn open(
        connector: Arc<dyn SignalConnector>,
        url: Url,
        config: SignalConfig,
        events: mpsc::UnboundedSender<SignalEvent<P::Incoming>>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let outgoing = Arc::new(Mutex::new(None));
        let (stop_sender, stop_receiver) = broadcast::channel(1);

        {
            let id = id.clone();
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                Self::signal_loop(id, connector, url, config, outgoing, events, stop_receiver)
                    .await;
            });
        }

        tracing::debug!("SignalClient {} is created", id);

        Self {
            id,
            outgoing,
            stop_sender,
            _protocol: PhantomData,
        }
    }

    /// Sends a message. Nothing happens while the channel is not open.
    pub fn send(&self, message: &P::Outgoing) {
        let Ok(outgoing) = self.outgoing.lock() else {
            return;
        };
        let Some(sender) = outgoing.as_ref() else {
            tracing::debug!("SignalClient {} is not open, dropping {:?}", self.id, message);
            return;
        };
        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(err) = sender.send(Frame::Text(text)) {
                    tracing::debug!("SignalClient {} failed to send: {}", self.id, err);
                }
            }
            Err(err) => {
                tracing::error!("SignalClient {} failed to serialize message: {}", self.id, err);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.outgoing
            .lock()
            .map(|outgoing| outgoing.is_some())
            .unwrap_or(false)
    }

    /// Closes the channel normally. No reconnect follows.
    pub fn close(&self) {
        let _ = self.stop_sender.send(true);
    }

    async fn signal_loop(
        id: String,
        connector: Arc<dyn SignalConnector>,
        url: Url,
        config: SignalConfig,
        outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
        events: mpsc::UnboundedSender<SignalEvent<P::Incoming>>,
        mut stop_receiver: broadcast::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let connected = tokio::select! {
                _ = stop_receiver.recv() => {
                    break;
                }
                res = connector.connect(&url) => res,
            };

            let (code, reason, was_open) = match connected {
                Ok(channel) => {
                    tracing::info!("SignalClient {} is open", id);
                    attempt = 0;
                    if let Ok(mut guard) = outgoing.lock() {
                        *guard = Some(channel.sender.clone());
                    }
                    let _ = events.send(SignalEvent::Open);

                    let closed =
                        Self::channel_loop(&id, channel, &config, &events, &mut stop_receiver)
                            .await;
                    if let Ok(mut guard) = outgoing.lock() {
                        *guard = None;
                    }
                    match closed {
                        Some((code, reason)) => (code, reason, true),
                        None => break,
                    }
                }
                Err(err) => {
                    tracing::warn!("SignalClient {} failed to connect: {}", id, err);
                    (ABNORMAL_CLOSE, err.to_string(), false)
                }
            };

            if code == NORMAL_CLOSE {
                tracing::info!("SignalClient {} is closed by server", id);
                let _ = events.send(SignalEvent::Closed {
                    code,
                    reason,
                    will_reconnect: false,
                });
                break;
            }

            if config.fatal_close_codes.contains(&code) {
                tracing::error!(
                    "SignalClient {} is closed with code={} reason={}, credentials were rejected",
                    id,
                    code,
                    reason
                );
                let _ = events.send(SignalEvent::Fatal(Error::new_signal(
                    format!("Signal channel closed with code {}: {}", code, reason),
                    SignalErrorKind::AuthorizationError,
                )));
                break;
            }

            attempt += 1;
            if let Some(max) = config.max_reconnect_attempts {
                if attempt > max {
                    let _ = events.send(SignalEvent::Fatal(Error::new_signal(
                        format!("Gave up after {} reconnect attempts", max),
                        SignalErrorKind::RetriesExhaustedError,
                    )));
                    break;
                }
            }

            if was_open {
                let _ = events.send(SignalEvent::Closed {
                    code,
                    reason,
                    will_reconnect: true,
                });
            }
            let delay = reconnect_delay(attempt, config.reconnect_base, config.reconnect_cap);
            tracing::info!(
                "SignalClient {} reconnects in {:?}, attempt={}",
                id,
                delay,
                attempt
            );
            let _ = events.send(SignalEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = stop_receiver.recv() => {
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("SignalClient {} loop has finished", id);
    }

    /// Pumps one open channel. Returns the close code, or `None` when stopped locally.
    async fn channel_loop(
        id: &str,
        channel: SignalChannel,
        config: &SignalConfig,
        events: &mpsc::UnboundedSender<SignalEvent<P::Incoming>>,
        stop_receiver: &mut broadcast::Receiver<bool>,
    ) -> Option<(u16, String)> {
        let SignalChannel {
            sender,
            mut receiver,
        } = channel;
        let ping = P::ping().and_then(|ping| serde_json::to_string(&ping).ok());
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + config.ping_interval,
            config.ping_interval,
        );

        loop {
            tokio::select! {
                _ = stop_receiver.recv() => {
                    let _ = sender.send(Frame::Close {
                        code: NORMAL_CLOSE,
                        reason: "client closed".to_string(),
                    });
                    return None;
                }
                _ = ticker.tick() => {
                    if let Some(ping) = &ping {
                        let _ = sender.send(Frame::Text(ping.clone()));
                    }
                }
                event = receiver.recv() => {
                    match event {
                        Some(ChannelEvent::Text(text)) => {
                            match serde_json::from_str::<P::Incoming>(&text) {
                                Ok(message) => {
                                    tracing::trace!("SignalClient {} received {:?}", id, message);
                                    let _ = events.send(SignalEvent::Message(message));
                                }
                                Err(err) => {
                                    tracing::warn!("SignalClient {} dropped malformed message: {}", id, err);
                                }
                            }
                        }
                        Some(ChannelEvent::Closed { code, reason }) => {
                            return Some((code, reason));
                        }
                        None => {
                            return Some((ABNORMAL_CLOSE, "channel dropped".to_string()));
                        }
                    }
                }
            }
        }
    }
}

impl<P: SignalProtocol> Drop for SignalClient<P> {
    fn drop(&mut self) {
        let _ = self.stop_sender.send(true);
        tracing::debug!("SignalClient {} is dropped", self.id);
    }
}
