use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{oneshot, watch};

use crate::{
    error::{Error, RouterErrorKind, SignalError, SignalErrorKind},
    signaling::{
        client::SignalClient,
        router_message::{RouterProtocol, RouterRequest, RouterResponse, TransportDirection},
    },
};

/// Response a pending request waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expect {
    Joined,
    TransportCreated(TransportDirection),
    TransportConnected(String),
    Produced,
    /// Keyed by producer id.
    Consumed(String),
    ConsumerResumed(String),
}

impl Expect {
    fn matches(&self, response: &RouterResponse) -> bool {
        match (self, response) {
            (Expect::Joined, RouterResponse::Joined { .. }) => true,
            (Expect::TransportCreated(expected), RouterResponse::TransportCreated { direction, .. }) => {
                expected == direction
            }
            (Expect::TransportConnected(expected), RouterResponse::TransportConnected { transport_id }) => {
                expected == transport_id
            }
            (Expect::Produced, RouterResponse::Produced { .. }) => true,
            (Expect::Consumed(expected), RouterResponse::Consumed { producer_id, .. }) => {
                expected == producer_id
            }
            (Expect::ConsumerResumed(expected), RouterResponse::ConsumerResumed { consumer_id }) => {
                consumer_id.as_ref().map(|id| id == expected).unwrap_or(true)
            }
            _ => false,
        }
    }
}

type Reply = oneshot::Sender<Result<RouterResponse, Error>>;

/// Correlates router responses with requests in FIFO order.
#[derive(Debug, Default)]
pub(crate) struct RouterRequester {
    pending: VecDeque<(Expect, Reply)>,
}

impl RouterRequester {
    pub fn register(&mut self, expect: Expect) -> oneshot::Receiver<Result<RouterResponse, Error>> {
        let (reply, receiver) = oneshot::channel();
        self.pending.push_back((expect, reply));
        receiver
    }

    /// Hands `response` to the oldest matching request. Unmatched responses are returned as notifications.
    pub fn resolve(&mut self, response: RouterResponse) -> Option<RouterResponse> {
        // Requests whose caller went away are dropped first.
        self.pending.retain(|(_, reply)| !reply.is_closed());
        if let RouterResponse::Error { detail } = &response {
            if let Some((expect, reply)) = self.pending.pop_front() {
                let message = detail
                    .clone()
                    .unwrap_or_else(|| format!("Router rejected {:?}", expect));
                let _ = reply.send(Err(Error::new_router(
                    message,
                    RouterErrorKind::RequestFailedError,
                )));
                return None;
            }
            return Some(response);
        }
        let position = self
            .pending
            .iter()
            .position(|(expect, _)| expect.matches(&response));
        match position.and_then(|position| self.pending.remove(position)) {
            Some((_, reply)) => {
                let _ = reply.send(Ok(response));
                None
            }
            None => Some(response),
        }
    }

    pub fn fail_all(&mut self, err: &SignalError) {
        for (_, reply) in self.pending.drain(..) {
            let _ = reply.send(Err(Error::SignalError(err.clone())));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkStatus {
    Waiting,
    /// Counts the opens of the underlying channel.
    Open(u64),
    Gone(SignalErrorKind, String),
}

/// Request/response view over the router signal channel.
#[derive(Debug)]
pub(crate) struct RouterLink {
    client: SignalClient<RouterProtocol>,
    requester: Arc<Mutex<RouterRequester>>,
    status: watch::Receiver<LinkStatus>,
    timeout: Duration,
}

impl RouterLink {
    pub fn new(
        client: SignalClient<RouterProtocol>,
        requester: Arc<Mutex<RouterRequester>>,
        status: watch::Receiver<LinkStatus>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            requester,
            status,
            timeout,
        }
    }

    /// Waits until the channel is open, or fails once it is gone for good.
    pub async fn wait_open(&self) -> Result<(), Error> {
        let mut status = self.status.clone();
        let current = status
            .wait_for(|status| *status != LinkStatus::Waiting)
            .await
            .map_err(|_| closed("Router link is dropped".to_string()))?
            .clone();
        match current {
            LinkStatus::Gone(kind, message) => Err(Error::new_signal(message, kind)),
            _ => Ok(()),
        }
    }

    /// Open count of the channel, while it is open.
    pub fn epoch(&self) -> Option<u64> {
        match *self.status.borrow() {
            LinkStatus::Open(epoch) => Some(epoch),
            _ => None,
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(*self.status.borrow(), LinkStatus::Gone(_, _))
    }

    /// Waits until the channel opened as `epoch` has gone away.
    pub async fn wait_left(&self, epoch: u64) {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|status| *status != LinkStatus::Open(epoch))
            .await;
    }

    /// Fire-and-forget message.
    pub fn notify(&self, request: RouterRequest) {
        self.client.send(&request);
    }

    pub async fn request(
        &self,
        request: RouterRequest,
        expect: Expect,
    ) -> Result<RouterResponse, Error> {
        if !self.client.is_open() {
            return Err(closed(format!("Router channel is not open for {:?}", expect)));
        }
        let receiver = match self.requester.lock() {
            Ok(mut requester) => requester.register(expect.clone()),
            Err(_) => return Err(closed("Router requester is poisoned".to_string())),
        };
        tracing::debug!("RouterLink sends {:?}", request);
        self.client.send(&request);
        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(closed(format!("Router link closed while waiting for {:?}", expect))),
            Err(_) => Err(Error::new_router(
                format!("No response for {:?} within {:?}", expect, self.timeout),
                RouterErrorKind::RequestFailedError,
            )),
        }
    }

    pub fn close(&self) {
        self.client.close();
    }
}

pub(crate) fn closed(message: String) -> Error {
    Error::new_signal(message, SignalErrorKind::ClosedError)
}
