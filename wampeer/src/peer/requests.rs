use log::debug;
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::{
    core::{
        error::{
            ChannelTransmittableError,
            ChannelTransmittableResult,
            TransportLost,
        },
        id::Id,
        types::Integer,
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::{
        CallMessage,
        PublishMessage,
        RegisterMessage,
        SubscribeMessage,
        UnregisterMessage,
        UnsubscribeMessage,
    },
    peer::peer::{
        Procedure,
        RpcResult,
        Subscription,
    },
};

/// An outstanding procedure call, resolved by RESULT or ERROR.
///
/// Progressive results multiplex onto the one entry; only a terminal result (or error, or local
/// cancel) resolves and removes it.
pub(crate) struct CallRequest {
    pub result_tx: mpsc::UnboundedSender<ChannelTransmittableResult<RpcResult>>,
    /// Set when a kill-mode cancel was issued and the router's acknowledgement is awaited.
    pub cancel_requested: bool,
}

/// An outstanding subscribe request, resolved by SUBSCRIBED or ERROR.
pub(crate) struct SubscribeRequest {
    pub topic: WildcardUri,
    pub subscribed_tx: oneshot::Sender<ChannelTransmittableResult<Subscription>>,
}

/// An outstanding unsubscribe request, resolved by UNSUBSCRIBED or ERROR.
pub(crate) struct UnsubscribeRequest {
    pub subscription: Id,
    pub unsubscribed_tx: oneshot::Sender<ChannelTransmittableResult<()>>,
}

/// An outstanding acknowledged publish, resolved by PUBLISHED or ERROR.
pub(crate) struct PublishRequest {
    pub published_tx: oneshot::Sender<ChannelTransmittableResult<Option<Id>>>,
}

/// An outstanding register request, resolved by REGISTERED or ERROR.
pub(crate) struct RegisterRequest {
    pub procedure: WildcardUri,
    pub registered_tx: oneshot::Sender<ChannelTransmittableResult<Procedure>>,
}

/// An outstanding unregister request, resolved by UNREGISTERED or ERROR.
pub(crate) struct UnregisterRequest {
    pub registration: Id,
    pub unregistered_tx: oneshot::Sender<ChannelTransmittableResult<()>>,
}

/// A request awaiting its correlated response.
pub(crate) enum PendingRequest {
    Call(CallRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    Register(RegisterRequest),
    Unregister(UnregisterRequest),
}

impl PendingRequest {
    /// The message type tag that an ERROR for this request must carry.
    fn request_type(&self) -> Integer {
        match self {
            Self::Call(_) => CallMessage::TAG,
            Self::Subscribe(_) => SubscribeMessage::TAG,
            Self::Unsubscribe(_) => UnsubscribeMessage::TAG,
            Self::Publish(_) => PublishMessage::TAG,
            Self::Register(_) => RegisterMessage::TAG,
            Self::Unregister(_) => UnregisterMessage::TAG,
        }
    }

    /// Resolves the request with an error, consuming it.
    fn reject(self, error: ChannelTransmittableError) {
        match self {
            Self::Call(request) => {
                request.result_tx.send(Err(error)).ok();
            }
            Self::Subscribe(request) => {
                request.subscribed_tx.send(Err(error)).ok();
            }
            Self::Unsubscribe(request) => {
                request.unsubscribed_tx.send(Err(error)).ok();
            }
            Self::Publish(request) => {
                request.published_tx.send(Err(error)).ok();
            }
            Self::Register(request) => {
                request.registered_tx.send(Err(error)).ok();
            }
            Self::Unregister(request) => {
                request.unregistered_tx.send(Err(error)).ok();
            }
        }
    }
}

/// The table of requests awaiting correlated responses on one session.
///
/// Owned exclusively by the session: each request ID is resolved exactly once, by whichever of
/// the matching response, a matching ERROR, or a local cancel the session observes first. Later
/// resolutions for the same ID find no entry and are discarded.
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: ahash::HashMap<Id, PendingRequest>,
}

impl PendingRequests {
    /// Tracks a new outstanding request.
    ///
    /// Request IDs are allocated sequentially per session, so an occupied slot means the ID space
    /// wrapped around a request that never resolved.
    pub fn insert(&mut self, request_id: Id, request: PendingRequest) {
        if self.requests.insert(request_id, request).is_some() {
            debug!("Replaced stale pending request {request_id}");
        }
    }

    /// Removes the entry for the request ID, if the response is the first resolution to arrive.
    ///
    /// A missing entry is not an error: the peer may have already committed to completing the
    /// request when a local cancel resolved it.
    pub fn remove(&mut self, request_id: Id) -> Option<PendingRequest> {
        let request = self.requests.remove(&request_id);
        if request.is_none() {
            debug!("Discarding response for request {request_id}, which is already resolved");
        }
        request
    }

    /// The call entry for the request ID, left in the table for progressive results.
    pub fn call(&mut self, request_id: Id) -> Option<&mut CallRequest> {
        match self.requests.get_mut(&request_id) {
            Some(PendingRequest::Call(request)) => Some(request),
            _ => None,
        }
    }

    /// Whether the table holds an entry for the request ID.
    pub fn contains(&self, request_id: Id) -> bool {
        self.requests.contains_key(&request_id)
    }

    /// Resolves the request matching an ERROR message, checking the error's request type against
    /// the entry's kind.
    ///
    /// Returns the entry when it matched, or `None` when no entry was found or the kind
    /// mismatched (in which case the entry is restored).
    pub fn remove_for_error(&mut self, request_id: Id, request_type: Integer) -> Option<PendingRequest> {
        let request = self.remove(request_id)?;
        if request.request_type() != request_type {
            debug!(
                "Discarding ERROR for request {request_id} with mismatched request type {request_type}"
            );
            self.requests.insert(request_id, request);
            return None;
        }
        Some(request)
    }

    /// Resolves every outstanding request with [`TransportLost`], emptying the table.
    pub fn resolve_all_with_transport_lost(&mut self) {
        for (request_id, request) in self.requests.drain() {
            let mut error = ChannelTransmittableError::from(anyhow::Error::new(TransportLost));
            error.request_id = Some(request_id);
            request.reject(error);
        }
    }

    /// Resolves every outstanding request with the given reason, emptying the table.
    pub fn resolve_all_with_reason(&mut self, reason: &Uri, message: &str) {
        for (request_id, request) in self.requests.drain() {
            request.reject(ChannelTransmittableError {
                reason: reason.clone(),
                message: message.to_owned(),
                request_id: Some(request_id),
                ..Default::default()
            });
        }
    }
}
