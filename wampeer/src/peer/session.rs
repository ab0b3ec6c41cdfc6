use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    info,
    trace,
    warn,
};
use tokio::sync::{
    broadcast,
    mpsc::UnboundedSender,
    oneshot,
};

use crate::{
    auth::ClientAuthenticator,
    core::{
        cancel::CallCancelMode,
        close::CloseReason,
        error::{
            ChannelTransmittableError,
            ChannelTransmittableResult,
            InteractionError,
            NotEstablishedError,
            TransportLost,
            message_from_details,
        },
        id::{
            Id,
            SequentialIdAllocator,
        },
        match_style::MatchStyle,
        publish_options::PublishOptions,
        roles::RouterRoles,
        types::{
            Bytes,
            Dictionary,
            List,
            Value,
            WampSerialize,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            CancelMessage,
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            HelloMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    peer::{
        peer::{
            Procedure,
            ProcedureOptions,
            RpcCall,
            RpcResult,
            Subscription,
            SubscriptionOptions,
        },
        requests::{
            CallRequest,
            PendingRequest,
            PendingRequests,
            PublishRequest,
            RegisterRequest,
            SubscribeRequest,
            UnregisterRequest,
            UnsubscribeRequest,
        },
    },
    transport::transport::TransportDetails,
};

/// Descriptive, immutable summary of an established session.
#[derive(Debug, Default, Clone)]
pub struct SessionDetails {
    /// The session ID assigned by the router.
    pub session: Id,
    /// The realm the session joined.
    pub realm: Option<Uri>,
    /// The authentication ID assigned by the router.
    pub authid: Option<String>,
    /// The authentication role assigned by the router.
    pub authrole: Option<String>,
    /// The authentication method the session was established with.
    pub authmethod: Option<String>,
    /// The router's agent name.
    pub agent: Option<String>,
    /// The roles the router announced.
    pub roles: RouterRoles,
}

/// A lifecycle event of a session, fanned out to observers.
///
/// Events are one-shot notifications, not queryable state.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The underlying transport connected.
    Connect { transport: TransportDetails },
    /// A session was established in a realm.
    Join { details: SessionDetails },
    /// The peer finished setting up after a join.
    Ready,
    /// The session left the realm.
    Leave { reason: Uri },
    /// The connection is gone. Unclean when the transport was lost without a GOODBYE exchange.
    Disconnect { clean: bool },
}

/// An event received from a subscribed topic.
#[derive(Debug, Default, Clone)]
pub struct ReceivedEvent {
    pub publication: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
    /// The concrete topic, present for pattern-based subscriptions.
    pub topic: Option<Uri>,
}

/// An event to publish to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

/// The result of an invocation, yielded back to the router.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
    /// Whether more results follow.
    pub progress: bool,
}

/// An invocation of a registered procedure, routed to the registration's handler.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: Id,
    pub registration_id: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
    /// The concrete procedure, present for pattern-based registrations.
    pub procedure: Option<Uri>,
    /// The disclosed caller session, when the router provides it.
    pub caller: Option<Id>,
    command_tx: UnboundedSender<SessionCommand>,
}

impl Invocation {
    /// Yields a result for the invocation.
    pub fn respond(&self, result: RpcYield) -> Result<()> {
        self.command_tx
            .send(SessionCommand::Yield {
                invocation: self.request_id,
                result,
            })
            .map_err(|_| Error::new(NotEstablishedError))
    }

    /// Responds to the invocation with an error.
    pub fn respond_error(&self, error: &Error) -> Result<()> {
        self.command_tx
            .send(SessionCommand::InvocationError {
                invocation: self.request_id,
                error: ChannelTransmittableError::from(error),
            })
            .map_err(|_| Error::new(NotEstablishedError))
    }
}

/// An interruption of a running invocation, triggered by a kill-mode cancel from the caller.
#[derive(Debug, Clone)]
pub struct Interrupt {
    pub request_id: Id,
    pub mode: CallCancelMode,
}

/// A message routed to a registered procedure's handler.
#[derive(Debug, Clone)]
pub enum ProcedureMessage {
    Invocation(Invocation),
    Interrupt(Interrupt),
}

/// Why a call is being canceled locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    /// The application asked for the cancel.
    User,
    /// The per-call timeout expired.
    Timeout,
}

/// A command issued to the session by its owning peer or by a handle backed by it.
pub(crate) enum SessionCommand {
    Hello {
        realm: Option<Uri>,
        details: Dictionary,
        authenticators: Vec<Arc<dyn ClientAuthenticator>>,
    },
    Goodbye {
        reason: CloseReason,
    },
    Call {
        request: Id,
        procedure: Uri,
        call: RpcCall,
        receive_progress: bool,
        result_tx: UnboundedSender<ChannelTransmittableResult<RpcResult>>,
    },
    CancelCall {
        request: Id,
        mode: CallCancelMode,
        reason: CancelReason,
    },
    Subscribe {
        request: Id,
        topic: WildcardUri,
        options: SubscriptionOptions,
        subscribed_tx: oneshot::Sender<ChannelTransmittableResult<Subscription>>,
    },
    Unsubscribe {
        request: Id,
        subscription: Id,
        unsubscribed_tx: oneshot::Sender<ChannelTransmittableResult<()>>,
    },
    Publish {
        request: Id,
        topic: Uri,
        options: PublishOptions,
        event: PublishedEvent,
        published_tx: oneshot::Sender<ChannelTransmittableResult<Option<Id>>>,
    },
    Register {
        request: Id,
        procedure: WildcardUri,
        options: ProcedureOptions,
        registered_tx: oneshot::Sender<ChannelTransmittableResult<Procedure>>,
    },
    Unregister {
        request: Id,
        registration: Id,
        unregistered_tx: oneshot::Sender<ChannelTransmittableResult<()>>,
    },
    Yield {
        invocation: Id,
        result: RpcYield,
    },
    InvocationError {
        invocation: Id,
        error: ChannelTransmittableError,
    },
}

#[derive(Debug, Clone)]
struct EstablishingSessionState {
    realm: Option<Uri>,
}

#[derive(Debug, Clone)]
struct EstablishedSessionState {
    session_id: Id,
    realm: Option<Uri>,
}

#[derive(Debug, Default, Clone)]
enum SessionState {
    #[default]
    Idle,
    HelloSent(EstablishingSessionState),
    Challenging(EstablishingSessionState),
    AuthenticateSent(EstablishingSessionState),
    Established(EstablishedSessionState),
    Closing(EstablishedSessionState),
    Closed,
    Aborted,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::HelloSent(_) => "hello_sent",
            Self::Challenging(_) => "challenging",
            Self::AuthenticateSent(_) => "authenticate_sent",
            Self::Established(_) => "established",
            Self::Closing(_) => "closing",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            // A closed session may be re-established over the same connection.
            (Self::Idle | Self::Closed, Self::HelloSent(_)) => true,
            (Self::HelloSent(_), Self::Challenging(_)) => true,
            (Self::HelloSent(_) | Self::AuthenticateSent(_), Self::Established(_)) => true,
            // A router may skip the challenge it announced, or issue another round.
            (Self::Challenging(_), Self::AuthenticateSent(_) | Self::Established(_)) => true,
            (Self::AuthenticateSent(_), Self::Challenging(_)) => true,
            (
                Self::HelloSent(_) | Self::Challenging(_) | Self::AuthenticateSent(_),
                Self::Aborted,
            ) => true,
            (Self::Established(_), Self::Closing(_)) => true,
            // Transport loss closes a session in any state.
            (_, Self::Closed) => true,
            _ => false,
        }
    }
}

struct SubscriptionState {
    topic: WildcardUri,
    event_tx: broadcast::Sender<ReceivedEvent>,
    active: Arc<AtomicBool>,
}

struct RegistrationState {
    procedure: WildcardUri,
    procedure_message_tx: broadcast::Sender<ProcedureMessage>,
    active: Arc<AtomicBool>,
}

/// A handle to a [`Session`] running in its own task.
pub(crate) struct SessionHandle {
    established_session_rx: broadcast::Receiver<ChannelTransmittableResult<SessionDetails>>,
    closed_session_rx: broadcast::Receiver<()>,
}

impl SessionHandle {
    pub fn established_session_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<SessionDetails>> {
        self.established_session_rx.resubscribe()
    }

    pub fn closed_session_rx(&self) -> broadcast::Receiver<()> {
        self.closed_session_rx.resubscribe()
    }
}

/// One session's protocol state machine.
///
/// Owns the pending request table and the registration/subscription tables exclusively; all
/// mutation happens on the session task, strictly sequentially with respect to the connection.
pub(crate) struct Session {
    name: String,
    service_message_tx: UnboundedSender<Message>,
    command_tx: UnboundedSender<SessionCommand>,
    id_allocator: Arc<SequentialIdAllocator>,
    state: SessionState,

    authenticators: Vec<Arc<dyn ClientAuthenticator>>,
    selected_authenticator: Option<usize>,

    requests: PendingRequests,
    subscriptions: ahash::HashMap<Id, SubscriptionState>,
    registrations: ahash::HashMap<Id, RegistrationState>,
    /// Invocation request ID to registration ID, for routing INTERRUPT.
    invocations: ahash::HashMap<Id, Id>,

    event_tx: broadcast::Sender<SessionEvent>,
    established_session_tx: broadcast::Sender<ChannelTransmittableResult<SessionDetails>>,
    closed_session_tx: broadcast::Sender<()>,
}

impl Session {
    pub fn new(
        name: String,
        service_message_tx: UnboundedSender<Message>,
        command_tx: UnboundedSender<SessionCommand>,
        id_allocator: Arc<SequentialIdAllocator>,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (established_session_tx, _) = broadcast::channel(16);
        let (closed_session_tx, _) = broadcast::channel(16);
        Self {
            name,
            service_message_tx,
            command_tx,
            id_allocator,
            state: SessionState::default(),
            authenticators: Vec::new(),
            selected_authenticator: None,
            requests: PendingRequests::default(),
            subscriptions: ahash::HashMap::default(),
            registrations: ahash::HashMap::default(),
            invocations: ahash::HashMap::default(),
            event_tx,
            established_session_tx,
            closed_session_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            established_session_rx: self.established_session_tx.subscribe(),
            closed_session_rx: self.closed_session_tx.subscribe(),
        }
    }

    fn established_state(&self) -> Option<&EstablishedSessionState> {
        match &self.state {
            SessionState::Established(state) => Some(state),
            _ => None,
        }
    }

    fn send_message(&self, message: Message) -> Result<()> {
        self.service_message_tx
            .send(message)
            .map_err(|_| Error::new(TransportLost))
    }

    fn transition_state(&mut self, state: SessionState) -> Result<()> {
        if !self.state.allowed_state_transition(&state) {
            return Err(Error::msg(format!(
                "invalid state transition from {} to {}",
                self.state.name(),
                state.name()
            )));
        }
        trace!(
            "Peer {} transitioned from {} to {}",
            self.name,
            self.state.name(),
            state.name()
        );
        self.state = state;
        if matches!(self.state, SessionState::Closed) {
            self.closed_session_tx.send(()).ok();
        }
        Ok(())
    }

    fn not_established() -> ChannelTransmittableError {
        ChannelTransmittableError::from(Error::new(NotEstablishedError))
    }

    /// Handles a command issued by the owning peer or one of its handles.
    pub async fn handle_command(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Hello {
                realm,
                details,
                authenticators,
            } => self.handle_hello_command(realm, details, authenticators).await,
            SessionCommand::Goodbye { reason } => self.handle_goodbye_command(reason),
            SessionCommand::Call {
                request,
                procedure,
                call,
                receive_progress,
                result_tx,
            } => self.handle_call_command(request, procedure, call, receive_progress, result_tx),
            SessionCommand::CancelCall {
                request,
                mode,
                reason,
            } => self.handle_cancel_command(request, mode, reason),
            SessionCommand::Subscribe {
                request,
                topic,
                options,
                subscribed_tx,
            } => self.handle_subscribe_command(request, topic, options, subscribed_tx),
            SessionCommand::Unsubscribe {
                request,
                subscription,
                unsubscribed_tx,
            } => self.handle_unsubscribe_command(request, subscription, unsubscribed_tx),
            SessionCommand::Publish {
                request,
                topic,
                options,
                event,
                published_tx,
            } => self.handle_publish_command(request, topic, options, event, published_tx),
            SessionCommand::Register {
                request,
                procedure,
                options,
                registered_tx,
            } => self.handle_register_command(request, procedure, options, registered_tx),
            SessionCommand::Unregister {
                request,
                registration,
                unregistered_tx,
            } => self.handle_unregister_command(request, registration, unregistered_tx),
            SessionCommand::Yield { invocation, result } => {
                self.handle_yield_command(invocation, result)
            }
            SessionCommand::InvocationError { invocation, error } => {
                self.handle_invocation_error_command(invocation, error)
            }
        }
    }

    async fn handle_hello_command(
        &mut self,
        realm: Option<Uri>,
        mut details: Dictionary,
        authenticators: Vec<Arc<dyn ClientAuthenticator>>,
    ) -> Result<()> {
        if !matches!(self.state, SessionState::Idle | SessionState::Closed) {
            self.established_session_tx
                .send(Err(ChannelTransmittableError::from(Error::msg(
                    "session establishment is already in progress",
                ))))
                .ok();
            return Ok(());
        }

        if !authenticators.is_empty() {
            details.insert(
                "authmethods".to_owned(),
                Value::List(List::from_iter(authenticators.iter().map(|authenticator| {
                    Value::String(authenticator.auth_method().into())
                }))),
            );
            details.insert(
                "authid".to_owned(),
                Value::String(authenticators[0].auth_id().to_owned()),
            );
            let mut extra = Dictionary::default();
            for authenticator in &authenticators {
                extra.extend(authenticator.hello_extra().await?);
            }
            if !extra.is_empty() {
                details.insert("authextra".to_owned(), Value::Dictionary(extra));
            }
        }
        self.authenticators = authenticators;
        self.selected_authenticator = None;

        self.send_message(Message::Hello(HelloMessage {
            realm: realm.clone(),
            details,
        }))?;
        self.transition_state(SessionState::HelloSent(EstablishingSessionState { realm }))
    }

    fn handle_goodbye_command(&mut self, reason: CloseReason) -> Result<()> {
        match &self.state {
            SessionState::Established(state) => {
                let state = state.clone();
                self.send_message(goodbye_with_close_reason(reason))?;
                self.event_tx
                    .send(SessionEvent::Leave {
                        reason: reason.uri(),
                    })
                    .ok();
                self.transition_state(SessionState::Closing(state))
            }
            SessionState::Closing(_) => Ok(()),
            _ => {
                // Nothing to close; unblock anything waiting for the session to end.
                warn!(
                    "Peer {} asked to leave the realm, but the session is {}",
                    self.name,
                    self.state.name()
                );
                self.closed_session_tx.send(()).ok();
                Ok(())
            }
        }
    }

    fn handle_call_command(
        &mut self,
        request: Id,
        procedure: Uri,
        call: RpcCall,
        receive_progress: bool,
        result_tx: UnboundedSender<ChannelTransmittableResult<RpcResult>>,
    ) -> Result<()> {
        if self.established_state().is_none() {
            result_tx.send(Err(Self::not_established())).ok();
            return Ok(());
        }
        let mut options = Dictionary::default();
        if receive_progress {
            options.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        self.requests.insert(
            request,
            PendingRequest::Call(CallRequest {
                result_tx,
                cancel_requested: false,
            }),
        );
        self.send_message(Message::Call(CallMessage {
            request,
            options,
            procedure,
            arguments: call.arguments,
            arguments_keyword: call.arguments_keyword,
            payload: call.payload,
        }))
    }

    fn handle_cancel_command(
        &mut self,
        request: Id,
        mode: CallCancelMode,
        reason: CancelReason,
    ) -> Result<()> {
        if !self.requests.contains(request) {
            // The call already resolved; the cancel lost the race.
            debug!("Peer {} canceled call {request}, which is already resolved", self.name);
            return Ok(());
        }
        self.send_message(Message::Cancel(CancelMessage {
            call_request: request,
            options: Dictionary::from_iter([("mode".to_owned(), Value::String(mode.into()))]),
        }))?;

        // Kill-mode user cancels await the router's acknowledgement; everything else resolves
        // immediately, and the router's eventual response loses the race and is discarded.
        if reason == CancelReason::User && mode == CallCancelMode::Kill {
            if let Some(call) = self.requests.call(request) {
                call.cancel_requested = true;
            }
            return Ok(());
        }
        let error = match reason {
            CancelReason::User => InteractionError::Canceled.into(),
            CancelReason::Timeout => InteractionError::Timeout.into(),
        };
        if let Some(pending) = self.requests.remove(request) {
            let mut error = ChannelTransmittableError::from(&error);
            error.request_id = Some(request);
            match pending {
                PendingRequest::Call(call) => {
                    call.result_tx.send(Err(error)).ok();
                }
                // Cancels only ever target calls.
                _ => warn!("Peer {} canceled request {request}, which is not a call", self.name),
            }
        }
        Ok(())
    }

    fn handle_subscribe_command(
        &mut self,
        request: Id,
        topic: WildcardUri,
        options: SubscriptionOptions,
        subscribed_tx: oneshot::Sender<ChannelTransmittableResult<Subscription>>,
    ) -> Result<()> {
        if self.established_state().is_none() {
            subscribed_tx.send(Err(Self::not_established())).ok();
            return Ok(());
        }
        let mut message_options = Dictionary::default();
        if options.match_style != MatchStyle::Exact {
            message_options.insert(
                "match".to_owned(),
                Value::String(options.match_style.into()),
            );
        }
        self.requests.insert(
            request,
            PendingRequest::Subscribe(SubscribeRequest {
                topic: topic.clone(),
                subscribed_tx,
            }),
        );
        self.send_message(Message::Subscribe(SubscribeMessage {
            request,
            options: message_options,
            topic,
        }))
    }

    fn handle_unsubscribe_command(
        &mut self,
        request: Id,
        subscription: Id,
        unsubscribed_tx: oneshot::Sender<ChannelTransmittableResult<()>>,
    ) -> Result<()> {
        if self.established_state().is_none() {
            unsubscribed_tx.send(Err(Self::not_established())).ok();
            return Ok(());
        }
        self.requests.insert(
            request,
            PendingRequest::Unsubscribe(UnsubscribeRequest {
                subscription,
                unsubscribed_tx,
            }),
        );
        self.send_message(Message::Unsubscribe(UnsubscribeMessage {
            request,
            subscribed_subscription: subscription,
            options: Dictionary::default(),
        }))
    }

    fn handle_publish_command(
        &mut self,
        request: Id,
        topic: Uri,
        options: PublishOptions,
        event: PublishedEvent,
        published_tx: oneshot::Sender<ChannelTransmittableResult<Option<Id>>>,
    ) -> Result<()> {
        if self.established_state().is_none() {
            published_tx.send(Err(Self::not_established())).ok();
            return Ok(());
        }
        let acknowledge = options.acknowledge;
        let options = match options.wamp_serialize() {
            Ok(Value::Dictionary(options)) => options,
            _ => {
                published_tx
                    .send(Err(ChannelTransmittableError::from(Error::msg(
                        "failed to serialize publish options",
                    ))))
                    .ok();
                return Ok(());
            }
        };
        self.send_message(Message::Publish(PublishMessage {
            request,
            options,
            topic,
            arguments: event.arguments,
            arguments_keyword: event.arguments_keyword,
            payload: event.payload,
        }))?;
        if acknowledge {
            self.requests
                .insert(request, PendingRequest::Publish(PublishRequest { published_tx }));
        } else {
            published_tx.send(Ok(None)).ok();
        }
        Ok(())
    }

    fn handle_register_command(
        &mut self,
        request: Id,
        procedure: WildcardUri,
        options: ProcedureOptions,
        registered_tx: oneshot::Sender<ChannelTransmittableResult<Procedure>>,
    ) -> Result<()> {
        if self.established_state().is_none() {
            registered_tx.send(Err(Self::not_established())).ok();
            return Ok(());
        }
        let mut message_options = Dictionary::default();
        if options.match_style != MatchStyle::Exact {
            message_options.insert(
                "match".to_owned(),
                Value::String(options.match_style.into()),
            );
        }
        if options.disclose_caller {
            message_options.insert("disclose_caller".to_owned(), Value::Bool(true));
        }
        self.requests.insert(
            request,
            PendingRequest::Register(RegisterRequest {
                procedure: procedure.clone(),
                registered_tx,
            }),
        );
        self.send_message(Message::Register(RegisterMessage {
            request,
            options: message_options,
            procedure,
        }))
    }

    fn handle_unregister_command(
        &mut self,
        request: Id,
        registration: Id,
        unregistered_tx: oneshot::Sender<ChannelTransmittableResult<()>>,
    ) -> Result<()> {
        if self.established_state().is_none() {
            unregistered_tx.send(Err(Self::not_established())).ok();
            return Ok(());
        }
        self.requests.insert(
            request,
            PendingRequest::Unregister(UnregisterRequest {
                registration,
                unregistered_tx,
            }),
        );
        self.send_message(Message::Unregister(UnregisterMessage {
            request,
            registered_registration: registration,
            options: Dictionary::default(),
        }))
    }

    fn handle_yield_command(&mut self, invocation: Id, result: RpcYield) -> Result<()> {
        if !result.progress {
            self.invocations.remove(&invocation);
        }
        let mut options = Dictionary::default();
        if result.progress {
            options.insert("progress".to_owned(), Value::Bool(true));
        }
        self.send_message(Message::Yield(YieldMessage {
            invocation_request: invocation,
            options,
            arguments: result.arguments,
            arguments_keyword: result.arguments_keyword,
            payload: result.payload,
        }))
    }

    fn handle_invocation_error_command(
        &mut self,
        invocation: Id,
        error: ChannelTransmittableError,
    ) -> Result<()> {
        self.invocations.remove(&invocation);
        self.send_message(Message::Error(ErrorMessage {
            request_type: InvocationMessage::TAG,
            request: invocation,
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String(error.message.clone()),
            )]),
            error: error.reason,
            arguments: error.arguments,
            arguments_keyword: error.arguments_keyword,
            payload: None,
        }))
    }

    /// Handles a message received from the router.
    ///
    /// A returned error is a protocol violation: the session has already sent ABORT, and the
    /// caller is expected to drop the connection.
    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("Peer {} received message: {message:?}", self.name);
        if let Err(err) = self.handle_message_on_state_machine(message).await {
            self.send_message(abort_message_for_error(&err)).ok();
            self.close_session(false);
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine(&mut self, message: Message) -> Result<()> {
        match &self.state {
            SessionState::Idle | SessionState::Closed | SessionState::Aborted => {
                Err(InteractionError::ProtocolViolation(format!(
                    "received {} message on a {} session",
                    message.message_name(),
                    self.state.name()
                ))
                .into())
            }
            SessionState::HelloSent(_)
            | SessionState::Challenging(_)
            | SessionState::AuthenticateSent(_) => self.handle_establishing(message).await,
            SessionState::Established(_) => self.handle_established(message),
            SessionState::Closing(_) => self.handle_closing(message),
        }
    }

    async fn handle_establishing(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Welcome(message) => self.establish(message).await,
            Message::Challenge(message) => self.handle_challenge(message).await,
            Message::Abort(message) => {
                let error = ChannelTransmittableError {
                    reason: message.reason.clone(),
                    message: message_from_details(&message.details),
                    ..Default::default()
                };
                warn!(
                    "Peer {} was aborted while establishing a session: {}",
                    self.name, message.reason
                );
                self.transition_state(SessionState::Aborted)?;
                self.established_session_tx.send(Err(error)).ok();
                Ok(())
            }
            message => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an establishing session",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn establish(&mut self, message: WelcomeMessage) -> Result<()> {
        let realm = match &self.state {
            SessionState::HelloSent(state)
            | SessionState::Challenging(state)
            | SessionState::AuthenticateSent(state) => state.realm.clone(),
            _ => None,
        };
        if let Some(index) = self.selected_authenticator {
            self.authenticators[index].verify_welcome(&message).await?;
        }
        let authmethod = self
            .selected_authenticator
            .map(|index| self.authenticators[index].auth_method().into());
        let details = SessionDetails {
            session: message.session,
            realm: realm.clone(),
            authid: dictionary_string(&message.details, "authid"),
            authrole: dictionary_string(&message.details, "authrole"),
            authmethod: dictionary_string(&message.details, "authmethod").or(authmethod),
            agent: dictionary_string(&message.details, "agent"),
            roles: RouterRoles::try_from(&message.details).map_err(Error::new)?,
        };
        self.transition_state(SessionState::Established(EstablishedSessionState {
            session_id: message.session,
            realm: realm.clone(),
        }))?;
        info!(
            "Peer {} started session {} on realm {}",
            self.name,
            message.session,
            realm.as_ref().map(Uri::to_string).unwrap_or_default()
        );
        self.established_session_tx.send(Ok(details.clone())).ok();
        self.event_tx.send(SessionEvent::Join { details }).ok();
        Ok(())
    }

    async fn handle_challenge(&mut self, message: ChallengeMessage) -> Result<()> {
        let establishing = match &self.state {
            SessionState::HelloSent(state) | SessionState::AuthenticateSent(state) => state.clone(),
            _ => {
                return Err(InteractionError::ProtocolViolation(
                    "received CHALLENGE message out of order".to_owned(),
                )
                .into());
            }
        };
        self.transition_state(SessionState::Challenging(establishing.clone()))?;

        let authenticator = self.authenticators.iter().position(|authenticator| {
            Into::<&'static str>::into(authenticator.auth_method()) == message.auth_method
        });
        let response = match authenticator {
            Some(index) => match self.authenticators[index].handle_challenge(&message).await {
                Ok(response) => {
                    self.selected_authenticator = Some(index);
                    response
                }
                Err(err) => return self.abort_establishment(err.context("authentication failed")),
            },
            None => {
                return self.abort_establishment(Error::msg(format!(
                    "router challenged with unsupported auth method {}",
                    message.auth_method
                )));
            }
        };
        self.send_message(Message::Authenticate(response))?;
        self.transition_state(SessionState::AuthenticateSent(establishing))
    }

    /// Aborts session establishment locally, such as when the configured authenticator fails.
    fn abort_establishment(&mut self, err: Error) -> Result<()> {
        self.send_message(abort_message_for_error(&err)).ok();
        self.transition_state(SessionState::Aborted)?;
        self.established_session_tx
            .send(Err(ChannelTransmittableError::from(&err)))
            .ok();
        Ok(())
    }

    fn handle_established(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Abort(message) => {
                warn!(
                    "Peer session {} for {} aborted by router: {message:?}",
                    self.established_state()
                        .map(|state| state.session_id)
                        .unwrap_or_default(),
                    self.name
                );
                self.close_session(false);
                Ok(())
            }
            Message::Goodbye(message) => {
                self.event_tx
                    .send(SessionEvent::Leave {
                        reason: message.reason,
                    })
                    .ok();
                self.send_message(goodbye_and_out())?;
                self.close_session(true);
                Ok(())
            }
            Message::Result(message) => self.handle_result(message),
            Message::Error(message) => self.handle_error(message),
            Message::Subscribed(message) => self.handle_subscribed(message),
            Message::Unsubscribed(message) => self.handle_unsubscribed(message),
            Message::Published(message) => self.handle_published(message),
            Message::Registered(message) => self.handle_registered(message),
            Message::Unregistered(message) => self.handle_unregistered(message),
            Message::Event(message) => self.handle_event(message),
            Message::Invocation(message) => self.handle_invocation(message),
            Message::Interrupt(message) => self.handle_interrupt(message),
            message => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_closing(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) => {
                self.close_session(true);
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a closing session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_result(&mut self, message: ResultMessage) -> Result<()> {
        let progress = message.progress();
        let result = RpcResult {
            arguments: message.arguments,
            arguments_keyword: message.arguments_keyword,
            payload: message.payload,
            progress,
        };
        if result.progress {
            // Progressive results multiplex onto the entry without resolving it.
            if let Some(call) = self.requests.call(message.call_request) {
                call.result_tx.send(Ok(result)).ok();
            } else {
                debug!(
                    "Peer {} discarding progressive result for unknown call {}",
                    self.name, message.call_request
                );
            }
            return Ok(());
        }
        match self.requests.remove(message.call_request) {
            Some(PendingRequest::Call(call)) => {
                call.result_tx.send(Ok(result)).ok();
            }
            Some(_) => {
                return Err(InteractionError::ProtocolViolation(format!(
                    "received RESULT for request {}, which is not a call",
                    message.call_request
                ))
                .into());
            }
            None => (),
        }
        Ok(())
    }

    fn handle_error(&mut self, message: ErrorMessage) -> Result<()> {
        let request_id = message.request;
        let error = ChannelTransmittableError {
            reason: message.error,
            message: message_from_details(&message.details),
            arguments: message.arguments,
            arguments_keyword: message.arguments_keyword,
            request_id: Some(request_id),
        };
        match self.requests.remove_for_error(request_id, message.request_type) {
            Some(PendingRequest::Call(call)) => {
                call.result_tx.send(Err(error)).ok();
            }
            Some(PendingRequest::Subscribe(request)) => {
                request.subscribed_tx.send(Err(error)).ok();
            }
            Some(PendingRequest::Unsubscribe(request)) => {
                request.unsubscribed_tx.send(Err(error)).ok();
            }
            Some(PendingRequest::Publish(request)) => {
                request.published_tx.send(Err(error)).ok();
            }
            Some(PendingRequest::Register(request)) => {
                request.registered_tx.send(Err(error)).ok();
            }
            Some(PendingRequest::Unregister(request)) => {
                request.unregistered_tx.send(Err(error)).ok();
            }
            None => (),
        }
        Ok(())
    }

    fn handle_subscribed(&mut self, message: SubscribedMessage) -> Result<()> {
        match self.requests.remove(message.subscribe_request) {
            Some(PendingRequest::Subscribe(request)) => {
                let (event_tx, event_rx) = broadcast::channel(16);
                let active = Arc::new(AtomicBool::new(true));
                self.subscriptions.insert(
                    message.subscription,
                    SubscriptionState {
                        topic: request.topic.clone(),
                        event_tx,
                        active: active.clone(),
                    },
                );
                request
                    .subscribed_tx
                    .send(Ok(Subscription {
                        id: message.subscription,
                        topic: request.topic,
                        event_rx,
                        active,
                        command_tx: self.command_tx.clone(),
                        id_allocator: self.id_allocator.clone(),
                    }))
                    .ok();
                Ok(())
            }
            Some(_) => Err(InteractionError::ProtocolViolation(format!(
                "received SUBSCRIBED for request {}, which is not a subscribe",
                message.subscribe_request
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn handle_unsubscribed(&mut self, message: UnsubscribedMessage) -> Result<()> {
        if let Some(subscription) = message.revoked_subscription() {
            // Router-triggered revocation deactivates the handle without resolving any request.
            info!(
                "Peer {} subscription {subscription} was revoked by the router",
                self.name
            );
            self.deactivate_subscription(subscription);
            return Ok(());
        }
        match self.requests.remove(message.unsubscribe_request) {
            Some(PendingRequest::Unsubscribe(request)) => {
                self.deactivate_subscription(request.subscription);
                request.unsubscribed_tx.send(Ok(())).ok();
                Ok(())
            }
            Some(_) => Err(InteractionError::ProtocolViolation(format!(
                "received UNSUBSCRIBED for request {}, which is not an unsubscribe",
                message.unsubscribe_request
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn handle_published(&mut self, message: PublishedMessage) -> Result<()> {
        match self.requests.remove(message.publish_request) {
            Some(PendingRequest::Publish(request)) => {
                request.published_tx.send(Ok(Some(message.publication))).ok();
                Ok(())
            }
            Some(_) => Err(InteractionError::ProtocolViolation(format!(
                "received PUBLISHED for request {}, which is not a publish",
                message.publish_request
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn handle_registered(&mut self, message: RegisteredMessage) -> Result<()> {
        match self.requests.remove(message.register_request) {
            Some(PendingRequest::Register(request)) => {
                let (procedure_message_tx, procedure_message_rx) = broadcast::channel(16);
                let active = Arc::new(AtomicBool::new(true));
                self.registrations.insert(
                    message.registration,
                    RegistrationState {
                        procedure: request.procedure.clone(),
                        procedure_message_tx,
                        active: active.clone(),
                    },
                );
                request
                    .registered_tx
                    .send(Ok(Procedure {
                        id: message.registration,
                        procedure: request.procedure,
                        procedure_message_rx,
                        active,
                        command_tx: self.command_tx.clone(),
                        id_allocator: self.id_allocator.clone(),
                    }))
                    .ok();
                Ok(())
            }
            Some(_) => Err(InteractionError::ProtocolViolation(format!(
                "received REGISTERED for request {}, which is not a register",
                message.register_request
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn handle_unregistered(&mut self, message: UnregisteredMessage) -> Result<()> {
        if let Some(registration) = message.revoked_registration() {
            info!(
                "Peer {} registration {registration} was revoked by the router",
                self.name
            );
            self.deactivate_registration(registration);
            return Ok(());
        }
        match self.requests.remove(message.unregister_request) {
            Some(PendingRequest::Unregister(request)) => {
                self.deactivate_registration(request.registration);
                request.unregistered_tx.send(Ok(())).ok();
                Ok(())
            }
            Some(_) => Err(InteractionError::ProtocolViolation(format!(
                "received UNREGISTERED for request {}, which is not an unregister",
                message.unregister_request
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn handle_event(&mut self, message: EventMessage) -> Result<()> {
        match self.subscriptions.get(&message.subscribed_subscription) {
            Some(subscription) => {
                let topic = message
                    .details
                    .get("topic")
                    .and_then(Value::string)
                    .map(Uri::from_known);
                subscription
                    .event_tx
                    .send(ReceivedEvent {
                        publication: message.published_publication,
                        arguments: message.arguments,
                        arguments_keyword: message.arguments_keyword,
                        payload: message.payload,
                        topic,
                    })
                    .ok();
            }
            None => {
                // An event may legitimately race an unsubscribe that already resolved.
                debug!(
                    "Peer {} discarding event for unknown subscription {}",
                    self.name, message.subscribed_subscription
                );
            }
        }
        Ok(())
    }

    fn handle_invocation(&mut self, message: InvocationMessage) -> Result<()> {
        let registration = match self.registrations.get(&message.registered_registration) {
            Some(registration) => registration,
            None => {
                let err = InteractionError::NoSuchRegistration.into();
                return self.send_message(error_for_request(
                    &Message::Invocation(message),
                    &err,
                ));
            }
        };
        let procedure = message
            .details
            .get("procedure")
            .and_then(Value::string)
            .map(Uri::from_known);
        let caller = message
            .details
            .get("caller")
            .and_then(Value::integer)
            .and_then(|id| Id::try_from(id).ok());
        self.invocations
            .insert(message.request, message.registered_registration);
        registration
            .procedure_message_tx
            .send(ProcedureMessage::Invocation(Invocation {
                request_id: message.request,
                registration_id: message.registered_registration,
                arguments: message.arguments,
                arguments_keyword: message.arguments_keyword,
                payload: message.payload,
                procedure,
                caller,
                command_tx: self.command_tx.clone(),
            }))
            .ok();
        Ok(())
    }

    fn handle_interrupt(&mut self, message: InterruptMessage) -> Result<()> {
        let registration = match self.invocations.get(&message.invocation_request) {
            Some(registration) => *registration,
            None => {
                debug!(
                    "Peer {} discarding INTERRUPT for unknown invocation {}",
                    self.name, message.invocation_request
                );
                return Ok(());
            }
        };
        let mode = message
            .options
            .get("mode")
            .and_then(Value::string)
            .and_then(|mode| CallCancelMode::try_from(mode).ok())
            .unwrap_or(CallCancelMode::KillNoWait);
        if let Some(registration) = self.registrations.get(&registration) {
            registration
                .procedure_message_tx
                .send(ProcedureMessage::Interrupt(Interrupt {
                    request_id: message.invocation_request,
                    mode,
                }))
                .ok();
        }
        Ok(())
    }

    fn deactivate_subscription(&mut self, subscription: Id) {
        if let Some(state) = self.subscriptions.remove(&subscription) {
            state.active.store(false, Ordering::SeqCst);
        }
    }

    fn deactivate_registration(&mut self, registration: Id) {
        if let Some(state) = self.registrations.remove(&registration) {
            state.active.store(false, Ordering::SeqCst);
        }
    }

    /// Tears down the session after the connection ended or the GOODBYE handshake completed.
    ///
    /// Resolves every pending request, deactivates every handle, and fires the disconnect event
    /// exactly once.
    pub fn close_session(&mut self, clean: bool) {
        if matches!(self.state, SessionState::Closed | SessionState::Aborted) {
            return;
        }
        let pre_established = matches!(
            self.state,
            SessionState::HelloSent(_)
                | SessionState::Challenging(_)
                | SessionState::AuthenticateSent(_)
        );
        if pre_established {
            self.established_session_tx
                .send(Err(ChannelTransmittableError::from(Error::new(
                    TransportLost,
                ))))
                .ok();
        }
        self.requests.resolve_all_with_transport_lost();
        for (_, state) in self.subscriptions.drain() {
            state.active.store(false, Ordering::SeqCst);
        }
        for (_, state) in self.registrations.drain() {
            state.active.store(false, Ordering::SeqCst);
        }
        self.invocations.clear();
        self.authenticators.clear();
        self.selected_authenticator = None;
        self.transition_state(SessionState::Closed).ok();
        self.event_tx.send(SessionEvent::Disconnect { clean }).ok();
    }

    /// Handles the transport being lost out from under the session.
    pub fn handle_transport_lost(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Aborted) {
            return;
        }
        info!("Peer {} lost its transport", self.name);
        self.close_session(false);
    }
}

fn dictionary_string(dictionary: &Dictionary, key: &str) -> Option<String> {
    dictionary.get(key).and_then(Value::string).map(str::to_owned)
}
