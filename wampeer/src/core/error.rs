use anyhow::Error;
use thiserror::Error;

use crate::core::{
    id::Id,
    types::{
        Dictionary,
        List,
        Value,
    },
    uri::Uri,
};

/// Error for a malformed wire message (bad arity, bad ID, bad URI, disallowed type in context).
///
/// Always fatal to the session that received the message: the session sends ABORT and closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
        }
    }
}

/// Error reported by the peer for a specific call, publish, subscribe, or register.
///
/// Recoverable: resolves only the one correlated pending request, never the session.
#[derive(Debug, Clone, Default, Error)]
#[error("{error}: {message}")]
pub struct ApplicationError {
    /// The error URI reported by the peer.
    pub error: Uri,
    /// A human-readable message, when the peer provided one.
    pub message: String,
    /// Positional error payload.
    pub arguments: List,
    /// Keyword error payload.
    pub arguments_keyword: Dictionary,
}

impl ApplicationError {
    pub fn new<S>(error: Uri, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            error,
            message: message.into(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
        }
    }
}

/// Error for the transport closing while an operation awaited a response.
///
/// Resolves all pending requests on the session and transitions the session to its closed state.
#[derive(Debug, Clone, Error)]
#[error("transport lost")]
pub struct TransportLost;

/// Error for issuing a session operation (call, register, subscribe, publish) outside of an
/// established session.
///
/// A local contract violation, not a wire error.
#[derive(Debug, Clone, Error)]
#[error("session is not established")]
pub struct NotEstablishedError;

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    ///
    /// WAMP defines standard URIs for not finding specific resource types. This error should only
    /// be used when the standard URI cannot be used.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed based on process configuration.
    #[error("{0}")]
    NotAllowed(String),
    /// The operation is not allowed based on user permissions.
    #[error("{0}")]
    PermissionDenied(String),
    /// Some internal error occurred.
    ///
    /// Should only be used when there is no other error variant that describes the error, since
    /// the message is very vague and not very useful for debugging.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are clearly defined in the WAMP standard and are reserved for errors that
/// peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// The peer is not authorized for the operation.
    #[error("not authorized")]
    NotAuthorized,
    /// Authentication was rejected by the router.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The call was canceled.
    #[error("canceled")]
    Canceled,
    /// The call timed out before a result arrived.
    #[error("timed out")]
    Timeout,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::NotAuthorized => "not_authorized",
            Self::AuthenticationFailed => "authentication_failed",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        }
    }
}

/// URI used for [`NotEstablishedError`] when it crosses a channel boundary.
const NOT_ESTABLISHED_URI: &str = "com.wampeer.error.not_established";

/// URI used for [`TransportLost`] when it crosses a channel boundary.
const TRANSPORT_LOST_URI: &str = "com.wampeer.error.transport_lost";

/// The WAMP error URI describing an error.
pub fn uri_for_error(error: &Error) -> Uri {
    if let Some(err) = error.downcast_ref::<InteractionError>() {
        return Uri::from_known(format!("wamp.error.{}", err.uri_component()));
    }
    if let Some(err) = error.downcast_ref::<BasicError>() {
        return Uri::from_known(format!("wamp.error.{}", err.uri_component()));
    }
    if let Some(err) = error.downcast_ref::<ApplicationError>() {
        return err.error.clone();
    }
    if error.downcast_ref::<ProtocolError>().is_some() {
        return Uri::from_known("wamp.error.protocol_violation");
    }
    if error.downcast_ref::<NotEstablishedError>().is_some() {
        return Uri::from_known(NOT_ESTABLISHED_URI);
    }
    if error.downcast_ref::<TransportLost>().is_some() {
        return Uri::from_known(TRANSPORT_LOST_URI);
    }
    Uri::from_known("wamp.error.internal")
}

/// Creates an [`struct@Error`] from a URI error reason and message.
pub fn error_from_uri_reason_and_message(reason: Uri, message: String) -> Error {
    match reason.as_ref() {
        "wamp.error.not_found" => BasicError::NotFound(message).into(),
        "wamp.error.invalid_argument" => BasicError::InvalidArgument(message).into(),
        "wamp.error.not_allowed" => BasicError::NotAllowed(message).into(),
        "wamp.error.permission_denied" => BasicError::PermissionDenied(message).into(),
        "wamp.error.protocol_violation" => InteractionError::ProtocolViolation(message).into(),
        "wamp.error.no_such_procedure" => InteractionError::NoSuchProcedure.into(),
        "wamp.error.procedure_already_exists" => InteractionError::ProcedureAlreadyExists.into(),
        "wamp.error.no_such_registration" => InteractionError::NoSuchRegistration.into(),
        "wamp.error.no_such_subscription" => InteractionError::NoSuchSubscription.into(),
        "wamp.error.no_such_realm" => InteractionError::NoSuchRealm.into(),
        "wamp.error.not_authorized" => InteractionError::NotAuthorized.into(),
        "wamp.error.authentication_failed" => InteractionError::AuthenticationFailed.into(),
        "wamp.error.canceled" => InteractionError::Canceled.into(),
        "wamp.error.timeout" => InteractionError::Timeout.into(),
        NOT_ESTABLISHED_URI => NotEstablishedError.into(),
        TRANSPORT_LOST_URI => TransportLost.into(),
        _ => ApplicationError::new(reason, message).into(),
    }
}

/// An error that can be transmitted over channels between the session task and its handles.
#[derive(Debug, Default, Clone)]
pub struct ChannelTransmittableError {
    pub reason: Uri,
    pub message: String,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub request_id: Option<Id>,
}

impl ChannelTransmittableError {
    /// Converts the error into a real error object that can be returned out.
    pub fn into_error(self) -> Error {
        let error = error_from_uri_reason_and_message(self.reason, self.message);
        match error.downcast::<ApplicationError>() {
            Ok(mut err) => {
                err.arguments = self.arguments;
                err.arguments_keyword = self.arguments_keyword;
                err.into()
            }
            Err(error) => error,
        }
    }
}

impl From<&Error> for ChannelTransmittableError {
    fn from(value: &Error) -> Self {
        let message = match value.downcast_ref::<ApplicationError>() {
            Some(err) => err.message.clone(),
            None => value.to_string(),
        };
        Self {
            reason: uri_for_error(value),
            message,
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
            request_id: None,
        }
    }
}

impl From<Error> for ChannelTransmittableError {
    fn from(value: Error) -> Self {
        Self::from(&value)
    }
}

/// Type alias for a channel-transmittable result.
///
/// Assumes `T` is channel-transmittable.
pub type ChannelTransmittableResult<T> = Result<T, ChannelTransmittableError>;

/// Extracts a human-readable message from an error's details dictionary.
pub fn message_from_details(details: &Dictionary) -> String {
    match details.get("message") {
        Some(Value::String(message)) => message.clone(),
        _ => String::default(),
    }
}

#[cfg(test)]
mod error_test {
    use crate::core::{
        error::{
            ApplicationError,
            InteractionError,
            error_from_uri_reason_and_message,
            uri_for_error,
        },
        uri::Uri,
    };

    #[test]
    fn maps_standard_uris_to_typed_errors() {
        assert_matches::assert_matches!(
            error_from_uri_reason_and_message(
                Uri::try_from("wamp.error.no_such_procedure").unwrap(),
                String::default(),
            )
            .downcast::<InteractionError>(),
            Ok(InteractionError::NoSuchProcedure)
        );
    }

    #[test]
    fn maps_unknown_uris_to_application_errors() {
        let error = error_from_uri_reason_and_message(
            Uri::try_from("com.myapp.error.bad_input").unwrap(),
            "bad input".to_owned(),
        );
        assert_matches::assert_matches!(error.downcast::<ApplicationError>(), Ok(err) => {
            assert_eq!(err.error.as_ref(), "com.myapp.error.bad_input");
            assert_eq!(err.message, "bad input");
        });
    }

    #[test]
    fn round_trips_error_uris() {
        let error = anyhow::Error::new(InteractionError::Canceled);
        assert_eq!(uri_for_error(&error).as_ref(), "wamp.error.canceled");
    }
}
