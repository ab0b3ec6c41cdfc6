use anyhow::Result;

use crate::core::{
    cancel::CallCancelMode,
    error::{
        BasicError,
        ProtocolError,
    },
    id::Id,
    match_style::MatchStyle,
    realm::validate_realm_name,
    types::{
        Bytes,
        Dictionary,
        Integer,
        List,
        Value,
    },
    uri::{
        EmptyComponentPolicy,
        Uri,
        WildcardUri,
        validate_uri,
    },
};

/// Metadata recording the chain of sessions a message was relayed through.
///
/// Entries are constructed by the application (or an intermediary router), so malformed entries
/// are rejected when the carrying message is marshaled, not parsed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ForwardFor {
    pub session: Id,
    pub authid: Option<String>,
    pub authrole: String,
}

impl ForwardFor {
    fn from_value(value: &Value) -> Result<Self, String> {
        let entry = match value.dictionary() {
            Some(entry) => entry,
            None => return Err("entry must be a dictionary".to_owned()),
        };
        let session = match entry.get("session").and_then(Value::integer) {
            Some(session) => {
                Id::try_from(session).map_err(|_| "session is out of range".to_owned())?
            }
            None => return Err("entry must carry an integer session".to_owned()),
        };
        let authid = match entry.get("authid") {
            Some(Value::String(authid)) => Some(authid.clone()),
            Some(Value::Null) => None,
            Some(_) => return Err("authid must be a string or null".to_owned()),
            None => return Err("entry must carry an authid".to_owned()),
        };
        let authrole = match entry.get("authrole") {
            Some(Value::String(authrole)) => authrole.clone(),
            _ => return Err("entry must carry a string authrole".to_owned()),
        };
        Ok(Self {
            session,
            authid,
            authrole,
        })
    }

    /// The entry as a dictionary value, for embedding into message options.
    pub fn to_value(&self) -> Value {
        let mut entry = Dictionary::default();
        entry.insert("session".to_owned(), Value::Integer(self.session.value()));
        entry.insert(
            "authid".to_owned(),
            match &self.authid {
                Some(authid) => Value::String(authid.clone()),
                None => Value::Null,
            },
        );
        entry.insert("authrole".to_owned(), Value::String(self.authrole.clone()));
        Value::Dictionary(entry)
    }
}

fn check_arity(name: &'static str, len: usize, min: usize, max: usize) -> Result<(), ProtocolError> {
    if len < min || len > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(ProtocolError::new(format!(
            "{name} message has invalid length {len} (expected {expected})"
        )));
    }
    Ok(())
}

/// Sequential access to the elements of a message array after the type tag, with typed,
/// field-naming validation errors.
struct MessageFields {
    fields: std::vec::IntoIter<Value>,
}

impl MessageFields {
    fn new(list: List) -> Self {
        Self {
            fields: list.into_iter(),
        }
    }

    fn remaining(&self) -> usize {
        self.fields.len()
    }

    fn next(&mut self, field: &str) -> Result<Value, ProtocolError> {
        self.fields
            .next()
            .ok_or_else(|| ProtocolError::new(format!("{field} is missing")))
    }

    fn id(&mut self, field: &str) -> Result<Id, ProtocolError> {
        let value = self.next(field)?;
        let value = value
            .integer()
            .ok_or_else(|| ProtocolError::new(format!("{field} must be an integer")))?;
        Id::try_from(value).map_err(|_| ProtocolError::new(format!("{field} is out of range")))
    }

    fn integer(&mut self, field: &str) -> Result<Integer, ProtocolError> {
        self.next(field)?
            .integer()
            .ok_or_else(|| ProtocolError::new(format!("{field} must be an integer")))
    }

    fn string(&mut self, field: &str) -> Result<String, ProtocolError> {
        match self.next(field)? {
            Value::String(value) => Ok(value),
            _ => Err(ProtocolError::new(format!("{field} must be a string"))),
        }
    }

    fn dict(&mut self, field: &str) -> Result<Dictionary, ProtocolError> {
        match self.next(field)? {
            Value::Dictionary(value) => Ok(value),
            _ => Err(ProtocolError::new(format!("{field} must be a dictionary"))),
        }
    }

    fn optional_dict(&mut self, field: &str) -> Result<Dictionary, ProtocolError> {
        if self.remaining() == 0 {
            return Ok(Dictionary::default());
        }
        self.dict(field)
    }

    fn uri(&mut self, field: &str, empty: EmptyComponentPolicy) -> Result<WildcardUri, ProtocolError> {
        let value = self.string(field)?;
        validate_uri(&value, false, empty)
            .map_err(|_| ProtocolError::new(format!("{field} is not a valid URI")))?;
        Ok(WildcardUri::from_known(value))
    }

    fn exact_uri(&mut self, field: &str) -> Result<Uri, ProtocolError> {
        let value = self.string(field)?;
        validate_uri(&value, false, EmptyComponentPolicy::Disallowed)
            .map_err(|_| ProtocolError::new(format!("{field} is not a valid URI")))?;
        Ok(Uri::from_known(value))
    }

    fn realm(&mut self, field: &str) -> Result<Option<Uri>, ProtocolError> {
        match self.next(field)? {
            Value::Null => Ok(None),
            Value::String(value) => {
                validate_realm_name(&value)
                    .map_err(|_| ProtocolError::new(format!("{field} is not a valid realm name")))?;
                Ok(Some(Uri::from_known(value)))
            }
            _ => Err(ProtocolError::new(format!(
                "{field} must be a realm name or null"
            ))),
        }
    }
}

/// Validates the types of well-known keys of an options (or details) dictionary.
///
/// Unknown keys are tolerated for extensibility; the dictionary is string-keyed by construction.
fn validate_option_types(field: &'static str, options: &Dictionary) -> Result<(), ProtocolError> {
    for key in [
        "progress",
        "receive_progress",
        "acknowledge",
        "exclude_me",
        "disclose_me",
        "disclose_caller",
        "retain",
    ] {
        if let Some(value) = options.get(key) {
            if value.bool().is_none() {
                return Err(ProtocolError::new(format!(
                    "{field}.{key} must be a bool"
                )));
            }
        }
    }
    if let Some(value) = options.get("timeout") {
        if value.integer().is_none() {
            return Err(ProtocolError::new(format!("{field}.timeout must be an integer")));
        }
    }
    for key in ["enc_algo", "enc_key", "enc_serializer"] {
        if let Some(value) = options.get(key) {
            if value.string().is_none() {
                return Err(ProtocolError::new(format!(
                    "{field}.{key} must be a string"
                )));
            }
        }
    }
    if let Some(value) = options.get("match") {
        let value = value
            .string()
            .ok_or_else(|| ProtocolError::new(format!("{field}.match must be a string")))?;
        MatchStyle::try_from(value)
            .map_err(|_| ProtocolError::new(format!("{field}.match is not a valid match style")))?;
    }
    if let Some(value) = options.get("mode") {
        let value = value
            .string()
            .ok_or_else(|| ProtocolError::new(format!("{field}.mode must be a string")))?;
        CallCancelMode::try_from(value)
            .map_err(|_| ProtocolError::new(format!("{field}.mode is not a valid cancel mode")))?;
    }
    if let Some(value) = options.get("forward_for") {
        let entries = value
            .list()
            .ok_or_else(|| ProtocolError::new(format!("{field}.forward_for must be a list")))?;
        for entry in entries {
            ForwardFor::from_value(entry).map_err(|err| {
                ProtocolError::new(format!("{field}.forward_for is malformed: {err}"))
            })?;
        }
    }
    Ok(())
}

/// The empty-component policy for a URI, selected by the message's own match option.
fn uri_policy(options: &Dictionary) -> EmptyComponentPolicy {
    match options.get("match").and_then(Value::string) {
        Some("prefix") => EmptyComponentPolicy::AllowLast,
        Some("wildcard") => EmptyComponentPolicy::Allowed,
        _ => EmptyComponentPolicy::Disallowed,
    }
}

fn has_payload_transparency_options(options: &Dictionary) -> bool {
    ["enc_algo", "enc_key", "enc_serializer"]
        .iter()
        .any(|key| options.contains_key(*key))
}

/// Parses the trailing application payload elements of a message array.
///
/// The trailing elements are either `(arguments, arguments_keyword?)` or a single opaque payload
/// byte string. Disambiguation is by arity first, then element type: only the single-trailing-
/// element form can be a payload.
fn parse_payload_fields(
    fields: &mut MessageFields,
    name: &'static str,
    options_field: &'static str,
    options: &Dictionary,
) -> Result<(List, Dictionary, Option<Bytes>), ProtocolError> {
    match fields.remaining() {
        0 => {
            if has_payload_transparency_options(options) {
                return Err(ProtocolError::new(format!(
                    "{options_field} carries payload transparency fields without a payload"
                )));
            }
            Ok((List::default(), Dictionary::default(), None))
        }
        1 => match fields.next(&format!("{name}.Arguments"))? {
            Value::List(arguments) => {
                if has_payload_transparency_options(options) {
                    return Err(ProtocolError::new(format!(
                        "{options_field} carries payload transparency fields without a payload"
                    )));
                }
                Ok((arguments, Dictionary::default(), None))
            }
            Value::Bytes(payload) => Ok((List::default(), Dictionary::default(), Some(payload))),
            _ => Err(ProtocolError::new(format!(
                "{name}.Arguments must be a list or a payload byte string"
            ))),
        },
        _ => {
            if has_payload_transparency_options(options) {
                return Err(ProtocolError::new(format!(
                    "{options_field} carries payload transparency fields without a payload"
                )));
            }
            let arguments = match fields.next(&format!("{name}.Arguments"))? {
                Value::List(arguments) => arguments,
                _ => {
                    return Err(ProtocolError::new(format!(
                        "{name}.Arguments must be a list"
                    )));
                }
            };
            let arguments_keyword = match fields.next(&format!("{name}.ArgumentsKw"))? {
                Value::Dictionary(arguments_keyword) => arguments_keyword,
                _ => {
                    return Err(ProtocolError::new(format!(
                        "{name}.ArgumentsKw must be a dictionary"
                    )));
                }
            };
            Ok((arguments, arguments_keyword, None))
        }
    }
}

/// Appends the application payload elements of a message to its marshaled array.
///
/// Carrying both a transparent payload and arguments, or payload transparency options without a
/// payload, is a contract violation by the constructing application.
fn marshal_payload_fields(
    list: &mut List,
    name: &'static str,
    options: &Dictionary,
    arguments: &List,
    arguments_keyword: &Dictionary,
    payload: &Option<Bytes>,
) -> Result<()> {
    match payload {
        Some(payload) => {
            if !arguments.is_empty() || !arguments_keyword.is_empty() {
                return Err(BasicError::InvalidArgument(format!(
                    "{name} cannot carry both a transparent payload and arguments"
                ))
                .into());
            }
            list.push(Value::Bytes(payload.clone()));
        }
        None => {
            if has_payload_transparency_options(options) {
                return Err(BasicError::InvalidArgument(format!(
                    "{name} options carry payload transparency fields without a payload"
                ))
                .into());
            }
            if !arguments_keyword.is_empty() {
                list.push(Value::List(arguments.clone()));
                list.push(Value::Dictionary(arguments_keyword.clone()));
            } else if !arguments.is_empty() {
                list.push(Value::List(arguments.clone()));
            }
        }
    }
    Ok(())
}

/// Validates application-constructed options before they are put on the wire.
fn check_options_contract(name: &'static str, options: &Dictionary) -> Result<()> {
    if let Some(value) = options.get("forward_for") {
        let entries = value.list().ok_or_else(|| {
            BasicError::InvalidArgument(format!("{name} forward_for must be a list"))
        })?;
        for entry in entries {
            ForwardFor::from_value(entry).map_err(|err| {
                BasicError::InvalidArgument(format!("{name} forward_for is malformed: {err}"))
            })?;
        }
    }
    Ok(())
}

/// A HELLO message for a peer to initiate a WAMP session in a realm.
///
/// The realm may be null to let the router choose one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub realm: Option<Uri>,
    pub details: Dictionary,
}

impl HelloMessage {
    pub const TAG: Integer = 1;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            match &self.realm {
                Some(realm) => Value::String(realm.to_string()),
                None => Value::Null,
            },
            Value::Dictionary(self.details.clone()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("HELLO", len, 3, 3)?;
        let realm = fields.realm("HELLO.Realm")?;
        let details = fields.dict("HELLO.Details")?;
        Ok(Self { realm, details })
    }
}

/// A WELCOME message for a router to confirm a peer's WAMP session in a realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WelcomeMessage {
    pub session: Id,
    pub details: Dictionary,
}

impl WelcomeMessage {
    pub const TAG: Integer = 2;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.session.value()),
            Value::Dictionary(self.details.clone()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("WELCOME", len, 3, 3)?;
        let session = fields.id("WELCOME.Session")?;
        let details = fields.dict("WELCOME.Details")?;
        Ok(Self { session, details })
    }
}

/// An ABORT message for quickly terminating a WAMP session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AbortMessage {
    pub details: Dictionary,
    pub reason: Uri,
}

impl AbortMessage {
    pub const TAG: Integer = 3;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Dictionary(self.details.clone()),
            Value::String(self.reason.to_string()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("ABORT", len, 3, 3)?;
        let details = fields.dict("ABORT.Details")?;
        let reason = fields.exact_uri("ABORT.Reason")?;
        Ok(Self { details, reason })
    }
}

/// A CHALLENGE message for a router to demand authentication from a peer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub auth_method: String,
    pub extra: Dictionary,
}

impl ChallengeMessage {
    pub const TAG: Integer = 4;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::String(self.auth_method.clone()),
            Value::Dictionary(self.extra.clone()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("CHALLENGE", len, 3, 3)?;
        let auth_method = fields.string("CHALLENGE.AuthMethod")?;
        let extra = fields.dict("CHALLENGE.Extra")?;
        Ok(Self { auth_method, extra })
    }
}

/// An AUTHENTICATE message for a peer to answer a router's authentication challenge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuthenticateMessage {
    pub signature: String,
    pub extra: Dictionary,
}

impl AuthenticateMessage {
    pub const TAG: Integer = 5;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::String(self.signature.clone()),
            Value::Dictionary(self.extra.clone()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("AUTHENTICATE", len, 3, 3)?;
        let signature = fields.string("AUTHENTICATE.Signature")?;
        let extra = fields.dict("AUTHENTICATE.Extra")?;
        Ok(Self { signature, extra })
    }
}

/// A GOODBYE message for ending a WAMP session with a two-way handshake.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GoodbyeMessage {
    pub details: Dictionary,
    pub reason: Uri,
}

impl GoodbyeMessage {
    pub const TAG: Integer = 6;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Dictionary(self.details.clone()),
            Value::String(self.reason.to_string()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("GOODBYE", len, 3, 3)?;
        let details = fields.dict("GOODBYE.Details")?;
        let reason = fields.exact_uri("GOODBYE.Reason")?;
        Ok(Self { details, reason })
    }
}

/// Request types that an ERROR message may respond to.
const ERROR_REQUEST_TYPES: [Integer; 7] = [
    SubscribeMessage::TAG,
    UnsubscribeMessage::TAG,
    PublishMessage::TAG,
    RegisterMessage::TAG,
    UnregisterMessage::TAG,
    CallMessage::TAG,
    InvocationMessage::TAG,
];

/// An ERROR message for communicating an error in response to a single request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub request_type: Integer,
    pub request: Id,
    pub details: Dictionary,
    pub error: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl ErrorMessage {
    pub const TAG: Integer = 8;

    fn marshal(&self) -> Result<List> {
        check_options_contract("ERROR", &self.details)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request_type),
            Value::Integer(self.request.value()),
            Value::Dictionary(self.details.clone()),
            Value::String(self.error.to_string()),
        ]);
        marshal_payload_fields(
            &mut list,
            "ERROR",
            &self.details,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("ERROR", len, 5, 7)?;
        let request_type = fields.integer("ERROR.RequestType")?;
        if !ERROR_REQUEST_TYPES.contains(&request_type) {
            return Err(ProtocolError::new(
                "ERROR.RequestType is not a request message type",
            ));
        }
        let request = fields.id("ERROR.Request")?;
        let details = fields.dict("ERROR.Details")?;
        validate_option_types("ERROR.Details", &details)?;
        let error = fields.exact_uri("ERROR.Error")?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "ERROR", "ERROR.Details", &details)?;
        Ok(Self {
            request_type,
            request,
            details,
            error,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// A PUBLISH message for publishing an event to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub request: Id,
    pub options: Dictionary,
    pub topic: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl PublishMessage {
    pub const TAG: Integer = 16;

    fn marshal(&self) -> Result<List> {
        check_options_contract("PUBLISH", &self.options)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Dictionary(self.options.clone()),
            Value::String(self.topic.to_string()),
        ]);
        marshal_payload_fields(
            &mut list,
            "PUBLISH",
            &self.options,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("PUBLISH", len, 4, 6)?;
        let request = fields.id("PUBLISH.Request")?;
        let options = fields.dict("PUBLISH.Options")?;
        validate_option_types("PUBLISH.Options", &options)?;
        let topic = fields.exact_uri("PUBLISH.Topic")?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "PUBLISH", "PUBLISH.Options", &options)?;
        Ok(Self {
            request,
            options,
            topic,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// A PUBLISHED message for confirming an event was published.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub publish_request: Id,
    pub publication: Id,
}

impl PublishedMessage {
    pub const TAG: Integer = 17;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.publish_request.value()),
            Value::Integer(self.publication.value()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("PUBLISHED", len, 3, 3)?;
        let publish_request = fields.id("PUBLISHED.Request")?;
        let publication = fields.id("PUBLISHED.Publication")?;
        Ok(Self {
            publish_request,
            publication,
        })
    }
}

/// A SUBSCRIBE message for subscribing to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    pub request: Id,
    pub options: Dictionary,
    pub topic: WildcardUri,
}

impl SubscribeMessage {
    pub const TAG: Integer = 32;

    fn marshal(&self) -> Result<List> {
        check_options_contract("SUBSCRIBE", &self.options)?;
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Dictionary(self.options.clone()),
            Value::String(self.topic.to_string()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("SUBSCRIBE", len, 4, 4)?;
        let request = fields.id("SUBSCRIBE.Request")?;
        let options = fields.dict("SUBSCRIBE.Options")?;
        validate_option_types("SUBSCRIBE.Options", &options)?;
        let topic = fields.uri("SUBSCRIBE.Topic", uri_policy(&options))?;
        Ok(Self {
            request,
            options,
            topic,
        })
    }
}

/// A SUBSCRIBED message for confirming a peer has subscribed to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribedMessage {
    pub subscribe_request: Id,
    pub subscription: Id,
}

impl SubscribedMessage {
    pub const TAG: Integer = 33;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.subscribe_request.value()),
            Value::Integer(self.subscription.value()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("SUBSCRIBED", len, 3, 3)?;
        let subscribe_request = fields.id("SUBSCRIBED.Request")?;
        let subscription = fields.id("SUBSCRIBED.Subscription")?;
        Ok(Self {
            subscribe_request,
            subscription,
        })
    }
}

/// An UNSUBSCRIBE message for unsubscribing from a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnsubscribeMessage {
    pub request: Id,
    pub subscribed_subscription: Id,
    pub options: Dictionary,
}

impl UnsubscribeMessage {
    pub const TAG: Integer = 34;

    fn marshal(&self) -> Result<List> {
        check_options_contract("UNSUBSCRIBE", &self.options)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Integer(self.subscribed_subscription.value()),
        ]);
        if !self.options.is_empty() {
            list.push(Value::Dictionary(self.options.clone()));
        }
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("UNSUBSCRIBE", len, 3, 4)?;
        let request = fields.id("UNSUBSCRIBE.Request")?;
        let subscribed_subscription = fields.id("UNSUBSCRIBE.Subscription")?;
        let options = fields.optional_dict("UNSUBSCRIBE.Options")?;
        validate_option_types("UNSUBSCRIBE.Options", &options)?;
        Ok(Self {
            request,
            subscribed_subscription,
            options,
        })
    }
}

/// An UNSUBSCRIBED message for confirming a peer has unsubscribed from a topic.
///
/// With a zero request ID, describes a router-triggered subscription revocation instead.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnsubscribedMessage {
    pub unsubscribe_request: Id,
    pub details: Dictionary,
}

impl UnsubscribedMessage {
    pub const TAG: Integer = 35;

    /// The subscription revoked by the router, if this message describes a revocation rather than
    /// the confirmation of a request.
    pub fn revoked_subscription(&self) -> Option<Id> {
        if self.unsubscribe_request != Id::MIN {
            return None;
        }
        self.details
            .get("subscription")
            .and_then(Value::integer)
            .and_then(|id| Id::try_from(id).ok())
    }

    fn marshal(&self) -> Result<List> {
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.unsubscribe_request.value()),
        ]);
        if !self.details.is_empty() {
            list.push(Value::Dictionary(self.details.clone()));
        }
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("UNSUBSCRIBED", len, 2, 3)?;
        let unsubscribe_request = fields.id("UNSUBSCRIBED.Request")?;
        let details = fields.optional_dict("UNSUBSCRIBED.Details")?;
        Ok(Self {
            unsubscribe_request,
            details,
        })
    }
}

/// An EVENT message for relaying a published event to subscribers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub subscribed_subscription: Id,
    pub published_publication: Id,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl EventMessage {
    pub const TAG: Integer = 36;

    fn marshal(&self) -> Result<List> {
        check_options_contract("EVENT", &self.details)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.subscribed_subscription.value()),
            Value::Integer(self.published_publication.value()),
            Value::Dictionary(self.details.clone()),
        ]);
        marshal_payload_fields(
            &mut list,
            "EVENT",
            &self.details,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("EVENT", len, 4, 6)?;
        let subscribed_subscription = fields.id("EVENT.Subscription")?;
        let published_publication = fields.id("EVENT.Publication")?;
        let details = fields.dict("EVENT.Details")?;
        validate_option_types("EVENT.Details", &details)?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "EVENT", "EVENT.Details", &details)?;
        Ok(Self {
            subscribed_subscription,
            published_publication,
            details,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// An EVENT_RECEIVED message for acknowledging delivery of an event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventReceivedMessage {
    pub published_publication: Id,
}

impl EventReceivedMessage {
    pub const TAG: Integer = 37;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.published_publication.value()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("EVENT_RECEIVED", len, 2, 2)?;
        let published_publication = fields.id("EVENT_RECEIVED.Publication")?;
        Ok(Self {
            published_publication,
        })
    }
}

/// A CALL message for invoking a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub request: Id,
    pub options: Dictionary,
    pub procedure: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl CallMessage {
    pub const TAG: Integer = 48;

    fn marshal(&self) -> Result<List> {
        check_options_contract("CALL", &self.options)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Dictionary(self.options.clone()),
            Value::String(self.procedure.to_string()),
        ]);
        marshal_payload_fields(
            &mut list,
            "CALL",
            &self.options,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("CALL", len, 4, 6)?;
        let request = fields.id("CALL.Request")?;
        let options = fields.dict("CALL.Options")?;
        validate_option_types("CALL.Options", &options)?;
        let procedure = fields.exact_uri("CALL.Procedure")?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "CALL", "CALL.Options", &options)?;
        Ok(Self {
            request,
            options,
            procedure,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// A CANCEL message for canceling a pending procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CancelMessage {
    pub call_request: Id,
    pub options: Dictionary,
}

impl CancelMessage {
    pub const TAG: Integer = 49;

    /// The cancel mode carried in the options, defaulting when absent.
    pub fn mode(&self) -> CallCancelMode {
        self.options
            .get("mode")
            .and_then(Value::string)
            .and_then(|mode| CallCancelMode::try_from(mode).ok())
            .unwrap_or_default()
    }

    fn marshal(&self) -> Result<List> {
        check_options_contract("CANCEL", &self.options)?;
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.call_request.value()),
            Value::Dictionary(self.options.clone()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("CANCEL", len, 3, 3)?;
        let call_request = fields.id("CANCEL.Request")?;
        let options = fields.dict("CANCEL.Options")?;
        validate_option_types("CANCEL.Options", &options)?;
        Ok(Self {
            call_request,
            options,
        })
    }
}

/// A RESULT message for sending the result of a procedure invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub call_request: Id,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl ResultMessage {
    pub const TAG: Integer = 50;

    /// Whether the result is progressive (non-final).
    pub fn progress(&self) -> bool {
        matches!(self.details.get("progress"), Some(Value::Bool(true)))
    }

    fn marshal(&self) -> Result<List> {
        check_options_contract("RESULT", &self.details)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.call_request.value()),
            Value::Dictionary(self.details.clone()),
        ]);
        marshal_payload_fields(
            &mut list,
            "RESULT",
            &self.details,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("RESULT", len, 3, 5)?;
        let call_request = fields.id("RESULT.Request")?;
        let details = fields.dict("RESULT.Details")?;
        validate_option_types("RESULT.Details", &details)?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "RESULT", "RESULT.Details", &details)?;
        Ok(Self {
            call_request,
            details,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// A REGISTER message for registering a procedure in the realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterMessage {
    pub request: Id,
    pub options: Dictionary,
    pub procedure: WildcardUri,
}

impl RegisterMessage {
    pub const TAG: Integer = 64;

    fn marshal(&self) -> Result<List> {
        check_options_contract("REGISTER", &self.options)?;
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Dictionary(self.options.clone()),
            Value::String(self.procedure.to_string()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("REGISTER", len, 4, 4)?;
        let request = fields.id("REGISTER.Request")?;
        let options = fields.dict("REGISTER.Options")?;
        validate_option_types("REGISTER.Options", &options)?;
        let procedure = fields.uri("REGISTER.Procedure", uri_policy(&options))?;
        Ok(Self {
            request,
            options,
            procedure,
        })
    }
}

/// A REGISTERED message for confirming a procedure has been registered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisteredMessage {
    pub register_request: Id,
    pub registration: Id,
}

impl RegisteredMessage {
    pub const TAG: Integer = 65;

    fn marshal(&self) -> Result<List> {
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.register_request.value()),
            Value::Integer(self.registration.value()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("REGISTERED", len, 3, 3)?;
        let register_request = fields.id("REGISTERED.Request")?;
        let registration = fields.id("REGISTERED.Registration")?;
        Ok(Self {
            register_request,
            registration,
        })
    }
}

/// An UNREGISTER message for unregistering a procedure in the realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnregisterMessage {
    pub request: Id,
    pub registered_registration: Id,
    pub options: Dictionary,
}

impl UnregisterMessage {
    pub const TAG: Integer = 66;

    fn marshal(&self) -> Result<List> {
        check_options_contract("UNREGISTER", &self.options)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Integer(self.registered_registration.value()),
        ]);
        if !self.options.is_empty() {
            list.push(Value::Dictionary(self.options.clone()));
        }
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("UNREGISTER", len, 3, 4)?;
        let request = fields.id("UNREGISTER.Request")?;
        let registered_registration = fields.id("UNREGISTER.Registration")?;
        let options = fields.optional_dict("UNREGISTER.Options")?;
        validate_option_types("UNREGISTER.Options", &options)?;
        Ok(Self {
            request,
            registered_registration,
            options,
        })
    }
}

/// An UNREGISTERED message for confirming a procedure has been unregistered.
///
/// With a zero request ID, describes a router-triggered registration revocation instead.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnregisteredMessage {
    pub unregister_request: Id,
    pub details: Dictionary,
}

impl UnregisteredMessage {
    pub const TAG: Integer = 67;

    /// The registration revoked by the router, if this message describes a revocation rather than
    /// the confirmation of a request.
    pub fn revoked_registration(&self) -> Option<Id> {
        if self.unregister_request != Id::MIN {
            return None;
        }
        self.details
            .get("registration")
            .and_then(Value::integer)
            .and_then(|id| Id::try_from(id).ok())
    }

    fn marshal(&self) -> Result<List> {
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.unregister_request.value()),
        ]);
        if !self.details.is_empty() {
            list.push(Value::Dictionary(self.details.clone()));
        }
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("UNREGISTERED", len, 2, 3)?;
        let unregister_request = fields.id("UNREGISTERED.Request")?;
        let details = fields.optional_dict("UNREGISTERED.Details")?;
        Ok(Self {
            unregister_request,
            details,
        })
    }
}

/// An INVOCATION message for invoking a procedure on its callee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvocationMessage {
    pub request: Id,
    pub registered_registration: Id,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl InvocationMessage {
    pub const TAG: Integer = 68;

    fn marshal(&self) -> Result<List> {
        check_options_contract("INVOCATION", &self.details)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.request.value()),
            Value::Integer(self.registered_registration.value()),
            Value::Dictionary(self.details.clone()),
        ]);
        marshal_payload_fields(
            &mut list,
            "INVOCATION",
            &self.details,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("INVOCATION", len, 4, 6)?;
        let request = fields.id("INVOCATION.Request")?;
        let registered_registration = fields.id("INVOCATION.Registration")?;
        let details = fields.dict("INVOCATION.Details")?;
        validate_option_types("INVOCATION.Details", &details)?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "INVOCATION", "INVOCATION.Details", &details)?;
        Ok(Self {
            request,
            registered_registration,
            details,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// An INTERRUPT message for interrupting a procedure invocation on its callee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InterruptMessage {
    pub invocation_request: Id,
    pub options: Dictionary,
}

impl InterruptMessage {
    pub const TAG: Integer = 69;

    fn marshal(&self) -> Result<List> {
        check_options_contract("INTERRUPT", &self.options)?;
        Ok(List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.invocation_request.value()),
            Value::Dictionary(self.options.clone()),
        ]))
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("INTERRUPT", len, 3, 3)?;
        let invocation_request = fields.id("INTERRUPT.Request")?;
        let options = fields.dict("INTERRUPT.Options")?;
        validate_option_types("INTERRUPT.Options", &options)?;
        Ok(Self {
            invocation_request,
            options,
        })
    }
}

/// A YIELD message for yielding the result of an invocation from the callee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct YieldMessage {
    pub invocation_request: Id,
    pub options: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
}

impl YieldMessage {
    pub const TAG: Integer = 70;

    /// Whether the yielded result is progressive (non-final).
    pub fn progress(&self) -> bool {
        matches!(self.options.get("progress"), Some(Value::Bool(true)))
    }

    fn marshal(&self) -> Result<List> {
        check_options_contract("YIELD", &self.options)?;
        let mut list = List::from_iter([
            Value::Integer(Self::TAG),
            Value::Integer(self.invocation_request.value()),
            Value::Dictionary(self.options.clone()),
        ]);
        marshal_payload_fields(
            &mut list,
            "YIELD",
            &self.options,
            &self.arguments,
            &self.arguments_keyword,
            &self.payload,
        )?;
        Ok(list)
    }

    fn parse(len: usize, fields: &mut MessageFields) -> Result<Self, ProtocolError> {
        check_arity("YIELD", len, 3, 5)?;
        let invocation_request = fields.id("YIELD.Request")?;
        let options = fields.dict("YIELD.Options")?;
        validate_option_types("YIELD.Options", &options)?;
        let (arguments, arguments_keyword, payload) =
            parse_payload_fields(fields, "YIELD", "YIELD.Options", &options)?;
        Ok(Self {
            invocation_request,
            options,
            arguments,
            arguments_keyword,
            payload,
        })
    }
}

/// A WAMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(HelloMessage),
    Welcome(WelcomeMessage),
    Abort(AbortMessage),
    Challenge(ChallengeMessage),
    Authenticate(AuthenticateMessage),
    Goodbye(GoodbyeMessage),
    Error(ErrorMessage),
    Publish(PublishMessage),
    Published(PublishedMessage),
    Subscribe(SubscribeMessage),
    Subscribed(SubscribedMessage),
    Unsubscribe(UnsubscribeMessage),
    Unsubscribed(UnsubscribedMessage),
    Event(EventMessage),
    EventReceived(EventReceivedMessage),
    Call(CallMessage),
    Cancel(CancelMessage),
    Result(ResultMessage),
    Register(RegisterMessage),
    Registered(RegisteredMessage),
    Unregister(UnregisterMessage),
    Unregistered(UnregisteredMessage),
    Invocation(InvocationMessage),
    Interrupt(InterruptMessage),
    Yield(YieldMessage),
}

impl Message {
    /// The numeric type tag of the message.
    pub fn tag(&self) -> Integer {
        match self {
            Self::Hello(_) => HelloMessage::TAG,
            Self::Welcome(_) => WelcomeMessage::TAG,
            Self::Abort(_) => AbortMessage::TAG,
            Self::Challenge(_) => ChallengeMessage::TAG,
            Self::Authenticate(_) => AuthenticateMessage::TAG,
            Self::Goodbye(_) => GoodbyeMessage::TAG,
            Self::Error(_) => ErrorMessage::TAG,
            Self::Publish(_) => PublishMessage::TAG,
            Self::Published(_) => PublishedMessage::TAG,
            Self::Subscribe(_) => SubscribeMessage::TAG,
            Self::Subscribed(_) => SubscribedMessage::TAG,
            Self::Unsubscribe(_) => UnsubscribeMessage::TAG,
            Self::Unsubscribed(_) => UnsubscribedMessage::TAG,
            Self::Event(_) => EventMessage::TAG,
            Self::EventReceived(_) => EventReceivedMessage::TAG,
            Self::Call(_) => CallMessage::TAG,
            Self::Cancel(_) => CancelMessage::TAG,
            Self::Result(_) => ResultMessage::TAG,
            Self::Register(_) => RegisterMessage::TAG,
            Self::Registered(_) => RegisteredMessage::TAG,
            Self::Unregister(_) => UnregisterMessage::TAG,
            Self::Unregistered(_) => UnregisteredMessage::TAG,
            Self::Invocation(_) => InvocationMessage::TAG,
            Self::Interrupt(_) => InterruptMessage::TAG,
            Self::Yield(_) => YieldMessage::TAG,
        }
    }

    /// The message name, mostly for logging.
    pub fn message_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Welcome(_) => "WELCOME",
            Self::Abort(_) => "ABORT",
            Self::Challenge(_) => "CHALLENGE",
            Self::Authenticate(_) => "AUTHENTICATE",
            Self::Goodbye(_) => "GOODBYE",
            Self::Error(_) => "ERROR",
            Self::Publish(_) => "PUBLISH",
            Self::Published(_) => "PUBLISHED",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Subscribed(_) => "SUBSCRIBED",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::Unsubscribed(_) => "UNSUBSCRIBED",
            Self::Event(_) => "EVENT",
            Self::EventReceived(_) => "EVENT_RECEIVED",
            Self::Call(_) => "CALL",
            Self::Cancel(_) => "CANCEL",
            Self::Result(_) => "RESULT",
            Self::Register(_) => "REGISTER",
            Self::Registered(_) => "REGISTERED",
            Self::Unregister(_) => "UNREGISTER",
            Self::Unregistered(_) => "UNREGISTERED",
            Self::Invocation(_) => "INVOCATION",
            Self::Interrupt(_) => "INTERRUPT",
            Self::Yield(_) => "YIELD",
        }
    }

    /// The request ID on the message, correlating requests to their responses.
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Self::Error(message) => Some(message.request),
            Self::Publish(message) => Some(message.request),
            Self::Published(message) => Some(message.publish_request),
            Self::Subscribe(message) => Some(message.request),
            Self::Subscribed(message) => Some(message.subscribe_request),
            Self::Unsubscribe(message) => Some(message.request),
            Self::Unsubscribed(message) => Some(message.unsubscribe_request),
            Self::Call(message) => Some(message.request),
            Self::Cancel(message) => Some(message.call_request),
            Self::Result(message) => Some(message.call_request),
            Self::Register(message) => Some(message.request),
            Self::Registered(message) => Some(message.register_request),
            Self::Unregister(message) => Some(message.request),
            Self::Unregistered(message) => Some(message.unregister_request),
            Self::Invocation(message) => Some(message.request),
            Self::Interrupt(message) => Some(message.invocation_request),
            Self::Yield(message) => Some(message.invocation_request),
            _ => None,
        }
    }

    /// The details dictionary on the message.
    pub fn details(&self) -> Option<&Dictionary> {
        match self {
            Self::Hello(message) => Some(&message.details),
            Self::Welcome(message) => Some(&message.details),
            Self::Abort(message) => Some(&message.details),
            Self::Goodbye(message) => Some(&message.details),
            Self::Error(message) => Some(&message.details),
            Self::Event(message) => Some(&message.details),
            Self::Result(message) => Some(&message.details),
            Self::Invocation(message) => Some(&message.details),
            _ => None,
        }
    }

    /// The error reason on the message.
    pub fn reason(&self) -> Option<&Uri> {
        match self {
            Self::Abort(message) => Some(&message.reason),
            Self::Goodbye(message) => Some(&message.reason),
            Self::Error(message) => Some(&message.error),
            _ => None,
        }
    }

    /// Marshals the message into its canonical ordered-array form.
    ///
    /// Fails on construction-time contract violations, such as carrying both a transparent
    /// payload and arguments.
    pub fn marshal(&self) -> Result<List> {
        match self {
            Self::Hello(message) => message.marshal(),
            Self::Welcome(message) => message.marshal(),
            Self::Abort(message) => message.marshal(),
            Self::Challenge(message) => message.marshal(),
            Self::Authenticate(message) => message.marshal(),
            Self::Goodbye(message) => message.marshal(),
            Self::Error(message) => message.marshal(),
            Self::Publish(message) => message.marshal(),
            Self::Published(message) => message.marshal(),
            Self::Subscribe(message) => message.marshal(),
            Self::Subscribed(message) => message.marshal(),
            Self::Unsubscribe(message) => message.marshal(),
            Self::Unsubscribed(message) => message.marshal(),
            Self::Event(message) => message.marshal(),
            Self::EventReceived(message) => message.marshal(),
            Self::Call(message) => message.marshal(),
            Self::Cancel(message) => message.marshal(),
            Self::Result(message) => message.marshal(),
            Self::Register(message) => message.marshal(),
            Self::Registered(message) => message.marshal(),
            Self::Unregister(message) => message.marshal(),
            Self::Unregistered(message) => message.marshal(),
            Self::Invocation(message) => message.marshal(),
            Self::Interrupt(message) => message.marshal(),
            Self::Yield(message) => message.marshal(),
        }
    }

    /// Parses a message from its canonical ordered-array form, with full validation.
    pub fn parse(list: List) -> Result<Self, ProtocolError> {
        let len = list.len();
        let mut fields = MessageFields::new(list);
        let tag = fields.integer("MESSAGE.Type")?;
        let fields = &mut fields;
        match tag {
            HelloMessage::TAG => Ok(Self::Hello(HelloMessage::parse(len, fields)?)),
            WelcomeMessage::TAG => Ok(Self::Welcome(WelcomeMessage::parse(len, fields)?)),
            AbortMessage::TAG => Ok(Self::Abort(AbortMessage::parse(len, fields)?)),
            ChallengeMessage::TAG => Ok(Self::Challenge(ChallengeMessage::parse(len, fields)?)),
            AuthenticateMessage::TAG => {
                Ok(Self::Authenticate(AuthenticateMessage::parse(len, fields)?))
            }
            GoodbyeMessage::TAG => Ok(Self::Goodbye(GoodbyeMessage::parse(len, fields)?)),
            ErrorMessage::TAG => Ok(Self::Error(ErrorMessage::parse(len, fields)?)),
            PublishMessage::TAG => Ok(Self::Publish(PublishMessage::parse(len, fields)?)),
            PublishedMessage::TAG => Ok(Self::Published(PublishedMessage::parse(len, fields)?)),
            SubscribeMessage::TAG => Ok(Self::Subscribe(SubscribeMessage::parse(len, fields)?)),
            SubscribedMessage::TAG => Ok(Self::Subscribed(SubscribedMessage::parse(len, fields)?)),
            UnsubscribeMessage::TAG => {
                Ok(Self::Unsubscribe(UnsubscribeMessage::parse(len, fields)?))
            }
            UnsubscribedMessage::TAG => {
                Ok(Self::Unsubscribed(UnsubscribedMessage::parse(len, fields)?))
            }
            EventMessage::TAG => Ok(Self::Event(EventMessage::parse(len, fields)?)),
            EventReceivedMessage::TAG => Ok(Self::EventReceived(EventReceivedMessage::parse(
                len, fields,
            )?)),
            CallMessage::TAG => Ok(Self::Call(CallMessage::parse(len, fields)?)),
            CancelMessage::TAG => Ok(Self::Cancel(CancelMessage::parse(len, fields)?)),
            ResultMessage::TAG => Ok(Self::Result(ResultMessage::parse(len, fields)?)),
            RegisterMessage::TAG => Ok(Self::Register(RegisterMessage::parse(len, fields)?)),
            RegisteredMessage::TAG => Ok(Self::Registered(RegisteredMessage::parse(len, fields)?)),
            UnregisterMessage::TAG => Ok(Self::Unregister(UnregisterMessage::parse(len, fields)?)),
            UnregisteredMessage::TAG => {
                Ok(Self::Unregistered(UnregisteredMessage::parse(len, fields)?))
            }
            InvocationMessage::TAG => Ok(Self::Invocation(InvocationMessage::parse(len, fields)?)),
            InterruptMessage::TAG => Ok(Self::Interrupt(InterruptMessage::parse(len, fields)?)),
            YieldMessage::TAG => Ok(Self::Yield(YieldMessage::parse(len, fields)?)),
            tag => Err(ProtocolError::new(format!(
                "received message with unknown type tag {tag}"
            ))),
        }
    }
}

#[cfg(test)]
mod message_test {
    use crate::core::{
        error::BasicError,
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    };

    use crate::message::message::{
        CallMessage,
        ErrorMessage,
        EventMessage,
        ForwardFor,
        HelloMessage,
        Message,
        PublishMessage,
        ResultMessage,
        SubscribeMessage,
        UnsubscribedMessage,
        WelcomeMessage,
        YieldMessage,
    };

    #[track_caller]
    fn assert_round_trip(message: Message) {
        let list = message.marshal().unwrap();
        let parsed = Message::parse(list).unwrap();
        pretty_assertions::assert_eq!(message, parsed);
    }

    #[test]
    fn round_trips_all_message_kinds() {
        assert_round_trip(Message::Hello(HelloMessage {
            realm: Some(Uri::try_from("com.example.realm").unwrap()),
            details: Dictionary::from_iter([("agent".to_owned(), Value::from("wampeer"))]),
        }));
        assert_round_trip(Message::Hello(HelloMessage {
            realm: None,
            details: Dictionary::default(),
        }));
        assert_round_trip(Message::Welcome(WelcomeMessage {
            session: Id::try_from(9007199254740992).unwrap(),
            details: Dictionary::default(),
        }));
        assert_round_trip(Message::Call(CallMessage {
            request: Id::try_from(7814135).unwrap(),
            options: Dictionary::default(),
            procedure: Uri::try_from("com.myapp.add2").unwrap(),
            arguments: List::from_iter([Value::Integer(23), Value::Integer(7)]),
            arguments_keyword: Dictionary::default(),
            payload: None,
        }));
        assert_round_trip(Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            options: Dictionary::from_iter([("enc_algo".to_owned(), Value::from("cryptobox"))]),
            procedure: Uri::try_from("com.myapp.secret").unwrap(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
            payload: Some(vec![0x01, 0x02, 0x03]),
        }));
        assert_round_trip(Message::Result(ResultMessage {
            call_request: Id::try_from(1).unwrap(),
            details: Dictionary::from_iter([("progress".to_owned(), Value::Bool(true))]),
            arguments: List::from_iter([Value::Integer(5)]),
            arguments_keyword: Dictionary::default(),
            payload: None,
        }));
        assert_round_trip(Message::Subscribe(SubscribeMessage {
            request: Id::try_from(2).unwrap(),
            options: Dictionary::from_iter([("match".to_owned(), Value::from("wildcard"))]),
            topic: WildcardUri::try_from("com..topic").unwrap(),
        }));
    }

    #[test]
    fn marshals_to_table_arity() {
        let hello = Message::Hello(HelloMessage::default());
        assert_eq!(hello.marshal().unwrap().len(), 3);

        // No optional fields: [48, request, options, procedure].
        let call = Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            procedure: Uri::try_from("com.myapp.ping").unwrap(),
            ..Default::default()
        });
        assert_eq!(call.marshal().unwrap().len(), 4);

        // Arguments only: one extra element.
        let call = Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            procedure: Uri::try_from("com.myapp.ping").unwrap(),
            arguments: List::from_iter([Value::Integer(1)]),
            ..Default::default()
        });
        assert_eq!(call.marshal().unwrap().len(), 5);

        // Keyword arguments force the positional list to be present.
        let call = Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            procedure: Uri::try_from("com.myapp.ping").unwrap(),
            arguments_keyword: Dictionary::from_iter([("a".to_owned(), Value::Integer(1))]),
            ..Default::default()
        });
        assert_eq!(call.marshal().unwrap().len(), 6);

        // Transparent payload: one extra element.
        let call = Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            procedure: Uri::try_from("com.myapp.ping").unwrap(),
            payload: Some(vec![1, 2, 3]),
            ..Default::default()
        });
        assert_eq!(call.marshal().unwrap().len(), 5);
    }

    #[test]
    fn rejects_payload_and_arguments_together() {
        let call = Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            procedure: Uri::try_from("com.myapp.ping").unwrap(),
            arguments: List::from_iter([Value::Integer(1)]),
            payload: Some(vec![1]),
            ..Default::default()
        });
        assert_matches::assert_matches!(call.marshal(), Err(err) => {
            assert_matches::assert_matches!(err.downcast::<BasicError>(), Ok(BasicError::InvalidArgument(_)));
        });

        let publish = Message::Publish(PublishMessage {
            request: Id::try_from(1).unwrap(),
            topic: Uri::try_from("com.myapp.topic").unwrap(),
            arguments_keyword: Dictionary::from_iter([("a".to_owned(), Value::Integer(1))]),
            payload: Some(vec![1]),
            ..Default::default()
        });
        assert_matches::assert_matches!(publish.marshal(), Err(_));
    }

    #[test]
    fn rejects_payload_transparency_options_without_payload() {
        let call = Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            options: Dictionary::from_iter([("enc_algo".to_owned(), Value::from("cryptobox"))]),
            procedure: Uri::try_from("com.myapp.ping").unwrap(),
            arguments: List::from_iter([Value::Integer(1)]),
            ..Default::default()
        });
        assert_matches::assert_matches!(call.marshal(), Err(_));

        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(48),
                Value::Integer(1),
                Value::Dictionary(Dictionary::from_iter([(
                    "enc_algo".to_owned(),
                    Value::from("cryptobox"),
                )])),
                Value::from("com.myapp.ping"),
                Value::List(List::default()),
            ])),
            Err(err) => {
                assert!(err.to_string().contains("payload transparency"));
            }
        );
    }

    #[test]
    fn disambiguates_payload_by_arity_then_type() {
        // A single trailing byte string is a transparent payload.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(48),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com.myapp.ping"),
                Value::Bytes(vec![1, 2, 3]),
            ])),
            Ok(Message::Call(message)) => {
                assert_eq!(message.payload, Some(vec![1, 2, 3]));
                assert!(message.arguments.is_empty());
            }
        );

        // A single trailing list is positional arguments.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(48),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com.myapp.ping"),
                Value::List(List::from_iter([Value::Integer(1)])),
            ])),
            Ok(Message::Call(message)) => {
                assert_eq!(message.payload, None);
                assert_eq!(message.arguments, List::from_iter([Value::Integer(1)]));
            }
        );

        // With two trailing elements, a byte string is not acceptable.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(48),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com.myapp.ping"),
                Value::Bytes(vec![1, 2, 3]),
                Value::Dictionary(Dictionary::default()),
            ])),
            Err(err) => {
                assert!(err.to_string().contains("CALL.Arguments"));
            }
        );
    }

    #[test]
    fn validates_arity_against_table() {
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([Value::Integer(1)])),
            Err(err) => {
                assert!(err.to_string().contains("HELLO message has invalid length 1"));
            }
        );
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(48),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com.myapp.ping"),
                Value::List(List::default()),
                Value::Dictionary(Dictionary::default()),
                Value::Integer(1),
            ])),
            Err(err) => {
                assert!(err.to_string().contains("CALL message has invalid length 7"));
            }
        );
    }

    #[test]
    fn rejects_unknown_type_tag() {
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([Value::Integer(99), Value::Integer(1)])),
            Err(err) => {
                assert!(err.to_string().contains("unknown type tag 99"));
            }
        );
    }

    #[test]
    fn validates_ids_on_parse() {
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(2),
                Value::Integer(9007199254740993),
                Value::Dictionary(Dictionary::default()),
            ])),
            Err(err) => {
                assert!(err.to_string().contains("WELCOME.Session is out of range"));
            }
        );
    }

    #[test]
    fn selects_uri_policy_from_match_option() {
        // Exact matching rejects empty components.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(32),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com..topic"),
            ])),
            Err(err) => {
                assert!(err.to_string().contains("SUBSCRIBE.Topic"));
            }
        );

        // Prefix matching allows a trailing empty component only.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(32),
                Value::Integer(1),
                Value::Dictionary(Dictionary::from_iter([(
                    "match".to_owned(),
                    Value::from("prefix"),
                )])),
                Value::from("com.myapp."),
            ])),
            Ok(Message::Subscribe(_))
        );
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(32),
                Value::Integer(1),
                Value::Dictionary(Dictionary::from_iter([(
                    "match".to_owned(),
                    Value::from("prefix"),
                )])),
                Value::from("com..myapp"),
            ])),
            Err(_)
        );

        // Wildcard matching allows any empty component.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(32),
                Value::Integer(1),
                Value::Dictionary(Dictionary::from_iter([(
                    "match".to_owned(),
                    Value::from("wildcard"),
                )])),
                Value::from("com..topic"),
            ])),
            Ok(Message::Subscribe(_))
        );
    }

    #[test]
    fn validates_forward_for_entries() {
        let valid = ForwardFor {
            session: Id::try_from(123).unwrap(),
            authid: None,
            authrole: "anonymous".to_owned(),
        };
        let message = Message::Publish(PublishMessage {
            request: Id::try_from(1).unwrap(),
            options: Dictionary::from_iter([(
                "forward_for".to_owned(),
                Value::List(List::from_iter([valid.to_value()])),
            )]),
            topic: Uri::try_from("com.myapp.topic").unwrap(),
            ..Default::default()
        });
        assert_matches::assert_matches!(message.marshal(), Ok(_));

        // Entries missing authrole are a construction-time contract violation.
        let message = Message::Publish(PublishMessage {
            request: Id::try_from(1).unwrap(),
            options: Dictionary::from_iter([(
                "forward_for".to_owned(),
                Value::List(List::from_iter([Value::Dictionary(Dictionary::from_iter([
                    ("session".to_owned(), Value::Integer(123)),
                    ("authid".to_owned(), Value::Null),
                ]))])),
            )]),
            topic: Uri::try_from("com.myapp.topic").unwrap(),
            ..Default::default()
        });
        assert_matches::assert_matches!(message.marshal(), Err(err) => {
            assert_matches::assert_matches!(err.downcast::<BasicError>(), Ok(BasicError::InvalidArgument(_)));
        });
    }

    #[test]
    fn parses_router_revocation() {
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(35),
                Value::Integer(0),
                Value::Dictionary(Dictionary::from_iter([
                    ("subscription".to_owned(), Value::Integer(100)),
                    ("reason".to_owned(), Value::from("wamp.subscription.revoked")),
                ])),
            ])),
            Ok(Message::Unsubscribed(message)) => {
                assert_eq!(message.revoked_subscription(), Some(Id::try_from(100).unwrap()));
            }
        );

        let message = UnsubscribedMessage {
            unsubscribe_request: Id::try_from(7).unwrap(),
            details: Dictionary::default(),
        };
        assert_eq!(message.revoked_subscription(), None);
    }

    #[test]
    fn parses_error_with_payload() {
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(8),
                Value::Integer(48),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com.myapp.error.boom"),
                Value::List(List::from_iter([Value::from("details")])),
            ])),
            Ok(Message::Error(message)) => {
                assert_eq!(message.error.as_ref(), "com.myapp.error.boom");
                assert_eq!(message.arguments, List::from_iter([Value::from("details")]));
            }
        );

        // The request type must be a request message type.
        assert_matches::assert_matches!(
            Message::parse(List::from_iter([
                Value::Integer(8),
                Value::Integer(50),
                Value::Integer(1),
                Value::Dictionary(Dictionary::default()),
                Value::from("com.myapp.error.boom"),
            ])),
            Err(err) => {
                assert!(err.to_string().contains("ERROR.RequestType"));
            }
        );
    }

    #[test]
    fn round_trips_event_with_keyword_arguments() {
        assert_round_trip(Message::Event(EventMessage {
            subscribed_subscription: Id::try_from(10).unwrap(),
            published_publication: Id::try_from(20).unwrap(),
            details: Dictionary::default(),
            arguments: List::from_iter([Value::from("hi")]),
            arguments_keyword: Dictionary::from_iter([("k".to_owned(), Value::Integer(1))]),
            payload: None,
        }));
        assert_round_trip(Message::Yield(YieldMessage {
            invocation_request: Id::try_from(30).unwrap(),
            options: Dictionary::default(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
            payload: Some(vec![9, 9]),
        }));
        assert_round_trip(Message::Error(ErrorMessage {
            request_type: CallMessage::TAG,
            request: Id::try_from(40).unwrap(),
            details: Dictionary::default(),
            error: Uri::try_from("wamp.error.invalid_argument").unwrap(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
            payload: None,
        }));
    }
}
