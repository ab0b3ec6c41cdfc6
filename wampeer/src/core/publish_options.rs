use crate::{
    core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
            WampSerialize,
            WampSerializeError,
        },
    },
    message::message::ForwardFor,
};

/// Options for publishing an event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Should the router confirm the publication with a PUBLISHED message?
    pub acknowledge: bool,
    /// Should the publisher be excluded from receiving the event?
    pub exclude_me: Option<bool>,
    /// Blocked session IDs.
    pub exclude: Vec<Id>,
    /// Allowed session IDs.
    pub eligible: Vec<Id>,
    /// The chain of sessions the publication was relayed through.
    pub forward_for: Vec<ForwardFor>,
}

impl WampSerialize for PublishOptions {
    fn wamp_serialize(self) -> Result<Value, WampSerializeError> {
        let mut options = Dictionary::default();
        if self.acknowledge {
            options.insert("acknowledge".to_owned(), Value::Bool(true));
        }
        if let Some(exclude_me) = self.exclude_me {
            options.insert("exclude_me".to_owned(), Value::Bool(exclude_me));
        }
        if !self.exclude.is_empty() {
            options.insert(
                "exclude".to_owned(),
                Value::List(List::from_iter(
                    self.exclude.iter().map(|id| Value::Integer(id.value())),
                )),
            );
        }
        if !self.eligible.is_empty() {
            options.insert(
                "eligible".to_owned(),
                Value::List(List::from_iter(
                    self.eligible.iter().map(|id| Value::Integer(id.value())),
                )),
            );
        }
        if !self.forward_for.is_empty() {
            options.insert(
                "forward_for".to_owned(),
                Value::List(List::from_iter(
                    self.forward_for.iter().map(ForwardFor::to_value),
                )),
            );
        }
        Ok(Value::Dictionary(options))
    }
}
