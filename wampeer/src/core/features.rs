use crate::core::types::{
    Dictionary,
    Value,
    WampSerialize,
    WampSerializeError,
};

/// Advanced features for WAMP peers, related to pub/sub.
#[derive(Debug, Default, Clone)]
pub struct PubSubFeatures {
    /// The publisher can ask to be excluded from, or specify, event receivers.
    pub subscriber_blackwhite_listing: bool,
    /// The publisher can ask to receive its own event.
    pub publisher_exclusion: bool,
}

impl WampSerialize for PubSubFeatures {
    fn wamp_serialize(self) -> Result<Value, WampSerializeError> {
        let mut features = Dictionary::default();
        features.insert(
            "subscriber_blackwhite_listing".to_owned(),
            Value::Bool(self.subscriber_blackwhite_listing),
        );
        features.insert(
            "publisher_exclusion".to_owned(),
            Value::Bool(self.publisher_exclusion),
        );
        Ok(Value::Dictionary(features))
    }
}

/// Advanced features for WAMP peers, related to RPCs.
#[derive(Debug, Default, Clone)]
pub struct RpcFeatures {
    /// A caller may actively cancel a procedure call.
    pub call_canceling: bool,
    /// Procedures may produce progressive results.
    pub progressive_call_results: bool,
    /// The peer can enforce call timeouts.
    pub call_timeout: bool,
    /// The caller's identity may be disclosed to the callee.
    pub caller_identification: bool,
    /// Application payloads may bypass the session serializer.
    pub payload_transparency: bool,
}

impl WampSerialize for RpcFeatures {
    fn wamp_serialize(self) -> Result<Value, WampSerializeError> {
        let mut features = Dictionary::default();
        features.insert(
            "call_canceling".to_owned(),
            Value::Bool(self.call_canceling),
        );
        features.insert(
            "progressive_call_results".to_owned(),
            Value::Bool(self.progressive_call_results),
        );
        features.insert("call_timeout".to_owned(), Value::Bool(self.call_timeout));
        features.insert(
            "caller_identification".to_owned(),
            Value::Bool(self.caller_identification),
        );
        features.insert(
            "payload_transparency".to_owned(),
            Value::Bool(self.payload_transparency),
        );
        Ok(Value::Dictionary(features))
    }
}
