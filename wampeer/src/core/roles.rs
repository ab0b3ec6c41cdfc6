use crate::core::{
    features::{
        PubSubFeatures,
        RpcFeatures,
    },
    types::{
        Dictionary,
        Value,
        WampDeserializeError,
        WampSerialize,
        WampSerializeError,
    },
};

/// A role a peer can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl TryFrom<&str> for PeerRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err(Self::Error::msg(format!("invalid peer role: {value}"))),
        }
    }
}

impl From<PeerRole> for &'static str {
    fn from(value: PeerRole) -> Self {
        match value {
            PeerRole::Caller => "caller",
            PeerRole::Callee => "callee",
            PeerRole::Publisher => "publisher",
            PeerRole::Subscriber => "subscriber",
        }
    }
}

impl From<PeerRole> for String {
    fn from(value: PeerRole) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}

/// A role a router can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouterRole {
    // Supports RPC calls.
    Dealer,
    // Supports pub/sub.
    Broker,
}

impl TryFrom<&str> for RouterRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "dealer" => Ok(Self::Dealer),
            "broker" => Ok(Self::Broker),
            _ => Err(Self::Error::msg(format!("invalid router role: {value}"))),
        }
    }
}

impl From<RouterRole> for &'static str {
    fn from(value: RouterRole) -> Self {
        match value {
            RouterRole::Dealer => "dealer",
            RouterRole::Broker => "broker",
        }
    }
}

impl From<RouterRole> for String {
    fn from(value: RouterRole) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}

/// The set of roles a peer announces in its HELLO message, along with the advanced features each
/// role implements.
#[derive(Debug, Default, Clone)]
pub struct PeerRoles {
    pub roles: ahash::HashSet<PeerRole>,
    pub pub_sub_features: PubSubFeatures,
    pub rpc_features: RpcFeatures,
}

impl PeerRoles {
    pub fn new<I>(roles: I, pub_sub_features: PubSubFeatures, rpc_features: RpcFeatures) -> Self
    where
        I: Iterator<Item = PeerRole>,
    {
        Self {
            roles: roles.collect(),
            pub_sub_features,
            rpc_features,
        }
    }
}

impl WampSerialize for PeerRoles {
    fn wamp_serialize(self) -> Result<Value, WampSerializeError> {
        let mut roles = Dictionary::default();
        for role in self.roles {
            let features = match role {
                PeerRole::Caller | PeerRole::Callee => self.rpc_features.clone().wamp_serialize()?,
                PeerRole::Publisher | PeerRole::Subscriber => {
                    self.pub_sub_features.clone().wamp_serialize()?
                }
            };
            let mut entry = Dictionary::default();
            entry.insert("features".to_owned(), features);
            roles.insert(role.into(), Value::Dictionary(entry));
        }
        Ok(Value::Dictionary(roles))
    }
}

/// The set of roles a router announced in its WELCOME message.
#[derive(Debug, Default, Clone)]
pub struct RouterRoles {
    pub roles: ahash::HashSet<RouterRole>,
}

impl RouterRoles {
    /// Whether the router announced the role.
    pub fn has_role(&self, role: RouterRole) -> bool {
        self.roles.contains(&role)
    }
}

impl TryFrom<&Dictionary> for RouterRoles {
    type Error = WampDeserializeError;
    fn try_from(details: &Dictionary) -> Result<Self, Self::Error> {
        let mut roles = ahash::HashSet::default();
        match details.get("roles") {
            Some(Value::Dictionary(dict)) => {
                for role in dict.keys() {
                    // Unknown roles are ignored for forward compatibility.
                    if let Ok(role) = RouterRole::try_from(role.as_str()) {
                        roles.insert(role);
                    }
                }
            }
            Some(_) => {
                return Err(WampDeserializeError::new(
                    "roles must be a dictionary of role names",
                ));
            }
            None => (),
        }
        Ok(Self { roles })
    }
}

#[cfg(test)]
mod roles_test {
    use crate::core::{
        features::{
            PubSubFeatures,
            RpcFeatures,
        },
        roles::{
            PeerRole,
            PeerRoles,
            RouterRole,
            RouterRoles,
        },
        types::{
            Dictionary,
            Value,
            WampSerialize,
        },
    };

    #[test]
    fn serializes_peer_roles_with_features() {
        let roles = PeerRoles::new(
            [PeerRole::Caller, PeerRole::Subscriber].into_iter(),
            PubSubFeatures::default(),
            RpcFeatures {
                call_canceling: true,
                ..Default::default()
            },
        );
        assert_matches::assert_matches!(roles.wamp_serialize(), Ok(Value::Dictionary(dict)) => {
            assert_matches::assert_matches!(dict.get("caller"), Some(Value::Dictionary(caller)) => {
                assert_matches::assert_matches!(caller.get("features"), Some(Value::Dictionary(features)) => {
                    assert_eq!(features.get("call_canceling"), Some(&Value::Bool(true)));
                });
            });
            assert!(dict.contains_key("subscriber"));
            assert!(!dict.contains_key("callee"));
        });
    }

    #[test]
    fn parses_router_roles_from_details() {
        let details = Dictionary::from_iter([(
            "roles".to_owned(),
            Value::Dictionary(Dictionary::from_iter([
                ("dealer".to_owned(), Value::Dictionary(Dictionary::default())),
                ("broker".to_owned(), Value::Dictionary(Dictionary::default())),
            ])),
        )]);
        assert_matches::assert_matches!(RouterRoles::try_from(&details), Ok(roles) => {
            assert!(roles.has_role(RouterRole::Dealer));
            assert!(roles.has_role(RouterRole::Broker));
        });
    }
}
