pub mod connector;

mod connection;
mod peer;
mod requests;
mod session;

pub use connection::{
    ConnectExhaustedError,
    Connection,
    ConnectionConfig,
    is_fatal,
};
pub use peer::{
    Callee,
    Caller,
    Peer,
    PeerConfig,
    PeerNotConnectedError,
    Procedure,
    ProcedureOptions,
    ProgressivePendingRpc,
    Publisher,
    RpcCall,
    RpcResult,
    SimplePendingRpc,
    Subscriber,
    Subscription,
    SubscriptionOptions,
    SupportedAuthMethod,
};
pub use session::{
    Interrupt,
    Invocation,
    ProcedureMessage,
    PublishedEvent,
    ReceivedEvent,
    RpcYield,
    SessionDetails,
    SessionEvent,
};
