mod connector;
mod raw_socket_connector;
mod web_socket_connector;

pub use connector::{
    Connection,
    Connector,
    ConnectorFactory,
    DefaultConnectorFactory,
    new_connector,
};
pub use raw_socket_connector::RawSocketConnector;
pub use web_socket_connector::WebSocketConnector;
