pub mod config;
pub mod raw_socket_transport;
pub mod transport;
pub mod web_socket_transport;
