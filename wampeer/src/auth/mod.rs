mod auth_method;
mod authenticator;
mod ticket;
mod wampcra;

pub use auth_method::AuthMethod;
pub use authenticator::ClientAuthenticator;
pub use ticket::TicketAuthenticator;
pub use wampcra::WampCraAuthenticator;
