use anyhow::Result;
use async_trait::async_trait;

use crate::{
    auth::{
        auth_method::AuthMethod,
        authenticator::ClientAuthenticator,
    },
    core::types::Dictionary,
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
    },
};

/// A client authenticator answering a ticket challenge with a shared secret.
#[derive(Debug)]
pub struct TicketAuthenticator {
    id: String,
    ticket: String,
}

impl TicketAuthenticator {
    pub fn new(id: String, ticket: String) -> Self {
        Self { id, ticket }
    }
}

#[async_trait]
impl ClientAuthenticator for TicketAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Ticket
    }

    fn auth_id(&self) -> &str {
        &self.id
    }

    async fn handle_challenge(&self, _: &ChallengeMessage) -> Result<AuthenticateMessage> {
        Ok(AuthenticateMessage {
            signature: self.ticket.clone(),
            extra: Dictionary::default(),
        })
    }
}
