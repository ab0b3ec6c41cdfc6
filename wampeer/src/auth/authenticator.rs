use anyhow::Result;
use async_trait::async_trait;

use crate::{
    auth::auth_method::AuthMethod,
    core::types::Dictionary,
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
        WelcomeMessage,
    },
};

/// Module for handling client-side authentication for WAMP sessions.
///
/// The session state machine invokes the configured authenticator when the router challenges the
/// HELLO; a failing authenticator aborts session establishment.
#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Authentication method.
    fn auth_method(&self) -> AuthMethod;

    /// The authentication ID announced in the HELLO message.
    fn auth_id(&self) -> &str;

    /// Extra values merged into the HELLO message's `authextra`.
    async fn hello_extra(&self) -> Result<Dictionary> {
        Ok(Dictionary::default())
    }

    /// Handles the router's authentication challenge.
    async fn handle_challenge(&self, challenge: &ChallengeMessage) -> Result<AuthenticateMessage>;

    /// Verifies the router's WELCOME after authentication, for methods with mutual
    /// authentication.
    async fn verify_welcome(&self, _welcome: &WelcomeMessage) -> Result<()> {
        Ok(())
    }
}
