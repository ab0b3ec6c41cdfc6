use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use base64::Engine;
use hmac::{
    Hmac,
    Mac,
};
use sha2::Sha256;

use crate::{
    auth::{
        auth_method::AuthMethod,
        authenticator::ClientAuthenticator,
    },
    core::types::{
        Dictionary,
        Value,
    },
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
    },
};

type HmacSha256 = Hmac<Sha256>;

fn signature(key: &[u8], challenge: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(Error::new)?;
    mac.update(challenge.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// A client authenticator implementing WAMP challenge-response authentication.
///
/// The challenge extra may carry `salt`, `iterations`, and `keylen` to demand a PBKDF2-derived
/// key instead of the raw shared secret.
#[derive(Debug)]
pub struct WampCraAuthenticator {
    id: String,
    secret: String,
}

impl WampCraAuthenticator {
    pub fn new(id: String, secret: String) -> Self {
        Self { id, secret }
    }

    fn derive_key(&self, extra: &Dictionary) -> Result<Vec<u8>> {
        let salt = match extra.get("salt") {
            Some(Value::String(salt)) => salt,
            Some(_) => return Err(Error::msg("challenge salt must be a string")),
            None => return Ok(self.secret.clone().into_bytes()),
        };
        let iterations = match extra.get("iterations") {
            Some(value) => value
                .integer()
                .ok_or_else(|| Error::msg("challenge iterations must be an integer"))?
                as u32,
            None => 1000,
        };
        let keylen = match extra.get("keylen") {
            Some(value) => value
                .integer()
                .ok_or_else(|| Error::msg("challenge keylen must be an integer"))?
                as usize,
            None => 32,
        };
        let mut key = vec![0; keylen];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.secret.as_bytes(),
            salt.as_bytes(),
            iterations,
            &mut key,
        );
        // The derived key is exchanged in its base64 form.
        Ok(base64::engine::general_purpose::STANDARD
            .encode(key)
            .into_bytes())
    }
}

#[async_trait]
impl ClientAuthenticator for WampCraAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::WampCra
    }

    fn auth_id(&self) -> &str {
        &self.id
    }

    async fn handle_challenge(&self, challenge: &ChallengeMessage) -> Result<AuthenticateMessage> {
        let value = match challenge.extra.get("challenge") {
            Some(Value::String(value)) => value,
            _ => return Err(Error::msg("challenge extra must carry a challenge string")),
        };
        let key = self.derive_key(&challenge.extra)?;
        Ok(AuthenticateMessage {
            signature: signature(&key, value)?,
            extra: Dictionary::default(),
        })
    }
}

#[cfg(test)]
mod wampcra_test {
    use crate::{
        auth::{
            authenticator::ClientAuthenticator,
            wampcra::WampCraAuthenticator,
        },
        core::types::{
            Dictionary,
            Value,
        },
        message::message::ChallengeMessage,
    };

    #[tokio::test]
    async fn signs_challenge_with_raw_secret() {
        let authenticator = WampCraAuthenticator::new("peer".to_owned(), "secret123".to_owned());
        let challenge = ChallengeMessage {
            auth_method: "wampcra".to_owned(),
            extra: Dictionary::from_iter([(
                "challenge".to_owned(),
                Value::from(r#"{"nonce": "abc"}"#),
            )]),
        };
        let first = authenticator.handle_challenge(&challenge).await.unwrap();
        let second = authenticator.handle_challenge(&challenge).await.unwrap();
        // HMAC is deterministic for a fixed secret and challenge.
        assert_eq!(first.signature, second.signature);
        assert!(!first.signature.is_empty());
    }

    #[tokio::test]
    async fn derives_salted_keys() {
        let authenticator = WampCraAuthenticator::new("peer".to_owned(), "secret123".to_owned());
        let unsalted = ChallengeMessage {
            auth_method: "wampcra".to_owned(),
            extra: Dictionary::from_iter([("challenge".to_owned(), Value::from("abc"))]),
        };
        let salted = ChallengeMessage {
            auth_method: "wampcra".to_owned(),
            extra: Dictionary::from_iter([
                ("challenge".to_owned(), Value::from("abc")),
                ("salt".to_owned(), Value::from("pepper")),
                ("iterations".to_owned(), Value::Integer(100)),
                ("keylen".to_owned(), Value::Integer(32)),
            ]),
        };
        let unsalted = authenticator.handle_challenge(&unsalted).await.unwrap();
        let salted = authenticator.handle_challenge(&salted).await.unwrap();
        assert_ne!(unsalted.signature, salted.signature);
    }

    #[tokio::test]
    async fn rejects_challenge_without_challenge_string() {
        let authenticator = WampCraAuthenticator::new("peer".to_owned(), "secret123".to_owned());
        let challenge = ChallengeMessage {
            auth_method: "wampcra".to_owned(),
            extra: Dictionary::default(),
        };
        assert_matches::assert_matches!(
            authenticator.handle_challenge(&challenge).await,
            Err(err) => {
                assert!(err.to_string().contains("challenge string"));
            }
        );
    }
}
