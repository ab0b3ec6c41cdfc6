/// An authentication method for establishing a WAMP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Ticket-based authentication ("ticket").
    Ticket,
    /// Challenge-response authentication ("wampcra").
    WampCra,
}

impl TryFrom<&str> for AuthMethod {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ticket" => Ok(Self::Ticket),
            "wampcra" => Ok(Self::WampCra),
            _ => Err(Self::Error::msg(format!("invalid auth method: {value}"))),
        }
    }
}

impl From<AuthMethod> for &'static str {
    fn from(value: AuthMethod) -> Self {
        match value {
            AuthMethod::Ticket => "ticket",
            AuthMethod::WampCra => "wampcra",
        }
    }
}

impl From<AuthMethod> for String {
    fn from(value: AuthMethod) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}
