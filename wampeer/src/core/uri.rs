use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// Error for an invalid URI.
#[derive(Debug, Clone, Error)]
#[error("invalid URI")]
pub struct InvalidUri;

/// How empty components are treated when validating a URI.
///
/// The policy follows from how the URI will be matched: exact matching forbids empty components,
/// prefix matching allows only the trailing component to be empty, and wildcard matching allows
/// any component to be empty.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EmptyComponentPolicy {
    #[default]
    Disallowed,
    AllowLast,
    Allowed,
}

static STRICT_NONE_EMPTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]+)$").unwrap());
static STRICT_LAST_EMPTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]*)$").unwrap());
static STRICT_ANY_EMPTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-z_]*\.)*([0-9a-z_]*)$").unwrap());
static LOOSE_NONE_EMPTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s\.#]+\.)*([^\s\.#]+)$").unwrap());
static LOOSE_LAST_EMPTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s\.#]+\.)*([^\s\.#]*)$").unwrap());
static LOOSE_ANY_EMPTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s\.#]*\.)*([^\s\.#]*)$").unwrap());

/// Validates a URI against the selected grammar.
///
/// The strict grammar restricts components to `[0-9a-z_]+`; the loose grammar permits arbitrary
/// components excluding whitespace, `.`, and `#`.
pub fn validate_uri<S>(uri: S, strict: bool, empty: EmptyComponentPolicy) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    let re = match (strict, empty) {
        (true, EmptyComponentPolicy::Disallowed) => &STRICT_NONE_EMPTY,
        (true, EmptyComponentPolicy::AllowLast) => &STRICT_LAST_EMPTY,
        (true, EmptyComponentPolicy::Allowed) => &STRICT_ANY_EMPTY,
        (false, EmptyComponentPolicy::Disallowed) => &LOOSE_NONE_EMPTY,
        (false, EmptyComponentPolicy::AllowLast) => &LOOSE_LAST_EMPTY,
        (false, EmptyComponentPolicy::Allowed) => &LOOSE_ANY_EMPTY,
    };
    if !re.is_match(uri.as_ref()) {
        return Err(InvalidUri);
    }
    Ok(())
}

/// Validates a strict URI with no empty components.
pub fn validate_strict_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    validate_uri(uri, true, EmptyComponentPolicy::Disallowed)
}

/// Validates a URI with wildcard (empty) components allowed.
pub fn validate_wildcard_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    validate_uri(uri, false, EmptyComponentPolicy::Allowed)
}

/// A uniform resource identifier, used in many aspects of WAMP messaging for identifying
/// resources, such as realms, topics, and procedures.
///
/// No component may be empty. See [`WildcardUri`] for the pattern-capable variant.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping validation.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// Splits the URI into its components.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_uri(&value, false, EmptyComponentPolicy::Disallowed)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl TryFrom<WildcardUri> for Uri {
    type Error = InvalidUri;

    fn try_from(value: WildcardUri) -> Result<Self, Self::Error> {
        Self::try_from(value.0)
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Uri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

/// [`Uri`], but with empty (wildcard) components allowed.
///
/// Used where a URI may be a pattern rather than a name, such as prefix- or wildcard-matched
/// topics and procedures.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct WildcardUri(String);

impl WildcardUri {
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// Splits the URI into its components.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl Display for WildcardUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for WildcardUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WildcardUri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_wildcard_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for WildcardUri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl From<Uri> for WildcardUri {
    fn from(value: Uri) -> Self {
        Self(value.0)
    }
}

impl From<WildcardUri> for String {
    fn from(value: WildcardUri) -> Self {
        value.0
    }
}

struct WildcardUriVisitor;

impl<'de> Visitor<'de> for WildcardUriVisitor {
    type Value = WildcardUri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a wildcard URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        WildcardUri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for WildcardUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(WildcardUriVisitor)
    }
}
