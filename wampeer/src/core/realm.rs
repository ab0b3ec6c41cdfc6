use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Error for an invalid realm name.
#[derive(Debug, Clone, Error)]
#[error("invalid realm name")]
pub struct InvalidRealmName;

/// The category a realm name falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmCategory {
    /// An ordinary realm name.
    Standalone,
    /// A 0x-prefixed Ethereum address.
    Eth,
    /// An ENS name (`*.eth`).
    Ens,
    /// A reverse ENS name (`eth.*`).
    ReverseEns,
}

static REALM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_\-@.]{2,254}$").unwrap());
static ETH_ADDRESS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap());

/// Checks whether the value is a 0x-prefixed, 40-hex-digit Ethereum address.
///
/// Checked independently of the general realm name pattern, since an Ethereum address does not
/// start with a letter.
pub fn is_eth_address<S>(value: S) -> bool
where
    S: AsRef<str>,
{
    ETH_ADDRESS.is_match(value.as_ref())
}

/// Validates a realm name, classifying it into its [`RealmCategory`].
pub fn validate_realm_name<S>(name: S) -> Result<RealmCategory, InvalidRealmName>
where
    S: AsRef<str>,
{
    let name = name.as_ref();
    if is_eth_address(name) {
        return Ok(RealmCategory::Eth);
    }
    if !REALM_NAME.is_match(name) {
        return Err(InvalidRealmName);
    }
    if name.ends_with(".eth") {
        Ok(RealmCategory::Ens)
    } else if name.starts_with("eth.") {
        Ok(RealmCategory::ReverseEns)
    } else {
        Ok(RealmCategory::Standalone)
    }
}
