use std::fmt::Display;

use futures_util::lock::Mutex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

use crate::core::types::Integer;

/// An integer ID, used for identification of resources and requests.
///
/// IDs are bounded above by 2^53 so that they survive codecs constrained to double-precision
/// floating point integers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    /// The minimum allowable value of an ID.
    pub const MIN: Id = Id(0);

    /// The maximum allowable value of an ID.
    pub const MAX: Id = Id(1 << 53);

    /// The ID value, as an integer.
    pub fn value(&self) -> Integer {
        self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Error for an ID being out of range.
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: i128,
}

impl IdOutOfRange {
    fn new(value: i128) -> Self {
        Self { value }
    }
}

/// Validates that an integer is in the allowable range for IDs.
pub fn check_id(value: i128) -> Result<(), IdOutOfRange> {
    if value < Id::MIN.0 as i128 || value > Id::MAX.0 as i128 {
        Err(IdOutOfRange::new(value))
    } else {
        Ok(())
    }
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        check_id(value as i128)?;
        Ok(Id(value))
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// An ID allocator that generates request IDs sequentially.
///
/// Session-scoped: every outstanding request on a session gets an ID unique among all
/// outstanding requests, regardless of kind.
#[derive(Debug, Default)]
pub struct SequentialIdAllocator {
    next: Mutex<u64>,
}

impl SequentialIdAllocator {
    /// Generates a new ID.
    pub async fn generate_id(&self) -> Id {
        let mut lock = self.next.lock().await;
        let next = if *lock >= Id::MAX.0 { 1 } else { *lock + 1 };
        *lock = next;
        Id(next)
    }

    /// Resets the allocator to its initial state.
    pub async fn reset(&self) {
        let mut lock = self.next.lock().await;
        *lock = 0;
    }
}

#[cfg(test)]
mod id_test {
    use crate::core::id::{
        Id,
        SequentialIdAllocator,
        check_id,
    };

    #[test]
    fn validates_id_range() {
        assert_matches::assert_matches!(check_id(0), Ok(()));
        assert_matches::assert_matches!(check_id(1), Ok(()));
        assert_matches::assert_matches!(check_id(9007199254740992), Ok(()));
        assert_matches::assert_matches!(check_id(-1), Err(_));
        assert_matches::assert_matches!(check_id(9007199254740993), Err(_));
    }

    #[test]
    fn fails_deserialization_out_of_range() {
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"9007199254740993"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"-1"#), Err(_));
    }

    #[tokio::test]
    async fn allocates_ids_sequentially() {
        let allocator = SequentialIdAllocator::default();
        assert_eq!(allocator.generate_id().await, Id::try_from(1).unwrap());
        assert_eq!(allocator.generate_id().await, Id::try_from(2).unwrap());
        assert_eq!(allocator.generate_id().await, Id::try_from(3).unwrap());
        allocator.reset().await;
        assert_eq!(allocator.generate_id().await, Id::try_from(1).unwrap());
    }
}
