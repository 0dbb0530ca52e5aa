use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ClientId);
id_newtype!(ConversationId);

/// Position of an entry inside a log, rendered as `<timestamp_ms>-<sequence>`.
///
/// Ordering compares the millisecond part first, then the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid entry id '{0}', expected <timestamp>-<sequence>")]
pub struct EntryIdParseError(pub String);

impl EntryId {
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };
    pub const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The next id a log may hand out after `self` when the clock reads `now_ms`.
    pub fn successor(self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else if self.seq == u64::MAX {
            Self {
                ms: self.ms + 1,
                seq: 0,
            }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }

    /// The greatest id strictly lower than `self`, or `None` for [`EntryId::MIN`].
    pub fn predecessor(self) -> Option<Self> {
        match (self.ms, self.seq) {
            (0, 0) => None,
            (ms, 0) => Some(Self {
                ms: ms - 1,
                seq: u64::MAX,
            }),
            (ms, seq) => Some(Self { ms, seq: seq - 1 }),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = EntryIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.split_once('-') {
            Some((ms, seq)) => ms.parse::<u64>().ok().zip(seq.parse::<u64>().ok()),
            None => trimmed.parse::<u64>().ok().map(|ms| (ms, 0)),
        };
        parsed
            .map(|(ms, seq)| EntryId { ms, seq })
            .ok_or_else(|| EntryIdParseError(s.to_string()))
    }
}

impl TryFrom<String> for EntryId {
    type Error = EntryIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(value: EntryId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_order_by_timestamp_then_sequence() {
        let a: EntryId = "1700000000000-5".parse().expect("a");
        let b: EntryId = "1700000000000-12".parse().expect("b");
        let c: EntryId = "1700000000001-0".parse().expect("c");
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "1700000000000-12");
    }

    #[test]
    fn bare_timestamp_parses_with_zero_sequence() {
        let id: EntryId = "42".parse().expect("id");
        assert_eq!(id, EntryId::new(42, 0));
        assert!("42-x".parse::<EntryId>().is_err());
        assert!("".parse::<EntryId>().is_err());
    }

    #[test]
    fn successor_never_goes_backwards_when_clock_does() {
        let last = EntryId::new(1_000, 7);
        assert_eq!(last.successor(900), EntryId::new(1_000, 8));
        assert_eq!(last.successor(1_000), EntryId::new(1_000, 8));
        assert_eq!(last.successor(1_001), EntryId::new(1_001, 0));
    }

    #[test]
    fn predecessor_steps_back_across_milliseconds() {
        assert_eq!(EntryId::new(5, 3).predecessor(), Some(EntryId::new(5, 2)));
        assert_eq!(
            EntryId::new(5, 0).predecessor(),
            Some(EntryId::new(4, u64::MAX))
        );
        assert_eq!(EntryId::MIN.predecessor(), None);
    }

    #[test]
    fn entry_id_serializes_as_string() {
        let json = serde_json::to_string(&EntryId::new(12, 3)).expect("json");
        assert_eq!(json, "\"12-3\"");
        let back: EntryId = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, EntryId::new(12, 3));
    }
}
