//! Strongly-typed identifiers for MaxQ entities.
//!
//! Every identifier is a ULID carrying a short type tag (`run_`, `stg_`,
//! `log_`, `wrk_`). The tag travels with the id in every representation —
//! JSON payloads, database rows, `MAXQ_RUN_ID` in child environments — and
//! parsing is strict about it, so an id of one entity type can never be
//! read back as another. Step ids are absent here on purpose: flow authors
//! choose them, and they are validated as names instead.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when a tagged id fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
    /// The value does not carry the expected type tag.
    WrongTag {
        expected: &'static str,
        found: String,
    },
    /// The part after the tag is not a valid ULID.
    MalformedUlid { reason: String },
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongTag { expected, found } => {
                write!(f, "expected an id tagged '{expected}_', got '{found}'")
            }
            Self::MalformedUlid { reason } => write!(f, "malformed ulid: {reason}"),
        }
    }
}

impl std::error::Error for ParseIdError {}

/// Splits `value` into its tag and ULID body, requiring an exact tag match.
fn parse_tagged(expected: &'static str, value: &str) -> Result<Ulid, ParseIdError> {
    let body = value
        .strip_prefix(expected)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| ParseIdError::WrongTag {
            expected,
            found: value.to_string(),
        })?;

    Ulid::from_string(body).map_err(|e| ParseIdError::MalformedUlid {
        reason: e.to_string(),
    })
}

/// Defines a tagged ULID id type.
///
/// The string form (`Display`, serde, `FromStr`) is always `{tag}_{ulid}`;
/// there is no untagged escape hatch.
macro_rules! tagged_id {
    ($(#[$meta:meta])* $name:ident => $tag:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Ulid);

        impl $name {
            /// Mints a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// The type tag carried by this id's string form.
            #[must_use]
            pub const fn tag() -> &'static str {
                $tag
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "_{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_tagged($tag, s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(D::Error::custom)
            }
        }
    };
}

tagged_id!(
    /// Identifier of a single execution (run) of a flow.
    RunId => "run"
);

tagged_id!(
    /// Identifier of a stage within a run.
    StageId => "stg"
);

tagged_id!(
    /// Identifier of a run log entry.
    RunLogId => "log"
);

tagged_id!(
    /// Identity of a scheduler worker, stamped onto step claims.
    WorkerId => "wrk"
);
