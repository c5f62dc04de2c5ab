use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// Row ids are sqlite AUTOINCREMENT keys; wrappers stop session and message ids from mixing.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i64);

        impl $name {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = raw.trim().parse::<i64>().context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub const fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(SessionId, "session-id");
define_storage_id!(MessageId, "message-id");
