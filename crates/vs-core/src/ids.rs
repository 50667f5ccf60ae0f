//! Typed ID wrappers.
//!
//! Jobs are keyed by random UUIDs. Media entries carry a short opaque hex id
//! that is derived from their first known location, and storage sources are
//! keyed by the operator-chosen id from the config file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a newtype ID wrapper over `Uuid`.
macro_rules! typed_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// Create a new random ID.
                #[must_use]
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                /// Return the inner UUID value.
                #[must_use]
                pub fn as_uuid(&self) -> &Uuid {
                    &self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl From<Uuid> for $name {
                fn from(uuid: Uuid) -> Self {
                    Self(uuid)
                }
            }
        )+
    };
}

/// Generate a newtype ID wrapper over `String`.
macro_rules! string_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                /// Borrow the inner string.
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(s: &str) -> Self {
                    Self(s.to_string())
                }
            }

            impl From<String> for $name {
                fn from(s: String) -> Self {
                    Self(s)
                }
            }
        )+
    };
}

typed_id! {
    /// Unique identifier for an acquisition job.
    JobId,
}

string_id! {
    /// Identifier of a configured storage root.
    SourceId,
    /// Stable opaque identifier of a catalogued media file.
    MediaId,
}

/// Length (in hex characters) of a media id.
pub const MEDIA_ID_LEN: usize = 16;

impl MediaId {
    /// Derive the deterministic id for a first-seen `(source, rel_path)`.
    ///
    /// The same location always derives the same id; callers fall back to
    /// [`MediaId::random`] when the derived id is already taken elsewhere.
    pub fn derive(source_id: &SourceId, rel_path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(rel_path.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..MEDIA_ID_LEN].to_string())
    }

    /// A fresh random id of the same shape as [`MediaId::derive`].
    pub fn random() -> Self {
        let bytes: [u8; MEDIA_ID_LEN / 2] = rand::random();
        Self(hex::encode(bytes))
    }
}
