//! Branded ID newtypes for type safety.
//!
//! Every entity has a distinct ID type implemented as a newtype wrapper
//! around `String`, so a batch ID can never be passed where a run ID is
//! expected. Minted values are prefixed UUID v7 (time-ordered) strings,
//! e.g. `run_0190f8a2-…`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a new ID with this type's prefix (UUID v7, time-ordered).
            #[must_use]
            pub fn mint() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            /// Wrap an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// The inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

branded_id!(
    /// Identifies one run (one directory under `runs/`).
    RunId, "run"
);
branded_id!(
    /// Task identifier carried in the working set.
    TaskId, "task"
);
branded_id!(
    /// Thread identifier carried in the working set.
    ThreadId, "thread"
);
branded_id!(
    /// Identifies one ledger event.
    EventId, "evt"
);
branded_id!(
    /// Identifies one sealed episode.
    EpisodeId, "ep"
);
branded_id!(
    /// Identifies one proposed memory batch.
    BatchId, "batch"
);
branded_id!(
    /// Identifies one long-term memory item.
    MemoryId, "mem"
);
branded_id!(
    /// Identifies one resume pack.
    PackId, "pack"
);
branded_id!(
    /// One-shot credential minted by an episode seal.
    MilestoneToken, "tok"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_carry_prefix() {
        assert!(RunId::mint().as_str().starts_with("run_"));
        assert!(EventId::mint().as_str().starts_with("evt_"));
        assert!(MilestoneToken::mint().as_str().starts_with("tok_"));
    }

    #[test]
    fn minted_ids_are_unique() {
        let a = BatchId::mint();
        let b = BatchId::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_transparently() {
        let id = RunId::from("run_abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"run_abc\"");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_matches_inner() {
        let id = PackId::from("pack_1");
        assert_eq!(id.to_string(), "pack_1");
        assert_eq!(id.into_inner(), "pack_1");
    }
}
