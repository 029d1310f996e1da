//! Opaque handles assigned by the transport adapter.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

handle_type!(
    /// One logical peer link. Unique for the lifetime of the link; adapters
    /// allocate these monotonically so a live registry entry is never aliased.
    ConnectionHandle,
    "#"
);

handle_type!(
    /// A listening socket created by `Transport::listen`.
    ListenSocketHandle,
    "listen#"
);

handle_type!(
    /// A group of connections that can be drained with a single poll call.
    PollGroupHandle,
    "group#"
);

/// Server-side name for a connected peer. Same value as its connection handle.
pub type ClientId = ConnectionHandle;
