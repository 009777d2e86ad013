use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::borrow::Borrow;
use std::fmt;

new_key_type! {
    /// Internal storage key for a node in the graph store.
    pub struct NodeKey;

    /// Internal storage key for a connection in the graph store.
    pub struct ConnectionKey;
}

/// Declares a caller-supplied string identifier.
///
/// The generated type hashes and compares exactly like `str`, so maps keyed
/// by it can be queried with a plain `&str`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// An id made only of whitespace counts as missing.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id! {
    /// Identifies a node (producer, consumer, storage or converter).
    NodeId
}

string_id! {
    /// Identifies a connection between two nodes.
    ConnectionId
}

string_id! {
    /// Identifies a conversion recipe.
    RecipeId
}

string_id! {
    /// Identifies a conversion chain definition.
    ChainId
}

string_id! {
    /// Identifies a technology in the host's research system.
    TechId
}

string_id! {
    /// A kind of resource carried through the network ("minerals", "energy", ...).
    ResourceType
}

/// Identifies a running or finished conversion process. Assigned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

/// Identifies one execution of a conversion chain. Assigned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process-{}", self.0)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution-{}", self.0)
    }
}
