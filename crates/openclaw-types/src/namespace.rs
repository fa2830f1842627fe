//! The closed set of logical keyspaces served by the storage layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StorageError;

/// A logical keyspace. Keys within a namespace are opaque strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Session index entries (JSON documents).
    Sessions,
    /// Conversation transcripts (one JSON object per line).
    Transcripts,
    /// Credentials and tokens.
    Auth,
    /// Runtime configuration documents.
    Config,
}

impl Namespace {
    /// All namespaces, in diagnostic display order.
    pub const ALL: [Namespace; 4] = [
        Namespace::Sessions,
        Namespace::Transcripts,
        Namespace::Auth,
        Namespace::Config,
    ];

    /// Lowercase tag used in file paths, actor ids, and secret names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Sessions => "sessions",
            Namespace::Transcripts => "transcripts",
            Namespace::Auth => "auth",
            Namespace::Config => "config",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sessions" => Ok(Namespace::Sessions),
            "transcripts" => Ok(Namespace::Transcripts),
            "auth" => Ok(Namespace::Auth),
            "config" => Ok(Namespace::Config),
            other => Err(StorageError::InvalidArgument(format!(
                "Unknown namespace '{other}' (expected sessions, transcripts, auth, or config)"
            ))),
        }
    }
}
