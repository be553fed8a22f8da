//! AI service identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A logical AI writer feeding commands into the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Story,
    Memory,
    State,
    StateWriter,
    Map,
}

impl ServiceKind {
    /// Source stamp placed on commands from this service.
    pub fn source(self) -> &'static str {
        match self {
            ServiceKind::Story => "ms:story",
            ServiceKind::Memory => "ms:memory",
            ServiceKind::State => "ms:state",
            ServiceKind::StateWriter => "ms:state-writer",
            ServiceKind::Map => "ms:map",
        }
    }

    /// Queue lane the service's calls run on.
    pub fn lane(self) -> &'static str {
        match self {
            ServiceKind::Story => "default",
            ServiceKind::Memory => "memory",
            ServiceKind::State | ServiceKind::StateWriter => "state",
            ServiceKind::Map => "map",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let name = normalized.strip_prefix("ms:").unwrap_or(&normalized);
        match name {
            "story" => Ok(ServiceKind::Story),
            "memory" => Ok(ServiceKind::Memory),
            "state" => Ok(ServiceKind::State),
            "state-writer" | "state_writer" => Ok(ServiceKind::StateWriter),
            "map" => Ok(ServiceKind::Map),
            _ => Err(format!("Unknown service: {}", s)),
        }
    }
}
