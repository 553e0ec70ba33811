//! Protocol knowledge attached to a backend
//!
//! A plugin knows how to tell that a server finished booting (a stdout line pattern), how
//! to ask it to shut down, what a "starting up" reply looks like on the wire, and how to
//! recognise a legitimate client handshake.

pub mod minecraft;
pub mod terraria;

use crate::backend::DEFAULT_FAKE_STATUS;
use regex::Regex;
use serde::Deserialize;
use std::fmt;

/// Plugin selector used in configuration and on the command line
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Any TCP server; ready as soon as spawned, accepts every client
    #[default]
    Generic,
    /// Minecraft Java edition server
    Minecraft,
    /// Terraria dedicated server
    Terraria,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Generic => "generic",
            PluginKind::Minecraft => "minecraft",
            PluginKind::Terraria => "terraria",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(PluginKind::Generic),
            "minecraft" => Ok(PluginKind::Minecraft),
            "terraria" => Ok(PluginKind::Terraria),
            other => Err(format!(
                "unknown plugin '{}' (expected generic, minecraft or terraria)",
                other
            )),
        }
    }
}

/// Compiled plugin behaviour
#[derive(Debug, Clone)]
pub struct Plugin {
    kind: PluginKind,
    ready_pattern: Option<Regex>,
    fake_status: Vec<u8>,
}

impl Plugin {
    pub fn new(kind: PluginKind) -> Self {
        let (ready_pattern, fake_status) = match kind {
            PluginKind::Generic => (None, DEFAULT_FAKE_STATUS.to_vec()),
            PluginKind::Minecraft => (
                Some(minecraft::ready_pattern()),
                minecraft::fake_status_packet(),
            ),
            PluginKind::Terraria => (
                Some(terraria::ready_pattern()),
                terraria::fake_status_packet(),
            ),
        };

        Self {
            kind,
            ready_pattern,
            fake_status,
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Command used when the configuration does not name one
    pub fn default_command(&self) -> Option<Vec<String>> {
        let parts: &[&str] = match self.kind {
            PluginKind::Generic => return None,
            PluginKind::Minecraft => minecraft::DEFAULT_COMMAND,
            PluginKind::Terraria => terraria::DEFAULT_COMMAND,
        };
        Some(parts.iter().map(|s| s.to_string()).collect())
    }

    /// Whether readiness is detected from the server's stdout
    pub fn watches_output(&self) -> bool {
        self.ready_pattern.is_some()
    }

    pub fn is_ready_line(&self, line: &str) -> bool {
        self.ready_pattern
            .as_ref()
            .map(|re| re.is_match(line))
            .unwrap_or(true)
    }

    /// Console command written to stdin to stop the server, if it has one
    pub fn stop_command(&self) -> Option<&'static str> {
        match self.kind {
            PluginKind::Generic => None,
            PluginKind::Minecraft => Some(minecraft::STOP_COMMAND),
            PluginKind::Terraria => Some(terraria::STOP_COMMAND),
        }
    }

    pub fn validates_clients(&self) -> bool {
        self.kind != PluginKind::Generic
    }

    pub fn is_valid_connection(&self, initial: &[u8]) -> bool {
        match self.kind {
            PluginKind::Generic => true,
            PluginKind::Minecraft => minecraft::is_valid_handshake(initial),
            PluginKind::Terraria => terraria::is_valid_connect_request(initial),
        }
    }

    pub fn fake_status(&self) -> &[u8] {
        &self.fake_status
    }
}

impl Default for Plugin {
    fn default() -> Self {
        Self::new(PluginKind::Generic)
    }
}
