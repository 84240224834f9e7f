//! Outgoing commands and their acknowledgements.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Correlation id assigned by the engine to every command it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of instruction a command is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandClass {
    /// Causes mechanical motion (moves, homing)
    Motion,
    /// Reads information back (settings, build info)
    Query,
    /// Changes controller configuration or mode (unlock, report interval)
    Config,
}

/// A command owned by the engine for its whole lifetime.
#[derive(Debug, Clone)]
pub struct Command {
    /// Correlation id
    pub id: CommandId,
    /// Line as written, without terminator
    pub text: String,
    /// What kind of command this is
    pub class: CommandClass,
    /// When the caller submitted it
    pub issued_at: Instant,
}

impl Command {
    /// New command, stamped now.
    pub fn new(id: CommandId, text: impl Into<String>, class: CommandClass) -> Self {
        Self {
            id,
            text: text.into(),
            class,
            issued_at: Instant::now(),
        }
    }
}

/// Successful reply to one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// Correlation id
    pub id: CommandId,
    /// Text of the acknowledged command
    pub command: String,
    /// Informational lines (`[...]`, `$n=v`) received before the `ok`
    pub lines: Vec<String>,
    /// How many times the command was written
    pub attempts: u32,
    /// Time from first write to `ok`
    pub latency: Duration,
}

impl Ack {
    /// Value of a `$key=value` payload line, if present.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let rest = line.strip_prefix('$')?;
            let (k, v) = rest.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_setting_lookup() {
        let ack = Ack {
            id: CommandId(7),
            command: "$$".to_string(),
            lines: vec!["$100=80.000".to_string(), "$110=5000.000".to_string()],
            attempts: 1,
            latency: Duration::from_millis(3),
        };
        assert_eq!(ack.setting("110"), Some("5000.000"));
        assert_eq!(ack.setting("120"), None);
        assert_eq!(ack.id.to_string(), "#7");
    }
}
