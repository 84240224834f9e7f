//! GRBL 1.1 / FluidNC line grammar.
//!
//! Reference: grbl `doc/markdown/interface.md` ("Real-time Status Reports",
//! "Grbl Response Messages").
//!
//! Outbound commands are plain ASCII lines. Real-time commands are single bytes
//! that the controller acts on immediately, even in the middle of a line:
//!
//! | byte   | meaning        |
//! |--------|----------------|
//! | `?`    | status report  |
//! | `!`    | feed hold      |
//! | `~`    | cycle resume   |
//! | `0x18` | soft reset     |
//!
//! Inbound lines are classified by [`classify`]:
//!
//! ```text
//! ok                                  -> reply to the in-flight command
//! error:9                             -> rejection of the in-flight command
//! [MSG:Caution: Unlocked]             -> informational payload
//! $110=5000.000                       -> informational payload (setting)
//! <Idle|MPos:1.000,2.000,3.000,0.000|FS:0,0>  -> status report
//! ALARM:1                             -> asynchronous alarm
//! Grbl 1.1h ['$' for help]            -> welcome banner after reset
//! ```

use std::time::Duration;

use crate::core::{Axis, MachineState, Position4D};

/// Real-time status query.
pub const STATUS_QUERY: u8 = b'?';
/// Real-time feed hold.
pub const FEED_HOLD: u8 = b'!';
/// Real-time cycle start / resume.
pub const CYCLE_RESUME: u8 = b'~';
/// Real-time soft reset (Ctrl-X).
pub const SOFT_RESET: u8 = 0x18;

/// Kill alarm lock.
pub const UNLOCK: &str = "$X";
/// Run homing cycle.
pub const HOME: &str = "$H";

/// One parsed `<...>` status report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// State keyword mapped onto the machine state
    pub state: MachineState,
    /// Machine (or work) position in x, y, z, c order; missing fields are zero.
    pub position: [f64; 4],
}

/// Classification of one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// `ok`
    Ok,
    /// `error:<code>`
    Error(u16),
    /// `ALARM:<code>`
    Alarm(u16),
    /// `<...>`
    Status(StatusReport),
    /// `[...]` or `$n=v`: part of the in-flight reply
    Info(String),
    /// Controller banner printed after power-up or reset
    Welcome(String),
    /// Anything unparseable
    Noise(String),
}

/// Classify a line read from the controller (terminator already stripped).
pub fn classify(line: &str) -> Incoming {
    let line = line.trim();

    if line.eq_ignore_ascii_case("ok") {
        return Incoming::Ok;
    }

    if let Some(code) = line.strip_prefix("error:") {
        return match code.trim().parse() {
            Ok(code) => Incoming::Error(code),
            Err(_) => Incoming::Noise(line.to_string()),
        };
    }

    if let Some(code) = line.strip_prefix("ALARM:") {
        return match code.trim().parse() {
            Ok(code) => Incoming::Alarm(code),
            Err(_) => Incoming::Noise(line.to_string()),
        };
    }

    if line.starts_with('<') {
        return match parse_status(line) {
            Some(report) => Incoming::Status(report),
            None => Incoming::Noise(line.to_string()),
        };
    }

    if line.starts_with("Grbl ") || line.starts_with("FluidNC ") {
        return Incoming::Welcome(line.to_string());
    }

    if (line.starts_with('[') && line.ends_with(']')) || is_setting_line(line) {
        return Incoming::Info(line.to_string());
    }

    Incoming::Noise(line.to_string())
}

fn is_setting_line(line: &str) -> bool {
    match line.strip_prefix('$') {
        Some(rest) => match rest.split_once('=') {
            Some((key, _)) => !key.is_empty() && !key.contains(char::is_whitespace),
            None => false,
        },
        None => false,
    }
}

/// Map a status keyword (`Idle`, `Run`, `Hold:0`, ...) to a machine state.
pub fn parse_state_keyword(keyword: &str) -> Option<MachineState> {
    let base = keyword.split(':').next().unwrap_or(keyword);
    match base {
        "Idle" | "Check" | "Sleep" => Some(MachineState::Idle),
        "Run" | "Jog" => Some(MachineState::Moving),
        "Home" => Some(MachineState::Homing),
        "Alarm" => Some(MachineState::Alarm),
        "Hold" | "Door" => Some(MachineState::Hold),
        _ => None,
    }
}

/// Parse a complete `<State|MPos:...|...>` report.
///
/// Partial lines (missing either bracket), unknown states and reports without a
/// position field return `None`.
pub fn parse_status(line: &str) -> Option<StatusReport> {
    let body = line.strip_prefix('<')?.strip_suffix('>')?;
    let mut fields = body.split('|');

    let state = parse_state_keyword(fields.next()?)?;

    let mut position = None;
    for field in fields {
        let values = field
            .strip_prefix("MPos:")
            .or_else(|| field.strip_prefix("WPos:"));
        if let Some(values) = values {
            position = Some(parse_axis_values(values)?);
            break;
        }
    }

    Some(StatusReport {
        state,
        position: position?,
    })
}

fn parse_axis_values(values: &str) -> Option<[f64; 4]> {
    let mut position = [0.0; 4];
    let mut count = 0;
    for (slot, raw) in values.split(',').enumerate() {
        if slot >= 6 {
            return None;
        }
        let value: f64 = raw.trim().parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        if slot < 4 {
            position[slot] = value;
        }
        count += 1;
    }
    if count < 3 {
        return None;
    }
    Some(position)
}

/// Build one combined four-axis absolute linear move.
///
/// Always absolute: re-sending after a lost ack drives to the same target.
pub fn motion_command(target: &Position4D, feedrate: f64) -> String {
    let mut command = String::from("G90 G1");
    for axis in Axis::ALL {
        command.push_str(&format!(" {}{:.3}", axis.letter(), target[axis]));
    }
    command.push_str(&format!(" F{:.1}", feedrate));
    command
}

/// FluidNC auto-report interval setting.
pub fn report_interval_command(interval: Duration) -> String {
    format!("$Report/Interval={}", interval.as_millis())
}

/// Split a G-code line into `(letter, value)` words.
///
/// Returns `None` if any word is malformed. Comments in parentheses and after
/// `;` are ignored.
pub fn gcode_words(line: &str) -> Option<Vec<(char, f64)>> {
    let mut cleaned = String::with_capacity(line.len());
    let mut in_comment = false;
    for ch in line.chars() {
        match ch {
            '(' => in_comment = true,
            ')' => in_comment = false,
            ';' => break,
            _ if !in_comment && !ch.is_whitespace() => cleaned.push(ch.to_ascii_uppercase()),
            _ => {}
        }
    }

    let mut words = Vec::new();
    let mut chars = cleaned.chars().peekable();
    while let Some(letter) = chars.next() {
        if !letter.is_ascii_alphabetic() {
            return None;
        }
        let mut number = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '.' || next == '-' || next == '+' {
                number.push(next);
                chars.next();
            } else {
                break;
            }
        }
        words.push((letter, number.parse().ok()?));
    }
    Some(words)
}
