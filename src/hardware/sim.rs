//! Simulated GRBL-dialect motion controller.
//!
//! Speaks the real wire protocol over an in-memory duplex stream, so the
//! protocol engine, motion controller and orchestrator run unchanged against
//! it. Used by the integration tests and by `scanrig simulate`.
//!
//! # Behaviour
//!
//! - Linear moves run at a fixed speed (`SimConfig::speed`), advanced on every
//!   tick; `ok` is sent as soon as the move is planned, like GRBL.
//! - `$H` acknowledges only after `homing_duration` has passed.
//! - Status reports are pushed every `$Report/Interval` and answered on `?`.
//! - The tilt axis (C) is reported as `0.000` unless `report_c_axis` is set,
//!   mirroring rigs without a tilt encoder.
//! - `!` holds a running move, `~` resumes it, `0x18` resets. A reset during
//!   motion raises `ALARM:3`.
//!
//! # Fault injection
//!
//! Dropped acks, rejected lines, alarms, unlocks that do not clear, failed
//! homing, arbitrary injected lines and link drops. Every line and real-time
//! byte received is logged for assertions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::transport::{LinkHalves, SerialTransport, StreamLink};
use crate::core::{Axis, MachineState, Position4D};
use crate::error::RigResult;
use crate::protocol::grbl;

const BANNER: &str = "Grbl 1.1h ['$' for help]";
const MAX_INPUT_LINE: usize = 256;

/// Simulator tuning.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Motion speed in units per second, shared by all axes
    pub speed: f64,
    /// Simulation step
    pub tick: Duration,
    /// Duration of a homing cycle
    pub homing_duration: Duration,
    /// Position reached by homing
    pub home_position: Position4D,
    /// Report the real C value instead of a constant zero
    pub report_c_axis: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            speed: 2000.0,
            tick: Duration::from_millis(5),
            homing_duration: Duration::from_millis(80),
            home_position: Position4D::ZERO,
            report_c_axis: false,
        }
    }
}

enum Reply {
    Ok(Vec<String>),
    Error(u16),
    /// Reply is sent later by the tick loop (homing)
    Deferred,
}

struct SimState {
    state: MachineState,
    position: Position4D,
    target: Option<Position4D>,
    homing_until: Option<Instant>,
    relative: bool,
    report_interval: Option<Duration>,
    settings: BTreeMap<String, String>,
    outbox: VecDeque<String>,
    received: Vec<String>,
    realtime: Vec<u8>,
    opens: u32,

    drop_acks: u32,
    late_acks: u32,
    late_delay: Duration,
    /// Replies held back, in wire order, with their release time
    late: VecDeque<(Instant, Vec<String>)>,
    reject_lines: u32,
    reject_code: u16,
    sticky_alarm: bool,
    fail_homing: bool,
}

impl SimState {
    fn new(config: &SimConfig) -> Self {
        let mut settings = BTreeMap::new();
        settings.insert("22".to_string(), "1".to_string());
        settings.insert("110".to_string(), "5000.000".to_string());
        settings.insert("111".to_string(), "5000.000".to_string());

        Self {
            state: MachineState::Idle,
            position: config.home_position,
            target: None,
            homing_until: None,
            relative: false,
            report_interval: None,
            settings,
            outbox: VecDeque::new(),
            received: Vec::new(),
            realtime: Vec::new(),
            opens: 0,
            drop_acks: 0,
            late_acks: 0,
            late_delay: Duration::ZERO,
            late: VecDeque::new(),
            reject_lines: 0,
            reject_code: 0,
            sticky_alarm: false,
            fail_homing: false,
        }
    }
}

struct SimInner {
    config: SimConfig,
    state: Mutex<SimState>,
    disconnect: watch::Sender<u64>,
}

/// In-process controller; clone it freely, all clones share one machine.
#[derive(Clone)]
pub struct SimulatedController {
    inner: Arc<SimInner>,
}

impl SimulatedController {
    /// Idle controller at the configured home position.
    pub fn new(config: SimConfig) -> Self {
        let (disconnect, _) = watch::channel(0);
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::new(&config)),
                config,
                disconnect,
            }),
        }
    }

    // -- observation ---------------------------------------------------------

    /// True machine position, including the unreported C axis.
    pub fn position(&self) -> Position4D {
        self.inner.state.lock().position
    }

    /// Current machine state.
    pub fn state(&self) -> MachineState {
        self.inner.state.lock().state
    }

    /// Every command line received, in order.
    pub fn received_lines(&self) -> Vec<String> {
        self.inner.state.lock().received.clone()
    }

    /// Received lines that are motion commands (`G...` or `$H`).
    pub fn motion_lines(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .received
            .iter()
            .filter(|line| line.starts_with('G') || line.as_str() == grbl::HOME)
            .cloned()
            .collect()
    }

    /// Every real-time byte received, in order.
    pub fn realtime_bytes(&self) -> Vec<u8> {
        self.inner.state.lock().realtime.clone()
    }

    /// Number of times the link has been opened.
    pub fn open_count(&self) -> u32 {
        self.inner.state.lock().opens
    }

    /// Stored value of setting `$<key>`.
    pub fn setting(&self, key: &str) -> Option<String> {
        self.inner.state.lock().settings.get(key).cloned()
    }

    // -- fault injection -----------------------------------------------------

    /// Execute the next `n` lines but send no reply for them.
    pub fn drop_next_acks(&self, n: u32) {
        self.inner.state.lock().drop_acks = n;
    }

    /// Execute the next `n` lines but hold each reply back for `delay`.
    ///
    /// Replies keep their wire order: anything answered while a late reply is
    /// pending queues up behind it.
    pub fn delay_next_acks(&self, n: u32, delay: Duration) {
        let mut state = self.inner.state.lock();
        state.late_acks = n;
        state.late_delay = delay;
    }

    /// Answer the next `n` lines with `error:<code>` without executing them.
    pub fn reject_next_lines(&self, n: u32, code: u16) {
        let mut state = self.inner.state.lock();
        state.reject_lines = n;
        state.reject_code = code;
    }

    /// While set, `$X` is acknowledged but the alarm stays latched.
    pub fn set_sticky_alarm(&self, sticky: bool) {
        self.inner.state.lock().sticky_alarm = sticky;
    }

    /// The next homing cycle ends in `ALARM:9`.
    pub fn fail_next_homing(&self) {
        self.inner.state.lock().fail_homing = true;
    }

    /// Raise an alarm now, stopping any motion.
    pub fn trigger_alarm(&self, code: u16) {
        let mut state = self.inner.state.lock();
        enter_alarm(&mut state, code);
    }

    /// Queue a raw line to be sent on the next tick.
    pub fn inject_line(&self, line: impl Into<String>) {
        self.inner.state.lock().outbox.push_back(line.into());
    }

    /// Drop the current link. The next open starts a fresh one.
    pub fn disconnect(&self) {
        debug!("simulator dropping link");
        self.inner.disconnect.send_modify(|generation| *generation += 1);
    }
}

#[async_trait]
impl SerialTransport for SimulatedController {
    async fn open(&self) -> RigResult<LinkHalves> {
        let (near, far) = tokio::io::duplex(8192);
        {
            let mut state = self.inner.state.lock();
            state.opens += 1;
            state.report_interval = None;
        }
        let disconnect = self.inner.disconnect.subscribe();
        tokio::spawn(serve(self.inner.clone(), far, disconnect));
        Ok(StreamLink::split(near))
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}

fn enter_alarm(state: &mut SimState, code: u16) {
    state.state = MachineState::Alarm;
    state.target = None;
    state.homing_until = None;
    state.outbox.push_back(format!("ALARM:{}", code));
}

async fn serve(inner: Arc<SimInner>, stream: DuplexStream, mut disconnect: watch::Receiver<u64>) {
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut buf = [0u8; 256];
    let mut line = Vec::with_capacity(64);
    let mut ticker = tokio::time::interval(inner.config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();
    let mut last_report = Instant::now();

    loop {
        let mut out = Vec::new();
        tokio::select! {
            _ = disconnect.changed() => break,
            read = rd.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut state = inner.state.lock();
                    for &byte in &buf[..n] {
                        handle_byte(&inner.config, &mut state, byte, &mut line, &mut out);
                    }
                }
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut state = inner.state.lock();
                tick(&inner.config, &mut state, now - last_tick, &mut out);
                last_tick = now;
                if let Some(interval) = state.report_interval {
                    if now - last_report >= interval {
                        out.push(status_line(&inner.config, &state));
                        last_report = now;
                    }
                }
            }
        }

        for text in out {
            let mut framed = text.into_bytes();
            framed.push(b'\n');
            if wr.write_all(&framed).await.is_err() {
                return;
            }
        }
    }
    trace!("simulator link closed");
}

fn handle_byte(config: &SimConfig, state: &mut SimState, byte: u8, line: &mut Vec<u8>, out: &mut Vec<String>) {
    match byte {
        grbl::STATUS_QUERY => {
            state.realtime.push(byte);
            out.push(status_line(config, state));
        }
        grbl::FEED_HOLD => {
            state.realtime.push(byte);
            if state.state == MachineState::Moving {
                state.state = MachineState::Hold;
            }
        }
        grbl::CYCLE_RESUME => {
            state.realtime.push(byte);
            if state.state == MachineState::Hold && state.target.is_some() {
                state.state = MachineState::Moving;
            }
        }
        grbl::SOFT_RESET => {
            state.realtime.push(byte);
            soft_reset(state, out);
            line.clear();
        }
        b'\n' => {
            let text = String::from_utf8_lossy(line).trim().to_string();
            line.clear();
            handle_line(config, state, text, out);
        }
        b'\r' => {}
        other => {
            if line.len() < MAX_INPUT_LINE {
                line.push(other);
            }
        }
    }
}

fn soft_reset(state: &mut SimState, out: &mut Vec<String>) {
    let interrupted = matches!(state.state, MachineState::Moving | MachineState::Homing);
    state.target = None;
    state.homing_until = None;
    state.relative = false;
    state.late.clear();
    if interrupted {
        state.state = MachineState::Alarm;
        out.push("ALARM:3".to_string());
    } else if state.state != MachineState::Alarm {
        state.state = MachineState::Idle;
    }
    out.push(BANNER.to_string());
}

fn handle_line(config: &SimConfig, state: &mut SimState, text: String, out: &mut Vec<String>) {
    state.received.push(text.clone());

    let reply = if state.reject_lines > 0 {
        state.reject_lines -= 1;
        Reply::Error(state.reject_code)
    } else {
        execute(config, state, &text)
    };

    if state.drop_acks > 0 && !matches!(reply, Reply::Deferred) {
        state.drop_acks -= 1;
        trace!(line = %text, "dropping reply");
        return;
    }

    let lines = match reply {
        Reply::Ok(mut lines) => {
            lines.push("ok".to_string());
            lines
        }
        Reply::Error(code) => vec![format!("error:{}", code)],
        Reply::Deferred => return,
    };

    if state.late_acks > 0 {
        state.late_acks -= 1;
        trace!(line = %text, delay = ?state.late_delay, "holding reply back");
        let release = Instant::now() + state.late_delay;
        state.late.push_back((release, lines));
    } else if !state.late.is_empty() {
        state.late.push_back((Instant::now(), lines));
    } else {
        out.extend(lines);
    }
}

fn execute(config: &SimConfig, state: &mut SimState, text: &str) -> Reply {
    if text.is_empty() {
        return Reply::Ok(Vec::new());
    }

    if text == grbl::UNLOCK {
        if state.state == MachineState::Alarm && !state.sticky_alarm {
            state.state = MachineState::Idle;
        }
        return Reply::Ok(vec!["[MSG:Caution: Unlocked]".to_string()]);
    }

    if text == grbl::HOME {
        if matches!(state.state, MachineState::Moving | MachineState::Homing) {
            return Reply::Error(8);
        }
        state.state = MachineState::Homing;
        state.target = None;
        state.homing_until = Some(Instant::now() + config.homing_duration);
        return Reply::Deferred;
    }

    if let Some(rest) = text.strip_prefix('$') {
        return execute_setting(state, rest);
    }

    execute_gcode(state, text)
}

fn execute_setting(state: &mut SimState, rest: &str) -> Reply {
    if rest == "$" {
        let lines = state
            .settings
            .iter()
            .map(|(k, v)| format!("${}={}", k, v))
            .collect();
        return Reply::Ok(lines);
    }
    if rest == "I" {
        return Reply::Ok(vec![
            "[VER:1.1h.20190825:scanrig-sim]".to_string(),
            "[OPT:V,15,128]".to_string(),
        ]);
    }
    if let Some(ms) = rest.strip_prefix("Report/Interval=") {
        return match ms.trim().parse::<u64>() {
            Ok(0) => {
                state.report_interval = None;
                Reply::Ok(Vec::new())
            }
            Ok(ms) => {
                state.report_interval = Some(Duration::from_millis(ms));
                Reply::Ok(Vec::new())
            }
            Err(_) => Reply::Error(3),
        };
    }

    let is_key = |key: &str| !key.is_empty() && key.chars().all(|c| c.is_ascii_digit());
    match rest.split_once('=') {
        Some((key, value)) if is_key(key) && !value.is_empty() => {
            state.settings.insert(key.to_string(), value.to_string());
            Reply::Ok(Vec::new())
        }
        None if is_key(rest) => match state.settings.get(rest) {
            Some(value) => Reply::Ok(vec![format!("${}={}", rest, value)]),
            None => Reply::Error(3),
        },
        _ => Reply::Error(3),
    }
}

fn execute_gcode(state: &mut SimState, text: &str) -> Reply {
    let words = match grbl::gcode_words(text) {
        Some(words) => words,
        None => return Reply::Error(2),
    };
    if state.state == MachineState::Alarm {
        return Reply::Error(9);
    }

    let mut relative = state.relative;
    let mut axis_words = Vec::new();
    for (letter, value) in words {
        match letter {
            'G' if value == 90.0 => relative = false,
            'G' if value == 91.0 => relative = true,
            'G' if value == 0.0 || value == 1.0 => {}
            'F' if value > 0.0 => {}
            'F' => return Reply::Error(22),
            _ => match Axis::from_letter(letter) {
                Some(axis) => axis_words.push((axis, value)),
                None => return Reply::Error(20),
            },
        }
    }
    state.relative = relative;

    if axis_words.is_empty() {
        return Reply::Ok(Vec::new());
    }

    let mut target = state.target.unwrap_or(state.position);
    for (axis, value) in axis_words {
        target[axis] = if relative { target[axis] + value } else { value };
    }
    state.target = Some(target);
    if state.state != MachineState::Hold {
        state.state = MachineState::Moving;
    }
    Reply::Ok(Vec::new())
}

fn tick(config: &SimConfig, state: &mut SimState, dt: Duration, out: &mut Vec<String>) {
    if state.state == MachineState::Moving {
        if let Some(target) = state.target {
            let step = config.speed * dt.as_secs_f64();
            let remaining = state.position.max_deviation(&target);
            if remaining <= step {
                state.position = target;
                state.target = None;
                state.state = MachineState::Idle;
            } else {
                let fraction = step / remaining;
                for axis in Axis::ALL {
                    let delta = target[axis] - state.position[axis];
                    state.position[axis] += delta * fraction;
                }
            }
        } else {
            state.state = MachineState::Idle;
        }
    }

    if let Some(until) = state.homing_until {
        if Instant::now() >= until {
            state.homing_until = None;
            if state.fail_homing {
                state.fail_homing = false;
                enter_alarm(state, 9);
                state.outbox.push_back("error:9".to_string());
            } else {
                state.position = config.home_position;
                state.state = MachineState::Idle;
                state.outbox.push_back("ok".to_string());
            }
        }
    }

    let now = Instant::now();
    while state.late.front().is_some_and(|(release, _)| *release <= now) {
        if let Some((_, lines)) = state.late.pop_front() {
            out.extend(lines);
        }
    }

    out.extend(state.outbox.drain(..));
}

fn status_line(config: &SimConfig, state: &SimState) -> String {
    let keyword = match state.state {
        MachineState::Idle => "Idle",
        MachineState::Moving => "Run",
        MachineState::Homing => "Home",
        MachineState::Alarm => "Alarm",
        MachineState::Hold => "Hold:0",
    };
    let p = state.position;
    let c = if config.report_c_axis { p.c } else { 0.0 };
    format!(
        "<{}|MPos:{:.3},{:.3},{:.3},{:.3}|FS:0,0>",
        keyword, p.x, p.y, p.z, c
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_lines(state: &mut SimState, lines: &[&str]) -> Vec<String> {
        let config = SimConfig::default();
        let mut out = Vec::new();
        for line in lines {
            handle_line(&config, state, line.to_string(), &mut out);
        }
        out
    }

    #[test]
    fn test_settings_query_and_set() {
        let mut state = SimState::new(&SimConfig::default());
        let out = run_lines(&mut state, &["$110", "$120=42.5", "$120", "$999"]);
        assert_eq!(out, vec!["$110=5000.000", "ok", "ok", "$120=42.5", "ok", "error:3"]);
    }

    #[test]
    fn test_motion_locked_in_alarm() {
        let mut state = SimState::new(&SimConfig::default());
        enter_alarm(&mut state, 1);
        let out = run_lines(&mut state, &["G90 G1 X10 F100", "$X", "G90 G1 X10 F100"]);
        assert_eq!(out, vec!["error:9", "[MSG:Caution: Unlocked]", "ok", "ok"]);
        assert_eq!(state.target.map(|t| t.x), Some(10.0));
    }

    #[test]
    fn test_tick_reaches_target_and_hides_c_axis() {
        let config = SimConfig::default();
        let mut state = SimState::new(&config);
        run_lines(&mut state, &["G90 G1 X1 Y2 Z3 C4 F100"]);
        assert_eq!(state.state, MachineState::Moving);

        let mut out = Vec::new();
        tick(&config, &mut state, Duration::from_secs(1), &mut out);
        assert_eq!(state.state, MachineState::Idle);
        assert_eq!(state.position, Position4D::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(
            status_line(&config, &state),
            "<Idle|MPos:1.000,2.000,3.000,0.000|FS:0,0>"
        );
    }

    #[test]
    fn test_reset_during_motion_alarms() {
        let config = SimConfig::default();
        let mut state = SimState::new(&config);
        run_lines(&mut state, &["G1 X100 F100"]);
        let mut line = Vec::new();
        let mut out = Vec::new();
        handle_byte(&config, &mut state, grbl::SOFT_RESET, &mut line, &mut out);
        assert_eq!(state.state, MachineState::Alarm);
        assert_eq!(out[0], "ALARM:3");
    }
}
