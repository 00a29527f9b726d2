//! Line-oriented serial link to the pump controller.
//!
//! The controller speaks a tiny `\n`-terminated protocol at 9600 baud:
//!
//! ```text
//! ON\n      -> PUMP:ON
//! OFF\n     -> PUMP:OFF
//! STATUS\n  -> STATUS:<state>
//! ```
//!
//! ## Link state machine
//!
//! ```text
//! Disconnected ──[first send]──▶ Connecting ──[opened]──▶ Connected
//!      ▲                             │                       │
//!      └──────[timeout / io error]───┼───────────────────────┘
//!                                    └──[open failed]──▶ Simulated
//! ```
//!
//! `Simulated` is sticky: commands fail fast with
//! [`TransportError::HardwareAbsent`] until someone calls
//! [`SerialLink::reprobe`]. Every exchange happens under one lock, so bytes
//! of two commands can never interleave on the wire.

use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::TransportError;

pub const DEFAULT_BAUD: u32 = 9600;

/// Per-read timeout on the port. Bounds each `read_line` call.
const READ_POLL: Duration = Duration::from_millis(50);

/// USB descriptions that identify a likely controller board.
const PROBE_KEYWORDS: &[&str] = &["ARDUINO", "USB SERIAL", "CH340", "CP210", "FTDI"];

/// Startup chatter lines drained after opening.
const STARTUP_DRAIN_LINES: usize = 5;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    On,
    Off,
    Status,
}

impl Command {
    /// Wire text, without the terminator.
    pub fn line(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Status => "STATUS",
        }
    }

    /// Prefix a response line must carry to answer this command.
    pub fn expected_prefix(self) -> &'static str {
        match self {
            Self::On => "PUMP:ON",
            Self::Off => "PUMP:OFF",
            Self::Status => "STATUS:",
        }
    }

    pub fn matches(self, line: &str) -> bool {
        line.starts_with(self.expected_prefix())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.line())
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// A byte stream that can exchange text lines. Blocking.
pub trait LineTransport: Send {
    /// Drop anything received before the next command.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Write `line` followed by `\n`.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Next complete line, or `None` if nothing arrived within the
    /// transport's own short read timeout.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// An opened transport and the port it lives on.
pub struct Connection {
    pub port: String,
    pub transport: Box<dyn LineTransport>,
}

/// Opens transports. Blocking; may take seconds while the board resets.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> Result<Connection, TransportError>;
}

/// Accumulates raw bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next `\n`-terminated line, with `\r` and surrounding
    /// whitespace stripped.
    pub fn pop_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ---------------------------------------------------------------------------
// Real serial port
// ---------------------------------------------------------------------------

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    buf: LineBuffer,
}

impl LineTransport for SerialTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.buf.pop_line() {
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 64];
        match self.port.read(&mut chunk) {
            Ok(n) => {
                self.buf.push(&chunk[..n]);
                Ok(self.buf.pop_line())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Opens the configured port, or probes for one when none is configured.
pub struct SerialConnector {
    port: Option<String>,
    baud_rate: u32,
    settle: Duration,
}

impl SerialConnector {
    pub fn new(port: Option<String>, baud_rate: u32, settle: Duration) -> Self {
        Self {
            port,
            baud_rate,
            settle,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> Result<Connection, TransportError> {
        let port_name = match &self.port {
            Some(p) => p.clone(),
            None => probe_port()?,
        };

        let port = serialport::new(&port_name, self.baud_rate)
            .timeout(READ_POLL)
            .open()
            .map_err(|source| TransportError::Open {
                port: port_name.clone(),
                source,
            })?;

        let mut transport = SerialTransport {
            port,
            buf: LineBuffer::default(),
        };

        // Opening the port resets most boards; give the firmware time to
        // boot, then drain whatever banner it prints.
        std::thread::sleep(self.settle);
        for _ in 0..STARTUP_DRAIN_LINES {
            match transport.read_line()? {
                Some(line) if !line.is_empty() => {
                    debug!(port = %port_name, %line, "controller startup message");
                }
                Some(_) => {}
                None => break,
            }
        }

        info!(port = %port_name, baud = self.baud_rate, "serial port opened");
        Ok(Connection {
            port: port_name,
            transport: Box::new(transport),
        })
    }
}

/// Whether a USB description looks like a controller board.
pub fn looks_like_controller(description: &str) -> bool {
    let upper = description.to_uppercase();
    PROBE_KEYWORDS.iter().any(|k| upper.contains(k))
}

fn describe_port(info: &serialport::SerialPortInfo) -> String {
    match &info.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "{} {} {}",
            info.port_name,
            usb.manufacturer.as_deref().unwrap_or_default(),
            usb.product.as_deref().unwrap_or_default()
        ),
        _ => info.port_name.clone(),
    }
}

/// Scan available ports for the first one that looks like a controller.
pub fn probe_port() -> Result<String, TransportError> {
    let ports = serialport::available_ports().map_err(|e| {
        warn!("serial port enumeration failed: {e}");
        TransportError::NoPortFound
    })?;

    for info in &ports {
        let description = describe_port(info);
        if looks_like_controller(&description) {
            info!(port = %info.port_name, %description, "found likely controller");
            return Ok(info.port_name.clone());
        }
    }

    if ports.is_empty() {
        warn!("no serial ports found");
    } else {
        let names: Vec<String> = ports.iter().map(describe_port).collect();
        warn!(ports = ?names, "no serial port looks like a controller");
    }
    Err(TransportError::NoPortFound)
}

/// One command/response exchange. Bounded by `timeout`.
fn exchange(
    transport: &mut dyn LineTransport,
    command: Command,
    timeout: Duration,
) -> Result<String, TransportError> {
    transport.clear_input()?;
    transport.write_line(command.line())?;

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let Some(line) = transport.read_line()? else {
            continue;
        };
        if command.matches(&line) {
            return Ok(line);
        }
        if !line.is_empty() {
            debug!(%command, %line, "ignoring unmatched controller output");
        }
    }

    Err(TransportError::Timeout {
        command,
        expected: command.expected_prefix(),
        timeout,
    })
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Simulated,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub port: Option<String>,
    pub last_response: Option<String>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_ok_at: Option<OffsetDateTime>,
}

struct LinkInner {
    state: LinkState,
    transport: Option<Box<dyn LineTransport>>,
}

/// Shared handle to the controller link. Cheap to clone.
#[derive(Clone)]
pub struct SerialLink {
    inner: Arc<Mutex<LinkInner>>,
    status: Arc<watch::Sender<LinkStatus>>,
    connector: Arc<dyn Connector>,
    response_timeout: Duration,
}

impl SerialLink {
    /// The port is not touched until the first command.
    pub fn new(connector: impl Connector, response_timeout: Duration) -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: LinkState::Disconnected,
            port: None,
            last_response: None,
            last_error: None,
            last_ok_at: None,
        });
        Self {
            inner: Arc::new(Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                transport: None,
            })),
            status: Arc::new(status),
            connector: Arc::new(connector),
            response_timeout,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> LinkState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Send one command and wait for its response line.
    ///
    /// Connects on first use. A timeout or i/o error drops the port and
    /// returns the link to `Disconnected`; the next command retries once.
    pub async fn send(&self, command: Command) -> Result<String, TransportError> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            LinkState::Simulated => return Err(TransportError::HardwareAbsent),
            LinkState::Disconnected | LinkState::Connecting => {
                self.connect_locked(&mut inner).await?;
            }
            LinkState::Connected => {}
        }

        let Some(mut transport) = inner.transport.take() else {
            let err = TransportError::Worker("connected without a transport".into());
            self.set_state(&mut inner, LinkState::Disconnected, Some(&err));
            return Err(err);
        };

        let timeout = self.response_timeout;
        let joined = tokio::task::spawn_blocking(move || {
            let result = exchange(transport.as_mut(), command, timeout);
            (transport, result)
        })
        .await;

        match joined {
            Ok((transport, Ok(line))) => {
                inner.transport = Some(transport);
                debug!(%command, response = %line, "controller acknowledged");
                self.status.send_modify(|s| {
                    s.last_response = Some(line.clone());
                    s.last_ok_at = Some(OffsetDateTime::now_utc());
                    s.last_error = None;
                });
                Ok(line)
            }
            Ok((_, Err(err))) => {
                self.set_state(&mut inner, LinkState::Disconnected, Some(&err));
                Err(err)
            }
            Err(join) => {
                let err = TransportError::Worker(join.to_string());
                self.set_state(&mut inner, LinkState::Disconnected, Some(&err));
                Err(err)
            }
        }
    }

    /// Ask the controller for its reported state.
    pub async fn query_status(&self) -> Result<String, TransportError> {
        self.send(Command::Status).await
    }

    /// Drop any current port and try to open one again, leaving `Simulated`
    /// if that works.
    pub async fn reprobe(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.transport = None;
        info!("re-probing serial controller");
        self.connect_locked(&mut inner).await
    }

    async fn connect_locked(&self, inner: &mut LinkInner) -> Result<(), TransportError> {
        self.set_state(inner, LinkState::Connecting, None);

        let connector = Arc::clone(&self.connector);
        let result = match tokio::task::spawn_blocking(move || connector.connect()).await {
            Ok(result) => result,
            Err(join) => Err(TransportError::Worker(join.to_string())),
        };

        match result {
            Ok(conn) => {
                inner.transport = Some(conn.transport);
                self.status.send_modify(|s| s.port = Some(conn.port));
                self.set_state(inner, LinkState::Connected, None);
                Ok(())
            }
            Err(err) => {
                self.set_state(inner, LinkState::Simulated, Some(&err));
                Err(err)
            }
        }
    }

    fn set_state(&self, inner: &mut LinkInner, state: LinkState, err: Option<&TransportError>) {
        let previous = inner.state;
        inner.state = state;
        if state != LinkState::Connected {
            inner.transport = None;
        }

        let err_text = err.map(error_chain);
        if previous != state {
            match state {
                LinkState::Connected => info!("pump controller connected"),
                LinkState::Disconnected => warn!(
                    error = err_text.as_deref().unwrap_or("unknown"),
                    "pump controller link lost"
                ),
                LinkState::Simulated => warn!(
                    error = err_text.as_deref().unwrap_or("unknown"),
                    "no pump controller reachable, falling back to simulation"
                ),
                LinkState::Connecting => debug!("connecting to pump controller"),
            }
        }

        self.status.send_modify(|s| {
            s.state = state;
            if let Some(text) = err_text {
                s.last_error = Some(text);
            }
        });
    }
}

/// `Display` of an error and all of its sources, joined with `: `.
fn error_chain(err: &TransportError) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// How the fake controller answers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Behaviour {
        /// Answers every command, preceded by one line of noise.
        Healthy,
        /// Never answers.
        Silent,
        /// Write fails with a broken pipe.
        Broken,
    }

    /// Shared view of a fake controller, kept by the test.
    #[derive(Clone)]
    pub(crate) struct FakeController {
        pub(crate) written: Arc<StdMutex<Vec<String>>>,
        pub(crate) behaviour: Arc<StdMutex<Behaviour>>,
        pub(crate) connects: Arc<AtomicUsize>,
        pub(crate) reachable: Arc<AtomicBool>,
        busy: Arc<AtomicBool>,
        pub(crate) overlaps: Arc<AtomicUsize>,
    }

    impl FakeController {
        pub(crate) fn new(behaviour: Behaviour) -> Self {
            Self {
                written: Arc::new(StdMutex::new(Vec::new())),
                behaviour: Arc::new(StdMutex::new(behaviour)),
                connects: Arc::new(AtomicUsize::new(0)),
                reachable: Arc::new(AtomicBool::new(true)),
                busy: Arc::new(AtomicBool::new(false)),
                overlaps: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn unreachable() -> Self {
            let fake = Self::new(Behaviour::Healthy);
            fake.reachable.store(false, Ordering::SeqCst);
            fake
        }

        pub(crate) fn set_behaviour(&self, behaviour: Behaviour) {
            *self.behaviour.lock().unwrap() = behaviour;
        }

        pub(crate) fn written(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }

        pub(crate) fn link(&self, timeout: Duration) -> SerialLink {
            SerialLink::new(self.clone(), timeout)
        }
    }

    struct FakeTransport {
        controller: FakeController,
        outbox: VecDeque<String>,
    }

    impl LineTransport for FakeTransport {
        fn write_line(&mut self, line: &str) -> io::Result<()> {
            let c = &self.controller;
            if c.busy.swap(true, Ordering::SeqCst) {
                c.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            c.written.lock().unwrap().push(line.to_string());
            match *c.behaviour.lock().unwrap() {
                Behaviour::Broken => {
                    c.busy.store(false, Ordering::SeqCst);
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
                }
                Behaviour::Silent => {}
                Behaviour::Healthy => {
                    self.outbox.push_back("DEBUG: relay pin 8".to_string());
                    let reply = match line {
                        "ON" => "PUMP:ON",
                        "OFF" => "PUMP:OFF",
                        _ => "STATUS:OFF",
                    };
                    self.outbox.push_back(reply.to_string());
                }
            }
            Ok(())
        }

        fn read_line(&mut self) -> io::Result<Option<String>> {
            std::thread::sleep(Duration::from_millis(2));
            let line = self.outbox.pop_front();
            if line.as_deref().is_some_and(|l| l.starts_with("PUMP:") || l.starts_with("STATUS:")) {
                self.controller.busy.store(false, Ordering::SeqCst);
            }
            Ok(line)
        }
    }

    impl Connector for FakeController {
        fn connect(&self) -> Result<Connection, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(TransportError::NoPortFound);
            }
            self.busy.store(false, Ordering::SeqCst);
            Ok(Connection {
                port: "/dev/ttyFAKE0".to_string(),
                transport: Box::new(FakeTransport {
                    controller: self.clone(),
                    outbox: VecDeque::new(),
                }),
            })
        }
    }

    // -- Protocol -----------------------------------------------------------

    #[test]
    fn command_lines_and_prefixes() {
        assert_eq!(Command::On.line(), "ON");
        assert_eq!(Command::Off.expected_prefix(), "PUMP:OFF");
        assert!(Command::Status.matches("STATUS:ON"));
        assert!(Command::On.matches("PUMP:ON"));
        assert!(!Command::On.matches("PUMP:OFF"));
        assert!(!Command::Off.matches("ERROR: unknown"));
    }

    #[test]
    fn line_buffer_splits_lines_and_keeps_partials() {
        let mut buf = LineBuffer::default();
        buf.push(b"PUMP:O");
        assert_eq!(buf.pop_line(), None);
        buf.push(b"N\r\nSTATUS:OFF\nPA");
        assert_eq!(buf.pop_line().as_deref(), Some("PUMP:ON"));
        assert_eq!(buf.pop_line().as_deref(), Some("STATUS:OFF"));
        assert_eq!(buf.pop_line(), None);
        buf.push(b"RTIAL\n");
        assert_eq!(buf.pop_line().as_deref(), Some("PARTIAL"));
    }

    #[test]
    fn probe_keywords_match_common_usb_bridges() {
        assert!(looks_like_controller("/dev/ttyACM0 Arduino (www.arduino.cc) Uno"));
        assert!(looks_like_controller("/dev/ttyUSB0 QinHeng Electronics CH340 serial"));
        assert!(looks_like_controller("COM5 Silicon Labs CP2102 USB to UART"));
        assert!(looks_like_controller("/dev/ttyUSB1 FTDI FT232R"));
        assert!(!looks_like_controller("/dev/ttyS0"));
    }

    // -- Link ---------------------------------------------------------------

    #[tokio::test]
    async fn first_send_connects_and_returns_matching_line() {
        let fake = FakeController::new(Behaviour::Healthy);
        let link = fake.link(Duration::from_millis(500));
        assert_eq!(link.state(), LinkState::Disconnected);

        let line = link.send(Command::On).await.unwrap();
        assert_eq!(line, "PUMP:ON");
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(fake.written(), vec!["ON"]);

        let status = link.status();
        assert_eq!(status.port.as_deref(), Some("/dev/ttyFAKE0"));
        assert_eq!(status.last_response.as_deref(), Some("PUMP:ON"));
        assert!(status.last_ok_at.is_some());
    }

    #[tokio::test]
    async fn status_query_returns_reported_state() {
        let fake = FakeController::new(Behaviour::Healthy);
        let link = fake.link(Duration::from_millis(500));
        assert_eq!(link.query_status().await.unwrap(), "STATUS:OFF");
    }

    #[tokio::test]
    async fn timeout_demotes_link_and_next_send_retries() {
        let fake = FakeController::new(Behaviour::Silent);
        let link = fake.link(Duration::from_millis(100));

        let err = link.send(Command::Off).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { command: Command::Off, .. }));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.status().last_error.is_some());

        fake.set_behaviour(Behaviour::Healthy);
        assert_eq!(link.send(Command::Off).await.unwrap(), "PUMP:OFF");
        assert_eq!(fake.connects.load(Ordering::SeqCst), 2);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn io_error_demotes_link() {
        let fake = FakeController::new(Behaviour::Broken);
        let link = fake.link(Duration::from_millis(100));
        let err = link.send(Command::On).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_controller_falls_back_to_simulated_once() {
        let fake = FakeController::unreachable();
        let link = fake.link(Duration::from_millis(100));

        let err = link.send(Command::On).await.unwrap_err();
        assert!(matches!(err, TransportError::NoPortFound));
        assert_eq!(link.state(), LinkState::Simulated);

        // No retry storm: later commands fail fast without reopening.
        let err = link.send(Command::On).await.unwrap_err();
        assert!(matches!(err, TransportError::HardwareAbsent));
        assert_eq!(fake.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reprobe_leaves_simulated_when_controller_appears() {
        let fake = FakeController::unreachable();
        let link = fake.link(Duration::from_millis(200));
        let _ = link.send(Command::Status).await;
        assert_eq!(link.state(), LinkState::Simulated);

        fake.reachable.store(true, Ordering::SeqCst);
        link.reprobe().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.send(Command::On).await.unwrap(), "PUMP:ON");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_never_interleave() {
        let fake = FakeController::new(Behaviour::Healthy);
        let link = fake.link(Duration::from_millis(500));

        let mut handles = Vec::new();
        for i in 0..16 {
            let link = link.clone();
            let cmd = if i % 2 == 0 { Command::On } else { Command::Off };
            handles.push(tokio::spawn(async move { link.send(cmd).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(fake.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(fake.written().len(), 16);
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        assert_eq!(error_chain(&err), "serial i/o error: unplugged");
    }
}
