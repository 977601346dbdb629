use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::WormCfg;
use crate::types::SymbolicCommand;

/// Device paths probed when no port is configured.
const CANDIDATE_PORTS: &[&str] = &[
    "/dev/ttyACM0",
    "/dev/ttyUSB0",
    "/dev/cu.usbmodem1401",
    "/dev/cu.usbmodem1301",
    "/dev/cu.usbmodem101",
];

const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);
/// The controller resets when the port opens (DTR) and needs time to boot.
const CONTROLLER_BOOT_DELAY: Duration = Duration::from_secs(2);
const SERIAL_READ_CHUNK: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a send was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the hardware link.
    Delivered,
    /// No hardware; logged only. Reported as success.
    Simulated,
}

/// Best-effort sink for symbolic movement commands. `send` returns once the
/// command is handed off; it never waits for the physical motion.
pub trait MotorSink: Send + Sync {
    fn send(&self, command: SymbolicCommand) -> Result<SendOutcome, TransportError>;

    /// True when no hardware is attached and sends are only logged.
    fn is_simulated(&self) -> bool;

    fn close(&self);
}

/// Newline-terminated ASCII tokens over a serial port, or simulation when no
/// port could be opened.
pub struct SerialTransport {
    port: Mutex<Option<Box<dyn SerialPort>>>,
    port_name: Option<String>,
}

impl SerialTransport {
    /// Transport that only logs.
    pub fn simulated() -> Self {
        Self {
            port: Mutex::new(None),
            port_name: None,
        }
    }

    /// Open the configured port, or probe the usual device paths. Falls back to
    /// simulation on any failure. Blocks for the controller boot delay.
    pub fn connect(cfg: &WormCfg) -> Self {
        if cfg.simulation_mode {
            tracing::info!("simulation mode forced by settings");
            return Self::simulated();
        }
        let Some(path) = pick_port(cfg.serial_port.as_deref()) else {
            tracing::warn!("no motor controller port found, running in simulation mode");
            return Self::simulated();
        };
        match Self::open(&path, cfg.baud_rate) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, "motor controller unavailable, running in simulation mode");
                Self::simulated()
            }
        }
    }

    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let mut port = serialport::new(path, baud_rate)
            .timeout(SERIAL_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                port: path.to_owned(),
                source,
            })?;
        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::debug!(port = path, error = %e, "could not raise DTR");
        }
        std::thread::sleep(CONTROLLER_BOOT_DELAY);
        drain_replies(port.as_mut());
        tracing::info!(port = path, baud_rate, "motor controller connected");
        Ok(Self {
            port: Mutex::new(Some(port)),
            port_name: Some(path.to_owned()),
        })
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }
}

impl MotorSink for SerialTransport {
    fn send(&self, command: SymbolicCommand) -> Result<SendOutcome, TransportError> {
        let mut guard = self.port.lock().unwrap_or_else(|e| e.into_inner());
        let Some(port) = guard.as_mut() else {
            tracing::info!("[SIMULATION] {}", command.token());
            return Ok(SendOutcome::Simulated);
        };
        port.write_all(command.token().as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        tracing::debug!(command = %command, "motor command sent");
        drain_replies(port.as_mut());
        Ok(SendOutcome::Delivered)
    }

    fn is_simulated(&self) -> bool {
        self.port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn close(&self) {
        if self
            .port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            tracing::info!(port = ?self.port_name, "motor controller connection closed");
        }
    }
}

fn pick_port(configured: Option<&str>) -> Option<String> {
    if let Some(port) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        return Some(port.to_owned());
    }
    CANDIDATE_PORTS
        .iter()
        .find(|p| Path::new(p).exists())
        .map(|p| (*p).to_owned())
}

/// Log whatever the controller has echoed back so far. Never waits for input.
fn drain_replies(port: &mut dyn SerialPort) {
    match port.bytes_to_read() {
        Ok(pending) => drain_available(port, pending as usize),
        Err(e) => tracing::debug!(error = %e, "motor controller poll failed"),
    }
}

/// Read at most `available` bytes, which the caller knows are already buffered.
fn drain_available<R: Read + ?Sized>(reader: &mut R, mut available: usize) {
    let mut buffer = [0_u8; SERIAL_READ_CHUNK];
    while available > 0 {
        let want = available.min(SERIAL_READ_CHUNK);
        match reader.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => {
                available = available.saturating_sub(n);
                let reply = String::from_utf8_lossy(&buffer[..n]);
                for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    tracing::debug!(reply = line, "motor controller");
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => {
                tracing::debug!(error = %e, "motor controller read failed");
                break;
            }
        }
    }
}

/// In-memory sink that records every command with its (tokio) timestamp.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(tokio::time::Instant, SymbolicCommand)>>,
    closed: Mutex<bool>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every send fails after being recorded.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<SymbolicCommand> {
        self.timeline().into_iter().map(|(_, c)| c).collect()
    }

    pub fn timeline(&self) -> Vec<(tokio::time::Instant, SymbolicCommand)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MotorSink for RecordingSink {
    fn send(&self, command: SymbolicCommand) -> Result<SendOutcome, TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((tokio::time::Instant::now(), command));
        if self.fail {
            return Err(TransportError::Io(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "recording sink set to fail",
            )));
        }
        Ok(SendOutcome::Delivered)
    }

    fn is_simulated(&self) -> bool {
        false
    }

    fn close(&self) {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_send_reports_success() {
        let transport = SerialTransport::simulated();
        assert!(transport.is_simulated());
        for command in SymbolicCommand::ALL {
            assert_eq!(transport.send(command).unwrap(), SendOutcome::Simulated);
        }
    }

    #[test]
    fn forced_simulation_skips_probing() {
        let cfg = WormCfg {
            simulation_mode: true,
            serial_port: Some("/dev/does-not-exist".into()),
            ..WormCfg::default()
        };
        let transport = SerialTransport::connect(&cfg);
        assert!(transport.is_simulated());
        assert_eq!(transport.port_name(), None);
    }

    #[test]
    fn unopenable_port_degrades_to_simulation() {
        let cfg = WormCfg {
            serial_port: Some("/dev/worm-missing-port".into()),
            ..WormCfg::default()
        };
        let transport = SerialTransport::connect(&cfg);
        assert!(transport.is_simulated());
        assert_eq!(transport.send(SymbolicCommand::Reset).unwrap(), SendOutcome::Simulated);
    }

    #[test]
    fn configured_port_wins_over_probe() {
        assert_eq!(pick_port(Some(" /dev/custom ")).as_deref(), Some("/dev/custom"));
        assert_eq!(
            pick_port(Some("  ")).is_some(),
            CANDIDATE_PORTS.iter().any(|p| Path::new(p).exists())
        );
    }

    #[test]
    fn close_is_idempotent() {
        let transport = SerialTransport::simulated();
        transport.close();
        transport.close();
        assert!(transport.is_simulated());
    }

    /// Serves its bytes, then fails like a serial read that hit its timeout.
    struct ScriptedReader {
        data: std::io::Cursor<Vec<u8>>,
        reads_past_end: usize,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                self.reads_past_end += 1;
                return Err(std::io::Error::new(ErrorKind::TimedOut, "would have waited"));
            }
            Ok(n)
        }
    }

    fn scripted(bytes: &[u8]) -> ScriptedReader {
        ScriptedReader {
            data: std::io::Cursor::new(bytes.to_vec()),
            reads_past_end: 0,
        }
    }

    #[test]
    fn nothing_pending_means_no_read() {
        let mut reader = scripted(b"");
        drain_available(&mut reader, 0);
        assert_eq!(reader.reads_past_end, 0);
    }

    #[test]
    fn drain_stops_at_what_was_buffered() {
        let reply = vec![b'x'; SERIAL_READ_CHUNK + 10];
        let mut reader = scripted(&reply);
        drain_available(&mut reader, reply.len());
        assert_eq!(reader.data.position() as usize, reply.len());
        assert_eq!(reader.reads_past_end, 0);

        // bytes arriving later are left for the next send
        let mut reader = scripted(b"ok\nlate\n");
        drain_available(&mut reader, 3);
        assert_eq!(reader.data.position(), 3);
        assert_eq!(reader.reads_past_end, 0);
    }

    #[tokio::test]
    async fn recording_sink_records_even_when_failing() {
        let sink = RecordingSink::failing();
        assert!(sink.send(SymbolicCommand::Dance).is_err());
        assert_eq!(sink.commands(), vec![SymbolicCommand::Dance]);
        sink.close();
        assert!(sink.is_closed());
    }
}
