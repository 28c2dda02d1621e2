// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serial-console sessions used by device workers to drive a board.
// Author: Lukas Bower

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::config::{LineConfig, TargetConfig};
use crate::error::SessionError;

const READ_CHUNK: usize = 4096;

/// Byte-level access to one serial console.
pub trait SerialLine: Send {
    /// Label used in log lines and errors.
    fn label(&self) -> &str;
    /// Open the underlying device.
    fn open(&mut self) -> Result<(), SessionError>;
    /// Write all bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError>;
    /// Read available bytes; `Ok(0)` when the poll interval elapsed without data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError>;
    /// Close the device. Closing a closed line is a no-op.
    fn close(&mut self);
}

/// Output captured by [`DeviceSession::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Console bytes up to (excluding) the expected terminator.
    pub output: String,
    /// Whether the deadline passed before the terminator appeared.
    pub timed_out: bool,
}

impl RunOutput {
    /// Drop the console's echo of `command` from the start of the output.
    pub fn without_echo(mut self, command: &str) -> Self {
        let body = self.output.trim_start_matches(['\r', '\n']);
        if let Some(rest) = body.strip_prefix(command) {
            let rest = match rest.find('\n') {
                Some(at) => &rest[at + 1..],
                None => "",
            };
            self.output = rest.to_owned();
        }
        self
    }
}

/// Command runner over one serial line.
pub struct DeviceSession {
    line: Box<dyn SerialLine>,
    line_ending: String,
}

impl DeviceSession {
    /// Wrap `line`, appending `line_ending` to every command.
    pub fn new(line: Box<dyn SerialLine>, line_ending: impl Into<String>) -> Self {
        Self {
            line,
            line_ending: line_ending.into(),
        }
    }

    /// Line label.
    pub fn label(&self) -> &str {
        self.line.label()
    }

    /// Open the line, write `command`, read the response and close the line.
    ///
    /// With `expect` set, reading stops at the first occurrence of the
    /// terminator or when `timeout` elapses. Without it, the line is read for
    /// the whole of `timeout` and the result never counts as timed out.
    pub fn run(
        &mut self,
        command: &str,
        expect: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutput, SessionError> {
        let guard = OpenLine::open(self.line.as_mut())?;
        debug!("[devfarm][{}] > {}", guard.line.label(), command);
        let mut wire = Vec::with_capacity(command.len() + self.line_ending.len());
        wire.extend_from_slice(command.as_bytes());
        wire.extend_from_slice(self.line_ending.as_bytes());
        guard.line.write(&wire)?;

        let (bytes, timed_out) = match expect {
            Some(term) if !term.is_empty() => {
                read_until(&mut *guard.line, term.as_bytes(), timeout)?
            }
            _ => (drain_for(&mut *guard.line, timeout)?, false),
        };
        let output = String::from_utf8_lossy(&bytes).into_owned();
        trace!("[devfarm][{}] < {:?}", guard.line.label(), output);
        Ok(RunOutput { output, timed_out })
    }
}

/// Keeps a line open for the duration of one command.
struct OpenLine<'a> {
    line: &'a mut dyn SerialLine,
}

impl<'a> OpenLine<'a> {
    fn open(line: &'a mut dyn SerialLine) -> Result<Self, SessionError> {
        line.open()?;
        Ok(Self { line })
    }
}

impl Drop for OpenLine<'_> {
    fn drop(&mut self) {
        self.line.close();
    }
}

fn read_until(
    line: &mut dyn SerialLine,
    terminator: &[u8],
    timeout: Duration,
) -> Result<(Vec<u8>, bool), SessionError> {
    let deadline = Instant::now() + timeout;
    let mut transcript = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    while Instant::now() < deadline {
        let read = line.read(&mut chunk)?;
        if read == 0 {
            continue;
        }
        // A terminator split across reads starts at most len - 1 bytes back.
        let scan_from = transcript
            .len()
            .saturating_sub(terminator.len().saturating_sub(1));
        transcript.extend_from_slice(&chunk[..read]);
        if let Some(at) = find_from(&transcript, terminator, scan_from) {
            transcript.truncate(at);
            return Ok((transcript, false));
        }
    }
    Ok((transcript, true))
}

fn drain_for(line: &mut dyn SerialLine, window: Duration) -> Result<Vec<u8>, SessionError> {
    let deadline = Instant::now() + window;
    let mut transcript = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    while Instant::now() < deadline {
        let read = line.read(&mut chunk)?;
        transcript.extend_from_slice(&chunk[..read]);
    }
    Ok(transcript)
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Serial line backed by a host tty via the `serialport` crate (8N1).
pub struct SerialPortLine {
    path: String,
    baud: u32,
    poll: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialPortLine {
    /// Build a closed line from its configuration.
    pub fn new(config: &LineConfig) -> Self {
        Self {
            path: config.port.clone(),
            baud: config.baud,
            poll: Duration::from_millis(config.poll_ms.max(1)),
            port: None,
        }
    }

    fn io_error(&self, source: io::Error) -> SessionError {
        SessionError::Io {
            port: self.path.clone(),
            source,
        }
    }

    fn not_open(&self) -> SessionError {
        self.io_error(io::Error::new(
            io::ErrorKind::NotConnected,
            "serial line is not open",
        ))
    }
}

impl SerialLine for SerialPortLine {
    fn label(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> Result<(), SessionError> {
        let port = serialport::new(self.path.as_str(), self.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.poll)
            .open()
            .map_err(|err| SessionError::Open {
                port: self.path.clone(),
                reason: err.to_string(),
            })?;
        self.port = Some(port);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let result = match self.port.as_mut() {
            Some(port) => port.write_all(data).and_then(|()| port.flush()),
            None => return Err(self.not_open()),
        };
        result.map_err(|err| self.io_error(err))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let result = match self.port.as_mut() {
            Some(port) => port.read(buf),
            None => return Err(self.not_open()),
        };
        match result {
            Ok(read) => Ok(read),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn close(&mut self) {
        self.port = None;
    }
}

/// The two consoles of one board.
pub struct DeviceLink {
    /// Login and maintenance console.
    pub shell: DeviceSession,
    /// Console the test executable runs on.
    pub results: DeviceSession,
}

/// Builds the serial sessions for a target's worker.
pub trait DeviceFactory: Send + Sync {
    /// Create the sessions for `name`. Lines are opened per command.
    fn connect(&self, name: &str, config: &TargetConfig) -> DeviceLink;
}

/// Factory for real serial hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDeviceFactory;

impl DeviceFactory for SerialDeviceFactory {
    fn connect(&self, _name: &str, config: &TargetConfig) -> DeviceLink {
        DeviceLink {
            shell: DeviceSession::new(
                Box::new(SerialPortLine::new(&config.shell)),
                config.line_ending.clone(),
            ),
            results: DeviceSession::new(
                Box::new(SerialPortLine::new(&config.results)),
                config.line_ending.clone(),
            ),
        }
    }
}
