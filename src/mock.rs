// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Scripted in-memory serial lines standing in for board consoles.
// Author: Lukas Bower

//! Mock consoles for exercising workers and the full proxy without hardware.
//!
//! Each [`MockLine`] hands every command it receives to a responder closure
//! and plays the reply back after an optional delay. All lines created by one
//! [`MockDeviceFactory`] append to a shared [`CommandLog`] so tests can assert
//! on the order and timing of device commands across targets.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{LineConfig, ProxyConfig, ServerConfig, TargetConfig};
use crate::error::SessionError;
use crate::session::{DeviceFactory, DeviceLink, DeviceSession, SerialLine};

const MOCK_POLL: Duration = Duration::from_millis(2);

/// Shell prompt printed by mock consoles built with [`mock_config`].
pub const MOCK_PROMPT: &str = "~ # ";

/// Results-line separator used by [`mock_config`].
pub const MOCK_SEPARATOR: &str = "msh />";

/// Console output produced in response to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReply {
    /// Bytes the console prints.
    pub output: String,
    /// Delay before the first byte becomes readable.
    pub delay: Duration,
}

impl MockReply {
    /// Reply immediately.
    pub fn now(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            delay: Duration::ZERO,
        }
    }

    /// Reply after `delay`.
    pub fn after(delay: Duration, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            delay,
        }
    }

    /// Print nothing.
    pub fn silent() -> Self {
        Self::now(String::new())
    }
}

/// Maps a command (without line ending) to the console's reply.
pub type Responder = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

/// Responder that answers every command with `prompt`.
pub fn echo_prompt(prompt: &str) -> Responder {
    let prompt = prompt.to_owned();
    Arc::new(move |command: &str| MockReply::now(format!("{command}\r\n{prompt}")))
}

/// Results-line responder: every command prints `output` and then the separator.
pub fn completing_run(output: &str) -> Responder {
    let output = output.to_owned();
    Arc::new(move |command: &str| {
        MockReply::now(format!("{command}\r\n{output}\r\n{MOCK_SEPARATOR}"))
    })
}

/// Shell-line responder that answers with [`MOCK_PROMPT`] and, when it sees the
/// result collection command, writes `per_job` result files into the
/// destination directory named by its `mkdir -p`.
///
/// Only meaningful with [`mock_config`], where device paths are host paths.
pub fn collecting_shell(per_job: usize) -> Responder {
    Arc::new(move |command: &str| {
        if let Some(dest) = collection_dir(command) {
            let dest = Path::new(dest);
            if fs::create_dir_all(dest).is_ok() {
                for index in 0..per_job {
                    let name = format!("out_result_{index}.bin");
                    let _ = fs::write(dest.join(name), format!("result {index}"));
                }
            }
        }
        MockReply::now(format!("{command}\r\n{MOCK_PROMPT}"))
    })
}

fn collection_dir(command: &str) -> Option<&str> {
    let rest = command.strip_prefix("mkdir -p ")?;
    let (dest, tail) = rest.split_once(" && ")?;
    (dest.ends_with("/results") && tail.starts_with("cp ")).then_some(dest)
}

/// Proxy configuration for mock targets rooted at `shared_root`.
///
/// Each target's device-side shared directory is the host directory itself so
/// that responders can act on the paths they see in commands.
pub fn mock_config(shared_root: &Path, targets: &[&str]) -> ProxyConfig {
    let targets = targets
        .iter()
        .map(|name| {
            let line = |port: &str| LineConfig {
                port: format!("mock:{name}/{port}"),
                baud: 115_200,
                poll_ms: 2,
            };
            let config = TargetConfig {
                username: "root".to_owned(),
                password: String::new(),
                device_shared_dir: shared_root.join(name).to_string_lossy().into_owned(),
                working_dir: format!("/tmp/devfarm-{name}"),
                shell: line("shell"),
                results: line("results"),
                shell_prompt: MOCK_PROMPT.to_owned(),
                separator: MOCK_SEPARATOR.to_owned(),
                quit_command: "q".to_owned(),
                reboot_command: "reboot".to_owned(),
                reboot_grace_ms: 100,
                exec_timeout_ms: 1_000,
                command_timeout_ms: 1_000,
                settle_ms: 5,
                result_glob: "*result*.bin".to_owned(),
                line_ending: "\n".to_owned(),
            };
            ((*name).to_owned(), config)
        })
        .collect::<BTreeMap<_, _>>();
    ProxyConfig {
        server: ServerConfig {
            listen: "127.0.0.1:0".to_owned(),
            shared_root: shared_root.to_path_buf(),
            queue_depth: 16,
            chunk_size: 7,
            max_frame_len: devfarm_wire::DEFAULT_MAX_FRAME_LEN,
            max_file_size: 1024 * 1024,
        },
        targets,
    }
}

/// One command seen by a mock console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Line label, `<target>/shell` or `<target>/results`.
    pub line: String,
    /// Command text without line ending.
    pub command: String,
    /// When the command was written.
    pub at: Instant,
}

/// Shared, append-only record of commands.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    records: Arc<Mutex<Vec<CommandRecord>>>,
}

impl CommandLog {
    fn push(&self, record: CommandRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Snapshot of every command in write order.
    pub fn records(&self) -> Vec<CommandRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commands written to the line labelled `line`.
    pub fn commands(&self, line: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.line == line)
            .map(|record| record.command)
            .collect()
    }
}

/// Scripted serial console.
pub struct MockLine {
    label: String,
    responder: Responder,
    log: CommandLog,
    pending: VecDeque<u8>,
    ready_at: Instant,
    open: bool,
    fail_open: bool,
}

impl MockLine {
    /// Console labelled `label` answering through `responder`.
    pub fn new(label: impl Into<String>, responder: Responder, log: CommandLog) -> Self {
        Self {
            label: label.into(),
            responder,
            log,
            pending: VecDeque::new(),
            ready_at: Instant::now(),
            open: false,
            fail_open: false,
        }
    }

    /// Console whose device node can never be opened.
    pub fn unplugged(label: impl Into<String>, log: CommandLog) -> Self {
        let mut line = Self::new(label, Arc::new(|_: &str| MockReply::silent()), log);
        line.fail_open = true;
        line
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Io {
            port: self.label.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "mock line is closed"),
        }
    }
}

impl SerialLine for MockLine {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<(), SessionError> {
        if self.fail_open {
            return Err(SessionError::Open {
                port: self.label.clone(),
                reason: "no such device".to_owned(),
            });
        }
        self.open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if !self.open {
            return Err(self.closed_error());
        }
        let text = String::from_utf8_lossy(data);
        let command = text.trim_end_matches(['\r', '\n']).to_owned();
        let reply = (self.responder)(&command);
        self.log.push(CommandRecord {
            line: self.label.clone(),
            command,
            at: Instant::now(),
        });
        self.pending.extend(reply.output.into_bytes());
        self.ready_at = Instant::now() + reply.delay;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if !self.open {
            return Err(self.closed_error());
        }
        if self.pending.is_empty() || Instant::now() < self.ready_at {
            thread::sleep(MOCK_POLL);
            return Ok(0);
        }
        let count = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn close(&mut self) {
        self.open = false;
        self.pending.clear();
    }
}

/// Builds mock consoles for every target, sharing one command log.
#[derive(Clone)]
pub struct MockDeviceFactory {
    shell: Responder,
    results: Responder,
    log: CommandLog,
    unplugged: bool,
}

impl MockDeviceFactory {
    /// Factory whose shell and results consoles answer through the given responders.
    pub fn new(shell: Responder, results: Responder) -> Self {
        Self {
            shell,
            results,
            log: CommandLog::default(),
            unplugged: false,
        }
    }

    /// Factory whose consoles all fail to open.
    pub fn unplugged() -> Self {
        let mut factory = Self::new(echo_prompt(""), echo_prompt(""));
        factory.unplugged = true;
        factory
    }

    /// Log shared by every line this factory creates.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    fn line(&self, label: String, responder: &Responder) -> MockLine {
        if self.unplugged {
            MockLine::unplugged(label, self.log.clone())
        } else {
            MockLine::new(label, Arc::clone(responder), self.log.clone())
        }
    }
}

impl DeviceFactory for MockDeviceFactory {
    fn connect(&self, name: &str, config: &TargetConfig) -> DeviceLink {
        DeviceLink {
            shell: DeviceSession::new(
                Box::new(self.line(format!("{name}/shell"), &self.shell)),
                config.line_ending.clone(),
            ),
            results: DeviceSession::new(
                Box::new(self.line(format!("{name}/results"), &self.results)),
                config.line_ending.clone(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_reply_is_not_readable_early() {
        let log = CommandLog::default();
        let responder: Responder =
            Arc::new(|_: &str| MockReply::after(Duration::from_millis(30), "done"));
        let line = MockLine::new("t/results", responder, log.clone());
        let mut session = DeviceSession::new(Box::new(line), "\n");
        let early = session
            .run("./app", Some("done"), Duration::from_millis(5))
            .unwrap();
        assert!(early.timed_out);
        let late = session
            .run("./app", Some("done"), Duration::from_millis(200))
            .unwrap();
        assert!(!late.timed_out);
        assert_eq!(log.commands("t/results"), vec!["./app", "./app"]);
    }

    #[test]
    fn collecting_shell_writes_into_the_results_dir() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("case_1_1/results");
        let responder = collecting_shell(3);
        let command = format!(
            "mkdir -p {dest} && cp /w/*result*.bin {dest}/",
            dest = dest.display()
        );
        let reply = responder(&command);
        assert!(reply.output.ends_with(MOCK_PROMPT));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 3);
        assert!(collection_dir("mkdir -p /w && cp -r /s/. /w/").is_none());
    }

    #[test]
    fn unplugged_line_refuses_to_open() {
        let log = CommandLog::default();
        let line = MockLine::unplugged("t/shell", log.clone());
        let mut session = DeviceSession::new(Box::new(line), "\n");
        let err = session
            .run("root", None, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, SessionError::Open { .. }));
        assert!(log.records().is_empty());
    }
}
