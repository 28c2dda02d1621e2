// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and validate the devfarm proxy TOML configuration.
// Author: Lukas Bower

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use devfarm_wire::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Listener and shared-storage settings.
    pub server: ServerConfig,
    /// Per-target device settings keyed by target name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

/// Listener and shared-storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host path of the shared filesystem; each target gets a subdirectory.
    pub shared_root: PathBuf,
    /// Capacity of each target's job queue and of the cleanup queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Largest raw frame the proxy sends when streaming result bodies.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest frame the proxy accepts from clients.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Largest single upload accepted into a scratch directory.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LineConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Poll interval of a single serial read.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

/// Settings for one physical board.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Login user on the shell line.
    pub username: String,
    /// Login password; empty when the board has none.
    #[serde(default)]
    pub password: String,
    /// Device-side mount point of this target's shared directory.
    pub device_shared_dir: String,
    /// Device-local directory jobs are staged into and executed from.
    pub working_dir: String,
    /// Login/maintenance serial line.
    pub shell: LineConfig,
    /// Serial line the test executable runs on.
    pub results: LineConfig,
    /// Prompt printed by the shell line once a command finished.
    #[serde(default = "default_shell_prompt")]
    pub shell_prompt: String,
    /// Prompt printed by the results line once a command finished.
    pub separator: String,
    /// Command that leaves a stale interactive program on the results line.
    #[serde(default = "default_quit_command")]
    pub quit_command: String,
    /// Command that reboots the board.
    #[serde(default = "default_reboot_command")]
    pub reboot_command: String,
    /// Pause after a reboot before the next job is accepted.
    #[serde(default = "default_reboot_grace_ms")]
    pub reboot_grace_ms: u64,
    /// Deadline for the test executable to print the separator.
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
    /// Deadline for login, staging and collection commands.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Read window for commands that do not wait for a prompt.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Glob matching the result files the executable writes.
    #[serde(default = "default_result_glob")]
    pub result_glob: String,
    /// Bytes appended to every command written to a serial line.
    #[serde(default = "default_line_ending")]
    pub line_ending: String,
}

impl TargetConfig {
    /// Reboot grace period.
    pub fn reboot_grace(&self) -> Duration {
        Duration::from_millis(self.reboot_grace_ms)
    }

    /// Execution deadline.
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    /// Maintenance command deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Read window for prompt-less commands.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        for (field, value) in [
            ("username", &self.username),
            ("device_shared_dir", &self.device_shared_dir),
            ("working_dir", &self.working_dir),
            ("shell_prompt", &self.shell_prompt),
            ("separator", &self.separator),
            ("reboot_command", &self.reboot_command),
            ("shell.port", &self.shell.port),
            ("results.port", &self.results.port),
        ] {
            if value.trim().is_empty() {
                bail!("target {name}: {field} must not be empty");
            }
        }
        if self.working_dir.trim() == "/" {
            bail!("target {name}: working_dir must not be the device root");
        }
        if self.shell.baud == 0 || self.results.baud == 0 {
            bail!("target {name}: baud rates must be non-zero");
        }
        if self.exec_timeout_ms == 0 || self.command_timeout_ms == 0 {
            bail!("target {name}: timeouts must be non-zero");
        }
        glob::Pattern::new(&self.result_glob)
            .map_err(|err| anyhow!("target {name}: invalid result_glob: {err}"))?;
        if self.result_glob.contains('/') {
            bail!("target {name}: result_glob must match file names only");
        }
        Ok(())
    }
}

impl ProxyConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ProxyConfig = toml::from_str(contents).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.queue_depth == 0 {
            bail!("server.queue_depth must be at least 1");
        }
        if server.chunk_size == 0 || server.chunk_size > server.max_frame_len as usize {
            bail!(
                "server.chunk_size must be between 1 and max_frame_len ({})",
                server.max_frame_len
            );
        }
        if server.max_file_size == 0 {
            bail!("server.max_file_size must be at least 1");
        }
        if self.targets.is_empty() {
            bail!("at least one [targets.<name>] section is required");
        }
        for (name, target) in &self.targets {
            if !is_valid_target_name(name) {
                bail!("target name {name:?} must use only letters, digits, '-' and '_'");
            }
            target.validate(name)?;
        }
        Ok(())
    }

    /// Host directory shared with the named target.
    pub fn target_shared_dir(&self, name: &str) -> PathBuf {
        self.server.shared_root.join(name)
    }
}

fn is_valid_target_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn default_listen() -> String {
    "0.0.0.0:10000".to_owned()
}

fn default_queue_depth() -> usize {
    256
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

fn default_max_file_size() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_baud() -> u32 {
    115_200
}

fn default_poll_ms() -> u64 {
    100
}

fn default_shell_prompt() -> String {
    "# ".to_owned()
}

fn default_quit_command() -> String {
    "q".to_owned()
}

fn default_reboot_command() -> String {
    "reboot".to_owned()
}

fn default_reboot_grace_ms() -> u64 {
    20_000
}

fn default_exec_timeout_ms() -> u64 {
    120_000
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_settle_ms() -> u64 {
    500
}

fn default_result_glob() -> String {
    "*result*.bin".to_owned()
}

fn default_line_ending() -> String {
    "\r\n".to_owned()
}
