// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared harness starting a proxy on loopback with mock boards.
// Author: Lukas Bower

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use devfarm::mock::{mock_config, CommandLog, MockDeviceFactory};
use devfarm::target::TargetRegistry;
use devfarm::{JobSubmission, ProxyServer, SubmissionFile};
use tempfile::TempDir;

pub struct Proxy {
    pub addr: SocketAddr,
    pub log: CommandLog,
    pub registry: Arc<TargetRegistry>,
    root: TempDir,
}

impl Proxy {
    pub fn shared_dir(&self, target: &str) -> PathBuf {
        self.root.path().join(target)
    }

    /// Scratch directories currently present for `target`.
    pub fn scratch_dirs(&self, target: &str) -> Vec<PathBuf> {
        match std::fs::read_dir(self.shared_dir(target)) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn start(factory: MockDeviceFactory, targets: &[&str]) -> Proxy {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = tempfile::tempdir().unwrap();
    let config = mock_config(root.path(), targets);
    let log = factory.log();
    let server = ProxyServer::bind(config, Arc::new(factory)).unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    thread::spawn(move || server.serve());
    Proxy {
        addr,
        log,
        registry,
        root,
    }
}

pub fn simple_job(target: &str, case: &str, outputs: u32) -> JobSubmission {
    JobSubmission::new(target, case, SubmissionFile::new("app", b"\x7fELF app".to_vec()))
        .kmodel(SubmissionFile::new("model.kmodel", vec![0u8; 300]))
        .input(SubmissionFile::new("input_0.bin", vec![1u8; 20]))
        .outputs(outputs)
        .chunk_size(64)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
