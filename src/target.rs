// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Registry of targets, each with a job queue served by one device worker.
// Author: Lukas Bower

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use log::{debug, info};

use crate::cleanup::CleanupQueue;
use crate::config::ProxyConfig;
use crate::error::JobError;
use crate::job::Job;
use crate::session::DeviceFactory;
use crate::worker::{DeviceWorker, WorkerContext};

/// A named board with its FIFO job queue.
#[derive(Debug)]
pub struct Target {
    name: String,
    shared_dir: PathBuf,
    jobs: Sender<Job>,
    cleanup: CleanupQueue,
}

impl Target {
    /// Target name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host directory shared with the board.
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Cleanup queue used for this target's scratch directories.
    pub fn cleanup(&self) -> &CleanupQueue {
        &self.cleanup
    }

    /// Append `job` to the queue, blocking while it is full.
    pub fn submit(&self, job: Job) -> Result<(), JobError> {
        debug!("[devfarm][{}] queueing job {}", self.name, job.id);
        self.jobs.send(job).map_err(|err| {
            self.cleanup.push(err.into_inner().scratch.into_path());
            JobError::WorkerGone(self.name.clone())
        })
    }

    /// Jobs waiting behind the one currently running.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }
}

/// Lazily created targets, one worker thread each.
pub struct TargetRegistry {
    config: Arc<ProxyConfig>,
    factory: Arc<dyn DeviceFactory>,
    cleanup: CleanupQueue,
    targets: Mutex<HashMap<String, Arc<Target>>>,
    next_job: AtomicU64,
}

impl TargetRegistry {
    /// Empty registry; targets are built on first use from `config`.
    pub fn new(
        config: Arc<ProxyConfig>,
        factory: Arc<dyn DeviceFactory>,
        cleanup: CleanupQueue,
    ) -> Self {
        Self {
            config,
            factory,
            cleanup,
            targets: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(1),
        }
    }

    /// Proxy configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Return the target named `name`, creating it and its worker on first use.
    pub fn resolve(&self, name: &str) -> Result<Arc<Target>, JobError> {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(target) = targets.get(name) {
            return Ok(Arc::clone(target));
        }
        let target_config = self
            .config
            .targets
            .get(name)
            .ok_or_else(|| JobError::UnknownTarget(name.to_owned()))?;

        let shared_dir = self.config.target_shared_dir(name);
        fs::create_dir_all(&shared_dir)?;
        let (tx, rx) = bounded(self.config.server.queue_depth.max(1));
        let link = self.factory.connect(name, target_config);
        let worker = DeviceWorker::new(
            WorkerContext {
                name: name.to_owned(),
                config: target_config.clone(),
                cleanup: self.cleanup.clone(),
            },
            link,
        );
        thread::Builder::new()
            .name(format!("devfarm-{name}"))
            .spawn(move || worker.run(rx))?;

        let target = Arc::new(Target {
            name: name.to_owned(),
            shared_dir,
            jobs: tx,
            cleanup: self.cleanup.clone(),
        });
        targets.insert(name.to_owned(), Arc::clone(&target));
        info!("[devfarm][{name}] target online");
        Ok(target)
    }

    /// Names of targets created so far.
    pub fn names(&self) -> Vec<String> {
        let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = targets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Next process-wide job sequence number.
    pub fn next_job_id(&self) -> u64 {
        self.next_job.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::spawn_cleanup_worker;
    use crate::mock::{completing_run, echo_prompt, mock_config, MockDeviceFactory, MOCK_PROMPT};

    fn registry(root: &Path) -> TargetRegistry {
        let config = Arc::new(mock_config(root, &["k230", "k510"]));
        let factory = Arc::new(MockDeviceFactory::new(
            echo_prompt(MOCK_PROMPT),
            completing_run("ok"),
        ));
        TargetRegistry::new(config, factory, spawn_cleanup_worker(4).unwrap())
    }

    #[test]
    fn resolve_creates_each_target_once() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());
        assert!(registry.names().is_empty());

        let first = registry.resolve("k230").unwrap();
        let again = registry.resolve("k230").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(first.shared_dir().is_dir());
        assert_eq!(first.pending(), 0);

        registry.resolve("k510").unwrap();
        assert_eq!(registry.names(), vec!["k230", "k510"]);
    }

    #[test]
    fn concurrent_resolution_yields_one_target() {
        let root = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry(root.path()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.resolve("k230").unwrap())
            })
            .collect();
        let targets: Vec<Arc<Target>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(targets.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.names(), vec!["k230"]);
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());
        let err = registry.resolve("k999").unwrap_err();
        assert!(err.is_protocol());
        assert!(matches!(err, JobError::UnknownTarget(ref name) if name == "k999"));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn job_ids_increase() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());
        let first = registry.next_job_id();
        assert_eq!(registry.next_job_id(), first + 1);
    }
}
