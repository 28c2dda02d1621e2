// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Background removal of finished job scratch directories.
// Author: Lukas Bower

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

/// Handle for queueing scratch directories for deletion.
#[derive(Debug, Clone)]
pub struct CleanupQueue {
    tx: Sender<PathBuf>,
}

impl CleanupQueue {
    /// Queue `path` for removal. Blocks while the queue is full.
    pub fn push(&self, path: PathBuf) {
        if let Err(err) = self.tx.send(path) {
            warn!(
                "[devfarm][cleanup] worker stopped; leaving {}",
                err.into_inner().display()
            );
        }
    }

    /// Number of paths waiting for removal.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Start the cleanup thread with a queue of `depth` paths.
pub fn spawn_cleanup_worker(depth: usize) -> io::Result<CleanupQueue> {
    let (tx, rx) = bounded(depth.max(1));
    thread::Builder::new()
        .name("devfarm-cleanup".to_owned())
        .spawn(move || run(rx))?;
    Ok(CleanupQueue { tx })
}

fn run(rx: Receiver<PathBuf>) {
    info!("[devfarm][cleanup] worker started");
    for path in rx.iter() {
        match remove_scratch(&path) {
            Ok(true) => debug!("[devfarm][cleanup] removed {}", path.display()),
            Ok(false) => debug!("[devfarm][cleanup] {} already gone", path.display()),
            Err(err) => warn!(
                "[devfarm][cleanup] failed to remove {}: {err}",
                path.display()
            ),
        }
    }
    info!("[devfarm][cleanup] worker exiting");
}

/// Recursively delete `path`. Returns `Ok(false)` if it did not exist.
pub fn remove_scratch(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
