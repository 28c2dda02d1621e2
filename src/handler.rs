// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-connection protocol state machine from job upload to result delivery.
// Author: Lukas Bower

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::sync::Arc;

use devfarm_wire::{
    FileHeader, FramedChannel, JobHeader, OutcomeHeader, OutcomeKind, TargetHeader,
    ACK_FILE_HEADER, ACK_FILE_STORED, PROMPT_FILE, PROMPT_JOB, PROMPT_TARGET,
};
use log::{debug, info, warn};

use crate::error::JobError;
use crate::job::{
    completion_pair, is_safe_file_name, truncate_message, FileRole, Job, JobFiles, JobReport,
    JobRequest, ScratchDir, TransferredFile, MAX_OUTCOME_MSG,
};
use crate::streamer::stream_results;
use crate::target::{Target, TargetRegistry};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the target header.
    AwaitTarget,
    /// Waiting for the job header.
    AwaitHeader,
    /// Receiving the declared files.
    AwaitFiles,
    /// Handing the job to the target queue.
    Enqueued,
    /// Waiting for the worker's report.
    AwaitCompletion,
    /// Sending result files.
    StreamingResults,
    /// Done.
    Closed,
}

/// Serves one client connection.
pub struct ConnectionHandler<S> {
    channel: FramedChannel<S>,
    registry: Arc<TargetRegistry>,
    peer: String,
    state: ConnectionState,
    chunk_size: usize,
    max_file_size: u64,
}

impl<S: Read + Write> ConnectionHandler<S> {
    /// Handler for `stream` accepted from `peer`.
    pub fn new(stream: S, peer: impl Into<String>, registry: Arc<TargetRegistry>) -> Self {
        let server = &registry.config().server;
        let channel = FramedChannel::with_max_frame_len(stream, server.max_frame_len);
        let chunk_size = server.chunk_size;
        let max_file_size = server.max_file_size;
        Self {
            channel,
            registry,
            peer: peer.into(),
            state: ConnectionState::AwaitTarget,
            chunk_size,
            max_file_size,
        }
    }

    /// Drive the connection to completion. Errors are logged, never returned.
    pub fn run(mut self) {
        match self.serve() {
            Ok(()) => info!("[devfarm][conn {}] complete", self.peer),
            Err(err) if err.is_protocol() => {
                warn!("[devfarm][conn {}] closing: {err}", self.peer);
            }
            Err(err) => {
                warn!("[devfarm][conn {}] job failed: {err}", self.peer);
                self.send_failure(&err);
            }
        }
        self.transition(ConnectionState::Closed);
    }

    fn serve(&mut self) -> Result<(), JobError> {
        self.channel.send(PROMPT_TARGET)?;
        let TargetHeader { target } = self.channel.receive_header()?;
        let target = self.registry.resolve(&target)?;

        self.transition(ConnectionState::AwaitHeader);
        self.channel.send(PROMPT_JOB)?;
        let header: JobHeader = self.channel.receive_header()?;
        let request = JobRequest::from_header(target.name(), header)?;
        info!(
            "[devfarm][conn {}] job {} for {}",
            self.peer,
            request.case,
            target.name()
        );

        self.transition(ConnectionState::AwaitFiles);
        let id = self.registry.next_job_id();
        let scratch = ScratchDir::create(target.shared_dir(), &request.case, id)?;
        let files = match self.receive_files(&request, &scratch) {
            Ok(files) => files,
            Err(err) => {
                target.cleanup().push(scratch.into_path());
                return Err(err);
            }
        };

        self.transition(ConnectionState::Enqueued);
        let (completion, waiter) = completion_pair();
        target.submit(Job {
            id,
            request,
            files,
            scratch,
            completion,
        })?;

        self.transition(ConnectionState::AwaitCompletion);
        let report = waiter
            .wait()
            .ok_or_else(|| JobError::WorkerGone(target.name().to_owned()))?;
        self.respond(&target, report)
    }

    fn respond(&mut self, target: &Target, report: JobReport) -> Result<(), JobError> {
        let header = report.outcome_header();
        debug!(
            "[devfarm][conn {}] {} outcome {}",
            self.peer,
            target.name(),
            header.kind.as_str()
        );
        self.channel.send_header(&header)?;
        if let JobReport::Finished { results, .. } = report {
            self.transition(ConnectionState::StreamingResults);
            stream_results(&mut self.channel, &results, self.chunk_size)?;
        }
        Ok(())
    }

    fn receive_files(
        &mut self,
        request: &JobRequest,
        scratch: &ScratchDir,
    ) -> Result<JobFiles, JobError> {
        let mut files = JobFiles::default();
        for role in request.declared_files() {
            let file = self.receive_file(role, scratch, &files)?;
            files.push(file);
        }
        Ok(files)
    }

    fn receive_file(
        &mut self,
        role: FileRole,
        scratch: &ScratchDir,
        received: &JobFiles,
    ) -> Result<TransferredFile, JobError> {
        self.channel.send(PROMPT_FILE)?;
        let FileHeader {
            file_name,
            file_size,
        } = self.channel.receive_header()?;
        if !is_safe_file_name(&file_name) {
            return Err(JobError::InvalidRequest(format!(
                "file name {file_name:?} is not a plain file name"
            )));
        }
        if received.contains(&file_name) {
            return Err(JobError::InvalidRequest(format!(
                "file {file_name:?} was sent twice"
            )));
        }
        if file_size > self.max_file_size {
            return Err(JobError::Transfer {
                file: file_name,
                reason: format!(
                    "{file_size} bytes exceeds the upload limit of {} bytes",
                    self.max_file_size
                ),
            });
        }
        self.channel.send(ACK_FILE_HEADER)?;

        let transfer_error = |reason: String| JobError::Transfer {
            file: file_name.clone(),
            reason,
        };
        let path = scratch.host_path().join(&file_name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| transfer_error(err.to_string()))?;
        let mut sink = BufWriter::new(file);
        self.channel
            .receive_body(file_size, &mut sink)
            .map_err(|err| transfer_error(err.to_string()))?;
        sink.flush().map_err(|err| transfer_error(err.to_string()))?;
        if role == FileRole::App {
            make_executable(&path).map_err(|err| transfer_error(err.to_string()))?;
        }
        self.channel.send(ACK_FILE_STORED)?;
        debug!(
            "[devfarm][conn {}] stored {:?} {file_name} ({file_size} bytes)",
            self.peer, role
        );
        Ok(TransferredFile {
            role,
            name: file_name,
            size: file_size,
        })
    }

    fn send_failure(&mut self, err: &JobError) {
        let reason = err.to_string();
        let header = OutcomeHeader {
            kind: OutcomeKind::Error,
            msg: truncate_message(&reason, MAX_OUTCOME_MSG).to_owned(),
        };
        if let Err(send_err) = self.channel.send_header(&header) {
            debug!(
                "[devfarm][conn {}] could not report failure: {send_err}",
                self.peer
            );
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            "[devfarm][conn {}] {:?} -> {:?}",
            self.peer, self.state, next
        );
        self.state = next;
    }
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> io::Result<()> {
    Ok(())
}
