// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-target device worker that runs queued jobs on one board.
// Author: Lukas Bower

//! The device worker owns a target's two serial consoles and processes its
//! queue strictly in order. Each job walks the same states:
//!
//! `Idle → Login → Stage → Execute → Classify → Collect | Reboot → Respond → Idle`
//!
//! Errors talking to the board before or after the run fail the job without a
//! reboot. An exception or timeout during the run reboots the board exactly
//! once, after the client has been told.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};

use crate::cleanup::CleanupQueue;
use crate::config::TargetConfig;
use crate::error::JobError;
use crate::job::{
    classify, natural_cmp, ExecutionOutcome, Job, JobFiles, JobReport, JobRequest, ResultFile,
    ScratchDir,
};
use crate::session::{DeviceLink, RunOutput};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next job.
    Idle,
    /// Logging into the shell console.
    Login,
    /// Copying uploads into the working directory.
    Stage,
    /// Running the executable on the results console.
    Execute,
    /// Inspecting the transcript.
    Classify,
    /// Copying and reading result files.
    Collect,
    /// Rebooting after a failed run.
    Reboot,
    /// Delivering the report.
    Respond,
}

/// What a worker knows about its target.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Target name.
    pub name: String,
    /// Target settings.
    pub config: TargetConfig,
    /// Where finished scratch directories go.
    pub cleanup: CleanupQueue,
}

/// Runs jobs for one target.
pub struct DeviceWorker {
    ctx: WorkerContext,
    link: DeviceLink,
    state: WorkerState,
    prefix: String,
}

impl DeviceWorker {
    /// Worker for `ctx` driving the consoles in `link`.
    pub fn new(ctx: WorkerContext, link: DeviceLink) -> Self {
        let prefix = format!("[devfarm][{}]", ctx.name);
        Self {
            ctx,
            link,
            state: WorkerState::Idle,
            prefix,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Process jobs until every sender is gone.
    pub fn run(mut self, jobs: Receiver<Job>) {
        info!("{} worker started", self.prefix);
        while let Ok(job) = jobs.recv() {
            self.process(job);
        }
        info!("{} worker exiting", self.prefix);
    }

    /// Run one job to completion, report it and hand its scratch dir to cleanup.
    pub fn process(&mut self, job: Job) {
        let Job {
            id,
            request,
            files,
            scratch,
            completion,
        } = job;
        info!(
            "{} job {id} ({}) started in {}",
            self.prefix,
            request.case,
            scratch.name()
        );

        let report = match self.attempt(&request, &files, &scratch) {
            Ok(report) => report,
            Err(err) => {
                error!("{} job {id} failed: {err}", self.prefix);
                JobReport::Failed {
                    reason: err.to_string(),
                }
            }
        };
        let reboot = report.needs_reboot();

        self.transition(WorkerState::Respond);
        info!(
            "{} job {id} outcome {}",
            self.prefix,
            report.outcome_header().kind.as_str()
        );
        if !completion.deliver(report) {
            warn!("{} job {id}: client went away before the outcome", self.prefix);
        }
        if reboot {
            self.transition(WorkerState::Reboot);
            self.reboot();
        }
        self.ctx.cleanup.push(scratch.into_path());
        self.transition(WorkerState::Idle);
    }

    fn attempt(
        &mut self,
        request: &JobRequest,
        files: &JobFiles,
        scratch: &ScratchDir,
    ) -> Result<JobReport, JobError> {
        self.transition(WorkerState::Login);
        self.login()?;
        self.transition(WorkerState::Stage);
        self.stage(scratch)?;
        self.transition(WorkerState::Execute);
        let run = self.execute(request, files)?;

        self.transition(WorkerState::Classify);
        match classify(run.output, run.timed_out) {
            ExecutionOutcome::Exception(transcript) => {
                warn!("{} exception marker in transcript", self.prefix);
                Ok(JobReport::Exception { transcript })
            }
            ExecutionOutcome::Timeout(transcript) => {
                warn!(
                    "{} no separator within {:?}",
                    self.prefix,
                    self.ctx.config.exec_timeout()
                );
                Ok(JobReport::Timeout { transcript })
            }
            ExecutionOutcome::Success(transcript) => {
                self.transition(WorkerState::Collect);
                let results = self.collect(request, scratch)?;
                Ok(JobReport::Finished {
                    transcript,
                    results,
                })
            }
        }
    }

    fn login(&mut self) -> Result<(), JobError> {
        let cfg = &self.ctx.config;
        let settle = cfg.settle();
        self.link.shell.run(&cfg.username, None, settle)?;
        if !cfg.password.is_empty() {
            self.link.shell.run(&cfg.password, None, settle)?;
        }
        self.shell_step("login", "")?;

        let cfg = &self.ctx.config;
        self.link.results.run(&cfg.quit_command, None, settle)?;
        self.link.results.run("", None, settle)?;
        Ok(())
    }

    fn stage(&mut self, scratch: &ScratchDir) -> Result<(), JobError> {
        let cfg = &self.ctx.config;
        let command = format!(
            "rm -rf {work} && mkdir -p {work} && cp -r {shared}/{scratch}/. {work}/",
            work = cfg.working_dir,
            shared = cfg.device_shared_dir.trim_end_matches('/'),
            scratch = scratch.name(),
        );
        self.shell_step("stage", &command)?;
        Ok(())
    }

    fn execute(&mut self, request: &JobRequest, files: &JobFiles) -> Result<RunOutput, JobError> {
        let cfg = &self.ctx.config;
        let cd = self.link.results.run(
            &format!("cd {}", cfg.working_dir),
            Some(cfg.separator.as_str()),
            cfg.command_timeout(),
        )?;
        if cd.timed_out {
            return Ok(cd);
        }
        let command = files.command_line(request);
        info!("{} running {command}", self.prefix);
        let run = self
            .link
            .results
            .run(&command, Some(cfg.separator.as_str()), cfg.exec_timeout())?;
        Ok(run.without_echo(&command))
    }

    fn collect(
        &mut self,
        request: &JobRequest,
        scratch: &ScratchDir,
    ) -> Result<Vec<ResultFile>, JobError> {
        let cfg = &self.ctx.config;
        let dest = format!(
            "{}/{}/results",
            cfg.device_shared_dir.trim_end_matches('/'),
            scratch.name()
        );
        let command = format!(
            "mkdir -p {dest} && cp {work}/{glob} {dest}/",
            work = cfg.working_dir,
            glob = cfg.result_glob,
        );
        let pattern = cfg.result_glob.clone();
        self.shell_step("collect", &command)?;

        let paths = find_results(&scratch.host_path().join("results"), &pattern)?;
        let expected = request.expected_results();
        if paths.len() != expected {
            return Err(JobError::Postcondition {
                expected,
                found: paths.len(),
            });
        }
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let data = fs::read(&path)?;
            debug!(
                "{} collected {} ({} bytes)",
                self.prefix,
                path.display(),
                data.len()
            );
            results.push(ResultFile {
                name: file_name(&path),
                data,
            });
        }
        Ok(results)
    }

    fn reboot(&mut self) {
        let cfg = &self.ctx.config;
        warn!("{} rebooting board", self.prefix);
        if let Err(err) = self
            .link
            .shell
            .run(&cfg.reboot_command, None, cfg.settle())
        {
            error!("{} reboot command failed: {err}", self.prefix);
        }
        thread::sleep(cfg.reboot_grace());
        info!("{} reboot grace period over", self.prefix);
    }

    fn shell_step(&mut self, step: &'static str, command: &str) -> Result<RunOutput, JobError> {
        let cfg = &self.ctx.config;
        let out = self
            .link
            .shell
            .run(command, Some(cfg.shell_prompt.as_str()), cfg.command_timeout())?;
        if out.timed_out {
            return Err(JobError::Unresponsive {
                line: "shell",
                step,
            });
        }
        Ok(out)
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("{} {:?} -> {:?}", self.prefix, self.state, next);
        self.state = next;
    }
}

/// Result files in `dir` matching `pattern`, in natural name order.
pub fn find_results(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, JobError> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(glob::GlobError::into_error)?;
        if path.is_file() {
            found.push(path);
        }
    }
    found.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    Ok(found)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
