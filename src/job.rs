// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Job model, scratch directories, outcome classification and command building.
// Author: Lukas Bower

//! Everything a job carries from the connection handler to its device worker
//! and back again.
//!
//! A [`JobRequest`] is built from the client's [`JobHeader`] once it has been
//! validated and is immutable afterwards. The files the client uploads are
//! recorded in [`JobFiles`] in the order the wire protocol transfers them, and
//! the finished job is reported through a one-shot [`JobCompletion`].

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::time::{SystemTime, UNIX_EPOCH};

use devfarm_wire::{JobHeader, OutcomeHeader, OutcomeKind};

use crate::error::JobError;

/// Longest outcome message sent to a client.
pub const MAX_OUTCOME_MSG: usize = 1024;

/// Transcript markers that flag an execution exception.
pub const EXCEPTION_MARKERS: [&str; 2] = ["terminate", "Exception"];

const MAX_LABEL_LEN: usize = 64;
const SCRATCH_ATTEMPTS: u32 = 16;

/// Device-side dataset the executable iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRef {
    /// Directory on the device.
    pub path: String,
    /// Number of dataset elements to run.
    pub number: u32,
}

/// Validated job declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Target the job runs on.
    pub target: String,
    /// Test case label.
    pub case: String,
    /// Whether an executable follows; always true once validated.
    pub app_present: bool,
    /// Number of model files.
    pub kmodel_count: u32,
    /// Number of inputs per dataset element.
    pub input_count: u32,
    /// Number of outputs per dataset element.
    pub output_count: u32,
    /// Whether a description file follows the models.
    pub has_description: bool,
    /// Dataset reference, when the inputs live on the device.
    pub dataset: Option<DatasetRef>,
}

/// Role of an uploaded file within the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// The test executable.
    App,
    /// The n-th model file (0-based).
    Kmodel(u32),
    /// The n-th input file (0-based).
    Input(u32),
    /// The description file.
    Description,
}

impl JobRequest {
    /// Validate a client header for `target`.
    pub fn from_header(target: &str, header: JobHeader) -> Result<Self, JobError> {
        let invalid = |msg: &str| Err(JobError::InvalidRequest(msg.to_owned()));
        if header.app != 1 {
            return invalid("app must be 1");
        }
        if header.kmodel == 0 {
            return invalid("at least one kmodel is required");
        }
        let has_description = match header.description {
            0 => false,
            1 => true,
            _ => return invalid("description must be 0 or 1"),
        };
        let dataset = match (header.dataset_path, header.dataset_number) {
            (None, None) => None,
            (Some(path), Some(number)) => {
                if number == 0 {
                    return invalid("dataset_number must be at least 1");
                }
                if !is_safe_device_path(&path) {
                    return invalid("dataset_path contains characters the device shell would interpret");
                }
                Some(DatasetRef { path, number })
            }
            _ => return invalid("dataset_path and dataset_number must be given together"),
        };
        Ok(Self {
            target: target.to_owned(),
            case: header.case,
            app_present: true,
            kmodel_count: header.kmodel,
            input_count: header.inputs,
            output_count: header.outputs,
            has_description,
            dataset,
        })
    }

    /// Files the client uploads, in transfer order.
    pub fn declared_files(&self) -> Vec<FileRole> {
        let mut roles = Vec::new();
        if self.app_present {
            roles.push(FileRole::App);
        }
        roles.extend((0..self.kmodel_count).map(FileRole::Kmodel));
        if self.dataset.is_none() {
            roles.extend((0..self.input_count).map(FileRole::Input));
        }
        if self.has_description {
            roles.push(FileRole::Description);
        }
        roles
    }

    /// Number of result files a successful run must produce.
    pub fn expected_results(&self) -> usize {
        let elements = self.dataset.as_ref().map_or(1, |dataset| dataset.number);
        elements as usize * self.output_count as usize
    }
}

/// A file persisted into the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredFile {
    /// Role within the job.
    pub role: FileRole,
    /// Base name as announced by the client.
    pub name: String,
    /// Body size in bytes.
    pub size: u64,
}

/// Uploaded files in transfer order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFiles {
    files: Vec<TransferredFile>,
}

impl JobFiles {
    /// Record a persisted file.
    pub fn push(&mut self, file: TransferredFile) {
        self.files.push(file);
    }

    /// Files in transfer order.
    pub fn iter(&self) -> impl Iterator<Item = &TransferredFile> {
        self.files.iter()
    }

    /// Whether a file with `name` was already received.
    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|file| file.name == name)
    }

    fn names(&self, pred: impl Fn(FileRole) -> bool) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(move |file| pred(file.role))
            .map(|file| file.name.as_str())
    }

    /// Device command line that runs the job from its working directory.
    ///
    /// `./<app> <kmodel...> (<input...> | <dataset_path> <dataset_number>) [<description>]`
    pub fn command_line(&self, request: &JobRequest) -> String {
        let mut args: Vec<String> = Vec::new();
        if let Some(app) = self.names(|role| role == FileRole::App).next() {
            args.push(format!("./{app}"));
        }
        args.extend(
            self.names(|role| matches!(role, FileRole::Kmodel(_)))
                .map(str::to_owned),
        );
        match &request.dataset {
            Some(dataset) => {
                args.push(dataset.path.clone());
                args.push(dataset.number.to_string());
            }
            None => args.extend(
                self.names(|role| matches!(role, FileRole::Input(_)))
                    .map(str::to_owned),
            ),
        }
        args.extend(
            self.names(|role| role == FileRole::Description)
                .map(str::to_owned),
        );
        args.join(" ")
    }
}

/// Per-job directory on the shared filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDir {
    name: String,
    host_path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh `<case>_<seq>_<unix_ms>` directory under `parent`.
    ///
    /// Creation is exclusive; a name collision bumps the timestamp and retries.
    pub fn create(parent: &Path, case: &str, seq: u64) -> io::Result<Self> {
        let label = sanitize_label(case);
        let mut stamp = unix_millis();
        for _ in 0..SCRATCH_ATTEMPTS {
            let name = format!("{label}_{seq}_{stamp}");
            let host_path = parent.join(&name);
            match fs::create_dir(&host_path) {
                Ok(()) => return Ok(Self { name, host_path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
                Err(err) => return Err(err),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free scratch directory name for {label}_{seq}"),
        ))
    }

    /// Directory name, identical on host and device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host-side path.
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Give up the handle, e.g. to queue the directory for cleanup.
    pub fn into_path(self) -> PathBuf {
        self.host_path
    }
}

/// Queued unit of work.
#[derive(Debug)]
pub struct Job {
    /// Process-wide job sequence number.
    pub id: u64,
    /// Validated declaration.
    pub request: JobRequest,
    /// Uploaded files.
    pub files: JobFiles,
    /// Scratch directory holding the uploads.
    pub scratch: ScratchDir,
    /// Completion signal back to the connection handler.
    pub completion: JobCompletion,
}

/// Result file read back from the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    /// Base name on disk.
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

/// Final state of a job, handed from the worker to the connection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    /// The run completed and produced the declared results.
    Finished {
        /// Device transcript of the run.
        transcript: String,
        /// Result files in natural name order.
        results: Vec<ResultFile>,
    },
    /// The transcript carried an exception marker.
    Exception {
        /// Device transcript of the run.
        transcript: String,
    },
    /// The completion marker did not appear in time.
    Timeout {
        /// Whatever the device printed before the deadline.
        transcript: String,
    },
    /// The job could not be run or its results could not be collected.
    Failed {
        /// Failure description.
        reason: String,
    },
}

impl JobReport {
    /// Outcome header announced to the client.
    pub fn outcome_header(&self) -> OutcomeHeader {
        let (kind, msg) = match self {
            JobReport::Finished { transcript, .. } => {
                (OutcomeKind::Finish, transcript_tail(transcript, MAX_OUTCOME_MSG))
            }
            JobReport::Exception { transcript } => {
                (OutcomeKind::Exception, transcript_tail(transcript, MAX_OUTCOME_MSG))
            }
            JobReport::Timeout { transcript } => {
                (OutcomeKind::Timeout, transcript_tail(transcript, MAX_OUTCOME_MSG))
            }
            JobReport::Failed { reason } => {
                (OutcomeKind::Error, truncate_message(reason, MAX_OUTCOME_MSG))
            }
        };
        OutcomeHeader {
            kind,
            msg: msg.to_owned(),
        }
    }

    /// Whether the run failed on the device and needs a reboot.
    pub fn needs_reboot(&self) -> bool {
        matches!(
            self,
            JobReport::Exception { .. } | JobReport::Timeout { .. }
        )
    }
}

/// Sending half of a job's one-shot completion signal.
#[derive(Debug)]
pub struct JobCompletion {
    tx: SyncSender<JobReport>,
}

/// Receiving half of a job's one-shot completion signal.
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: Receiver<JobReport>,
}

/// Create a connected completion pair.
pub fn completion_pair() -> (JobCompletion, CompletionWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (JobCompletion { tx }, CompletionWaiter { rx })
}

impl JobCompletion {
    /// Deliver the report; returns false when the waiter is gone.
    pub fn deliver(self, report: JobReport) -> bool {
        self.tx.send(report).is_ok()
    }
}

impl CompletionWaiter {
    /// Block until the report arrives; `None` if the worker dropped the job.
    pub fn wait(self) -> Option<JobReport> {
        self.rx.recv().ok()
    }
}

/// Classified result of running the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Completion marker seen and no exception marker.
    Success(String),
    /// Exception marker present.
    Exception(String),
    /// Completion marker missing at the deadline.
    Timeout(String),
}

/// Classify an execution transcript.
///
/// Exception markers win over everything else; otherwise a read that hit its
/// deadline is a timeout.
pub fn classify(transcript: String, timed_out: bool) -> ExecutionOutcome {
    if EXCEPTION_MARKERS
        .iter()
        .any(|marker| transcript.contains(marker))
    {
        ExecutionOutcome::Exception(transcript)
    } else if timed_out {
        ExecutionOutcome::Timeout(transcript)
    } else {
        ExecutionOutcome::Success(transcript)
    }
}

/// Whether `name` can be stored as a plain file in a scratch directory and
/// passed to the device shell unquoted.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains("..")
        && !name.starts_with('-')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '+'))
}

fn is_safe_device_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | '+'))
}

/// Reduce a case label to `[A-Za-z0-9_-]`, bounded in length.
pub fn sanitize_label(case: &str) -> String {
    let label: String = case
        .chars()
        .take(MAX_LABEL_LEN)
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if label.is_empty() {
        "job".to_owned()
    } else {
        label
    }
}

/// Cut `msg` to at most `max` bytes on a character boundary.
pub fn truncate_message(msg: &str, max: usize) -> &str {
    if msg.len() <= max {
        return msg;
    }
    let mut end = max;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg[..end]
}

/// Last `max` bytes of `transcript` on a character boundary. Crash output
/// arrives at the end of a run, so the tail is what gets reported.
pub fn transcript_tail(transcript: &str, max: usize) -> &str {
    if transcript.len() <= max {
        return transcript;
    }
    let mut start = transcript.len() - max;
    while !transcript.is_char_boundary(start) {
        start += 1;
    }
    &transcript[start..]
}

/// Order names so that embedded numbers compare by value (`r2` < `r10`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.as_bytes();
    let mut right = b.as_bytes();
    loop {
        match (left.first(), right.first()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let (l_num, l_rest) = split_digits(left);
                let (r_num, r_rest) = split_digits(right);
                let l_trim = trim_zeros(l_num);
                let r_trim = trim_zeros(r_num);
                let ord = l_trim
                    .len()
                    .cmp(&r_trim.len())
                    .then_with(|| l_trim.cmp(r_trim));
                if ord != Ordering::Equal {
                    return ord;
                }
                left = l_rest;
                right = r_rest;
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(r);
                }
                left = &left[1..];
                right = &right[1..];
            }
        }
    }
}

fn split_digits(bytes: &[u8]) -> (&[u8], &[u8]) {
    let end = bytes
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(bytes.len());
    bytes.split_at(end)
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits
        .iter()
        .position(|b| *b != b'0')
        .unwrap_or(digits.len());
    &digits[start..]
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
