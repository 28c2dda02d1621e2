// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Client side of the devfarm protocol for submitting jobs to a proxy.
// Author: Lukas Bower

use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use devfarm_wire::{
    FileHeader, FramedChannel, JobHeader, OutcomeHeader, OutcomeKind, SizeHeader, TargetHeader,
    ACK_SEND, ACK_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN,
};
use log::debug;

/// A file uploaded as part of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFile {
    /// Base name stored on the proxy.
    pub name: String,
    /// Contents.
    pub data: Vec<u8>,
}

impl SubmissionFile {
    /// In-memory file.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Read `path` from disk, keeping its base name.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
            .to_owned();
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self { name, data })
    }
}

/// Job to submit.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    target: String,
    case: String,
    app: SubmissionFile,
    kmodels: Vec<SubmissionFile>,
    inputs: Vec<SubmissionFile>,
    input_count: Option<u32>,
    dataset: Option<(String, u32)>,
    outputs: u32,
    description: Option<SubmissionFile>,
    chunk_size: usize,
}

impl JobSubmission {
    /// Job running `app` on `target`.
    pub fn new(target: impl Into<String>, case: impl Into<String>, app: SubmissionFile) -> Self {
        Self {
            target: target.into(),
            case: case.into(),
            app,
            kmodels: Vec::new(),
            inputs: Vec::new(),
            input_count: None,
            dataset: None,
            outputs: 1,
            description: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Add a model file.
    pub fn kmodel(mut self, file: SubmissionFile) -> Self {
        self.kmodels.push(file);
        self
    }

    /// Add an input file (ignored when a dataset is used).
    pub fn input(mut self, file: SubmissionFile) -> Self {
        self.inputs.push(file);
        self
    }

    /// Run over a device-side dataset of `number` elements with
    /// `inputs_per_element` inputs each.
    pub fn dataset(mut self, path: impl Into<String>, number: u32, inputs_per_element: u32) -> Self {
        self.dataset = Some((path.into(), number));
        self.input_count = Some(inputs_per_element);
        self
    }

    /// Outputs produced per run (or per dataset element).
    pub fn outputs(mut self, outputs: u32) -> Self {
        self.outputs = outputs;
        self
    }

    /// Attach a description file.
    pub fn description(mut self, file: SubmissionFile) -> Self {
        self.description = Some(file);
        self
    }

    /// Frame size used for uploads.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn header(&self) -> Result<JobHeader> {
        let count = |len: usize, what: &str| {
            u32::try_from(len).map_err(|_| anyhow!("too many {what} files"))
        };
        Ok(JobHeader {
            case: self.case.clone(),
            app: 1,
            kmodel: count(self.kmodels.len(), "kmodel")?,
            inputs: match self.input_count {
                Some(per_element) => per_element,
                None => count(self.inputs.len(), "input")?,
            },
            outputs: self.outputs,
            description: u8::from(self.description.is_some()),
            dataset_path: self.dataset.as_ref().map(|(path, _)| path.clone()),
            dataset_number: self.dataset.as_ref().map(|(_, number)| *number),
        })
    }

    fn uploads(&self) -> impl Iterator<Item = &SubmissionFile> {
        let inputs = if self.dataset.is_some() {
            &[][..]
        } else {
            &self.inputs[..]
        };
        std::iter::once(&self.app)
            .chain(self.kmodels.iter())
            .chain(inputs.iter())
            .chain(self.description.iter())
    }

    fn expected_results(&self) -> usize {
        let elements = self.dataset.as_ref().map_or(1, |(_, number)| *number);
        elements as usize * self.outputs as usize
    }
}

/// Result of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Outcome class reported by the proxy.
    pub kind: OutcomeKind,
    /// Transcript excerpt or failure reason.
    pub msg: String,
    /// Result file contents, in order; empty unless `kind` is `Finish`.
    pub results: Vec<Vec<u8>>,
}

/// Upload `job` to the proxy at `addr` and wait for its outcome and results.
pub fn submit(addr: impl ToSocketAddrs, job: &JobSubmission) -> Result<SubmitOutcome> {
    let stream = TcpStream::connect(addr).context("failed to connect to devfarm proxy")?;
    stream
        .set_nodelay(true)
        .context("failed to configure TCP_NODELAY")?;
    let mut channel = FramedChannel::with_max_frame_len(stream, DEFAULT_MAX_FRAME_LEN);

    channel.receive_ack("target prompt")?;
    channel.send_header(&TargetHeader {
        target: job.target.clone(),
    })?;
    channel.receive_ack("job prompt")?;
    channel.send_header(&job.header()?)?;

    for file in job.uploads() {
        channel.receive_ack("file prompt")?;
        channel.send_header(&FileHeader {
            file_name: file.name.clone(),
            file_size: file.data.len() as u64,
        })?;
        channel.receive_ack("file header acknowledgement")?;
        channel.send_body(&file.data, job.chunk_size)?;
        channel
            .receive_ack("file stored acknowledgement")
            .with_context(|| format!("proxy did not store {}", file.name))?;
        debug!(
            "[devfarm][submit] uploaded {} ({} bytes)",
            file.name,
            file.data.len()
        );
    }

    let outcome: OutcomeHeader = channel
        .receive_header()
        .context("proxy closed the connection without an outcome")?;
    let mut results = Vec::new();
    if outcome.kind == OutcomeKind::Finish {
        for index in 0..job.expected_results() {
            channel.send(ACK_SEND)?;
            let size: SizeHeader = channel.receive_header()?;
            channel.send(ACK_SIZE)?;
            let mut body = Vec::new();
            let received = channel.receive_body(size.file_size, &mut body)?;
            if received != size.file_size {
                bail!(
                    "result {index} was {received} bytes, expected {}",
                    size.file_size
                );
            }
            results.push(body);
        }
    }
    Ok(SubmitOutcome {
        kind: outcome.kind,
        msg: outcome.msg,
        results,
    })
}

/// Write `results` into `dir` as `result_<n>.bin`.
pub fn save_results(dir: &Path, results: &[Vec<u8>]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    for (index, data) in results.iter().enumerate() {
        let path = dir.join(format!("result_{index}.bin"));
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
