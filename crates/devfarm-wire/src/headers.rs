// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Typed control headers exchanged at each devfarm protocol step.
// Author: Lukas Bower

//! One struct per control frame shape. Every struct rejects unknown fields so
//! that a client speaking a different dialect fails loudly instead of having
//! its extra keys silently ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Control frame carried as a JSON object.
pub trait Header: Serialize + DeserializeOwned {
    /// Label used in error messages when the header is missing or malformed.
    const KIND: &'static str;
}

/// First client frame: the target the job is destined for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetHeader {
    /// Target name, for example a board model.
    pub target: String,
}

impl Header for TargetHeader {
    const KIND: &'static str = "target";
}

/// Job declaration listing how many files of each kind follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobHeader {
    /// Test case label, used to name the scratch directory.
    pub case: String,
    /// Number of executables; always 1.
    pub app: u32,
    /// Number of model files.
    pub kmodel: u32,
    /// Number of input tensors per dataset element.
    pub inputs: u32,
    /// Number of outputs produced per dataset element.
    pub outputs: u32,
    /// 1 when a description file follows the models, 0 otherwise.
    pub description: u8,
    /// Device-side dataset directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<String>,
    /// Number of dataset elements to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_number: Option<u32>,
}

impl Header for JobHeader {
    const KIND: &'static str = "job";
}

/// Announces the name and size of the file body that follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileHeader {
    /// Base name the file is stored under.
    pub file_name: String,
    /// Exact body size in bytes.
    pub file_size: u64,
}

impl Header for FileHeader {
    const KIND: &'static str = "file";
}

/// Outcome classes reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    /// The job completed; result files follow.
    Finish,
    /// The device transcript contained an exception marker.
    Exception,
    /// The completion marker never appeared before the deadline.
    Timeout,
    /// The job failed before or after execution (transfer, device or collection).
    Error,
}

impl OutcomeKind {
    /// Lower-case label as carried on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Finish => "finish",
            OutcomeKind::Exception => "exception",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::Error => "error",
        }
    }
}

/// Final job status sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomeHeader {
    /// Outcome class.
    #[serde(rename = "type")]
    pub kind: OutcomeKind,
    /// Transcript excerpt or failure reason.
    pub msg: String,
}

impl Header for OutcomeHeader {
    const KIND: &'static str = "outcome";
}

/// Announces the size of the next result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeHeader {
    /// Result body size in bytes.
    pub file_size: u64,
}

impl Header for SizeHeader {
    const KIND: &'static str = "size";
}
