// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-job error taxonomy shared by the connection handler and device workers.
// Author: Lukas Bower

use std::io;

use devfarm_wire::ChannelError;
use thiserror::Error;

/// Errors raised while driving a serial line.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The serial device could not be opened.
    #[error("failed to open serial line {port}: {reason}")]
    Open {
        /// Port path or label.
        port: String,
        /// Driver-reported reason.
        reason: String,
    },
    /// A read or write on an open line failed.
    #[error("serial line {port} i/o error: {source}")]
    Io {
        /// Port path or label.
        port: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Failures that end a job before a normal outcome is produced.
#[derive(Debug, Error)]
pub enum JobError {
    /// Framing or header failure on the client connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ChannelError),
    /// A well-formed header carried values the proxy does not accept.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The client named a target with no configuration section.
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    /// A file body could not be received or persisted.
    #[error("transfer of {file} failed: {reason}")]
    Transfer {
        /// File name announced by the client.
        file: String,
        /// What went wrong.
        reason: String,
    },
    /// The device serial lines could not be driven.
    #[error("device communication failed: {0}")]
    Device(#[from] SessionError),
    /// A maintenance command never returned to its prompt.
    #[error("{step} on the {line} line did not return to the prompt")]
    Unresponsive {
        /// Serial line name.
        line: &'static str,
        /// Worker step that issued the command.
        step: &'static str,
    },
    /// Collection found a different number of result files than declared.
    #[error("collected {found} result files, expected {expected}")]
    Postcondition {
        /// Count derived from the job header.
        expected: usize,
        /// Count found in the scratch directory.
        found: usize,
    },
    /// The target's worker thread is gone and cannot take or finish jobs.
    #[error("worker for target {0} is not running")]
    WorkerGone(String),
    /// Host-side filesystem or thread failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl JobError {
    /// Protocol errors close the connection without an outcome frame.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            JobError::Protocol(_) | JobError::InvalidRequest(_) | JobError::UnknownTarget(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_class_covers_header_failures() {
        assert!(JobError::UnknownTarget("k510".into()).is_protocol());
        assert!(JobError::InvalidRequest("app must be 1".into()).is_protocol());
        assert!(JobError::Protocol(ChannelError::UnexpectedEof("job header")).is_protocol());
        let transfer = JobError::Transfer {
            file: "app".into(),
            reason: "connection closed".into(),
        };
        assert!(!transfer.is_protocol());
        assert!(!JobError::Postcondition {
            expected: 2,
            found: 1
        }
        .is_protocol());
    }

    #[test]
    fn messages_name_the_failing_step() {
        let err = JobError::Unresponsive {
            line: "shell",
            step: "stage",
        };
        assert_eq!(
            err.to_string(),
            "stage on the shell line did not return to the prompt"
        );
    }
}
