// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Defines the devfarm wire library and public module surface.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Wire representations shared by the devfarm proxy and its clients.
//!
//! Every message is a frame: a 4-byte big-endian length followed by exactly
//! that many payload bytes. Control frames carry one JSON object per protocol
//! step (see [`headers`]); file and result bodies travel as raw binary frames
//! whose sizes add up to the size announced in the preceding header.

mod channel;
pub mod headers;

pub use channel::{ChannelError, FramedChannel};
pub use headers::{
    FileHeader, Header, JobHeader, OutcomeHeader, OutcomeKind, SizeHeader, TargetHeader,
};

/// Default ceiling on a single frame payload.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Default chunk size used when splitting file and result bodies into frames.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Prompt sent by the server before the client declares its target.
pub const PROMPT_TARGET: &[u8] = b"target?";

/// Prompt sent by the server before the client declares the job header.
pub const PROMPT_JOB: &[u8] = b"job?";

/// Prompt sent by the server before each file header.
pub const PROMPT_FILE: &[u8] = b"file?";

/// Acknowledgement sent once a file header was accepted; the body follows.
pub const ACK_FILE_HEADER: &[u8] = b"body?";

/// Acknowledgement sent once a file body was persisted.
pub const ACK_FILE_STORED: &[u8] = b"stored";

/// Acknowledgement sent by the client to request the next result file.
pub const ACK_SEND: &[u8] = b"send";

/// Acknowledgement sent by the client once it read a result size header.
pub const ACK_SIZE: &[u8] = b"ready";
