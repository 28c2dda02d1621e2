// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Defines the devfarm proxy library and public module surface.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Device-farm proxy that runs uploaded test payloads on serial-attached
//! boards and streams their result files back to the submitting client.
//!
//! A [`server::ProxyServer`] accepts one thread per connection. Each
//! connection uploads a job into a scratch directory on the shared
//! filesystem and queues it on its [`target::Target`]; the target's
//! [`worker::DeviceWorker`] runs queued jobs one at a time through the
//! board's serial consoles. Finished scratch directories are removed by the
//! [`cleanup`] thread.

pub mod cleanup;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod mock;
pub mod server;
pub mod session;
pub mod streamer;
pub mod target;
pub mod worker;

pub use client::{submit, JobSubmission, SubmissionFile, SubmitOutcome};
pub use config::{ProxyConfig, TargetConfig};
pub use error::{JobError, SessionError};
pub use server::ProxyServer;
pub use session::{DeviceFactory, SerialDeviceFactory};
