// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for serving the devfarm proxy and submitting jobs to it.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! `devfarm` command line: run the proxy or submit a job to one.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use devfarm::client::save_results;
use devfarm::{
    submit, JobSubmission, ProxyConfig, ProxyServer, SerialDeviceFactory, SubmissionFile,
};
use devfarm_wire::OutcomeKind;
use env_logger::Env;
use log::LevelFilter;

/// CLI options for the devfarm proxy.
#[derive(Debug, Parser)]
#[command(author, version, about = "Device-farm test execution proxy")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy server.
    Serve(ServeArgs),
    /// Upload a job to a running proxy and wait for its results.
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Path to the TOML configuration.
    #[arg(long, short = 'c', default_value = "configs/devfarm.toml")]
    config: PathBuf,

    /// Override the listen address from the configuration.
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// Proxy address.
    #[arg(long, default_value = "127.0.0.1:10000")]
    server: String,

    /// Target to run on.
    #[arg(long)]
    target: String,

    /// Test case label.
    #[arg(long)]
    case: String,

    /// Test executable.
    #[arg(long)]
    app: PathBuf,

    /// Model file (repeat for multiple).
    #[arg(long = "kmodel", required = true)]
    kmodels: Vec<PathBuf>,

    /// Input file (repeat for multiple).
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,

    /// Device-side dataset directory.
    #[arg(long, requires = "dataset_number")]
    dataset_path: Option<String>,

    /// Number of dataset elements to run.
    #[arg(long, requires = "dataset_path")]
    dataset_number: Option<u32>,

    /// Inputs per dataset element.
    #[arg(long, default_value_t = 1)]
    dataset_inputs: u32,

    /// Outputs per run or per dataset element.
    #[arg(long, default_value_t = 1)]
    outputs: u32,

    /// Description file.
    #[arg(long)]
    description: Option<PathBuf>,

    /// Directory the result files are written to.
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Submit(args) => submit_job(args),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ProxyConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    let server = ProxyServer::bind(config, Arc::new(SerialDeviceFactory))
        .context("failed to start devfarm proxy")?;
    server.serve()
}

fn submit_job(args: SubmitArgs) -> Result<()> {
    let mut job = JobSubmission::new(
        args.target,
        args.case,
        SubmissionFile::from_path(&args.app)?,
    )
    .outputs(args.outputs);
    for path in &args.kmodels {
        job = job.kmodel(SubmissionFile::from_path(path)?);
    }
    for path in &args.inputs {
        job = job.input(SubmissionFile::from_path(path)?);
    }
    if let (Some(path), Some(number)) = (args.dataset_path, args.dataset_number) {
        job = job.dataset(path, number, args.dataset_inputs);
    }
    if let Some(path) = &args.description {
        job = job.description(SubmissionFile::from_path(path)?);
    }

    let outcome = submit(args.server.as_str(), &job)
        .with_context(|| format!("job submission to {} failed", args.server))?;
    println!("{}: {}", outcome.kind.as_str(), outcome.msg);
    if outcome.kind != OutcomeKind::Finish {
        bail!("job ended with {}", outcome.kind.as_str());
    }
    save_results(&args.out_dir, &outcome.results)?;
    println!(
        "saved {} result files to {}",
        outcome.results.len(),
        args.out_dir.display()
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}
