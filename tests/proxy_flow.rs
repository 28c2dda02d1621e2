// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end job submission against a loopback proxy with mock boards.
// Author: Lukas Bower

mod common;

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use devfarm::mock::{
    collecting_shell, completing_run, echo_prompt, MockDeviceFactory, MockReply, Responder,
    MOCK_PROMPT, MOCK_SEPARATOR,
};
use devfarm::{submit, JobSubmission, SubmissionFile};
use devfarm_wire::{
    FileHeader, FramedChannel, JobHeader, OutcomeHeader, OutcomeKind, TargetHeader,
};

use common::{simple_job, start, wait_until};

#[test]
fn dataset_job_streams_every_result_in_order() {
    let proxy = start(
        MockDeviceFactory::new(collecting_shell(6), completing_run("top1 ok")),
        &["k230"],
    );
    let job = JobSubmission::new("k230", "resnet", SubmissionFile::new("app", b"bin".to_vec()))
        .kmodel(SubmissionFile::new("resnet.kmodel", vec![7u8; 1000]))
        .dataset("/sharefs/imagenet", 2, 1)
        .outputs(3);

    let outcome = submit(proxy.addr, &job).unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Finish);
    assert!(outcome.msg.contains("top1 ok"));
    assert_eq!(outcome.results.len(), 6);
    for (index, data) in outcome.results.iter().enumerate() {
        assert_eq!(data, format!("result {index}").as_bytes());
    }

    let run = proxy.log.commands("k230/results");
    assert!(run.contains(&"./app resnet.kmodel /sharefs/imagenet 2".to_owned()));
    assert!(wait_until(Duration::from_secs(5), || proxy
        .scratch_dirs("k230")
        .is_empty()));
}

#[test]
fn input_files_are_uploaded_and_passed_in_order() {
    let proxy = start(
        MockDeviceFactory::new(collecting_shell(1), completing_run("done")),
        &["k230"],
    );
    let job = simple_job("k230", "add", 1)
        .input(SubmissionFile::new("input_1.bin", vec![2u8; 5]))
        .description(SubmissionFile::new("desc.txt", b"add two tensors".to_vec()));

    let outcome = submit(proxy.addr, &job).unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Finish);
    assert_eq!(outcome.results, vec![b"result 0".to_vec()]);
    let run = proxy.log.commands("k230/results");
    assert!(run.contains(&"./app model.kmodel input_0.bin input_1.bin desc.txt".to_owned()));
}

#[test]
fn exception_is_reported_and_the_board_rebooted_before_the_next_job() {
    let results: Responder = Arc::new(|command: &str| {
        if command.starts_with("./") {
            MockReply::now(format!(
                "{command}\r\nterminate called after throwing 'std::runtime_error'\r\n{MOCK_SEPARATOR}"
            ))
        } else {
            MockReply::now(format!("{command}\r\n{MOCK_SEPARATOR}"))
        }
    });
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), results),
        &["k230"],
    );

    let first = submit(proxy.addr, &simple_job("k230", "crash", 1)).unwrap();
    assert_eq!(first.kind, OutcomeKind::Exception);
    assert!(first.msg.contains("terminate called"));
    assert!(first.results.is_empty());

    let second = submit(proxy.addr, &simple_job("k230", "crash", 1)).unwrap();
    assert_eq!(second.kind, OutcomeKind::Exception);

    let records = proxy.log.records();
    let reboot = records
        .iter()
        .position(|record| record.command == "reboot")
        .expect("reboot issued");
    let next = &records[reboot + 1];
    assert_eq!(next.line, "k230/shell");
    assert_eq!(next.command, "root");
    assert!(next.at.duration_since(records[reboot].at) >= Duration::from_millis(100));
}

#[test]
fn timeout_outcome_carries_partial_transcript() {
    let results: Responder = Arc::new(|command: &str| {
        if command.starts_with("./") {
            MockReply::now(format!("{command}\r\nloading model"))
        } else {
            MockReply::now(format!("{command}\r\n{MOCK_SEPARATOR}"))
        }
    });
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), results),
        &["k230"],
    );
    let outcome = submit(proxy.addr, &simple_job("k230", "hang", 1)).unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Timeout);
    assert!(outcome.msg.contains("loading model"));
    // The outcome is delivered before the board is rebooted.
    assert!(wait_until(Duration::from_secs(5), || proxy
        .log
        .commands("k230/shell")
        .iter()
        .any(|command| command == "reboot")));
}

#[test]
fn unreachable_board_reports_an_error_outcome() {
    let proxy = start(MockDeviceFactory::unplugged(), &["k230"]);
    let outcome = submit(proxy.addr, &simple_job("k230", "dead", 1)).unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert!(outcome.msg.contains("device communication failed"));
    assert!(outcome.results.is_empty());
}

#[test]
fn missing_results_report_an_error_outcome() {
    let proxy = start(
        MockDeviceFactory::new(collecting_shell(1), completing_run("ok")),
        &["k230"],
    );
    let outcome = submit(proxy.addr, &simple_job("k230", "short", 2)).unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert_eq!(outcome.msg, "collected 1 result files, expected 2");
    assert!(!proxy
        .log
        .commands("k230/shell")
        .iter()
        .any(|command| command == "reboot"));
}

#[test]
fn unknown_target_closes_without_outcome() {
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), completing_run("ok")),
        &["k230"],
    );
    assert!(submit(proxy.addr, &simple_job("k999", "lost", 1)).is_err());
    assert!(proxy.registry.names().is_empty());
    assert!(proxy.log.records().is_empty());
}

#[test]
fn unsafe_file_names_are_rejected() {
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), completing_run("ok")),
        &["k230"],
    );
    let job = JobSubmission::new("k230", "evil", SubmissionFile::new("../app", b"x".to_vec()))
        .kmodel(SubmissionFile::new("m.kmodel", b"m".to_vec()));
    assert!(submit(proxy.addr, &job).is_err());
    assert!(!proxy.shared_dir("k230").join("../app").exists());
    assert!(wait_until(Duration::from_secs(5), || proxy
        .scratch_dirs("k230")
        .is_empty()));
    assert!(proxy.log.records().is_empty());
}

fn handshake(proxy: &common::Proxy, header: &JobHeader) -> FramedChannel<TcpStream> {
    let stream = TcpStream::connect(proxy.addr).unwrap();
    let mut channel = FramedChannel::new(stream);
    channel.receive_ack("target prompt").unwrap();
    channel
        .send_header(&TargetHeader {
            target: "k230".into(),
        })
        .unwrap();
    channel.receive_ack("job prompt").unwrap();
    channel.send_header(header).unwrap();
    channel
}

fn header(app: u32) -> JobHeader {
    JobHeader {
        case: "raw".into(),
        app,
        kmodel: 1,
        inputs: 0,
        outputs: 1,
        description: 0,
        dataset_path: None,
        dataset_number: None,
    }
}

#[test]
fn invalid_job_header_closes_the_connection() {
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), completing_run("ok")),
        &["k230"],
    );
    let mut channel = handshake(&proxy, &header(2));
    assert!(channel.receive().unwrap().is_none());
}

#[test]
fn interrupted_upload_is_cleaned_up_and_never_runs() {
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), completing_run("ok")),
        &["k230"],
    );
    let mut channel = handshake(&proxy, &header(1));
    channel.receive_ack("file prompt").unwrap();
    channel
        .send_header(&FileHeader {
            file_name: "app".into(),
            file_size: 100,
        })
        .unwrap();
    channel.receive_ack("file header ack").unwrap();
    channel.send(&[0u8; 10]).unwrap();
    channel
        .get_ref()
        .shutdown(std::net::Shutdown::Write)
        .unwrap();

    let outcome: OutcomeHeader = channel.receive_header().unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert!(outcome.msg.contains("transfer of app failed"));
    assert!(wait_until(Duration::from_secs(5), || proxy
        .scratch_dirs("k230")
        .is_empty()));
    assert!(proxy.log.records().is_empty());
}

#[test]
fn oversized_body_is_a_transfer_error() {
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), completing_run("ok")),
        &["k230"],
    );
    let mut channel = handshake(&proxy, &header(1));
    channel.receive_ack("file prompt").unwrap();
    channel
        .send_header(&FileHeader {
            file_name: "app".into(),
            file_size: 4,
        })
        .unwrap();
    channel.receive_ack("file header ack").unwrap();
    channel.send(b"toolong").unwrap();

    let outcome: OutcomeHeader = channel.receive_header().unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert!(outcome.msg.contains("overruns"));
}

#[test]
fn marker_words_in_file_names_do_not_fail_a_clean_run() {
    let proxy = start(
        MockDeviceFactory::new(collecting_shell(1), completing_run("all layers ok")),
        &["k230"],
    );
    let job = JobSubmission::new("k230", "ops", SubmissionFile::new("app", b"bin".to_vec()))
        .kmodel(SubmissionFile::new("terminate_op.kmodel", vec![3u8; 10]))
        .input(SubmissionFile::new("Exception_in.bin", vec![4u8; 10]))
        .outputs(1);

    let outcome = submit(proxy.addr, &job).unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Finish);
    assert_eq!(outcome.msg, "all layers ok\r\n");
    assert_eq!(outcome.results, vec![b"result 0".to_vec()]);
    assert!(!proxy
        .log
        .commands("k230/shell")
        .iter()
        .any(|command| command == "reboot"));
}

#[test]
fn upload_over_the_size_limit_is_refused() {
    let proxy = start(
        MockDeviceFactory::new(echo_prompt(MOCK_PROMPT), completing_run("ok")),
        &["k230"],
    );
    let mut channel = handshake(&proxy, &header(1));
    channel.receive_ack("file prompt").unwrap();
    channel
        .send_header(&FileHeader {
            file_name: "app".into(),
            file_size: 2 * 1024 * 1024,
        })
        .unwrap();

    let outcome: OutcomeHeader = channel.receive_header().unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert!(outcome.msg.contains("exceeds the upload limit"));
    assert!(wait_until(Duration::from_secs(5), || proxy
        .scratch_dirs("k230")
        .is_empty()));
    assert!(proxy.log.records().is_empty());
}
