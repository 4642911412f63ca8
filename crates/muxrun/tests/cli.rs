mod common;

use std::io::Write;
use std::process::{Command, Output, Stdio};

use muxrun_exec::protocol::{READY_LINE, Reply, decode_reply};

use common::MUXRUN;

/// Run the coordinator subcommand with `input` on stdin
fn coordinator(args: &[&str], input: &str) -> Output {
    let mut child = Command::new(MUXRUN)
        .arg("coordinator")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

fn replies(stdout: &[u8]) -> (Vec<String>, Vec<Reply>) {
    let text = String::from_utf8(stdout.to_vec()).unwrap();
    let lines: Vec<String> = text.lines().map(String::from).collect();
    let replies = lines[1..]
        .iter()
        .map(|line| decode_reply(line).unwrap())
        .collect();
    (lines, replies)
}

fn output_of(replies: &[Reply], wanted: usize) -> muxrun_exec::CommandOutput {
    replies
        .iter()
        .find_map(|reply| match reply {
            Reply::Result { index, output } if *index == wanted => Some(output.clone()),
            _ => None,
        })
        .unwrap()
}

#[test]
fn test_coordinator_argv_batch() {
    let input = "[\"echo\",\"hi\"]\n[\"/nonexistent/muxrun-test-binary\"]\n[\"sh\",\"-c\",\"exit 7\"]\ndone\n";
    let output = coordinator(&["--mode", "argv", "--max-runtime", "0"], input);

    assert!(output.status.success());
    let (lines, replies) = replies(&output.stdout);
    assert_eq!(lines[0], READY_LINE);
    assert_eq!(replies.last(), Some(&Reply::Done));
    assert_eq!(replies.len(), 4);

    assert_eq!(output_of(&replies, 0).stdout, b"hi\n");
    let missing = output_of(&replies, 1);
    assert_eq!(missing.status, 1);
    assert!(!missing.stderr.is_empty());
    assert_eq!(output_of(&replies, 2).status, 7);
}

#[test]
fn test_coordinator_shell_batch() {
    let input = "\"printf 'a\\\\0b'; echo e >&2\"\ndone\n";
    let output = coordinator(&["--mode", "shell"], input);

    assert!(output.status.success());
    let (_, replies) = replies(&output.stdout);
    let result = output_of(&replies, 0);
    assert_eq!(result.status, 0);
    assert_eq!(result.stdout, b"a\0b");
    assert_eq!(result.stderr, b"e\n");
}

#[test]
fn test_coordinator_leaves_input_after_sentinel() {
    let input = "[\"true\"]\ndone\nleftover line\n";
    let output = coordinator(&["--mode", "argv"], input);

    assert!(output.status.success());
    let (_, replies) = replies(&output.stdout);
    assert_eq!(replies.len(), 2);
}

#[test]
fn test_coordinator_max_runtime() {
    let input = "[\"sleep\",\"10\"]\n[\"echo\",\"x\"]\ndone\n";
    let output = coordinator(&["--mode", "argv", "--max-runtime", "1"], input);

    assert!(output.status.success());
    let (lines, replies) = replies(&output.stdout);
    assert_eq!(lines[0], READY_LINE);
    assert_eq!(replies.len(), 3);
    assert_eq!(replies.last(), Some(&Reply::Done));

    let expired = output_of(&replies, 0);
    assert_eq!(expired.status, 124);
    assert_eq!(expired.stderr, b"max runtime exceeded");
    assert_eq!(output_of(&replies, 1).stdout, b"x\n");
}

#[test]
fn test_run_command() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("muxrun.toml");
    std::fs::write(
        &config,
        format!(
            "[dispatcher]\nlocal_addrs = [\"local\"]\n\n\
             [dispatcher.coordinator]\ncommand = [{MUXRUN:?}, \"coordinator\"]\n\n\
             [dispatcher.worker]\nidle_probe_interval_secs = 0\n"
        ),
    )
    .unwrap();

    let output = Command::new(MUXRUN)
        .arg("--config")
        .arg(&config)
        .args(["run", "--host", "local", "--", "echo", "hello"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8(output.stdout).unwrap(),
        "[local] exit 0\nhello\n"
    );

    let output = Command::new(MUXRUN)
        .arg("--config")
        .arg(&config)
        .args(["ping", "--host", "local"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "local: alive\n");
}
