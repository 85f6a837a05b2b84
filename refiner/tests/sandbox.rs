//! Sandbox tests against a real Python interpreter.
//!
//! Each test returns early (with a note on stderr) when `python3` is not on
//! `PATH`, so the suite stays green on machines without Python.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use refiner::core::types::{CandidateProgram, ExecutionOutcome, OutcomeKind};
use refiner::io::sandbox::{Evaluator, SandboxConfig, SandboxExecutor};
use refiner::test_support::grid;

fn python_available() -> bool {
    let found = Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if !found {
        eprintln!("python3 not found, skipping sandbox test");
    }
    found
}

fn sandbox() -> SandboxExecutor {
    SandboxExecutor::new(SandboxConfig::default()).expect("sandbox")
}

/// Python statement that atomically writes `pid cwd` of `pid_expr` to `path`.
fn report_process(path: &Path, pid_expr: &str) -> String {
    let target = serde_json::to_string(&path.to_string_lossy()).expect("path literal");
    format!(
        "import os\n\
         with open({target} + '.tmp', 'w') as _report:\n    \
         _report.write('%d %s' % ({pid_expr}, os.getcwd()))\n\
         os.replace({target} + '.tmp', {target})\n"
    )
}

async fn read_report(path: &Path) -> (u32, PathBuf) {
    for _ in 0..200 {
        if let Ok(contents) = fs::read_to_string(path) {
            let (pid, cwd) = contents.split_once(' ').expect("pid and cwd");
            return (pid.parse().expect("pid"), PathBuf::from(cwd));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("candidate never wrote {}", path.display());
}

/// Running and not a zombie, per `/proc`.
fn process_alive(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state != 'Z')
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

async fn evaluate(source: &str, deadline: Duration) -> ExecutionOutcome {
    let inputs = vec![grid(&[&[1, 2], &[3, 4]]), grid(&[&[5]])];
    sandbox()
        .evaluate(&CandidateProgram::from(source), &inputs, deadline)
        .await
}

#[tokio::test]
async fn transform_results_come_back_in_input_order() {
    if !python_available() {
        return;
    }
    let source = "def transform(grid):\n    return [[cell + 1 for cell in row] for row in grid]\n";
    let outcome = evaluate(source, Duration::from_secs(10)).await;
    assert_eq!(
        outcome.grids(),
        Some(&[grid(&[&[2, 3], &[4, 5]]), grid(&[&[6]])][..]),
        "{outcome:?}"
    );
}

#[tokio::test]
async fn tuples_normalize_to_lists() {
    if !python_available() {
        return;
    }
    let source = "def transform(grid):\n    return tuple(tuple(row) for row in grid)\n";
    let outcome = evaluate(source, Duration::from_secs(10)).await;
    assert!(outcome.is_success(), "{outcome:?}");
}

#[tokio::test]
async fn sleeping_past_the_deadline_times_out() {
    if !python_available() {
        return;
    }
    let source = "import time\n\ndef transform(grid):\n    time.sleep(30)\n    return grid\n";
    let deadline = Duration::from_millis(500);
    let started = Instant::now();
    let outcome = evaluate(source, deadline).await;
    assert_eq!(outcome, ExecutionOutcome::Timeout { latency_ms: 500 });
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn non_grid_result_is_a_runtime_failure() {
    if !python_available() {
        return;
    }
    let source = "def transform(grid):\n    return [cell for row in grid for cell in row]\n";
    let outcome = evaluate(source, Duration::from_secs(10)).await;
    assert_eq!(outcome.kind(), OutcomeKind::RuntimeFailure, "{outcome:?}");
    assert!(outcome.grids().is_none());
}

#[tokio::test]
async fn exceptions_carry_the_traceback_tail() {
    if !python_available() {
        return;
    }
    let source = "def transform(grid):\n    raise ValueError('no pattern found')\n";
    let outcome = evaluate(source, Duration::from_secs(10)).await;
    assert_eq!(outcome.kind(), OutcomeKind::RuntimeFailure);
    let message = outcome.message().unwrap_or_default();
    assert!(message.contains("ValueError: no pattern found"), "{message}");
}

#[tokio::test]
async fn clean_exit_without_result_is_a_protocol_failure() {
    if !python_available() {
        return;
    }
    let source = "import sys\n\ndef transform(grid):\n    return grid\n\nsys.exit(0)\n";
    let outcome = evaluate(source, Duration::from_secs(10)).await;
    assert_eq!(outcome.kind(), OutcomeKind::ProtocolFailure, "{outcome:?}");
}

#[tokio::test]
async fn out_of_range_cells_are_malformed() {
    if !python_available() {
        return;
    }
    let source = "def transform(grid):\n    return [[300]]\n";
    let outcome = evaluate(source, Duration::from_secs(10)).await;
    assert_eq!(outcome.kind(), OutcomeKind::RuntimeFailure, "{outcome:?}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn background_children_do_not_outlive_or_spoil_the_evaluation() {
    if !python_available() {
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let report = temp.path().join("grandchild");
    let source = format!(
        "import subprocess\n\
         import sys\n\
         _child = subprocess.Popen([sys.executable, '-c', 'import time; time.sleep(30)'])\n\
         {}\n\
         def transform(grid):\n    return grid\n",
        report_process(&report, "_child.pid")
    );

    let started = Instant::now();
    let outcome = evaluate(&source, Duration::from_secs(10)).await;
    assert!(outcome.is_success(), "{outcome:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    let (pid, _) = read_report(&report).await;
    assert!(eventually(|| !process_alive(pid)).await, "pid {pid} survived");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn dropping_an_evaluation_releases_process_and_directory() {
    if !python_available() {
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let report = temp.path().join("interpreter");
    let source = format!(
        "import time\n\
         {}\n\
         def transform(grid):\n    time.sleep(30)\n    return grid\n",
        report_process(&report, "os.getpid()")
    );
    let sandbox = sandbox();
    let program = CandidateProgram::from(source);
    let inputs = vec![grid(&[&[1]])];

    let mut evaluation = Box::pin(sandbox.evaluate(&program, &inputs, Duration::from_secs(60)));
    let (pid, workdir) = tokio::select! {
        outcome = &mut evaluation => panic!("evaluation finished early: {outcome:?}"),
        reported = read_report(&report) => reported,
    };
    assert!(workdir.exists());
    assert!(process_alive(pid));

    drop(evaluation);
    assert!(!workdir.exists(), "{} left behind", workdir.display());
    assert!(eventually(|| !process_alive(pid)).await, "pid {pid} survived");
}
