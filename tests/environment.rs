//! Integration tests: environment lifecycle across a test group
//!
//! Child processes are plain `sh` scripts standing in for the build tool,
//! so these tests only run on unix.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use emx_blackbox::{
    DefaultWorkspaceFile, EnvConfig, EnvError, ExecutionContext, FnSetup, SetEnv, SetupError,
    TestEnvironment, ToolsSetup, Workspace, WriteFile, GRACE_PERIOD,
};

/// Environment whose build tool is `sh`, with directories under a scratch root.
fn sh_environment() -> (tempfile::TempDir, TestEnvironment) {
    let root = tempfile::tempdir().unwrap();
    let config = EnvConfig::default().tool("sh").workdir_root(root.path());
    let env = TestEnvironment::local(config).unwrap();
    (root, env)
}

#[test]
fn end_to_end_prepare_run_dispose() {
    let (_root, env) = sh_environment();

    let ctx = env.prepare_environment("testA", &[]).unwrap();
    let result = ctx
        .run_tool(["-c", "echo to-stdout; echo to-stderr >&2"])
        .unwrap();
    assert!(result.success());
    assert_eq!(result.stdout, "to-stdout\n");
    assert_eq!(result.stderr, "to-stderr\n");

    env.dispose().unwrap();

    let err = env.prepare_environment("testB", &[]).unwrap_err();
    assert!(err.is_misuse(), "expected misuse, got {}", err);
}

#[test]
fn each_prepare_returns_distinct_live_context() {
    let (_root, env) = sh_environment();

    let contexts: Vec<ExecutionContext> = (0..5)
        .map(|i| env.prepare_environment(&format!("test{}", i), &[]).unwrap())
        .collect();

    let mut dirs: Vec<PathBuf> = contexts.iter().map(|c| c.work_dir().to_path_buf()).collect();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 5);

    for ctx in &contexts {
        assert!(!ctx.drain_pool().is_shutdown());
        assert!(ctx.drain_pool().same_pool(contexts[0].drain_pool()));
        let task = ctx.drain_pool().submit(|| "alive").unwrap();
        assert_eq!(task.join().unwrap(), "alive");
    }

    env.dispose().unwrap();
}

#[test]
fn misuse_after_dispose() {
    let (_root, env) = sh_environment();
    env.dispose().unwrap();

    assert!(matches!(
        env.prepare_environment("late", &[]),
        Err(EnvError::Disposed { .. })
    ));
    assert!(matches!(env.dispose(), Err(EnvError::Disposed { op: "dispose" })));
}

#[test]
fn dispose_is_bounded_by_grace_period() {
    let (_root, env) = sh_environment();
    let ctx = env.prepare_environment("slow", &[]).unwrap();

    let stuck = ctx
        .drain_pool()
        .submit(|| thread::sleep(GRACE_PERIOD * 10))
        .unwrap();
    // Let a worker pick it up.
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    env.dispose().unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= GRACE_PERIOD / 2, "returned too early: {:?}", elapsed);
    assert!(elapsed < GRACE_PERIOD * 3, "dispose blocked for {:?}", elapsed);
    drop(stuck);
}

#[test]
fn dispose_waits_for_short_drain_work() {
    let (_root, env) = sh_environment();
    let ctx = env.prepare_environment("short", &[]).unwrap();

    let task = ctx
        .drain_pool()
        .submit(|| {
            thread::sleep(Duration::from_millis(100));
            7
        })
        .unwrap();
    env.dispose().unwrap();
    assert!(ctx.drain_pool().is_terminated());
    assert_eq!(task.join().unwrap(), 7);
}

#[test]
fn concurrent_tests_capture_streams_in_order() {
    let (_root, env) = sh_environment();
    let env = Arc::new(env);
    // Lines like `t2-out-5999` put roughly 70KiB on each stream, more than a
    // pipe buffer holds, so every drain has to run while its child writes.
    const LINES: usize = 6000;
    const ROUNDS: usize = 3;
    const TESTS: usize = 4;

    for round in 0..ROUNDS {
        let handles: Vec<_> = (0..TESTS)
            .map(|t| {
                let env = env.clone();
                thread::spawn(move || {
                    let name = format!("t{}", t);
                    let ctx = env
                        .prepare_environment(&format!("r{}_{}", round, name), &[])
                        .unwrap();
                    let script = format!(
                        "i=0; while [ $i -lt {n} ]; do \
                         echo {name}-out-$i; echo {name}-err-$i >&2; i=$((i+1)); done",
                        n = LINES,
                        name = name,
                    );
                    let result = ctx
                        .run_tool_with_timeout(["-c", script.as_str()], Duration::from_secs(60))
                        .unwrap();
                    assert!(result.success(), "{} timed out: {}", name, result.timed_out);
                    (name, result)
                })
            })
            .collect();

        for handle in handles {
            let (name, result) = handle.join().unwrap();
            assert!(result.stdout.len() > 64 * 1024);
            assert!(result.stderr.len() > 64 * 1024);
            let expected_out: Vec<String> =
                (0..LINES).map(|i| format!("{}-out-{}", name, i)).collect();
            let expected_err: Vec<String> =
                (0..LINES).map(|i| format!("{}-err-{}", name, i)).collect();
            assert_eq!(result.stdout.lines().collect::<Vec<_>>(), expected_out);
            assert_eq!(result.stderr.lines().collect::<Vec<_>>(), expected_err);
        }
    }

    env.dispose().unwrap();
}

#[test]
fn timeout_returns_when_grandchild_keeps_pipes_open() {
    let (_root, env) = sh_environment();
    let ctx = env.prepare_environment("grandchild", &[]).unwrap();

    let start = Instant::now();
    let result = ctx
        .run_tool_with_timeout(["-c", "echo begin; sleep 8; echo done"], Duration::from_millis(200))
        .unwrap();
    assert!(result.timed_out);
    assert!(!result.success());
    assert_eq!(result.stdout, "begin\n");
    assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
}

#[test]
fn directives_are_applied_before_the_tool_runs() {
    let (_root, env) = sh_environment();
    let tools: Vec<Box<dyn ToolsSetup>> = vec![
        Box::new(DefaultWorkspaceFile),
        Box::new(WriteFile::new("pkg/BUILD", "genrule(name = 'g')\n")),
        Box::new(SetEnv::new("BLACKBOX_GREETING", "hello")),
    ];
    let ctx = env.prepare_environment("directives", &tools).unwrap();

    let result = ctx
        .run_tool(["-c", "cat pkg/BUILD; echo $BLACKBOX_GREETING; head -n 1 WORKSPACE"])
        .unwrap();
    assert_eq!(
        result.stdout,
        "genrule(name = 'g')\nhello\nload('@bazel_tools//tools/build_defs/repo:http.bzl', 'http_archive')\n",
    );
    ctx.assert_file("pkg/BUILD", "genrule(name = 'g')\n").unwrap();
    assert!(ctx.assert_file("pkg/BUILD", "other\n").is_err());

    env.dispose().unwrap();
}

#[test]
fn setup_failure_propagates_and_environment_survives() {
    let (_root, env) = sh_environment();
    let tools: Vec<Box<dyn ToolsSetup>> = vec![
        Box::new(WriteFile::new("ok.txt", "fine")),
        Box::new(FnSetup::new("install toolchain", |_: &mut Workspace| {
            Err(SetupError::directive("toolchain missing"))
        })),
    ];

    let err = env.prepare_environment("broken", &tools).unwrap_err();
    let setup = err.as_setup().expect("setup error");
    assert_eq!(setup.test.as_deref(), Some("broken"));
    assert_eq!(setup.directive.as_deref(), Some("install toolchain"));
    assert_eq!(err.to_string(), "broken: install toolchain: toolchain missing");

    // A failing test does not poison the group.
    let ctx = env.prepare_environment("after", &[]).unwrap();
    assert!(ctx.run_tool(["-c", "true"]).unwrap().success());
    env.dispose().unwrap();
}

#[test]
fn run_tool_without_tool_configured_fails() {
    let root = tempfile::tempdir().unwrap();
    let env = TestEnvironment::local(EnvConfig::default().workdir_root(root.path())).unwrap();
    let ctx = env.prepare_environment("no_tool", &[]).unwrap();
    assert!(ctx.run_tool(["--version"]).is_err());
    // Other programs still run.
    let result = ctx.run("sh", ["-c", "echo $TEST_TMPDIR"]).unwrap();
    assert_eq!(result.stdout.trim(), ctx.tmp_dir().display().to_string());
    env.dispose().unwrap();
}

#[test]
fn run_after_dispose_is_rejected_by_pool() {
    let (_root, env) = sh_environment();
    let ctx = env.prepare_environment("stale", &[]).unwrap();
    env.dispose().unwrap();
    assert!(ctx.run_tool(["-c", "echo hi"]).is_err());
}
