use std::path::Path;
use std::time::{Duration, Instant};

use taskfleet::config::{SandboxBackend, SandboxConfig};
use taskfleet::sandbox::{
    self, DockerSandbox, ProcessSandbox, ResourceLimits, SandboxError, SandboxRequest,
    SandboxRunner, CANCELLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process backend without the per-user process limit, which would count
/// every process of the test user.
fn test_sandbox() -> ProcessSandbox {
    ProcessSandbox::new(SandboxConfig {
        backend: SandboxBackend::Process,
        pids_limit: 0,
        ..SandboxConfig::default()
    })
}

fn request(workspace: &Path, command: &str, timeout: Duration) -> SandboxRequest {
    SandboxRequest {
        job_id: Uuid::new_v4(),
        command: command.to_string(),
        workspace: workspace.to_path_buf(),
        limits: ResourceLimits {
            cpus: 1,
            memory_mb: 512,
            timeout,
        },
    }
}

#[tokio::test]
async fn test_execute_simple_command() {
    let dir = TempDir::new().unwrap();
    let outcome = test_sandbox()
        .run(
            &request(dir.path(), "echo hello", Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "hello\n");
    assert!(outcome.stderr.is_empty());
    assert!(!outcome.timed_out);
    assert!(!outcome.cancelled);
    assert!(!outcome.truncated);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let dir = TempDir::new().unwrap();
    let outcome = test_sandbox()
        .run(
            &request(dir.path(), "echo oops >&2; exit 3", Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.stderr, "oops\n");
    assert!(!outcome.timed_out);
}

#[tokio::test]
async fn test_runs_inside_workspace_with_scrubbed_env() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("input.txt"), "payload").unwrap();
    let outcome = test_sandbox()
        .run(
            &request(
                dir.path(),
                "cat input.txt; echo; echo \"$HOME\"; env | wc -l; echo out > result.txt",
                Duration::from_secs(10),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    let lines: Vec<&str> = outcome.stdout.lines().collect();
    assert_eq!(lines[0], "payload");
    assert_eq!(lines[1], dir.path().display().to_string());
    // PATH, HOME, TMPDIR, plus whatever the shell itself exports.
    let vars: usize = lines[2].trim().parse().unwrap();
    assert!(vars <= 8, "environment was not scrubbed: {} vars", vars);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("result.txt")).unwrap(),
        "out\n"
    );
}

#[tokio::test]
async fn test_timeout_kills_command() {
    let dir = TempDir::new().unwrap();
    let started = Instant::now();
    let outcome = test_sandbox()
        .run(
            &request(dir.path(), "echo begin; sleep 30", Duration::from_millis(300)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(outcome.stdout, "begin\n");
    assert!(outcome.elapsed_ms >= 300);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_background_children_die_with_the_job() {
    let dir = TempDir::new().unwrap();
    let outcome = test_sandbox()
        .run(
            &request(
                dir.path(),
                "sleep 30 & echo $! > child.pid",
                Duration::from_secs(10),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 0);

    let pid = std::fs::read_to_string(dir.path().join("child.pid"))
        .unwrap()
        .trim()
        .to_string();
    let stat = Path::new("/proc").join(&pid).join("stat");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        // Gone, or a zombie waiting for init to reap it.
        let alive = match std::fs::read_to_string(&stat) {
            Ok(s) => !s.contains(") Z "),
            Err(_) => false,
        };
        if !alive {
            break;
        }
        assert!(Instant::now() < deadline, "background child {} survived", pid);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_cancel_stops_command() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = test_sandbox()
        .run(
            &request(dir.path(), "sleep 30", Duration::from_secs(60)),
            &cancel,
        )
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.exit_code, CANCELLED_EXIT_CODE);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_output_is_capped() {
    let dir = TempDir::new().unwrap();
    let sandbox = ProcessSandbox::new(SandboxConfig {
        backend: SandboxBackend::Process,
        pids_limit: 0,
        max_output_bytes: 100,
        ..SandboxConfig::default()
    });
    let outcome = sandbox
        .run(
            &request(dir.path(), "seq 1 10000", Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(outcome.truncated);
    assert!(outcome.stdout.starts_with("1\n2\n3\n"));
    assert!(outcome.stdout.ends_with("[output truncated]"));
    assert!(outcome.stdout.len() < 200);
}

#[tokio::test]
async fn test_process_probe_succeeds() {
    test_sandbox().probe().await.unwrap();
}

#[tokio::test]
async fn test_missing_container_runtime_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let sandbox = DockerSandbox::new(SandboxConfig {
        docker_binary: "/nonexistent/docker-binary".to_string(),
        ..SandboxConfig::default()
    });

    let err = sandbox.probe().await.unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(_)));

    let err = sandbox
        .run(
            &request(dir.path(), "echo hi", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(_)));
}

/// A stand-in container runtime that never answers.
fn hanging_runtime(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("docker");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 60\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn test_hung_container_runtime_fails_health_check_in_time() {
    let dir = TempDir::new().unwrap();
    let sandbox = DockerSandbox::new(SandboxConfig {
        docker_binary: hanging_runtime(dir.path()),
        health_check_timeout_ms: 200,
        ..SandboxConfig::default()
    });

    let started = Instant::now();
    let err = sandbox.probe().await.unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_backend_selection() {
    let runner = sandbox::from_config(&SandboxConfig {
        backend: SandboxBackend::Process,
        ..SandboxConfig::default()
    });
    assert!(format!("{:?}", runner).starts_with("ProcessSandbox"));

    let runner = sandbox::from_config(&SandboxConfig::default());
    assert!(format!("{:?}", runner).starts_with("DockerSandbox"));
}
