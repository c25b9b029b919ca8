/// Integration tests against a real Docker daemon
///
/// These tests verify the isolation guarantees end to end:
/// 1. Programs see stdin and produce captured output
/// 2. Compile errors short-circuit before any run
/// 3. Runaway programs are killed with every descendant
/// 4. Memory hogs fail without harming the host
/// 5. The network is unreachable from inside a box

#[cfg(test)]
mod docker_sandbox_tests {
    use crate::executor::execute;
    use crate::sandbox::backend::IsolationBackend;
    use crate::sandbox::docker::DockerBackend;
    use crate::sandbox::Sandbox;
    use crate::testing::{job_for, RecordingProgress};
    use codex_common::registry::RuntimeRegistry;
    use codex_common::types::{ExecutionResult, Job, JobState, Language, TerminalReason};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const SLACK: Duration = Duration::from_millis(1000);

    async fn run_in_docker(job: &Job) -> (ExecutionResult, Arc<DockerBackend>, TempDir) {
        let backend = Arc::new(DockerBackend::connect().expect("Docker must be reachable"));
        backend.probe().await.expect("Docker must answer ping");
        let dir = TempDir::new().expect("Failed to create workspace");
        let sandbox = Sandbox::new(backend.clone(), dir.path(), 2, SLACK);
        let registry = RuntimeRegistry::load_from_file(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../config/languages.json"
        ))
        .expect("Failed to load language config");
        let profile = registry.profile_for(job.language).expect("language configured");

        let result = execute(
            &sandbox,
            job,
            profile,
            &CancellationToken::new(),
            &RecordingProgress::default(),
            SLACK,
        )
        .await;
        (result, backend, dir)
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_echo() {
        let job = job_for(Language::Python, "print(input())", "hello");
        let (result, _, _dir) = run_in_docker(&job).await;

        assert_eq!(result.state, JobState::Succeeded, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_cpp_compile_and_run() {
        let source = r#"
#include <iostream>
#include <string>
int main() {
    std::string name;
    std::getline(std::cin, name);
    std::cout << "hi " << name << std::endl;
    return 0;
}
"#;
        let job = job_for(Language::Cpp, source, "box");
        let (result, _, _dir) = run_in_docker(&job).await;

        assert_eq!(result.state, JobState::Succeeded, "compile: {:?}", result.compile_output);
        assert_eq!(result.stdout, "hi box\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_cpp_syntax_error() {
        let source = "#include <iostream>\nint main() {\n    std::cout << \"hi\"\n}\n";
        let job = job_for(Language::Cpp, source, "");
        let (result, _, _dir) = run_in_docker(&job).await;

        assert_eq!(result.state, JobState::Failed);
        assert_eq!(result.reason, TerminalReason::CompileError);
        assert!(result.combined_output().contains("error"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_fork_loop_leaves_no_survivors() {
        let source = r#"
import os, time
for _ in range(8):
    if os.fork() == 0:
        break
while True:
    time.sleep(0.01)
"#;
        let mut job = job_for(Language::Python, source, "");
        job.limits.wall_time_ms = 1000;

        let started = Instant::now();
        let (result, backend, dir) = run_in_docker(&job).await;
        assert_eq!(result.state, JobState::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(1000) + SLACK + Duration::from_secs(5));

        let box_name = format!("codex-{}", job.id);
        assert_eq!(backend.process_count(&box_name).await.unwrap(), 0);
        assert!(!dir.path().join(job.id.to_string()).exists());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_memory_hog_fails() {
        let mut job = job_for(Language::Python, "data = bytearray(1024 * 1024 * 1024)\nprint(len(data))", "");
        job.limits.memory_mb = 64;
        let (result, _, _dir) = run_in_docker(&job).await;

        assert_eq!(result.state, JobState::Failed);
        assert!(matches!(
            result.reason,
            TerminalReason::MemoryLimitExceeded | TerminalReason::RuntimeError
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_network_is_unreachable() {
        let source = r#"
import socket
try:
    socket.create_connection(("1.1.1.1", 53), timeout=2)
    print("connected")
except OSError:
    print("blocked")
"#;
        let job = job_for(Language::Python, source, "");
        let (result, _, _dir) = run_in_docker(&job).await;

        assert_eq!(result.stdout, "blocked\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_root_filesystem_is_read_only() {
        let source = r#"
try:
    open("/etc/codex", "w").write("x")
    print("wrote")
except OSError:
    print("denied")
"#;
        let job = job_for(Language::Python, source, "");
        let (result, _, _dir) = run_in_docker(&job).await;

        assert_eq!(result.stdout, "denied\n");
    }
}
