/// Docker isolation backend
///
/// **Box Rules:**
/// 1. Pulls the profile image if it is not cached locally
/// 2. One container per job, kept alive by a `sleep` keeper as PID 1 so that
///    killing the container tears down the whole PID namespace
/// 3. Network disabled, memory (no swap), CPU share, pids, RLIMIT_CPU and
///    RLIMIT_FSIZE enforced
/// 4. Read-only root filesystem; only the job root (bind-mounted at /box) and a
///    small noexec /tmp are writable
/// 5. All capabilities dropped, no-new-privileges, unprivileged user
use super::backend::{BoxSpec, ExecHandle, ExecRequest, IsolationBackend, OutputChunk};
use crate::error::SandboxError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, TopOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use codex_common::registry::BOX_MOUNT;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,size=64m";
const MAX_FILE_SIZE_BYTES: i64 = 16 * 1024 * 1024;
const MAX_OPEN_FILES: i64 = 64;

/// Daemon messages that mean the host is out of room rather than the request
/// being wrong.
const CAPACITY_MARKERS: &[&str] = &[
    "no space left",
    "cannot allocate memory",
    "resource temporarily unavailable",
    "too many open files",
];

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::IsolationUnavailable(format!("cannot reach Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Backend(format!("failed to pull image '{}': {}", image, e)))?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn host_config(spec: &BoxSpec) -> HostConfig {
        let memory = (spec.limits.memory_mb as i64) * 1024 * 1024;
        // SIGXCPU at the soft limit, SIGKILL a second later.
        let cpu_secs = spec.limits.cpu_time_ms.div_ceil(1000).max(1) as i64;

        HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some((spec.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.limits.max_processes as i64),
            network_mode: Some("none".to_string()),
            binds: Some(vec![format!("{}:{}:rw", spec.root.display(), BOX_MOUNT)]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), TMPFS_OPTIONS.to_string())])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ulimits: Some(vec![
                ResourcesUlimits {
                    name: Some("cpu".to_string()),
                    soft: Some(cpu_secs),
                    hard: Some(cpu_secs + 1),
                },
                ResourcesUlimits {
                    name: Some("fsize".to_string()),
                    soft: Some(MAX_FILE_SIZE_BYTES),
                    hard: Some(MAX_FILE_SIZE_BYTES),
                },
                ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(MAX_OPEN_FILES),
                    hard: Some(MAX_OPEN_FILES),
                },
            ]),
            ..Default::default()
        }
    }
}

/// 404 and 409 mean the container is already gone or already stopped.
fn is_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404 | 409, .. }
    )
}

/// Capacity failures are `ResourceExhausted`; a config the daemon refuses is a
/// `Backend` fault and retrying it will not help.
fn create_failure(step: &str, err: bollard::errors::Error) -> SandboxError {
    let message = format!("failed to {} container: {}", step, err);
    let lower = message.to_ascii_lowercase();
    let exhausted = matches!(err, bollard::errors::Error::RequestTimeoutError)
        || CAPACITY_MARKERS.iter().any(|marker| lower.contains(marker));
    if exhausted {
        SandboxError::ResourceExhausted(message)
    } else {
        SandboxError::Backend(message)
    }
}

fn exec_argv(request: ExecRequest) -> Vec<String> {
    match request.stdin_file {
        Some(file) => {
            let mut argv = vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("exec \"$@\" < {}/{}", BOX_MOUNT, file),
                "sh".to_string(),
            ];
            argv.extend(request.argv);
            argv
        }
        None => request.argv,
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::IsolationUnavailable(format!("Docker daemon did not answer ping: {}", e)))
    }

    async fn create_box(&self, spec: &BoxSpec) -> Result<String, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let name = format!("codex-{}", spec.job_id);
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            user: Some(spec.user.clone()),
            working_dir: Some(BOX_MOUNT.to_string()),
            env: Some(vec![
                "HOME=/tmp".to_string(),
                "PYTHONDONTWRITEBYTECODE=1".to_string(),
            ]),
            network_disabled: Some(true),
            labels: Some(HashMap::from([("codex.job_id".to_string(), spec.job_id.to_string())])),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| create_failure("create", e))?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove_box(&container.id).await;
            return Err(create_failure("start", e));
        }

        debug!(job_id = %spec.job_id, container_id = %container.id, "Box created");
        Ok(container.id)
    }

    async fn exec(&self, box_id: &str, request: ExecRequest) -> Result<ExecHandle, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                box_id,
                CreateExecOptions {
                    cmd: Some(exec_argv(request)),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(BOX_MOUNT.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let output = output
                    .filter_map(|item| async move {
                        match item {
                            Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message.to_vec()))),
                            Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
                            Ok(_) => None,
                            Err(e) => Some(Err(SandboxError::from(e))),
                        }
                    })
                    .boxed();
                Ok(ExecHandle { id: exec.id, output })
            }
            StartExecResults::Detached => Err(SandboxError::Backend("exec started detached".to_string())),
        }
    }

    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>, SandboxError> {
        Ok(self.docker.inspect_exec(exec_id).await?.exit_code)
    }

    async fn memory_exceeded(&self, box_id: &str) -> Result<bool, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(box_id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect.state.and_then(|s| s.oom_killed).unwrap_or(false))
    }

    async fn kill_box(&self, box_id: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .kill_container(box_id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_box(&self, box_id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(box_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn process_count(&self, box_id: &str) -> Result<usize, SandboxError> {
        match self
            .docker
            .top_processes(box_id, Some(TopOptions { ps_args: "-e" }))
            .await
        {
            Ok(top) => Ok(top.processes.map(|p| p.len()).unwrap_or(0)),
            Err(e) if is_gone(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
