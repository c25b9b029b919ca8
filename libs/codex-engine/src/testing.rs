//! Test doubles: an isolation backend that interprets a handful of source
//! patterns instead of running real toolchains.

use crate::error::SandboxError;
use crate::executor::Progress;
use crate::sandbox::backend::{BoxSpec, ExecHandle, ExecRequest, IsolationBackend, OutputChunk};
use crate::sandbox::STDIN_FILE;
use async_trait::async_trait;
use chrono::Utc;
use codex_common::registry::BOX_MOUNT;
use codex_common::types::{Job, JobId, JobState, Language, ResourceLimits, TenantId};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn job_for(language: Language, source: &str, stdin: &str) -> Job {
    job_for_tenant(&TenantId::new("tenant"), language, source, stdin)
}

pub fn job_for_tenant(tenant: &TenantId, language: Language, source: &str, stdin: &str) -> Job {
    Job {
        id: Uuid::new_v4(),
        tenant: tenant.clone(),
        language,
        source: source.to_string(),
        stdin: stdin.to_string(),
        submitted_at: Utc::now(),
        limits: ResourceLimits::default(),
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    states: Mutex<Vec<JobState>>,
    refuse: bool,
}

impl RecordingProgress {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn states(&self) -> Vec<JobState> {
        self.states.lock().unwrap().clone()
    }
}

#[async_trait]
impl Progress for RecordingProgress {
    async fn advance(&self, _job_id: JobId, state: JobState) -> bool {
        if self.refuse {
            return false;
        }
        self.states.lock().unwrap().push(state);
        true
    }
}

struct FakeBox {
    root: PathBuf,
    killer: CancellationToken,
    running: usize,
    oom: bool,
}

#[derive(Default)]
struct FakeState {
    boxes: HashMap<String, FakeBox>,
    exit_codes: HashMap<String, Option<i64>>,
    execs: Vec<Vec<String>>,
    next_id: usize,
    fail_next_create: bool,
    stall_exit_codes: bool,
}

/// What a fake program does once started.
enum Behavior {
    Exit { stdout: String, stderr: String, code: i64 },
    Flood,
    OutOfMemory,
    Sleep(Duration, String, i64),
    Forever,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    /// Make every later exit-code lookup hang, as a wedged daemon would.
    pub fn stall_exit_codes(&self) {
        self.state.lock().unwrap().stall_exit_codes = true;
    }

    pub fn box_exists(&self, box_id: &str) -> bool {
        self.state.lock().unwrap().boxes.contains_key(box_id)
    }

    pub fn exec_count(&self) -> usize {
        self.state.lock().unwrap().execs.len()
    }

    /// Programs still alive across every box.
    pub fn live_processes(&self) -> usize {
        self.state.lock().unwrap().boxes.values().map(|b| b.running).sum()
    }

    /// Every argv executed, in order.
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().execs.clone()
    }

    fn interpret(root: &Path, argv: &[String]) -> Behavior {
        let read = |arg: &str| {
            arg.strip_prefix(BOX_MOUNT)
                .map(|rel| root.join(rel.trim_start_matches('/')))
                .and_then(|path| std::fs::read_to_string(path).ok())
        };

        if argv.first().map(|a| a.as_str()) == Some("g++") {
            let source = argv.iter().filter_map(|a| read(a.as_str())).next().unwrap_or_default();
            let artifact = argv
                .iter()
                .skip_while(|a| a.as_str() != "-o")
                .nth(1)
                .cloned()
                .unwrap_or_default();
            let broken = source
                .lines()
                .map(str::trim)
                .any(|line| line.contains("cout") && !line.ends_with(';'));
            if broken {
                return Behavior::Exit {
                    stdout: String::new(),
                    stderr: "main.cpp:3:22: error: expected ';' before '}' token\n".to_string(),
                    code: 1,
                };
            }
            if let Some(rel) = artifact.strip_prefix(BOX_MOUNT) {
                let _ = std::fs::write(root.join(rel.trim_start_matches('/')), &source);
            }
            return Behavior::Exit {
                stdout: String::new(),
                stderr: String::new(),
                code: 0,
            };
        }

        let source = argv.iter().filter_map(|a| read(a.as_str())).next().unwrap_or_default();
        let stdin = std::fs::read_to_string(root.join(STDIN_FILE)).unwrap_or_default();
        let printed = printed_text(&source, &stdin);

        if source.contains("while True") || source.contains("for (;;)") {
            Behavior::Forever
        } else if source.contains("bytearray(") {
            Behavior::OutOfMemory
        } else if source.contains("* 10**") {
            Behavior::Flood
        } else if source.contains("sleep") {
            Behavior::Sleep(Duration::from_millis(300), printed, exit_code_in(&source).unwrap_or(0))
        } else if let Some(code) = exit_code_in(&source) {
            Behavior::Exit {
                stdout: printed,
                stderr: String::new(),
                code,
            }
        } else {
            Behavior::Exit {
                stdout: printed,
                stderr: String::new(),
                code: 0,
            }
        }
    }
}

fn exit_code_in(source: &str) -> Option<i64> {
    let start = source.find("sys.exit(")? + "sys.exit(".len();
    let end = source[start..].find(')')? + start;
    source[start..end].trim().parse().ok()
}

/// Output of `print(...)`/`cout << ...` lines, with `input()` echoing stdin.
fn printed_text(source: &str, stdin: &str) -> String {
    let mut out = String::new();
    for line in source.lines() {
        let line = line.trim();
        if line.contains("print(input())") {
            out.push_str(stdin.lines().next().unwrap_or(""));
            out.push('\n');
        } else if let Some(rest) = line.strip_prefix("print(") {
            let inner = rest.rsplit_once(')').map(|(inner, _)| inner).unwrap_or(rest);
            out.push_str(inner.trim_matches(|c| c == '"' || c == '\''));
            out.push('\n');
        } else if line.contains("cout") {
            if let Some(start) = line.find('"') {
                if let Some(len) = line[start + 1..].find('"') {
                    out.push_str(&line[start + 1..start + 1 + len]);
                }
            }
            if line.contains("endl") {
                out.push('\n');
            }
        }
    }
    out
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn create_box(&self, spec: &BoxSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_create) {
            return Err(SandboxError::ResourceExhausted("fake create failure".to_string()));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.boxes.insert(
            id.clone(),
            FakeBox {
                root: spec.root.clone(),
                killer: CancellationToken::new(),
                running: 0,
                oom: false,
            },
        );
        Ok(id)
    }

    async fn exec(&self, box_id: &str, request: ExecRequest) -> Result<ExecHandle, SandboxError> {
        let (root, killer, exec_id) = {
            let mut state = self.state.lock().unwrap();
            state.execs.push(request.argv.clone());
            let exec_id = format!("{}-exec-{}", box_id, state.execs.len());
            let fake = state
                .boxes
                .get_mut(box_id)
                .ok_or_else(|| SandboxError::Backend(format!("no such box {}", box_id)))?;
            if fake.killer.is_cancelled() {
                return Err(SandboxError::Backend("box is not running".to_string()));
            }
            fake.running += 1;
            (fake.root.clone(), fake.killer.clone(), exec_id)
        };

        let behavior = Self::interpret(&root, &request.argv);
        let (tx, rx) = mpsc::channel::<Result<OutputChunk, SandboxError>>(16);
        let state = self.state.clone();
        let box_id = box_id.to_string();
        let id = exec_id.clone();

        tokio::spawn(async move {
            let code = match behavior {
                Behavior::Exit { stdout, stderr, code } => {
                    if !stdout.is_empty() {
                        let _ = tx.send(Ok(OutputChunk::Stdout(stdout.into_bytes()))).await;
                    }
                    if !stderr.is_empty() {
                        let _ = tx.send(Ok(OutputChunk::Stderr(stderr.into_bytes()))).await;
                    }
                    Some(code)
                }
                Behavior::Flood => {
                    for _ in 0..100 {
                        if tx.send(Ok(OutputChunk::Stdout(vec![b'x'; 1000]))).await.is_err() {
                            break;
                        }
                    }
                    Some(0)
                }
                Behavior::OutOfMemory => {
                    if let Some(fake) = state.lock().unwrap().boxes.get_mut(&box_id) {
                        fake.oom = true;
                    }
                    Some(137)
                }
                Behavior::Sleep(duration, stdout, code) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            let _ = tx.send(Ok(OutputChunk::Stdout(stdout.into_bytes()))).await;
                            Some(code)
                        }
                        _ = killer.cancelled() => None,
                    }
                }
                Behavior::Forever => {
                    killer.cancelled().await;
                    None
                }
            };

            let mut state = state.lock().unwrap();
            state.exit_codes.insert(id, code.or(Some(137)));
            if let Some(fake) = state.boxes.get_mut(&box_id) {
                fake.running = fake.running.saturating_sub(1);
            }
            drop(tx);
        });

        let output = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed();
        Ok(ExecHandle { id: exec_id, output })
    }

    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>, SandboxError> {
        let (stalled, code) = {
            let state = self.state.lock().unwrap();
            (state.stall_exit_codes, state.exit_codes.get(exec_id).copied().flatten())
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(code)
    }

    async fn memory_exceeded(&self, box_id: &str) -> Result<bool, SandboxError> {
        Ok(self.state.lock().unwrap().boxes.get(box_id).map(|b| b.oom).unwrap_or(false))
    }

    async fn kill_box(&self, box_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if let Some(fake) = state.boxes.get_mut(box_id) {
            fake.killer.cancel();
            fake.running = 0;
        }
        Ok(())
    }

    async fn remove_box(&self, box_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if let Some(fake) = state.boxes.remove(box_id) {
            fake.killer.cancel();
        }
        Ok(())
    }

    async fn process_count(&self, box_id: &str) -> Result<usize, SandboxError> {
        Ok(self.state.lock().unwrap().boxes.get(box_id).map(|b| b.running).unwrap_or(0))
    }
}
