//! Supervised child processes for the job control surface.
//!
//! A [`Job`] runs one command line, captures its combined stdout and stderr
//! line by line into a bounded log and tracks a small state machine:
//!
//! ```text
//! pending ──start()──▶ running ──exit 0──────▶ completed
//!                         │    ──exit ≠ 0────▶ failed
//!                         │    ──spawn error─▶ failed (code -1)
//!                         └────cancel()──────▶ cancelled
//! ```
//!
//! `cancelled` is set synchronously by [`Job::cancel`]; the supervising task
//! then kills and reaps the child. The exit code is still recorded, but it
//! never moves the job out of `cancelled`.
//!
//! [`JobRegistry`] owns every job submitted during the process lifetime.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum number of log lines retained per job.
pub const LOG_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Drive,
    Ocr,
    Analysis,
}

/// FIFO of the most recent lines.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    return_code: Option<i32>,
    logs: LogBuffer,
}

/// Point-in-time view of a job, as served by the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub return_code: Option<i32>,
    pub command: Vec<String>,
    pub created_at: String,
    pub logs: Vec<String>,
}

pub struct Job {
    id: String,
    command: Vec<String>,
    job_type: JobType,
    created_at: DateTime<Utc>,
    seq: u64,
    state: Mutex<JobState>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl Job {
    pub fn new(command: Vec<String>, job_type: JobType) -> Arc<Self> {
        Self::with_seq(command, job_type, 0)
    }

    fn with_seq(command: Vec<String>, job_type: JobType, seq: u64) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
            job_type,
            created_at: Utc::now(),
            seq,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                return_code: None,
                logs: LogBuffer::new(LOG_CAPACITY),
            }),
            cancel: CancellationToken::new(),
            done,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append_log(&self, line: impl Into<String>) {
        self.state().logs.push(line);
    }

    /// Spawn the supervising task. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails, leaving the job untouched, unless the job is `pending`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state();
            if state.status != JobStatus::Pending {
                bail!("job {} already started", self.id);
            }
            state.status = JobStatus::Running;
            state.logs.push(format!("$ {}", self.command.join(" ")));
        }
        info!("job {} started ({:?})", self.id, self.job_type);
        tokio::spawn(Arc::clone(self).supervise());
        Ok(())
    }

    /// Request termination. Returns `false` (and changes nothing) unless the job is running.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state();
            if state.status != JobStatus::Running {
                return false;
            }
            state.status = JobStatus::Cancelled;
            state.logs.push("[cancelled]");
        }
        info!("job {} cancelled", self.id);
        self.cancel.cancel();
        true
    }

    /// Resolves once the job is terminal and its process has been reaped.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn snapshot(&self) -> JobDetail {
        let state = self.state();
        JobDetail {
            job_id: self.id.clone(),
            job_type: self.job_type,
            status: state.status,
            return_code: state.return_code,
            command: self.command.clone(),
            created_at: self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            logs: state.logs.to_vec(),
        }
    }

    async fn supervise(self: Arc<Self>) {
        let Some((program, args)) = self.command.split_first() else {
            self.fail_to_start("empty command");
            return;
        };

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let combined = match combine_output(&mut command) {
            Ok(combined) => combined,
            Err(e) => {
                self.fail_to_start(&e.to_string());
                return;
            }
        };
        let spawned = command.spawn();
        // Release the parent's copy of the write end so EOF follows the child.
        drop(command);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.fail_to_start(&e.to_string());
                return;
            }
        };

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(output) = combined {
            readers.push(tokio::spawn(Arc::clone(&self).pump(output)));
        }
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(Arc::clone(&self).pump(out)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(Arc::clone(&self).pump(err)));
        }

        let (exit, was_cancelled) = tokio::select! {
            exit = child.wait() => (exit, false),
            _ = self.cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!("job {}: kill failed: {}", self.id, e);
                }
                (child.wait().await, true)
            }
        };

        // A killed child may leave grandchildren holding the pipes open.
        for reader in readers {
            if was_cancelled {
                reader.abort();
            } else {
                let _ = reader.await;
            }
        }

        let code = match exit {
            Ok(status) => exit_code(status),
            Err(e) => {
                self.append_log(format!("could not wait for process: {}", e));
                -1
            }
        };

        {
            let mut state = self.state();
            state.return_code = Some(code);
            if state.status != JobStatus::Cancelled {
                state.status = if code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
            }
            state.logs.push(format!("[process exited, code={}]", code));
            info!("job {} finished: {:?} (code {})", self.id, state.status, code);
        }
        self.done.send_replace(true);
    }

    fn fail_to_start(&self, reason: &str) {
        {
            let mut state = self.state();
            if state.status != JobStatus::Cancelled {
                state.status = JobStatus::Failed;
            }
            state.return_code = Some(-1);
            state.logs.push(format!("could not start command: {}", reason));
        }
        warn!("job {} could not start: {}", self.id, reason);
        self.done.send_replace(true);
    }

    async fn pump<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.append_log(line.trim_end().to_string());
                }
                Err(e) => {
                    debug!("job {}: output read ended: {}", self.id, e);
                    break;
                }
            }
        }
    }
}

/// Send stdout and stderr into one pipe so the log keeps the child's write order.
#[cfg(unix)]
fn combine_output(
    command: &mut Command,
) -> std::io::Result<Option<tokio::net::unix::pipe::Receiver>> {
    use std::os::fd::OwnedFd;

    let (reader, writer) = std::io::pipe()?;
    command
        .stdout(Stdio::from(writer.try_clone()?))
        .stderr(Stdio::from(writer));
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok(Some(receiver))
}

/// Without a shared pipe the two streams are read separately.
#[cfg(not(unix))]
fn combine_output(command: &mut Command) -> std::io::Result<Option<tokio::process::ChildStdout>> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(None)
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Every job known to the serving process, keyed by id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    next_seq: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for `command` and start it.
    pub fn submit(&self, command: Vec<String>, job_type: JobType) -> Result<Arc<Job>> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let job = Job::with_seq(command, job_type, seq);
        self.lock().insert(job.id.clone(), Arc::clone(&job));
        job.start()?;
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.lock().get(id).cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));
        jobs
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
