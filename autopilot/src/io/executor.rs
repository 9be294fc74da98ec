//! Execution collaborator abstraction.
//!
//! The [`Executor`] trait decouples orchestration from the coding-agent
//! backend. An executor starts one attempt and hands back an
//! [`ExecutionInstance`] that the caller polls. Tests use scripted executors
//! that never spawn processes.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::ModelTier;

const STDERR_LIMIT_BYTES: usize = 64 * 1024;
const RECENT_LINES: usize = 50;
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long an exited agent's pipes may stay open before the readers are detached.
const READER_GRACE: Duration = Duration::from_millis(500);

static FAILED_CHECKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s+failed\b").expect("failed-checks regex is valid")
});
static PASSED_CHECKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s+passed\b").expect("passed-checks regex is valid")
});

const BUILD_ERROR_MARKERS: [&str; 3] = ["error[e", "could not compile", "compilation failed"];

/// Parameters for starting one attempt.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub feature_id: String,
    pub model: ModelTier,
    pub prompt: String,
    /// Working directory for the attempt.
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

/// Facts about a finished attempt, fed to the retry strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptReport {
    pub error: Option<String>,
    pub failed_checks: u32,
    pub passed_checks: u32,
    pub build_error: bool,
    pub timed_out: bool,
    pub open_tasks: u32,
}

fn sum_counts(pattern: &Regex, text: &str) -> u32 {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|count| count.as_str().parse::<u32>().ok())
        .fold(0u32, u32::saturating_add)
}

impl AttemptReport {
    /// Classify free-form error text.
    ///
    /// Build errors are recognized by compiler markers, check counts by
    /// `N failed` / `N passed`, open tasks by unchecked `- [ ]` items.
    pub fn from_error(error: Option<String>) -> Self {
        let Some(text) = error else {
            return Self::default();
        };
        let lowered = text.to_lowercase();
        let open_tasks = text
            .lines()
            .filter(|line| line.trim_start().starts_with("- [ ]"))
            .count();
        Self {
            failed_checks: sum_counts(&FAILED_CHECKS, &text),
            passed_checks: sum_counts(&PASSED_CHECKS, &text),
            build_error: BUILD_ERROR_MARKERS
                .iter()
                .any(|marker| lowered.contains(marker)),
            timed_out: lowered.contains("timed out"),
            open_tasks: u32::try_from(open_tasks).unwrap_or(u32::MAX),
            error: Some(text),
        }
    }
}

/// A running attempt.
pub trait ExecutionInstance {
    /// Poll the attempt; returns after at most a short bounded wait.
    fn status(&mut self) -> InstanceStatus;

    fn error(&self) -> Option<String>;

    /// Output lines produced since the previous call.
    fn drain_output(&mut self) -> Vec<String>;

    fn report(&self) -> AttemptReport {
        AttemptReport::from_error(self.error())
    }
}

/// Abstraction over agent execution backends.
pub trait Executor {
    type Instance: ExecutionInstance;

    fn start(&self, request: &StartRequest) -> Result<Self::Instance>;
}

/// Executor that spawns the configured agent command.
///
/// The tier is passed as `--model <tier>` and the prompt is written to stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Executor for CommandExecutor {
    type Instance = CommandInstance;

    #[instrument(skip_all, fields(feature_id = %request.feature_id, model = %request.model))]
    fn start(&self, request: &StartRequest) -> Result<CommandInstance> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--model")
            .arg(request.model.as_str())
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(workdir = %request.workdir.display(), program = %program, "starting agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn agent command {program}"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        match stdin.write_all(request.prompt.as_bytes()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("agent closed stdin before reading the prompt");
            }
            Err(err) => return Err(err).context("write prompt to agent stdin"),
        }
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, lines) = mpsc::channel();
        let stdout_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_sink = Arc::clone(&stderr_buf);
        let stderr_reader = thread::spawn(move || read_stderr_limited(stderr, &stderr_sink));

        Ok(CommandInstance {
            child,
            lines,
            readers: vec![stdout_reader, stderr_reader],
            stderr: stderr_buf,
            recent: VecDeque::with_capacity(RECENT_LINES),
            started: Instant::now(),
            timeout: self.timeout,
            state: InstanceStatus::Running,
            exit: None,
            timed_out: false,
        })
    }
}

fn read_stderr_limited(mut stderr: impl Read, sink: &Mutex<String>) {
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut sink = sink.lock();
                if sink.len() < STDERR_LIMIT_BYTES {
                    sink.push_str(&String::from_utf8_lossy(&buf[..n]));
                }
            }
        }
    }
}

pub struct CommandInstance {
    child: Child,
    lines: Receiver<String>,
    /// Pipe reader threads; settled once the agent exits on its own.
    readers: Vec<JoinHandle<()>>,
    stderr: Arc<Mutex<String>>,
    /// Tail of the drained stdout, kept for error text.
    recent: VecDeque<String>,
    started: Instant,
    timeout: Duration,
    state: InstanceStatus,
    exit: Option<String>,
    timed_out: bool,
}

impl CommandInstance {
    /// Give the pipe readers a bounded window to reach EOF after exit.
    ///
    /// A background process started by the agent can inherit its pipes and keep
    /// them open indefinitely; such readers are detached and keep feeding
    /// `lines` until the pipe closes.
    fn settle_readers(&mut self) {
        let deadline = Instant::now() + READER_GRACE;
        while self.readers.iter().any(|reader| !reader.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        for reader in self.readers.drain(..) {
            if !reader.is_finished() {
                debug!("agent pipe still held open, detaching reader");
                continue;
            }
            if reader.join().is_err() {
                warn!("agent output reader panicked");
            }
        }
    }

    fn kill_for_timeout(&mut self) {
        warn!(timeout_secs = self.timeout.as_secs(), "attempt timed out, killing agent");
        if let Err(err) = self.child.kill() {
            warn!(error = %err, "kill agent");
        }
        if let Err(err) = self.child.wait_timeout(KILL_GRACE) {
            warn!(error = %err, "reap agent after kill");
        }
        self.timed_out = true;
        self.state = InstanceStatus::Failed;
        self.exit = Some(format!("attempt timed out after {}s", self.timeout.as_secs()));
    }
}

impl ExecutionInstance for CommandInstance {
    fn status(&mut self) -> InstanceStatus {
        if self.state.is_terminal() {
            return self.state;
        }
        match self.child.try_wait() {
            Ok(Some(status)) if status.success() => {
                debug!("agent exited successfully");
                self.settle_readers();
                self.state = InstanceStatus::Completed;
            }
            Ok(Some(status)) => {
                warn!(exit_code = ?status.code(), "agent failed");
                self.settle_readers();
                self.state = InstanceStatus::Failed;
                self.exit = Some(format!("agent exited with status {:?}", status.code()));
            }
            Ok(None) if self.started.elapsed() >= self.timeout => self.kill_for_timeout(),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "poll agent");
                self.state = InstanceStatus::Failed;
                self.exit = Some(format!("poll agent: {err}"));
            }
        }
        self.state
    }

    fn error(&self) -> Option<String> {
        let exit = self.exit.as_ref()?;
        let mut text = exit.clone();
        let stderr = self.stderr.lock();
        if !stderr.trim().is_empty() {
            text.push_str("\n=== stderr ===\n");
            text.push_str(stderr.trim_end());
        }
        if !self.recent.is_empty() {
            text.push_str("\n=== output tail ===\n");
            for line in &self.recent {
                text.push_str(line);
                text.push('\n');
            }
        }
        Some(text)
    }

    fn drain_output(&mut self) -> Vec<String> {
        let drained: Vec<String> = self.lines.try_iter().collect();
        for line in &drained {
            if self.recent.len() == RECENT_LINES {
                self.recent.pop_front();
            }
            self.recent.push_back(line.clone());
        }
        drained
    }
}
