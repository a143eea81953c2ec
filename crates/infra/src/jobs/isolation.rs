//! Per-job subprocess isolation.
//!
//! Each attempt runs in a fresh child process so a hung or crashing agent can
//! be killed without taking the worker down. Parent and child talk over pipes:
//!
//! - parent → child stdin: one JSON object `{"agent": ..., "payload": ...}`,
//!   then stdin is closed;
//! - child → parent stdout: exactly one JSON line, either
//!   `{"ok": true, "result": ...}` or
//!   `{"ok": false, "error": {"type": ..., "message": ..., "trace": ...}}`.
//!
//! Child logs go to stderr, which the parent inherits.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use agentq_agents::AgentRegistry;

use super::classify::HandlerFailure;

/// Subcommand the worker binary answers to in child mode.
pub const EXEC_AGENT_SUBCOMMAND: &str = "exec-agent";

/// Time between SIGTERM and SIGKILL for a child that overran its timeout.
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Error type tags produced by the child harness itself.
pub mod failure_types {
    pub const PANIC: &str = "Panic";
    pub const BAD_REQUEST: &str = "BadRequest";
}

/// What the parent writes to the child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub agent: String,
    pub payload: JsonValue,
}

/// The single line the child writes to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildMessage {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerFailure>,
}

impl ChildMessage {
    pub fn success(result: JsonValue) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: HandlerFailure) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    fn into_outcome(self) -> RunOutcome {
        if self.ok {
            RunOutcome::Succeeded(self.result.unwrap_or(JsonValue::Null))
        } else {
            RunOutcome::Failed(self.error.unwrap_or_else(|| {
                HandlerFailure::new("UnknownError", "child reported failure without an error")
            }))
        }
    }
}

/// Result of one isolated attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded(JsonValue),
    /// The agent raised; the failure is eligible for classification.
    Failed(HandlerFailure),
    /// The wall-clock limit passed and the child was killed.
    TimedOut,
    /// The child could not be started or exited without a usable message.
    NoResult { detail: String },
}

/// Runs one agent attempt under a timeout.
pub trait JobRunner: Send + Sync {
    fn run(&self, agent: &str, payload: &JsonValue, timeout: Duration) -> RunOutcome;
}

/// [`JobRunner`] that spawns a child process per attempt.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    program: PathBuf,
    args: Vec<OsString>,
    term_grace: Duration,
}

impl SubprocessRunner {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            term_grace: DEFAULT_TERM_GRACE,
        }
    }

    /// Re-invoke the running binary in child mode.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, [EXEC_AGENT_SUBCOMMAND]))
    }

    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    fn spawn(&self) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    fn terminate(&self, child: &mut Child) {
        send_sigterm(child);
        match wait_until(child, Instant::now().checked_add(self.term_grace)) {
            Ok(Some(_)) => return,
            Ok(None) => warn!(pid = child.id(), "child ignored SIGTERM; killing"),
            Err(e) => warn!(pid = child.id(), error = %e, "failed to wait for child"),
        }
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), error = %e, "failed to kill child");
        }
        let _ = child.wait();
    }
}

impl JobRunner for SubprocessRunner {
    fn run(&self, agent: &str, payload: &JsonValue, timeout: Duration) -> RunOutcome {
        let request = ChildRequest {
            agent: agent.to_string(),
            payload: payload.clone(),
        };
        let mut body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                return RunOutcome::NoResult {
                    detail: format!("failed to encode child request: {e}"),
                };
            }
        };
        body.push(b'\n');

        let deadline = Instant::now().checked_add(timeout);
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::NoResult {
                    detail: format!("failed to spawn {}: {e}", self.program.display()),
                };
            }
        };
        debug!(pid = child.id(), agent, "child spawned");

        // Feed stdin and drain stdout on their own threads so neither pipe can
        // stall the timeout loop.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&body) {
                    debug!(error = %e, "child closed stdin early");
                }
            });
        }
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                let _ = tx.send(last_line(stdout));
            });
        }

        let status = match wait_until(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(pid = child.id(), agent, timeout_secs = timeout.as_secs_f64(), "child timed out");
                self.terminate(&mut child);
                return RunOutcome::TimedOut;
            }
            Err(e) => {
                self.terminate(&mut child);
                return RunOutcome::NoResult {
                    detail: format!("failed to wait for child: {e}"),
                };
            }
        };

        // A grandchild can keep stdout open after the child exits.
        let line = match rx.recv_timeout(self.term_grace) {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                return RunOutcome::NoResult {
                    detail: format!("failed to read child output: {e}"),
                };
            }
            Err(_) => None,
        };
        interpret(line, status)
    }
}

fn interpret(line: Option<String>, status: ExitStatus) -> RunOutcome {
    let Some(line) = line else {
        return RunOutcome::NoResult {
            detail: format!("child exited ({status}) without a result"),
        };
    };
    match serde_json::from_str::<ChildMessage>(&line) {
        Ok(message) => message.into_outcome(),
        Err(e) => RunOutcome::NoResult {
            detail: format!("malformed child output ({status}): {e}"),
        },
    }
}

fn last_line(stdout: impl Read) -> io::Result<Option<String>> {
    let mut last = None;
    for line in BufReader::new(stdout).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    Ok(last)
}

/// Poll until the child exits or `deadline` passes (`Ok(None)`).
/// `None` deadline: the timeout does not fit in an `Instant`, wait for exit.
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                POLL_INTERVAL.min(deadline - now)
            }
            None => POLL_INTERVAL,
        };
        thread::sleep(pause);
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        debug!(pid = child.id(), error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

/// Child-mode entry point: read one request from `input`, run the agent, write
/// one [`ChildMessage`] line to `output`.
///
/// Never fails because of the agent; errors and panics are reported in-band.
/// Returns the message it wrote.
pub fn run_child(
    registry: &AgentRegistry,
    mut input: impl Read,
    mut output: impl Write,
) -> io::Result<ChildMessage> {
    let mut raw = String::new();
    input.read_to_string(&mut raw)?;

    let message = match serde_json::from_str::<ChildRequest>(&raw) {
        Ok(request) => execute(registry, &request),
        Err(e) => ChildMessage::failure(HandlerFailure::new(
            failure_types::BAD_REQUEST,
            format!("invalid child request: {e}"),
        )),
    };

    let mut line = serde_json::to_vec(&message)?;
    line.push(b'\n');
    output.write_all(&line)?;
    output.flush()?;
    Ok(message)
}

fn execute(registry: &AgentRegistry, request: &ChildRequest) -> ChildMessage {
    let agent = match registry.get(&request.agent) {
        Ok(agent) => agent,
        Err(e) => return ChildMessage::failure(HandlerFailure::from(&e)),
    };

    match panic::catch_unwind(AssertUnwindSafe(|| agent.run(&request.payload))) {
        Ok(Ok(result)) => ChildMessage::success(result),
        Ok(Err(e)) => {
            ChildMessage::failure(HandlerFailure::from(&e).with_trace(format!("{e:?}")))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "agent panicked".to_string());
            ChildMessage::failure(HandlerFailure::new(failure_types::PANIC, message))
        }
    }
}
