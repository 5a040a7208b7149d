//! Interactive login.
//!
//! Login runs the bridge executable as `<command> <args…> login --phone
//! <phone>` and talks to it over stdio. The bridge prompts for a code and,
//! for accounts with two-step verification, a password; on success it prints
//! `SESSION:<token>`. Everything the driver does is a consequence of a
//! [`LoginEvent`] applied to the [`LoginMachine`]; output parsing lives only
//! in [`classify_line`].

use crate::credentials::CredentialStore;
use crate::error::{LoginError, LoginResult};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tgsync_core::config::BridgeConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const SESSION_PREFIX: &str = "SESSION:";
const ERROR_PREFIX: &str = "ERROR:";

/// How long a bridge that reported success gets to exit on its own.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Login progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    /// The bridge is running and has not asked for input.
    Starting,
    WaitingCode,
    WaitingPassword,
    Completed,
    Error(String),
    Cancelled,
}

impl LoginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::WaitingCode => "waiting_code",
            Self::WaitingPassword => "waiting_password",
            Self::Completed => "completed",
            Self::Error(_) => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error(_) | Self::Cancelled)
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "error ({msg})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Inputs to the login machine, from the bridge or from the user.
#[derive(Clone, PartialEq, Eq)]
pub enum LoginEvent {
    Start,
    CodeRequested,
    PasswordRequested,
    SessionIssued(String),
    Failed(String),
    ProcessExited(Option<i32>),
    SubmitCode(String),
    SubmitPassword(String),
    Cancel,
}

impl LoginEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CodeRequested => "code prompt",
            Self::PasswordRequested => "password prompt",
            Self::SessionIssued(_) => "session",
            Self::Failed(_) => "error",
            Self::ProcessExited(_) => "process exit",
            Self::SubmitCode(_) => "code",
            Self::SubmitPassword(_) => "password",
            Self::Cancel => "cancel",
        }
    }
}

// Codes, passwords and tokens never reach logs.
impl fmt::Debug for LoginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(msg) => f.debug_tuple("Failed").field(msg).finish(),
            Self::ProcessExited(code) => f.debug_tuple("ProcessExited").field(code).finish(),
            Self::SessionIssued(_) | Self::SubmitCode(_) | Self::SubmitPassword(_) => {
                write!(f, "{}([REDACTED])", self.name())
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Side effect requested by a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginAction {
    None,
    /// Write a line to the bridge's stdin.
    WriteInput(String),
    /// Persist the issued session token.
    SaveSession(String),
    /// Stop the bridge.
    Terminate,
}

/// Compute the next state for `event`, or `None` when the event is not valid
/// in `state`.
pub fn transition(state: &LoginState, event: LoginEvent) -> Option<(LoginState, LoginAction)> {
    use LoginEvent as E;
    use LoginState as S;

    if state.is_terminal() {
        return None;
    }

    let next = match (state, event) {
        (S::Idle, E::Start) => (S::Starting, LoginAction::None),
        (S::Idle, E::Cancel) => (S::Cancelled, LoginAction::None),
        (S::Idle, _) => return None,

        (S::Starting | S::WaitingCode, E::CodeRequested) => (S::WaitingCode, LoginAction::None),
        (S::Starting | S::WaitingCode | S::WaitingPassword, E::PasswordRequested) => {
            (S::WaitingPassword, LoginAction::None)
        }
        (S::WaitingCode, E::SubmitCode(code)) => (S::Starting, LoginAction::WriteInput(code)),
        (S::WaitingPassword, E::SubmitPassword(password)) => {
            (S::Starting, LoginAction::WriteInput(password))
        }

        (_, E::SessionIssued(token)) => (S::Completed, LoginAction::SaveSession(token)),
        (_, E::Failed(msg)) => (S::Error(msg), LoginAction::Terminate),
        (_, E::Cancel) => (S::Cancelled, LoginAction::Terminate),
        (_, E::ProcessExited(code)) => {
            let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            (
                S::Error(format!("bridge exited before login completed (status {status})")),
                LoginAction::None,
            )
        }

        _ => return None,
    };
    Some(next)
}

/// Map one line of bridge output to an event. Lines that are neither prompts
/// nor results map to `None`.
pub fn classify_line(line: &str) -> Option<LoginEvent> {
    let line = line.trim();
    if let Some(token) = line.strip_prefix(SESSION_PREFIX) {
        let token = token.trim();
        if token.is_empty() {
            return Some(LoginEvent::Failed("bridge returned an empty session".to_string()));
        }
        return Some(LoginEvent::SessionIssued(token.to_string()));
    }
    if let Some(msg) = line.strip_prefix(ERROR_PREFIX) {
        return Some(LoginEvent::Failed(msg.trim().to_string()));
    }

    let lower = line.to_ascii_lowercase();
    if lower.contains("password") {
        Some(LoginEvent::PasswordRequested)
    } else if lower.contains("code") {
        Some(LoginEvent::CodeRequested)
    } else {
        None
    }
}

/// Login state holder. Rejected events leave the state untouched.
#[derive(Debug)]
pub struct LoginMachine {
    state: LoginState,
}

impl Default for LoginMachine {
    fn default() -> Self {
        Self {
            state: LoginState::Idle,
        }
    }
}

impl LoginMachine {
    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn apply(&mut self, event: LoginEvent) -> LoginResult<LoginAction> {
        let input = event.name().to_string();
        match transition(&self.state, event) {
            Some((next, action)) => {
                tracing::debug!(from = %self.state, to = %next, "Login transition");
                self.state = next;
                Ok(action)
            }
            None => Err(LoginError::InvalidInput {
                state: self.state.as_str().to_string(),
                input,
            }),
        }
    }

    fn fail(&mut self, msg: String) {
        self.state = LoginState::Error(msg);
    }
}

type InputRequest = (LoginEvent, oneshot::Sender<LoginResult<()>>);

/// Starts login flows against the configured bridge.
pub struct LoginDriver {
    command: String,
    args: Vec<String>,
    credentials: Arc<CredentialStore>,
}

impl LoginDriver {
    pub fn new(config: &BridgeConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            credentials,
        }
    }

    /// Spawn the bridge and return a handle for feeding it user input.
    pub async fn start(&self, phone: &str) -> LoginResult<LoginHandle> {
        let mut machine = LoginMachine::default();
        machine.apply(LoginEvent::Start)?;

        let child = Command::new(&self.command)
            .args(&self.args)
            .args(["login", "--phone", phone])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(LoginError::Spawn)?;

        tracing::info!(command = %self.command, "Started login bridge");

        let (state_tx, state_rx) = watch::channel(machine.state().clone());
        let (input_tx, input_rx) = mpsc::channel(8);
        let task = tokio::spawn(drive(
            child,
            machine,
            self.credentials.clone(),
            state_tx,
            input_rx,
        ));

        Ok(LoginHandle {
            inputs: input_tx,
            state: state_rx,
            task,
        })
    }
}

/// A running login flow.
pub struct LoginHandle {
    inputs: mpsc::Sender<InputRequest>,
    state: watch::Receiver<LoginState>,
    task: JoinHandle<LoginResult<LoginState>>,
}

impl LoginHandle {
    /// Current state.
    pub fn state(&self) -> LoginState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<LoginState> {
        self.state.clone()
    }

    pub async fn submit_code(&self, code: &str) -> LoginResult<()> {
        self.send(LoginEvent::SubmitCode(code.trim().to_string()))
            .await
    }

    pub async fn submit_password(&self, password: &str) -> LoginResult<()> {
        self.send(LoginEvent::SubmitPassword(password.to_string()))
            .await
    }

    pub async fn cancel(&self) -> LoginResult<()> {
        self.send(LoginEvent::Cancel).await
    }

    async fn send(&self, event: LoginEvent) -> LoginResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inputs
            .send((event, reply_tx))
            .await
            .map_err(|_| LoginError::Closed)?;
        reply_rx.await.map_err(|_| LoginError::Closed)?
    }

    /// Wait for the flow to reach a terminal state.
    pub async fn wait(self) -> LoginResult<LoginState> {
        drop(self.inputs);
        self.task
            .await
            .map_err(|e| LoginError::Io(std::io::Error::other(e.to_string())))?
    }
}

async fn drive(
    mut child: Child,
    mut machine: LoginMachine,
    credentials: Arc<CredentialStore>,
    state_tx: watch::Sender<LoginState>,
    mut inputs: mpsc::Receiver<InputRequest>,
) -> LoginResult<LoginState> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LoginError::Io(std::io::Error::other("bridge stdout not captured")))?;
    let mut stdin = child.stdin.take();
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;

    while !machine.state().is_terminal() {
        tokio::select! {
            line = lines.next_line(), if stdout_open => {
                match line? {
                    Some(line) => {
                        let Some(event) = classify_line(&line) else {
                            tracing::debug!(line = %line, "Ignoring bridge output");
                            continue;
                        };
                        match machine.apply(event) {
                            Ok(action) => {
                                perform(action, &mut machine, &mut child, &mut stdin, &credentials)
                                    .await;
                            }
                            Err(e) => tracing::warn!(error = %e, "Unexpected bridge output"),
                        }
                    }
                    None => stdout_open = false,
                }
            }
            Some((event, reply)) = inputs.recv() => {
                let result = match machine.apply(event) {
                    Ok(action) => {
                        perform(action, &mut machine, &mut child, &mut stdin, &credentials).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            status = child.wait(), if !stdout_open => {
                let code = status?.code();
                machine.apply(LoginEvent::ProcessExited(code))?;
            }
        }
        state_tx.send_replace(machine.state().clone());
    }

    let state = machine.state().clone();
    match state {
        LoginState::Completed => {
            drop(stdin);
            if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
            }
            tracing::info!("Login completed");
        }
        LoginState::Cancelled => tracing::info!("Login cancelled"),
        LoginState::Error(ref msg) => tracing::warn!(error = %msg, "Login failed"),
        _ => {}
    }
    Ok(state)
}

async fn perform(
    action: LoginAction,
    machine: &mut LoginMachine,
    child: &mut Child,
    stdin: &mut Option<ChildStdin>,
    credentials: &CredentialStore,
) {
    match action {
        LoginAction::None => {}
        LoginAction::WriteInput(value) => {
            let Some(pipe) = stdin.as_mut() else {
                machine.fail("bridge stdin is closed".to_string());
                return;
            };
            let written = async {
                pipe.write_all(value.as_bytes()).await?;
                pipe.write_all(b"\n").await?;
                pipe.flush().await
            }
            .await;
            if let Err(e) = written {
                machine.fail(format!("failed to write to bridge: {e}"));
                let _ = child.start_kill();
            }
        }
        LoginAction::SaveSession(token) => {
            if let Err(e) = credentials.save(&token).await {
                machine.fail(format!("failed to save session: {e}"));
            }
        }
        LoginAction::Terminate => {
            let _ = child.start_kill();
        }
    }
}
