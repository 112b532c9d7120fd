use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{oneshot, watch},
};

use crate::logs::LogSink;
use crate::messenger::{
    ChatClient, ClientOptions, ExitSignal, LoginCallback, LoginRequest, Messenger,
};
use crate::process_support::{
    StopSignal, format_error_chain, graceful_term_grace, set_parent_death_signal, signal_group,
};

/// Line a client prints on stdout once the platform session is live.
pub const READY_MARKER: &str = "BOTPANEL_READY";
/// Prefix of the line a client prints when the platform rejected the login.
pub const LOGIN_FAILED_PREFIX: &str = "BOTPANEL_LOGIN_FAILED:";

const DEFAULT_CLIENT_CMD: &str = "node";
const DEFAULT_CLIENT_ARGS: &str = "client/index.js";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ClientCommand {
    pub fn from_env() -> Self {
        let command = std::env::var("BOTPANEL_CLIENT_CMD")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_CMD.to_string());
        let args = std::env::var("BOTPANEL_CLIENT_ARGS")
            .unwrap_or_else(|_| DEFAULT_CLIENT_ARGS.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let cwd = std::env::var("BOTPANEL_CLIENT_CWD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self { command, args, cwd }
    }
}

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlLine<'a> {
    SetOptions { options: &'a ClientOptions },
    Logout,
}

async fn write_control(stdin: &mut ChildStdin, msg: &ControlLine<'_>) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(msg).context("serialize control line")?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .context("write to client stdin")?;
    stdin.flush().await.context("flush client stdin")?;
    Ok(())
}

/// Runs the platform client as a child process and speaks a line protocol with it.
///
/// The child gets the credential path and owner id through its environment,
/// reports the login outcome on stdout (`BOTPANEL_READY` or
/// `BOTPANEL_LOGIN_FAILED:<reason>`) and accepts JSON control lines on stdin.
#[derive(Debug, Clone)]
pub struct CommandMessenger {
    command: ClientCommand,
    logs: LogSink,
}

impl CommandMessenger {
    pub fn new(command: ClientCommand, logs: LogSink) -> Self {
        Self { command, logs }
    }
}

impl Messenger for CommandMessenger {
    fn login(&self, request: LoginRequest, done: LoginCallback) {
        let command = self.command.clone();
        let logs = self.logs.clone();
        tokio::spawn(run_login(command, request, logs, done));
    }
}

/// What the client's stdout or its exit said about the login.
#[derive(Debug)]
enum Verdict {
    Ready,
    Rejected(String),
    Exited(String),
}

type VerdictSlot = Arc<Mutex<Option<oneshot::Sender<Verdict>>>>;

/// First report wins; later ones are ignored.
fn report(slot: &VerdictSlot, verdict: Verdict) {
    let tx = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(tx) = tx {
        let _ = tx.send(verdict);
    }
}

async fn run_login(command: ClientCommand, request: LoginRequest, logs: LogSink, mut done: LoginCallback) {
    let mut cmd = Command::new(&command.command);
    cmd.args(&command.args)
        .env("BOTPANEL_CREDENTIALS_PATH", &request.credentials_path)
        .env("BOTPANEL_OWNER_ID", &request.owner_id)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session so stop can signal the whole client process tree.
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    logs.emit(format!(
        "[botpanel] exec: {} {}",
        command.command,
        command.args.join(" ")
    ))
    .await;

    let mut child = match cmd
        .spawn()
        .with_context(|| format!("spawn client: exec={}", command.command))
    {
        Ok(c) => c,
        Err(err) => {
            logs.emit(format!(
                "[botpanel] client spawn failed: {}",
                format_error_chain(&err)
            ))
            .await;
            done.resolve(Err(err));
            return;
        }
    };

    let pid = child.id();
    let (exit_tx, exit_rx) = watch::channel::<Option<String>>(None);
    let mut client = CommandClient {
        pid,
        pgid: pid.map(|p| p as i32),
        stdin: child.stdin.take(),
        exit: exit_rx,
        logs: logs.clone(),
    };
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let slot: VerdictSlot = Arc::new(Mutex::new(Some(verdict_tx)));

    if let Some(err) = child.stderr.take() {
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.emit(format!("[stderr] {line}")).await;
            }
        });
    }

    if let Some(out) = child.stdout.take() {
        let logs = logs.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed == READY_MARKER {
                    report(&slot, Verdict::Ready);
                    continue;
                }
                if let Some(reason) = trimmed.strip_prefix(LOGIN_FAILED_PREFIX) {
                    let reason = match reason.trim() {
                        "" => "login rejected",
                        r => r,
                    };
                    report(&slot, Verdict::Rejected(reason.to_string()));
                    continue;
                }
                logs.emit(format!("[stdout] {line}")).await;
            }
        });
    }

    {
        let logs = logs.clone();
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => format!("client exited with code {code}"),
                    None => "client terminated by signal".to_string(),
                },
                Err(err) => format!("wait failed: {err}"),
            };
            logs.emit(format!("[botpanel] {reason}")).await;
            report(&slot, Verdict::Exited(reason.clone()));
            let _ = exit_tx.send(Some(reason));
        });
    }

    let verdict = tokio::select! {
        v = verdict_rx => Some(v),
        _ = done.abandoned() => None,
    };
    match verdict {
        Some(Ok(Verdict::Ready)) => {
            logs.emit("[botpanel] client reported login success").await;
            done.succeed(Box::new(client));
        }
        Some(Ok(Verdict::Rejected(reason))) => {
            logs.emit(format!("[botpanel] client reported login failure: {reason}"))
                .await;
            done.fail(reason);
            if let Err(err) = client.close().await {
                tracing::warn!(%err, "failed to close rejected client");
            }
        }
        Some(Ok(Verdict::Exited(reason))) => {
            done.fail(format!("client exited before login completed ({reason})"));
        }
        Some(Err(_)) => {
            done.fail("client stopped reporting before login completed");
        }
        None => {
            logs.emit("[botpanel] login abandoned by caller; stopping client")
                .await;
            if let Err(err) = client.close().await {
                tracing::warn!(err = %format_error_chain(&err), "failed to stop abandoned client");
            }
        }
    }
}

pub struct CommandClient {
    pid: Option<u32>,
    pgid: Option<i32>,
    stdin: Option<ChildStdin>,
    exit: ExitSignal,
    logs: LogSink,
}

impl CommandClient {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        // A dropped sender means the wait task is gone, which only happens after exit.
        tokio::time::timeout(timeout, self.exit.wait_for(|v| v.is_some()))
            .await
            .is_ok()
    }

    async fn escalate(&mut self, sig: StopSignal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        if signal_group(pgid, sig) {
            self.logs
                .emit(format!("[botpanel] stop: sent {} to client", sig.name()))
                .await;
        }
    }
}

#[async_trait::async_trait]
impl ChatClient for CommandClient {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn set_options(&mut self, options: &ClientOptions) -> anyhow::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("client stdin is closed"))?;
        write_control(stdin, &ControlLine::SetOptions { options }).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.has_exited() {
            self.stdin = None;
            return Ok(());
        }

        let grace = graceful_term_grace();
        if let Some(mut stdin) = self.stdin.take() {
            if write_control(&mut stdin, &ControlLine::Logout).await.is_ok() {
                self.logs.emit("[botpanel] stop: sent logout").await;
            }
            // Dropping stdin gives the client EOF as well.
        }
        if self.wait_exit(grace).await {
            return Ok(());
        }

        self.escalate(StopSignal::Term).await;
        if self.wait_exit(grace).await {
            return Ok(());
        }

        self.escalate(StopSignal::Kill).await;
        if self.wait_exit(grace).await {
            return Ok(());
        }
        anyhow::bail!("client did not exit after SIGKILL")
    }

    fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logs::LogBuffer;

    fn shell(script: &str) -> ClientCommand {
        ClientCommand {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
        }
    }

    fn request() -> LoginRequest {
        LoginRequest {
            credentials: serde_json::json!([{"key": "c_user", "value": "1"}]),
            credentials_path: PathBuf::from("/nonexistent/appstate.json"),
            owner_id: "1001".to_string(),
        }
    }

    async fn login(script: &str, logs: LogSink) -> anyhow::Result<Box<dyn ChatClient>> {
        let messenger = CommandMessenger::new(shell(script), logs);
        let (done, rx) = LoginCallback::channel();
        messenger.login(request(), done);
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("login resolved")
            .expect("callback not dropped")
    }

    #[tokio::test]
    async fn ready_line_yields_client_that_closes_on_logout() {
        let logs = LogSink::in_memory(LogBuffer::with_capacity(100));
        let mut client = login(
            r#"echo "owner=$BOTPANEL_OWNER_ID"; echo BOTPANEL_READY; while read line; do echo "got $line"; done"#,
            logs.clone(),
        )
        .await
        .unwrap();
        assert!(client.pid().is_some());

        client.set_options(&ClientOptions::default()).await.unwrap();
        client.close().await.unwrap();
        assert!(client.exit_signal().borrow().is_some());
        // Closing twice is tolerated.
        client.close().await.unwrap();

        let (lines, _) = logs.tail(0, 100).await;
        let text = lines.join("\n");
        assert!(text.contains("[stdout] owner=1001"));
    }

    #[tokio::test]
    async fn failure_line_is_surfaced() {
        let logs = LogSink::in_memory(LogBuffer::with_capacity(100));
        let err = login(
            "echo 'BOTPANEL_LOGIN_FAILED: checkpoint required'; sleep 30",
            logs,
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "checkpoint required");
    }

    #[tokio::test]
    async fn early_exit_is_a_login_failure() {
        let logs = LogSink::in_memory(LogBuffer::with_capacity(100));
        let err = login("exit 3", logs).await.err().unwrap();
        assert!(err.to_string().contains("code 3"), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_is_a_login_failure() {
        let logs = LogSink::in_memory(LogBuffer::with_capacity(100));
        let messenger = CommandMessenger::new(
            ClientCommand {
                command: "/nonexistent/botpanel-client".to_string(),
                args: vec![],
                cwd: None,
            },
            logs,
        );
        let (done, rx) = LoginCallback::channel();
        messenger.login(request(), done);
        let err = rx.await.unwrap().err().unwrap();
        assert!(format_error_chain(&err).contains("spawn client"));
    }

    fn pid_alive(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn timed_out_launch_stops_the_client_process() {
        use crate::supervisor::{Supervisor, SupervisorConfig};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("client.pid");
        let script = format!("echo $$ > {}; sleep 30", pid_file.display());
        let logs = LogSink::in_memory(LogBuffer::with_capacity(100));
        let sup = Supervisor::new(
            Arc::new(CommandMessenger::new(shell(&script), logs.clone())),
            SupervisorConfig {
                login_timeout: Duration::from_millis(500),
                stop_grace: Duration::from_secs(1),
            },
            logs.clone(),
        );

        let err = sup
            .launch(request(), &ClientOptions::default())
            .await
            .unwrap_err();
        assert!(format_error_chain(&err).contains("timed out"));

        let pid: i32 = tokio::fs::read_to_string(&pid_file)
            .await
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // Logout is ignored by the script, so this rides out one grace period before SIGTERM.
        let mut alive = true;
        for _ in 0..150 {
            if !pid_alive(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "client pid {pid} still running after abandoned login");

        let (lines, _) = logs.tail(0, 100).await;
        assert!(lines.iter().any(|l| l.contains("login abandoned")));
    }

    #[tokio::test]
    async fn caller_giving_up_before_ready_stops_client() {
        let logs = LogSink::in_memory(LogBuffer::with_capacity(100));
        let messenger = CommandMessenger::new(
            shell("sleep 1; echo BOTPANEL_READY; sleep 30"),
            logs.clone(),
        );
        let (done, rx) = LoginCallback::channel();
        messenger.login(request(), done);
        drop(rx);

        let mut stopped = false;
        for _ in 0..150 {
            let (lines, _) = logs.tail(0, 100).await;
            if lines.iter().any(|l| l.contains("client terminated by signal")) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(stopped);
    }
}
