use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use botpanel_process::{InstanceId, ResourceSample};
use tokio::sync::Mutex;

use crate::logs::LogSink;
use crate::messenger::{ChatClient, ClientOptions, ExitSignal, LoginCallback, LoginRequest, Messenger};
use crate::process_support::{env_u64, format_error_chain, read_proc_rss_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub login_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            login_timeout: env_u64("BOTPANEL_LOGIN_TIMEOUT_MS")
                .map(|v| Duration::from_millis(v.clamp(1000, 10 * 60 * 1000)))
                .unwrap_or(d.login_timeout),
            stop_grace: env_u64("BOTPANEL_STOP_GRACE_MS")
                .map(|v| Duration::from_millis(v.clamp(500, 2 * 60 * 1000)))
                .unwrap_or(d.stop_grace),
        }
    }
}

/// What the caller learns about a freshly launched instance.
#[derive(Debug, Clone)]
pub struct LaunchedBot {
    pub id: InstanceId,
    pub pid: Option<u32>,
    pub exit: ExitSignal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed,
    /// The client did not acknowledge within the grace period; closing continues in the background.
    TimedOut(Duration),
    Failed(String),
    NoHandle,
}

struct BotHandle {
    id: InstanceId,
    pid: Option<u32>,
    started_at: tokio::time::Instant,
    client: Box<dyn ChatClient>,
}

struct LaunchGuard<'a>(&'a AtomicBool);

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the single live chat client.
///
/// `launch` turns the collaborator's login callback into one awaited outcome,
/// bounded by `login_timeout`. `terminate` is best-effort and bounded by
/// `stop_grace`.
pub struct Supervisor {
    messenger: Arc<dyn Messenger>,
    config: SupervisorConfig,
    logs: LogSink,
    launching: AtomicBool,
    handle: Mutex<Option<BotHandle>>,
}

impl Supervisor {
    pub fn new(messenger: Arc<dyn Messenger>, config: SupervisorConfig, logs: LogSink) -> Self {
        Self {
            messenger,
            config,
            logs,
            launching: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub async fn launch(
        &self,
        request: LoginRequest,
        options: &ClientOptions,
    ) -> anyhow::Result<LaunchedBot> {
        if self.launching.swap(true, Ordering::SeqCst) {
            anyhow::bail!("a launch is already in flight");
        }
        let _guard = LaunchGuard(&self.launching);

        if self.handle.lock().await.is_some() {
            anyhow::bail!("a bot instance is already live");
        }

        let timeout = self.config.login_timeout;
        let (done, rx) = LoginCallback::channel();
        self.messenger.login(request, done);

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(anyhow::anyhow!("login callback dropped without a result")),
            Err(_) => Err(anyhow::anyhow!(
                "login timed out after {}ms",
                timeout.as_millis()
            )),
        };
        let mut client = outcome?;

        if let Err(err) = client.set_options(options).await {
            tracing::warn!(err = %format_error_chain(&err), "failed to apply client options");
            self.logs
                .emit(format!(
                    "[botpanel] warning: could not apply client options: {}",
                    format_error_chain(&err)
                ))
                .await;
        }

        let launched = LaunchedBot {
            id: InstanceId::new(),
            pid: client.pid(),
            exit: client.exit_signal(),
        };
        *self.handle.lock().await = Some(BotHandle {
            id: launched.id.clone(),
            pid: launched.pid,
            started_at: tokio::time::Instant::now(),
            client,
        });
        tracing::info!(instance = %launched.id, pid = ?launched.pid, "bot instance live");
        Ok(launched)
    }

    pub async fn terminate(&self) -> Termination {
        let Some(mut handle) = self.handle.lock().await.take() else {
            return Termination::NoHandle;
        };

        let grace = self.config.stop_grace;
        let id = handle.id.clone();
        // Detached so a timed-out close keeps escalating after we stop waiting.
        let closing = tokio::spawn(async move { handle.client.close().await });
        let out = match tokio::time::timeout(grace, closing).await {
            Ok(Ok(Ok(()))) => Termination::Closed,
            Ok(Ok(Err(err))) => Termination::Failed(format_error_chain(&err)),
            Ok(Err(join_err)) => Termination::Failed(join_err.to_string()),
            Err(_) => Termination::TimedOut(grace),
        };
        tracing::info!(instance = %id, outcome = ?out, "bot instance terminated");
        out
    }

    /// Drops the handle of an instance that exited on its own. Ignores stale ids.
    pub async fn reap(&self, id: &InstanceId) -> bool {
        let mut guard = self.handle.lock().await;
        if guard.as_ref().is_none_or(|h| &h.id != id) {
            return false;
        }
        let Some(mut handle) = guard.take() else {
            return false;
        };
        drop(guard);

        tokio::spawn(async move {
            if let Err(err) = handle.client.close().await {
                tracing::debug!(err = %format_error_chain(&err), "close after exit failed");
            }
        });
        true
    }

    #[cfg(test)]
    async fn is_live(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Memory and uptime of the live client; `None` when nothing runs.
    ///
    /// In-process clients have no pid of their own, so the panel process is sampled instead.
    pub async fn sample(&self) -> Option<ResourceSample> {
        let (pid, started_at) = {
            let guard = self.handle.lock().await;
            let h = guard.as_ref()?;
            (h.pid, h.started_at)
        };
        let pid = pid.unwrap_or_else(std::process::id);
        let rss_bytes = read_proc_rss_bytes(pid).await.unwrap_or(0);
        Some(ResourceSample {
            rss_bytes,
            uptime: started_at.elapsed(),
        })
    }
}
