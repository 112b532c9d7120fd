//! Start/stop/status/clear for the single bot instance.
//!
//! Mutating operations pass through one gate. A caller that finds the gate
//! taken gets [`LifecycleError::Busy`] instead of waiting, so a second start
//! can never race the first one's login. `status` only reads state and never
//! touches the gate.

use std::sync::Arc;

use botpanel_agent::{
    ClientOptions, LaunchedBot, LogSink, LoginRequest, Supervisor, Termination,
    process_support::format_error_chain,
};
use botpanel_process::{BotState, ConfigRecord, InstanceId, StatusSnapshot};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::credential_store::{CredentialStore, StoreError, parse_credentials};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),
    #[error("Invalid credential file: {0}")]
    CredentialParse(String),
    #[error("Bot is already running")]
    AlreadyRunning,
    #[error("Bot is not running")]
    NotRunning,
    #[error("Stop the bot before clearing its credentials")]
    StillRunning,
    #[error("Another operation is in progress, try again shortly")]
    Busy,
    #[error("Login failed: {0}")]
    LoginFailed(String),
    #[error("Storage error: {0}")]
    Io(String),
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "validation",
            LifecycleError::CredentialParse(_) => "credential_parse",
            LifecycleError::AlreadyRunning => "already_running",
            LifecycleError::NotRunning => "not_running",
            LifecycleError::StillRunning => "still_running",
            LifecycleError::Busy => "busy",
            LifecycleError::LoginFailed(_) => "login_failed",
            LifecycleError::Io(_) => "io",
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Parse(e) => LifecycleError::CredentialParse(e.to_string()),
            other => LifecycleError::Io(other.to_string()),
        }
    }
}

pub fn validate_owner_id(raw: &str) -> Result<String, LifecycleError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(LifecycleError::Validation("Owner id is required".to_string()));
    }
    if !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LifecycleError::Validation(
            "Owner id must contain digits only".to_string(),
        ));
    }
    Ok(id.to_string())
}

fn validate_credentials(bytes: &[u8]) -> Result<serde_json::Value, LifecycleError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(LifecycleError::Validation(
            "Credential file is missing or empty".to_string(),
        ));
    }
    parse_credentials(bytes).map_err(|e| LifecycleError::CredentialParse(e.to_string()))
}

#[derive(Debug, Default)]
struct ManagerState {
    phase: BotState,
    instance: Option<InstanceId>,
    config: ConfigRecord,
}

struct Inner {
    store: CredentialStore,
    supervisor: Supervisor,
    logs: LogSink,
    options: ClientOptions,
    gate: Mutex<()>,
    state: RwLock<ManagerState>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub async fn open(
        store: CredentialStore,
        supervisor: Supervisor,
        logs: LogSink,
        options: ClientOptions,
    ) -> Self {
        let config = store.load_config().await;
        Self {
            inner: Arc::new(Inner {
                store,
                supervisor,
                logs,
                options,
                gate: Mutex::new(()),
                state: RwLock::new(ManagerState {
                    config,
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn logs(&self) -> &LogSink {
        &self.inner.logs
    }

    fn try_gate(&self) -> Result<MutexGuard<'_, ()>, LifecycleError> {
        self.inner.gate.try_lock().map_err(|_| LifecycleError::Busy)
    }

    async fn emit(&self, line: String) {
        self.inner.logs.emit(format!("[botpanel] {line}")).await;
    }

    /// Emits the one status line every operation ends with.
    async fn report(
        &self,
        op: &'static str,
        result: Result<String, LifecycleError>,
    ) -> Result<String, LifecycleError> {
        match &result {
            Ok(msg) => {
                tracing::info!(op, "{msg}");
                self.emit(format!("{op}: {msg}")).await;
            }
            Err(err) => {
                tracing::warn!(op, code = err.code(), "{err}");
                self.emit(format!("{op} failed: {err}")).await;
            }
        }
        result
    }

    async fn set_phase(&self, phase: BotState) {
        self.inner.state.write().await.phase = phase;
    }

    pub async fn start(
        &self,
        credential_bytes: &[u8],
        owner_id: &str,
    ) -> Result<String, LifecycleError> {
        let result = self.start_inner(credential_bytes, owner_id).await;
        self.report("start", result).await
    }

    async fn start_inner(
        &self,
        credential_bytes: &[u8],
        owner_id: &str,
    ) -> Result<String, LifecycleError> {
        let owner_id = validate_owner_id(owner_id)?;
        let credentials = validate_credentials(credential_bytes)?;

        let _gate = self.try_gate()?;
        if self.inner.state.read().await.phase.is_busy() {
            return Err(LifecycleError::AlreadyRunning);
        }
        self.set_phase(BotState::Starting).await;
        self.emit(format!("starting bot for owner {owner_id}")).await;

        let mut config = ConfigRecord {
            owner_id: Some(owner_id.clone()),
            last_started_at: Some(chrono::Utc::now()),
            running: false,
        };
        let persisted = async {
            self.inner.store.save(credential_bytes).await?;
            self.inner.store.save_config(&config).await
        }
        .await;
        if let Err(err) = persisted {
            self.set_phase(BotState::Stopped).await;
            return Err(err.into());
        }
        self.inner.state.write().await.config = config.clone();

        let request = LoginRequest {
            credentials,
            credentials_path: self.inner.store.credential_path(),
            owner_id: owner_id.clone(),
        };
        let launched = match self
            .inner
            .supervisor
            .launch(request, &self.inner.options)
            .await
        {
            Ok(l) => l,
            Err(err) => {
                // The uploaded credential stays on disk for the operator to inspect.
                self.set_phase(BotState::Stopped).await;
                return Err(LifecycleError::LoginFailed(format_error_chain(&err)));
            }
        };

        config.running = true;
        if let Err(err) = self.inner.store.save_config(&config).await {
            tracing::warn!(%err, "failed to persist running flag");
        }
        {
            let mut st = self.inner.state.write().await;
            st.phase = BotState::Running;
            st.instance = Some(launched.id.clone());
            st.config = config;
        }
        self.watch_exit(launched);

        Ok(format!("Bot started for owner {owner_id}"))
    }

    pub async fn stop(&self) -> Result<String, LifecycleError> {
        let result = match self.try_gate() {
            Ok(_gate) => self.stop_locked().await,
            Err(err) => Err(err),
        };
        self.report("stop", result).await
    }

    async fn stop_locked(&self) -> Result<String, LifecycleError> {
        if !self.inner.state.read().await.phase.is_running() {
            return Err(LifecycleError::NotRunning);
        }
        self.set_phase(BotState::Stopping).await;

        let message = match self.inner.supervisor.terminate().await {
            Termination::Closed | Termination::NoHandle => "Bot stopped".to_string(),
            Termination::TimedOut(grace) => {
                self.emit(format!(
                    "client did not acknowledge logout within {}ms; state cleared anyway",
                    grace.as_millis()
                ))
                .await;
                "Bot stopped (client did not confirm logout)".to_string()
            }
            Termination::Failed(reason) => {
                self.emit(format!("client close reported an error: {reason}"))
                    .await;
                "Bot stopped (client close reported an error)".to_string()
            }
        };

        self.mark_stopped().await;
        Ok(message)
    }

    async fn mark_stopped(&self) {
        let config = {
            let mut st = self.inner.state.write().await;
            st.phase = BotState::Stopped;
            st.instance = None;
            st.config.running = false;
            st.config.clone()
        };
        if let Err(err) = self.inner.store.save_config(&config).await {
            tracing::warn!(%err, "failed to persist cleared running flag");
        }
    }

    pub async fn clear(&self) -> Result<String, LifecycleError> {
        let result = self.clear_inner().await;
        self.report("clear", result).await
    }

    async fn clear_inner(&self) -> Result<String, LifecycleError> {
        let _gate = self.try_gate()?;
        if self.inner.state.read().await.phase.is_busy() {
            return Err(LifecycleError::StillRunning);
        }
        self.inner.store.delete().await?;
        self.inner.store.reset_config().await?;
        self.inner.state.write().await.config = ConfigRecord::default();
        Ok("Credentials and configuration cleared".to_string())
    }

    pub async fn status(&self) -> StatusSnapshot {
        let (phase, config) = {
            let st = self.inner.state.read().await;
            (st.phase, st.config.clone())
        };
        let memory = if phase.is_running() {
            self.inner.supervisor.sample().await.map(Into::into)
        } else {
            None
        };
        StatusSnapshot {
            running: phase.is_running(),
            state: phase,
            config: (&config).into(),
            memory,
        }
    }

    /// Reconciles a running flag left behind by a previous process and
    /// optionally starts the bot again from the stored credential.
    pub async fn recover(&self, resume: bool) {
        let config = self.inner.state.read().await.config.clone();
        if !config.running {
            return;
        }

        tracing::info!(owner = ?config.owner_id, "previous run did not stop cleanly");
        self.mark_stopped().await;
        if !resume {
            self.emit("cleared stale running flag from previous run".to_string())
                .await;
            return;
        }

        let Some(owner_id) = config.owner_id else {
            return;
        };
        match self.inner.store.load().await {
            Ok(bytes) => {
                let _ = self.start(&bytes, &owner_id).await;
            }
            Err(err) => {
                self.emit(format!("resume skipped: {err}")).await;
            }
        }
    }

    /// Stops the bot on process shutdown, waiting for any in-flight operation first.
    pub async fn shutdown(&self) {
        let _gate = self.inner.gate.lock().await;
        if self.inner.state.read().await.phase.is_running() {
            let result = self.stop_locked().await;
            let _ = self.report("shutdown", result).await;
        }
    }

    fn watch_exit(&self, launched: LaunchedBot) {
        let manager = self.clone();
        let LaunchedBot { id, mut exit, .. } = launched;
        tokio::spawn(async move {
            let reason = exit
                .wait_for(|v| v.is_some())
                .await
                .map(|r| r.clone().unwrap_or_default())
                .unwrap_or_else(|_| "client handle dropped".to_string());
            manager.on_client_exit(id, reason).await;
        });
    }

    async fn on_client_exit(&self, id: InstanceId, reason: String) {
        let _gate = self.inner.gate.lock().await;
        {
            let st = self.inner.state.read().await;
            if st.instance.as_ref() != Some(&id) || !st.phase.is_running() {
                return;
            }
        }
        self.inner.supervisor.reap(&id).await;
        self.mark_stopped().await;
        tracing::warn!(instance = %id, %reason, "bot exited unexpectedly");
        self.emit(format!("bot exited unexpectedly: {reason}"))
            .await;
    }
}
