//! Boundary to the messaging-platform client library.
//!
//! The platform login is callback based: `login` returns immediately and the
//! implementation resolves the supplied [`LoginCallback`] once, at some later
//! point, with either a live [`ChatClient`] or the reason the login failed.

use std::path::PathBuf;

use tokio::sync::{oneshot, watch};

/// Options pushed to the client right after a successful login.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    pub listen_events: bool,
    pub self_listen: bool,
    pub online: bool,
    pub auto_mark_read: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            listen_events: true,
            self_listen: false,
            online: true,
            auto_mark_read: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub credentials: serde_json::Value,
    /// Where the credential file was persisted, for clients that read it themselves.
    pub credentials_path: PathBuf,
    pub owner_id: String,
}

/// Flips to `Some(reason)` once the client has gone away.
pub type ExitSignal = watch::Receiver<Option<String>>;

pub type LoginOutcome = anyhow::Result<Box<dyn ChatClient>>;

#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// OS process id when the client runs out of process.
    fn pid(&self) -> Option<u32>;

    async fn set_options(&mut self, options: &ClientOptions) -> anyhow::Result<()>;

    /// Logs out and releases the client. Must tolerate an already-closed client.
    async fn close(&mut self) -> anyhow::Result<()>;

    fn exit_signal(&self) -> ExitSignal;
}

pub trait Messenger: Send + Sync + 'static {
    fn login(&self, request: LoginRequest, done: LoginCallback);
}

/// Single-use completion handle for one login attempt.
///
/// `resolve` consumes the callback, so an implementation cannot report twice.
/// Dropping it unresolved is reported to the waiting side as a failed login.
pub struct LoginCallback {
    tx: oneshot::Sender<LoginOutcome>,
}

impl LoginCallback {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<LoginOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn resolve(self, outcome: LoginOutcome) {
        let Err(late) = self.tx.send(outcome) else {
            return;
        };

        // Nobody is waiting anymore (login timed out). Do not leak a live session.
        if let Ok(mut client) = late {
            tracing::warn!("login succeeded after the supervisor gave up; closing client");
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move {
                        if let Err(err) = client.close().await {
                            tracing::warn!(%err, "failed to close late client");
                        }
                    });
                }
                Err(_) => drop(client),
            }
        }
    }

    /// Resolves once nobody is waiting for the outcome anymore, e.g. after a login timeout.
    pub async fn abandoned(&mut self) {
        self.tx.closed().await
    }

    pub fn succeed(self, client: Box<dyn ChatClient>) {
        self.resolve(Ok(client));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.resolve(Err(anyhow::anyhow!(reason.into())));
    }
}

impl std::fmt::Debug for LoginCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCallback")
            .field("waiting", &!self.tx.is_closed())
            .finish()
    }
}
