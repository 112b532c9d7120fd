//! In-memory messenger for tests: logins resolve however the test says, when it says.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::{mpsc, watch};

use crate::messenger::{
    ChatClient, ClientOptions, ExitSignal, LoginCallback, LoginRequest, Messenger,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeMode {
    Succeed,
    Fail(String),
    /// Hand the callback to the test through [`FakeMessenger::next_pending`].
    Defer,
    /// Drop the callback without resolving it.
    Drop,
    /// Keep the callback forever without resolving it.
    Hang,
}

/// Test-side view of one fake client.
#[derive(Clone, Debug)]
pub struct FakeProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug)]
struct ProbeInner {
    closed: AtomicBool,
    hang_on_close: AtomicBool,
    options: Mutex<Option<ClientOptions>>,
    exit_tx: watch::Sender<Option<String>>,
}

impl FakeProbe {
    fn new(hang_on_close: bool) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(ProbeInner {
                closed: AtomicBool::new(false),
                hang_on_close: AtomicBool::new(hang_on_close),
                options: Mutex::new(None),
                exit_tx,
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> Option<ClientOptions> {
        self.inner.options.lock().ok().and_then(|g| g.clone())
    }

    /// Simulates the client going away on its own.
    pub fn crash(&self, reason: &str) {
        self.inner.exit_tx.send_replace(Some(reason.to_string()));
    }
}

pub struct FakeClient {
    probe: FakeProbe,
}

#[async_trait::async_trait]
impl ChatClient for FakeClient {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn set_options(&mut self, options: &ClientOptions) -> anyhow::Result<()> {
        if let Ok(mut g) = self.probe.inner.options.lock() {
            *g = Some(options.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.probe.inner.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.probe.inner.closed.store(true, Ordering::SeqCst);
        self.probe.inner.exit_tx.send_replace(Some("closed".to_string()));
        Ok(())
    }

    fn exit_signal(&self) -> ExitSignal {
        self.probe.inner.exit_tx.subscribe()
    }
}

/// A login the test resolves by hand.
#[derive(Debug)]
pub struct PendingLogin {
    pub request: LoginRequest,
    callback: LoginCallback,
    hang_on_close: bool,
}

impl PendingLogin {
    pub fn succeed(self) -> FakeProbe {
        let probe = FakeProbe::new(self.hang_on_close);
        self.callback.succeed(Box::new(FakeClient {
            probe: probe.clone(),
        }));
        probe
    }

    pub fn fail(self, reason: &str) {
        self.callback.fail(reason);
    }
}

pub struct FakeMessenger {
    mode: Mutex<FakeMode>,
    hang_on_close: AtomicBool,
    logins: AtomicUsize,
    requests: Mutex<Vec<LoginRequest>>,
    probes: Mutex<Vec<FakeProbe>>,
    hung: Mutex<Vec<LoginCallback>>,
    pending_tx: mpsc::UnboundedSender<PendingLogin>,
    pending_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingLogin>>,
}

impl FakeMessenger {
    pub fn new(mode: FakeMode) -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            mode: Mutex::new(mode),
            hang_on_close: AtomicBool::new(false),
            logins: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
            hung: Mutex::new(Vec::new()),
            pending_tx,
            pending_rx: tokio::sync::Mutex::new(pending_rx),
        })
    }

    pub fn set_mode(&self, mode: FakeMode) {
        if let Ok(mut g) = self.mode.lock() {
            *g = mode;
        }
    }

    /// Clients created from now on never finish `close`.
    pub fn hang_on_close(&self, hang: bool) {
        self.hang_on_close.store(hang, Ordering::SeqCst);
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<LoginRequest> {
        self.requests.lock().ok().and_then(|g| g.last().cloned())
    }

    pub fn last_probe(&self) -> Option<FakeProbe> {
        self.probes.lock().ok().and_then(|g| g.last().cloned())
    }

    pub async fn next_pending(&self) -> PendingLogin {
        self.pending_rx
            .lock()
            .await
            .recv()
            .await
            .expect("fake messenger channel closed")
    }
}

impl Messenger for FakeMessenger {
    fn login(&self, request: LoginRequest, done: LoginCallback) {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut g) = self.requests.lock() {
            g.push(request.clone());
        }
        let mode = self
            .mode
            .lock()
            .map(|g| g.clone())
            .unwrap_or(FakeMode::Succeed);
        let hang_on_close = self.hang_on_close.load(Ordering::SeqCst);

        match mode {
            FakeMode::Succeed => {
                let probe = FakeProbe::new(hang_on_close);
                if let Ok(mut g) = self.probes.lock() {
                    g.push(probe.clone());
                }
                done.succeed(Box::new(FakeClient { probe }));
            }
            FakeMode::Fail(reason) => done.fail(reason),
            FakeMode::Defer => {
                let _ = self.pending_tx.send(PendingLogin {
                    request,
                    callback: done,
                    hang_on_close,
                });
            }
            FakeMode::Drop => drop(done),
            FakeMode::Hang => {
                if let Ok(mut g) = self.hung.lock() {
                    g.push(done);
                }
            }
        }
    }
}
