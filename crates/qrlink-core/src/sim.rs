//! In-process simulated protocol client.
//!
//! Behaves like a real client from the manager's point of view: the QR
//! channel must be opened before `connect`, codes rotate on an interval until
//! the context ends, and a scan emits `PairSuccess` followed by `Connected`.
//! Tests and demos drive it through [`SimulatedClient::scan`],
//! [`SimulatedClient::logout`] and [`SimulatedClient::emit`].

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    PairingContext, ProtocolEvent, QrEvent, QrItem,
    traits::{ClientFactory, DeviceIdentity, EventHandler, ProtocolClient, ProtocolError},
};

const RAW_QR_CAPACITY: usize = 8;

/// Behavior of simulated clients.
#[derive(Debug, Clone)]
pub struct SimScript {
    /// Codes emitted in order once connected.
    pub codes: Vec<String>,
    /// Delay between codes.
    pub code_interval: Duration,
    /// Make `connect` fail with this reason.
    pub fail_connect: Option<String>,
    /// Whether `is_connected` turns true after `connect`.
    pub confirm_connect: bool,
    /// Make `qr_channel` fail.
    pub fail_qr: bool,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            codes: vec![
                "2@sim-code-1".to_string(),
                "2@sim-code-2".to_string(),
                "2@sim-code-3".to_string(),
            ],
            code_interval: Duration::from_secs(20),
            fail_connect: None,
            confirm_connect: true,
            fail_qr: false,
        }
    }
}

struct QrState {
    sender: Option<mpsc::Sender<QrItem>>,
    ctx: Option<PairingContext>,
}

/// Simulated protocol client.
pub struct SimulatedClient {
    store_path: PathBuf,
    script: SimScript,
    socket_up: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    emitter_started: AtomicBool,
    handlers: Mutex<Vec<EventHandler>>,
    qr: Mutex<QrState>,
    scanned: CancellationToken,
}

impl SimulatedClient {
    /// Create a client bound to `store_path`.
    #[must_use]
    pub fn new(store_path: impl Into<PathBuf>, script: SimScript) -> Self {
        Self {
            store_path: store_path.into(),
            script,
            socket_up: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            emitter_started: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            qr: Mutex::new(QrState {
                sender: None,
                ctx: None,
            }),
            scanned: CancellationToken::new(),
        }
    }

    /// Store file this client was opened with.
    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Number of `connect` calls.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Deliver an event to every registered handler.
    pub fn emit(&self, event: ProtocolEvent) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Simulate the remote device scanning the current code.
    pub fn scan(&self, identity: DeviceIdentity) {
        self.scanned.cancel();
        if let Some(sender) = self.take_qr_sender() {
            let _ = sender.try_send(QrItem::signal(QrEvent::Success));
        }
        self.emit(ProtocolEvent::PairSuccess(identity));
        self.socket_up.store(true, Ordering::SeqCst);
        self.emit(ProtocolEvent::Connected);
    }

    /// Simulate the remote party revoking the session.
    pub fn logout(&self, reason: Option<String>) {
        self.socket_up.store(false, Ordering::SeqCst);
        self.emit(ProtocolEvent::LoggedOut { reason });
    }

    /// Simulate a dropped transport.
    pub fn drop_connection(&self) {
        self.socket_up.store(false, Ordering::SeqCst);
        self.emit(ProtocolEvent::Disconnected);
    }

    fn take_qr_sender(&self) -> Option<mpsc::Sender<QrItem>> {
        self.qr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .take()
    }

    /// Start rotating codes once both the QR channel and the socket exist.
    fn maybe_start_emitter(&self) {
        let (sender, ctx) = {
            let qr = self.qr.lock().unwrap_or_else(PoisonError::into_inner);
            match (&qr.sender, &qr.ctx) {
                (Some(sender), Some(ctx)) => (sender.clone(), ctx.clone()),
                _ => return,
            }
        };
        if self.connect_calls() == 0 || self.emitter_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let codes = self.script.codes.clone();
        let interval = self.script.code_interval;
        let scanned = self.scanned.clone();
        tokio::spawn(async move {
            for (index, code) in codes.into_iter().enumerate() {
                if index > 0 {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        () = ctx.done() => return,
                        () = scanned.cancelled() => return,
                    }
                }
                tokio::select! {
                    sent = sender.send(QrItem::code(code)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    () = ctx.done() => return,
                    () = scanned.cancelled() => return,
                }
            }
            let _ = sender.try_send(QrItem::signal(QrEvent::Timeout));
        });
    }
}

#[async_trait]
impl ProtocolClient for SimulatedClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.script.fail_connect {
            return Err(ProtocolError::Connect(reason.clone()));
        }
        if self.script.confirm_connect {
            self.socket_up.store(true, Ordering::SeqCst);
        }
        self.maybe_start_emitter();
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.socket_up.store(false, Ordering::SeqCst);
        self.scanned.cancel();
        drop(self.take_qr_sender());
    }

    fn is_connected(&self) -> bool {
        self.socket_up.load(Ordering::SeqCst)
    }

    async fn qr_channel(
        &self,
        ctx: &PairingContext,
    ) -> Result<mpsc::Receiver<QrItem>, ProtocolError> {
        if self.script.fail_qr {
            return Err(ProtocolError::QrChannel("device already paired".to_string()));
        }
        let (tx, rx) = mpsc::channel(RAW_QR_CAPACITY);
        {
            let mut qr = self.qr.lock().unwrap_or_else(PoisonError::into_inner);
            qr.sender = Some(tx);
            qr.ctx = Some(ctx.clone());
        }
        self.maybe_start_emitter();
        Ok(rx)
    }

    fn on_event(&self, handler: EventHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }
}

/// Factory producing [`SimulatedClient`]s.
///
/// `open` creates an empty store file at the requested path, like a real
/// device store bootstrap would.
#[derive(Debug, Default)]
pub struct SimulatedFactory {
    script: SimScript,
    fail_open: Option<String>,
    opened: Arc<AtomicUsize>,
}

impl SimulatedFactory {
    #[must_use]
    pub fn new(script: SimScript) -> Self {
        Self {
            script,
            fail_open: None,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every `open` fail with `reason`.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_open: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Number of clients opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for SimulatedFactory {
    type Client = SimulatedClient;

    async fn open(&self, store_path: &Path) -> Result<Self::Client, ProtocolError> {
        if let Some(reason) = &self.fail_open {
            return Err(ProtocolError::Store(reason.clone()));
        }
        tokio::fs::File::create(store_path).await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SimulatedClient::new(store_path, self.script.clone()))
    }
}
