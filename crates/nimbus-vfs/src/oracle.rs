//! Connectivity oracle.
//!
//! A process-wide singleton with an explicit init and teardown step
//! driven by the mount command. Components record network successes and
//! failures; consumers ask whether the mount is online and can wait for
//! the next offline→online transition (the offline-log drain trigger).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nimbus_core::ports::remote::RemoteErrorKind;
use tokio::sync::Notify;
use tracing::info;

use crate::error::VfsError;

/// Connectivity as currently believed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// The oracle proper. Usually reached through [`ConnectivityOracle::global`].
pub struct ConnectivityOracle {
    online: AtomicBool,
    /// Woken on every offline→online transition.
    reconnect: Notify,
}

impl ConnectivityOracle {
    fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            reconnect: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        if self.online.load(Ordering::SeqCst) {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records a successful remote round-trip.
    pub fn record_success(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("connectivity restored");
            self.reconnect.notify_waiters();
        }
    }

    /// Records a failed remote round-trip; only kinds that indicate
    /// lost connectivity flip the oracle.
    pub fn record_failure(&self, kind: RemoteErrorKind) {
        if kind.indicates_offline() && self.online.swap(false, Ordering::SeqCst) {
            info!("connectivity lost, deferring mutations to the offline log");
        }
    }

    /// Forces a state (used by `--wipe-cache`-style maintenance and tests).
    pub fn force(&self, state: ConnectivityState) {
        match state {
            ConnectivityState::Online => self.record_success(),
            ConnectivityState::Offline => {
                self.online.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Completes on the next offline→online transition.
    pub async fn wait_for_reconnect(&self) {
        self.reconnect.notified().await;
    }

    /// A free-standing oracle not registered globally (tests and
    /// embedded use).
    pub fn standalone() -> Arc<ConnectivityOracle> {
        Arc::new(ConnectivityOracle::new())
    }

    // ------------------------------------------------------------------------
    // Process-wide lifecycle
    // ------------------------------------------------------------------------

    /// Initializes the global oracle. Idempotent within one mount; the
    /// returned handle is the same one `global()` hands out.
    pub fn init() -> Arc<ConnectivityOracle> {
        let mut slot = GLOBAL.lock().expect("oracle lock poisoned");
        if let Some(ref existing) = *slot {
            return Arc::clone(existing);
        }
        let oracle = Arc::new(ConnectivityOracle::new());
        *slot = Some(Arc::clone(&oracle));
        oracle
    }

    /// Tears the global oracle down at unmount.
    pub fn teardown() {
        *GLOBAL.lock().expect("oracle lock poisoned") = None;
    }

    /// The global oracle; an error before [`init`] rather than a panic,
    /// mapped to EIO at the FUSE boundary.
    ///
    /// [`init`]: ConnectivityOracle::init
    pub fn global() -> Result<Arc<ConnectivityOracle>, VfsError> {
        GLOBAL
            .lock()
            .expect("oracle lock poisoned")
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| VfsError::Corrupt("connectivity oracle accessed before init".into()))
    }
}

static GLOBAL: Mutex<Option<Arc<ConnectivityOracle>>> = Mutex::new(None);
