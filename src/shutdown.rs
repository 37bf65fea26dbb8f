//! Shutdown coordination.
//!
//! A single process-wide flag, set at most once, carried in a watch channel so
//! the acceptor can race it against a pending accept.

use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Handle to the shutdown flag. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` only for the call that set the flag.
    pub fn request(&self) -> bool {
        self.flag.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        })
    }

    pub fn is_requested(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut requested = self.flag.subscribe();
        let _ = requested.wait_for(|requested| *requested).await;
    }

    /// Install SIGINT and SIGTERM handlers and spawn the task that turns them
    /// into shutdown requests.
    ///
    /// Handlers are installed before this returns, so a failure is reported
    /// to the caller instead of surfacing later.
    pub fn listen_for_signals(&self) -> io::Result<JoinHandle<()>> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut interrupt = signal(SignalKind::interrupt())?;
            let mut terminate = signal(SignalKind::terminate())?;
            let shutdown = self.clone();

            Ok(tokio::spawn(async move {
                loop {
                    let name = tokio::select! {
                        Some(()) = interrupt.recv() => "SIGINT",
                        Some(()) = terminate.recv() => "SIGTERM",
                        else => break,
                    };
                    shutdown.on_signal(name);
                }
            }))
        }

        #[cfg(not(unix))]
        {
            let shutdown = self.clone();
            Ok(tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.on_signal("ctrl-c");
                }
            }))
        }
    }

    fn on_signal(&self, name: &'static str) {
        if self.request() {
            info!(signal = name, "Shutdown signal received");
        } else {
            info!(signal = name, "Shutdown already in progress");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
