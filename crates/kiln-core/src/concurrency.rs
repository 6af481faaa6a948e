use crate::CoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route SIGINT to the shutdown flag. A second SIGINT exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ninterrupt received, stopping after the current step...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cooperative cancellation for builds and long cache walks.
///
/// Clones share one flag. A token made with [`CancelToken::from_signal`]
/// also reports cancelled once SIGINT has been received.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follow_signal: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signal() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_signal: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.follow_signal && shutdown_requested())
    }

    pub fn check(&self, what: &str) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled(what.to_owned()))
        } else {
            Ok(())
        }
    }
}
