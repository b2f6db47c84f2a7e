use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared termination flag consulted between node launches.
///
/// Clones observe the same flag. Setting it never interrupts a kernel that
/// is already running.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can drive another run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
