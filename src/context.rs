use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{Error, Result};

/// Cancellation signal shared between a caller and long running index
/// operations. Merges and scans poll it between packs.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Error::Cancelled` once `cancel` has been called on any clone.
    pub fn err(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared() {
        let ctx = Context::new();
        let clone = ctx.clone();
        assert!(ctx.err().is_ok());
        clone.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.err(), Err(Error::Cancelled)));
    }
}
