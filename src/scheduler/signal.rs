//! Cooperative pause/cancel signaling for the coordinator loop.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Pause,
    Cancel,
}

impl From<u8> for Signal {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Pause,
            2 => Self::Cancel,
            _ => Self::None,
        }
    }
}

impl From<Signal> for u8 {
    fn from(s: Signal) -> Self {
        match s {
            Signal::None => 0,
            Signal::Pause => 1,
            Signal::Cancel => 2,
        }
    }
}

#[derive(Clone, Default)]
pub struct SignalHandler {
    signal: Arc<AtomicU8>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.signal.store(Signal::Pause.into(), Ordering::SeqCst);
    }

    /// Clear a pending pause. A cancel signal is sticky and survives resume.
    pub fn resume(&self) {
        let _ = self.signal.compare_exchange(
            Signal::Pause.into(),
            Signal::None.into(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn cancel(&self) {
        self.signal.store(Signal::Cancel.into(), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.signal.store(Signal::None.into(), Ordering::SeqCst);
    }

    pub fn check(&self) -> Signal {
        Signal::from(self.signal.load(Ordering::SeqCst))
    }

    pub fn is_paused(&self) -> bool {
        self.check() == Signal::Pause
    }

    pub fn is_cancelled(&self) -> bool {
        self.check() == Signal::Cancel
    }
}
