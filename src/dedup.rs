//! Duplicate-submission guard and single-turn limiter.
//!
//! Tolerates retry-happy mobile clients: an identical transcript inside the
//! cooldown window is rejected, and at most one turn may be in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Identical transcript within the cooldown window.
    Cooldown { remaining_ms: u64 },
    /// Another turn is already in flight.
    Busy,
}

/// Submission guard shared by the text and voice intake paths.
pub struct DedupGuard {
    cooldown: Duration,
    last: Mutex<Option<(String, Instant)>>,
    in_flight: Arc<AtomicBool>,
}

impl DedupGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record a transcript, rejecting it when it exactly matches the
    /// previous accepted one inside the cooldown window.
    pub fn check_transcript(&self, transcript: &str) -> Result<(), GuardError> {
        let mut last = self.last.lock().unwrap();
        if let Some((prev, at)) = last.as_ref() {
            let elapsed = at.elapsed();
            if elapsed < self.cooldown && prev == transcript {
                let remaining = self.cooldown - elapsed;
                return Err(GuardError::Cooldown {
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
        }
        *last = Some((transcript.to_string(), Instant::now()));
        Ok(())
    }

    /// Claim the single concurrent-turn slot. The permit releases the slot
    /// when dropped, so error paths cannot leak it.
    pub fn begin_turn(&self) -> Result<TurnPermit, GuardError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(TurnPermit {
                flag: self.in_flight.clone(),
            })
        } else {
            Err(GuardError::Busy)
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// RAII hold on the single-turn slot.
#[derive(Debug)]
pub struct TurnPermit {
    flag: Arc<AtomicBool>,
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
