/// Bound on concurrently compiling/running submissions.
///
/// A fixed pool of permits lives in a bounded channel. Acquiring takes one
/// out, dropping the permit puts it back, so a panicking holder still
/// returns its slot.
use crate::config::types::{MazeboxError, Result};
use crate::safety::cancel::CancellationToken;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct AdmissionLimiter {
    capacity: usize,
    take: Receiver<()>,
    give: Sender<()>,
}

/// Execution slot; released on drop
#[derive(Debug)]
pub struct AdmissionPermit {
    give: Sender<()>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let _ = self.give.try_send(());
    }
}

impl AdmissionLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (give, take) = bounded(capacity);
        for _ in 0..capacity {
            let _ = give.try_send(());
        }
        Self {
            capacity,
            take,
            give,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.take.len()
    }

    /// Wait up to `timeout` for a slot. Fails with `Busy` on timeout and
    /// `Cancelled` when the token trips first.
    pub fn acquire(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(MazeboxError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.take.recv_timeout(remaining.min(CANCEL_POLL)) {
                Ok(()) => {
                    return Ok(AdmissionPermit {
                        give: self.give.clone(),
                    })
                }
                Err(RecvTimeoutError::Timeout) if remaining > CANCEL_POLL => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(MazeboxError::Busy(format!(
                        "all {} execution slots busy for {}ms",
                        self.capacity,
                        timeout.as_millis()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MazeboxError::Busy("admission pool closed".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits_return_on_drop() {
        let limiter = AdmissionLimiter::new(2);
        let token = CancellationToken::new();
        let a = limiter.acquire(Duration::from_millis(10), &token).unwrap();
        let _b = limiter.acquire(Duration::from_millis(10), &token).unwrap();
        assert_eq!(limiter.available(), 0);
        drop(a);
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn test_exhausted_pool_is_busy() {
        let limiter = AdmissionLimiter::new(1);
        let token = CancellationToken::new();
        let _held = limiter.acquire(Duration::from_millis(10), &token).unwrap();
        let started = Instant::now();
        let err = limiter.acquire(Duration::from_millis(60), &token).unwrap_err();
        assert!(matches!(err, MazeboxError::Busy(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiter_gets_released_permit() {
        let limiter = AdmissionLimiter::new(1);
        let token = CancellationToken::new();
        let held = limiter.acquire(Duration::from_millis(10), &token).unwrap();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            std::thread::spawn(move || limiter.acquire(Duration::from_secs(5), &token).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_cancelled_wait() {
        let limiter = AdmissionLimiter::new(1);
        let token = CancellationToken::new();
        let _held = limiter.acquire(Duration::from_millis(10), &token).unwrap();
        token.cancel();
        assert!(matches!(
            limiter.acquire(Duration::from_secs(5), &token),
            Err(MazeboxError::Cancelled)
        ));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(AdmissionLimiter::new(0).capacity(), 1);
    }
}
