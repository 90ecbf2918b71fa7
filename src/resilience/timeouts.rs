//! Explicit timeouts for blocking operations.
//!
//! # Responsibilities
//! - Represent "don't wait", "wait up to d" and "wait forever" as one type
//! - Turn a timeout into a Tokio deadline
//! - Wait on a `Notify` until a readiness check succeeds or the deadline passes
//!
//! # Design Decisions
//! - Uses Tokio's clock so paused-time tests control every deadline
//! - Timeout errors are distinct (`NetError::Timeout`) from other failures
//! - Waiters re-check their condition after every wakeup; spurious wakeups are harmless

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{NetError, Result};

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Check once and return immediately.
    NoWait,
    /// Wait at most this long.
    After(Duration),
    /// Wait until the operation completes.
    #[default]
    Forever,
}

impl Timeout {
    /// Timeout of `ms` milliseconds; `0` means [`Timeout::NoWait`].
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Timeout::NoWait
        } else {
            Timeout::After(Duration::from_millis(ms))
        }
    }

    /// Absolute deadline, or `None` when waiting forever.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::NoWait => Some(Instant::now()),
            Timeout::After(d) => Some(Instant::now() + *d),
            Timeout::Forever => None,
        }
    }

    /// Time left until `deadline` expressed as a new timeout.
    pub fn remaining(deadline: Option<Instant>) -> Self {
        match deadline {
            None => Timeout::Forever,
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Timeout::NoWait
                } else {
                    Timeout::After(left)
                }
            }
        }
    }
}

/// Wait until `ready` yields a result, sleeping on `notify` between checks.
///
/// `ready` is evaluated before the first sleep and after every wakeup; it
/// returns `None` while the condition is not met. Producers must signal with
/// `notify_one` so a wakeup issued between a check and the sleep is kept.
pub async fn wait_until<T>(
    notify: &Notify,
    timeout: Timeout,
    mut ready: impl FnMut() -> Option<Result<T>>,
) -> Result<T> {
    let deadline = timeout.deadline();
    loop {
        if let Some(outcome) = ready() {
            return outcome;
        }
        match deadline {
            None => notify.notified().await,
            Some(at) => {
                if tokio::time::timeout_at(at, notify.notified()).await.is_err() {
                    return ready().unwrap_or(Err(NetError::Timeout));
                }
            }
        }
    }
}

/// Run `fut` under `timeout`, mapping expiry to [`NetError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Timeout, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout.deadline() {
        None => fut.await,
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .unwrap_or(Err(NetError::Timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn zero_millis_is_no_wait() {
        assert_eq!(Timeout::from_millis(0), Timeout::NoWait);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::After(Duration::from_millis(250))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_checks_once() {
        let notify = Notify::new();
        let result: Result<()> = wait_until(&notify, Timeout::NoWait, || None).await;
        assert!(matches!(result, Err(NetError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_when_condition_flips() {
        let notify = Arc::new(Notify::new());
        let flag = Arc::new(AtomicBool::new(false));

        let (n, f) = (notify.clone(), flag.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.store(true, Ordering::SeqCst);
            n.notify_one();
        });

        let result = wait_until(&notify, Timeout::After(Duration::from_secs(1)), || {
            flag.load(Ordering::SeqCst).then_some(Ok(7))
        })
        .await;
        assert_eq!(result.ok(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_at_deadline() {
        let notify = Notify::new();
        let start = Instant::now();
        let result: Result<()> =
            wait_until(&notify, Timeout::After(Duration::from_millis(300)), || None).await;
        assert!(matches!(result, Err(NetError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn remaining_of_past_deadline_is_no_wait() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let deadline = Some(Instant::now());
            tokio::time::advance(Duration::from_millis(5)).await;
            assert_eq!(Timeout::remaining(deadline), Timeout::NoWait);
            assert_eq!(Timeout::remaining(None), Timeout::Forever);
        });
    }
}
