use anyhow::{Result, bail};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn full_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    // Use millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Sleep for `delay`, bailing out early if the token is cancelled.
pub async fn sleep_with_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled"),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// One jittered backoff pause for the given attempt number.
pub async fn wait(
    cancel: &CancellationToken,
    base: Duration,
    cap: Duration,
    attempt: u32,
) -> Result<()> {
    sleep_with_cancel(cancel, full_jitter(base, cap, attempt)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_exponential_envelope() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(30);
        for attempt in 0..10 {
            for _ in 0..50 {
                let d = full_jitter(base, cap, attempt);
                let upper = (100u64 << attempt).min(30_000);
                assert!(d.as_millis() as u64 <= upper, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn jitter_is_capped() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(5);
        for _ in 0..100 {
            let d = full_jitter(base, cap, 40);
            assert!(d <= cap);
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = full_jitter(Duration::from_millis(250), Duration::from_secs(10), 200);
        assert!(d <= Duration::from_secs(10));
    }
}
