use std::{fmt::Display, thread, time::Duration};

use log::warn;

/// Runs `op` up to `attempts` times, sleeping `backoff` between attempts.
///
/// Local device operations retry with a fixed, short backoff; there is no
/// network jitter to justify an exponential one. The closure receives the
/// 1-based attempt number so callers can vary parameters on later attempts.
pub fn with_retries<T, E, F>(attempts: u32, backoff: Duration, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    debug_assert!(attempts > 0);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!("Attempt {attempt}/{attempts} failed: {err}");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Polls `probe` up to `attempts` times with `backoff` between polls, until
/// it returns true. Returns whether the probe ever succeeded.
pub fn poll_until(attempts: u32, backoff: Duration, mut probe: impl FnMut() -> bool) -> bool {
    for attempt in 1..=attempts {
        if probe() {
            return true;
        }
        if attempt < attempts {
            thread::sleep(backoff);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_first_attempt() {
        let mut calls = 0;
        let res: Result<u32, String> = with_retries(3, Duration::ZERO, |_| {
            calls += 1;
            Ok(7)
        });
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_succeeds_after_failures() {
        let res: Result<u32, String> = with_retries(3, Duration::ZERO, |attempt| {
            if attempt < 3 {
                Err(format!("attempt {attempt} failed"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(res.unwrap(), 3);
    }

    #[test]
    fn test_exhausts_attempts() {
        let mut calls = 0;
        let res: Result<(), String> = with_retries(3, Duration::ZERO, |_| {
            calls += 1;
            Err("nope".to_string())
        });
        assert_eq!(res.unwrap_err(), "nope");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_until() {
        let mut calls = 0;
        assert!(poll_until(5, Duration::ZERO, || {
            calls += 1;
            calls == 2
        }));
        assert_eq!(calls, 2);

        assert!(!poll_until(3, Duration::ZERO, || false));
    }
}
