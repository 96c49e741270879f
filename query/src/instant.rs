use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// Instant that can be used in both wasm and non-wasm environments.
/// Contains Duration since Unix Epoch (Unix Timestamp).
///
/// Outside the browser the clock advances with the tokio clock, so paused
/// test runtimes drive it deterministically.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(pub std::time::Duration);

#[cfg(not(feature = "csr"))]
thread_local! {
    static CLOCK_ORIGIN: (tokio::time::Instant, Duration) = (
        tokio::time::Instant::now(),
        std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default(),
    );
}

impl Instant {
    /// Get the current time as a Unix Timestamp.
    pub fn now() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "csr")] {
                let millis = js_sys::Date::now();
                let duration = std::time::Duration::from_millis(millis as u64);
                Instant(duration)
            } else {
                CLOCK_ORIGIN.with(|(origin, unix)| {
                    let elapsed = tokio::time::Instant::now().saturating_duration_since(*origin);
                    Instant(*unix + elapsed)
                })
            }
        }
    }

    /// Milliseconds since Unix Epoch.
    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    /// Start of the window of length `window` this instant falls into.
    ///
    /// A zero window disables bucketing and returns the exact millisecond.
    pub fn bucket(&self, window: Duration) -> u64 {
        let window = window.as_millis() as u64;
        let millis = self.as_millis();
        if window == 0 {
            millis
        } else {
            millis - millis % window
        }
    }

    /// Time left until `self`, zero if already reached.
    pub fn saturating_until(&self, now: Instant) -> Duration {
        self.0.saturating_sub(now.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + rhs)
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_millis())
    }
}

impl std::fmt::Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Instant").field(&self.0.as_millis()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_truncates_to_window() {
        let instant = Instant(Duration::from_millis(12_345));
        assert_eq!(instant.bucket(Duration::from_secs(1)), 12_000);
        assert_eq!(instant.bucket(Duration::from_millis(100)), 12_300);
        assert_eq!(instant.bucket(Duration::ZERO), 12_345);
    }

    #[test]
    fn saturating_until_never_negative() {
        let earlier = Instant(Duration::from_millis(100));
        let later = Instant(Duration::from_millis(250));
        assert_eq!(later.saturating_until(earlier), Duration::from_millis(150));
        assert_eq!(earlier.saturating_until(later), Duration::ZERO);
        assert_eq!(later - earlier, Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn follows_paused_clock() {
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let end = Instant::now();
        assert_eq!(end - start, Duration::from_millis(1_500));
    }
}
