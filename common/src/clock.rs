use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Format of the timestamp prefix written to the durable log.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Milliseconds since the first call in this process.
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Elapsed time between two readings of a free-running counter. Survives wraparound.
pub fn elapsed_ms(now_ms: u64, since_ms: u64) -> u64 {
    now_ms.wrapping_sub(since_ms)
}

/// Wall-clock source used to stamp log lines.
pub trait WallClock {
    fn now(&self) -> NaiveDateTime;

    fn timestamp(&self) -> String {
        self.now().format(LOG_TIMESTAMP_FORMAT).to_string()
    }
}

/// System clock rendered in a fixed IANA timezone. Before time sync this reports
/// whatever the RTC holds, usually the epoch.
#[derive(Debug, Clone)]
pub struct ZonedClock {
    tz: Tz,
}

impl ZonedClock {
    pub fn new(timezone: &str) -> Self {
        Self {
            tz: timezone.parse().unwrap_or(Tz::UTC),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn at(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        utc.with_timezone(&self.tz).naive_local()
    }
}

impl WallClock for ZonedClock {
    fn now(&self) -> NaiveDateTime {
        self.at(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synchronized { waited: Duration },
    TimedOut,
}

/// Polls `is_synced` until it reports true or `timeout` runs out, sleeping `poll`
/// between attempts through `sleep`.
pub fn wait_for_sync(
    timeout: Duration,
    poll: Duration,
    mut is_synced: impl FnMut() -> bool,
    mut sleep: impl FnMut(Duration),
) -> SyncOutcome {
    let poll = poll.max(Duration::from_millis(1));
    let mut waited = Duration::ZERO;

    loop {
        if is_synced() {
            return SyncOutcome::Synchronized { waited };
        }
        if waited >= timeout {
            return SyncOutcome::TimedOut;
        }
        let step = poll.min(timeout - waited);
        sleep(step);
        waited += step;
    }
}

/// Epoch seconds before this are treated as "clock never set".
pub const MIN_SYNCED_EPOCH: i64 = 1_600_000_000;

pub fn system_time_looks_synced() -> bool {
    Utc::now().timestamp() >= MIN_SYNCED_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn elapsed_survives_counter_wraparound() {
        assert_eq!(elapsed_ms(1_500, 1_000), 500);
        assert_eq!(elapsed_ms(99, u64::MAX - 900), 1_000);
    }

    #[test]
    fn zoned_clock_formats_local_time() {
        let clock = ZonedClock::new("Europe/Madrid");
        let utc = Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 5).unwrap();
        let local = clock.at(utc);
        assert_eq!(local.format(LOG_TIMESTAMP_FORMAT).to_string(), "2024-07-01 12:00:05");
    }

    #[test]
    fn unknown_timezone_uses_utc() {
        assert_eq!(ZonedClock::new("nowhere").timezone(), Tz::UTC);
    }

    #[test]
    fn sync_succeeds_after_a_few_polls() {
        let mut polls = 0;
        let mut slept = Vec::new();
        let outcome = wait_for_sync(
            Duration::from_secs(30),
            Duration::from_secs(1),
            || {
                polls += 1;
                polls > 3
            },
            |d| slept.push(d),
        );
        assert_eq!(
            outcome,
            SyncOutcome::Synchronized {
                waited: Duration::from_secs(3)
            }
        );
        assert_eq!(slept.len(), 3);
    }

    #[test]
    fn sync_gives_up_at_timeout() {
        let mut total = Duration::ZERO;
        let outcome = wait_for_sync(
            Duration::from_millis(2_500),
            Duration::from_secs(1),
            || false,
            |d| total += d,
        );
        assert_eq!(outcome, SyncOutcome::TimedOut);
        assert_eq!(total, Duration::from_millis(2_500));
    }
}
