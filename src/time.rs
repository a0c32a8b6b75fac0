//! Conversions between WIM timestamps and `SystemTime`.
//!
//! WIM archives store timestamps as 100-nanosecond ticks since
//! 1601-01-01T00:00:00Z (the Windows `FILETIME` epoch). The filesystem host
//! wants `SystemTime`.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Ticks per second (one tick is 100 ns).
const TICKS_PER_SECOND: u64 = 10_000_000;

/// Offset of the Unix epoch from the Windows epoch, in ticks.
pub(crate) const UNIX_EPOCH_TICKS: u64 = 11_644_473_600 * TICKS_PER_SECOND;

/// Converts a tick count to a `SystemTime`.
///
/// Times before the Unix epoch (1601..1970) are representable and map below
/// `UNIX_EPOCH`.
pub(crate) fn system_time_from_ticks(ticks: u64) -> SystemTime {
    if ticks >= UNIX_EPOCH_TICKS {
        let past_epoch = ticks - UNIX_EPOCH_TICKS;
        UNIX_EPOCH
            + Duration::new(
                past_epoch / TICKS_PER_SECOND,
                (past_epoch % TICKS_PER_SECOND) as u32 * 100,
            )
    } else {
        let before_epoch = UNIX_EPOCH_TICKS - ticks;
        UNIX_EPOCH
            - Duration::new(
                before_epoch / TICKS_PER_SECOND,
                (before_epoch % TICKS_PER_SECOND) as u32 * 100,
            )
    }
}

/// Converts a `SystemTime` to a tick count, saturating at the Windows epoch
/// for earlier times and at `u64::MAX` ticks for far-future times.
pub(crate) fn ticks_from_system_time(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(past_epoch) => {
            let ticks = past_epoch
                .as_secs()
                .saturating_mul(TICKS_PER_SECOND)
                .saturating_add(u64::from(past_epoch.subsec_nanos()) / 100);
            UNIX_EPOCH_TICKS.saturating_add(ticks)
        }
        Err(before_epoch_error) => {
            let d = before_epoch_error.duration();
            let ticks = d
                .as_secs()
                .saturating_mul(TICKS_PER_SECOND)
                .saturating_add(u64::from(d.subsec_nanos()) / 100);
            UNIX_EPOCH_TICKS.saturating_sub(ticks)
        }
    }
}

/// The current time as a tick count.
pub(crate) fn now_ticks() -> u64 {
    ticks_from_system_time(SystemTime::now())
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use std::time::UNIX_EPOCH;

    use super::*;

    #[test]
    fn unix_epoch_tick_value() {
        // The documented FILETIME value of 1970-01-01T00:00:00Z.
        assert_eq!(UNIX_EPOCH_TICKS, 116_444_736_000_000_000);
        assert_eq!(ticks_from_system_time(UNIX_EPOCH), UNIX_EPOCH_TICKS);
        assert_eq!(system_time_from_ticks(UNIX_EPOCH_TICKS), UNIX_EPOCH);
    }

    #[test]
    fn round_trips_at_100ns_granularity() {
        let t = UNIX_EPOCH + Duration::new(1_234_567_890, 123_456_700);
        assert_eq!(system_time_from_ticks(ticks_from_system_time(t)), t);
    }

    #[test]
    fn before_unix_epoch() {
        let t = UNIX_EPOCH - Duration::new(86_400, 0);
        let ticks = ticks_from_system_time(t);
        assert!(ticks < UNIX_EPOCH_TICKS);
        assert_eq!(system_time_from_ticks(ticks), t);
    }

    #[test]
    fn saturates_below_windows_epoch() {
        let t = UNIX_EPOCH - Duration::new(20_000 * 365 * 86_400, 0);
        assert_eq!(ticks_from_system_time(t), 0);
    }
}
