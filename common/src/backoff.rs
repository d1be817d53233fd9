//! Exponential backoff.

use std::cmp::min;
use std::time::Duration;

const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

/// An infinite iterator of [`Duration`]s to sleep between store reconnect
/// attempts: 250ms, 500ms, 1s, ... capped at 32s.
pub fn iter() -> impl Iterator<Item = Duration> {
    (0u32..).map(|index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = INITIAL_WAIT_MS.saturating_mul(factor);
        Duration::from_millis(min(wait_ms, MAXIMUM_WAIT_MS))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn caps_and_never_overflows() {
        let mut durations = iter();
        assert_eq!(durations.next(), Some(Duration::from_millis(250)));
        assert_eq!(durations.next(), Some(Duration::from_millis(500)));
        let far = iter().nth(150).unwrap();
        assert_eq!(far, Duration::from_millis(MAXIMUM_WAIT_MS));
    }
}
