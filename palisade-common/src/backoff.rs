use std::{iter, time::Duration};

/// The fastest the reconnect policy will retry.
const FLOOR: Duration = Duration::from_secs(1);
/// The cadence the delays saturate at.
const CEILING: Duration = Duration::from_secs(30);

/// An endless series of reconnect delays: starts at the one-second floor,
/// doubles on each step, and saturates at the thirty-second ceiling.
///
/// The peer client sleeps on `next()` between failed connection attempts
/// and throws the iterator away once a handshake succeeds, so every fresh
/// outage pays the floor first:
///
/// ```
/// # use palisade_common::backoff;
/// # async fn reconnect_attempt() -> bool { true }
/// # async fn example() {
/// let mut delays = backoff::get_backoff_iter();
/// while !reconnect_attempt().await {
///     tokio::time::sleep(delays.next().expect("Never ends")).await;
/// }
/// # }
/// ```
pub fn get_backoff_iter() -> impl Iterator<Item = Duration> {
    iter_with_initial_wait_ms(FLOOR.as_millis() as u64)
}

/// [`get_backoff_iter`] from a custom floor, still doubling up to the
/// ceiling.
pub fn iter_with_initial_wait_ms(
    initial_wait_ms: u64,
) -> impl Iterator<Item = Duration> {
    let mut wait_ms = initial_wait_ms;
    iter::from_fn(move || {
        let current = wait_ms.min(CEILING.as_millis() as u64);
        wait_ms = wait_ms.saturating_mul(2);
        Some(Duration::from_millis(current))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubles_from_floor_and_saturates_at_ceiling() {
        let delays = get_backoff_iter().take(8).collect::<Vec<_>>();
        assert_eq!(delays[0], FLOOR);
        assert_eq!(delays[1], FLOOR * 2);
        assert_eq!(delays[2], FLOOR * 4);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().unwrap(), CEILING);
    }

    #[test]
    fn keeps_yielding_far_past_saturation() {
        // The doubling saturates instead of overflowing.
        let far = get_backoff_iter().nth(500).unwrap();
        assert_eq!(far, CEILING);
    }
}
