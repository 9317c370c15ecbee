//! Re-timing irregular frame arrivals onto a fixed output rate.

use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Error-feedback distributor turning arrival timestamps into per-frame repeat counts.
///
/// Each arrival contributes the time elapsed since the previous one plus the
/// fraction of a frame left over last time; whole output frames are emitted
/// and the remainder carries forward. Arithmetic is exact (nanoseconds scaled
/// by fps), so the long-run output converges to `elapsed * fps` with no drift.
#[derive(Debug, Clone)]
pub struct Pacer {
    fps: u32,
    last: Option<Instant>,
    /// Leftover time in units of ns * fps; always < NANOS_PER_SEC
    carry: u128,
}

impl Pacer {
    /// `fps` must be non-zero; a zero rate is clamped to 1.
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            last: None,
            carry: 0,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }

    /// Fraction of a frame carried over to the next arrival.
    pub fn overflow(&self) -> Duration {
        let nanos = self.carry / u128::from(self.fps);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Register a frame captured at `now`; returns how many times to write it.
    ///
    /// The first frame only starts the clock and yields zero. Timestamps that
    /// go backwards count as no elapsed time.
    pub fn advance(&mut self, now: Instant) -> u32 {
        let elapsed = match self.last {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::ZERO,
        };
        let scaled = elapsed.as_nanos() * u128::from(self.fps) + self.carry;
        let frames = scaled / NANOS_PER_SEC;
        self.carry = scaled % NANOS_PER_SEC;
        self.last = Some(now);
        u32::try_from(frames).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(fps: u32, offsets: &[Duration]) -> u64 {
        let base = Instant::now();
        let mut pacer = Pacer::new(fps);
        offsets
            .iter()
            .map(|offset| u64::from(pacer.advance(base + *offset)))
            .sum()
    }

    #[test]
    fn ten_hertz_input_for_one_second_at_24_fps() {
        let offsets: Vec<Duration> = (0..=10).map(|i| Duration::from_millis(100 * i)).collect();
        let total = emitted(24, &offsets);
        assert!((23..=25).contains(&total), "emitted {total}");
        assert_eq!(total, 24);
    }

    #[test]
    fn frame_faster_than_rate_is_discarded() {
        let base = Instant::now();
        let mut pacer = Pacer::new(25);
        assert_eq!(pacer.advance(base), 0);
        assert_eq!(pacer.advance(base + Duration::from_millis(39)), 0);
        assert_eq!(pacer.overflow(), Duration::from_millis(39));
    }

    #[test]
    fn frame_exactly_one_period_later_emits_one() {
        let base = Instant::now();
        let mut pacer = Pacer::new(25);
        pacer.advance(base);
        assert_eq!(pacer.advance(base + Duration::from_millis(40)), 1);
        assert_eq!(pacer.overflow(), Duration::ZERO);

        let mut pacer = Pacer::new(24);
        pacer.advance(base);
        assert_eq!(pacer.advance(base + Duration::from_nanos(41_666_667)), 1);
    }

    #[test]
    fn slow_source_is_duplicated() {
        let base = Instant::now();
        let mut pacer = Pacer::new(30);
        pacer.advance(base);
        assert_eq!(pacer.advance(base + Duration::from_millis(200)), 6);
    }

    #[test]
    fn carry_accumulates_across_discards() {
        let base = Instant::now();
        let mut pacer = Pacer::new(10);
        pacer.advance(base);
        // 60ms steps at 10fps: 0, 1, 0, 1, 1 ...
        let counts: Vec<u32> = (1..=5)
            .map(|i| pacer.advance(base + Duration::from_millis(60 * i)))
            .collect();
        assert_eq!(counts, vec![0, 1, 0, 1, 1]);
    }

    #[test]
    fn long_irregular_run_does_not_drift() {
        let base = Instant::now();
        let mut pacer = Pacer::new(24);
        let mut t = Duration::ZERO;
        let mut total = u64::from(pacer.advance(base));
        for i in 0..10_000u64 {
            // jittery arrivals between 7ms and 90ms apart
            t += Duration::from_millis(7 + (i * 37) % 84);
            total += u64::from(pacer.advance(base + t));
        }
        let expected = (t.as_millis() * 24 / 1000) as u64;
        assert_eq!(total, expected);
    }

    #[test]
    fn backwards_timestamp_counts_as_zero_elapsed() {
        let base = Instant::now() + Duration::from_secs(1);
        let mut pacer = Pacer::new(24);
        pacer.advance(base);
        assert_eq!(pacer.advance(base - Duration::from_millis(500)), 0);
    }
}
