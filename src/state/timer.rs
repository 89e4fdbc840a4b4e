//! Pure timer arithmetic: remaining time, six ordered color bands and the time until the next
//! band. Nothing here touches the cache, the lock or the queue.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

/// One of the six ordered categorical states derived from `remaining / duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorBand {
    /// Below 16.67 %.
    Red,
    /// From 16.67 % (inclusive) to 33.33 %.
    Orange,
    /// From 33.33 % (inclusive) to 50 %.
    Yellow,
    /// From 50 % (inclusive) to 66.67 %.
    Green,
    /// From 66.67 % (inclusive) to 83.33 %.
    Blue,
    /// 83.33 % and above.
    Purple,
}

/// Lower edge of every band except the lowest, in basis points of the duration, checked high to
/// low. Integer edges keep `remaining * 10_000 >= edge * duration` exact for whole seconds.
const BAND_THRESHOLDS: [(u32, ColorBand); 5] = [
    (8_333, ColorBand::Purple),
    (6_667, ColorBand::Blue),
    (5_000, ColorBand::Green),
    (3_333, ColorBand::Yellow),
    (1_667, ColorBand::Orange),
];
const BASIS_POINTS: f64 = 10_000.0;

impl ColorBand {
    /// Every band, from the highest to the lowest.
    pub const ALL: [ColorBand; 6] = [
        ColorBand::Purple,
        ColorBand::Blue,
        ColorBand::Green,
        ColorBand::Yellow,
        ColorBand::Orange,
        ColorBand::Red,
    ];

    /// Emoji shown next to the timer.
    pub fn emoji(self) -> &'static str {
        match self {
            ColorBand::Purple => "🟣",
            ColorBand::Blue => "🔵",
            ColorBand::Green => "🟢",
            ColorBand::Yellow => "🟡",
            ColorBand::Orange => "🟠",
            ColorBand::Red => "🔴",
        }
    }

    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            ColorBand::Purple => "Purple",
            ColorBand::Blue => "Blue",
            ColorBand::Green => "Green",
            ColorBand::Yellow => "Yellow",
            ColorBand::Orange => "Orange",
            ColorBand::Red => "Red",
        }
    }

    /// Lower edge of this band in percent, `None` for the lowest band.
    pub fn lower_edge_percent(self) -> Option<f64> {
        BAND_THRESHOLDS
            .iter()
            .find(|(_, band)| *band == self)
            .map(|(threshold, _)| f64::from(*threshold) / 100.0)
    }
}

/// Derived timer view: whether it ran out and how many seconds are left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerStatus {
    /// `true` iff `remaining <= 0`.
    pub expired: bool,
    /// Seconds left, clamped to `[0, duration]`.
    pub remaining: f64,
    /// Full length of the timer.
    pub duration: Duration,
}

impl TimerStatus {
    /// Band the timer is currently in.
    pub fn band(&self) -> ColorBand {
        band_for(self.remaining, self.duration)
    }
}

/// Seconds left on a timer of `duration` last reset at `last_click`.
///
/// A timer that was never clicked has its full duration left. A click stamped after `now`
/// (clock skew between writers) also yields the full duration instead of a negative elapsed time.
pub fn remaining(
    last_click: Option<OffsetDateTime>,
    duration: Duration,
    now: OffsetDateTime,
) -> f64 {
    let total = duration.as_secs_f64();
    let Some(last_click) = last_click else {
        return total;
    };
    let elapsed = (now - last_click).as_seconds_f64();
    if elapsed <= 0.0 {
        return total;
    }
    (total - elapsed).clamp(0.0, total)
}

/// Full timer status for the given inputs.
pub fn status(
    last_click: Option<OffsetDateTime>,
    duration: Duration,
    now: OffsetDateTime,
) -> TimerStatus {
    let remaining = remaining(last_click, duration, now);
    TimerStatus {
        expired: remaining <= 0.0,
        remaining,
        duration,
    }
}

/// Percentage of the duration still left. A zero duration counts as fully elapsed.
pub fn percent_left(remaining: f64, duration: Duration) -> f64 {
    let total = duration.as_secs_f64();
    if total <= 0.0 {
        return 0.0;
    }
    remaining.max(0.0) / total * 100.0
}

/// Band for the given remaining time. Each band includes its lower edge.
pub fn band_for(remaining: f64, duration: Duration) -> ColorBand {
    let total = duration.as_secs_f64();
    if total <= 0.0 {
        return ColorBand::Red;
    }
    let scaled = remaining.max(0.0) * BASIS_POINTS;
    BAND_THRESHOLDS
        .iter()
        .find(|(threshold, _)| scaled >= f64::from(*threshold) * total)
        .map(|(_, band)| *band)
        .unwrap_or(ColorBand::Red)
}

/// Seconds until the timer drops into the next lower band, `None` once it is in the lowest.
pub fn time_to_next_band(remaining: f64, duration: Duration) -> Option<f64> {
    let band = band_for(remaining, duration);
    let (edge, _) = BAND_THRESHOLDS.iter().find(|(_, candidate)| *candidate == band)?;
    let edge_secs = duration.as_secs_f64() * f64::from(*edge) / BASIS_POINTS;
    Some((remaining - edge_secs).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_DAY: Duration = Duration::from_secs(43_200);

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[test]
    fn never_clicked_timer_has_full_duration() {
        let status = status(None, HALF_DAY, at(1_000));
        assert_eq!(status.remaining, 43_200.0);
        assert!(!status.expired);
    }

    #[test]
    fn half_elapsed_timer_lands_on_green_edge() {
        let now = at(1_700_000_000);
        let last = at(1_700_000_000 - 21_600);
        let status = status(Some(last), HALF_DAY, now);
        assert_eq!(status.remaining, 21_600.0);
        assert_eq!(percent_left(status.remaining, HALF_DAY), 50.0);
        assert_eq!(band_for(status.remaining, HALF_DAY), ColorBand::Green);
    }

    #[test]
    fn click_in_the_future_is_not_negative_elapsed() {
        let status = status(Some(at(2_000)), HALF_DAY, at(1_000));
        assert_eq!(status.remaining, 43_200.0);
        assert!(!status.expired);
    }

    #[test]
    fn expired_iff_remaining_is_zero() {
        let exact = status(Some(at(0)), Duration::from_secs(60), at(60));
        assert_eq!(exact.remaining, 0.0);
        assert!(exact.expired);

        let late = status(Some(at(0)), Duration::from_secs(60), at(600));
        assert_eq!(late.remaining, 0.0);
        assert!(late.expired);

        let early = status(Some(at(0)), Duration::from_secs(60), at(59));
        assert_eq!(early.remaining, 1.0);
        assert!(!early.expired);
    }

    #[test]
    fn zero_duration_is_expired_and_red() {
        let status = status(None, Duration::ZERO, at(0));
        assert!(status.expired);
        assert_eq!(band_for(status.remaining, Duration::ZERO), ColorBand::Red);
    }

    #[test]
    fn band_edges_are_inclusive_on_the_lower_side() {
        let duration = Duration::from_secs(10_000);
        assert_eq!(band_for(10_000.0, duration), ColorBand::Purple);
        assert_eq!(band_for(8_333.0, duration), ColorBand::Purple);
        assert_eq!(band_for(8_332.9, duration), ColorBand::Blue);
        assert_eq!(band_for(6_667.0, duration), ColorBand::Blue);
        assert_eq!(band_for(6_666.9, duration), ColorBand::Green);
        assert_eq!(band_for(5_000.0, duration), ColorBand::Green);
        assert_eq!(band_for(4_999.9, duration), ColorBand::Yellow);
        assert_eq!(band_for(3_333.0, duration), ColorBand::Yellow);
        assert_eq!(band_for(3_332.9, duration), ColorBand::Orange);
        assert_eq!(band_for(1_667.0, duration), ColorBand::Orange);
        assert_eq!(band_for(1_666.9, duration), ColorBand::Red);
        assert_eq!(band_for(0.0, duration), ColorBand::Red);
    }

    #[test]
    fn bands_never_increase_as_time_runs_out() {
        for duration_secs in [1_u64, 7, 60, 3_600, 43_200, 86_400] {
            let duration = Duration::from_secs(duration_secs);
            let steps = 2_000;
            let mut previous = ColorBand::Purple;
            for step in (0..=steps).rev() {
                let remaining = duration.as_secs_f64() * step as f64 / steps as f64;
                let band = band_for(remaining, duration);
                assert!(
                    band <= previous,
                    "band rose from {previous:?} to {band:?} at {remaining}/{duration_secs}"
                );
                previous = band;
            }
            assert_eq!(previous, ColorBand::Red);
        }
    }

    #[test]
    fn time_to_next_band_counts_down_to_the_lower_edge() {
        let duration = Duration::from_secs(10_000);
        let next = time_to_next_band(9_000.0, duration).unwrap();
        assert!((next - 667.0).abs() < 1e-6);
        let next = time_to_next_band(5_000.0, duration).unwrap();
        assert!(next.abs() < 1e-6);
        assert_eq!(time_to_next_band(1_000.0, duration), None);
    }

    #[test]
    fn every_band_has_distinct_presentation() {
        let mut emojis: Vec<_> = ColorBand::ALL.iter().map(|band| band.emoji()).collect();
        emojis.dedup();
        assert_eq!(emojis.len(), 6);
        assert_eq!(ColorBand::Green.label(), "Green");
        assert_eq!(ColorBand::Red.lower_edge_percent(), None);
        assert_eq!(ColorBand::Green.lower_edge_percent(), Some(50.0));
    }
}
