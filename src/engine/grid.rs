use crate::limits::MIN_SLOT_GAP_MINUTES;
use crate::time::{Minutes, TimeOfDay};

use super::ConfigError;

/// Every `t` with `opening <= t` and `t + gap <= closing`, stepping by `gap`.
///
/// `gap_minutes` is clamped to [`MIN_SLOT_GAP_MINUTES`].
pub fn build_grid(
    opening: TimeOfDay,
    closing: TimeOfDay,
    gap_minutes: Minutes,
) -> Result<Vec<TimeOfDay>, ConfigError> {
    if opening >= closing {
        return Err(ConfigError::InvertedHours { opening, closing });
    }
    let gap = gap_minutes.max(MIN_SLOT_GAP_MINUTES);
    let close = closing.minutes();

    let mut slots = Vec::with_capacity(((close - opening.minutes()) / gap) as usize);
    let mut t = opening.minutes();
    while t.checked_add(gap).is_some_and(|end| end <= close) {
        slots.push(TimeOfDay::saturating(t));
        t += gap;
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn nine_to_six_every_fifteen() {
        let grid = build_grid(t("09:00"), t("18:00"), 15).unwrap();
        assert_eq!(grid.len(), 36);
        assert_eq!(grid.first(), Some(&t("09:00")));
        assert_eq!(grid.last(), Some(&t("17:45")));
        assert!(grid.windows(2).all(|w| w[1].minutes() - w[0].minutes() == 15));
    }

    #[test]
    fn inverted_or_empty_hours_fail() {
        assert!(matches!(
            build_grid(t("18:00"), t("09:00"), 15),
            Err(ConfigError::InvertedHours { .. })
        ));
        assert!(build_grid(t("09:00"), t("09:00"), 15).is_err());
    }

    #[test]
    fn gap_is_clamped() {
        let grid = build_grid(t("09:00"), t("10:00"), 0).unwrap();
        assert_eq!(grid.len(), 12);
        let grid = build_grid(t("09:00"), t("10:00"), 1).unwrap();
        assert_eq!(grid.len(), 12);
    }

    #[test]
    fn trailing_partial_slot_dropped() {
        let grid = build_grid(t("09:00"), t("10:10"), 20).unwrap();
        assert_eq!(grid, vec![t("09:00"), t("09:20"), t("09:40")]);
    }

    #[test]
    fn gap_longer_than_day_yields_nothing() {
        let grid = build_grid(t("09:00"), t("09:30"), 60).unwrap();
        assert!(grid.is_empty());
    }

    #[test]
    fn huge_gap_yields_nothing() {
        let grid = build_grid(t("09:00"), t("18:00"), Minutes::MAX).unwrap();
        assert!(grid.is_empty());
    }

    #[test]
    fn runs_to_midnight() {
        let grid = build_grid(t("23:00"), t("24:00"), 30).unwrap();
        assert_eq!(grid, vec![t("23:00"), t("23:30")]);
    }
}
