// =============================================================================
// Shift Schedule — wall-clock shift windows
// =============================================================================
//
// Shifts are named, half-open intervals of local wall time that partition
// the 24-hour day; `end_hour == 0` means midnight of the next day. All
// resolution happens in a caller-supplied timezone (the host timezone in
// production, a fixed offset in tests) and the returned boundaries are UTC.
// =============================================================================

pub mod calculator;
pub mod engine;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};

use crate::config::ShiftDef;

/// Name reported when no configured shift covers an instant.
pub const UNSCHEDULED: &str = "Unscheduled";

/// A resolved shift occurrence with UTC boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftWindow {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The static shift table, resolved against arbitrary instants.
#[derive(Debug, Clone)]
pub struct ShiftSchedule {
    shifts: Vec<ShiftDef>,
}

impl ShiftSchedule {
    pub fn new(shifts: Vec<ShiftDef>) -> Self {
        Self { shifts }
    }

    /// The shift containing `now` (start inclusive, end exclusive). Falls
    /// back to an 8-hour "Unscheduled" block centred on the current hour
    /// when the table has a gap.
    pub fn current_shift<Tz: TimeZone>(&self, now: DateTime<Utc>, tz: &Tz) -> ShiftWindow {
        if let Some(window) = self.window_containing(now, tz) {
            return window;
        }

        let hour_floor = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        ShiftWindow {
            name: UNSCHEDULED.to_string(),
            start: hour_floor - Duration::hours(4),
            end: hour_floor + Duration::hours(4),
        }
    }

    /// The shift containing the instant one second before the current
    /// shift's start. Falls back to the 8 hours preceding the current
    /// shift.
    pub fn previous_shift<Tz: TimeZone>(&self, now: DateTime<Utc>, tz: &Tz) -> ShiftWindow {
        let current = self.current_shift(now, tz);
        let probe = current.start - Duration::seconds(1);

        if let Some(window) = self.window_containing(probe, tz) {
            return window;
        }

        ShiftWindow {
            name: UNSCHEDULED.to_string(),
            start: current.start - Duration::hours(8),
            end: current.start,
        }
    }

    fn window_containing<Tz: TimeZone>(
        &self,
        instant: DateTime<Utc>,
        tz: &Tz,
    ) -> Option<ShiftWindow> {
        let local = instant.with_timezone(tz);
        let date = local.date_naive();

        for shift in &self.shifts {
            let start_naive = date.and_time(NaiveTime::from_hms_opt(shift.start_hour, 0, 0)?);
            let end_naive = if shift.end_hour == 0 {
                date.succ_opt()?.and_time(NaiveTime::from_hms_opt(0, 0, 0)?)
            } else {
                date.and_time(NaiveTime::from_hms_opt(shift.end_hour, 0, 0)?)
            };

            // `earliest` resolves DST ambiguity deterministically.
            let Some(start_local) = tz.from_local_datetime(&start_naive).earliest() else {
                continue;
            };
            let Some(end_local) = tz.from_local_datetime(&end_naive).earliest() else {
                continue;
            };

            if start_local <= local && local < end_local {
                return Some(ShiftWindow {
                    name: shift.name.clone(),
                    start: start_local.with_timezone(&Utc),
                    end: end_local.with_timezone(&Utc),
                });
            }
        }

        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn schedule() -> ShiftSchedule {
        ShiftSchedule::new(vec![
            ShiftDef { name: "shift_1".into(), start_hour: 8, end_hour: 16 },
            ShiftDef { name: "shift_2".into(), start_hour: 16, end_hour: 0 },
            ShiftDef { name: "shift_3".into(), start_hour: 0, end_hour: 8 },
        ])
    }

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        chrono::TimeZone::with_ymd_and_hms(&Utc, y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn current_shift_resolves_local_morning() {
        // 09:00 local (+07:00) = 02:00 UTC, inside shift_1 (08:00-16:00).
        let now = utc(2025, 7, 14, 2, 0);
        let window = schedule().current_shift(now, &tz());

        assert_eq!(window.name, "shift_1");
        assert_eq!(window.start, utc(2025, 7, 14, 1, 0));
        assert_eq!(window.end, utc(2025, 7, 14, 9, 0));
    }

    #[test]
    fn midnight_ending_shift_spans_to_next_day() {
        // 23:00 local = 16:00 UTC, inside shift_2 (16:00-00:00 local).
        let now = utc(2025, 7, 14, 16, 0);
        let window = schedule().current_shift(now, &tz());

        assert_eq!(window.name, "shift_2");
        assert_eq!(window.start, utc(2025, 7, 14, 9, 0));
        // Midnight local on the 15th = 17:00 UTC on the 14th.
        assert_eq!(window.end, utc(2025, 7, 14, 17, 0));
    }

    #[test]
    fn shift_boundaries_are_half_open() {
        // Exactly 16:00 local belongs to shift_2, not shift_1.
        let now = utc(2025, 7, 14, 9, 0);
        let window = schedule().current_shift(now, &tz());
        assert_eq!(window.name, "shift_2");
    }

    #[test]
    fn previous_shift_wraps_across_midnight() {
        // 01:00 local is shift_3; the previous shift is yesterday's
        // shift_2.
        let now = utc(2025, 7, 13, 18, 0);
        let schedule = schedule();

        let current = schedule.current_shift(now, &tz());
        assert_eq!(current.name, "shift_3");

        let previous = schedule.previous_shift(now, &tz());
        assert_eq!(previous.name, "shift_2");
        assert_eq!(previous.end, current.start);
        assert_eq!(previous.start, utc(2025, 7, 13, 9, 0));
    }

    #[test]
    fn gap_in_table_falls_back_to_unscheduled() {
        let sparse = ShiftSchedule::new(vec![ShiftDef {
            name: "day".into(),
            start_hour: 8,
            end_hour: 16,
        }]);
        // 20:30 local is uncovered.
        let now = utc(2025, 7, 14, 13, 30);
        let window = sparse.current_shift(now, &tz());

        assert_eq!(window.name, UNSCHEDULED);
        assert_eq!(window.start, utc(2025, 7, 14, 9, 0));
        assert_eq!(window.end, utc(2025, 7, 14, 17, 0));
        assert_eq!(window.end - window.start, Duration::hours(8));
    }

    #[test]
    fn shifts_partition_the_whole_day() {
        let schedule = schedule();
        for hour in 0..24 {
            let now = utc(2025, 7, 14, hour, 30);
            let window = schedule.current_shift(now, &tz());
            assert_ne!(window.name, UNSCHEDULED, "hour {hour} uncovered");
            assert!(window.start <= now && now < window.end);
        }
    }
}
