use std::str::FromStr;

use chrono::DateTime;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use super::state::MessageState;

/// Scheduling spec carried by a message: a one-shot delay, a cron
/// expression, a repeat count with an optional period, or a combination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSchedule {
    /// One-shot delay before first delivery, in milliseconds.
    pub delay_ms: u64,
    /// Cron expression (seconds granularity, `cron` crate syntax).
    pub cron: Option<String>,
    /// Number of extra occurrences beyond the triggering one.
    pub repeat: u32,
    /// Gap between repeat occurrences, in milliseconds.
    pub repeat_period_ms: u64,
}

impl MessageSchedule {
    pub fn is_set(&self) -> bool {
        self.delay_ms > 0 || self.cron.is_some() || self.repeat > 0
    }

    /// Periodic schedules re-arm after each firing and spawn descendant
    /// messages; a bare one-shot delay does not.
    pub fn is_periodic(&self) -> bool {
        self.cron.is_some() || self.repeat > 0
    }

    /// Validate the cron expression, if any.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(expr) = &self.cron {
            Schedule::from_str(expr).map_err(|e| format!("invalid cron expression: {e}"))?;
        }
        Ok(())
    }

    fn next_cron_after(&self, now_ms: u64) -> Option<u64> {
        let expr = self.cron.as_deref()?;
        let schedule = Schedule::from_str(expr).ok()?;
        let now = DateTime::from_timestamp_millis(now_ms as i64)?;
        schedule
            .after(&now)
            .next()
            .map(|dt| dt.timestamp_millis() as u64)
    }
}

/// Compute the next fire timestamp for a message, mutating `state` as a side
/// effect (repeat counter, cron-fired flag, one-shot delay consumption).
///
/// Precedence:
/// 1. Repeat occurrences, but only once the cron (if any) has fired at least
///    once — repeat runs *within* cron windows, not before the first one.
/// 2. The cron expression itself, which resets the repeat counter so each
///    cron window gets a fresh repeat budget.
/// 3. The one-shot effective delay, consumed via the single-use getter.
///
/// Returns `None` when the message has no further occurrence.
pub fn next_occurrence(
    schedule: &MessageSchedule,
    state: &mut MessageState,
    now_ms: u64,
) -> Option<u64> {
    if schedule.is_periodic() {
        let cron_ts = schedule.next_cron_after(now_ms);

        let mut repeat_ts = None;
        if schedule.repeat > 0 && state.repeat_count < schedule.repeat {
            repeat_ts = Some(now_ms + schedule.repeat_period_ms);
        }

        if cron_ts.is_some() && repeat_ts.is_some() && !state.cron_fired {
            // Repeat budget only opens after the first cron firing.
            repeat_ts = None;
            state.repeat_count = 0;
        }

        if let Some(ts) = repeat_ts {
            state.repeat_count += 1;
            return Some(ts);
        }

        if let Some(ts) = cron_ts {
            state.cron_fired = true;
            state.repeat_count = 0;
            return Some(ts);
        }

        return None;
    }

    let delay = state.take_scheduled_delay();
    if delay > 0 {
        return Some(now_ms + delay);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_delay_consumed_once() {
        let schedule = MessageSchedule {
            delay_ms: 2_000,
            ..Default::default()
        };
        let mut state = MessageState::new();
        state.set_scheduled_delay(schedule.delay_ms);

        assert_eq!(next_occurrence(&schedule, &mut state, 10_000), Some(12_000));
        // Delay was consumed; no further occurrence.
        assert_eq!(next_occurrence(&schedule, &mut state, 20_000), None);
    }

    #[test]
    fn repeat_with_period_until_budget_exhausted() {
        let schedule = MessageSchedule {
            repeat: 2,
            repeat_period_ms: 1_000,
            ..Default::default()
        };
        let mut state = MessageState::new();

        assert_eq!(next_occurrence(&schedule, &mut state, 10_000), Some(11_000));
        assert_eq!(state.repeat_count, 1);
        assert_eq!(next_occurrence(&schedule, &mut state, 11_000), Some(12_000));
        assert_eq!(state.repeat_count, 2);
        assert_eq!(next_occurrence(&schedule, &mut state, 12_000), None);
    }

    #[test]
    fn cron_fires_before_repeat_budget_opens() {
        let schedule = MessageSchedule {
            cron: Some("0 * * * * *".to_string()),
            repeat: 3,
            repeat_period_ms: 1_000,
            ..Default::default()
        };
        let mut state = MessageState::new();

        // First computation: cron wins, repeat suppressed.
        let first = next_occurrence(&schedule, &mut state, 0).unwrap();
        assert_eq!(first, 60_000);
        assert!(state.cron_fired);
        assert_eq!(state.repeat_count, 0);

        // Cron has fired: repeats now run within the window.
        let second = next_occurrence(&schedule, &mut state, first).unwrap();
        assert_eq!(second, first + 1_000);
        assert_eq!(state.repeat_count, 1);
    }

    #[test]
    fn invalid_cron_rejected() {
        let schedule = MessageSchedule {
            cron: Some("not a cron".to_string()),
            ..Default::default()
        };
        assert!(schedule.validate().is_err());
    }
}
