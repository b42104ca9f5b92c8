//! Timer arming and a minimal ISO-8601 duration/date/cycle parser.
//! Durations are hand-parsed since no dependency already covers them;
//! `chrono` covers the date/rfc3339 half.

use crate::error::{EngineError, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::state::StateManager;
use crate::types::{InstanceId, NodeId, TimerState, TimerType};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct TimerManager {
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
}

impl TimerManager {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn arm(
        &self,
        instance_id: InstanceId,
        node_id: NodeId,
        timer_type: TimerType,
        definition: &str,
        activity_id: Option<String>,
        interrupting: bool,
        token_data: BTreeMap<String, serde_json::Value>,
    ) -> Result<TimerState> {
        let start_time = Utc::now();
        let end_time = match timer_type {
            TimerType::Duration => start_time + parse_duration(definition)?,
            TimerType::Date => parse_date(definition)?,
            TimerType::Cycle => start_time + parse_cycle(definition)?.1,
        };
        let timer = TimerState {
            timer_id: Uuid::now_v7().to_string(),
            instance_id,
            node_id: node_id.clone(),
            timer_type,
            definition: definition.to_string(),
            start_time,
            end_time,
            token_data,
            activity_id,
            interrupting,
        };
        self.store.save_timer(&timer).await?;
        self.events.publish(
            "process.timer_armed",
            RuntimeEvent::TimerArmed {
                timer_id: timer.timer_id.clone(),
                node_id,
                fires_at: end_time,
            },
        );
        Ok(timer)
    }

    /// Pull every timer due by `now`, deleting each as it's returned — callers
    /// (the executor's tick loop) are responsible for moving the associated
    /// token. A timer whose definition is a repeating cycle is re-armed by
    /// the caller if iterations remain.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<TimerState>> {
        let due = self.store.due_timers(now).await?;
        for timer in &due {
            self.store.delete_timer(&timer.timer_id).await?;
            self.events.publish(
                "process.timer_triggered",
                RuntimeEvent::TimerFired {
                    timer_id: timer.timer_id.clone(),
                    node_id: timer.node_id.clone(),
                },
            );
        }
        Ok(due)
    }

    pub async fn cancel(&self, timer_id: &str) -> Result<()> {
        self.store.delete_timer(timer_id).await
    }
}

/// Parse the duration half of `PnYnMnDTnHnMnS` (ISO-8601). Only the
/// components BPMN timers actually use show up in practice (`PT5M`, `P1D`);
/// unsupported designators are rejected with `TIMER_INVALID`.
pub fn parse_duration(expr: &str) -> Result<Duration> {
    let s = expr.trim();
    let s = s
        .strip_prefix('P')
        .ok_or_else(|| EngineError::TimerInvalid(expr.to_string()))?;

    let (date_part, time_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let mut total = Duration::zero();
    total = total + parse_designators(date_part, &[('Y', 365 * 24 * 3600), ('M', 30 * 24 * 3600), ('D', 24 * 3600)], expr)?;
    if let Some(t) = time_part {
        total = total + parse_designators(t, &[('H', 3600), ('M', 60), ('S', 1)], expr)?;
    }
    if total <= Duration::zero() {
        return Err(EngineError::TimerInvalid(expr.to_string()));
    }
    Ok(total)
}

fn parse_designators(part: &str, designators: &[(char, i64); 3], original: &str) -> Result<Duration> {
    let mut total = Duration::zero();
    let mut num = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let value: f64 = num.parse().map_err(|_| EngineError::TimerInvalid(original.to_string()))?;
        num.clear();
        let seconds_per_unit = designators
            .iter()
            .find(|(d, _)| *d == c)
            .map(|(_, secs)| *secs)
            .ok_or_else(|| EngineError::TimerInvalid(original.to_string()))?;
        total = total + Duration::milliseconds((value * seconds_per_unit as f64 * 1000.0) as i64);
    }
    if !num.is_empty() {
        return Err(EngineError::TimerInvalid(original.to_string()));
    }
    Ok(total)
}

pub fn parse_date(expr: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(expr.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EngineError::TimerInvalid(expr.to_string()))
}

/// Parse `R<n>/<duration>` (or `R/<duration>` for unbounded repeats).
/// Returns `(repeat_count, interval)`.
pub fn parse_cycle(expr: &str) -> Result<(Option<u32>, Duration)> {
    let rest = expr
        .trim()
        .strip_prefix('R')
        .ok_or_else(|| EngineError::TimerInvalid(expr.to_string()))?;
    let (count_part, duration_part) = rest.split_once('/').ok_or_else(|| EngineError::TimerInvalid(expr.to_string()))?;
    let count = if count_part.is_empty() {
        None
    } else {
        Some(count_part.parse::<u32>().map_err(|_| EngineError::TimerInvalid(expr.to_string()))?)
    };
    let interval = parse_duration(duration_part)?;
    Ok((count, interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_duration() {
        let d = parse_duration("PT5M").unwrap();
        assert_eq!(d.num_seconds(), 300);
    }

    #[test]
    fn parses_combined_duration() {
        let d = parse_duration("P1DT2H").unwrap();
        assert_eq!(d.num_seconds(), 24 * 3600 + 2 * 3600);
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(parse_duration("5M").is_err());
        assert!(parse_duration("PT").is_err());
    }

    #[test]
    fn parses_bounded_cycle() {
        let (count, interval) = parse_cycle("R3/PT1S").unwrap();
        assert_eq!(count, Some(3));
        assert_eq!(interval.num_seconds(), 1);
    }

    #[test]
    fn parses_unbounded_cycle() {
        let (count, _) = parse_cycle("R/PT1H").unwrap();
        assert_eq!(count, None);
    }
}
