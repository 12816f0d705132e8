use crate::condition::{Condition, Logic, Predicate, Section};
use chrono::{DateTime, Utc};
use core_types::{IndicatorBoard, SectionId};
use serde::Serialize;

/// Per-condition memory kept between evaluations: duration timers and
/// sequence cursors. Mirrors the shape of the condition it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionState {
    Threshold,
    /// `held_seconds` is the true-time accumulated so far; `last_seen` is the
    /// previous observation and whether the predicate held then.
    Duration {
        held_seconds: f64,
        last_seen: Option<(DateTime<Utc>, bool)>,
    },
    Sequence {
        cursor: usize,
        last_step_at: Option<DateTime<Utc>>,
        steps: Vec<ConditionState>,
    },
}

impl ConditionState {
    pub fn for_condition(condition: &Condition) -> Self {
        match condition {
            Condition::Threshold(_) => Self::Threshold,
            Condition::Duration { .. } => Self::Duration { held_seconds: 0.0, last_seen: None },
            Condition::Sequence { steps, .. } => Self::Sequence {
                cursor: 0,
                last_step_at: None,
                steps: steps.iter().map(Self::for_condition).collect(),
            },
        }
    }

    fn matches(&self, condition: &Condition) -> bool {
        match (self, condition) {
            (Self::Threshold, Condition::Threshold(_)) => true,
            (Self::Duration { .. }, Condition::Duration { .. }) => true,
            (Self::Sequence { steps: states, .. }, Condition::Sequence { steps, .. }) => {
                states.len() == steps.len()
                    && states.iter().zip(steps).all(|(s, c)| s.matches(c))
            }
            _ => false,
        }
    }
}

/// Evaluation memory of one section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionState {
    conditions: Vec<ConditionState>,
}

impl SectionState {
    pub fn for_section(section: &Section) -> Self {
        Self {
            conditions: section.conditions.iter().map(ConditionState::for_condition).collect(),
        }
    }
}

/// What happened to a single condition during one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionDetail {
    pub index: usize,
    pub kind: &'static str,
    pub indicator: Option<String>,
    /// The indicator value that was compared, when there was one.
    pub observed: Option<f64>,
    pub satisfied: bool,
    pub note: Option<String>,
    /// Set when the condition could not be evaluated and was forced to false.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionOutcome {
    pub section: SectionId,
    pub result: bool,
    pub details: Vec<ConditionDetail>,
}

impl SectionOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &ConditionDetail> {
        self.details.iter().filter(|d| d.error.is_some())
    }
}

#[derive(Debug, Default)]
struct Verdict {
    satisfied: bool,
    observed: Option<f64>,
    note: Option<String>,
    error: Option<String>,
}

impl Verdict {
    fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Default::default() }
    }
}

/// Evaluates strategy sections against the latest indicator snapshots.
///
/// The evaluator holds no state of its own; timers and sequence progress live
/// in the [`SectionState`] passed by the caller. A condition that cannot be
/// evaluated counts as false and is reported in the outcome's details.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        section: &Section,
        state: &mut SectionState,
        board: &IndicatorBoard,
        now: DateTime<Utc>,
    ) -> SectionOutcome {
        if state.conditions.len() != section.conditions.len() {
            tracing::warn!(section = %section.id, "Section state does not match its conditions. Starting over.");
            *state = SectionState::for_section(section);
        }

        // Every condition is evaluated, even after the result is known, so
        // that duration timers and sequences see every tick.
        let details: Vec<ConditionDetail> = section
            .conditions
            .iter()
            .zip(state.conditions.iter_mut())
            .enumerate()
            .map(|(index, (condition, cond_state))| {
                let verdict = evaluate_condition(condition, cond_state, board, now);
                if let Some(error) = &verdict.error {
                    tracing::warn!(section = %section.id, index, kind = condition.kind(), error = %error, "Condition evaluation failed; treating it as false.");
                }
                ConditionDetail {
                    index,
                    kind: condition.kind(),
                    indicator: condition.indicator().map(str::to_string),
                    observed: verdict.observed,
                    satisfied: verdict.satisfied && verdict.error.is_none(),
                    note: verdict.note,
                    error: verdict.error,
                }
            })
            .collect();

        let result = !details.is_empty()
            && match section.logic {
                Logic::And => details.iter().all(|d| d.satisfied),
                Logic::Or => details.iter().any(|d| d.satisfied),
            };

        SectionOutcome { section: section.id, result, details }
    }
}

/// The predicate's truth value and the value it looked at. Missing
/// indicators are simply false; non-finite values are evaluation errors.
fn check_predicate(predicate: &Predicate, board: &IndicatorBoard) -> Result<(bool, Option<f64>), String> {
    let Some(value) = board.value(&predicate.indicator) else {
        return Ok((false, None));
    };
    if !value.is_finite() {
        return Err(format!("indicator '{}' has non-finite value {}", predicate.indicator, value));
    }
    if !predicate.value.is_finite() {
        return Err(format!("operand {} is not finite", predicate.value));
    }
    Ok((predicate.operator.apply(value, predicate.value), Some(value)))
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn evaluate_condition(
    condition: &Condition,
    state: &mut ConditionState,
    board: &IndicatorBoard,
    now: DateTime<Utc>,
) -> Verdict {
    if !state.matches(condition) {
        *state = ConditionState::for_condition(condition);
        return Verdict::failed("condition state was out of shape and has been reset");
    }

    match (condition, state) {
        (Condition::Threshold(predicate), ConditionState::Threshold) => {
            match check_predicate(predicate, board) {
                Ok((satisfied, observed)) => Verdict {
                    satisfied,
                    observed,
                    note: observed.is_none().then(|| "missing indicator".to_string()),
                    error: None,
                },
                Err(e) => Verdict::failed(e),
            }
        }

        (
            Condition::Duration { predicate, duration_seconds, reset_on_false },
            ConditionState::Duration { held_seconds, last_seen },
        ) => {
            if !duration_seconds.is_finite() || *duration_seconds <= 0.0 {
                return Verdict::failed(format!("duration {} is not a positive number", duration_seconds));
            }
            let (holds, observed, error) = match check_predicate(predicate, board) {
                Ok((holds, observed)) => (holds, observed, None),
                Err(e) => (false, None, Some(e)),
            };

            if !holds && *reset_on_false {
                *held_seconds = 0.0;
                *last_seen = None;
            } else {
                // An interval counts as held time when it starts or ends on a
                // true observation.
                if let Some((previous_at, previous_held)) = *last_seen {
                    if previous_held || holds {
                        *held_seconds += elapsed_seconds(previous_at, now);
                    }
                }
                *last_seen = Some((now, holds));
            }

            if holds {
                Verdict {
                    satisfied: *held_seconds >= *duration_seconds,
                    observed,
                    note: Some(format!("held {:.1}s of {:.1}s", held_seconds, duration_seconds)),
                    error,
                }
            } else {
                Verdict {
                    satisfied: false,
                    observed,
                    note: observed.is_none().then(|| "missing indicator".to_string()),
                    error,
                }
            }
        }

        (
            Condition::Sequence { steps, max_gap_seconds },
            ConditionState::Sequence { cursor, last_step_at, steps: step_states },
        ) => {
            if steps.is_empty() {
                return Verdict::failed("sequence has no steps");
            }

            let mut note = None;
            if let Some(last) = *last_step_at {
                if elapsed_seconds(last, now) > *max_gap_seconds {
                    note = Some(format!("gap after step {} exceeded {}s; restarting", cursor, max_gap_seconds));
                    *cursor = 0;
                    *last_step_at = None;
                    step_states.iter_mut().zip(steps).for_each(|(s, c)| *s = ConditionState::for_condition(c));
                }
            }

            let step = evaluate_condition(&steps[*cursor], &mut step_states[*cursor], board, now);
            if let Some(error) = step.error {
                return Verdict { observed: step.observed, ..Verdict::failed(format!("step {}: {}", cursor, error)) };
            }

            if !step.satisfied {
                return Verdict {
                    satisfied: false,
                    observed: step.observed,
                    note: note.or_else(|| Some(format!("waiting on step {}/{}", *cursor + 1, steps.len()))),
                    error: None,
                };
            }

            *cursor += 1;
            *last_step_at = Some(now);
            if *cursor < steps.len() {
                return Verdict {
                    satisfied: false,
                    observed: step.observed,
                    note: Some(format!("step {}/{} satisfied", *cursor, steps.len())),
                    error: None,
                };
            }

            // Completed: report once, then start over.
            *cursor = 0;
            *last_step_at = None;
            step_states.iter_mut().zip(steps).for_each(|(s, c)| *s = ConditionState::for_condition(c));
            Verdict {
                satisfied: true,
                observed: step.observed,
                note: Some("sequence completed".to_string()),
                error: None,
            }
        }

        // `matches` above rules this out.
        _ => Verdict::failed("condition state does not match condition kind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use chrono::TimeZone;
    use core_types::{IndicatorSnapshot, Symbol};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn predicate(indicator: &str, operator: Operator, value: f64) -> Predicate {
        Predicate { indicator: indicator.into(), operator, value }
    }

    fn section(logic: Logic, conditions: Vec<Condition>) -> Section {
        Section { id: SectionId::S1, logic, conditions }
    }

    fn board_with(values: &[(&str, f64)], secs: i64) -> IndicatorBoard {
        let mut board = IndicatorBoard::new();
        for (name, value) in values {
            board.publish(IndicatorSnapshot::new(Symbol::new("BTCUSDT"), *name, *value, at(secs), 1.0));
        }
        board
    }

    /// Feeds `samples` (one per second) into a single-condition section and
    /// returns the section result after each sample.
    fn run_samples(condition: Condition, samples: &[f64]) -> Vec<bool> {
        let section = section(Logic::And, vec![condition]);
        let mut state = SectionState::for_section(&section);
        let evaluator = ConditionEvaluator::new();
        samples
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let board = board_with(&[("pump_magnitude_pct", *value)], i as i64);
                evaluator.evaluate(&section, &mut state, &board, at(i as i64)).result
            })
            .collect()
    }

    fn duration(reset_on_false: bool) -> Condition {
        Condition::Duration {
            predicate: predicate("pump_magnitude_pct", Operator::Gt, 5.0),
            duration_seconds: 3.0,
            reset_on_false,
        }
    }

    #[test]
    fn threshold_uses_latest_snapshot() {
        let section = section(Logic::And, vec![Condition::Threshold(predicate("price", Operator::Ge, 100.0))]);
        let mut state = SectionState::for_section(&section);
        let evaluator = ConditionEvaluator::new();

        let mut board = board_with(&[("price", 99.0)], 0);
        assert!(!evaluator.evaluate(&section, &mut state, &board, at(0)).result);

        board.publish(IndicatorSnapshot::new(Symbol::new("BTCUSDT"), "price", 100.0, at(1), 1.0));
        let outcome = evaluator.evaluate(&section, &mut state, &board, at(1));
        assert!(outcome.result);
        assert_eq!(outcome.details[0].observed, Some(100.0));
    }

    #[test]
    fn missing_indicator_is_false_not_an_error() {
        let section = section(Logic::Or, vec![Condition::Threshold(predicate("spread_pct", Operator::Lt, 1.0))]);
        let mut state = SectionState::for_section(&section);
        let outcome = ConditionEvaluator::new().evaluate(&section, &mut state, &IndicatorBoard::new(), at(0));
        assert!(!outcome.result);
        assert_eq!(outcome.details[0].note.as_deref(), Some("missing indicator"));
        assert_eq!(outcome.errors().count(), 0);
    }

    #[test]
    fn non_finite_indicator_degrades_only_that_condition() {
        let section = section(
            Logic::Or,
            vec![
                Condition::Threshold(predicate("trade_rate", Operator::Gt, 1.0)),
                Condition::Threshold(predicate("price", Operator::Gt, 1.0)),
            ],
        );
        let mut state = SectionState::for_section(&section);
        let board = board_with(&[("trade_rate", f64::NAN), ("price", 2.0)], 0);
        let outcome = ConditionEvaluator::new().evaluate(&section, &mut state, &board, at(0));

        assert!(outcome.result);
        assert_eq!(outcome.errors().count(), 1);
        assert!(!outcome.details[0].satisfied);
    }

    #[test]
    fn duration_with_reset_never_fires_across_a_gap() {
        let results = run_samples(duration(true), &[6.0, 6.0, 1.0, 6.0, 6.0]);
        assert_eq!(results, vec![false; 5]);
    }

    #[test]
    fn duration_without_reset_fires_on_the_fourth_sample() {
        let results = run_samples(duration(false), &[6.0, 6.0, 1.0, 6.0, 6.0]);
        assert_eq!(results, vec![false, false, false, true, true]);
    }

    #[test]
    fn duration_without_reset_does_not_count_a_long_false_gap() {
        let section = section(Logic::And, vec![duration(false)]);
        let mut state = SectionState::for_section(&section);
        let evaluator = ConditionEvaluator::new();

        let results: Vec<bool> = [(0, 6.0), (1, 1.0), (100, 1.0), (101, 6.0), (102, 6.0)]
            .iter()
            .map(|(secs, value)| {
                let board = board_with(&[("pump_magnitude_pct", *value)], *secs);
                evaluator.evaluate(&section, &mut state, &board, at(*secs)).result
            })
            .collect();
        assert_eq!(results, vec![false, false, false, false, true]);
    }

    #[test]
    fn duration_fires_after_continuous_hold() {
        let results = run_samples(duration(true), &[6.0, 6.0, 6.0, 6.0]);
        assert_eq!(results, vec![false, false, false, true]);
    }

    fn dip_then_rip(max_gap_seconds: f64) -> Condition {
        Condition::Sequence {
            steps: vec![
                Condition::Threshold(predicate("pump_magnitude_pct", Operator::Lt, 0.0)),
                Condition::Threshold(predicate("pump_magnitude_pct", Operator::Gt, 2.0)),
            ],
            max_gap_seconds,
        }
    }

    #[test]
    fn sequence_requires_steps_in_order() {
        // Step two first does nothing; then dip, then rip.
        let results = run_samples(dip_then_rip(5.0), &[3.0, -1.0, 3.0]);
        assert_eq!(results, vec![false, false, true]);
    }

    #[test]
    fn sequence_restarts_after_a_gap_violation() {
        // dip at t=0, nothing until t=3 (gap 3 > 2) -> must dip again.
        let results = run_samples(dip_then_rip(2.0), &[-1.0, 1.0, 1.0, 3.0, -1.0, 3.0]);
        assert_eq!(results, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn sequence_restarts_after_completion() {
        let results = run_samples(dip_then_rip(5.0), &[-1.0, 3.0, 3.0, -1.0, 3.0]);
        assert_eq!(results, vec![false, true, false, false, true]);
    }

    #[test]
    fn and_or_combine_as_configured() {
        let conditions = vec![
            Condition::Threshold(predicate("price", Operator::Gt, 10.0)),
            Condition::Threshold(predicate("trade_rate", Operator::Gt, 10.0)),
        ];
        let board = board_with(&[("price", 11.0), ("trade_rate", 1.0)], 0);
        let evaluator = ConditionEvaluator::new();

        let and = section(Logic::And, conditions.clone());
        let or = section(Logic::Or, conditions);
        assert!(!evaluator.evaluate(&and, &mut SectionState::for_section(&and), &board, at(0)).result);
        assert!(evaluator.evaluate(&or, &mut SectionState::for_section(&or), &board, at(0)).result);
    }

    #[test]
    fn empty_section_is_false() {
        let empty = Section::empty(SectionId::O1);
        let outcome = ConditionEvaluator::new().evaluate(
            &empty,
            &mut SectionState::for_section(&empty),
            &board_with(&[("price", 1.0)], 0),
            at(0),
        );
        assert!(!outcome.result);
    }

    #[test]
    fn mismatched_state_is_rebuilt_instead_of_panicking() {
        let one = section(Logic::And, vec![duration(true)]);
        let two = section(Logic::And, vec![dip_then_rip(1.0), duration(true)]);
        let mut state = SectionState::for_section(&one);
        let outcome = ConditionEvaluator::new().evaluate(&two, &mut state, &IndicatorBoard::new(), at(0));
        assert_eq!(outcome.details.len(), 2);
        assert_eq!(state, SectionState::for_section(&two));
    }
}
