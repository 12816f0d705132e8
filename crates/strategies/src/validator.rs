use crate::condition::{Condition, Logic, Operator, Predicate, Section, StrategyDefinition};
use crate::error::{Error, Result, ValidationFailure, ValidationIssue};
use crate::schema::{RawCondition, RawSection, RawStrategy};
use core_types::{SectionId, indicators};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Sequences may contain sequences, but only this deep.
pub const MAX_SEQUENCE_DEPTH: usize = 4;

/// SHA-256 of a payload, hex encoded.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The fingerprint of a raw strategy's canonical JSON form.
pub fn fingerprint_raw(raw: &RawStrategy) -> String {
    match serde_json::to_vec(raw) {
        Ok(bytes) => fingerprint(&bytes),
        Err(_) => fingerprint(raw.id.as_bytes()),
    }
}

/// Checks raw strategies against the indicator and operator allowlists and
/// turns them into [`StrategyDefinition`]s.
#[derive(Debug, Clone)]
pub struct StrategyValidator {
    allowed_indicators: BTreeSet<String>,
}

impl Default for StrategyValidator {
    fn default() -> Self {
        Self::new(indicators::BUILTIN)
    }
}

impl StrategyValidator {
    pub fn new<I, S>(allowed_indicators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_indicators: allowed_indicators.into_iter().map(Into::into).collect(),
        }
    }

    /// Uses `allowed` when it is non-empty, the built-in indicators otherwise.
    pub fn from_allowlist(allowed: &[String]) -> Self {
        if allowed.is_empty() {
            Self::default()
        } else {
            Self::new(allowed.iter().cloned())
        }
    }

    pub fn allows_indicator(&self, name: &str) -> bool {
        self.allowed_indicators.contains(name)
    }

    /// Parses and validates a JSON payload.
    pub fn validate_json(&self, payload: &str) -> Result<StrategyDefinition> {
        let raw = RawStrategy::from_json(payload).inspect_err(|e| {
            tracing::warn!(fingerprint = %fingerprint(payload.as_bytes()), error = %e, "Rejected unparseable strategy payload.");
        })?;
        self.validate(&raw)
    }

    /// Validates a raw strategy. All issues are collected before rejecting.
    pub fn validate(&self, raw: &RawStrategy) -> Result<StrategyDefinition> {
        let fingerprint = fingerprint_raw(raw);
        let mut issues = Vec::new();

        if raw.id.trim().is_empty() {
            issue(&mut issues, "id", "must not be empty");
        }

        let mut sections = BTreeMap::new();
        let raw_sections = [
            (SectionId::S1, &raw.s1_signal),
            (SectionId::O1, &raw.o1_cancel),
            (SectionId::Z1, &raw.z1_entry),
            (SectionId::Ze1, &raw.ze1_close),
            (SectionId::E1, &raw.emergency_exit),
        ];
        for (id, section) in raw_sections {
            if let Some(section) = section {
                if let Some(section) = self.section(id, section, &mut issues) {
                    sections.insert(id, section);
                }
            }
        }

        let non_empty = |id: SectionId| sections.get(&id).is_some_and(|s: &Section| !s.is_empty());
        for id in [SectionId::S1, SectionId::Z1] {
            if !non_empty(id) && !issues.iter().any(|i| i.path.starts_with(id.wire_name())) {
                issue(&mut issues, id.wire_name(), "must contain at least one condition");
            }
        }
        if !non_empty(SectionId::Ze1) && !non_empty(SectionId::E1) {
            issue(
                &mut issues,
                "ze1_close|emergency_exit",
                "at least one exit section must contain a condition",
            );
        }

        if !issues.is_empty() {
            let failure = ValidationFailure {
                strategy_id: raw.id.clone(),
                fingerprint,
                issues,
            };
            tracing::warn!(
                strategy_id = %failure.strategy_id,
                fingerprint = %failure.fingerprint,
                issues = failure.issues.len(),
                "Rejected strategy: {}",
                failure
            );
            return Err(Error::Validation(failure));
        }

        tracing::debug!(strategy_id = %raw.id, fingerprint = %fingerprint, "Strategy validated.");
        Ok(StrategyDefinition::new(
            raw.id.clone(),
            raw.name.clone(),
            raw.description.clone(),
            fingerprint,
            sections,
        ))
    }

    fn section(
        &self,
        id: SectionId,
        raw: &RawSection,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Section> {
        let path = id.wire_name();
        let logic = match raw.logic.as_deref() {
            Some(name) => match Logic::from_name(name) {
                Some(logic) => Some(logic),
                None => {
                    issue(issues, &format!("{}.logic", path), &format!("unknown logical operator '{}'", name));
                    None
                }
            },
            None => {
                issue(issues, &format!("{}.logic", path), "is required (AND or OR)");
                None
            }
        };

        let conditions: Vec<_> = raw
            .conditions
            .iter()
            .enumerate()
            .map(|(i, c)| self.condition(c, &format!("{}.conditions[{}]", path, i), 0, issues))
            .collect();

        let logic = logic?;
        let conditions = conditions.into_iter().collect::<Option<Vec<_>>>()?;
        Some(Section { id, logic, conditions })
    }

    fn condition(
        &self,
        raw: &RawCondition,
        path: &str,
        depth: usize,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Condition> {
        let Some(kind) = raw.kind.as_deref() else {
            issue(issues, &format!("{}.kind", path), "is required");
            return None;
        };

        match kind {
            "threshold" => {
                let predicate = self.predicate(raw, path, issues);
                forbid(raw.steps.is_some(), path, "steps", kind, issues);
                forbid(raw.duration_seconds.is_some(), path, "duration_seconds", kind, issues);
                predicate.map(Condition::Threshold)
            }
            "duration" => {
                let predicate = self.predicate(raw, path, issues);
                let duration_seconds = positive(raw.duration_seconds, &format!("{}.duration_seconds", path), issues);
                let reset_on_false = match raw.reset_on_false {
                    Some(flag) => Some(flag),
                    None => {
                        issue(
                            issues,
                            &format!("{}.reset_on_false", path),
                            "must be set explicitly (true or false)",
                        );
                        None
                    }
                };
                forbid(raw.steps.is_some(), path, "steps", kind, issues);
                Some(Condition::Duration {
                    predicate: predicate?,
                    duration_seconds: duration_seconds?,
                    reset_on_false: reset_on_false?,
                })
            }
            "sequence" => {
                if depth >= MAX_SEQUENCE_DEPTH {
                    issue(issues, path, &format!("sequences nest deeper than {} levels", MAX_SEQUENCE_DEPTH));
                    return None;
                }
                let max_gap_seconds = positive(raw.max_gap_seconds, &format!("{}.max_gap_seconds", path), issues);
                let steps = match raw.steps.as_deref() {
                    Some([]) | None => {
                        issue(issues, &format!("{}.steps", path), "must contain at least one step");
                        None
                    }
                    Some(steps) => steps
                        .iter()
                        .enumerate()
                        .map(|(i, step)| {
                            self.condition(step, &format!("{}.steps[{}]", path, i), depth + 1, issues)
                        })
                        .collect::<Vec<_>>()
                        .into_iter()
                        .collect::<Option<Vec<_>>>(),
                };
                forbid(raw.indicator.is_some(), path, "indicator", kind, issues);
                Some(Condition::Sequence {
                    steps: steps?,
                    max_gap_seconds: max_gap_seconds?,
                })
            }
            other => {
                issue(issues, &format!("{}.kind", path), &format!("unknown condition kind '{}'", other));
                None
            }
        }
    }

    fn predicate(
        &self,
        raw: &RawCondition,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Predicate> {
        let indicator = match raw.indicator.as_deref() {
            Some(name) if self.allows_indicator(name) => Some(name.to_string()),
            Some(name) => {
                issue(issues, &format!("{}.indicator", path), &format!("indicator '{}' is not allowed", name));
                None
            }
            None => {
                issue(issues, &format!("{}.indicator", path), "is required");
                None
            }
        };
        let operator = match raw.operator.as_deref() {
            Some(symbol) => {
                let op = Operator::from_symbol(symbol);
                if op.is_none() {
                    issue(issues, &format!("{}.operator", path), &format!("operator '{}' is not allowed", symbol));
                }
                op
            }
            None => {
                issue(issues, &format!("{}.operator", path), "is required");
                None
            }
        };
        let value = match raw.value {
            Some(v) if v.is_finite() => Some(v),
            Some(_) => {
                issue(issues, &format!("{}.value", path), "must be a finite number");
                None
            }
            None => {
                issue(issues, &format!("{}.value", path), "is required");
                None
            }
        };
        Some(Predicate {
            indicator: indicator?,
            operator: operator?,
            value: value?,
        })
    }
}

fn issue(issues: &mut Vec<ValidationIssue>, path: &str, message: &str) {
    issues.push(ValidationIssue {
        path: path.to_string(),
        message: message.to_string(),
    });
}

fn forbid(present: bool, path: &str, field: &str, kind: &str, issues: &mut Vec<ValidationIssue>) {
    if present {
        issue(issues, &format!("{}.{}", path, field), &format!("is not valid on a {} condition", kind));
    }
}

fn positive(value: Option<f64>, path: &str, issues: &mut Vec<ValidationIssue>) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Some(v),
        Some(_) => {
            issue(issues, path, "must be a positive number of seconds");
            None
        }
        None => {
            issue(issues, path, "is required");
            None
        }
    }
}
