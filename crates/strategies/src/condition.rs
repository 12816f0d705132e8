use crate::schema::{RawCondition, RawSection, RawStrategy};
use core_types::SectionId;
use std::collections::BTreeMap;
use std::fmt;

/// Comparison applied between an indicator value and a condition's operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Gt,
    Lt,
    Eq,
    Ge,
    Le,
}

impl Operator {
    pub const ALL: [Operator; 5] = [Self::Gt, Self::Lt, Self::Eq, Self::Ge, Self::Le];

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.symbol() == symbol)
    }

    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => {
                let scale = lhs.abs().max(rhs.abs()).max(1.0);
                (lhs - rhs).abs() <= f64::EPSILON * scale
            }
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// How the conditions of a section combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            _ => None,
        }
    }
}

/// `indicator <operator> value`
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub indicator: String,
    pub operator: Operator,
    pub value: f64,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.indicator, self.operator, self.value)
    }
}

/// A validated condition. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Threshold(Predicate),
    Duration {
        predicate: Predicate,
        duration_seconds: f64,
        reset_on_false: bool,
    },
    Sequence {
        steps: Vec<Condition>,
        max_gap_seconds: f64,
    },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Threshold(_) => "threshold",
            Self::Duration { .. } => "duration",
            Self::Sequence { .. } => "sequence",
        }
    }

    /// The indicator a leaf condition reads. Sequences read several.
    pub fn indicator(&self) -> Option<&str> {
        match self {
            Self::Threshold(p) | Self::Duration { predicate: p, .. } => Some(&p.indicator),
            Self::Sequence { .. } => None,
        }
    }

    pub fn to_raw(&self) -> RawCondition {
        match self {
            Self::Threshold(p) => RawCondition {
                kind: Some("threshold".into()),
                indicator: Some(p.indicator.clone()),
                operator: Some(p.operator.symbol().into()),
                value: Some(p.value),
                ..Default::default()
            },
            Self::Duration { predicate: p, duration_seconds, reset_on_false } => RawCondition {
                kind: Some("duration".into()),
                indicator: Some(p.indicator.clone()),
                operator: Some(p.operator.symbol().into()),
                value: Some(p.value),
                duration_seconds: Some(*duration_seconds),
                reset_on_false: Some(*reset_on_false),
                ..Default::default()
            },
            Self::Sequence { steps, max_gap_seconds } => RawCondition {
                kind: Some("sequence".into()),
                steps: Some(steps.iter().map(Condition::to_raw).collect()),
                max_gap_seconds: Some(*max_gap_seconds),
                ..Default::default()
            },
        }
    }
}

/// A named group of conditions combined by an explicit [`Logic`].
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub id: SectionId,
    pub logic: Logic,
    pub conditions: Vec<Condition>,
}

impl Section {
    pub fn empty(id: SectionId) -> Self {
        Self { id, logic: Logic::And, conditions: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn to_raw(&self) -> RawSection {
        RawSection {
            logic: Some(self.logic.as_str().into()),
            conditions: self.conditions.iter().map(Condition::to_raw).collect(),
        }
    }
}

/// A strategy that has passed validation and can be handed to the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDefinition {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// SHA-256 of the canonical wire form, hex encoded.
    pub fingerprint: String,
    sections: BTreeMap<SectionId, Section>,
}

impl StrategyDefinition {
    pub(crate) fn new(
        id: String,
        name: Option<String>,
        description: Option<String>,
        fingerprint: String,
        mut sections: BTreeMap<SectionId, Section>,
    ) -> Self {
        for id in SectionId::ALL {
            sections.entry(id).or_insert_with(|| Section::empty(id));
        }
        Self { id, name, description, fingerprint, sections }
    }

    /// Every section id is always present; absent sections are empty.
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[&id]
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    /// Re-serialises the definition into its wire form.
    pub fn to_raw(&self) -> RawStrategy {
        let wire = |id: SectionId| {
            let section = self.section(id);
            (!section.is_empty()).then(|| section.to_raw())
        };
        RawStrategy {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            s1_signal: wire(SectionId::S1),
            o1_cancel: wire(SectionId::O1),
            z1_entry: wire(SectionId::Z1),
            ze1_close: wire(SectionId::Ze1),
            emergency_exit: wire(SectionId::E1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_compare_as_named() {
        assert!(Operator::Gt.apply(2.0, 1.0));
        assert!(!Operator::Gt.apply(1.0, 1.0));
        assert!(Operator::Ge.apply(1.0, 1.0));
        assert!(Operator::Le.apply(0.5, 1.0));
        assert!(Operator::Lt.apply(-1.0, 0.0));
        assert!(Operator::Eq.apply(0.1 + 0.2, 0.3));
        assert!(!Operator::Eq.apply(1.0, 1.001));
    }

    #[test]
    fn operator_symbols_round_trip() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_symbol(op.symbol()), Some(op));
        }
        assert_eq!(Operator::from_symbol("!="), None);
        assert_eq!(Operator::from_symbol("=>"), None);
    }

    #[test]
    fn logic_names_are_case_insensitive() {
        assert_eq!(Logic::from_name("and"), Some(Logic::And));
        assert_eq!(Logic::from_name("Or"), Some(Logic::Or));
        assert_eq!(Logic::from_name("xor"), None);
    }
}
