//! Declarative pump-and-dump strategies.
//!
//! A strategy arrives as a [`RawStrategy`] (JSON or TOML), is turned into an
//! immutable [`StrategyDefinition`] by the [`StrategyValidator`], and its
//! sections are then evaluated tick by tick by the [`ConditionEvaluator`].

pub mod condition;
pub mod error;
pub mod evaluator;
pub mod schema;
pub mod store;
pub mod validator;

pub use condition::{Condition, Logic, Operator, Predicate, Section, StrategyDefinition};
pub use error::{Error, Result, ValidationFailure, ValidationIssue};
pub use evaluator::{ConditionDetail, ConditionEvaluator, ConditionState, SectionOutcome, SectionState};
pub use schema::{RawCondition, RawSection, RawStrategy};
pub use store::{FileStrategyStore, MemoryStrategyStore, StrategyStore};
pub use validator::{fingerprint, fingerprint_raw, StrategyValidator, MAX_SEQUENCE_DEPTH};
