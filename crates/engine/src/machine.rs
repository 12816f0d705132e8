use crate::{Error, Result};
use chrono::{DateTime, Utc};
use core_types::{IndicatorBoard, SectionId, SessionId, StrategyState, Symbol, Transition, TransitionTrigger};
use std::collections::HashMap;
use std::sync::Arc;
use strategies::{ConditionEvaluator, SectionOutcome, SectionState, StrategyDefinition};

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// ZE1 fired.
    Profit,
    /// E1 fired.
    Emergency,
}

/// Side effects the trading task has to carry out after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAction {
    OpenPosition,
    ClosePosition(ExitKind),
}

#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub transitions: Vec<Transition>,
    pub actions: Vec<MachineAction>,
    pub sections: Vec<SectionOutcome>,
}

/// One strategy running on one symbol.
///
/// The instance is always in exactly one state. Section-driven transitions
/// happen in `tick`; fills and stops come in through their own methods so
/// that every step, internal or not, lands in the history.
#[derive(Debug)]
pub struct StateMachineInstance {
    session_id: SessionId,
    symbol: Symbol,
    strategy: Arc<StrategyDefinition>,
    state: StrategyState,
    entered_at: DateTime<Utc>,
    history: Vec<Transition>,
    pending_exit: Option<ExitKind>,
    section_states: HashMap<SectionId, SectionState>,
    evaluator: ConditionEvaluator,
}

impl StateMachineInstance {
    pub fn new(session_id: SessionId, symbol: Symbol, strategy: Arc<StrategyDefinition>, now: DateTime<Utc>) -> Self {
        let mut instance = Self {
            session_id,
            symbol,
            strategy,
            state: StrategyState::Idle,
            entered_at: now,
            history: Vec::new(),
            pending_exit: None,
            section_states: HashMap::new(),
            evaluator: ConditionEvaluator::new(),
        };
        instance.reset_sections();
        instance
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn strategy(&self) -> &StrategyDefinition {
        &self.strategy
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn pending_exit(&self) -> Option<ExitKind> {
        self.pending_exit
    }

    fn reset_sections(&mut self) {
        self.section_states = self
            .state
            .watched_sections()
            .iter()
            .map(|id| (*id, SectionState::for_section(self.strategy.section(*id))))
            .collect();
    }

    fn enter(&mut self, to: StrategyState, trigger: TransitionTrigger, now: DateTime<Utc>) -> Transition {
        let transition = Transition { from: self.state, to, trigger, at: now };
        tracing::info!(
            session_id = %self.session_id,
            symbol = %self.symbol,
            from = %transition.from,
            to = %to,
            trigger = %trigger,
            "State transition."
        );
        self.state = to;
        self.entered_at = now;
        self.history.push(transition.clone());
        self.reset_sections();
        transition
    }

    fn evaluate(&mut self, id: SectionId, board: &IndicatorBoard, now: DateTime<Utc>) -> SectionOutcome {
        let section = self.strategy.section(id);
        let state = self
            .section_states
            .entry(id)
            .or_insert_with(|| SectionState::for_section(section));
        self.evaluator.evaluate(section, state, board, now)
    }

    /// Evaluates the sections the current state watches and applies at most
    /// one section-driven transition. `has_price` gates Z1: without a known
    /// price there is nothing to enter at.
    pub fn tick(&mut self, board: &IndicatorBoard, has_price: bool, now: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        match self.state {
            StrategyState::Idle => {
                let s1 = self.evaluate(SectionId::S1, board, now);
                let fired = s1.result;
                outcome.sections.push(s1);
                if fired {
                    outcome.transitions.push(self.enter(StrategyState::SignalDetected, SectionId::S1.into(), now));
                }
            }
            StrategyState::SignalDetected => {
                // Both are evaluated every tick so duration timers keep running.
                let o1 = self.evaluate(SectionId::O1, board, now);
                let z1 = self.evaluate(SectionId::Z1, board, now);
                let (cancel, confirm) = (o1.result, z1.result);
                outcome.sections.extend([o1, z1]);

                if cancel {
                    outcome.transitions.push(self.enter(StrategyState::Idle, SectionId::O1.into(), now));
                } else if confirm && !has_price {
                    tracing::warn!(session_id = %self.session_id, symbol = %self.symbol, "Z1 fired without a known price; not entering.");
                } else if confirm {
                    outcome.transitions.push(self.enter(StrategyState::Entering, SectionId::Z1.into(), now));
                    outcome.actions.push(MachineAction::OpenPosition);
                }
            }
            StrategyState::PositionOpen => {
                outcome.transitions.push(self.enter(StrategyState::PositionMonitoring, TransitionTrigger::MonitorTick, now));
            }
            StrategyState::PositionMonitoring => {
                let e1 = self.evaluate(SectionId::E1, board, now);
                let ze1 = self.evaluate(SectionId::Ze1, board, now);
                let (emergency, profit) = (e1.result, ze1.result);
                outcome.sections.extend([e1, ze1]);

                let exit = if emergency {
                    Some((ExitKind::Emergency, SectionId::E1))
                } else if profit {
                    Some((ExitKind::Profit, SectionId::Ze1))
                } else {
                    None
                };
                if let Some((kind, section)) = exit {
                    self.pending_exit = Some(kind);
                    outcome.transitions.push(self.enter(StrategyState::Exiting, section.into(), now));
                    outcome.actions.push(MachineAction::ClosePosition(kind));
                }
            }
            // Waiting on fills, or finished.
            StrategyState::Entering
            | StrategyState::Exiting
            | StrategyState::ExitedProfit
            | StrategyState::ExitedLoss
            | StrategyState::Stopped => {}
        }

        outcome
    }

    pub fn on_entry_fill(&mut self, now: DateTime<Utc>) -> Result<Transition> {
        self.expect_state(StrategyState::Entering, TransitionTrigger::EntryFill)?;
        Ok(self.enter(StrategyState::PositionOpen, TransitionTrigger::EntryFill, now))
    }

    pub fn on_entry_rejected(&mut self, now: DateTime<Utc>) -> Result<Transition> {
        self.expect_state(StrategyState::Entering, TransitionTrigger::EntryRejected)?;
        Ok(self.enter(StrategyState::Idle, TransitionTrigger::EntryRejected, now))
    }

    pub fn on_exit_fill(&mut self, now: DateTime<Utc>) -> Result<Transition> {
        self.expect_state(StrategyState::Exiting, TransitionTrigger::ExitFill)?;
        let to = match self.pending_exit.take() {
            Some(ExitKind::Emergency) => StrategyState::ExitedLoss,
            Some(ExitKind::Profit) | None => StrategyState::ExitedProfit,
        };
        Ok(self.enter(to, TransitionTrigger::ExitFill, now))
    }

    /// Manual or emergency stop. A no-op on terminal instances.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.pending_exit = None;
        Some(self.enter(StrategyState::Stopped, TransitionTrigger::ManualStop, now))
    }

    fn expect_state(&self, expected: StrategyState, trigger: TransitionTrigger) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from: self.state, trigger })
        }
    }
}
