//! Execution lifecycle.
//!
//! `Initializing → Running → {Completed | TimedOut | Errored} → Finalized`.
//! Terminal phases are one-way; anything else is a bug in the executor and
//! surfaces as [`SandboxError::IllegalTransition`].

use crate::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Completed,
    TimedOut,
    Errored,
    Finalized,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::TimedOut | Phase::Errored)
    }

    fn can_advance_to(&self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Initializing, Phase::Running) => true,
            // Instantiation itself can trap or run out of time.
            (Phase::Initializing, Phase::TimedOut | Phase::Errored) => true,
            (Phase::Running, next) => next.is_terminal(),
            (current, Phase::Finalized) => current.is_terminal(),
            _ => false,
        }
    }
}

/// Tracks the phase of one execution.
#[derive(Debug)]
pub struct ExecutionState {
    phase: Phase,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Initializing,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, next: Phase) -> SandboxResult<()> {
        if self.phase.can_advance_to(next) {
            self.phase = next;
            Ok(())
        } else {
            Err(SandboxError::IllegalTransition {
                from: self.phase,
                to: next,
            })
        }
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}
