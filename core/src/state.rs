// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Explicit tagged state machines stored on the session.
//!
//! Both machines are consulted by the policy gate and by several hooks;
//! they are mutated only through the transition methods below so that no
//! caller re-derives state from tool history.

use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Gate controlling whether the preview server may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewState {
    #[default]
    None,
    Requested,
    Passed,
    Invalidated,
}

impl ReviewState {
    /// Transition taken by the hook pipeline after any code-mutating tool
    /// call succeeds. A passed review is invalidated; an untouched session
    /// moves to `Requested`.
    fn note_mutation(self) -> ReviewState {
        match self {
            ReviewState::Passed => ReviewState::Invalidated,
            ReviewState::None => ReviewState::Requested,
            other => other,
        }
    }

    pub fn allows_dev_server(self) -> bool {
        self == ReviewState::Passed
    }
}

/// Progress of the planning workflow for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanningState {
    #[default]
    NotStarted,
    Exploring,
    AwaitingClarification,
    Planned,
    Building,
    Done,
}

impl PlanningState {
    fn on_exploration(self) -> PlanningState {
        match self {
            PlanningState::NotStarted => PlanningState::Exploring,
            other => other,
        }
    }

    fn on_subagent_complete(self, subagent: &str) -> PlanningState {
        match (subagent, self) {
            ("requirements-analyzer", PlanningState::NotStarted | PlanningState::Exploring) => {
                PlanningState::AwaitingClarification
            }
            (
                "planner",
                PlanningState::NotStarted
                | PlanningState::Exploring
                | PlanningState::AwaitingClarification,
            ) => PlanningState::Planned,
            ("plan-validator", PlanningState::Planned) => PlanningState::Planned,
            (_, other) => other,
        }
    }

    /// The user approved the plan by asking the agent to build; the first
    /// successful file mutation after `Planned` marks the transition.
    fn on_build_progress(self) -> PlanningState {
        match self {
            PlanningState::Planned => PlanningState::Building,
            other => other,
        }
    }

    fn on_dev_server_started(self) -> PlanningState {
        match self {
            PlanningState::Building => PlanningState::Done,
            other => other,
        }
    }
}

/// Shared mutable session state consulted by the policy gate and hooks.
#[derive(Debug, Default)]
pub struct SessionState {
    review: Mutex<ReviewState>,
    planning: Mutex<PlanningState>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn review_state(&self) -> ReviewState {
        *self.review.lock().unwrap()
    }

    pub fn planning_state(&self) -> PlanningState {
        *self.planning.lock().unwrap()
    }

    /// Any successful code-mutating tool call lands here.
    pub fn note_file_mutation(&self) {
        let mut review = self.review.lock().unwrap();
        *review = review.note_mutation();
        let mut planning = self.planning.lock().unwrap();
        *planning = planning.on_build_progress();
    }

    /// Only the dedicated review tool may set `Passed`.
    pub fn mark_review_passed(&self) {
        *self.review.lock().unwrap() = ReviewState::Passed;
    }

    pub fn note_exploration(&self) {
        let mut planning = self.planning.lock().unwrap();
        *planning = planning.on_exploration();
    }

    pub fn note_subagent_complete(&self, subagent: &str) {
        let mut planning = self.planning.lock().unwrap();
        *planning = planning.on_subagent_complete(subagent);
    }

    pub fn note_dev_server_started(&self) {
        let mut planning = self.planning.lock().unwrap();
        *planning = planning.on_dev_server_started();
    }
}
