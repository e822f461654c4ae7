//! Session types and their ordered phase sequences.

use serde::{Deserialize, Serialize};

/// The kind of session being run, which determines its phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Agile retrospective: waiting, icebreaker, brainstorm, group, vote, discuss, action, roti.
    Retro,
    /// Lean Coffee: waiting, icebreaker, propose, vote, discuss, roti.
    LeanCoffee,
}

impl Default for SessionType {
    fn default() -> Self {
        SessionType::Retro
    }
}

/// A single phase in a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    Icebreaker,
    Brainstorm,
    Group,
    Propose,
    Vote,
    Discuss,
    Action,
    Roti,
}

const RETRO_ORDER: &[Phase] = &[
    Phase::Waiting,
    Phase::Icebreaker,
    Phase::Brainstorm,
    Phase::Group,
    Phase::Vote,
    Phase::Discuss,
    Phase::Action,
    Phase::Roti,
];

const LEAN_COFFEE_ORDER: &[Phase] = &[
    Phase::Waiting,
    Phase::Icebreaker,
    Phase::Propose,
    Phase::Vote,
    Phase::Discuss,
    Phase::Roti,
];

/// The ordered list of phases for a session type, with a distinguished terminal.
#[derive(Debug, Clone, Copy)]
pub struct PhaseOrder {
    order: &'static [Phase],
}

impl PhaseOrder {
    /// Returns the phase order for the given session type.
    pub fn for_session_type(session_type: SessionType) -> Self {
        let order = match session_type {
            SessionType::Retro => RETRO_ORDER,
            SessionType::LeanCoffee => LEAN_COFFEE_ORDER,
        };
        Self { order }
    }

    /// Returns true if `phase` is valid for this session type.
    pub fn contains(&self, phase: Phase) -> bool {
        self.order.contains(&phase)
    }

    /// Returns the terminal (final) phase of this order.
    pub fn terminal(&self) -> Phase {
        *self.order.last().expect("phase order is never empty")
    }

    /// Returns the phase that follows `current`, or `current` itself if it is
    /// already the terminal phase or not part of this order.
    pub fn successor(&self, current: Phase) -> Phase {
        match self.order.iter().position(|&p| p == current) {
            Some(idx) if idx + 1 < self.order.len() => self.order[idx + 1],
            _ => current,
        }
    }
}
