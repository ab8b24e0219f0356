//! Relay stage machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a relayed message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStage {
    /// Stream accepted, nothing read yet.
    Received,
    /// Text artifact produced.
    Decoded,
    /// Structured artifact produced.
    Structured,
    /// Both deliveries in flight.
    Forwarding,
    /// Both artifacts delivered.
    Completed,
    /// Exactly one artifact delivered.
    PartiallyFailed,
    /// Artifacts existed but neither was delivered.
    DeliveryFailed,
    /// Decoding or structuring failed; nothing was forwarded.
    Failed,
}

impl RelayStage {
    /// Check if this stage allows transitioning to another stage.
    pub fn can_transition_to(&self, target: RelayStage) -> bool {
        use RelayStage::*;

        matches!(
            (self, target),
            (Received, Decoded) | (Received, Failed) |
            (Decoded, Structured) | (Decoded, Failed) |
            (Structured, Forwarding) |
            (Forwarding, Completed) | (Forwarding, PartiallyFailed) | (Forwarding, DeliveryFailed)
        )
    }

    /// Check if this is a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::DeliveryFailed | Self::Failed
        )
    }
}

impl std::fmt::Display for RelayStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Decoded => "decoded",
            Self::Structured => "structured",
            Self::Forwarding => "forwarding",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A stage transition event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: RelayStage,
    pub to: RelayStage,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the current stage of one relay and the path it took.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: RelayStage,
    transitions: Vec<StageTransition>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: RelayStage::Received,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RelayStage {
        self.current
    }

    /// Move to `to`. Illegal moves are refused and leave the tracker as is.
    pub fn advance(&mut self, to: RelayStage) -> bool {
        if !self.current.can_transition_to(to) {
            tracing::warn!(from = %self.current, to = %to, "Refused illegal relay transition");
            return false;
        }
        tracing::debug!(from = %self.current, to = %to, "Relay stage");
        self.transitions.push(StageTransition {
            from: self.current,
            to,
            timestamp: Utc::now(),
        });
        self.current = to;
        true
    }

    pub fn into_transitions(self) -> Vec<StageTransition> {
        self.transitions
    }
}
