//! Connector state machine.
//!
//! `ConnectorState` follows the OCPP 1.6 `ChargePointStatus` vocabulary;
//! `Connector` holds the current state plus the active transaction, if
//! any. Transitions are validated by `can_transition` rather than left
//! to callers, so an illegal jump (e.g. `Available` to `Charging`
//! without passing through `Preparing`) is rejected at the model layer
//! instead of discovered downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::TransactionId;
use crate::support::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorState {
    Available,
    Preparing,
    Charging,
    SuspendedEv,
    SuspendedEvse,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorState {
    pub fn ocpp_status(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEv => "SuspendedEV",
            Self::SuspendedEvse => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }

    /// The allowed next states from this one.
    fn allowed_next(&self) -> &'static [ConnectorState] {
        use ConnectorState::*;
        match self {
            Available => &[Preparing, Reserved, Unavailable, Faulted],
            Preparing => &[Charging, Available, Faulted],
            Charging => &[SuspendedEv, SuspendedEvse, Finishing, Faulted],
            SuspendedEv => &[Charging, Finishing, Faulted],
            SuspendedEvse => &[Charging, Finishing, Faulted],
            Finishing => &[Available, Faulted],
            Reserved => &[Preparing, Available, Faulted],
            Unavailable => &[Available, Faulted],
            // Faulted recovers only through an explicit operator/CSMS reset,
            // modeled as a direct transition back to Available.
            Faulted => &[Available, Unavailable],
        }
    }

    pub fn can_transition_to(&self, next: ConnectorState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Whether a connector in this state owns an active transaction.
    pub fn is_transaction_bearing(&self) -> bool {
        matches!(self, Self::Charging | Self::SuspendedEv | Self::SuspendedEvse)
    }
}

/// A physical connector on a station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: u32,
    pub state: ConnectorState,
    pub active_transaction: Option<TransactionId>,
    pub current_id_tag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Connector {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: ConnectorState::Available,
            active_transaction: None,
            current_id_tag: None,
            updated_at: Utc::now(),
        }
    }

    /// Attempt to move this connector to `next`, validating the transition
    /// against the state graph. On success, updates `updated_at`.
    pub fn transition(&mut self, next: ConnectorState) -> Result<(), StateError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.state.ocpp_status().to_string(),
                to: next.ocpp_status().to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, ConnectorState::Available)
    }

    /// Force this connector into `state`/`active_transaction` without
    /// passing through `transition`'s graph check, for reconstructing
    /// state handed back by the configuration repository on restart
    /// rather than driving a live transition.
    pub fn restore(&mut self, state: ConnectorState, active_transaction: Option<TransactionId>) {
        self.state = state;
        self.active_transaction = active_transaction;
        self.updated_at = Utc::now();
    }
}

/// Serializable snapshot of a connector's state, used by repositories and
/// the admin-facing status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSnapshot {
    pub id: u32,
    pub state: ConnectorState,
    pub active_transaction: Option<TransactionId>,
}

impl From<&Connector> for ConnectorSnapshot {
    fn from(c: &Connector) -> Self {
        Self {
            id: c.id,
            state: c.state,
            active_transaction: c.active_transaction.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transition_succeeds() {
        let mut c = Connector::new(1);
        assert!(c.transition(ConnectorState::Preparing).is_ok());
        assert!(c.transition(ConnectorState::Charging).is_ok());
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut c = Connector::new(1);
        let err = c.transition(ConnectorState::Charging).unwrap_err();
        matches!(err, StateError::InvalidTransition { .. });
    }

    #[test]
    fn faulted_recovers_to_available() {
        let mut c = Connector::new(1);
        c.state = ConnectorState::Faulted;
        assert!(c.transition(ConnectorState::Available).is_ok());
    }

    #[test]
    fn same_state_is_a_noop() {
        let mut c = Connector::new(1);
        assert!(c.transition(ConnectorState::Available).is_ok());
    }
}
