//! Manifest state machine.
//!
//! ```text
//! Pending   -> Pending | Scheduled
//! Scheduled -> Scheduled | Done | Error
//! Done      -> Done | Pending
//! Error     -> Error | Pending
//! ```
//!
//! Writers never force a state: [`Manifest::transition`] refuses anything
//! outside the table and the caller leaves the document for the next pass.

use tracing::warn;

use crate::error::{StateError, StateResult};
use crate::types::{Manifest, ManifestState};

/// Whether `src -> dst` is an edge of the manifest state machine.
pub fn valid_state_transition(src: ManifestState, dst: ManifestState) -> bool {
    use ManifestState::*;
    matches!(
        (src, dst),
        (Pending, Pending | Scheduled)
            | (Scheduled, Scheduled | Done | Error)
            | (Done, Done | Pending)
            | (Error, Error | Pending)
    )
}

impl ManifestState {
    pub fn can_transition_to(self, dst: ManifestState) -> bool {
        valid_state_transition(self, dst)
    }
}

impl Manifest {
    /// Move to `dst` if the table allows it.
    pub fn transition(&mut self, dst: ManifestState) -> StateResult<()> {
        if !self.state.can_transition_to(dst) {
            warn!(from = %self.state, to = %dst, "refusing invalid manifest state transition");
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: dst,
            });
        }
        self.state = dst;
        Ok(())
    }
}
