//! Leader Election & Reconciliation Controller
//!
//! State machine: Campaigning -> Leading -> Resigning -> Resigned, with
//! Leading -> LeadershipLost when the election lease expires underneath us.
//! A store or reconciler error ends the run in Failed.
//!
//! While leading, the controller waits on the first of:
//! - a membership change forwarded from a [`MemberWatcher`] (re-reconcile)
//! - involuntary lease loss (stop immediately, nothing left to resign)
//! - a shutdown request (bounded resign, then stop)

mod client;
mod reconciler;

pub use client::ControllerClient;
pub use reconciler::{LoggingReconciler, Reconciler};

use async_trait::async_trait;
use shardline_core::{MemberId, MemberInfo};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Source of membership change notifications
#[async_trait]
pub trait MemberWatcher: Send {
    /// Current member view
    fn members(&self) -> Arc<HashMap<MemberId, MemberInfo>>;

    /// Block until the member set changes. Returns `true` once the source has
    /// closed for good.
    async fn wait(&mut self) -> bool;
}

/// Controller state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Waiting for the election to grant leadership
    Campaigning,
    /// Holding leadership and reconciling on membership changes
    Leading,
    /// Graceful shutdown: resigning leadership
    Resigning,
    /// Terminal: stopped on request
    Resigned,
    /// Terminal: the election lease was lost
    LeadershipLost,
    /// Terminal: a store or reconciler failure ended the run
    Failed,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Campaigning => "campaigning",
            ControllerState::Leading => "leading",
            ControllerState::Resigning => "resigning",
            ControllerState::Resigned => "resigned",
            ControllerState::LeadershipLost => "leadership_lost",
            ControllerState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Resigned | ControllerState::LeadershipLost | ControllerState::Failed
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a controller run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was requested; leadership (if held) was handed back
    Resigned,
    /// The lease expired while leading
    LeadershipLost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ControllerState::Campaigning.to_string(), "campaigning");
        assert_eq!(ControllerState::LeadershipLost.to_string(), "leadership_lost");
        assert!(ControllerState::Resigned.is_terminal());
        assert!(ControllerState::LeadershipLost.is_terminal());
        assert!(ControllerState::Failed.is_terminal());
        assert_eq!(ControllerState::Failed.to_string(), "failed");
        assert!(!ControllerState::Resigning.is_terminal());
    }
}
