//! Per-user conversation phase.
//!
//! Only one open or turn may be in flight per user. A second request is rejected, not queued.

use crate::error::ChatError;
use crate::infrastructure::entities::UserId;
use di::{inject, injectable};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Loading,
    Ready,
    AwaitingResponse,
}

#[derive(Default)]
pub struct SessionRegistry {
    phases: Mutex<HashMap<UserId, SessionPhase>>,
}

#[injectable]
impl SessionRegistry {
    #[inject]
    pub fn create() -> SessionRegistry {
        SessionRegistry::default()
    }
}

impl SessionRegistry {
    pub fn phase(&self, user: &UserId) -> SessionPhase {
        self.phases()
            .get(user)
            .copied()
            .unwrap_or(SessionPhase::Uninitialized)
    }

    /// `Uninitialized | Ready → Loading`. Dropping the guard without [`PhaseGuard::finish`]
    /// restores the previous phase.
    pub fn begin_loading(&self, user: &UserId) -> Result<PhaseGuard<'_>, ChatError> {
        let mut phases = self.phases();
        let previous = phases
            .get(user)
            .copied()
            .unwrap_or(SessionPhase::Uninitialized);

        match previous {
            SessionPhase::Uninitialized | SessionPhase::Ready => {
                phases.insert(user.clone(), SessionPhase::Loading);
                Ok(PhaseGuard {
                    registry: self,
                    user: user.clone(),
                    on_drop: previous,
                })
            }
            SessionPhase::Loading | SessionPhase::AwaitingResponse => Err(ChatError::TurnInFlight),
        }
    }

    /// `Ready → AwaitingResponse`. The phase returns to `Ready` when the guard drops.
    pub fn begin_turn(&self, user: &UserId) -> Result<PhaseGuard<'_>, ChatError> {
        let mut phases = self.phases();

        match phases.get(user).copied() {
            Some(SessionPhase::Ready) => {
                phases.insert(user.clone(), SessionPhase::AwaitingResponse);
                Ok(PhaseGuard {
                    registry: self,
                    user: user.clone(),
                    on_drop: SessionPhase::Ready,
                })
            }
            Some(SessionPhase::Loading | SessionPhase::AwaitingResponse) => {
                Err(ChatError::TurnInFlight)
            }
            None | Some(SessionPhase::Uninitialized) => Err(ChatError::NotOpened),
        }
    }

    /// `Uninitialized` is the absent entry.
    fn set(&self, user: &UserId, phase: SessionPhase) {
        let mut phases = self.phases();
        if phase == SessionPhase::Uninitialized {
            phases.remove(user);
        } else {
            phases.insert(user.clone(), phase);
        }
    }

    fn phases(&self) -> MutexGuard<'_, HashMap<UserId, SessionPhase>> {
        self.phases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[must_use]
pub struct PhaseGuard<'a> {
    registry: &'a SessionRegistry,
    user: UserId,
    on_drop: SessionPhase,
}

impl PhaseGuard<'_> {
    pub fn finish(mut self, phase: SessionPhase) {
        self.on_drop = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.registry.set(&self.user, self.on_drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        "katyayani".parse().unwrap()
    }

    #[test]
    fn test_turn_requires_open() {
        let registry = SessionRegistry::create();
        assert!(matches!(
            registry.begin_turn(&user()),
            Err(ChatError::NotOpened)
        ));
    }

    #[test]
    fn test_open_then_turn() {
        let registry = SessionRegistry::create();

        let loading = registry.begin_loading(&user()).unwrap();
        assert_eq!(registry.phase(&user()), SessionPhase::Loading);
        loading.finish(SessionPhase::Ready);
        assert_eq!(registry.phase(&user()), SessionPhase::Ready);

        let turn = registry.begin_turn(&user()).unwrap();
        assert_eq!(registry.phase(&user()), SessionPhase::AwaitingResponse);
        assert!(matches!(
            registry.begin_turn(&user()),
            Err(ChatError::TurnInFlight)
        ));
        assert!(matches!(
            registry.begin_loading(&user()),
            Err(ChatError::TurnInFlight)
        ));
        drop(turn);

        assert_eq!(registry.phase(&user()), SessionPhase::Ready);
    }

    #[test]
    fn test_failed_open_restores_previous_phase() {
        let registry = SessionRegistry::create();

        drop(registry.begin_loading(&user()).unwrap());

        assert_eq!(registry.phase(&user()), SessionPhase::Uninitialized);
        assert!(registry.phases().is_empty());
    }

    #[test]
    fn test_failed_opens_leave_no_entries() {
        let registry = SessionRegistry::create();

        for id in ["a", "b", "c"] {
            let user: UserId = id.parse().unwrap();
            drop(registry.begin_loading(&user).unwrap());
        }
        registry
            .begin_loading(&user())
            .unwrap()
            .finish(SessionPhase::Ready);

        assert_eq!(registry.phases().len(), 1);
    }

    #[test]
    fn test_users_do_not_block_each_other() {
        let registry = SessionRegistry::create();
        let other: UserId = "other".parse().unwrap();

        let _loading = registry.begin_loading(&user()).unwrap();

        assert!(registry.begin_loading(&other).is_ok());
    }
}
