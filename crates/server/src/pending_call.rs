//! Per-pair pending-call state machine. Keyed by the sorted (lower,
//! higher) tuple of the two participants' user ids so caller and callee
//! contend for the same slot regardless of who dials whom.
//!
//! Transitions: absent -> offer -> Offered -> answer -> Active(call_id)
//! -> end -> removed. A reject from Offered removes the slot directly.
//! Guarantees exactly one persisted `Call` row per accepted session: the
//! row is created exactly once, on the offer -> Active transition.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCall {
    Offered,
    Active(Uuid),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PendingCallError {
    AlreadyPending,
    NoPendingCall,
    NotOffered,
}

fn pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a < b { (a, b) } else { (b, a) }
}

#[derive(Default)]
pub struct PendingCallRegistry {
    calls: Mutex<HashMap<(Uuid, Uuid), PendingCall>>,
}

impl PendingCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `absent -> Offered`. Rejected if a call between this pair is
    /// already in progress.
    pub fn start_offer(&self, a: Uuid, b: Uuid) -> Result<(), PendingCallError> {
        let mut calls = self.calls.lock().unwrap();
        let key = pair_key(a, b);
        if calls.contains_key(&key) {
            return Err(PendingCallError::AlreadyPending);
        }
        calls.insert(key, PendingCall::Offered);
        Ok(())
    }

    /// `Offered -> Active(call_id)`.
    pub fn accept(&self, a: Uuid, b: Uuid, call_id: Uuid) -> Result<(), PendingCallError> {
        let mut calls = self.calls.lock().unwrap();
        let key = pair_key(a, b);
        match calls.get(&key) {
            Some(PendingCall::Offered) => {
                calls.insert(key, PendingCall::Active(call_id));
                Ok(())
            }
            Some(PendingCall::Active(_)) => Err(PendingCallError::NotOffered),
            None => Err(PendingCallError::NoPendingCall),
        }
    }

    /// Removes an `Offered` slot without transitioning to `Active`, used
    /// for both an explicit reject and a caller-side cancel.
    pub fn reject(&self, a: Uuid, b: Uuid) -> Result<(), PendingCallError> {
        let mut calls = self.calls.lock().unwrap();
        let key = pair_key(a, b);
        match calls.get(&key) {
            Some(PendingCall::Offered) => {
                calls.remove(&key);
                Ok(())
            }
            Some(PendingCall::Active(_)) => Err(PendingCallError::NotOffered),
            None => Err(PendingCallError::NoPendingCall),
        }
    }

    /// Ends an active call, returning its `call_id` so the caller can
    /// close out the persisted `Call` row.
    pub fn end(&self, a: Uuid, b: Uuid) -> Result<Uuid, PendingCallError> {
        let mut calls = self.calls.lock().unwrap();
        let key = pair_key(a, b);
        match calls.remove(&key) {
            Some(PendingCall::Active(call_id)) => Ok(call_id),
            Some(PendingCall::Offered) => {
                calls.insert(key, PendingCall::Offered);
                Err(PendingCallError::NotOffered)
            }
            None => Err(PendingCallError::NoPendingCall),
        }
    }

    pub fn state(&self, a: Uuid, b: Uuid) -> Option<PendingCall> {
        self.calls.lock().unwrap().get(&pair_key(a, b)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_offer_accept_end() {
        let registry = PendingCallRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.start_offer(alice, bob).unwrap();
        assert_eq!(registry.state(alice, bob), Some(PendingCall::Offered));

        let call_id = Uuid::new_v4();
        registry.accept(alice, bob, call_id).unwrap();
        assert_eq!(registry.state(bob, alice), Some(PendingCall::Active(call_id)));

        let ended_id = registry.end(alice, bob).unwrap();
        assert_eq!(ended_id, call_id);
        assert_eq!(registry.state(alice, bob), None);
    }

    #[test]
    fn second_offer_while_pending_is_rejected() {
        let registry = PendingCallRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.start_offer(alice, bob).unwrap();
        assert_eq!(registry.start_offer(bob, alice), Err(PendingCallError::AlreadyPending));
    }

    #[test]
    fn reject_clears_offered_slot() {
        let registry = PendingCallRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.start_offer(alice, bob).unwrap();
        registry.reject(alice, bob).unwrap();
        assert_eq!(registry.state(alice, bob), None);
        // pair is free again for a new offer
        registry.start_offer(alice, bob).unwrap();
    }

    #[test]
    fn accept_without_offer_fails() {
        let registry = PendingCallRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        assert_eq!(registry.accept(alice, bob, Uuid::new_v4()), Err(PendingCallError::NoPendingCall));
    }

    #[test]
    fn end_before_accept_does_not_clear_slot() {
        let registry = PendingCallRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.start_offer(alice, bob).unwrap();
        assert_eq!(registry.end(alice, bob), Err(PendingCallError::NotOffered));
        assert_eq!(registry.state(alice, bob), Some(PendingCall::Offered));
    }

    #[test]
    fn pair_key_is_order_independent() {
        let registry = PendingCallRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.start_offer(bob, alice).unwrap();
        assert_eq!(registry.state(alice, bob), Some(PendingCall::Offered));
    }
}
