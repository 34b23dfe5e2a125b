//! Event state replica
//!
//! The event triple every device keeps a copy of: id, name and the next
//! token to hand out, plus the token this device currently holds. Only the
//! act of claiming a token is replicated, never `current_token` itself.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{
    validate_event_name, validate_token, ValidationError, DEFAULT_EVENT_NAME, MAX_TOKEN,
    UNNAMED_EVENT_NAME,
};

/// Result of applying a peer's `tokenUsed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUsedOutcome {
    /// Our own message echoed back; nothing changed
    Ignored,
    /// No competing claim; `next_token` may have advanced
    Applied,
    /// Both claimed the same token and this device keeps it
    ConflictWon,
    /// Both claimed the same token and this device must claim again
    ConflictLost,
}

/// What a peer's `setEventDetails` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetailsOutcome {
    pub renamed: bool,
    pub next_token_adopted: bool,
}

/// This device's copy of the shared event state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReplica {
    pub event_id: String,
    pub name: String,
    pub next_token: u32,
    /// Token held by this device, 0 when none
    pub current_token: u32,
}

impl EventReplica {
    /// A fresh event nobody has touched yet
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            name: DEFAULT_EVENT_NAME.to_string(),
            next_token: 1,
            current_token: 0,
        }
    }

    /// Whether peers joining the event should be told about it
    pub fn has_non_default_state(&self) -> bool {
        self.next_token > 1 || self.name != DEFAULT_EVENT_NAME
    }

    /// Apply a peer's claim of `token`
    ///
    /// A claim of the token this device holds is a conflict; the smaller
    /// origin id keeps the token. `next_token` always moves past `token`.
    pub fn apply_token_used(&mut self, local_id: &str, origin_id: &str, token: u32) -> TokenUsedOutcome {
        if origin_id == local_id {
            return TokenUsedOutcome::Ignored;
        }

        let mut outcome = TokenUsedOutcome::Applied;
        if token != 0 && token == self.current_token {
            if origin_id < local_id {
                warn!(
                    "Conflict on token {}: this device lost out to {}",
                    token, origin_id
                );
                self.current_token = 0;
                outcome = TokenUsedOutcome::ConflictLost;
            } else {
                warn!(
                    "Conflict on token {}: this device won and beat out {}",
                    token, origin_id
                );
                outcome = TokenUsedOutcome::ConflictWon;
            }
        }

        self.next_token = self.next_token.max(token.saturating_add(1));
        outcome
    }

    /// Apply a peer's reset; returns false for our own echo
    pub fn apply_reset(&mut self, local_id: &str, origin_id: &str) -> bool {
        if origin_id == local_id {
            return false;
        }
        self.reset();
        true
    }

    /// Apply a peer's event details
    ///
    /// The name is always adopted. `next_token` is adopted only when it is a
    /// positive integer different from ours, and adopting it drops the token
    /// this device holds.
    pub fn apply_event_details(
        &mut self,
        local_id: &str,
        origin_id: &str,
        name: &str,
        next_token: Option<i64>,
    ) -> DetailsOutcome {
        let mut outcome = DetailsOutcome::default();
        if origin_id == local_id {
            return outcome;
        }

        let name = if name.trim().is_empty() {
            UNNAMED_EVENT_NAME
        } else {
            name
        };
        if self.name != name {
            self.name = name.to_string();
            outcome.renamed = true;
        }

        if let Some(next) = next_token.filter(|n| *n > 0).and_then(|n| u32::try_from(n).ok()) {
            if next != self.next_token {
                self.next_token = next;
                self.current_token = 0;
                outcome.next_token_adopted = true;
            }
        }

        outcome
    }

    /// Take the next token for this device
    ///
    /// Tokens stop at the maximum; claiming past it hands out the maximum
    /// again.
    pub fn claim_next_token(&mut self) -> u32 {
        let token = self.next_token.clamp(1, MAX_TOKEN);
        if self.next_token > MAX_TOKEN {
            warn!("Token range exhausted, reissuing {}", MAX_TOKEN);
        }
        self.current_token = token;
        self.next_token = self.next_token.max(token + 1);
        info!("Claimed token {} in event {}", token, self.event_id);
        token
    }

    /// Rename the event locally
    pub fn rename(&mut self, name: &str) -> Result<(), ValidationError> {
        self.name = validate_event_name(name)?;
        Ok(())
    }

    /// Point the shared counter somewhere else; drops the token held
    pub fn set_next_token(&mut self, next_token: i64) -> Result<(), ValidationError> {
        let next = validate_token(next_token)?;
        if next != self.next_token {
            self.next_token = next;
            self.current_token = 0;
        }
        Ok(())
    }

    /// Start the token sequence over
    pub fn reset(&mut self) {
        self.next_token = 1;
        self.current_token = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_replica_is_default() {
        let replica = EventReplica::new("k3x9qa");
        assert_eq!(replica.next_token, 1);
        assert_eq!(replica.current_token, 0);
        assert!(!replica.has_non_default_state());
    }

    #[test]
    fn test_token_used_advances_next_token() {
        let mut replica = EventReplica::new("e");
        assert_eq!(replica.apply_token_used("me", "peer", 4), TokenUsedOutcome::Applied);
        assert_eq!(replica.next_token, 5);

        // Older claims never move it back
        replica.apply_token_used("me", "peer", 2);
        assert_eq!(replica.next_token, 5);
    }

    #[test]
    fn test_conflict_symmetry() {
        let mut a = EventReplica::new("e");
        let mut b = EventReplica::new("e");
        a.next_token = 7;
        b.next_token = 7;
        assert_eq!(a.claim_next_token(), 7);
        assert_eq!(b.claim_next_token(), 7);

        assert_eq!(a.apply_token_used("a", "b", 7), TokenUsedOutcome::ConflictWon);
        assert_eq!(b.apply_token_used("b", "a", 7), TokenUsedOutcome::ConflictLost);

        assert_eq!(a.current_token, 7);
        assert_eq!(b.current_token, 0);
        assert_eq!(a.next_token, 8);
        assert_eq!(b.next_token, 8);
    }

    #[test]
    fn test_self_origin_never_mutates() {
        let mut replica = EventReplica::new("e");
        replica.claim_next_token();
        let before = replica.clone();

        assert_eq!(replica.apply_token_used("me", "me", 40), TokenUsedOutcome::Ignored);
        assert!(!replica.apply_reset("me", "me"));
        replica.apply_event_details("me", "me", "Other", Some(90));

        assert_eq!(replica, before);
    }

    #[test]
    fn test_reset_scenario() {
        let mut replica = EventReplica::new("e");
        replica.next_token = 15;
        replica.current_token = 9;

        assert!(replica.apply_reset("me", "peer"));
        assert_eq!(replica.next_token, 1);
        assert_eq!(replica.current_token, 0);
    }

    #[test]
    fn test_event_details_adoption() {
        let mut replica = EventReplica::new("e");
        replica.next_token = 5;
        replica.current_token = 4;

        let outcome = replica.apply_event_details("me", "peer", "Harbour 10k", Some(5));
        assert!(outcome.renamed);
        assert!(!outcome.next_token_adopted);
        assert_eq!(replica.current_token, 4);

        let outcome = replica.apply_event_details("me", "peer", "Harbour 10k", Some(20));
        assert!(!outcome.renamed);
        assert!(outcome.next_token_adopted);
        assert_eq!(replica.next_token, 20);
        assert_eq!(replica.current_token, 0);
    }

    #[test]
    fn test_event_details_ignores_non_positive_next_token() {
        let mut replica = EventReplica::new("e");
        replica.next_token = 5;

        replica.apply_event_details("me", "peer", "", Some(-1));
        assert_eq!(replica.next_token, 5);
        assert_eq!(replica.name, UNNAMED_EVENT_NAME);

        replica.apply_event_details("me", "peer", "Race", None);
        replica.apply_event_details("me", "peer", "Race", Some(0));
        assert_eq!(replica.next_token, 5);
    }

    #[test]
    fn test_claim_clamps_to_max() {
        let mut replica = EventReplica::new("e");
        replica.next_token = 0;
        assert_eq!(replica.claim_next_token(), 1);
        assert_eq!(replica.next_token, 2);

        replica.next_token = MAX_TOKEN + 1;
        assert_eq!(replica.claim_next_token(), MAX_TOKEN);
        assert_eq!(replica.next_token, MAX_TOKEN + 1);
    }

    #[test]
    fn test_local_intents_validate() {
        let mut replica = EventReplica::new("e");
        assert!(replica.rename("   ").is_err());
        assert!(replica.rename("A name far too long for the display").is_err());
        replica.rename(" Parkrun ").unwrap();
        assert_eq!(replica.name, "Parkrun");
        assert!(replica.has_non_default_state());

        assert!(replica.set_next_token(0).is_err());
        replica.claim_next_token();
        replica.set_next_token(50).unwrap();
        assert_eq!(replica.next_token, 50);
        assert_eq!(replica.current_token, 0);
    }

    proptest! {
        #[test]
        fn prop_next_token_is_monotone(tokens in proptest::collection::vec(1u32..=MAX_TOKEN, 1..40)) {
            let mut replica = EventReplica::new("e");
            let mut previous = replica.next_token;
            for token in &tokens {
                replica.apply_token_used("me", "peer", *token);
                prop_assert!(replica.next_token >= previous);
                previous = replica.next_token;
            }
            let max = tokens.iter().copied().max().unwrap_or(0);
            prop_assert!(replica.next_token >= max + 1);
        }

        #[test]
        fn prop_token_used_order_does_not_matter(tokens in proptest::collection::vec(1u32..=MAX_TOKEN, 1..20)) {
            let mut forward = EventReplica::new("e");
            let mut backward = EventReplica::new("e");
            for token in &tokens {
                forward.apply_token_used("me", "peer", *token);
            }
            for token in tokens.iter().rev() {
                backward.apply_token_used("me", "peer", *token);
            }
            prop_assert_eq!(forward.next_token, backward.next_token);
        }
    }
}
