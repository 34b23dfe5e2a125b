//! Assignment register
//!
//! Token number to last-known assignment, merged across devices with a
//! last-writer-wins rule: a newer timestamp wins, equal timestamps go to the
//! larger origin id.

use std::collections::BTreeMap;

use tracing::debug;

use super::reconciler::Digest;
use crate::models::{now_millis, Assignment, EntryMethod};

/// Tokens touched by a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: Vec<u32>,
    pub replaced: Vec<u32>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty() || !self.replaced.is_empty()
    }

    /// All touched tokens, sorted
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self
            .inserted
            .iter()
            .chain(self.replaced.iter())
            .copied()
            .collect();
        tokens.sort_unstable();
        tokens
    }
}

/// This device's view of every assignment in the event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentRegister {
    entries: BTreeMap<u32, Assignment>,
    /// Highest timestamp seen, keeps local stamps strictly increasing
    last_stamp: i64,
}

impl AssignmentRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a register from saved assignments, keeping their local flags
    pub fn from_assignments(assignments: impl IntoIterator<Item = Assignment>) -> Self {
        let mut register = Self::new();
        for assignment in assignments {
            register.last_stamp = register.last_stamp.max(assignment.timestamp);
            register.entries.insert(assignment.token, assignment);
        }
        register
    }

    pub fn get(&self, token: u32) -> Option<&Assignment> {
        self.entries.get(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assignments ordered by token
    pub fn iter(&self) -> impl Iterator<Item = &Assignment> {
        self.entries.values()
    }

    /// Owned copy of all assignments, ordered by token
    pub fn to_vec(&self) -> Vec<Assignment> {
        self.entries.values().cloned().collect()
    }

    /// Merge records from a peer or the history store
    ///
    /// Applying the same records twice changes nothing the second time.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Assignment>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for mut record in incoming {
            record.is_local = false;
            self.last_stamp = self.last_stamp.max(record.timestamp);

            match self.entries.get(&record.token) {
                None => {
                    outcome.inserted.push(record.token);
                    self.entries.insert(record.token, record);
                }
                Some(existing) if record.supersedes(existing) => {
                    debug!(
                        "Updated token {} with newer data (timestamp: {}, origin: {})",
                        record.token, record.timestamp, record.origin_id
                    );
                    outcome.replaced.push(record.token);
                    self.entries.insert(record.token, record);
                }
                Some(_) => {}
            }
        }

        outcome
    }

    /// Record an assignment made on this device
    ///
    /// The timestamp is the current time, bumped past every timestamp this
    /// register has seen so the local write wins over what it replaces.
    pub fn save_local(
        &mut self,
        token: u32,
        athlete_barcode: &str,
        athlete_name: &str,
        entry_method: EntryMethod,
        origin_id: &str,
    ) -> Assignment {
        let timestamp = now_millis().max(self.last_stamp + 1);
        self.last_stamp = timestamp;

        let assignment = Assignment {
            token,
            athlete_barcode: athlete_barcode.to_string(),
            athlete_name: athlete_name.to_string(),
            entry_method,
            timestamp,
            origin_id: origin_id.to_string(),
            is_local: true,
        };
        self.entries.insert(token, assignment.clone());
        assignment
    }

    /// Remove a token's assignment
    pub fn clear(&mut self, token: u32) -> Option<Assignment> {
        self.entries.remove(&token)
    }

    /// The `n` most recent assignments made on this device, newest first
    pub fn recent_local(&self, n: usize) -> Vec<Assignment> {
        let mut local: Vec<&Assignment> = self.entries.values().filter(|a| a.is_local).collect();
        local.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        local.into_iter().take(n).cloned().collect()
    }

    /// Count and tokens held, for anti-entropy
    pub fn digest(&self) -> Digest {
        Digest::of(self.entries.keys().copied())
    }

    /// Whether a peer's digest suggests records are missing here
    pub fn needs_sync(&self, peer: &Digest) -> bool {
        self.digest().needs_sync(peer)
    }

    /// Another token already given to the same athlete
    ///
    /// Advisory only: the operator may confirm and keep both.
    pub fn find_duplicate_athlete(&self, athlete_barcode: &str, token: u32) -> Option<&Assignment> {
        if athlete_barcode.is_empty() {
            return None;
        }
        self.entries
            .values()
            .find(|a| a.token != token && a.athlete_barcode == athlete_barcode)
    }

    /// Highest token with an assignment, 0 when empty
    pub fn highest_token(&self) -> u32 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }
}
