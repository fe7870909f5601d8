//! One-shot seeding of the starter template into an empty code buffer.
//!
//! Exactly one client should insert the template, and only after it has
//! synced with its peers. The seeding client is whoever holds the lowest
//! client id in the presence roster at the time of the check. This rule is
//! independent of the lobby host, because `hostId` may not have reached a
//! freshly joined replica yet.
//!
//! Known race: if a peer has not published presence when the check runs,
//! two replicas can both see themselves as the minimum and both insert.
//! The guard narrows the window (it re-checks an empty buffer and disarms
//! for good once it inserts or sees content) but cannot close it.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::doc::{DocError, LocalUpdate, SharedDoc};
use crate::protocol::ClientId;

/// The client that should seed: the lowest id present.
pub fn seed_leader(roster: &BTreeSet<ClientId>) -> Option<ClientId> {
    roster.iter().next().copied()
}

/// Outcome of one seed check.
#[derive(Debug, Clone)]
pub enum SeedDecision {
    /// This replica inserted the template.
    Inserted(LocalUpdate),
    /// Another client is expected to seed.
    NotLeader { leader: ClientId },
    /// The buffer already has content.
    BufferNotEmpty,
    /// No template to insert yet.
    NoTemplate,
    /// The guard fired before and is disarmed.
    AlreadySeeded,
}

impl SeedDecision {
    pub fn inserted(&self) -> bool {
        matches!(self, SeedDecision::Inserted(_))
    }
}

/// Holds the starter template and the one-shot flag.
#[derive(Debug, Clone, Default)]
pub struct SeedGuard {
    template: Option<String>,
    done: bool,
}

impl SeedGuard {
    pub fn new(template: Option<String>) -> Self {
        Self {
            template: template.filter(|t| !t.is_empty()),
            done: false,
        }
    }

    /// Supply or replace the template. An empty template counts as none.
    pub fn set_template(&mut self, template: impl Into<String>) {
        let template = template.into();
        self.template = (!template.is_empty()).then_some(template);
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    /// Whether the guard can still insert.
    pub fn is_armed(&self) -> bool {
        !self.done
    }

    /// Run one seed check for the client `local_id` against `roster`.
    /// Call only while synced.
    pub fn evaluate(
        &mut self,
        doc: &mut SharedDoc,
        local_id: ClientId,
        roster: &BTreeSet<ClientId>,
    ) -> Result<SeedDecision, DocError> {
        if self.done {
            return Ok(SeedDecision::AlreadySeeded);
        }
        if doc.text_len() > 0 {
            self.done = true;
            return Ok(SeedDecision::BufferNotEmpty);
        }
        let Some(template) = self.template.as_deref() else {
            return Ok(SeedDecision::NoTemplate);
        };

        let mut roster = roster.clone();
        roster.insert(local_id);
        let leader = seed_leader(&roster).unwrap_or(local_id);
        if leader != local_id {
            debug!("Client {leader} seeds the template, not {local_id}");
            return Ok(SeedDecision::NotLeader { leader });
        }

        let update = doc.insert_text(0, template)?;
        self.done = true;
        info!("Seeded starter template ({} bytes) as client {local_id}", template.len());
        Ok(SeedDecision::Inserted(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[ClientId]) -> BTreeSet<ClientId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_seed_leader_is_minimum() {
        assert_eq!(seed_leader(&roster(&[5, 2, 9])), Some(2));
        assert_eq!(seed_leader(&roster(&[])), None);
    }

    #[test]
    fn test_leader_inserts_once() {
        let mut doc = SharedDoc::new();
        let mut guard = SeedGuard::new(Some("def solve(): pass".into()));

        let first = guard.evaluate(&mut doc, 1, &roster(&[1, 4])).unwrap();
        assert!(first.inserted());
        assert_eq!(doc.text(), "def solve(): pass");

        // Even if the buffer is emptied again, the guard stays disarmed.
        doc.delete_text(0, doc.text_len()).unwrap();
        let second = guard.evaluate(&mut doc, 1, &roster(&[1, 4])).unwrap();
        assert!(matches!(second, SeedDecision::AlreadySeeded));
        assert_eq!(doc.text(), "");
    }

    #[test]
    fn test_non_leader_waits() {
        let mut doc = SharedDoc::new();
        let mut guard = SeedGuard::new(Some("x = 1".into()));

        let decision = guard.evaluate(&mut doc, 4, &roster(&[1, 4])).unwrap();
        assert!(matches!(decision, SeedDecision::NotLeader { leader: 1 }));
        assert!(guard.is_armed());

        // Leader left before seeding: re-evaluate with the smaller roster.
        let decision = guard.evaluate(&mut doc, 4, &roster(&[4])).unwrap();
        assert!(decision.inserted());
    }

    #[test]
    fn test_local_id_always_counts() {
        let mut doc = SharedDoc::new();
        let mut guard = SeedGuard::new(Some("x".into()));
        // Roster not yet containing us, and every peer has a higher id.
        let decision = guard.evaluate(&mut doc, 2, &roster(&[7, 8])).unwrap();
        assert!(decision.inserted());
    }

    #[test]
    fn test_non_empty_buffer_disarms() {
        let mut doc = SharedDoc::new();
        doc.insert_text(0, "existing").unwrap();
        let mut guard = SeedGuard::new(Some("template".into()));

        let decision = guard.evaluate(&mut doc, 1, &roster(&[1])).unwrap();
        assert!(matches!(decision, SeedDecision::BufferNotEmpty));
        assert!(!guard.is_armed());
        assert_eq!(doc.text(), "existing");
    }

    #[test]
    fn test_late_template() {
        let mut doc = SharedDoc::new();
        let mut guard = SeedGuard::new(None);

        let decision = guard.evaluate(&mut doc, 1, &roster(&[1])).unwrap();
        assert!(matches!(decision, SeedDecision::NoTemplate));
        assert!(guard.is_armed());

        guard.set_template("print()");
        assert!(guard.evaluate(&mut doc, 1, &roster(&[1])).unwrap().inserted());
    }

    #[test]
    fn test_empty_template_counts_as_none() {
        let mut guard = SeedGuard::new(Some(String::new()));
        assert!(guard.template().is_none());
        guard.set_template("");
        assert!(guard.template().is_none());
    }
}
