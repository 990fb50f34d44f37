//! The consumer side of propagation.
//!
//! A data-plane instance keeps the last revision it applied for each entity and discards any
//! event that does not move that revision forward. This makes redelivery, reordering and
//! reconciliation re-sends harmless.

use crate::event::{EntityRef, PropagationEvent, Revision};
use ahash::AHashMap as HashMap;

#[derive(Clone, Debug, Default)]
pub struct AppliedVersions {
    applied: HashMap<EntityRef, Revision>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Apply {
    Applied,
    Stale { last: Revision },
}

impl AppliedVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the event's revision if it is newer than the last applied one.
    ///
    /// Deleted entities keep their revision so that late creates or updates stay stale.
    pub fn apply(&mut self, event: &PropagationEvent) -> Apply {
        match self.applied.get_mut(&event.entity) {
            Some(last) if *last >= event.revision => Apply::Stale { last: *last },
            Some(last) => {
                *last = event.revision;
                Apply::Applied
            }
            None => {
                self.applied.insert(event.entity.clone(), event.revision);
                Apply::Applied
            }
        }
    }

    pub fn revision(&self, entity: &EntityRef) -> Option<Revision> {
        self.applied.get(entity).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Operation, PropagationEvent},
        rule::{TcpRule, UNSPECIFIED_IP},
    };

    fn tcp(version: u64) -> PropagationEvent {
        PropagationEvent::tcp_rule(
            Operation::Update,
            TcpRule {
                rule_id: "t1".to_string(),
                workload_id: "w1".to_string(),
                container_port: 5432,
                ip: UNSPECIFIED_IP,
                port: 20001,
                extensions: vec![],
                version,
            },
        )
    }

    #[test]
    fn discards_old_and_duplicate_versions() {
        let mut applied = AppliedVersions::new();
        assert_eq!(applied.apply(&tcp(2)), Apply::Applied);
        assert_eq!(
            applied.apply(&tcp(2)),
            Apply::Stale {
                last: Revision::new(2, 0)
            }
        );
        assert_eq!(
            applied.apply(&tcp(1)),
            Apply::Stale {
                last: Revision::new(2, 0)
            }
        );
        assert_eq!(applied.apply(&tcp(3)), Apply::Applied);
        assert_eq!(
            applied.revision(&EntityRef::tcp_rule("t1")),
            Some(Revision::new(3, 0))
        );
    }

    #[test]
    fn late_update_after_delete_is_stale() {
        let mut applied = AppliedVersions::new();
        assert_eq!(applied.apply(&tcp(1)), Apply::Applied);
        let delete = PropagationEvent::deleted(EntityRef::tcp_rule("t1"), 2);
        assert_eq!(applied.apply(&delete), Apply::Applied);
        assert!(matches!(applied.apply(&tcp(1)), Apply::Stale { .. }));
    }

    #[test]
    fn entities_are_tracked_independently() {
        let mut applied = AppliedVersions::new();
        assert_eq!(applied.apply(&tcp(5)), Apply::Applied);
        let other = PropagationEvent::deleted(EntityRef::http_rule("t1"), 1);
        assert_eq!(applied.apply(&other), Apply::Applied);
    }
}
