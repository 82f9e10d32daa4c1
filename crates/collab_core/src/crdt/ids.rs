//! Replica identifiers, operation ids and state vectors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one replica (one open document session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Placeholder under which seed content is drafted before its real
    /// replica id is known. Shares its replica with [`OpId::ROOT`].
    pub const SEED: ReplicaId = ReplicaId(0);

    /// A random replica id. Never collides with [`ReplicaId::SEED`].
    pub fn random() -> Self {
        let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
        ReplicaId(high.max(1))
    }

    /// Replica id that authors the encoded seed `content`. Name based, so
    /// every replica seeding the same content agrees on it and different
    /// content gets a different id.
    pub fn seed(content: &[u8]) -> Self {
        let (high, _) = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, content).as_u64_pair();
        ReplicaId(high.clamp(1, u64::MAX - 1))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Identifier of a change, or of one character inserted by a change.
///
/// Sequence numbers are contiguous per replica starting at 1. A text
/// insertion of `n` characters consumes `n` consecutive numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl OpId {
    /// The document root. Never produced by a change.
    pub const ROOT: OpId = OpId {
        replica: ReplicaId(0),
        seq: 0,
    };

    pub fn new(replica: ReplicaId, seq: u64) -> Self {
        Self { replica, seq }
    }

    /// The id `n` positions after this one in the same replica.
    pub fn offset(self, n: u64) -> Self {
        Self {
            replica: self.replica,
            seq: self.seq.saturating_add(n),
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.seq, self.replica)
    }
}

/// Total order used to break ties between concurrent changes.
///
/// Greater keys win last-writer-wins registers, and among items inserted
/// after the same anchor the greater key is placed closer to the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl OrderKey {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }
}

/// Highest contiguous sequence number applied per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest applied sequence number for `replica` (0 if none).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, seq: u64) {
        self.0.insert(replica, seq);
    }

    /// Whether `id` has been applied (or consumed).
    pub fn covers(&self, id: OpId) -> bool {
        id.seq <= self.get(id.replica)
    }

    /// Whether everything `other` has seen was also seen here.
    pub fn includes(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(r, s)| self.get(*r) >= *s)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|s| *s == 0)
    }

    /// Total number of sequence numbers covered.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, s)| (*r, *s))
    }

    /// Component-wise minimum: what every holder of the vectors has seen.
    pub fn meet(&self, other: &StateVector) -> StateVector {
        let mut out = StateVector::new();
        for (replica, seq) in self.iter() {
            let min = seq.min(other.get(replica));
            if min > 0 {
                out.set(replica, min);
            }
        }
        out
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        StateVector(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_key_breaks_ties_by_replica() {
        let a = OrderKey::new(3, ReplicaId(1));
        let b = OrderKey::new(3, ReplicaId(2));
        let c = OrderKey::new(4, ReplicaId(1));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_state_vector_cover_and_meet() {
        let mut sv = StateVector::new();
        sv.set(ReplicaId(1), 5);
        assert!(sv.covers(OpId::new(ReplicaId(1), 5)));
        assert!(!sv.covers(OpId::new(ReplicaId(1), 6)));
        assert!(!sv.covers(OpId::new(ReplicaId(2), 1)));

        let other: StateVector = [(ReplicaId(1), 3), (ReplicaId(2), 4)].into_iter().collect();
        let meet = sv.meet(&other);
        assert_eq!(meet.get(ReplicaId(1)), 3);
        assert_eq!(meet.get(ReplicaId(2)), 0);
        assert!(sv.includes(&meet));
        assert!(!sv.includes(&other));
    }

    #[test]
    fn test_seed_replica_depends_on_content() {
        assert_eq!(ReplicaId::seed(b"welcome"), ReplicaId::seed(b"welcome"));
        assert_ne!(ReplicaId::seed(b"welcome"), ReplicaId::seed(b"hi"));
        assert_ne!(ReplicaId::seed(b""), ReplicaId::SEED);
    }

    #[test]
    fn test_random_replica_is_never_seed() {
        for _ in 0..32 {
            assert_ne!(ReplicaId::random(), ReplicaId::SEED);
        }
    }
}
