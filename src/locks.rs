use std::collections::HashMap;

use parking_lot::Mutex;

use crate::core::{RelId, TxnId};

/// The host's relation lock manager. Every lock is scoped to the transaction that took it and
/// released by the host when that transaction ends.
pub trait LockManager: Send + Sync {
    /// Attempts to take an exclusive lock on `rel` without waiting.
    fn try_exclusive_lock(&self, txn: TxnId, rel: RelId) -> bool;

    fn release_lock(&self, txn: TxnId, rel: RelId);

    /// Whether `txn` currently holds an exclusive lock on `rel`.
    fn held_by_me(&self, txn: TxnId, rel: RelId) -> bool;
}

/// Why an all-or-nothing lock attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockConflict {
    /// The relation that could not be locked.
    pub(crate) rel: RelId,
    /// How many locks were taken during the attempt and released again.
    pub(crate) rolled_back: usize,
}

/// Takes exclusive locks on all of `rels`, or on none of them.
///
/// Relations already held by `txn` are skipped and never released here. On the first failed
/// attempt every lock newly taken by this call is released again, in reverse order.
/// Returns the newly taken locks on success.
pub(crate) fn try_lock_all(
    locks: &dyn LockManager,
    txn: TxnId,
    rels: impl IntoIterator<Item = RelId>,
) -> Result<Vec<RelId>, LockConflict> {
    let mut newly_locked = Vec::new();
    for rel in rels {
        if locks.held_by_me(txn, rel) {
            trace!(%txn, %rel, "lock already held");
            continue;
        }
        if locks.try_exclusive_lock(txn, rel) {
            trace!(%txn, %rel, "lock acquired");
            newly_locked.push(rel);
            continue;
        }

        // roll back this attempt only, locks from earlier statements stay
        let rolled_back = newly_locked.len();
        for locked in newly_locked.into_iter().rev() {
            locks.release_lock(txn, locked);
        }
        return Err(LockConflict { rel, rolled_back });
    }
    Ok(newly_locked)
}

/// Process-local lock table granting at most one exclusive holder per relation.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    holders: Mutex<HashMap<RelId, TxnId>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn holder(&self, rel: RelId) -> Option<TxnId> {
        self.holders.lock().get(&rel).copied()
    }

    /// Releases every lock of `txn`, as the host does on commit or abort.
    /// Returns the number of released locks.
    pub fn release_all(&self, txn: TxnId) -> usize {
        let mut holders = self.holders.lock();
        let before = holders.len();
        holders.retain(|_, holder| *holder != txn);
        before - holders.len()
    }
}

impl LockManager for InMemoryLockManager {
    fn try_exclusive_lock(&self, txn: TxnId, rel: RelId) -> bool {
        let mut holders = self.holders.lock();
        match holders.get(&rel) {
            Some(holder) => *holder == txn,
            None => {
                holders.insert(rel, txn);
                true
            }
        }
    }

    fn release_lock(&self, txn: TxnId, rel: RelId) {
        let mut holders = self.holders.lock();
        if holders.get(&rel) == Some(&txn) {
            holders.remove(&rel);
        }
    }

    fn held_by_me(&self, txn: TxnId, rel: RelId) -> bool {
        self.holders.lock().get(&rel) == Some(&txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(raw: u32) -> RelId {
        RelId::new(raw)
    }

    #[test]
    fn test_in_memory_exclusive_locks() {
        let locks = InMemoryLockManager::new();
        let (a, b) = (TxnId::new(1), TxnId::new(2));

        assert!(locks.try_exclusive_lock(a, rel(1)));
        assert!(!locks.try_exclusive_lock(b, rel(1)));
        assert!(locks.held_by_me(a, rel(1)));
        assert!(!locks.held_by_me(b, rel(1)));

        // only the holder may release
        locks.release_lock(b, rel(1));
        assert_eq!(locks.holder(rel(1)), Some(a));
        locks.release_lock(a, rel(1));
        assert_eq!(locks.holder(rel(1)), None);

        assert!(locks.try_exclusive_lock(a, rel(1)));
        assert!(locks.try_exclusive_lock(a, rel(2)));
        assert!(locks.try_exclusive_lock(b, rel(3)));
        assert_eq!(locks.release_all(a), 2);
        assert_eq!(locks.holder(rel(3)), Some(b));
    }

    #[test]
    fn test_try_lock_all_success_skips_held() {
        let locks = InMemoryLockManager::new();
        let txn = TxnId::new(7);
        assert!(locks.try_exclusive_lock(txn, rel(2)));

        let newly = try_lock_all(&locks, txn, [rel(1), rel(2), rel(3)]).unwrap();
        assert_eq!(newly, vec![rel(1), rel(3)]);
        assert!([1, 2, 3].iter().all(|r| locks.held_by_me(txn, rel(*r))));
    }

    #[test]
    fn test_try_lock_all_rolls_back_only_new_locks() {
        let locks = InMemoryLockManager::new();
        let (me, other) = (TxnId::new(1), TxnId::new(2));
        // held from an earlier statement of the same transaction
        assert!(locks.try_exclusive_lock(me, rel(5)));
        // held by a concurrent transaction
        assert!(locks.try_exclusive_lock(other, rel(3)));

        let conflict = try_lock_all(&locks, me, [rel(1), rel(5), rel(2), rel(3), rel(4)]).unwrap_err();
        assert_eq!(
            conflict,
            LockConflict {
                rel: rel(3),
                rolled_back: 2
            }
        );
        assert_eq!(locks.holder(rel(1)), None);
        assert_eq!(locks.holder(rel(2)), None);
        assert_eq!(locks.holder(rel(4)), None, "never attempted");
        assert!(locks.held_by_me(me, rel(5)), "earlier locks are kept");
        assert_eq!(locks.holder(rel(3)), Some(other));
    }
}
