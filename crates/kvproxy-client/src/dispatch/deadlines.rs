// Deadlines of calls already on the wire, owned by one channel executor.
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Which call a deadline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeadlineKey {
    pub(crate) worker: usize,
    pub(crate) epoch: u64,
    pub(crate) id: i32,
}

/// Handle for removing an entry once its call resolves.
pub(crate) type TimerKey = (Instant, u64);

/// Ordered by deadline, ties broken by insertion order. Entries are removed
/// eagerly when their call resolves, so the set only holds live calls.
#[derive(Debug, Default)]
pub(crate) struct DeadlineSet {
    entries: BTreeMap<TimerKey, DeadlineKey>,
    seq: u64,
}

impl DeadlineSet {
    pub(crate) fn insert(&mut self, deadline: Instant, key: DeadlineKey) -> TimerKey {
        let timer = (deadline, self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.entries.insert(timer, key);
        timer
    }

    pub(crate) fn remove(&mut self, timer: &TimerKey) {
        self.entries.remove(timer);
    }

    pub(crate) fn next(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|((deadline, _), _)| *deadline)
    }

    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<DeadlineKey> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(id: i32) -> DeadlineKey {
        DeadlineKey {
            worker: 0,
            epoch: 0,
            id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pops_in_deadline_order() {
        let now = Instant::now();
        let mut set = DeadlineSet::default();
        set.insert(now + Duration::from_millis(30), key(3));
        set.insert(now + Duration::from_millis(10), key(1));
        set.insert(now + Duration::from_millis(10), key(2));
        assert_eq!(set.next(), Some(now + Duration::from_millis(10)));

        let expired = set.pop_expired(now + Duration::from_millis(20));
        assert_eq!(expired, vec![key(1), key(2)]);
        assert_eq!(set.len(), 1);
        assert!(set.pop_expired(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_entries_never_fire() {
        let now = Instant::now();
        let mut set = DeadlineSet::default();
        let timer = set.insert(now, key(0));
        set.remove(&timer);
        assert!(set.next().is_none());
        assert!(set.pop_expired(now + Duration::from_secs(1)).is_empty());
    }
}
