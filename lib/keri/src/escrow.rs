//! Escrow for events and receipts that cannot be verified yet
//!
//! Entries are indexed by prefix so a drain touches only the entries of the
//! prefix whose state changed. Delegated events additionally register under
//! their delegator, so the delegator's next accepted event drains them too.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::types::{EscrowReason, Receipt, SignedEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum Escrowed {
    Event(SignedEvent),
    Receipt(Receipt),
}

impl Escrowed {
    pub fn pre(&self) -> &str {
        match self {
            Self::Event(signed) => signed.pre(),
            Self::Receipt(receipt) => &receipt.pre,
        }
    }

    pub fn sn(&self) -> u64 {
        match self {
            Self::Event(signed) => signed.sn(),
            Self::Receipt(receipt) => receipt.sn,
        }
    }

    pub fn said(&self) -> &str {
        match self {
            Self::Event(signed) => signed.said(),
            Self::Receipt(receipt) => &receipt.said,
        }
    }

    fn id(&self) -> String {
        match self {
            Self::Event(signed) => signed.said().to_string(),
            Self::Receipt(receipt) => receipt.id(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EscrowEntry {
    pub reason: EscrowReason,
    pub item: Escrowed,
    pub retries: u32,
    pub first_seen: Instant,
    /// Delegator whose approval this entry waits for
    pub waiting_on: Option<String>,
}

impl EscrowEntry {
    pub fn new(reason: EscrowReason, item: Escrowed) -> Self {
        Self {
            reason,
            item,
            retries: 0,
            first_seen: Instant::now(),
            waiting_on: None,
        }
    }

    pub fn waiting_on(mut self, delegator: impl Into<String>) -> Self {
        self.waiting_on = Some(delegator.into());
        self
    }
}

/// Ordered so a drain yields entries by ascending sn.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EscrowKey {
    sn: u64,
    reason: EscrowReason,
    id: String,
}

impl EscrowKey {
    fn of(entry: &EscrowEntry) -> Self {
        Self {
            sn: entry.item.sn(),
            reason: entry.reason,
            id: entry.item.id(),
        }
    }
}

#[derive(Default)]
struct EscrowTable {
    by_prefix: HashMap<String, BTreeMap<EscrowKey, EscrowEntry>>,
    /// delegator prefix -> delegate prefixes with entries waiting on it
    waiting_on: HashMap<String, BTreeSet<String>>,
}

impl EscrowTable {
    fn insert(&mut self, entry: EscrowEntry) {
        if let Some(ref delegator) = entry.waiting_on {
            self.waiting_on
                .entry(delegator.clone())
                .or_default()
                .insert(entry.item.pre().to_string());
        }
        self.by_prefix
            .entry(entry.item.pre().to_string())
            .or_default()
            .insert(EscrowKey::of(&entry), entry);
    }

    fn take_where(
        &mut self,
        pre: &str,
        keep: impl Fn(&EscrowEntry) -> bool,
    ) -> Vec<EscrowEntry> {
        let Some(entries) = self.by_prefix.get_mut(pre) else {
            return Vec::new();
        };
        let (taken, kept): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(entries).into_iter().partition(|(_, e)| !keep(e));
        *entries = kept;
        if entries.is_empty() {
            self.by_prefix.remove(pre);
        }
        taken.into_values().collect()
    }
}

/// Shared escrow table, safe for concurrent `defer` and `drain` by prefix.
pub struct EscrowStore {
    inner: Mutex<EscrowTable>,
    max_retries: u32,
}

impl EscrowStore {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(EscrowTable::default()),
            max_retries,
        }
    }

    fn table(&self) -> MutexGuard<'_, EscrowTable> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Files an entry. Returns false if the same item is already escrowed.
    pub fn defer(&self, entry: EscrowEntry) -> bool {
        let mut table = self.table();
        let id = entry.item.id();
        let sn = entry.item.sn();
        let present = table
            .by_prefix
            .get(entry.item.pre())
            .is_some_and(|entries| entries.keys().any(|k| k.sn == sn && k.id == id));
        if present {
            return false;
        }
        debug!(
            "Escrowed {} at sn {} ({})",
            entry.item.pre(),
            sn,
            entry.reason
        );
        table.insert(entry);
        true
    }

    /// Removes and returns every entry for `pre` plus the delegated entries
    /// waiting on `pre`, ordered by sn within each prefix.
    pub fn drain(&self, pre: &str) -> Vec<EscrowEntry> {
        let mut table = self.table();
        let mut drained = table.take_where(pre, |_| false);

        if let Some(delegates) = table.waiting_on.remove(pre) {
            for delegate in delegates {
                if delegate == pre {
                    continue;
                }
                drained.extend(
                    table.take_where(&delegate, |e| e.waiting_on.as_deref() != Some(pre)),
                );
            }
        }
        drained
    }

    /// Puts a still-blocked entry back. Returns it as `Err` once its retries
    /// exceed the ceiling.
    pub fn requeue(
        &self,
        mut entry: EscrowEntry,
        reason: EscrowReason,
        waiting_on: Option<String>,
    ) -> Result<(), EscrowEntry> {
        entry.retries += 1;
        entry.reason = reason;
        entry.waiting_on = waiting_on;
        if entry.retries > self.max_retries {
            return Err(entry);
        }
        self.table().insert(entry);
        Ok(())
    }

    /// Drops the escrowed copy of an event that has just been applied.
    pub fn purge(&self, pre: &str, sn: u64, said: &str) -> usize {
        self.table()
            .take_where(pre, |e| {
                let applied = matches!(e.item, Escrowed::Event(_)) && e.item.said() == said;
                !(e.item.sn() == sn && applied)
            })
            .len()
    }

    /// Removes and returns entries first seen more than `max_age` ago.
    pub fn evict(&self, max_age: Duration) -> Vec<EscrowEntry> {
        let mut table = self.table();
        let prefixes: Vec<String> = table.by_prefix.keys().cloned().collect();
        let mut evicted = Vec::new();
        for pre in prefixes {
            evicted.extend(table.take_where(&pre, |e| e.first_seen.elapsed() <= max_age));
        }
        evicted
    }

    pub fn contains(&self, pre: &str, said: &str) -> bool {
        self.table()
            .by_prefix
            .get(pre)
            .is_some_and(|entries| entries.values().any(|e| e.item.said() == said))
    }

    pub fn len(&self) -> usize {
        self.table().by_prefix.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, KeyState, WitnessConfig};

    fn chain(len: u64) -> Vec<SignedEvent> {
        let icp = Event::inception(
            vec!["k".to_string()],
            1,
            Some("c".to_string()),
            WitnessConfig::default(),
            vec![],
        )
        .unwrap();
        let mut state = KeyState::project(None, &icp).unwrap();
        let mut events = vec![SignedEvent::new(icp, vec![])];
        for _ in 1..len {
            let ixn = Event::interaction(&state, vec![]).unwrap();
            state = KeyState::project(Some(&state), &ixn).unwrap();
            events.push(SignedEvent::new(ixn, vec![]));
        }
        events
    }

    fn out_of_order(signed: &SignedEvent) -> EscrowEntry {
        EscrowEntry::new(EscrowReason::OutOfOrder, Escrowed::Event(signed.clone()))
    }

    #[test]
    fn test_defer_is_idempotent() {
        let events = chain(2);
        let store = EscrowStore::new(8);
        assert!(store.defer(out_of_order(&events[1])));
        assert!(!store.defer(out_of_order(&events[1])));
        assert_eq!(store.len(), 1);
        assert!(store.contains(events[1].pre(), events[1].said()));
    }

    #[test]
    fn test_drain_orders_by_sn() {
        let events = chain(4);
        let store = EscrowStore::new(8);
        store.defer(out_of_order(&events[3]));
        store.defer(out_of_order(&events[1]));
        store.defer(out_of_order(&events[2]));

        let drained = store.drain(events[0].pre());
        let sns: Vec<u64> = drained.iter().map(|e| e.item.sn()).collect();
        assert_eq!(sns, vec![1, 2, 3]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_drain_includes_waiting_delegates() {
        let delegate = chain(1);
        let unrelated = chain(2);
        let store = EscrowStore::new(8);
        store.defer(
            EscrowEntry::new(
                EscrowReason::MissingDelegation,
                Escrowed::Event(delegate[0].clone()),
            )
            .waiting_on("Edelegator"),
        );
        store.defer(out_of_order(&unrelated[1]));

        let drained = store.drain("Edelegator");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].item.said(), delegate[0].said());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_requeue_counts_retries() {
        let events = chain(2);
        let store = EscrowStore::new(1);
        store.defer(out_of_order(&events[1]));

        let entry = store.drain(events[1].pre()).remove(0);
        let first_seen = entry.first_seen;
        assert!(store.requeue(entry, EscrowReason::OutOfOrder, None).is_ok());

        let entry = store.drain(events[1].pre()).remove(0);
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.first_seen, first_seen);
        let expired = store
            .requeue(entry, EscrowReason::OutOfOrder, None)
            .unwrap_err();
        assert_eq!(expired.retries, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_only_removes_applied_said() {
        let events = chain(2);
        let store = EscrowStore::new(8);
        store.defer(out_of_order(&events[1]));
        assert_eq!(store.purge(events[1].pre(), 1, "Esomething-else"), 0);
        assert_eq!(store.purge(events[1].pre(), 1, events[1].said()), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_by_age() {
        let events = chain(3);
        let store = EscrowStore::new(8);
        store.defer(out_of_order(&events[1]));
        tokio::time::advance(Duration::from_secs(30)).await;
        store.defer(out_of_order(&events[2]));
        tokio::time::advance(Duration::from_secs(40)).await;

        let evicted = store.evict(Duration::from_secs(60));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].item.sn(), 1);
        assert_eq!(store.len(), 1);
    }
}
