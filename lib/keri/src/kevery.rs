//! Kevery - the key event processor
//!
//! Ingests events and receipts, validates them against the applied logs,
//! persists what is accepted, escrows what cannot be verified yet, and
//! broadcasts [`Notice`]s for quorum collectors and delegation watchers.
//!
//! Each prefix's log sits behind its own async mutex, so one identifier's
//! events are applied strictly in order while different identifiers proceed
//! in parallel. The prefix map, the seal index and the escrow use short
//! synchronous locks that are never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KeveryConfig;
use crate::error::KeriError;
use crate::escrow::{EscrowEntry, EscrowStore, Escrowed};
use crate::kel::{Kel, LogEntry};
use crate::store::KelStore;
use crate::types::{
    DelegationRequest, DuplicityNotice, EscrowReason, KeyState, Message, Notice, Outcome,
    Receipt, ReceiptNotice, RejectReason, SignedEvent, StuckNotice, WitnessingRequest,
};
use crate::validator::{
    AnchorLookup, ReceiptVerdict, SealIndex, Verdict, validate, validate_receipt,
};

type SharedKel = Arc<Mutex<Kel>>;

/// Result of evaluating one event, plus the prefix whose escrow it unblocked.
struct Evaluation {
    outcome: Outcome,
    wake: Option<String>,
}

impl Evaluation {
    fn settled(outcome: Outcome) -> Self {
        Self {
            outcome,
            wake: None,
        }
    }
}

pub struct Kevery {
    store: Arc<dyn KelStore>,
    escrow: Arc<EscrowStore>,
    logs: RwLock<HashMap<String, SharedKel>>,
    anchors: RwLock<SealIndex>,
    notices: broadcast::Sender<Notice>,
    config: KeveryConfig,
}

impl Kevery {
    pub fn new(store: Arc<dyn KelStore>, config: KeveryConfig) -> Self {
        let escrow = Arc::new(EscrowStore::new(config.escrow_max_retries));
        Self::with_escrow(store, escrow, config)
    }

    /// Uses a caller-provided escrow table.
    pub fn with_escrow(
        store: Arc<dyn KelStore>,
        escrow: Arc<EscrowStore>,
        config: KeveryConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Self {
            store,
            escrow,
            logs: RwLock::new(HashMap::new()),
            anchors: RwLock::new(SealIndex::new()),
            notices,
            config,
        }
    }

    pub fn config(&self) -> &KeveryConfig {
        &self.config
    }

    pub fn escrow(&self) -> &Arc<EscrowStore> {
        &self.escrow
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    // ==================== Ingestion ====================

    /// Processes one event, receipt or forwarded event, then re-evaluates
    /// every escrowed item the resulting state change may unblock.
    pub async fn process(&self, message: impl Into<Message>) -> Result<Outcome, KeriError> {
        match message.into() {
            Message::Event(signed) => self.process_event(signed).await,
            Message::Receipt(receipt) => self.evaluate_receipt(receipt, None).await,
            Message::Forward(fwd) => {
                debug!(
                    "Processing event {} forwarded to {} ({})",
                    fwd.message.said(),
                    fwd.recipient,
                    fwd.topic
                );
                self.process_event(fwd.message).await
            }
        }
    }

    async fn process_event(&self, signed: SignedEvent) -> Result<Outcome, KeriError> {
        let pre = signed.pre().to_string();
        let said = signed.said().to_string();
        let sn = signed.sn();
        let Evaluation { outcome, wake } = self.evaluate_event(signed, None).await?;
        let Some(wake) = wake else {
            return Ok(outcome);
        };
        let woke_delegator = wake != pre;
        self.cascade(wake).await?;

        // An approval that landed while the event was being escrowed applies it here
        if woke_delegator && outcome.is_deferred() {
            return Ok(self.applied_state(&pre, sn, &said).await?.unwrap_or(outcome));
        }
        Ok(outcome)
    }

    /// Re-evaluates escrow, following every prefix whose state changes.
    async fn cascade(&self, pre: String) -> Result<(), KeriError> {
        let mut pending = VecDeque::from([pre]);
        while let Some(pre) = pending.pop_front() {
            for entry in self.escrow.drain(&pre) {
                let backup = entry.clone();
                let result = match entry.item.clone() {
                    Escrowed::Event(signed) => self
                        .evaluate_event(signed, Some(entry))
                        .await
                        .map(|evaluation| evaluation.wake),
                    Escrowed::Receipt(receipt) => self
                        .evaluate_receipt(receipt, Some(entry))
                        .await
                        .map(|_| None),
                };
                match result {
                    Ok(Some(wake)) => {
                        if !pending.contains(&wake) {
                            pending.push_back(wake);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.escrow.defer(backup);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn evaluate_event(
        &self,
        signed: SignedEvent,
        escrowed: Option<EscrowEntry>,
    ) -> Result<Evaluation, KeriError> {
        let pre = signed.pre().to_string();
        let handle = self.handle(&pre).await?;
        let mut kel = handle.lock().await;
        let result = self.evaluate_locked(signed, escrowed, &pre, &mut kel).await;
        self.release(&pre, &handle, &kel);
        result
    }

    /// Validates and applies `signed` while its prefix's log is locked.
    async fn evaluate_locked(
        &self,
        signed: SignedEvent,
        escrowed: Option<EscrowEntry>,
        pre: &str,
        kel: &mut Kel,
    ) -> Result<Evaluation, KeriError> {
        let delegator = signed
            .event
            .delegator
            .clone()
            .or_else(|| kel.state().and_then(|s| s.delegator.clone()));
        if signed.event.is_delegated()
            && let Some(ref delegator) = delegator
            && delegator != pre
        {
            self.ensure_loaded(delegator).await?;
        }

        let verdict = {
            let anchors = self.anchors.read().unwrap_or_else(|e| e.into_inner());
            validate(&signed, kel, &*anchors)
        };

        match verdict {
            Verdict::Apply(state) => {
                self.store
                    .append(pre, &LogEntry::Event(signed.clone()))
                    .await?;
                self.anchors
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .index(&signed.event);
                kel.append(signed.clone(), state.clone());
                self.escrow.purge(pre, state.sn, &state.said);

                info!(
                    "Accepted {} event {} for {} at sn {}",
                    signed.event.ilk, state.said, pre, state.sn
                );
                self.notify(Notice::Accepted(WitnessingRequest::from_state(&state)));
                Ok(Evaluation {
                    outcome: Outcome::Accepted(state),
                    wake: Some(pre.to_string()),
                })
            }
            Verdict::Redelivered => {
                debug!("Re-delivery of {} at sn {}", signed.said(), signed.sn());
                let state = kel
                    .state()
                    .cloned()
                    .ok_or_else(|| KeriError::InvalidKel(format!("{} has no state", pre)))?;
                Ok(Evaluation::settled(Outcome::Accepted(state)))
            }
            Verdict::Reject(RejectReason::Duplicity) => {
                let applied = kel.event_at(signed.sn()).map(|e| e.said().to_string());
                if kel.record_evidence(signed.clone()) {
                    self.store
                        .append(pre, &LogEntry::Evidence(signed.clone()))
                        .await?;
                    warn!(
                        "Duplicity for {} at sn {}: {} conflicts with {:?}",
                        pre,
                        signed.sn(),
                        signed.said(),
                        applied
                    );
                    self.notify(Notice::Duplicity(DuplicityNotice {
                        pre: pre.to_string(),
                        sn: signed.sn(),
                        applied,
                        conflicting: signed.said().to_string(),
                    }));
                }
                Ok(Evaluation::settled(Outcome::Rejected(RejectReason::Duplicity)))
            }
            Verdict::Reject(reason) => {
                debug!("Rejected {} at sn {}: {}", signed.said(), signed.sn(), reason);
                Ok(Evaluation::settled(Outcome::Rejected(reason)))
            }
            Verdict::Defer(reason) => {
                let waiting_on = match reason {
                    EscrowReason::MissingDelegation => delegator,
                    _ => None,
                };
                let request = waiting_on.clone().map(|delegator| DelegationRequest {
                    pre: pre.to_string(),
                    sn: signed.sn(),
                    said: signed.said().to_string(),
                    delegator,
                });

                let mut escrowed_now = false;
                let outcome = match escrowed {
                    Some(entry) => {
                        let was_waiting = entry.reason == EscrowReason::MissingDelegation;
                        match self.escrow.requeue(entry, reason, waiting_on.clone()) {
                            Ok(()) => {
                                escrowed_now = true;
                                if !was_waiting && let Some(request) = request {
                                    self.notify(Notice::DelegationPending(request));
                                }
                                Outcome::Deferred(reason)
                            }
                            Err(expired) => {
                                self.report_stuck(&expired);
                                Outcome::Rejected(RejectReason::EscrowExpired)
                            }
                        }
                    }
                    None => {
                        let mut entry = EscrowEntry::new(reason, Escrowed::Event(signed.clone()));
                        entry.waiting_on = waiting_on.clone();
                        escrowed_now = true;
                        if self.escrow.defer(entry)
                            && let Some(request) = request
                        {
                            info!(
                                "{} at sn {} awaits approval from {}",
                                request.pre, request.sn, request.delegator
                            );
                            self.notify(Notice::DelegationPending(request));
                        }
                        Outcome::Deferred(reason)
                    }
                };

                // The delegator may have anchored the event between validation and
                // escrow, after its own drain ran; re-check now the entry is visible.
                let wake = waiting_on.filter(|delegator| {
                    escrowed_now && self.is_approved(delegator, pre, signed.sn(), signed.said())
                });
                if let Some(ref delegator) = wake {
                    debug!("{} was anchored by {} while escrowing", signed.said(), delegator);
                }
                Ok(Evaluation { outcome, wake })
            }
        }
    }

    async fn evaluate_receipt(
        &self,
        receipt: Receipt,
        escrowed: Option<EscrowEntry>,
    ) -> Result<Outcome, KeriError> {
        let pre = receipt.pre.clone();
        let handle = self.existing(&pre).await?;
        let mut kel = match handle {
            Some(ref handle) => Some(handle.lock().await),
            None => None,
        };
        let result = self.judge_receipt(receipt, escrowed, kel.as_deref_mut()).await;
        if let (Some(handle), Some(kel)) = (handle.as_ref(), kel.as_deref()) {
            self.release(&pre, handle, kel);
        }
        result
    }

    async fn judge_receipt(
        &self,
        receipt: Receipt,
        escrowed: Option<EscrowEntry>,
        mut kel: Option<&mut Kel>,
    ) -> Result<Outcome, KeriError> {
        match validate_receipt(&receipt, kel.as_deref()) {
            ReceiptVerdict::Record => {
                let Some(kel) = kel.as_mut() else {
                    return Err(KeriError::InvalidKel(format!("{} has no log", receipt.pre)));
                };
                self.store
                    .append(&receipt.pre, &LogEntry::Receipt(receipt.clone()))
                    .await?;
                kel.add_receipt(receipt.clone());
                debug!(
                    "Receipt from {} for {} at sn {}",
                    receipt.witness, receipt.pre, receipt.sn
                );
                self.notify(Notice::Receipted(ReceiptNotice {
                    pre: receipt.pre.clone(),
                    sn: receipt.sn,
                    said: receipt.said.clone(),
                    witness: receipt.witness.clone(),
                }));
                current_state(kel.state(), &receipt.pre)
            }
            ReceiptVerdict::Duplicate => {
                current_state(kel.as_deref().and_then(Kel::state), &receipt.pre)
            }
            ReceiptVerdict::Reject(reason) => {
                debug!(
                    "Rejected receipt from {} for {}: {}",
                    receipt.witness, receipt.said, reason
                );
                Ok(Outcome::Rejected(reason))
            }
            ReceiptVerdict::Defer(reason) => match escrowed {
                Some(entry) => match self.escrow.requeue(entry, reason, None) {
                    Ok(()) => Ok(Outcome::Deferred(reason)),
                    Err(expired) => {
                        self.report_stuck(&expired);
                        Ok(Outcome::Rejected(RejectReason::EscrowExpired))
                    }
                },
                None => {
                    self.escrow
                        .defer(EscrowEntry::new(reason, Escrowed::Receipt(receipt)));
                    Ok(Outcome::Deferred(reason))
                }
            },
        }
    }

    // ==================== Escrow maintenance ====================

    /// Expires escrowed items older than the configured maximum age.
    pub fn evict_stale(&self) -> Vec<StuckNotice> {
        self.escrow
            .evict(self.config.escrow_max_age)
            .iter()
            .map(|entry| self.report_stuck(entry))
            .collect()
    }

    /// Runs `evict_stale` every `interval` until `cancel` fires.
    pub fn spawn_escrow_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let kevery = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Escrow sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired = kevery.evict_stale();
                        if !expired.is_empty() {
                            info!("Expired {} escrowed item(s)", expired.len());
                        }
                    }
                }
            }
        })
    }

    fn report_stuck(&self, entry: &EscrowEntry) -> StuckNotice {
        let notice = StuckNotice {
            reason: entry.reason,
            pre: entry.item.pre().to_string(),
            sn: entry.item.sn(),
            said: entry.item.said().to_string(),
            retries: entry.retries,
        };
        warn!(
            "Escrow expired for {} at sn {} ({}, {} retries)",
            notice.pre, notice.sn, notice.reason, notice.retries
        );
        self.notify(Notice::Stuck(notice.clone()));
        notice
    }

    // ==================== Queries ====================

    pub async fn key_state(&self, pre: &str) -> Result<Option<KeyState>, KeriError> {
        let state = self.inspect(pre, |kel| kel.state().cloned()).await?;
        Ok(state.flatten())
    }

    /// Snapshot of the applied log.
    pub async fn kel(&self, pre: &str) -> Result<Option<Kel>, KeriError> {
        let kel = self
            .inspect(pre, |kel| {
                (!kel.is_empty() || !kel.evidence().is_empty()).then(|| kel.clone())
            })
            .await?;
        Ok(kel.flatten())
    }

    /// Witnesses that have receipted `said` in `pre`'s log.
    pub async fn receipts(&self, pre: &str, said: &str) -> Result<Vec<String>, KeriError> {
        let witnesses = self.inspect(pre, |kel| kel.receipted_by(said)).await?;
        Ok(witnesses.unwrap_or_default())
    }

    /// Whether `delegator` has anchored the delegated event (pre, sn, said).
    pub fn is_approved(&self, delegator: &str, pre: &str, sn: u64, said: &str) -> bool {
        self.anchors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_anchored(delegator, pre, sn, said)
    }

    // ==================== Internals ====================

    fn notify(&self, notice: Notice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn cached(&self, pre: &str) -> Option<SharedKel> {
        self.logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pre)
            .cloned()
    }

    /// The log for `pre`, loading it from the store on first use.
    async fn existing(&self, pre: &str) -> Result<Option<SharedKel>, KeriError> {
        if let Some(handle) = self.cached(pre) {
            return Ok(Some(handle));
        }
        let Some(kel) = self.store.load(pre).await? else {
            return Ok(None);
        };
        {
            let mut anchors = self.anchors.write().unwrap_or_else(|e| e.into_inner());
            for signed in kel.events() {
                anchors.index(&signed.event);
            }
        }
        debug!("Loaded {} event(s) for {}", kel.len(), pre);
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        Ok(Some(
            logs.entry(pre.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(kel)))
                .clone(),
        ))
    }

    /// Loads `pre`'s log from the store if it is not in memory yet.
    async fn ensure_loaded(&self, pre: &str) -> Result<(), KeriError> {
        if self
            .logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(pre)
        {
            return Ok(());
        }
        self.existing(pre).await.map(|_| ())
    }

    /// Like `existing`, but starts an empty log for a prefix never seen before.
    /// The empty log only serialises events for that prefix and is dropped by
    /// `release` unless something is applied to it.
    async fn handle(&self, pre: &str) -> Result<SharedKel, KeriError> {
        if let Some(handle) = self.existing(pre).await? {
            return Ok(handle);
        }
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        Ok(logs
            .entry(pre.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Kel::new())))
            .clone())
    }

    /// Forgets `pre` while its log is still empty and no other task holds it.
    fn release(&self, pre: &str, handle: &SharedKel, kel: &Kel) {
        if !kel.is_empty() || !kel.evidence().is_empty() {
            return;
        }
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held by the caller
        let unshared = Arc::strong_count(handle) == 2;
        if unshared && logs.get(pre).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            logs.remove(pre);
        }
    }

    async fn inspect<T>(
        &self,
        pre: &str,
        read: impl FnOnce(&Kel) -> T,
    ) -> Result<Option<T>, KeriError> {
        let Some(handle) = self.existing(pre).await? else {
            return Ok(None);
        };
        let kel = handle.lock().await;
        let value = read(&kel);
        self.release(pre, &handle, &kel);
        Ok(Some(value))
    }

    /// The state after (sn, said) if that event is applied.
    async fn applied_state(
        &self,
        pre: &str,
        sn: u64,
        said: &str,
    ) -> Result<Option<Outcome>, KeriError> {
        let state = self
            .inspect(pre, |kel| {
                kel.event_at(sn)
                    .filter(|event| event.said() == said)
                    .and_then(|_| kel.state_at(sn).cloned())
            })
            .await?;
        Ok(state.flatten().map(Outcome::Accepted))
    }
}

fn current_state(state: Option<&KeyState>, pre: &str) -> Result<Outcome, KeriError> {
    state
        .cloned()
        .map(Outcome::Accepted)
        .ok_or_else(|| KeriError::InvalidKel(format!("{} has no state", pre)))
}
