//! Witness receipt quorum collection
//!
//! [`WitnessQuorumCollector`] counts distinct witness receipts for one
//! accepted event. [`WitnessQuorumCollector::watch`] runs a collector as a
//! task fed by [`Kevery`]'s receipt notices and hands back a [`QuorumHandle`]
//! the caller can await, time out, or abandon.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::KeriError;
use crate::kevery::Kevery;
use crate::types::{Notice, ReceiptNotice, WitnessingRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    Pending,
    Collecting,
    Satisfied,
    Abandoned,
}

impl CollectorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Satisfied | Self::Abandoned)
    }
}

/// Progress reported after each receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    Pending { received: usize, required: usize },
    Satisfied,
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct WitnessQuorumCollector {
    target: WitnessingRequest,
    received: BTreeSet<String>,
    phase: CollectorPhase,
}

impl WitnessQuorumCollector {
    pub fn new(target: WitnessingRequest) -> Self {
        let phase = if target.toad == 0 {
            CollectorPhase::Satisfied
        } else {
            CollectorPhase::Pending
        };
        Self {
            target,
            received: BTreeSet::new(),
            phase,
        }
    }

    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    pub fn is_satisfied(&self) -> bool {
        self.phase == CollectorPhase::Satisfied
    }

    pub fn received(&self) -> impl Iterator<Item = &str> {
        self.received.iter().map(String::as_str)
    }

    /// Marks the start of solicitation.
    pub fn solicit(&mut self) {
        if self.phase == CollectorPhase::Pending {
            self.phase = CollectorPhase::Collecting;
        }
    }

    pub fn quorum(&self) -> Quorum {
        match self.phase {
            CollectorPhase::Satisfied => Quorum::Satisfied,
            CollectorPhase::Abandoned => Quorum::Abandoned,
            CollectorPhase::Pending | CollectorPhase::Collecting => Quorum::Pending {
                received: self.received.len(),
                required: self.target.toad,
            },
        }
    }

    /// Counts a receipt from `witness`. Repeats and non-members are not counted;
    /// receipts after satisfaction are recorded without changing the phase.
    pub fn record_receipt(&mut self, witness: &str) -> Quorum {
        if self.phase == CollectorPhase::Abandoned {
            return Quorum::Abandoned;
        }
        if !self.target.witnesses.iter().any(|w| w == witness) {
            debug!("Ignoring receipt from non-witness {}", witness);
            return self.quorum();
        }
        if !self.received.insert(witness.to_string()) || self.is_satisfied() {
            return self.quorum();
        }

        self.phase = CollectorPhase::Collecting;
        if self.received.len() >= self.target.toad {
            self.phase = CollectorPhase::Satisfied;
            info!(
                "Witness quorum reached for {} at sn {} ({}/{})",
                self.target.pre,
                self.target.sn,
                self.received.len(),
                self.target.toad
            );
        }
        self.quorum()
    }

    /// Records a receipt notice if it is for the target event.
    pub fn record(&mut self, notice: &ReceiptNotice) -> Quorum {
        if notice.pre != self.target.pre
            || notice.sn != self.target.sn
            || notice.said != self.target.said
        {
            return self.quorum();
        }
        self.record_receipt(&notice.witness)
    }

    /// Returns false if the collector had already finished.
    pub fn abandon(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = CollectorPhase::Abandoned;
        info!(
            "Abandoned witness quorum for {} at sn {}",
            self.target.pre, self.target.sn
        );
        true
    }

    /// Spawns a collector for `request` driven by `kevery`'s receipt notices.
    pub fn watch(kevery: Arc<Kevery>, request: WitnessingRequest) -> QuorumHandle {
        // Subscribe before seeding so no receipt falls between the two.
        let notices = kevery.subscribe();
        let (pre, sn) = (request.pre.clone(), request.sn);
        let mut collector = Self::new(request);
        collector.solicit();

        let (status_tx, status_rx) = watch::channel(QuorumStatus::of(&collector));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_collector(
            kevery,
            collector,
            notices,
            status_tx,
            cancel.clone(),
        ));

        QuorumHandle {
            pre,
            sn,
            status: status_rx,
            cancel,
            task,
        }
    }

    async fn seed(&mut self, kevery: &Kevery) {
        match kevery.receipts(&self.target.pre, &self.target.said).await {
            Ok(witnesses) => {
                for witness in witnesses {
                    self.record_receipt(&witness);
                }
            }
            Err(e) => warn!("Failed to load receipts for {}: {}", self.target.said, e),
        }
    }
}

async fn run_collector(
    kevery: Arc<Kevery>,
    mut collector: WitnessQuorumCollector,
    mut notices: broadcast::Receiver<Notice>,
    status: watch::Sender<QuorumStatus>,
    cancel: CancellationToken,
) {
    collector.seed(&kevery).await;
    status.send_replace(QuorumStatus::of(&collector));

    while !collector.phase().is_terminal() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                collector.abandon();
            }
            notice = notices.recv() => match notice {
                Ok(Notice::Receipted(receipt)) => {
                    collector.record(&receipt);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Quorum collector lagged by {} notice(s), re-reading receipts", skipped);
                    collector.seed(&kevery).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    collector.abandon();
                }
            },
        }
        status.send_replace(QuorumStatus::of(&collector));
    }
}

/// Snapshot published by a watched collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumStatus {
    pub phase: CollectorPhase,
    pub quorum: Quorum,
}

impl QuorumStatus {
    fn of(collector: &WitnessQuorumCollector) -> Self {
        Self {
            phase: collector.phase(),
            quorum: collector.quorum(),
        }
    }
}

/// Caller side of a watched collector. Dropping it abandons the wait.
pub struct QuorumHandle {
    pre: String,
    sn: u64,
    status: watch::Receiver<QuorumStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl QuorumHandle {
    pub fn phase(&self) -> CollectorPhase {
        self.status.borrow().phase
    }

    pub fn quorum(&self) -> Quorum {
        self.status.borrow().quorum
    }

    /// Resolves once the quorum is satisfied; errors if it is abandoned.
    pub async fn satisfied(&mut self) -> Result<(), KeriError> {
        let phase = self
            .status
            .wait_for(|s| s.phase.is_terminal())
            .await
            .map_err(|_| KeriError::ChannelClosed)?
            .phase;
        match phase {
            CollectorPhase::Satisfied => Ok(()),
            _ => Err(KeriError::QuorumAbandoned {
                pre: self.pre.clone(),
                sn: self.sn,
            }),
        }
    }

    /// Waits up to `timeout`, abandoning the collection if it elapses.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), KeriError> {
        match tokio::time::timeout(timeout, self.satisfied()).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon();
                Err(KeriError::Timeout(format!(
                    "witness receipts for {} at sn {}",
                    self.pre, self.sn
                )))
            }
        }
    }

    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for QuorumHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
