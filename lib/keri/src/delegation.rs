//! Delegation approval tracking
//!
//! A delegated event moves through SealProposed, AwaitingApproval, Approved
//! and Witnessed. Approval is the delegator anchoring the event's seal, which
//! makes `Kevery` accept it; it is witnessed once its receipt quorum is met.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::KeriError;
use crate::kevery::Kevery;
use crate::quorum::WitnessQuorumCollector;
use crate::types::{DelegationRequest, Notice, WitnessingRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationPhase {
    SealProposed,
    AwaitingApproval,
    Approved,
    Witnessed,
    Abandoned,
}

impl DelegationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Witnessed | Self::Abandoned)
    }
}

/// Synchronous delegation state machine for one proposed event.
#[derive(Debug, Clone)]
pub struct DelegationTracker {
    proposal: DelegationRequest,
    phase: DelegationPhase,
    quorum: Option<WitnessQuorumCollector>,
}

impl DelegationTracker {
    pub fn new(proposal: DelegationRequest) -> Self {
        Self {
            proposal,
            phase: DelegationPhase::SealProposed,
            quorum: None,
        }
    }

    pub fn proposal(&self) -> &DelegationRequest {
        &self.proposal
    }

    pub fn phase(&self) -> DelegationPhase {
        self.phase
    }

    fn is_target(&self, pre: &str, sn: u64, said: &str) -> bool {
        self.proposal.pre == pre && self.proposal.sn == sn && self.proposal.said == said
    }

    fn transition(&mut self, phase: DelegationPhase) {
        if self.phase != phase {
            info!(
                "Delegated event {} for {}: {:?} -> {:?}",
                self.proposal.said, self.proposal.pre, self.phase, phase
            );
            self.phase = phase;
        }
    }

    /// The delegated event is escrowed awaiting the delegator's seal.
    pub fn awaiting_approval(&mut self) -> DelegationPhase {
        if self.phase == DelegationPhase::SealProposed {
            self.transition(DelegationPhase::AwaitingApproval);
        }
        self.phase
    }

    /// The delegated event was accepted; receipt collection starts.
    pub fn approved(&mut self, request: WitnessingRequest) -> DelegationPhase {
        if self.phase.is_terminal() || self.quorum.is_some() {
            return self.phase;
        }
        let mut quorum = WitnessQuorumCollector::new(request);
        quorum.solicit();
        let satisfied = quorum.is_satisfied();
        self.quorum = Some(quorum);
        self.transition(DelegationPhase::Approved);
        if satisfied {
            self.transition(DelegationPhase::Witnessed);
        }
        self.phase
    }

    pub fn receipted(&mut self, witness: &str) -> DelegationPhase {
        if self.phase != DelegationPhase::Approved {
            return self.phase;
        }
        let satisfied = self.quorum.as_mut().is_some_and(|q| {
            q.record_receipt(witness);
            q.is_satisfied()
        });
        if satisfied {
            self.transition(DelegationPhase::Witnessed);
        }
        self.phase
    }

    /// Advances on a notice about the proposed event; other notices are ignored.
    pub fn on_notice(&mut self, notice: &Notice) -> DelegationPhase {
        match notice {
            Notice::DelegationPending(request)
                if self.is_target(&request.pre, request.sn, &request.said) =>
            {
                self.awaiting_approval()
            }
            Notice::Accepted(request)
                if self.is_target(&request.pre, request.sn, &request.said) =>
            {
                self.approved(request.clone())
            }
            Notice::Receipted(receipt)
                if self.is_target(&receipt.pre, receipt.sn, &receipt.said) =>
            {
                self.receipted(&receipt.witness)
            }
            _ => self.phase,
        }
    }

    pub fn abandon(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.transition(DelegationPhase::Abandoned);
        true
    }

    /// Catches up from `kevery`'s current log and escrow.
    async fn seed(&mut self, kevery: &Kevery) {
        let kel = match kevery.kel(&self.proposal.pre).await {
            Ok(kel) => kel,
            Err(e) => {
                warn!("Failed to load log for {}: {}", self.proposal.pre, e);
                return;
            }
        };
        let applied = kel.as_ref().and_then(|kel| {
            let event = kel.event_at(self.proposal.sn)?;
            let state = kel.state_at(self.proposal.sn)?;
            (event.said() == self.proposal.said)
                .then(|| (WitnessingRequest::from_state(state), kel.receipted_by(event.said())))
        });

        match applied {
            Some((request, witnesses)) => {
                self.approved(request);
                for witness in witnesses {
                    self.receipted(&witness);
                }
            }
            None => {
                if kevery
                    .escrow()
                    .contains(&self.proposal.pre, &self.proposal.said)
                {
                    self.awaiting_approval();
                }
            }
        }
    }
}

/// Watches a delegated event until it is witnessed.
pub struct DelegationWatcher;

impl DelegationWatcher {
    /// Spawns a tracker for `proposal` fed by `kevery`'s notices.
    pub fn watch(kevery: Arc<Kevery>, proposal: DelegationRequest) -> DelegationHandle {
        let notices = kevery.subscribe();
        let tracker = DelegationTracker::new(proposal.clone());
        let (status_tx, status_rx) = watch::channel(tracker.phase());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_tracker(
            kevery,
            tracker,
            notices,
            status_tx,
            cancel.clone(),
        ));

        DelegationHandle {
            proposal,
            status: status_rx,
            cancel,
            task,
        }
    }
}

async fn run_tracker(
    kevery: Arc<Kevery>,
    mut tracker: DelegationTracker,
    mut notices: broadcast::Receiver<Notice>,
    status: watch::Sender<DelegationPhase>,
    cancel: CancellationToken,
) {
    tracker.seed(&kevery).await;
    status.send_replace(tracker.phase());

    while !tracker.phase().is_terminal() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracker.abandon();
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    tracker.on_notice(&notice);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Delegation watcher lagged by {} notice(s), re-reading state", skipped);
                    tracker.seed(&kevery).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracker.abandon();
                }
            },
        }
        status.send_replace(tracker.phase());
    }
}

/// Caller side of a delegation watcher. Dropping it abandons the wait.
pub struct DelegationHandle {
    proposal: DelegationRequest,
    status: watch::Receiver<DelegationPhase>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DelegationHandle {
    pub fn phase(&self) -> DelegationPhase {
        *self.status.borrow()
    }

    /// Waits until the phase is at least `phase`, or a terminal phase.
    pub async fn reached(&mut self, phase: DelegationPhase) -> DelegationPhase {
        let target = rank(phase);
        match self
            .status
            .wait_for(|p| p.is_terminal() || rank(*p) >= target)
            .await
        {
            Ok(current) => *current,
            Err(_) => DelegationPhase::Abandoned,
        }
    }

    /// Resolves once the delegated event is witnessed.
    pub async fn witnessed(&mut self) -> Result<(), KeriError> {
        match self.reached(DelegationPhase::Witnessed).await {
            DelegationPhase::Witnessed => Ok(()),
            _ => Err(KeriError::QuorumAbandoned {
                pre: self.proposal.pre.clone(),
                sn: self.proposal.sn,
            }),
        }
    }

    /// Waits up to `timeout`, abandoning the watch if it elapses.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), KeriError> {
        match tokio::time::timeout(timeout, self.witnessed()).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon();
                Err(KeriError::Timeout(format!(
                    "delegation of {} by {}",
                    self.proposal.pre, self.proposal.delegator
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

impl Drop for DelegationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn rank(phase: DelegationPhase) -> u8 {
    match phase {
        DelegationPhase::SealProposed => 0,
        DelegationPhase::AwaitingApproval => 1,
        DelegationPhase::Approved => 2,
        DelegationPhase::Witnessed => 3,
        DelegationPhase::Abandoned => 4,
    }
}
