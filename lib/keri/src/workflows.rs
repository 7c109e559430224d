//! Controller workflows - incept, rotate, interact, delegate
//!
//! A [`Habitat`] is a locally controlled identifier. It builds and signs
//! events with a [`KeyProvider`], applies them through a shared [`Kevery`],
//! publishes them to witnesses over a [`WitnessTransport`], and waits for the
//! witness quorum (or delegation) that marks the operation complete.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::crypto::KeyProvider;
use crate::delegation::{DelegationPhase, DelegationWatcher};
use crate::error::KeriError;
use crate::kevery::Kevery;
use crate::quorum::WitnessQuorumCollector;
use crate::types::{
    DelegationRequest, Event, Forward, KeyState, Outcome, Seal, SignedEvent, WitnessConfig,
    WitnessingRequest, forward, next_witnesses,
};

/// Delivery of events to witnesses and mailboxes.
///
/// Receipts produced by witnesses come back through `Kevery::process`.
#[async_trait]
pub trait WitnessTransport: Send + Sync {
    /// Delivers a signed event to one witness.
    async fn publish(&self, witness: &str, event: &SignedEvent) -> Result<(), KeriError>;

    /// Delivers a forwarded event to its recipient's mailbox.
    async fn forward(&self, message: Forward) -> Result<(), KeriError>;
}

// ==================== Options & Reports ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InceptOptions {
    pub icount: usize,
    pub isith: usize,
    /// Zero makes the identifier non-transferable
    pub ncount: usize,
    pub witnesses: Vec<String>,
    /// Defaults to a simple majority of `witnesses`
    pub toad: Option<usize>,
    pub data: Vec<Seal>,
}

impl Default for InceptOptions {
    fn default() -> Self {
        Self {
            icount: 1,
            isith: 1,
            ncount: 1,
            witnesses: Vec::new(),
            toad: None,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateOptions {
    /// Full replacement witness list; exclusive with `adds`/`cuts`
    pub witnesses: Option<Vec<String>>,
    pub adds: Vec<String>,
    pub cuts: Vec<String>,
    pub signing_threshold: Option<usize>,
    pub next_count: usize,
    pub toad: Option<usize>,
    pub data: Vec<Seal>,
}

impl Default for RotateOptions {
    fn default() -> Self {
        Self {
            witnesses: None,
            adds: Vec::new(),
            cuts: Vec::new(),
            signing_threshold: None,
            next_count: 1,
            toad: None,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateOptions {
    pub delegator: String,
    pub transferable: bool,
    pub witnesses: Vec<String>,
    pub icount: usize,
    pub isith: usize,
    pub ncount: usize,
    /// Signing threshold for the next keys, applied by the first rotation
    pub nsith: Option<usize>,
    pub toad: Option<usize>,
}

impl DelegateOptions {
    pub fn new(delegator: impl Into<String>) -> Self {
        Self {
            delegator: delegator.into(),
            transferable: true,
            witnesses: Vec::new(),
            icount: 1,
            isith: 1,
            ncount: 1,
            nsith: None,
            toad: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub pre: String,
    pub sn: u64,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationReport {
    pub pre: String,
    pub delegator: String,
    pub sn: u64,
    pub keys: Vec<String>,
}

/// Simple majority of `witness_count`; zero without witnesses.
pub fn default_toad(witness_count: usize) -> usize {
    if witness_count == 0 {
        0
    } else {
        witness_count / 2 + 1
    }
}

/// Converts a full witness list into (adds, cuts) against `existing`.
pub fn witness_delta(existing: &[String], witnesses: &[String]) -> (Vec<String>, Vec<String>) {
    let current: BTreeSet<&String> = existing.iter().collect();
    let wanted: BTreeSet<&String> = witnesses.iter().collect();
    let adds = witnesses
        .iter()
        .filter(|w| !current.contains(w))
        .cloned()
        .collect();
    let cuts = existing
        .iter()
        .filter(|w| !wanted.contains(w))
        .cloned()
        .collect();
    (adds, cuts)
}

fn accepted_state(outcome: Outcome) -> Result<KeyState, KeriError> {
    match outcome {
        Outcome::Accepted(state) => Ok(state),
        Outcome::Rejected(reason) => Err(KeriError::Rejected(reason)),
        Outcome::Deferred(reason) => Err(KeriError::InvalidKeyEvent(format!(
            "event was escrowed ({})",
            reason
        ))),
    }
}

// ==================== Habitat ====================

pub struct Habitat<P: KeyProvider> {
    provider: P,
    kevery: Arc<Kevery>,
    transport: Arc<dyn WitnessTransport>,
    prefix: Option<String>,
    /// Threshold the next rotation uses unless it names one
    next_threshold: Option<usize>,
    timeout: Duration,
}

impl<P: KeyProvider> Habitat<P> {
    pub fn new(provider: P, kevery: Arc<Kevery>, transport: Arc<dyn WitnessTransport>) -> Self {
        let timeout = kevery.config().witness_timeout;
        Self {
            provider,
            kevery,
            transport,
            prefix: None,
            next_threshold: None,
            timeout,
        }
    }

    /// Re-attaches to an identifier already in `kevery`'s logs.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn kevery(&self) -> &Arc<Kevery> {
        &self.kevery
    }

    /// Current key state; a configuration error before inception.
    pub async fn state(&self) -> Result<KeyState, KeriError> {
        let not_incepted = |pre: &str| {
            KeriError::ConfigurationError(format!(
                "identifier prefix {} does not exist, incept must be run first",
                pre
            ))
        };
        let pre = self.prefix.as_deref().ok_or_else(|| not_incepted("(none)"))?;
        self.kevery
            .key_state(pre)
            .await?
            .ok_or_else(|| not_incepted(pre))
    }

    pub async fn incept(&mut self, options: InceptOptions) -> Result<KeyState, KeriError> {
        if let Some(ref pre) = self.prefix {
            return Err(KeriError::ConfigurationError(format!(
                "identifier {} is already incepted",
                pre
            )));
        }
        let toad = options
            .toad
            .unwrap_or_else(|| default_toad(options.witnesses.len()));
        let (keys, next) = self
            .provider
            .incept_keys(options.icount, options.ncount)
            .await?;

        let event = Event::inception(
            keys,
            options.isith,
            next,
            WitnessConfig::initial(options.witnesses, toad),
            options.data,
        )?;
        let signed = self.sign(event).await?;
        let state = accepted_state(self.kevery.process(signed.clone()).await?)?;
        self.prefix = Some(state.pre.clone());
        info!("Incepted {}", state.pre);

        self.publish_and_wait(&signed, &state).await?;
        Ok(state)
    }

    /// Rotates to the pre-committed keys.
    ///
    /// Key rotation is two-phase: the provider stages the new next keys and
    /// only commits them once the rotation event is accepted.
    pub async fn rotate(&mut self, options: RotateOptions) -> Result<RotationReport, KeriError> {
        let state = self.state().await?;
        let RotateOptions {
            witnesses,
            adds,
            cuts,
            signing_threshold,
            next_count,
            toad,
            data,
        } = options;

        let (adds, cuts) = match witnesses {
            Some(_) if !adds.is_empty() || !cuts.is_empty() => {
                return Err(KeriError::ConfigurationError(
                    "explicit witness list cannot be combined with adds or cuts".to_string(),
                ));
            }
            Some(wits) => witness_delta(&state.witnesses, &wits),
            None => (adds, cuts),
        };
        let toad = match toad {
            Some(toad) => toad,
            None if adds.is_empty() && cuts.is_empty() => state.toad,
            None => {
                let change = WitnessConfig {
                    add: adds.clone(),
                    cut: cuts.clone(),
                    toad: 0,
                };
                let witnesses = next_witnesses(&state.witnesses, &change)
                    .map_err(KeriError::ConfigurationError)?;
                default_toad(witnesses.len())
            }
        };

        // PHASE 1: Stage keys and build the rotation, signed by the prior keys
        let (keys, next) = self.provider.prepare_rotation(next_count).await?;
        let threshold = signing_threshold
            .or(self.next_threshold)
            .unwrap_or(state.signing_threshold)
            .clamp(1, keys.len().max(1));
        let built = Event::rotation(
            &state,
            keys.clone(),
            threshold,
            next,
            WitnessConfig {
                add: adds,
                cut: cuts,
                toad,
            },
            data,
        );
        let signed = match built {
            Ok(event) => self.sign(event).await,
            Err(e) => Err(e),
        };
        let signed = match signed {
            Ok(signed) => signed,
            Err(e) => {
                self.provider.rollback_rotation().await;
                return Err(e);
            }
        };

        // PHASE 2: Apply locally; a delegated rotation first needs its delegator's seal
        let applied = match state.delegator {
            Some(ref delegator) => self.apply_delegated(&signed, delegator).await,
            None => match self.kevery.process(signed.clone()).await {
                Ok(outcome) => accepted_state(outcome),
                Err(e) => Err(e),
            },
        };

        // PHASE 3: Commit keys on acceptance, otherwise roll back
        let new_state = match applied {
            Ok(new_state) => {
                self.provider.commit_rotation().await?;
                self.next_threshold = None;
                new_state
            }
            Err(e) => {
                self.provider.rollback_rotation().await;
                return Err(e);
            }
        };
        info!("Rotated {} to sn {}", new_state.pre, new_state.sn);

        self.publish_and_wait(&signed, &new_state).await?;
        Ok(RotationReport {
            pre: new_state.pre,
            sn: new_state.sn,
            keys,
        })
    }

    /// Anchors `seals` in an interaction event.
    pub async fn interact(&mut self, seals: Vec<Seal>) -> Result<KeyState, KeriError> {
        let state = self.state().await?;
        let event = Event::interaction(&state, seals)?;
        let signed = self.sign(event).await?;
        let new_state = accepted_state(self.kevery.process(signed.clone()).await?)?;
        self.publish_and_wait(&signed, &new_state).await?;
        Ok(new_state)
    }

    /// Approves a delegated event by anchoring its seal.
    pub async fn approve_delegation(
        &mut self,
        request: &DelegationRequest,
    ) -> Result<KeyState, KeriError> {
        if self.prefix.as_deref() != Some(request.delegator.as_str()) {
            return Err(KeriError::ConfigurationError(format!(
                "delegation request names delegator {}, not this identifier",
                request.delegator
            )));
        }
        info!(
            "Approving delegated event {} for {}",
            request.said, request.pre
        );
        self.interact(vec![Seal::event(&request.pre, request.sn, &request.said)])
            .await
    }

    /// Incepts an identifier delegated by `options.delegator` and waits until
    /// the delegated inception is approved and witnessed.
    pub async fn incept_delegated(
        &mut self,
        options: DelegateOptions,
    ) -> Result<DelegationReport, KeriError> {
        if let Some(ref pre) = self.prefix {
            return Err(KeriError::ConfigurationError(format!(
                "identifier {} is already incepted",
                pre
            )));
        }
        let next_count = if options.transferable {
            options.ncount
        } else {
            0
        };
        let toad = options
            .toad
            .unwrap_or_else(|| default_toad(options.witnesses.len()));
        let (keys, next) = self
            .provider
            .incept_keys(options.icount, next_count)
            .await?;

        let event = Event::delegated_inception(
            keys.clone(),
            options.isith,
            next,
            WitnessConfig::initial(options.witnesses.clone(), toad),
            options.delegator.clone(),
        )?;
        let signed = self.sign(event).await?;
        let proposal = DelegationRequest {
            pre: signed.pre().to_string(),
            sn: 0,
            said: signed.said().to_string(),
            delegator: options.delegator.clone(),
        };

        let mut watcher = DelegationWatcher::watch(Arc::clone(&self.kevery), proposal);
        if let Outcome::Rejected(reason) = self.kevery.process(signed.clone()).await? {
            return Err(KeriError::Rejected(reason));
        }
        self.prefix = Some(signed.pre().to_string());
        self.next_threshold = options.nsith;

        if let Err(e) = self
            .transport
            .forward(forward(&options.delegator, "delegate", signed.clone()))
            .await
        {
            warn!("Failed to forward delegated inception to {}: {}", options.delegator, e);
        }
        self.publish(&signed, &options.witnesses).await?;
        watcher.wait(self.timeout).await?;

        info!("Delegated inception of {} approved by {}", signed.pre(), options.delegator);
        Ok(DelegationReport {
            pre: signed.pre().to_string(),
            delegator: options.delegator,
            sn: 0,
            keys,
        })
    }

    // ==================== Internals ====================

    /// Processes a delegated event and waits for the delegator to approve it.
    async fn apply_delegated(
        &self,
        signed: &SignedEvent,
        delegator: &str,
    ) -> Result<KeyState, KeriError> {
        let mut watcher = DelegationWatcher::watch(
            Arc::clone(&self.kevery),
            DelegationRequest {
                pre: signed.pre().to_string(),
                sn: signed.sn(),
                said: signed.said().to_string(),
                delegator: delegator.to_string(),
            },
        );
        match self.kevery.process(signed.clone()).await? {
            Outcome::Accepted(state) => return Ok(state),
            Outcome::Rejected(reason) => return Err(KeriError::Rejected(reason)),
            Outcome::Deferred(_) => {}
        }

        if let Err(e) = self
            .transport
            .forward(forward(delegator, "delegate", signed.clone()))
            .await
        {
            warn!("Failed to forward {} to {}: {}", signed.said(), delegator, e);
        }

        let approval = watcher.reached(DelegationPhase::Approved);
        match tokio::time::timeout(self.timeout, approval).await {
            Ok(DelegationPhase::Approved | DelegationPhase::Witnessed) => {
                let state = self.state().await?;
                if state.said != signed.said() {
                    return Err(KeriError::InvalidKel(format!(
                        "{} was approved but {} is current",
                        signed.said(),
                        state.said
                    )));
                }
                Ok(state)
            }
            Ok(_) => Err(KeriError::QuorumAbandoned {
                pre: signed.pre().to_string(),
                sn: signed.sn(),
            }),
            Err(_) => {
                watcher.abandon();
                Err(KeriError::Timeout(format!(
                    "approval of {} by {}",
                    signed.said(),
                    delegator
                )))
            }
        }
    }

    async fn sign(&self, event: Event) -> Result<SignedEvent, KeriError> {
        let signatures = self.provider.sign(event.said.as_bytes()).await?;
        Ok(SignedEvent::new(event, signatures))
    }

    /// Sends `signed` to each witness. Fails only if every witness fails.
    async fn publish(&self, signed: &SignedEvent, witnesses: &[String]) -> Result<(), KeriError> {
        if witnesses.is_empty() {
            return Ok(());
        }
        let results = join_all(
            witnesses
                .iter()
                .map(|witness| self.transport.publish(witness, signed)),
        )
        .await;

        let mut failures = 0;
        for (witness, result) in witnesses.iter().zip(&results) {
            if let Err(e) = result {
                warn!("Failed to publish {} to witness {}: {}", signed.said(), witness, e);
                failures += 1;
            }
        }
        if failures == witnesses.len() {
            return Err(KeriError::SubmissionFailed(format!(
                "no witness accepted {}",
                signed.said()
            )));
        }
        Ok(())
    }

    /// Publishes to the witnesses of `state` and waits for their quorum.
    async fn publish_and_wait(
        &self,
        signed: &SignedEvent,
        state: &KeyState,
    ) -> Result<(), KeriError> {
        if state.witnesses.is_empty() {
            return Ok(());
        }
        let mut quorum = WitnessQuorumCollector::watch(
            Arc::clone(&self.kevery),
            WitnessingRequest::from_state(state),
        );
        self.publish(signed, &state.witnesses).await?;
        quorum.wait(self.timeout).await
    }
}
