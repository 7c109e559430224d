//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use keri::{
    BasicSigner, Event, Forward, KeriError, KeyProvider, KeyState, Kevery, KeveryConfig,
    MemoryKelStore, Receipt, SignedEvent, SoftwareKeyProvider, WitnessConfig, WitnessTransport,
};
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn kevery() -> Arc<Kevery> {
    init_tracing();
    Arc::new(Kevery::new(
        Arc::new(MemoryKelStore::new()),
        KeveryConfig::default(),
    ))
}

pub fn witnesses(count: usize) -> Vec<BasicSigner> {
    (0..count).map(|_| BasicSigner::generate()).collect()
}

pub fn prefixes(signers: &[BasicSigner]) -> Vec<String> {
    signers.iter().map(BasicSigner::prefix).collect()
}

pub async fn sign(provider: &SoftwareKeyProvider, event: Event) -> SignedEvent {
    let signatures = provider.sign(event.said.as_bytes()).await.unwrap();
    SignedEvent::new(event, signatures)
}

/// A signed delegated inception naming `delegator`.
pub async fn delegated_inception(delegator: &str) -> SignedEvent {
    let mut provider = SoftwareKeyProvider::new();
    let (keys, next) = provider.incept_keys(1, 1).await.unwrap();
    let dip = Event::delegated_inception(
        keys,
        1,
        next,
        WitnessConfig::default(),
        delegator.to_string(),
    )
    .unwrap();
    sign(&provider, dip).await
}

/// A controller that builds events by hand, without a `Kevery`.
pub struct Controller {
    pub provider: SoftwareKeyProvider,
    pub state: KeyState,
    pub log: Vec<SignedEvent>,
}

impl Controller {
    pub async fn incept(witnesses: Vec<String>, toad: usize) -> Self {
        let mut provider = SoftwareKeyProvider::new();
        let (keys, next) = provider.incept_keys(1, 1).await.unwrap();
        let icp = Event::inception(keys, 1, next, WitnessConfig::initial(witnesses, toad), vec![])
            .unwrap();
        let state = KeyState::project(None, &icp).unwrap();
        let signed = sign(&provider, icp).await;
        Self {
            provider,
            state,
            log: vec![signed],
        }
    }

    pub async fn interact(&mut self, seals: Vec<keri::Seal>) -> SignedEvent {
        let ixn = Event::interaction(&self.state, seals).unwrap();
        self.push(ixn).await
    }

    pub async fn rotate(&mut self) -> SignedEvent {
        let (keys, next) = self.provider.prepare_rotation(1).await.unwrap();
        let rot = Event::rotation(&self.state, keys, 1, next, WitnessConfig::default(), vec![])
            .unwrap();
        let signed = sign(&self.provider, rot.clone()).await;
        self.provider.commit_rotation().await.unwrap();
        self.state = KeyState::project(Some(&self.state), &rot).unwrap();
        self.log.push(signed.clone());
        signed
    }

    async fn push(&mut self, event: Event) -> SignedEvent {
        let signed = sign(&self.provider, event.clone()).await;
        self.state = KeyState::project(Some(&self.state), &event).unwrap();
        self.log.push(signed.clone());
        signed
    }

    pub fn pre(&self) -> &str {
        &self.state.pre
    }
}

/// In-process witnesses that receipt whatever they are sent back into a
/// `Kevery`, and a mailbox for forwarded events.
pub struct LocalWitnesses {
    kevery: Arc<Kevery>,
    signers: HashMap<String, BasicSigner>,
    offline: Mutex<HashSet<String>>,
    mailbox: mpsc::UnboundedSender<Forward>,
}

impl LocalWitnesses {
    pub fn new(
        kevery: Arc<Kevery>,
        signers: &[BasicSigner],
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Forward>) {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let witnesses = Self {
            kevery,
            signers: signers.iter().map(|s| (s.prefix(), s.clone())).collect(),
            offline: Mutex::new(HashSet::new()),
            mailbox,
        };
        (Arc::new(witnesses), inbox)
    }

    pub fn take_offline(&self, witness: &str) {
        self.offline.lock().unwrap().insert(witness.to_string());
    }

    pub fn receipt(&self, witness: &str, event: &SignedEvent) -> Receipt {
        self.signers[witness].receipt(&event.event).unwrap()
    }
}

#[async_trait]
impl WitnessTransport for LocalWitnesses {
    async fn publish(&self, witness: &str, event: &SignedEvent) -> Result<(), KeriError> {
        if self.offline.lock().unwrap().contains(witness) {
            return Err(KeriError::SubmissionFailed(format!("{} is offline", witness)));
        }
        let signer = self
            .signers
            .get(witness)
            .ok_or_else(|| KeriError::SubmissionFailed(format!("unknown witness {}", witness)))?;
        let receipt = signer.receipt(&event.event)?;
        self.kevery.process(receipt).await?;
        Ok(())
    }

    async fn forward(&self, message: Forward) -> Result<(), KeriError> {
        self.mailbox
            .send(message)
            .map_err(|_| KeriError::ChannelClosed)
    }
}
