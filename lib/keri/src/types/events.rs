//! Key event model & signatures

use std::{collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::state::KeyState;
use crate::crypto;
use crate::error::KeriError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ilk {
    Icp, // Inception
    Rot, // Rotation
    Ixn, // Interaction (anchor)
    Dip, // Delegated inception
    Drt, // Delegated rotation
    Rct, // Witness receipt
    Fwd, // Forwarded message
}

impl Ilk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icp => "icp",
            Self::Rot => "rot",
            Self::Ixn => "ixn",
            Self::Dip => "dip",
            Self::Drt => "drt",
            Self::Rct => "rct",
            Self::Fwd => "fwd",
        }
    }

    pub fn is_inception(&self) -> bool {
        matches!(self, Self::Icp | Self::Dip)
    }

    pub fn is_rotation(&self) -> bool {
        matches!(self, Self::Rot | Self::Drt)
    }

    /// Establishment events carry a key set
    pub fn is_establishment(&self) -> bool {
        self.is_inception() || self.is_rotation()
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::Dip | Self::Drt)
    }
}

impl fmt::Display for Ilk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Ilk {
    type Err = KeriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "icp" => Ok(Self::Icp),
            "rot" => Ok(Self::Rot),
            "ixn" => Ok(Self::Ixn),
            "dip" => Ok(Self::Dip),
            "drt" => Ok(Self::Drt),
            "rct" => Ok(Self::Rct),
            "fwd" => Ok(Self::Fwd),
            _ => Err(KeriError::InvalidKeyEvent(format!("Unknown ilk: {}", s))),
        }
    }
}

/// Witness set change carried by establishment events.
///
/// For inceptions `add` is the initial witness set and `cut` must be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cut: Vec<String>,
    pub toad: usize,
}

impl WitnessConfig {
    pub fn initial(witnesses: Vec<String>, toad: usize) -> Self {
        Self {
            add: witnesses,
            cut: Vec::new(),
            toad,
        }
    }
}

/// Data anchored in an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Seal {
    /// Anchors another identifier's event, e.g. a delegation approval
    Event { pre: String, sn: u64, said: String },
    /// Anchors an arbitrary digest
    Digest { digest: String },
}

impl Seal {
    pub fn event(pre: &str, sn: u64, said: &str) -> Self {
        Self::Event {
            pre: pre.to_string(),
            sn,
            said: said.to_string(),
        }
    }

    /// Commits to arbitrary JSON data by digest.
    pub fn data(value: &serde_json::Value) -> Result<Self, KeriError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::Digest {
            digest: crypto::digest(&bytes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub said: String,
    pub pre: String,
    pub sn: u64,
    pub ilk: Ilk,
    /// SAID of the preceding event; absent only for inceptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_threshold: Option<usize>,
    /// Digest of the next key set; absent for non-transferable identifiers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_key_commitment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witnesses: Option<WitnessConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seals: Vec<Seal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegator: Option<String>,
}

impl Event {
    pub fn inception(
        keys: Vec<String>,
        signing_threshold: usize,
        next_key_commitment: Option<String>,
        witnesses: WitnessConfig,
        seals: Vec<Seal>,
    ) -> Result<Self, KeriError> {
        let mut icp = Self {
            said: String::new(),
            pre: String::new(),
            sn: 0,
            ilk: Ilk::Icp,
            prior: None,
            keys,
            signing_threshold: Some(signing_threshold),
            next_key_commitment,
            witnesses: Some(witnesses),
            seals,
            delegator: None,
        };
        icp.derive_said()?;
        Ok(icp)
    }

    pub fn delegated_inception(
        keys: Vec<String>,
        signing_threshold: usize,
        next_key_commitment: Option<String>,
        witnesses: WitnessConfig,
        delegator: String,
    ) -> Result<Self, KeriError> {
        let mut dip = Self {
            said: String::new(),
            pre: String::new(),
            sn: 0,
            ilk: Ilk::Dip,
            prior: None,
            keys,
            signing_threshold: Some(signing_threshold),
            next_key_commitment,
            witnesses: Some(witnesses),
            seals: Vec::new(),
            delegator: Some(delegator),
        };
        dip.derive_said()?;
        Ok(dip)
    }

    /// Builds the next rotation for `state`. Delegated identifiers get a `drt`.
    pub fn rotation(
        state: &KeyState,
        keys: Vec<String>,
        signing_threshold: usize,
        next_key_commitment: Option<String>,
        witnesses: WitnessConfig,
        seals: Vec<Seal>,
    ) -> Result<Self, KeriError> {
        let ilk = if state.delegator.is_some() {
            Ilk::Drt
        } else {
            Ilk::Rot
        };
        let mut event = Self {
            said: String::new(),
            pre: state.pre.clone(),
            sn: state.sn + 1,
            ilk,
            prior: Some(state.said.clone()),
            keys,
            signing_threshold: Some(signing_threshold),
            next_key_commitment,
            witnesses: Some(witnesses),
            seals,
            delegator: None,
        };
        event.derive_said()?;
        Ok(event)
    }

    pub fn interaction(state: &KeyState, seals: Vec<Seal>) -> Result<Self, KeriError> {
        let mut event = Self {
            said: String::new(),
            pre: state.pre.clone(),
            sn: state.sn + 1,
            ilk: Ilk::Ixn,
            prior: Some(state.said.clone()),
            keys: Vec::new(),
            signing_threshold: None,
            next_key_commitment: None,
            witnesses: None,
            seals,
            delegator: None,
        };
        event.derive_said()?;
        Ok(event)
    }

    pub fn is_inception(&self) -> bool {
        self.ilk.is_inception()
    }
    pub fn is_rotation(&self) -> bool {
        self.ilk.is_rotation()
    }
    pub fn is_interaction(&self) -> bool {
        self.ilk == Ilk::Ixn
    }
    pub fn is_establishment(&self) -> bool {
        self.ilk.is_establishment()
    }
    pub fn is_delegated(&self) -> bool {
        self.ilk.is_delegated()
    }

    /// Digest of the serialized event with `said` (and, for inceptions, `pre`) blanked.
    pub fn compute_said(&self) -> Result<String, KeriError> {
        let mut blank = self.clone();
        blank.said = String::new();
        if blank.is_inception() {
            blank.pre = String::new();
        }
        let bytes = serde_json::to_vec(&blank)?;
        Ok(crypto::digest(&bytes))
    }

    /// Sets `said`; inceptions also take it as their self-addressing prefix.
    pub fn derive_said(&mut self) -> Result<(), KeriError> {
        let said = self.compute_said()?;
        if self.is_inception() {
            self.pre = said.clone();
        }
        self.said = said;
        Ok(())
    }

    pub fn verify_said(&self) -> bool {
        match self.compute_said() {
            Ok(said) => said == self.said && (!self.is_inception() || self.pre == self.said),
            Err(_) => false,
        }
    }

    /// Every event seal anchored by this event.
    pub fn event_seals(&self) -> impl Iterator<Item = (&str, u64, &str)> {
        self.seals.iter().filter_map(|seal| match seal {
            Seal::Event { pre, sn, said } => Some((pre.as_str(), *sn, said.as_str())),
            Seal::Digest { .. } => None,
        })
    }

    pub fn contains_anchor(&self, said: &str) -> bool {
        self.seals.iter().any(|seal| match seal {
            Seal::Event { said: s, .. } => s == said,
            Seal::Digest { digest } => digest == said,
        })
    }

    /// Validates that the event has the correct fields for its ilk.
    /// Returns Ok(()) if valid, Err with description if invalid.
    pub fn validate_structure(&self) -> Result<(), String> {
        let require = |name: &str, present: bool| -> Result<(), String> {
            if present {
                Ok(())
            } else {
                Err(format!("{} event requires {}", self.ilk, name))
            }
        };
        let forbid = |name: &str, present: bool| -> Result<(), String> {
            if present {
                Err(format!("{} event must not have {}", self.ilk, name))
            } else {
                Ok(())
            }
        };
        let validate_keys = || -> Result<(), String> {
            require("keys", !self.keys.is_empty())?;
            let unique: HashSet<&String> = self.keys.iter().collect();
            if unique.len() != self.keys.len() {
                return Err(format!("{} event has duplicate keys", self.ilk));
            }
            match self.signing_threshold {
                Some(kt) if kt >= 1 && kt <= self.keys.len() => Ok(()),
                Some(kt) => Err(format!(
                    "signing threshold {} out of range for {} keys",
                    kt,
                    self.keys.len()
                )),
                None => Err(format!("{} event requires signingThreshold", self.ilk)),
            }
        };

        require("said", !self.said.is_empty())?;
        require("pre", !self.pre.is_empty())?;
        forbid(
            "self-referencing prior",
            self.prior.as_ref() == Some(&self.said),
        )?;

        match self.ilk {
            Ilk::Icp | Ilk::Dip => {
                if self.sn != 0 {
                    return Err(format!("{} event must be at sn 0", self.ilk));
                }
                forbid("prior", self.prior.is_some())?;
                validate_keys()?;
                if let Some(ref witnesses) = self.witnesses {
                    forbid("witness cuts", !witnesses.cut.is_empty())?;
                }
                if self.ilk == Ilk::Dip {
                    require("delegator", self.delegator.is_some())?;
                } else {
                    forbid("delegator", self.delegator.is_some())?;
                }
            }
            Ilk::Rot | Ilk::Drt => {
                if self.sn == 0 {
                    return Err(format!("{} event must be above sn 0", self.ilk));
                }
                require("prior", self.prior.is_some())?;
                validate_keys()?;
                if self.ilk == Ilk::Rot {
                    forbid("delegator", self.delegator.is_some())?;
                }
            }
            Ilk::Ixn => {
                if self.sn == 0 {
                    return Err("ixn event must be above sn 0".to_string());
                }
                require("prior", self.prior.is_some())?;
                forbid("keys", !self.keys.is_empty())?;
                forbid("signingThreshold", self.signing_threshold.is_some())?;
                forbid("nextKeyCommitment", self.next_key_commitment.is_some())?;
                forbid("witnesses", self.witnesses.is_some())?;
                forbid("delegator", self.delegator.is_some())?;
            }
            Ilk::Rct | Ilk::Fwd => {
                return Err(format!("{} is not a key event", self.ilk));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedSignature {
    /// Position of the signing key in the authoritative key list
    pub index: u32,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEvent {
    pub event: Event,
    pub signatures: Vec<IndexedSignature>,
}

impl SignedEvent {
    pub fn new(event: Event, signatures: Vec<IndexedSignature>) -> Self {
        Self { event, signatures }
    }

    pub fn pre(&self) -> &str {
        &self.event.pre
    }

    pub fn sn(&self) -> u64 {
        self.event.sn
    }

    pub fn said(&self) -> &str {
        &self.event.said
    }
}
