//! Digests, signatures and key providers

use std::collections::HashSet;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};

use crate::error::KeriError;
use crate::types::{Event, IndexedSignature, Receipt};

// ==================== Primitives ====================

/// Blake3-256 digest in URL-safe base64.
pub fn digest(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(blake3::hash(data).as_bytes())
}

/// Pre-rotation commitment over an ordered key list.
pub fn commit_keys(keys: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize().as_bytes())
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    URL_SAFE_NO_PAD.encode(key.to_encoded_point(true).as_bytes())
}

pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, KeriError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| KeriError::CryptoError(format!("Invalid public key encoding: {}", e)))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| KeriError::CryptoError(format!("Invalid public key: {}", e)))
}

pub fn encode_signature(signature: &Signature) -> String {
    URL_SAFE_NO_PAD.encode(signature.to_bytes())
}

pub fn decode_signature(encoded: &str) -> Result<Signature, KeriError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| KeriError::CryptoError(format!("Invalid signature encoding: {}", e)))?;
    Signature::from_slice(&bytes)
        .map_err(|e| KeriError::CryptoError(format!("Invalid signature: {}", e)))
}

fn sign_with(key: &SigningKey, data: &[u8]) -> Result<String, KeriError> {
    let signature: Signature = key
        .try_sign(data)
        .map_err(|e| KeriError::SigningFailed(e.to_string()))?;
    Ok(encode_signature(&signature))
}

/// Undecodable keys or signatures simply fail verification.
pub fn verify_signature(public_key: &str, data: &[u8], signature: &str) -> bool {
    let (Ok(key), Ok(sig)) = (decode_public_key(public_key), decode_signature(signature)) else {
        return false;
    };
    key.verify(data, &sig).is_ok()
}

/// True when at least `threshold` distinct key indices carry a valid signature.
pub fn verify_threshold(
    keys: &[String],
    threshold: usize,
    data: &[u8],
    signatures: &[IndexedSignature],
) -> bool {
    if threshold == 0 {
        return false;
    }
    let mut verified = HashSet::new();
    for sig in signatures {
        let Some(key) = keys.get(sig.index as usize) else {
            continue;
        };
        if verify_signature(key, data, &sig.signature) {
            verified.insert(sig.index);
        }
    }
    verified.len() >= threshold
}

fn generate_keys(count: usize) -> Vec<SigningKey> {
    (0..count)
        .map(|_| SigningKey::random(&mut rand::rngs::OsRng))
        .collect()
}

fn public_keys(keys: &[SigningKey]) -> Vec<String> {
    keys.iter()
        .map(|k| encode_public_key(k.verifying_key()))
        .collect()
}

fn commitment(keys: &[SigningKey]) -> Option<String> {
    if keys.is_empty() {
        None
    } else {
        Some(commit_keys(&public_keys(keys)))
    }
}

// ==================== KeyProvider Trait ====================

/// Key management and signing for a transferable identifier.
///
/// Rotation is two-phase: `prepare_rotation()` stages a fresh next key set,
/// then `commit_rotation()` promotes it once the rotation event is accepted,
/// or `rollback_rotation()` discards it.
#[async_trait::async_trait]
pub trait KeyProvider: Send + Sync {
    /// Returns the current signing public keys.
    async fn current_keys(&self) -> Result<Vec<String>, KeriError>;

    /// Commitment to the pre-rotated next keys; `None` when non-transferable.
    async fn next_commitment(&self) -> Result<Option<String>, KeriError>;

    /// Generates the inception key sets. Returns (current keys, next commitment).
    async fn incept_keys(
        &mut self,
        count: usize,
        next_count: usize,
    ) -> Result<(Vec<String>, Option<String>), KeriError>;

    /// Stages a rotation. Returns (keys to rotate to, commitment to the new next set).
    async fn prepare_rotation(
        &mut self,
        next_count: usize,
    ) -> Result<(Vec<String>, Option<String>), KeriError>;

    async fn commit_rotation(&mut self) -> Result<(), KeriError>;

    async fn rollback_rotation(&mut self);

    /// Signs with every current key, indexed by key position.
    async fn sign(&self, data: &[u8]) -> Result<Vec<IndexedSignature>, KeriError>;
}

// ==================== SoftwareKeyProvider ====================

#[derive(Clone, Default)]
pub struct SoftwareKeyProvider {
    current: Vec<SigningKey>,
    next: Vec<SigningKey>,
    pending_next: Option<Vec<SigningKey>>,
}

impl SoftwareKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyProvider for SoftwareKeyProvider {
    async fn current_keys(&self) -> Result<Vec<String>, KeriError> {
        if self.current.is_empty() {
            return Err(KeriError::NoCurrentKey);
        }
        Ok(public_keys(&self.current))
    }

    async fn next_commitment(&self) -> Result<Option<String>, KeriError> {
        Ok(commitment(&self.next))
    }

    async fn incept_keys(
        &mut self,
        count: usize,
        next_count: usize,
    ) -> Result<(Vec<String>, Option<String>), KeriError> {
        if count == 0 {
            return Err(KeriError::ConfigurationError(
                "at least one signing key is required".to_string(),
            ));
        }
        self.current = generate_keys(count);
        self.next = generate_keys(next_count);
        self.pending_next = None;
        Ok((public_keys(&self.current), commitment(&self.next)))
    }

    async fn prepare_rotation(
        &mut self,
        next_count: usize,
    ) -> Result<(Vec<String>, Option<String>), KeriError> {
        if self.next.is_empty() {
            return Err(KeriError::NoNextKey);
        }
        let pending = generate_keys(next_count);
        let next_commitment = commitment(&pending);
        self.pending_next = Some(pending);
        Ok((public_keys(&self.next), next_commitment))
    }

    async fn commit_rotation(&mut self) -> Result<(), KeriError> {
        let pending = self.pending_next.take().ok_or(KeriError::NoStagedRotation)?;
        self.current = std::mem::replace(&mut self.next, pending);
        Ok(())
    }

    async fn rollback_rotation(&mut self) {
        self.pending_next = None;
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<IndexedSignature>, KeriError> {
        if self.current.is_empty() {
            return Err(KeriError::NoCurrentKey);
        }
        self.current
            .iter()
            .enumerate()
            .map(|(index, key)| {
                Ok(IndexedSignature {
                    index: index as u32,
                    signature: sign_with(key, data)?,
                })
            })
            .collect()
    }
}

// ==================== BasicSigner ====================

/// A single-key, non-transferable signer. Its prefix is its public key.
#[derive(Clone)]
pub struct BasicSigner {
    key: SigningKey,
}

impl BasicSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn prefix(&self) -> String {
        encode_public_key(self.key.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Result<String, KeriError> {
        sign_with(&self.key, data)
    }

    /// Witness receipt over the event's SAID.
    pub fn receipt(&self, event: &Event) -> Result<Receipt, KeriError> {
        Ok(Receipt {
            pre: event.pre.clone(),
            sn: event.sn,
            said: event.said.clone(),
            witness: self.prefix(),
            signature: self.sign(event.said.as_bytes())?,
        })
    }
}
