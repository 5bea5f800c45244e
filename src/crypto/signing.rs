//! Ed25519 signing and verification
//!
//! Used for three things:
//! - map roots, signed by the map service
//! - log roots, signed by the log service
//! - entry updates, self-signed by the identity's authorized key

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;

use crate::crypto::hash::{
    log_root_signing_hash, map_root_signing_hash, Hash256, MapRootSigningParams,
};
use crate::domain::{
    LogRoot, MapIndex, MapRoot, PublicKey32, Signature64, SignedEntry, SignedLogRoot,
    SignedMapRoot,
};

/// Ed25519 secret key (32 bytes)
pub type SecretKey32 = [u8; SECRET_KEY_LENGTH];

/// Error type for signing operations
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signature format")]
    InvalidSignatureFormat,

    #[error("invalid public key format")]
    InvalidPublicKeyFormat,

    #[error("invalid secret key format")]
    InvalidSecretKeyFormat,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// Hash covered by a map root signature
pub fn map_root_hash(root: &MapRoot) -> Hash256 {
    let metadata = root.metadata.to_canonical_bytes();
    map_root_signing_hash(&MapRootSigningParams {
        directory_id: root.directory_id.as_str(),
        revision: root.revision,
        leaf_count: root.leaf_count,
        root_hash: &root.root_hash,
        timestamp_millis: root.timestamp_millis,
        metadata: &metadata,
    })
}

/// Hash covered by a log root signature
pub fn log_root_hash(root: &LogRoot) -> Hash256 {
    log_root_signing_hash(
        root.directory_id.as_str(),
        root.tree_size,
        &root.root_hash,
        root.timestamp_millis,
    )
}

// ============================================================================
// Signing Key
// ============================================================================

/// Ed25519 keypair
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing key
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from secret key bytes
    pub fn from_bytes(bytes: &SecretKey32) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Create from a hex-encoded secret key
    pub fn from_hex(secret_hex: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|_| SigningError::InvalidSecretKeyFormat)?;
        let arr: SecretKey32 = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidSecretKeyFormat)?;
        Ok(Self::from_bytes(&arr))
    }

    /// Get the secret key bytes
    pub fn to_bytes(&self) -> SecretKey32 {
        self.signing_key.to_bytes()
    }

    /// Get the verifier for this key
    pub fn verifier(&self) -> SignatureVerifier {
        SignatureVerifier {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> PublicKey32 {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a 32-byte preimage hash
    pub fn sign(&self, hash: &Hash256) -> Signature64 {
        self.signing_key.sign(hash).to_bytes()
    }

    pub fn sign_map_root(&self, root: MapRoot) -> SignedMapRoot {
        let signature = self.sign(&map_root_hash(&root));
        SignedMapRoot { root, signature }
    }

    pub fn sign_log_root(&self, root: LogRoot) -> SignedLogRoot {
        let signature = self.sign(&log_root_hash(&root));
        SignedLogRoot { root, signature }
    }

    /// Build and sign an entry update with this key as the authorized key
    pub fn sign_entry(
        &self,
        index: MapIndex,
        user_id: impl Into<String>,
        version: u64,
        public_keys: Vec<String>,
    ) -> SignedEntry {
        let mut entry = SignedEntry {
            index,
            user_id: user_id.into(),
            version,
            public_keys,
            authorized_key: self.public_key_bytes(),
            signature: [0u8; 64],
        };
        entry.signature = self.sign(&entry.signing_hash());
        entry
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Verifying Key
// ============================================================================

/// Ed25519 public key for signature verification
#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    verifying_key: VerifyingKey,
}

impl SignatureVerifier {
    /// Create from public key bytes
    pub fn from_bytes(bytes: &PublicKey32) -> Result<Self, SigningError> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|_| SigningError::InvalidPublicKeyFormat)?;
        Ok(Self { verifying_key })
    }

    /// Create from a hex-encoded public key
    pub fn from_hex(public_hex: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(public_hex.trim()).map_err(|_| SigningError::InvalidPublicKeyFormat)?;
        let arr: PublicKey32 = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidPublicKeyFormat)?;
        Self::from_bytes(&arr)
    }

    pub fn to_bytes(&self) -> PublicKey32 {
        self.verifying_key.to_bytes()
    }

    /// Verify a signature over a 32-byte preimage hash
    pub fn verify(&self, hash: &Hash256, signature: &Signature64) -> Result<(), SigningError> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(hash, &sig)
            .map_err(|_| SigningError::VerificationFailed)
    }

    pub fn verify_map_root(&self, signed: &SignedMapRoot) -> Result<(), SigningError> {
        self.verify(&map_root_hash(&signed.root), &signed.signature)
    }

    pub fn verify_log_root(&self, signed: &SignedLogRoot) -> Result<(), SigningError> {
        self.verify(&log_root_hash(&signed.root), &signed.signature)
    }
}

/// Verify an entry update against its own authorized key
pub fn verify_entry(entry: &SignedEntry) -> Result<(), SigningError> {
    SignatureVerifier::from_bytes(&entry.authorized_key)?
        .verify(&entry.signing_hash(), &entry.signature)
}
