//! Cryptographic primitives for covalue.
//!
//! Everything the log, group and sync layers need from cryptography goes
//! through [`CryptoProvider`]. [`DefaultCrypto`] implements it with Ed25519
//! signatures, X25519 sealing, ChaCha20-Poly1305 and BLAKE3.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, Result};
use crate::ids::{decode_prefixed, AgentId, KeyId, SealerId, SessionId, SignerId};

string_id!(
    /// Ed25519 signature over a session hash: `signature_z<base58>`.
    Signature,
    "Signature"
);
string_id!(
    /// Asymmetrically sealed payload: `sealed_U<base64url>`.
    Sealed,
    "Sealed"
);
string_id!(
    /// Symmetrically encrypted payload: `encrypted_U<base64url>`.
    Encrypted,
    "Encrypted"
);
string_id!(
    /// Full BLAKE3 digest: `hash_z<base58>`.
    Hash,
    "Hash"
);
string_id!(
    /// Truncated BLAKE3 digest used for ids: `shortHash_z<base58>`.
    ShortHash,
    "ShortHash"
);

/// Bytes kept from a BLAKE3 digest for short hashes.
pub const SHORT_HASH_LENGTH: usize = 19;

const SEAL_CONTEXT: &str = "covalue 2024 seal shared secret";
const AGENT_SEALER_CONTEXT: &str = "covalue 2024 agent sealer";
const AGENT_SIGNER_CONTEXT: &str = "covalue 2024 agent signer";

/// Secret half of an agent: `sealerSecret_z<b58>/signerSecret_z<b58>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentSecret(String);

impl AgentSecret {
    /// Build from raw sealer and signer secrets.
    pub fn from_parts(sealer: &[u8; 32], signer: &[u8; 32]) -> Self {
        Self(format!(
            "sealerSecret_z{}/signerSecret_z{}",
            bs58::encode(sealer).into_string(),
            bs58::encode(signer).into_string()
        ))
    }

    /// Derive a deterministic agent from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let sealer = blake3::derive_key(AGENT_SEALER_CONTEXT, seed);
        let signer = blake3::derive_key(AGENT_SIGNER_CONTEXT, seed);
        Self::from_parts(&sealer, &signer)
    }

    /// Parse the string form.
    pub fn parse(s: &str) -> Result<Self> {
        let secret = Self(s.to_string());
        secret.sealer_bytes()?;
        secret.signer_bytes()?;
        Ok(secret)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sealer_bytes(&self) -> Result<[u8; 32]> {
        let part = self.0.split('/').next().unwrap_or_default();
        decode_prefixed(part, "sealerSecret_z")
    }

    fn signer_bytes(&self) -> Result<[u8; 32]> {
        let part = self.0.split('/').nth(1).unwrap_or_default();
        decode_prefixed(part, "signerSecret_z")
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentSecret(..)")
    }
}

/// Symmetric read key: `keySecret_z<base58>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySecret(String);

impl KeySecret {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(format!("keySecret_z{}", bs58::encode(bytes).into_string()))
    }

    /// Parse the string form, checking the key length.
    pub fn parse(s: &str) -> Result<Self> {
        decode_prefixed(s, "keySecret_z")?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_bytes(&self) -> Result<[u8; 32]> {
        decode_prefixed(&self.0, "keySecret_z")
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(..)")
    }
}

/// Incremental BLAKE3 state for a session's hash chain.
#[derive(Clone, Default)]
pub struct StreamingHash(blake3::Hasher);

impl StreamingHash {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Digest of everything absorbed so far. The state stays usable.
    pub fn digest(&self) -> Hash {
        Hash(format!(
            "hash_z{}",
            bs58::encode(self.0.finalize().as_bytes()).into_string()
        ))
    }
}

impl fmt::Debug for StreamingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamingHash({})", self.digest())
    }
}

/// The cryptographic capability consumed by every other layer.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    fn new_agent_secret(&self) -> AgentSecret;

    fn agent_id(&self, secret: &AgentSecret) -> Result<AgentId>;

    fn sign(&self, secret: &AgentSecret, message: &[u8]) -> Result<Signature>;

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> Result<bool>;

    /// Seal `message` from `from` to the holder of `to`.
    fn seal(
        &self,
        message: &[u8],
        from: &AgentSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Sealed>;

    /// Open a payload sealed by `from` to `recipient`.
    fn unseal(
        &self,
        sealed: &Sealed,
        recipient: &AgentSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>>;

    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8])
        -> Result<Encrypted>;

    fn decrypt(&self, ciphertext: &Encrypted, key: &KeySecret, nonce_material: &[u8])
        -> Result<Vec<u8>>;

    fn new_random_key_secret(&self) -> (KeyId, KeySecret);

    fn secure_hash(&self, data: &[u8]) -> Hash;

    fn short_hash(&self, data: &[u8]) -> ShortHash;

    fn new_streaming_hash(&self) -> StreamingHash;

    fn random_bytes(&self, len: usize) -> Vec<u8>;

    /// Encrypt one read key under another, for key lineage.
    fn encrypt_key_secret(
        &self,
        to_encrypt: (&KeyId, &KeySecret),
        encrypting: (&KeyId, &KeySecret),
    ) -> Result<Encrypted> {
        let nonce = key_nonce_material(to_encrypt.0, encrypting.0);
        self.encrypt(to_encrypt.1.as_str().as_bytes(), encrypting.1, &nonce)
    }

    fn decrypt_key_secret(
        &self,
        encrypted: &Encrypted,
        encrypted_id: &KeyId,
        encrypting: (&KeyId, &KeySecret),
    ) -> Result<KeySecret> {
        let nonce = key_nonce_material(encrypted_id, encrypting.0);
        let bytes = self.decrypt(encrypted, encrypting.1, &nonce)?;
        let s = String::from_utf8(bytes).map_err(|e| CoreError::Decryption(e.to_string()))?;
        KeySecret::parse(&s)
    }

    fn new_session_id(&self, agent: &AgentId) -> SessionId {
        SessionId::new(agent, &self.random_bytes(8))
    }

    fn new_delete_session_id(&self, agent: &AgentId) -> SessionId {
        SessionId::new_delete(agent, &self.random_bytes(8))
    }
}

fn key_nonce_material(encrypted_id: &KeyId, encrypting_id: &KeyId) -> Vec<u8> {
    format!(
        "{{\"encryptedID\":\"{}\",\"encryptingID\":\"{}\"}}",
        encrypted_id, encrypting_id
    )
    .into_bytes()
}

/// Ed25519 + X25519 + ChaCha20-Poly1305 + BLAKE3.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrypto;

impl DefaultCrypto {
    pub fn new() -> Self {
        Self
    }

    fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CoreError::Encryption(e.to_string()))?;
        let nonce = nonce_from_material(nonce_material);
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::Encryption(e.to_string()))
    }

    fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8], nonce_material: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CoreError::Decryption(e.to_string()))?;
        let nonce = nonce_from_material(nonce_material);
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| CoreError::Decryption(e.to_string()))
    }

    fn shared_seal_key(secret: &AgentSecret, other: &SealerId) -> Result<[u8; 32]> {
        let ours = StaticSecret::from(secret.sealer_bytes()?);
        let theirs = PublicKey::from(other.to_bytes()?);
        let shared = ours.diffie_hellman(&theirs);
        let mut hasher = blake3::Hasher::new_derive_key(SEAL_CONTEXT);
        hasher.update(shared.as_bytes());
        Ok(*hasher.finalize().as_bytes())
    }
}

/// Nonces are derived from caller-provided material, never stored.
fn nonce_from_material(material: &[u8]) -> [u8; 12] {
    let digest = blake3::hash(material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest.as_bytes()[..12]);
    nonce
}

fn decode_b64_prefixed(s: &str, prefix: &str) -> Result<Vec<u8>> {
    let encoded = s
        .strip_prefix(prefix)
        .ok_or_else(|| CoreError::Decoding(format!("missing {} prefix", prefix)))?;
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| CoreError::Decoding(e.to_string()))
}

impl CryptoProvider for DefaultCrypto {
    fn new_agent_secret(&self) -> AgentSecret {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        AgentSecret::from_seed(&seed)
    }

    fn agent_id(&self, secret: &AgentSecret) -> Result<AgentId> {
        let sealer = PublicKey::from(&StaticSecret::from(secret.sealer_bytes()?));
        let signer = SigningKey::from_bytes(&secret.signer_bytes()?).verifying_key();
        Ok(AgentId::from_parts(
            &SealerId::from_bytes(sealer.as_bytes()),
            &SignerId::from_bytes(&signer.to_bytes()),
        ))
    }

    fn sign(&self, secret: &AgentSecret, message: &[u8]) -> Result<Signature> {
        let signing_key = SigningKey::from_bytes(&secret.signer_bytes()?);
        let sig = signing_key.sign(message);
        Ok(Signature::new_unchecked(format!(
            "signature_z{}",
            bs58::encode(sig.to_bytes()).into_string()
        )))
    }

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> Result<bool> {
        let verifying_key = VerifyingKey::from_bytes(&signer.to_bytes()?)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let encoded = signature
            .as_str()
            .strip_prefix("signature_z")
            .ok_or_else(|| CoreError::InvalidSignature(signature.to_string()))?;
        let bytes: [u8; 64] = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| CoreError::InvalidSignature(e.to_string()))?
            .try_into()
            .map_err(|_| CoreError::InvalidSignature("expected 64 bytes".into()))?;
        let sig = ed25519_dalek::Signature::from_bytes(&bytes);
        Ok(verifying_key.verify(message, &sig).is_ok())
    }

    fn seal(
        &self,
        message: &[u8],
        from: &AgentSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Sealed> {
        let key = Self::shared_seal_key(from, to)?;
        let ciphertext = Self::aead_encrypt(&key, message, nonce_material)?;
        Ok(Sealed::new_unchecked(format!(
            "sealed_U{}",
            URL_SAFE_NO_PAD.encode(ciphertext)
        )))
    }

    fn unseal(
        &self,
        sealed: &Sealed,
        recipient: &AgentSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>> {
        let key = Self::shared_seal_key(recipient, from)?;
        let ciphertext = decode_b64_prefixed(sealed.as_str(), "sealed_U")?;
        Self::aead_decrypt(&key, &ciphertext, nonce_material)
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &KeySecret,
        nonce_material: &[u8],
    ) -> Result<Encrypted> {
        let ciphertext = Self::aead_encrypt(&key.to_bytes()?, plaintext, nonce_material)?;
        Ok(Encrypted::new_unchecked(format!(
            "encrypted_U{}",
            URL_SAFE_NO_PAD.encode(ciphertext)
        )))
    }

    fn decrypt(
        &self,
        ciphertext: &Encrypted,
        key: &KeySecret,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>> {
        let bytes = decode_b64_prefixed(ciphertext.as_str(), "encrypted_U")?;
        Self::aead_decrypt(&key.to_bytes()?, &bytes, nonce_material)
    }

    fn new_random_key_secret(&self) -> (KeyId, KeySecret) {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let id = KeyId::from_bytes(&self.random_bytes(12));
        (id, KeySecret::from_bytes(&secret))
    }

    fn secure_hash(&self, data: &[u8]) -> Hash {
        Hash::new_unchecked(format!(
            "hash_z{}",
            bs58::encode(blake3::hash(data).as_bytes()).into_string()
        ))
    }

    fn short_hash(&self, data: &[u8]) -> ShortHash {
        let digest = blake3::hash(data);
        ShortHash::new_unchecked(format!(
            "shortHash_z{}",
            bs58::encode(&digest.as_bytes()[..SHORT_HASH_LENGTH]).into_string()
        ))
    }

    fn new_streaming_hash(&self) -> StreamingHash {
        StreamingHash::new()
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}
