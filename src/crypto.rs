//! Key material for spaces and replicas.

use anyhow::{anyhow, bail, Context, Result};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};

use crate::types::{PeerId, SpaceId};

const NONCE_LEN: usize = 12;

/// Symmetric read key shared by every member of a space.
#[derive(Clone)]
pub struct SpaceKey {
    cipher: ChaCha20Poly1305,
    raw: Key,
}

impl std::fmt::Debug for SpaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SpaceKey(..)")
    }
}

impl SpaceKey {
    pub fn generate() -> Self {
        Self::from_key(ChaCha20Poly1305::generate_key(&mut OsRng))
    }

    fn from_key(raw: Key) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&raw),
            raw,
        }
    }

    /// Base58 form carried in the space's access-control payload
    pub fn encode(&self) -> String {
        bs58::encode(self.raw.as_slice()).into_string()
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .context("read key is not base58")?;
        if bytes.len() != 32 {
            bail!("read key must be 32 bytes, got {}", bytes.len());
        }
        Ok(Self::from_key(*Key::from_slice(&bytes)))
    }

    /// Returns `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            bail!("sealed value shorter than nonce ({} bytes)", sealed.len());
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed"))
    }
}

/// Public identity of a space, hashed into its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceHeader {
    pub space_type: String,
    pub creator: PeerId,
    pub created_at: i64,
    pub replication_key: u64,
    /// Random salt so two headers created in the same millisecond differ
    pub seed: String,
}

impl SpaceHeader {
    pub fn new(space_type: &str, creator: &str) -> Self {
        let salt: [u8; 16] = random_bytes();
        Self {
            space_type: space_type.to_string(),
            creator: creator.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            replication_key: 1,
            seed: bs58::encode(salt).into_string(),
        }
    }

    pub fn derive_id(&self) -> Result<SpaceId> {
        let bytes = serde_json::to_vec(self)?;
        Ok(bs58::encode(blake3::hash(&bytes).as_bytes()).into_string())
    }
}

/// Derive this replica's peer id. With a seed the id is stable across
/// restarts (one id per `index`); without one it is random.
pub fn derive_peer_id(seed: Option<&str>, index: u32) -> PeerId {
    let digest = match seed {
        Some(seed) => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(seed.as_bytes());
            hasher.update(&index.to_le_bytes());
            hasher.finalize()
        }
        None => blake3::hash(&random_bytes::<32>()),
    };
    bs58::encode(&digest.as_bytes()[..20]).into_string()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    use chacha20poly1305::aead::rand_core::RngCore;

    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
