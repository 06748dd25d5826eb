use blake3::Hasher;
use pqcrypto_dilithium::dilithium3::{
    detached_sign, keypair, verify_detached_signature, DetachedSignature, PublicKey, SecretKey,
};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ledger::Field;
use crate::storage::Store;

const NODE_KEY: &[u8] = b"node_key";

/// Hashes arbitrary data with a domain-specific key for internal consistency.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *Hasher::new_derive_key("chainmirror-v1").update(data).finalize().as_bytes()
}

/// Identifier of a mapping, derived from its owning program and its name.
pub fn mapping_id(program_id: &str, mapping_name: &str) -> Field {
    *Hasher::new_derive_key("chainmirror mapping id")
        .update(program_id.as_bytes())
        .update(&[0])
        .update(mapping_name.as_bytes())
        .finalize()
        .as_bytes()
}

/// Identifier of a key inside a mapping. Two mappings never share key ids.
pub fn key_id(program_id: &str, mapping_name: &str, key: &[u8]) -> Field {
    *Hasher::new_derive_key("chainmirror key id")
        .update(&mapping_id(program_id, mapping_name))
        .update(key)
        .finalize()
        .as_bytes()
}

/// Identifier of a value stored under `key_id`.
pub fn value_id(key_id: &Field, value: &[u8]) -> Field {
    *Hasher::new_derive_key("chainmirror value id")
        .update(key_id)
        .update(value)
        .finalize()
        .as_bytes()
}

/// Message signed in a challenge response: both nonces, little-endian.
pub fn challenge_message(peer_nonce: u64, response_nonce: u64) -> [u8; 16] {
    let mut msg = [0u8; 16];
    msg[..8].copy_from_slice(&peer_nonce.to_le_bytes());
    msg[8..].copy_from_slice(&response_nonce.to_le_bytes());
    msg
}

#[derive(Serialize, Deserialize)]
struct StoredNodeKey {
    pk: Vec<u8>,
    sk: Vec<u8>,
}

/// Long-lived identity used to answer peer challenges.
pub struct NodeKey {
    pk: PublicKey,
    sk: SecretKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        let (pk, sk) = keypair();
        Self { pk, sk }
    }

    /// Loads the node identity from the `meta` column family, creating it on first start.
    pub fn load_or_create(store: &Store) -> Result<Self> {
        if let Some(stored) = store.get::<StoredNodeKey>("meta", NODE_KEY)? {
            let pk = PublicKey::from_bytes(&stored.pk)
                .map_err(|e| anyhow!("invalid node public key: {e:?}"))?;
            let sk = SecretKey::from_bytes(&stored.sk)
                .map_err(|e| anyhow!("invalid node secret key: {e:?}"))?;
            return Ok(Self { pk, sk });
        }
        let key = Self::generate();
        store.put(
            "meta",
            NODE_KEY,
            &StoredNodeKey { pk: key.pk.as_bytes().to_vec(), sk: key.sk.as_bytes().to_vec() },
        )?;
        tracing::info!("generated new node identity {}", hex::encode(&key.id()[..8]));
        Ok(key)
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.pk.as_bytes().to_vec()
    }

    pub fn id(&self) -> [u8; 32] {
        blake3_hash(self.pk.as_bytes())
    }

    pub fn sign_challenge(&self, peer_nonce: u64, response_nonce: u64) -> Vec<u8> {
        detached_sign(&challenge_message(peer_nonce, response_nonce), &self.sk)
            .as_bytes()
            .to_vec()
    }
}

pub fn verify_challenge(public_key: &[u8], peer_nonce: u64, response_nonce: u64, signature: &[u8]) -> bool {
    let (Ok(pk), Ok(sig)) = (PublicKey::from_bytes(public_key), DetachedSignature::from_bytes(signature)) else {
        return false;
    };
    verify_detached_signature(&sig, &challenge_message(peer_nonce, response_nonce), &pk).is_ok()
}
