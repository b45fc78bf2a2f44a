//! Signing capability injected into transaction assembly.

use std::fmt;

use ckb_hash::blake2b_256;
use color_eyre::eyre::{Result, eyre};
use secp256k1::{
    Message, PublicKey, Secp256k1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};

/// Something that can sign sighash digests for one secp256k1 key.
pub trait Signer: Send + Sync {
    /// Compressed public key.
    fn public_key(&self) -> [u8; 33];

    /// Lock args of the key's sighash lock.
    fn lock_args(&self) -> [u8; 20] {
        blake160(&self.public_key())
    }

    /// 65-byte recoverable signature: compact signature || recovery id.
    fn sign_recoverable(&self, digest: &[u8; 32]) -> Result<[u8; 65]>;
}

/// First 20 bytes of blake2b-256.
pub fn blake160(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&blake2b_256(data)[..20]);
    hash
}

/// Signer backed by an in-memory private key.
pub struct Secp256k1Signer {
    secret: SecretKey,
    public: PublicKey,
}

impl Secp256k1Signer {
    pub fn new(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(secp256k1::SECP256K1, &secret);
        Self { secret, public }
    }

    /// Parse a hex private key, with or without `0x`.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim().trim_start_matches("0x"))?;
        if bytes.len() != 32 {
            return Err(eyre!(
                "Invalid private key length: {} bytes (expected 32)",
                bytes.len()
            ));
        }
        let secret = SecretKey::from_slice(&bytes)?;
        Ok(Self::new(secret))
    }
}

impl fmt::Debug for Secp256k1Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secp256k1Signer")
            .field("public_key", &hex::encode(self.public.serialize()))
            .finish_non_exhaustive()
    }
}

impl Signer for Secp256k1Signer {
    fn public_key(&self) -> [u8; 33] {
        self.public.serialize()
    }

    fn sign_recoverable(&self, digest: &[u8; 32]) -> Result<[u8; 65]> {
        let message = Message::from_digest(*digest);
        let sig = secp256k1::SECP256K1.sign_ecdsa_recoverable(&message, &self.secret);
        let (recovery_id, signature_bytes) = sig.serialize_compact();

        let mut signature = [0u8; 65];
        signature[..64].copy_from_slice(&signature_bytes);
        signature[64] = recovery_id.to_i32() as u8;
        Ok(signature)
    }
}

/// Recover the signing key's lock args from a recoverable signature.
pub fn recover_lock_args(digest: &[u8; 32], signature: &[u8]) -> Result<[u8; 20]> {
    if signature.len() != 65 {
        return Err(eyre!(
            "Invalid signature length: {} bytes (expected 65)",
            signature.len()
        ));
    }
    let recovery_id = RecoveryId::from_i32(signature[64] as i32)?;
    let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id)?;
    let secp = Secp256k1::verification_only();
    let public = secp.recover_ecdsa(&Message::from_digest(*digest), &sig)?;
    Ok(blake160(&public.serialize()))
}
