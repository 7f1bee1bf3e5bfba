//! Keccak-256 hashing and secp256k1 recoverable-signature helpers.
//!
//! Node identities are derived the EVM way: keccak256 of the 64-byte
//! uncompressed public key, low 20 bytes. Handshake frames are authenticated
//! with a 65-byte recoverable ECDSA signature (r || s || v).

use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message as SignedMessage, PublicKey, Secp256k1, SecretKey,
};
use sha3::{Digest, Keccak256};

use crate::types::NodeId;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derives the 160-bit node id from an uncompressed secp256k1 public key,
/// matching standard EVM-style address derivation (see spec Open Question iii:
/// this implementation picks the EVM scheme and rejects 64-byte legacy ids).
pub fn node_id_from_public_key(public_key: &PublicKey) -> NodeId {
    // Uncompressed form is 0x04 || X(32) || Y(32); the marker byte is dropped
    // before hashing, same as go-ethereum/ethrex's crypto.PubkeyToAddress.
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    let mut id = [0u8; 20];
    id.copy_from_slice(&hash[12..]);
    NodeId(id)
}

pub fn public_key_from_secret(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), secret)
}

pub fn node_id_from_secret(secret: &SecretKey) -> NodeId {
    node_id_from_public_key(&public_key_from_secret(secret))
}

/// Signs `digest` (already the keccak256 of the signed fields) with the
/// node's long-lived key, returning a 65-byte r||s||v signature.
pub fn sign_recoverable(secret: &SecretKey, digest: &[u8; 32]) -> [u8; 65] {
    let secp = Secp256k1::signing_only();
    let msg = SignedMessage::from_digest(*digest);
    let (recovery_id, sig) = secp.sign_ecdsa_recoverable(&msg, secret).serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&sig);
    out[64] = recovery_id.to_i32() as u8;
    out
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signature is not 65 bytes")]
    BadLength,
    #[error("invalid recovery id")]
    BadRecoveryId,
    #[error("could not recover public key: {0}")]
    Recovery(secp256k1::Error),
}

/// Recovers the signer's public key from a 65-byte r||s||v signature over
/// `digest`, used by the handshake to verify `peer_id` matches the signer.
pub fn recover_public_key(
    signature: &[u8],
    digest: &[u8; 32],
) -> Result<PublicKey, SignatureError> {
    if signature.len() != 65 {
        return Err(SignatureError::BadLength);
    }
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| SignatureError::BadRecoveryId)?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(SignatureError::Recovery)?;
    let secp = Secp256k1::verification_only();
    let msg = SignedMessage::from_digest(*digest);
    secp.recover_ecdsa(&msg, &recoverable)
        .map_err(SignatureError::Recovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_and_recover_round_trips() {
        let secret = SecretKey::new(&mut OsRng);
        let expected = public_key_from_secret(&secret);
        let digest = keccak256(b"handshake payload");
        let sig = sign_recoverable(&secret, &digest);
        let recovered = recover_public_key(&sig, &digest).unwrap();
        assert_eq!(recovered, expected);
        assert_eq!(node_id_from_public_key(&expected).0.len(), 20);
    }

    #[test]
    fn tampered_digest_recovers_different_key() {
        let secret = SecretKey::new(&mut OsRng);
        let expected = public_key_from_secret(&secret);
        let digest = keccak256(b"original");
        let sig = sign_recoverable(&secret, &digest);
        let other_digest = keccak256(b"tampered");
        let recovered = recover_public_key(&sig, &other_digest).unwrap();
        assert_ne!(recovered, expected);
    }
}
