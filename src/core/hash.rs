// Hashing and signature primitives

use ripemd::Ripemd160;
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use sha3::{Digest, Sha3_256, Sha3_512};

use crate::core::{Checksum, Hash};

/// SHA3-512 digest, used for block and transaction hashes
pub fn digest(data: &[u8]) -> Hash {
    let output = Sha3_512::digest(data);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&output);
    Hash(bytes)
}

/// SHA3-256 digest of a frame payload
pub fn checksum(data: &[u8]) -> Checksum {
    Checksum(Sha3_256::digest(data).into())
}

/// Lowercase hex for display. Compare hashes directly, never their text.
pub fn human_readable_hash(hash: &Hash) -> String {
    hash.to_hex()
}

/// RIPEMD160(SHA256(data)) - used for address generation
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

// ECDSA signs 32 bytes; the first half of the 512-bit digest is what gets signed.
fn signing_message(hash: &Hash) -> Message {
    let mut prefix = [0u8; 32];
    prefix.copy_from_slice(&hash.as_bytes()[..32]);
    Message::from_digest(prefix)
}

/// Sign a hash, returning a DER encoded ECDSA signature
pub fn sign(secret_key: &SecretKey, hash: &Hash) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    secp.sign_ecdsa(&signing_message(hash), secret_key)
        .serialize_der()
        .to_vec()
}

/// Verify a DER signature against a serialized public key.
///
/// Malformed keys or signatures verify as `false`.
pub fn verify(public_key: &[u8], hash: &Hash, signature: &[u8]) -> bool {
    let Ok(public_key) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(signature) = ecdsa::Signature::from_der(signature) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&signing_message(hash), &signature, &public_key)
        .is_ok()
}
