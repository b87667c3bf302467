//! Functions and key types for the core crypto.

use std::fmt;

use crypto_box::aead::generic_array::typenum::marker_traits::Unsigned;
use crypto_box::aead::AeadCore;
use crypto_box::SalsaBox;
pub use crypto_box::{PublicKey, SecretKey, KEY_SIZE};
pub use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;

pub type Nonce = [u8; NONCEBYTES];
pub const NONCEBYTES: usize = <SalsaBox as AeadCore>::NonceSize::USIZE;

/// Size of a symmetric tunnel session key.
pub const SESSION_KEY_SIZE: usize = 32;

/// Symmetric key shared between a path owner and one of its hops.
pub type SessionKey = [u8; SESSION_KEY_SIZE];

/** 32-byte Ed25519 public signing key identifying a router.

Doubles as the key the router occupies in the DHT key space.
*/
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RouterId(pub [u8; PUBLIC_KEY_LENGTH]);

impl RouterId {
    /// Interpret the id as an Ed25519 verifying key. Fails for byte strings
    /// that are not valid curve points.
    pub fn verifying_key(&self) -> Result<VerifyingKey, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Lowercase hex rendering, also used for NodeDB file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<VerifyingKey> for RouterId {
    fn from(key: VerifyingKey) -> Self {
        RouterId(key.to_bytes())
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for RouterId {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        RouterId(bytes)
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RouterId({})", self.to_hex())
    }
}

/** 16-byte random path identifier.

Every hop of a path gets a distinct tx/rx pair of these, one per direction.
*/
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PathId(pub [u8; PATH_ID_SIZE]);

pub const PATH_ID_SIZE: usize = 16;

impl PathId {
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let mut bytes = [0; PATH_ID_SIZE];
        rng.fill(&mut bytes);
        PathId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PATH_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PathId({})", hex::encode(self.0))
    }
}

/** Nonce of the layered tunnel transform.

The owner picks a random starting nonce and every hop folds its own mask
into it, so no two layers of one message are ever encrypted under the same
`(key, nonce)` pair.
*/
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct TunnelNonce(pub Nonce);

impl TunnelNonce {
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let mut bytes = [0; NONCEBYTES];
        rng.fill(&mut bytes);
        TunnelNonce(bytes)
    }

    /// Fold another nonce into this one.
    pub fn xor(&mut self, other: &TunnelNonce) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    pub fn as_bytes(&self) -> &[u8; NONCEBYTES] {
        &self.0
    }
}

impl fmt::Debug for TunnelNonce {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TunnelNonce({})", hex::encode(self.0))
    }
}

/** Apply the tunnel stream transform to a buffer in place.

XSalsa20 keystream XOR, so applying the same `(key, nonce)` twice restores
the original bytes. Relays rely on this to strip layers they did not see
being added.
*/
pub fn tunnel_crypt(key: &SessionKey, nonce: &TunnelNonce, buf: &mut [u8]) {
    let mut cipher = XSalsa20::new(key.into(), (&nonce.0).into());
    cipher.apply_keystream(buf);
}

/// Generate a fresh tunnel session key.
pub fn gen_session_key<R: rand::Rng>(rng: &mut R) -> SessionKey {
    let mut key = [0; SESSION_KEY_SIZE];
    rng.fill(&mut key);
    key
}

/// Number of bytes the crypto_box AEAD appends to a sealed frame.
pub const BOX_OVERHEAD: usize = <SalsaBox as AeadCore>::TagSize::USIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn tunnel_crypt_round_trip() {
        let mut rng = thread_rng();
        let key = gen_session_key(&mut rng);
        let nonce = TunnelNonce::random(&mut rng);

        let mut buf = b"onion routed payload".to_vec();
        tunnel_crypt(&key, &nonce, &mut buf);
        assert_ne!(buf.as_slice(), &b"onion routed payload"[..]);
        tunnel_crypt(&key, &nonce, &mut buf);
        assert_eq!(buf.as_slice(), &b"onion routed payload"[..]);
    }

    #[test]
    fn tunnel_crypt_layers_commute() {
        let mut rng = thread_rng();
        let key_1 = gen_session_key(&mut rng);
        let key_2 = gen_session_key(&mut rng);
        let nonce = TunnelNonce::random(&mut rng);

        let mut ab = vec![42; 64];
        tunnel_crypt(&key_1, &nonce, &mut ab);
        tunnel_crypt(&key_2, &nonce, &mut ab);

        let mut ba = vec![42; 64];
        tunnel_crypt(&key_2, &nonce, &mut ba);
        tunnel_crypt(&key_1, &nonce, &mut ba);

        assert_eq!(ab, ba);
    }

    #[test]
    fn tunnel_nonce_xor_involution() {
        let mut rng = thread_rng();
        let start = TunnelNonce::random(&mut rng);
        let mask = TunnelNonce::random(&mut rng);

        let mut nonce = start;
        nonce.xor(&mask);
        assert_ne!(nonce, start);
        nonce.xor(&mask);
        assert_eq!(nonce, start);
    }

    #[test]
    fn router_id_hex() {
        let id = RouterId([0xab; PUBLIC_KEY_LENGTH]);
        assert_eq!(id.to_hex(), "ab".repeat(PUBLIC_KEY_LENGTH));
    }

    #[test]
    fn router_id_from_signing_key() {
        let sk = SigningKey::generate(&mut thread_rng());
        let id = RouterId::from(sk.verifying_key());
        assert_eq!(id.verifying_key().unwrap(), sk.verifying_key());
    }
}
