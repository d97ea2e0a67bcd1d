//! P-256 ECDH session keys and AES-256-CBC payload encryption.
//!
//! A writer generates an ephemeral key pair per session and agrees on a shared
//! secret with the receiver's long-term public key. The 32-byte x-coordinate of
//! the agreement is the AES-256 key, with no further derivation. Each payload is
//! encrypted under a fresh random 16-byte IV that is prefixed to the ciphertext.

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CoreError, CoreResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of an uncompressed SEC1 P-256 public key.
pub const PUBLIC_KEY_LEN: usize = 65;

/// Width of the zero-padded public key slot in a chunk header.
pub const PUBLIC_KEY_SLOT_LEN: usize = 128;

/// Length of the per-payload initialization vector.
pub const IV_LEN: usize = 16;

/// AES block size; ciphertext is always a positive multiple of it.
pub const BLOCK_LEN: usize = 16;

/// 256-bit symmetric key obtained from ECDH.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// A P-256 key pair: the sink's ephemeral pair or the receiver's long-term pair.
#[derive(Clone)]
pub struct SessionKeys {
    secret: SecretKey,
    public: PublicKey,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Rebuilds a key pair from a hex-encoded 32-byte private scalar.
    pub fn from_secret_hex(secret_hex: &str) -> CoreResult<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| CoreError::InvalidKey(format!("private key is not hex: {}", e)))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| CoreError::InvalidKey("private key is not a valid P-256 scalar".into()))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// Uncompressed SEC1 encoding of the public key.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Hex encoding of [`SessionKeys::public_key_bytes`].
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Hex encoding of the private scalar.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// The public key padded into a chunk header slot.
    pub fn public_key_slot(&self) -> [u8; PUBLIC_KEY_SLOT_LEN] {
        let mut slot = [0u8; PUBLIC_KEY_SLOT_LEN];
        let bytes = self.public_key_bytes();
        slot[..bytes.len()].copy_from_slice(&bytes);
        slot
    }

    /// ECDH agreement with a peer public key.
    pub fn agree(&self, peer: &PublicKey) -> SharedSecret {
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut key = [0u8; 32];
        key.copy_from_slice(shared.raw_secret_bytes().as_slice());
        SharedSecret(key)
    }
}

/// Parses a SEC1-encoded public key (compressed or uncompressed).
pub fn parse_public_key(bytes: &[u8]) -> CoreResult<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| CoreError::InvalidKey("public key is not a valid P-256 point".into()))
}

/// Parses a hex-encoded SEC1 public key.
pub fn parse_public_key_hex(public_hex: &str) -> CoreResult<PublicKey> {
    let bytes = hex::decode(public_hex.trim())
        .map_err(|e| CoreError::InvalidKey(format!("public key is not hex: {}", e)))?;
    parse_public_key(&bytes)
}

/// Extracts the public key from a zero-padded chunk header slot.
pub fn public_key_from_slot(slot: &[u8; PUBLIC_KEY_SLOT_LEN]) -> CoreResult<PublicKey> {
    let len = match slot[0] {
        0x04 => PUBLIC_KEY_LEN,
        0x02 | 0x03 => 33,
        tag => {
            return Err(CoreError::InvalidKey(format!(
                "unknown SEC1 tag {:#04x} in key slot",
                tag
            )))
        }
    };
    parse_public_key(&slot[..len])
}

/// Encrypts a payload into `output` (replacing its contents).
pub trait Encrypt: Send + Sync {
    /// Writes the ciphertext for `plaintext` into `output`.
    fn encrypt(&self, plaintext: &[u8], output: &mut Vec<u8>) -> CoreResult<()>;
}

/// Inverse of [`Encrypt`].
pub trait Decrypt: Send + Sync {
    /// Returns the plaintext of one encrypted payload.
    fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>>;
}

/// AES-256-CBC with PKCS#7 padding and a random IV prefix.
#[derive(Debug, Clone)]
pub struct AesCbcCrypt {
    key: SharedSecret,
}

impl AesCbcCrypt {
    /// Creates a cipher keyed by an ECDH shared secret.
    pub fn new(key: SharedSecret) -> Self {
        Self { key }
    }
}

/// Generates a cryptographically random IV.
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

impl Encrypt for AesCbcCrypt {
    fn encrypt(&self, plaintext: &[u8], output: &mut Vec<u8>) -> CoreResult<()> {
        let iv = random_iv();
        let cipher = Aes256CbcEnc::new_from_slices(&self.key.0, &iv)
            .map_err(|e| CoreError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        output.clear();
        output.reserve(IV_LEN + ciphertext.len());
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl Decrypt for AesCbcCrypt {
    fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        if ciphertext.len() < IV_LEN + BLOCK_LEN || (ciphertext.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(CoreError::DecryptionFailed(format!(
                "payload length {} is not IV plus whole blocks",
                ciphertext.len()
            )));
        }
        let (iv, body) = ciphertext.split_at(IV_LEN);
        let cipher = Aes256CbcDec::new_from_slices(&self.key.0, iv)
            .map_err(|e| CoreError::DecryptionFailed(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CoreError::DecryptionFailed("bad padding (wrong key or damaged data)".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn crypt_pair() -> (AesCbcCrypt, AesCbcCrypt) {
        let sender = SessionKeys::generate();
        let receiver = SessionKeys::generate();
        let send_key = sender.agree(&parse_public_key(&receiver.public_key_bytes()).unwrap());
        let recv_key = receiver.agree(&parse_public_key(&sender.public_key_bytes()).unwrap());
        (AesCbcCrypt::new(send_key), AesCbcCrypt::new(recv_key))
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = SessionKeys::generate();
        let b = SessionKeys::generate();
        let ab = a.agree(&parse_public_key_hex(&b.public_key_hex()).unwrap());
        let ba = b.agree(&parse_public_key_hex(&a.public_key_hex()).unwrap());
        assert_eq!(ab.0, ba.0);
    }

    #[test]
    fn test_public_key_is_uncompressed_sec1() {
        let keys = SessionKeys::generate();
        let bytes = keys.public_key_bytes();
        assert_eq!(bytes.len(), PUBLIC_KEY_LEN);
        assert_eq!(bytes[0], 0x04);
    }

    #[test]
    fn test_slot_roundtrip() {
        let keys = SessionKeys::generate();
        let slot = keys.public_key_slot();
        assert!(slot[PUBLIC_KEY_LEN..].iter().all(|b| *b == 0));
        let parsed = public_key_from_slot(&slot).unwrap();
        assert_eq!(parsed, parse_public_key(&keys.public_key_bytes()).unwrap());
    }

    #[test]
    fn test_empty_slot_is_rejected() {
        let slot = [0u8; PUBLIC_KEY_SLOT_LEN];
        assert!(matches!(
            public_key_from_slot(&slot),
            Err(CoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let keys = SessionKeys::generate();
        let restored = SessionKeys::from_secret_hex(&keys.secret_key_hex()).unwrap();
        assert_eq!(restored.public_key_bytes(), keys.public_key_bytes());
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        assert!(matches!(
            SessionKeys::from_secret_hex("not hex"),
            Err(CoreError::InvalidKey(_))
        ));
        assert!(matches!(
            parse_public_key_hex("04abcd"),
            Err(CoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let (enc, _) = crypt_pair();
        let mut a = Vec::new();
        let mut b = Vec::new();
        enc.encrypt(b"same plaintext", &mut a).unwrap();
        enc.encrypt(b"same plaintext", &mut b).unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_or_garbles() {
        let (enc, _) = crypt_pair();
        let (_, other) = crypt_pair();
        let mut ct = Vec::new();
        enc.encrypt(b"secret message", &mut ct).unwrap();
        match other.decrypt(&ct) {
            Err(CoreError::DecryptionFailed(_)) => {}
            Ok(pt) => assert_ne!(pt, b"secret message"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_short_payload_rejected() {
        let (_, dec) = crypt_pair();
        assert!(matches!(
            dec.decrypt(&[0u8; IV_LEN]),
            Err(CoreError::DecryptionFailed(_))
        ));
        assert!(matches!(
            dec.decrypt(&[0u8; IV_LEN + 5]),
            Err(CoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_shared_secret_debug_redacted() {
        let s = SharedSecret([7u8; 32]);
        assert_eq!(format!("{:?}", s), "SharedSecret([REDACTED])");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_encrypt_decrypt(data in prop::collection::vec(any::<u8>(), 0..8192)) {
            let (enc, dec) = crypt_pair();
            let mut ct = Vec::new();
            enc.encrypt(&data, &mut ct).unwrap();
            prop_assert_eq!((ct.len() - IV_LEN) % BLOCK_LEN, 0);
            prop_assert!(ct.len() > data.len() + IV_LEN);
            prop_assert_eq!(dec.decrypt(&ct).unwrap(), data);
        }
    }
}
