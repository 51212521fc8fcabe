use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;

use canopy_types::{Address, Hash};

use crate::error::CryptoError;
use crate::hasher::keccak256;

/// A 65-byte recoverable ECDSA signature (`r ‖ s ‖ v`).
///
/// The empty signature marks an unsigned tx (only the genesis tx is allowed
/// to stay unsigned).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "Signature(<empty>)")
        } else {
            write!(f, "Signature({}...)", hex::encode(&self.0[..8.min(self.0.len())]))
        }
    }
}

impl serde::Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize;
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// secp256k1 signing keypair.
pub struct SigningKeypair {
    secret: SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Restore from a 32-byte secret scalar in hex.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKey)?;
        let secret = SigningKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { secret })
    }

    /// The public half.
    pub fn public(&self) -> SigningPublicKey {
        SigningPublicKey(*self.secret.verifying_key())
    }

    /// The address derived from the public key.
    pub fn address(&self) -> Address {
        self.public().address()
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign_hash(&self, hash: &Hash) -> Result<Signature, CryptoError> {
        let (sig, recid) = self
            .secret
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|_| CryptoError::InvalidSignature)?;
        let mut bytes = sig.to_vec();
        bytes.push(recid.to_byte());
        Ok(Signature(bytes))
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeypair(<redacted>)")
    }
}

/// secp256k1 verifying key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigningPublicKey(VerifyingKey);

impl SigningPublicKey {
    /// Verify a recoverable signature over a 32-byte digest.
    pub fn verify(&self, hash: &Hash, sig: &Signature) -> bool {
        if sig.0.len() != 65 {
            return false;
        }
        let Ok(ecdsa_sig) = EcdsaSignature::from_slice(&sig.0[..64]) else {
            return false;
        };
        self.0.verify_prehash(hash.as_bytes(), &ecdsa_sig).is_ok()
    }

    /// The address: the last 20 bytes of the Keccak-256 of the uncompressed
    /// public key.
    pub fn address(&self) -> Address {
        let point = self.0.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest.as_bytes()[12..]);
        Address::from_bytes(addr)
    }

    /// Uncompressed SEC1 encoding (65 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(false).as_bytes().to_vec()
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningPublicKey({})", self.address().short_hex())
    }
}

/// Recover the signer's public key from a digest and a recoverable
/// signature.
pub fn recover_signing_pubkey(hash: &Hash, sig: &Signature) -> Result<SigningPublicKey, CryptoError> {
    if sig.0.len() != 65 {
        return Err(CryptoError::InvalidLength {
            expected: 65,
            actual: sig.0.len(),
        });
    }
    let ecdsa_sig =
        EcdsaSignature::from_slice(&sig.0[..64]).map_err(|_| CryptoError::InvalidSignature)?;
    let recid = RecoveryId::from_byte(sig.0[64]).ok_or(CryptoError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &ecdsa_sig, recid)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Ok(SigningPublicKey(key))
}

/// 32 random bytes for a peer-identity challenge.
pub fn generate_challenge() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_recover() {
        let keypair = SigningKeypair::generate();
        let hash = keccak256(b"message");
        let sig = keypair.sign_hash(&hash).unwrap();

        assert!(keypair.public().verify(&hash, &sig));

        let recovered = recover_signing_pubkey(&hash, &sig).unwrap();
        assert_eq!(recovered.address(), keypair.address());
    }

    #[test]
    fn verify_fails_on_wrong_hash() {
        let keypair = SigningKeypair::generate();
        let sig = keypair.sign_hash(&keccak256(b"one")).unwrap();
        assert!(!keypair.public().verify(&keccak256(b"two"), &sig));
    }

    #[test]
    fn recovery_of_tampered_sig_yields_wrong_address() {
        let keypair = SigningKeypair::generate();
        let hash = keccak256(b"message");
        let sig = keypair.sign_hash(&hash).unwrap();

        let mut bytes = sig.as_bytes().to_vec();
        bytes[3] ^= 0xff;
        let tampered = Signature::from_bytes(bytes);

        match recover_signing_pubkey(&hash, &tampered) {
            Ok(recovered) => assert_ne!(recovered.address(), keypair.address()),
            Err(err) => assert_eq!(err, CryptoError::InvalidSignature),
        }
    }

    #[test]
    fn recover_rejects_short_sig() {
        let err = recover_signing_pubkey(&keccak256(b"x"), &Signature::from_bytes(vec![1, 2]))
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidLength { .. }));
    }

    #[test]
    fn from_hex_roundtrip() {
        let keypair =
            SigningKeypair::from_hex("fad9c8855b740a0b7ed4c221dbad0f33a83a49cad6b3fe8d5817ac83d38b6a19")
                .unwrap();
        let again =
            SigningKeypair::from_hex("fad9c8855b740a0b7ed4c221dbad0f33a83a49cad6b3fe8d5817ac83d38b6a19")
                .unwrap();
        assert_eq!(keypair.address(), again.address());
    }

    #[test]
    fn addresses_are_distinct_per_key() {
        assert_ne!(
            SigningKeypair::generate().address(),
            SigningKeypair::generate().address()
        );
    }

    #[test]
    fn signature_serde_roundtrip() {
        let keypair = SigningKeypair::generate();
        let sig = keypair.sign_hash(&keccak256(b"payload")).unwrap();
        let json = serde_json::to_string(&sig).unwrap();
        let parsed: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn challenges_are_random() {
        assert_ne!(generate_challenge(), generate_challenge());
    }

    #[test]
    fn debug_redacts_secret() {
        let keypair = SigningKeypair::generate();
        assert!(format!("{keypair:?}").contains("redacted"));
    }
}
