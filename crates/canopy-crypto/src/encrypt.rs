use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};

use crate::error::CryptoError;

const NONCE_LEN: usize = 24;

/// X25519 keypair for sealing private txs to a recipient.
pub struct EncryptingKeypair {
    secret: SecretKey,
}

/// X25519 public key a private tx can be sealed to.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptingPublicKey(PublicKey);

impl EncryptingKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    /// The public half.
    pub fn public(&self) -> EncryptingPublicKey {
        EncryptingPublicKey(self.secret.public_key())
    }

    /// Seal a message for `recipient`: authenticated encryption with a fresh
    /// random nonce, which is prepended to the ciphertext.
    pub fn seal_for(
        &self,
        recipient: &EncryptingPublicKey,
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = SalsaBox::new(&recipient.0, &self.secret)
            .encrypt(&nonce, message)
            .map_err(|_| CryptoError::SealFailed)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a message sealed by `sender` for this keypair.
    pub fn open_from(
        &self,
        sender: &EncryptingPublicKey,
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::InvalidLength {
                expected: NONCE_LEN,
                actual: sealed.len(),
            });
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        SalsaBox::new(&sender.0, &self.secret)
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| CryptoError::OpenFailed)
    }
}

impl EncryptingPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(PublicKey::from(arr)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl std::fmt::Debug for EncryptingKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptingKeypair(<redacted>)")
    }
}

impl std::fmt::Debug for EncryptingPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptingPublicKey({})", hex::encode(&self.0.as_bytes()[..4]))
    }
}
