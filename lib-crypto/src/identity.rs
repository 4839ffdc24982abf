//! RSA identities and self-signed certificates
//!
//! A node and a user are each identified by the SHA-256 digest of their
//! RSA public key in DER form. Certificates are self-signed records
//! exchanged during transport handshakes; the receiving side checks that
//! the certified key's digest equals the identifier it expected.

use crate::digest::Digest;
use crate::error::CryptoError;
use crate::hash::sha256;
use crate::kdf;
use anyhow::{Context, Result};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// RSA modulus size for identities
const KEY_BITS: usize = 2048;

/// Context string for private key encryption at rest
const KEYFILE_CONTEXT: &[u8] = b"teapotnet identity keyfile v1";

/// A peer's public key with its cached DER encoding
#[derive(Clone)]
pub struct PublicIdentity {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PublicIdentity {
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::InvalidData(format!("bad public key DER: {e}")))?;
        Ok(Self { key, der: der.to_vec() })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The identifier bound to this key
    pub fn digest(&self) -> Digest {
        sha256(&self.der)
    }

    /// Verify a PKCS#1 v1.5 SHA-256 signature
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let verifying = VerifyingKey::<Sha256>::new(self.key.clone());
        let sig = Signature::try_from(signature)
            .map_err(|e| CryptoError::InvalidData(format!("bad signature encoding: {e}")))?;
        verifying
            .verify(message, &sig)
            .map_err(|_| CryptoError::Auth("signature verification failed".into()))
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentity({:?})", self.digest())
    }
}

/// Self-signed certificate carried in handshakes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Certificate {
    /// Public key, DER encoded
    pub der: Vec<u8>,
    /// Human-readable subject name
    pub name: String,
    /// Self-signature over der || name
    pub signature: Vec<u8>,
}

impl Certificate {
    /// Validate the self-signature and return the certified key
    pub fn validate(&self) -> Result<PublicIdentity, CryptoError> {
        let public = PublicIdentity::from_der(&self.der)?;
        let mut message = self.der.clone();
        message.extend_from_slice(self.name.as_bytes());
        public.verify(&message, &self.signature)?;
        Ok(public)
    }
}

/// Private key material encrypted for storage in the identity file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// A local RSA identity: private key plus cached public half
pub struct Identity {
    private: RsaPrivateKey,
    public: PublicIdentity,
    name: String,
}

impl Identity {
    /// Generate a fresh identity
    pub fn generate(name: &str) -> Result<Self> {
        Self::generate_with_bits(name, KEY_BITS)
    }

    /// Generate with an explicit modulus size. Anything below 2048 bits
    /// is for tests only.
    pub fn generate_with_bits(name: &str, bits: usize) -> Result<Self> {
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).context("RSA key generation failed")?;
        Self::from_private(private, name)
    }

    fn from_private(private: RsaPrivateKey, name: &str) -> Result<Self> {
        let der = private
            .to_public_key()
            .to_public_key_der()
            .context("public key DER encoding failed")?;
        let public = PublicIdentity::from_der(der.as_bytes())
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(Self {
            private,
            public,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    /// The identifier this identity answers to
    pub fn digest(&self) -> Digest {
        self.public.digest()
    }

    /// Sign with PKCS#1 v1.5 over SHA-256
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing = SigningKey::<Sha256>::new(self.private.clone());
        signing.sign(message).to_vec()
    }

    /// Produce the self-signed certificate for handshakes
    pub fn certificate(&self) -> Certificate {
        let mut message = self.public.der.clone();
        message.extend_from_slice(self.name.as_bytes());
        let signature = self.sign(&message);
        Certificate {
            der: self.public.der.clone(),
            name: self.name.clone(),
            signature,
        }
    }

    /// Encrypt the private key for the identity file
    pub fn export_encrypted(&self, secret: &[u8]) -> Result<EncryptedKey> {
        let der: Zeroizing<Vec<u8>> = Zeroizing::new(
            self.private
                .to_pkcs8_der()
                .context("private key DER encoding failed")?
                .as_bytes()
                .to_vec(),
        );
        let key_bytes = Zeroizing::new(kdf::derive_key(secret, KEYFILE_CONTEXT, 32)?);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        let nonce = crate::random::nonce_bytes(12);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), der.as_slice())
            .map_err(|_| anyhow::anyhow!("private key encryption failed"))?;
        Ok(EncryptedKey { nonce, ciphertext })
    }

    /// Decrypt a stored private key and rebuild the identity
    pub fn import_encrypted(encrypted: &EncryptedKey, secret: &[u8], name: &str) -> Result<Self> {
        let key_bytes = Zeroizing::new(kdf::derive_key(secret, KEYFILE_CONTEXT, 32)?);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        let der = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_slice())
                .map_err(|_| anyhow::anyhow!("private key decryption failed"))?,
        );
        let private =
            RsaPrivateKey::from_pkcs8_der(&der).context("bad private key DER")?;
        Self::from_private(private, name)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({}, {:?})", self.name, self.digest())
    }
}
