// RSA key material. A Key is either the public half (enough to verify) or a
// private key (can also sign). Signatures are deterministic RSA-SHA256
// (PKCS#1 v1.5) over the canonical byte form of a transaction.

use crate::error::{Error, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Clone)]
enum Inner {
    Public(RsaPublicKey),
    Private(RsaPrivateKey),
}

#[derive(Clone)]
pub struct Key {
    inner: Inner,
}

impl Key {
    /// Parse a key from PEM text, accepting both PKCS#1 and PKCS#8 framings.
    pub fn from_pem(pem: &str) -> Result<Key> {
        let pem = pem.trim();
        let inner = if pem.contains("PRIVATE KEY") {
            let key = RsaPrivateKey::from_pkcs1_pem(pem)
                .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
                .map_err(|e| Error::Crypto(format!("can't read private key: {}", e)))?;
            Inner::Private(key)
        } else {
            let key = RsaPublicKey::from_public_key_pem(pem)
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                .map_err(|e| Error::Crypto(format!("can't read public key: {}", e)))?;
            Inner::Public(key)
        };
        Ok(Key { inner })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Key> {
        let pem = fs::read_to_string(path.as_ref())?;
        Key::from_pem(&pem)
    }

    /// Inverse of [`Key::to_text`]: re-frame a bare base64 body as SPKI PEM.
    /// Framed PEM passes through untouched.
    pub fn from_text(text: &str) -> Result<Key> {
        let text = text.trim();
        if text.contains("-----") {
            return Key::from_pem(text);
        }
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        let body: String = text.split_whitespace().collect();
        for chunk in body.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).map_err(|_| {
                Error::Crypto("public key text is not ASCII".to_string())
            })?);
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        Key::from_pem(&pem)
    }

    pub fn from_public(key: RsaPublicKey) -> Key {
        Key {
            inner: Inner::Public(key),
        }
    }

    pub fn from_private(key: RsaPrivateKey) -> Key {
        Key {
            inner: Inner::Private(key),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self.inner, Inner::Private(_))
    }

    fn public(&self) -> RsaPublicKey {
        match &self.inner {
            Inner::Public(key) => key.clone(),
            Inner::Private(key) => key.to_public_key(),
        }
    }

    /// Canonical PEM of the public half, LF line endings. This is what wallet
    /// headers carry.
    pub fn to_pub_pem(&self) -> String {
        self.public()
            .to_public_key_pem(LineEnding::LF)
            .expect("SPKI encoding of an RSA public key cannot fail")
    }

    /// The PEM body flattened to a single base64 line. Invoice prefixes are
    /// drawn from this text, so it doubles as the prefix universe of a wallet.
    pub fn to_text(&self) -> String {
        self.to_pub_pem()
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("")
    }

    /// Sign `body`, returning the base64 signature. Only private keys can.
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let key = match &self.inner {
            Inner::Private(key) => key.clone(),
            Inner::Public(_) => {
                return Err(Error::Crypto("can't sign with a public key".to_string()))
            }
        };
        let signer = SigningKey::<Sha256>::new(key);
        let signature = signer.sign(body);
        Ok(BASE64_STANDARD.encode(signature.to_vec()))
    }

    /// Verify a base64 signature over `body` against the public half.
    pub fn verify(&self, body: &[u8], sign: &str) -> Result<bool> {
        let raw = match BASE64_STANDARD.decode(sign) {
            Ok(raw) => raw,
            Err(_) => return Ok(false),
        };
        let signature = match Signature::try_from(raw.as_slice()) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let verifier = VerifyingKey::<Sha256>::new(self.public());
        Ok(verifier.verify(body, &signature).is_ok())
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.public() == other.public()
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Inner::Public(_) => write!(f, "Key(public, {:.16}...)", self.to_text()),
            Inner::Private(_) => write!(f, "Key(private)"),
        }
    }
}
