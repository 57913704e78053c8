// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Endpoint identity: private key generation, PEM storage, and fingerprints
//!
//! Keys are produced either from OS randomness or, when a seed is supplied, from
//! a [random::DeterministicRng] so that the same seed always rebuilds the same key.

use std::fmt;

use rand::{CryptoRng, RngCore};
use rsa::{
  pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding},
  traits::PublicKeyParts,
  RsaPrivateKey,
};
use rustls_pemfile::Item;
use zeroize::Zeroizing;

pub mod fingerprint;
pub mod random;

pub use fingerprint::{fingerprint, fingerprint_wire, Fingerprint, PublicKey};
pub use random::{DeterministicRng, Randomness};

pub const DEFAULT_RSA_BITS: usize = 4096;
pub const MIN_RSA_BITS: usize = 2048;

const EC_PEM_LABEL: &str = "EC PRIVATE KEY";
const RSA_PEM_LABEL: &str = "RSA PRIVATE KEY";

#[derive(thiserror::Error, Debug)]
pub enum KeyGenError {
  #[error("unsupported key type {0:?}; expected \"ECDSA\" or \"RSA\"")]
  UnsupportedKeyType(String),
  #[error("invalid RSA key size {0:?}")]
  InvalidKeySize(String),
  #[error("RSA key size {bits} is too small; at least {minimum} bits are required")]
  KeySizeTooSmall { bits: usize, minimum: usize },
  #[error("unable to generate RSA key: {0}")]
  Rsa(#[from] rsa::Error),
  #[error("unable to encode {label}: {reason}")]
  Encoding { label: &'static str, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum KeyLoadError {
  #[error("unable to read PEM input: {0}")]
  Io(#[from] std::io::Error),
  #[error("no EC PRIVATE KEY or RSA PRIVATE KEY block found")]
  NoPrivateKey,
  #[error("malformed {label} block: {reason}")]
  Malformed { label: &'static str, reason: String },
}

/// Which kind of private key to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
  EcdsaP256,
  Rsa { bits: usize },
}

impl KeyType {
  /// Interprets a key type name and RSA size as given by an operator
  ///
  /// Names are case-insensitive and an empty name selects ECDSA. The size is
  /// ignored for ECDSA; for RSA an empty size selects [DEFAULT_RSA_BITS].
  pub fn parse(key_type: &str, key_size: &str) -> Result<Self, KeyGenError> {
    let key_type = key_type.trim();
    if key_type.is_empty() || key_type.eq_ignore_ascii_case("ecdsa") {
      return Ok(KeyType::EcdsaP256);
    }
    if !key_type.eq_ignore_ascii_case("rsa") {
      return Err(KeyGenError::UnsupportedKeyType(key_type.to_string()));
    }
    let key_size = key_size.trim();
    let bits = if key_size.is_empty() {
      DEFAULT_RSA_BITS
    } else {
      key_size
        .parse::<usize>()
        .map_err(|_| KeyGenError::InvalidKeySize(key_size.to_string()))?
    };
    KeyType::rsa(bits)
  }

  pub fn rsa(bits: usize) -> Result<Self, KeyGenError> {
    if bits < MIN_RSA_BITS {
      return Err(KeyGenError::KeySizeTooSmall {
        bits,
        minimum: MIN_RSA_BITS,
      });
    }
    Ok(KeyType::Rsa { bits })
  }
}

impl fmt::Display for KeyType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyType::EcdsaP256 => f.write_str("ECDSA P-256"),
      KeyType::Rsa { bits } => write!(f, "RSA-{}", bits),
    }
  }
}

/// A private key that can identify a tunnel endpoint
#[derive(Clone)]
pub enum KeyMaterial {
  EcdsaP256(p256::SecretKey),
  Rsa(RsaPrivateKey),
}

impl fmt::Debug for KeyMaterial {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("KeyMaterial").field(&self.key_type()).finish()
  }
}

impl KeyMaterial {
  pub fn generate<R>(rng: &mut R, key_type: KeyType) -> Result<Self, KeyGenError>
  where
    R: CryptoRng + RngCore,
  {
    match key_type {
      KeyType::EcdsaP256 => Ok(KeyMaterial::EcdsaP256(p256::SecretKey::random(rng))),
      // Hand-built key types may have bypassed [KeyType::rsa]
      KeyType::Rsa { bits } => {
        KeyType::rsa(bits)?;
        Ok(KeyMaterial::Rsa(RsaPrivateKey::new(rng, bits)?))
      }
    }
  }

  pub fn key_type(&self) -> KeyType {
    match self {
      KeyMaterial::EcdsaP256(_) => KeyType::EcdsaP256,
      KeyMaterial::Rsa(key) => KeyType::Rsa {
        bits: key.size() * 8,
      },
    }
  }

  pub fn pem_label(&self) -> &'static str {
    match self {
      KeyMaterial::EcdsaP256(_) => EC_PEM_LABEL,
      KeyMaterial::Rsa(_) => RSA_PEM_LABEL,
    }
  }

  /// Encodes the key as SEC1 (`EC PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) PEM
  pub fn to_pem(&self) -> Result<Zeroizing<String>, KeyGenError> {
    let label = self.pem_label();
    match self {
      KeyMaterial::EcdsaP256(key) => key.to_sec1_pem(LineEnding::LF).map_err(|e| {
        KeyGenError::Encoding {
          label,
          reason: e.to_string(),
        }
      }),
      KeyMaterial::Rsa(key) => key.to_pkcs1_pem(LineEnding::LF).map_err(|e| {
        KeyGenError::Encoding {
          label,
          reason: e.to_string(),
        }
      }),
    }
  }

  /// Loads the first `EC PRIVATE KEY` or `RSA PRIVATE KEY` block in `pem`
  ///
  /// Any other PEM sections, such as certificates, are skipped.
  pub fn from_pem(pem: &[u8]) -> Result<Self, KeyLoadError> {
    let mut reader = pem;
    loop {
      match rustls_pemfile::read_one(&mut reader)? {
        Some(Item::ECKey(der)) => {
          let der = Zeroizing::new(der);
          return p256::SecretKey::from_sec1_der(&der)
            .map(KeyMaterial::EcdsaP256)
            .map_err(|e| KeyLoadError::Malformed {
              label: EC_PEM_LABEL,
              reason: e.to_string(),
            });
        }
        Some(Item::RSAKey(der)) => {
          let der = Zeroizing::new(der);
          return RsaPrivateKey::from_pkcs1_der(&der)
            .map(KeyMaterial::Rsa)
            .map_err(|e| KeyLoadError::Malformed {
              label: RSA_PEM_LABEL,
              reason: e.to_string(),
            });
        }
        Some(_) => continue,
        None => return Err(KeyLoadError::NoPrivateKey),
      }
    }
  }

  pub fn public_key(&self) -> PublicKey {
    match self {
      KeyMaterial::EcdsaP256(key) => PublicKey::EcdsaP256(key.public_key()),
      KeyMaterial::Rsa(key) => PublicKey::Rsa(key.to_public_key()),
    }
  }

  pub fn fingerprint(&self) -> Fingerprint {
    self.public_key().fingerprint()
  }
}

/// Generates a private key and returns it PEM-encoded
///
/// A non-empty `seed` makes the output a pure function of its arguments; an
/// empty one draws from OS randomness. `key_type` and `key_size` are
/// interpreted by [KeyType::parse] before any key material is produced.
pub fn generate_key(
  seed: &[u8],
  key_type: &str,
  key_size: &str,
) -> Result<Zeroizing<Vec<u8>>, KeyGenError> {
  let key_type = KeyType::parse(key_type, key_size)?;
  let mut rng = Randomness::from_seed(seed);
  tracing::debug!(
    %key_type,
    deterministic = rng.is_deterministic(),
    "Generating private key"
  );
  let key = KeyMaterial::generate(&mut rng, key_type)?;
  let pem = key.to_pem()?;
  Ok(Zeroizing::new(pem.as_bytes().to_vec()))
}
