// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::traits::PublicKeyParts;

const ECDSA_P256_ALGORITHM: &str = "ecdsa-sha2-nistp256";
const ECDSA_P256_CURVE: &str = "nistp256";
const RSA_ALGORITHM: &str = "ssh-rsa";

/// The public half of a tunnel endpoint's identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
  EcdsaP256(p256::PublicKey),
  Rsa(rsa::RsaPublicKey),
}

impl PublicKey {
  /// SSH algorithm name of this key
  pub fn algorithm(&self) -> &'static str {
    match self {
      PublicKey::EcdsaP256(_) => ECDSA_P256_ALGORITHM,
      PublicKey::Rsa(_) => RSA_ALGORITHM,
    }
  }

  /// The SSH wire encoding of this key (RFC 4253 section 6.6, RFC 5656 section 3.1)
  pub fn to_ssh_wire(&self) -> Bytes {
    let mut wire = BytesMut::new();
    put_string(&mut wire, self.algorithm().as_bytes());
    match self {
      PublicKey::EcdsaP256(key) => {
        put_string(&mut wire, ECDSA_P256_CURVE.as_bytes());
        put_string(&mut wire, key.to_encoded_point(false).as_bytes());
      }
      PublicKey::Rsa(key) => {
        put_mpint(&mut wire, &key.e().to_bytes_be());
        put_mpint(&mut wire, &key.n().to_bytes_be());
      }
    }
    wire.freeze()
  }

  pub fn fingerprint(&self) -> Fingerprint {
    fingerprint(self)
  }
}

fn put_string(wire: &mut BytesMut, data: &[u8]) {
  wire.put_u32(data.len() as u32);
  wire.put_slice(data);
}

/// Writes an unsigned big-endian magnitude as a minimal two's complement mpint
fn put_mpint(wire: &mut BytesMut, magnitude: &[u8]) {
  let first_significant = magnitude
    .iter()
    .position(|byte| *byte != 0)
    .unwrap_or(magnitude.len());
  let magnitude = &magnitude[first_significant..];
  match magnitude.first() {
    None => wire.put_u32(0),
    Some(high) if high & 0x80 != 0 => {
      wire.put_u32(magnitude.len() as u32 + 1);
      wire.put_u8(0);
      wire.put_slice(magnitude);
    }
    Some(_) => put_string(wire, magnitude),
  }
}

/// MD5 digest of an SSH public key, as colon-separated lower-case hex pairs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Whether this fingerprint satisfies an operator-supplied expectation
  ///
  /// An empty expectation accepts any key; otherwise the expectation may be
  /// the whole fingerprint or any leading part of it.
  pub fn matches(&self, expected: &str) -> bool {
    expected.is_empty() || self.0.starts_with(expected)
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for Fingerprint {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

pub fn fingerprint(key: &PublicKey) -> Fingerprint {
  fingerprint_wire(&key.to_ssh_wire())
}

/// Fingerprints an already-encoded SSH public key blob
pub fn fingerprint_wire(wire: &[u8]) -> Fingerprint {
  let digest = Md5::digest(wire);
  let pairs = digest
    .iter()
    .map(|byte| format!("{:02x}", byte))
    .collect::<Vec<_>>();
  Fingerprint(pairs.join(":"))
}
