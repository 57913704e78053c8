// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;

use rand::{rngs::OsRng, CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

/// Hash rounds applied to a seed before any output is produced
pub const SEED_STRENGTHENING_ROUNDS: usize = 2048;

const BLOCK_LEN: usize = 32;

/// A reproducible byte stream keyed on a seed
///
/// Each SHA-512 of the chaining value yields the next chaining value (first
/// half) and one block of output (second half). Identical seeds always yield
/// identical streams, no matter how reads are chunked.
///
/// The stream starts with the final strengthening block and keeps partial blocks
/// for the next read, so keys differ from generators that rehash on every read.
pub struct DeterministicRng {
  chain: [u8; BLOCK_LEN],
  block: [u8; BLOCK_LEN],
  consumed: usize,
}

impl DeterministicRng {
  pub fn new(seed: &[u8]) -> Self {
    let (mut chain, mut block) = advance(seed);
    for _ in 1..SEED_STRENGTHENING_ROUNDS {
      let (next_chain, next_block) = advance(&chain);
      chain = next_chain;
      block = next_block;
    }
    Self {
      chain,
      block,
      consumed: 0,
    }
  }
}

fn advance(input: &[u8]) -> ([u8; BLOCK_LEN], [u8; BLOCK_LEN]) {
  let digest = Sha512::digest(input);
  let mut chain = [0u8; BLOCK_LEN];
  let mut block = [0u8; BLOCK_LEN];
  chain.copy_from_slice(&digest[..BLOCK_LEN]);
  block.copy_from_slice(&digest[BLOCK_LEN..]);
  (chain, block)
}

impl RngCore for DeterministicRng {
  fn next_u32(&mut self) -> u32 {
    let mut bytes = [0u8; 4];
    self.fill_bytes(&mut bytes);
    u32::from_le_bytes(bytes)
  }

  fn next_u64(&mut self) -> u64 {
    let mut bytes = [0u8; 8];
    self.fill_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
  }

  fn fill_bytes(&mut self, dest: &mut [u8]) {
    let mut filled = 0;
    while filled < dest.len() {
      if self.consumed == BLOCK_LEN {
        let (chain, block) = advance(&self.chain);
        self.chain = chain;
        self.block = block;
        self.consumed = 0;
      }
      let take = (BLOCK_LEN - self.consumed).min(dest.len() - filled);
      dest[filled..filled + take].copy_from_slice(&self.block[self.consumed..self.consumed + take]);
      self.consumed += take;
      filled += take;
    }
  }

  fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
    self.fill_bytes(dest);
    Ok(())
  }
}

// Output is unpredictable to anyone without the seed, which callers treat as a secret
impl CryptoRng for DeterministicRng {}

impl Drop for DeterministicRng {
  fn drop(&mut self) {
    self.chain.zeroize();
    self.block.zeroize();
  }
}

impl fmt::Debug for DeterministicRng {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DeterministicRng").finish_non_exhaustive()
  }
}

/// The randomness provider for one key generation, chosen per call
#[derive(Debug)]
pub enum Randomness {
  Os(OsRng),
  Seeded(DeterministicRng),
}

impl Randomness {
  /// An empty seed selects the operating system's CSPRNG
  pub fn from_seed(seed: &[u8]) -> Self {
    if seed.is_empty() {
      Randomness::Os(OsRng)
    } else {
      Randomness::Seeded(DeterministicRng::new(seed))
    }
  }

  pub fn is_deterministic(&self) -> bool {
    matches!(self, Randomness::Seeded(_))
  }
}

impl RngCore for Randomness {
  fn next_u32(&mut self) -> u32 {
    match self {
      Randomness::Os(rng) => rng.next_u32(),
      Randomness::Seeded(rng) => rng.next_u32(),
    }
  }

  fn next_u64(&mut self) -> u64 {
    match self {
      Randomness::Os(rng) => rng.next_u64(),
      Randomness::Seeded(rng) => rng.next_u64(),
    }
  }

  fn fill_bytes(&mut self, dest: &mut [u8]) {
    match self {
      Randomness::Os(rng) => rng.fill_bytes(dest),
      Randomness::Seeded(rng) => rng.fill_bytes(dest),
    }
  }

  fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
    match self {
      Randomness::Os(rng) => rng.try_fill_bytes(dest),
      Randomness::Seeded(rng) => rng.try_fill_bytes(dest),
    }
  }
}

impl CryptoRng for Randomness {}
