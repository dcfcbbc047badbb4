//! Byte level input mutation.
//!
//! The strategy of an iteration is picked by rotation, and the randomness inside a
//! strategy is seeded from the seed content and the iteration index, so
//! `mutate(seed, i)` always yields the same candidate.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::{
    cmp::min,
    fmt,
    hash::{Hash, Hasher},
    ops::Range,
};

/// Protocol aware mutation of HTTP requests.
pub mod http;

pub type RngType = SmallRng;

/// Candidates never grow beyond this.
pub const MAX_INPUT_LEN: usize = 64 << 10;

/// Injection and structure breaking tokens used by special character substitution.
pub const SPECIAL_TOKENS: [&str; 16] = [
    ";rm -rf",
    "'",
    "\"",
    "`",
    "$(id)",
    "|",
    "&&",
    "\\",
    "%s%n",
    "\0",
    "\n",
    "../",
    "{{",
    "}}",
    "<>",
    "\u{ffff}",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    BitFlip,
    InsertChar,
    DeleteChar,
    SpecialChar,
    DuplicateSubstring,
}

impl Strategy {
    pub const ROTATION: [Strategy; 5] = [
        Strategy::BitFlip,
        Strategy::InsertChar,
        Strategy::DeleteChar,
        Strategy::SpecialChar,
        Strategy::DuplicateSubstring,
    ];

    pub fn for_iteration(iteration: u64) -> Self {
        Self::ROTATION[(iteration % Self::ROTATION.len() as u64) as usize]
    }

    fn operation(self) -> MutateOperation {
        match self {
            Strategy::BitFlip => bit_flip,
            Strategy::InsertChar => insert_char,
            Strategy::DeleteChar => delete_char,
            Strategy::SpecialChar => special_char,
            Strategy::DuplicateSubstring => duplicate_substring,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::BitFlip => "bit_flip",
            Strategy::InsertChar => "insert_char",
            Strategy::DeleteChar => "delete_char",
            Strategy::SpecialChar => "special_char",
            Strategy::DuplicateSubstring => "duplicate_substring",
        };
        f.write_str(name)
    }
}

/// A mutating operation tries to mutate the buffer, returns `true` if it succeeded.
type MutateOperation = fn(&mut RngType, &mut Vec<u8>, u64) -> bool;

/// Derives one candidate from `seed` for `iteration`.
pub fn mutate(seed: &[u8], iteration: u64) -> Vec<u8> {
    mutate_with_strategy(seed, iteration).1
}

/// Like [`mutate`], also reporting the strategy that produced the candidate.
pub fn mutate_with_strategy(seed: &[u8], iteration: u64) -> (Strategy, Vec<u8>) {
    let strategy = Strategy::for_iteration(iteration);
    let mut rng = rng_for(seed, iteration);
    let mut buf = seed.to_vec();
    // Operations needing existing bytes fall back to insertion on empty input.
    if !(strategy.operation())(&mut rng, &mut buf, iteration) {
        insert_char(&mut rng, &mut buf, iteration);
    }
    buf.truncate(MAX_INPUT_LEN);
    (strategy, buf)
}

fn rng_for(seed: &[u8], iteration: u64) -> RngType {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    iteration.hash(&mut hasher);
    RngType::seed_from_u64(hasher.finish())
}

/// Choose a range of at most `max` bytes, the buffer must not be empty.
#[inline]
fn rand_op_range(rng: &mut RngType, len: usize, max: usize) -> Range<usize> {
    debug_assert!(len != 0);
    let op_len = rng.gen_range(1..=min(len, max));
    let start = rng.gen_range(0..=(len - op_len));
    start..(start + op_len)
}

/// Flips one bit.
fn bit_flip(rng: &mut RngType, buf: &mut Vec<u8>, _i: u64) -> bool {
    if buf.is_empty() {
        return false;
    }
    let idx = rng.gen_range(0..buf.len());
    buf[idx] ^= 1u8 << rng.gen_range(0..8u32);
    true
}

/// Inserts one character, mostly printable.
fn insert_char(rng: &mut RngType, buf: &mut Vec<u8>, _i: u64) -> bool {
    let c = if rng.gen_ratio(7, 8) {
        rng.gen_range(0x20..0x7f)
    } else {
        rng.gen()
    };
    let idx = rng.gen_range(0..=buf.len());
    buf.insert(idx, c);
    true
}

/// Erases a small block.
fn delete_char(rng: &mut RngType, buf: &mut Vec<u8>, _i: u64) -> bool {
    if buf.is_empty() {
        return false;
    }
    let r = rand_op_range(rng, buf.len(), 4);
    buf.drain(r);
    true
}

/// Replaces one byte with a special token, tokens are cycled by iteration.
fn special_char(rng: &mut RngType, buf: &mut Vec<u8>, i: u64) -> bool {
    let round = i / Strategy::ROTATION.len() as u64;
    let token = SPECIAL_TOKENS[(round % SPECIAL_TOKENS.len() as u64) as usize].as_bytes();
    if buf.is_empty() {
        buf.extend_from_slice(token);
    } else {
        let idx = rng.gen_range(0..buf.len());
        buf.splice(idx..idx + 1, token.iter().copied());
    }
    true
}

/// Copies a substring to a random position.
fn duplicate_substring(rng: &mut RngType, buf: &mut Vec<u8>, _i: u64) -> bool {
    if buf.is_empty() {
        return false;
    }
    let r = rand_op_range(rng, buf.len(), 16);
    let chunk = buf[r].to_vec();
    let idx = rng.gen_range(0..=buf.len());
    buf.splice(idx..idx, chunk);
    true
}
