//! Proof-of-work admission challenges.
//!
//! A challenge is a random 128-bit value bound to `(sale, user)` and a short
//! validity window. The caller must find a nonce such that
//! `SHA-256(challenge || nonce_be_u64)` has at least `D` leading zero bits.
//! Challenges are single-use: a successful redemption removes them.

use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::SaleId;
use crate::core::time::Timestamp;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const CHALLENGE_LEN: usize = 16;

/// Highest meaningful difficulty (every digest bit zero).
pub const MAX_DIFFICULTY: u32 = 256;

pub type ChallengeBytes = [u8; CHALLENGE_LEN];

/// Leading zero bits of `bytes`.
pub fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in bytes {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

pub fn digest(challenge: &ChallengeBytes, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

/// Check a solution against `difficulty` bits.
pub fn verify(challenge: &ChallengeBytes, nonce: u64, difficulty: u32) -> bool {
    if difficulty == 0 {
        return true;
    }
    if difficulty > MAX_DIFFICULTY {
        return false;
    }
    leading_zero_bits(&digest(challenge, nonce)) >= difficulty
}

/// Brute-force a nonce (client side; tests and load tools).
pub fn solve(challenge: &ChallengeBytes, difficulty: u32) -> Option<u64> {
    if difficulty > MAX_DIFFICULTY {
        return None;
    }
    (0..u64::MAX).find(|nonce| verify(challenge, *nonce, difficulty))
}

/// Difficulty for the current admission queue depth.
///
/// `base + bit_length(depth / load_step)`, capped at `max`: every doubling of
/// load beyond one step costs callers one more bit.
pub fn adaptive_difficulty(base: u32, max: u32, load_step: u64, queue_depth: u64) -> u32 {
    let steps = queue_depth / load_step.max(1);
    let extra = u64::BITS - steps.leading_zeros();
    base.saturating_add(extra).min(max)
}

pub fn encode_challenge(value: &ChallengeBytes) -> String {
    hex::encode(value)
}

pub fn decode_challenge(text: &str) -> CoreResult<ChallengeBytes> {
    let bytes = hex::decode(text)
        .map_err(|_| CoreError::invalid_input("challenge must be hex"))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::invalid_input("challenge must be 16 bytes"))
}

/// What a caller receives from `get_challenge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeIssue {
    /// Hex-encoded 128-bit value.
    pub challenge: String,
    pub difficulty: u32,
    pub expires_at: Timestamp,
}

#[derive(Debug, Clone)]
struct IssuedChallenge {
    sale_id: SaleId,
    user_id: String,
    difficulty: u32,
    expires_at: Timestamp,
}

/// Outstanding challenges.
#[derive(Default)]
pub struct ChallengeBook {
    issued: Mutex<HashMap<ChallengeBytes, IssuedChallenge>>,
}

impl ChallengeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(
        &self,
        sale_id: SaleId,
        user_id: &str,
        difficulty: u32,
        now: Timestamp,
        ttl_ms: u64,
    ) -> ChallengeIssue {
        let mut value = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut value);
        let expires_at = now.add_ms(ttl_ms);
        self.issued.lock().insert(
            value,
            IssuedChallenge {
                sale_id,
                user_id: user_id.to_string(),
                difficulty,
                expires_at,
            },
        );
        ChallengeIssue {
            challenge: encode_challenge(&value),
            difficulty,
            expires_at,
        }
    }

    /// Verify and consume a challenge.
    ///
    /// Unknown, expired, already-redeemed or foreign challenges are stale. A
    /// wrong nonce is `bad_pow` and leaves the challenge redeemable.
    pub fn redeem(
        &self,
        value: &ChallengeBytes,
        sale_id: SaleId,
        user_id: &str,
        nonce: u64,
        now: Timestamp,
    ) -> CoreResult<u32> {
        let mut issued = self.issued.lock();
        let entry = issued.get(value).ok_or(CoreError::StaleChallenge)?;
        if entry.sale_id != sale_id || entry.user_id != user_id {
            return Err(CoreError::StaleChallenge);
        }
        if now.is_at_or_after(entry.expires_at) {
            issued.remove(value);
            return Err(CoreError::StaleChallenge);
        }
        let difficulty = entry.difficulty;
        if !verify(value, nonce, difficulty) {
            return Err(CoreError::BadPow);
        }
        issued.remove(value);
        Ok(difficulty)
    }

    /// Forget expired challenges; returns how many remain.
    pub fn prune(&self, now: Timestamp) -> usize {
        let mut issued = self.issued.lock();
        issued.retain(|_, c| now.is_before(c.expires_at));
        issued.len()
    }

    pub fn len(&self) -> usize {
        self.issued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0xff]), 16);
        assert_eq!(leading_zero_bits(&[0x00, 0x1f]), 11);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn difficulty_bounds() {
        let challenge = [7u8; CHALLENGE_LEN];
        for nonce in [0, 1, u64::MAX] {
            assert!(verify(&challenge, nonce, 0));
        }
        for nonce in 0..10_000 {
            assert!(!verify(&challenge, nonce, MAX_DIFFICULTY));
        }
        assert!(!verify(&challenge, 0, MAX_DIFFICULTY + 1));
    }

    #[test]
    fn adaptive_difficulty_grows_per_doubling() {
        assert_eq!(adaptive_difficulty(8, 24, 1000, 0), 8);
        assert_eq!(adaptive_difficulty(8, 24, 1000, 999), 8);
        assert_eq!(adaptive_difficulty(8, 24, 1000, 1000), 9);
        assert_eq!(adaptive_difficulty(8, 24, 1000, 3999), 10);
        assert_eq!(adaptive_difficulty(8, 24, 1000, 4000), 11);
        assert_eq!(adaptive_difficulty(8, 10, 1000, 1 << 30), 10);
    }

    #[test]
    fn redeem_is_single_use_and_bound() {
        let book = ChallengeBook::new();
        let sale = SaleId::generate();
        let issue = book.issue(sale, "u", 4, Timestamp::new(0), 1_000);
        let value = decode_challenge(&issue.challenge).unwrap();
        let nonce = solve(&value, 4).unwrap();

        assert_eq!(
            book.redeem(&value, SaleId::generate(), "u", nonce, Timestamp::new(1)),
            Err(CoreError::StaleChallenge)
        );
        assert_eq!(
            book.redeem(&value, sale, "v", nonce, Timestamp::new(1)),
            Err(CoreError::StaleChallenge)
        );
        assert_eq!(
            book.redeem(&value, sale, "u", nonce, Timestamp::new(1)),
            Ok(4)
        );
        assert_eq!(
            book.redeem(&value, sale, "u", nonce, Timestamp::new(2)),
            Err(CoreError::StaleChallenge)
        );
    }

    #[test]
    fn expired_challenge_is_stale() {
        let book = ChallengeBook::new();
        let sale = SaleId::generate();
        let issue = book.issue(sale, "u", 0, Timestamp::new(0), 10);
        let value = decode_challenge(&issue.challenge).unwrap();
        assert_eq!(
            book.redeem(&value, sale, "u", 0, Timestamp::new(10)),
            Err(CoreError::StaleChallenge)
        );
        assert!(book.is_empty());
    }
}
