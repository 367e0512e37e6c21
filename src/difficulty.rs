//! Relay Mining Difficulty
//!
//! Pure functions over difficulty target hashes. A target hash is an
//! unsigned big-endian integer: a relay is volume applicable only when its
//! hash is strictly smaller than the target, so a smaller target is harder.
//!
//! All scaling uses exact integer / rational arithmetic so every node derives
//! the same bytes from the same inputs.

use num_bigint::BigUint;
use num_integer::Integer;
use thiserror::Error;

/// Width of a relay hash (sha256).
pub const RELAY_HASH_SIZE: usize = 32;

/// Easiest possible target: every relay is volume applicable.
pub const BASE_RELAY_DIFFICULTY_HASH: [u8; RELAY_HASH_SIZE] = [0xff; RELAY_HASH_SIZE];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DifficultyError {
    #[error("hash is all zeroes, difficulty is undefined")]
    ZeroHash,

    #[error("ratio denominator is zero")]
    ZeroDenominator,
}

// ============================================================
// RATIO
// ============================================================

/// Exact non-negative rational, always stored in lowest terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ratio {
    numer: BigUint,
    denom: BigUint,
}

impl Ratio {
    /// Build `numer / denom` reduced by their gcd.
    pub fn new(numer: BigUint, denom: BigUint) -> Result<Self, DifficultyError> {
        if denom == BigUint::ZERO {
            return Err(DifficultyError::ZeroDenominator);
        }
        // denom != 0, so the gcd is never zero
        let g = numer.gcd(&denom);
        Ok(Self {
            numer: numer / &g,
            denom: denom / &g,
        })
    }

    pub fn numer(&self) -> &BigUint {
        &self.numer
    }

    pub fn denom(&self) -> &BigUint {
        &self.denom
    }

    pub fn inverse(&self) -> Result<Self, DifficultyError> {
        Self::new(self.denom.clone(), self.numer.clone())
    }

    /// `floor(n * self)`, used to extrapolate relay counts.
    pub fn scale(&self, n: u64) -> BigUint {
        (BigUint::from(n) * &self.numer) / &self.denom
    }

    /// Compare against `num / den` without converting to floating point.
    pub fn ge(&self, num: u64, den: u64) -> bool {
        &self.numer * BigUint::from(den) >= BigUint::from(num) * &self.denom
    }
}

// ============================================================
// DIFFICULTY FUNCTIONS
// ============================================================

/// Ratio of the easiest target to `hash`. The baseline hash has difficulty 1.
pub fn difficulty_from_hash(hash: &[u8]) -> Result<BigUint, DifficultyError> {
    let hash_int = BigUint::from_bytes_be(hash);
    if hash_int == BigUint::ZERO {
        return Err(DifficultyError::ZeroHash);
    }
    Ok(BigUint::from_bytes_be(&BASE_RELAY_DIFFICULTY_HASH) / hash_int)
}

/// True iff `relay_hash < target_hash`, comparing big-endian bytes.
#[inline]
pub fn is_volume_applicable(relay_hash: &[u8], target_hash: &[u8]) -> bool {
    relay_hash < target_hash
}

/// Retune the target from the previous target and the relay volume EMA.
///
/// Returns the baseline when the network wants at least as many relays as it
/// currently sees. Otherwise scales `prev_target` by `target_relays / ema_relays`
/// and keeps the input width.
pub fn compute_new_difficulty_target(
    prev_target: &[u8],
    target_relays: u64,
    ema_relays: u64,
) -> Vec<u8> {
    if target_relays >= ema_relays {
        return BASE_RELAY_DIFFICULTY_HASH.to_vec();
    }

    let prev = BigUint::from_bytes_be(prev_target);
    let scaled = (prev * BigUint::from(target_relays)) / BigUint::from(ema_relays);

    // BigUint encodes zero as [0]; treat it as an empty magnitude
    let scaled_bytes = if scaled == BigUint::ZERO {
        Vec::new()
    } else {
        scaled.to_bytes_be()
    };

    if scaled_bytes.len() > prev_target.len() {
        return BASE_RELAY_DIFFICULTY_HASH.to_vec();
    }

    let mut padded = vec![0u8; prev_target.len()];
    padded[prev_target.len() - scaled_bytes.len()..].copy_from_slice(&scaled_bytes);
    padded
}

/// Number of leading zero bits in `hash`.
pub fn count_leading_zero_bits(hash: &[u8]) -> Result<u32, DifficultyError> {
    let mut bits = 0u32;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
            continue;
        }
        return Ok(bits + byte.leading_zeros());
    }
    Err(DifficultyError::ZeroHash)
}

/// Fraction of relays expected to qualify under `target_hash`.
pub fn relay_difficulty_probability(target_hash: &[u8]) -> Result<Ratio, DifficultyError> {
    Ratio::new(
        BigUint::from_bytes_be(target_hash),
        BigUint::from_bytes_be(&BASE_RELAY_DIFFICULTY_HASH),
    )
}

/// Inverse of [`relay_difficulty_probability`]: serviced relays per mined relay.
pub fn relay_difficulty_multiplier(target_hash: &[u8]) -> Result<Ratio, DifficultyError> {
    let probability = relay_difficulty_probability(target_hash)?;
    if probability.numer == BigUint::ZERO {
        return Err(DifficultyError::ZeroHash);
    }
    probability.inverse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_with_prefix(prefix: &[u8]) -> [u8; 32] {
        let mut h = [0xffu8; 32];
        h[..prefix.len()].copy_from_slice(prefix);
        h
    }

    #[test]
    fn test_baseline_when_target_meets_ema() {
        let prev = hash_with_prefix(&[0x00, 0x0f]);
        assert_eq!(
            compute_new_difficulty_target(&prev, 100, 100),
            BASE_RELAY_DIFFICULTY_HASH.to_vec()
        );
        assert_eq!(
            compute_new_difficulty_target(&prev, 1000, 10),
            BASE_RELAY_DIFFICULTY_HASH.to_vec()
        );
    }

    #[test]
    fn test_scaling_keeps_width_and_tightens() {
        let prev = BASE_RELAY_DIFFICULTY_HASH;
        let half = compute_new_difficulty_target(&prev, 50, 100);
        assert_eq!(half.len(), 32);
        assert_eq!(half[0], 0x7f);
        assert!(half.as_slice() < prev.as_slice());

        let mut last = prev.to_vec();
        for ema in [200u64, 400, 1_000, 10_000, 1_000_000] {
            let next = compute_new_difficulty_target(&prev, 100, ema);
            assert_eq!(next.len(), prev.len());
            assert!(next <= last, "larger ema must never loosen the target");
            last = next;
        }
    }

    #[test]
    fn test_scaling_pads_short_results() {
        let mut prev = [0u8; 32];
        prev[31] = 0x10;
        let next = compute_new_difficulty_target(&prev, 1, 1_000);
        assert_eq!(next, vec![0u8; 32]);
    }

    #[test]
    fn test_volume_applicable_is_strict() {
        let small = hash_with_prefix(&[0x00]);
        let large = hash_with_prefix(&[0x7f]);
        assert!(!is_volume_applicable(&large, &large));
        assert!(is_volume_applicable(&small, &large));
        assert!(!is_volume_applicable(&large, &small));
    }

    #[test]
    fn test_zero_denominator_is_its_own_error() {
        assert!(matches!(
            Ratio::new(BigUint::from(3u32), BigUint::ZERO),
            Err(DifficultyError::ZeroDenominator)
        ));
        let zero = Ratio::new(BigUint::ZERO, BigUint::from(5u32)).unwrap();
        assert!(matches!(zero.inverse(), Err(DifficultyError::ZeroDenominator)));
        // an all-zero target is reported as a degenerate hash, not a bad ratio
        assert_eq!(
            relay_difficulty_multiplier(&[0u8; 32]).map(|_| ()),
            Err(DifficultyError::ZeroHash)
        );
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(count_leading_zero_bits(&hash_with_prefix(&[0x7f])), Ok(1));
        assert_eq!(
            count_leading_zero_bits(&hash_with_prefix(&[0x00, 0xff])),
            Ok(8)
        );
        assert_eq!(count_leading_zero_bits(&BASE_RELAY_DIFFICULTY_HASH), Ok(0));
        assert_eq!(
            count_leading_zero_bits(&[0u8; 32]),
            Err(DifficultyError::ZeroHash)
        );
    }

    #[test]
    fn test_difficulty_from_hash() {
        assert_eq!(
            difficulty_from_hash(&BASE_RELAY_DIFFICULTY_HASH).unwrap(),
            BigUint::from(1u8)
        );
        // 0x0fff.. is 16x harder than the baseline
        let hard = hash_with_prefix(&[0x0f]);
        assert_eq!(difficulty_from_hash(&hard).unwrap(), BigUint::from(16u8));
        assert!(difficulty_from_hash(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_probability_and_multiplier() {
        let baseline = relay_difficulty_probability(&BASE_RELAY_DIFFICULTY_HASH).unwrap();
        assert_eq!(baseline.numer(), &BigUint::from(1u8));
        assert_eq!(baseline.denom(), &BigUint::from(1u8));

        let half = compute_new_difficulty_target(&BASE_RELAY_DIFFICULTY_HASH, 1, 2);
        let multiplier = relay_difficulty_multiplier(&half).unwrap();
        // floor-scaled target is just under half, so the multiplier is just over 2
        assert_eq!(multiplier.scale(1_000), BigUint::from(2_000u32));
        assert!(multiplier.ge(2, 1));
    }
}
