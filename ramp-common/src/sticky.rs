//! Sticky variant assignment hashing.
//!
//! A user's bucket is a pure function of the feature's assignment seed and
//! the user id, so assignments are stable as the rollout percentage grows: a
//! user admitted at 10% stays admitted at 25%. Rotating the seed (re-arm)
//! reshuffles everyone.

/// Map `(seed, user_id)` to a bucket in `[0, 100)`.
///
/// Uses blake3 over the little-endian seed followed by the user id bytes and
/// folds the first eight output bytes into the bucket. Deterministic across
/// processes and platforms.
pub fn assignment_bucket(seed: u64, user_id: &str) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest.as_bytes()[..8]);
    bucket_from_hash(u64::from_le_bytes(raw))
}

/// Scale a hash value into [0, 100).
///
/// Only the top 53 bits are used: an f64 represents every 53-bit integer
/// exactly, so the division never rounds up and the bucket stays strictly
/// below 100 even for `u64::MAX`.
fn bucket_from_hash(value: u64) -> f64 {
    ((value >> 11) as f64 / (1u64 << 53) as f64) * 100.0
}

/// Fresh random assignment seed for a newly registered or re-armed feature.
pub fn fresh_seed() -> u64 {
    rand::random()
}
