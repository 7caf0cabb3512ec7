//! Deterministic bucketing hash shared by rollout and variant selection.
//!
//! Must produce the same `[0,1)` value as the other PostHog-style SDKs for a
//! given `(key, distinct_id, salt)` so that a user lands in the same bucket
//! regardless of which client evaluated the flag.

use sha1::{Digest, Sha1};

/// Must be exactly 15 F's to match the reference implementation across SDKs.
const LONG_SCALE: f64 = 0xFFFFFFFFFFFFFFFu64 as f64;

pub const ROLLOUT_SALT: &str = "";
pub const VARIANT_SALT: &str = "variant";

/// Hashes `key.distinct_id<salt>` with SHA-1 and maps the first 15 hex
/// characters onto `[0, 1)`.
pub fn bucket(key: &str, distinct_id: &str, salt: &str) -> f64 {
    let input = format!("{key}.{distinct_id}{salt}");
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    let prefix = &hex[..15];
    let value = u64::from_str_radix(prefix, 16).unwrap_or(0);
    value as f64 / LONG_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_is_deterministic() {
        let a = bucket("my-flag", "user-1", ROLLOUT_SALT);
        let b = bucket("my-flag", "user-1", ROLLOUT_SALT);
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
    }

    #[test]
    fn bucket_varies_by_salt() {
        let rollout = bucket("my-flag", "user-1", ROLLOUT_SALT);
        let variant = bucket("my-flag", "user-1", VARIANT_SALT);
        assert_ne!(rollout, variant);
    }

    #[test]
    fn rollout_distribution_is_approximately_uniform() {
        let hits = (0..10_000)
            .filter(|i| bucket("rollout-flag", &format!("user-{i}"), ROLLOUT_SALT) < 0.3)
            .count();
        let fraction = hits as f64 / 10_000.0;
        assert!((fraction - 0.3).abs() < 0.03, "fraction was {fraction}");
    }
}
