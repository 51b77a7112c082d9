use sha2::{Digest, Sha256};

/// Length of the hex prefix kept from the SHA-256 digest.
pub const CONFIG_HASH_LEN: usize = 8;

/// Derive the cache key for an ability/policy configuration.
///
/// All identifiers (abilities plus every policy of every ability) are pooled,
/// sorted, concatenated without a separator and hashed with SHA-256. The key is
/// the first eight lowercase hex characters, so it depends only on the multiset
/// of identifiers and not on their order or nesting.
pub fn compute_config_hash(ability_ids: &[String], policy_ids: &[Vec<String>]) -> String {
    let mut all: Vec<&str> = ability_ids
        .iter()
        .chain(policy_ids.iter().flatten())
        .map(String::as_str)
        .collect();
    all.sort_unstable();

    let digest = Sha256::digest(all.concat().as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(CONFIG_HASH_LEN);
    hex
}
