//! Random hashes and nodepool name suffixes.
//!
//! Cluster hashes and nodepool suffixes are short lowercase alphanumeric
//! strings so the names they end up in stay valid as cloud resource and
//! Kubernetes object names.

use rand::Rng;

/// Length of a cluster hash and of a nodepool reference suffix.
pub const HASH_LENGTH: usize = 7;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random lowercase alphanumeric string of `len` characters.
pub fn create_hash(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Append a suffix to a nodepool template name.
pub fn with_suffix(template: &str, suffix: &str) -> String {
    format!("{template}-{suffix}")
}

/// Split `{template}-{suffix}` into its parts, if the name carries a
/// well-formed suffix.
pub fn split_suffix(name: &str) -> Option<(&str, &str)> {
    let (template, suffix) = name.rsplit_once('-')?;
    let well_formed = !template.is_empty()
        && suffix.len() == HASH_LENGTH
        && suffix.bytes().all(|b| ALPHABET.contains(&b));
    well_formed.then_some((template, suffix))
}
