use fnv::FnvHasher;
use serde::Serialize;
use std::hash::Hasher;

use crate::error::AppResult;

/// Lowercase RFC 4648 alphabet, matching the style of generated object names.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Serialize a value with a stable key order. `serde_json::Value` objects are
/// backed by an ordered map, so routing through `Value` normalizes whatever
/// iteration order the input had.
fn canonical_json<T: Serialize>(value: &T) -> AppResult<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// FNV-1a over the canonical serialization of `value`.
pub fn deep_hash<T: Serialize>(value: &T) -> AppResult<u64> {
    let canonical = canonical_json(value)?;
    let mut hasher = FnvHasher::default();
    hasher.write(canonical.as_bytes());
    Ok(hasher.finish())
}

/// Six base32 characters of the template hash. Deterministic: byte-identical
/// templates always map to the same suffix.
pub fn template_hash6<T: Serialize>(template: &T) -> AppResult<String> {
    let hash = deep_hash(template)?;
    let mut out = String::with_capacity(6);
    for i in 0..6 {
        let idx = ((hash >> (5 * i)) & 31) as usize;
        out.push(BASE32_ALPHABET[idx] as char);
    }
    Ok(out)
}

/// `"{bundleDeploymentName}-{templateHash6}"`.
pub fn bundle_name(bundle_deployment_name: &str, hash6: &str) -> String {
    format!("{}-{}", bundle_deployment_name, hash6)
}

/// Kubernetes object names cap at 63 characters.
const MAX_OBJECT_NAME_LEN: usize = 63;

/// Append `-{hash}` to `base`, truncating `base` so the result stays a legal
/// object name. The hash is the hex form of [`deep_hash`] over `value`, so
/// identical inputs generate identical names across runs.
pub fn generate_name<T: Serialize>(base: &str, value: &T) -> AppResult<String> {
    let hash = format!("{:x}", deep_hash(value)?);
    let max_base = MAX_OBJECT_NAME_LEN - 1 - hash.len();
    let base = if base.len() > max_base {
        &base[..max_base]
    } else {
        base
    };
    Ok(format!("{}-{}", base, hash))
}
