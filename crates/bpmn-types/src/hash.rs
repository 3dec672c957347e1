use sha2::{Digest, Sha256};

/// Derive a stable content hash over a sequence of byte fields.
///
/// Each field is length-prefixed (little-endian `u32`) before hashing, the
/// same technique `invariant_types::promise_id::PromiseId::promise_root`
/// uses to derive execution roots — it prevents field-concatenation
/// collisions (`["ab", "c"]` vs `["a", "bc"]` hashing to the same digest).
///
/// Used to derive `ProcessDefinition::content_hash` (§3.1): reparsing the
/// same process id with byte-identical element/flow content must produce
/// the same hash, so the gateway can detect "nothing changed" and reuse
/// the existing version instead of minting a new one.
pub fn content_hash(fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u32).to_le_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

pub fn content_hash_hex(fields: &[&[u8]]) -> String {
    hex::encode(content_hash(fields))
}
