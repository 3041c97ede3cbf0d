/// CRC-32 (IEEE) of the key's UTF-8 bytes. Fixed bit-for-bit, so every node
/// and every build routes a key to the same shard.
pub fn stable_hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Shard owning `key` in an index of `shard_count` shards.
pub fn shard_for(key: &str, shard_count: u32) -> u32 {
    stable_hash(key) % shard_count.max(1)
}
