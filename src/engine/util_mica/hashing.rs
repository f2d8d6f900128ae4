use metrohash::MetroHash64;
use std::hash::Hasher;

// fixed seed so hashes are stable across runs and processes
const HASH_SEED: u64 = 0x3c1a_90d5_17f2_664b;

#[must_use]
pub fn hash_bytes64(bytes: &[u8]) -> u64
{
    let mut hasher = MetroHash64::with_seed(HASH_SEED);
    hasher.write(bytes);
    hasher.finish()
}

#[inline] #[must_use]
pub fn hash_str64(string: &str) -> u64
{
    hash_bytes64(string.as_bytes())
}
