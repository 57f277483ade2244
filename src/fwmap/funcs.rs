// Copyright (c) 2025 Dataplane Core Contributors
//
// Hash / equality / copy / merge strategies
//
// Maps shared across processes cannot hold function pointers, so the
// per-map configuration stores only small numeric ids and every process
// resolves them against the same constant table. Dispatch is a match on
// the tag, not an indirect call.

use crate::error::{CoreError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Keyed-hash strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HashKind {
    /// FNV-1a over the key bytes, unrolled in 4-byte groups. The
    /// default for variable-layout keys.
    Fnv1a = 0,
    /// SplitMix64 finalizer over the first 8 key bytes (zero padded).
    /// Cheaper for fixed 8-byte keys.
    Mix64 = 1,
}

/// Key equality strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyEqKind {
    /// Byte-wise comparison over the configured key size.
    Bytes = 0,
}

/// Key/value copy strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CopyKind {
    /// Byte-wise copy over the configured size.
    Bytes = 0,
}

/// Value merge strategies, applied when a fresh insert into a head
/// layer finds a live value for the same key in an older layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MergeKind {
    /// Keep the new value unchanged.
    Replace = 0,
    /// Treat the first 8 bytes as a little-endian u64 counter and add
    /// the old value into the new one. Requires value_size >= 8.
    AddU64 = 1,
    /// Bitwise OR the old value into the new one. Preserves
    /// connection-progress flags across layer transitions.
    BitOr = 2,
}

impl HashKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Fnv1a),
            1 => Some(Self::Mix64),
            _ => None,
        }
    }
}

impl KeyEqKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Bytes),
            _ => None,
        }
    }
}

impl CopyKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Bytes),
            _ => None,
        }
    }
}

impl MergeKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Replace),
            1 => Some(Self::AddU64),
            2 => Some(Self::BitOr),
            _ => None,
        }
    }
}

/// The strategies one map instance was configured with, resolved from
/// the ids stored in its shared header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FuncSet {
    pub hash: HashKind,
    pub key_eq: KeyEqKind,
    pub copy: CopyKind,
    pub merge: MergeKind,
}

impl FuncSet {
    pub fn from_ids(hash: u8, key_eq: u8, copy: u8, merge: u8) -> Result<Self> {
        let err = |what: &str, id: u8| CoreError::Config(format!("unknown {what} id {id}"));
        Ok(Self {
            hash: HashKind::from_id(hash).ok_or_else(|| err("hash", hash))?,
            key_eq: KeyEqKind::from_id(key_eq).ok_or_else(|| err("key-eq", key_eq))?,
            copy: CopyKind::from_id(copy).ok_or_else(|| err("copy", copy))?,
            merge: MergeKind::from_id(merge).ok_or_else(|| err("merge", merge))?,
        })
    }
}

/// Process-wide registry of supported strategy ids, built once during
/// initialization. Configuration validation consults this table so a
/// map created by a newer binary is rejected here instead of
/// misbehaving later.
pub(crate) struct FuncRegistry {
    pub hashes: &'static [HashKind],
    pub merges: &'static [MergeKind],
}

pub(crate) static FUNC_REGISTRY: Lazy<FuncRegistry> = Lazy::new(|| FuncRegistry {
    hashes: &[HashKind::Fnv1a, HashKind::Mix64],
    merges: &[MergeKind::Replace, MergeKind::AddU64, MergeKind::BitOr],
});

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over `key`, unrolled in 4-byte groups.
pub(crate) fn fnv1a(key: &[u8], seed: u64) -> u64 {
    let mut h = FNV_OFFSET ^ seed;
    let mut chunks = key.chunks_exact(4);
    for c in chunks.by_ref() {
        h = (h ^ c[0] as u64).wrapping_mul(FNV_PRIME);
        h = (h ^ c[1] as u64).wrapping_mul(FNV_PRIME);
        h = (h ^ c[2] as u64).wrapping_mul(FNV_PRIME);
        h = (h ^ c[3] as u64).wrapping_mul(FNV_PRIME);
    }
    for &b in chunks.remainder() {
        h = (h ^ b as u64).wrapping_mul(FNV_PRIME);
    }
    h
}

/// SplitMix64 finalizer over the first 8 key bytes.
pub(crate) fn mix64(key: &[u8], seed: u64) -> u64 {
    let mut buf = [0u8; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    let mut z = u64::from_le_bytes(buf) ^ seed;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[inline]
pub(crate) fn hash_key(kind: HashKind, key: &[u8], seed: u64) -> u64 {
    match kind {
        HashKind::Fnv1a => fnv1a(key, seed),
        HashKind::Mix64 => mix64(key, seed),
    }
}

#[inline]
pub(crate) fn keys_equal(kind: KeyEqKind, a: &[u8], b: &[u8]) -> bool {
    match kind {
        KeyEqKind::Bytes => a == b,
    }
}

#[inline]
pub(crate) fn copy_bytes(kind: CopyKind, dst: &mut [u8], src: &[u8]) {
    match kind {
        CopyKind::Bytes => dst.copy_from_slice(src),
    }
}

/// Merge `old` into `new` in place.
pub(crate) fn merge_value(kind: MergeKind, new: &mut [u8], old: &[u8]) {
    match kind {
        MergeKind::Replace => {}
        MergeKind::AddU64 => {
            let mut a = [0u8; 8];
            a.copy_from_slice(&new[..8]);
            let mut b = [0u8; 8];
            b.copy_from_slice(&old[..8]);
            let sum = u64::from_le_bytes(a).wrapping_add(u64::from_le_bytes(b));
            new[..8].copy_from_slice(&sum.to_le_bytes());
        }
        MergeKind::BitOr => {
            for (d, s) in new.iter_mut().zip(old.iter()) {
                *d |= s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_seed_changes_hash() {
        let k = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        assert_ne!(fnv1a(&k, 0), fnv1a(&k, 1));
        assert_eq!(fnv1a(&k, 7), fnv1a(&k, 7));
    }

    #[test]
    fn test_fnv1a_matches_bytewise_reference() {
        // The 4-byte unrolling must not change the result.
        let k: Vec<u8> = (0..23).collect();
        let mut h = FNV_OFFSET ^ 42;
        for &b in &k {
            h = (h ^ b as u64).wrapping_mul(FNV_PRIME);
        }
        assert_eq!(fnv1a(&k, 42), h);
    }

    #[test]
    fn test_mix64_distributes_small_keys() {
        let a = mix64(&1u64.to_le_bytes(), 0);
        let b = mix64(&2u64.to_le_bytes(), 0);
        assert_ne!(a, b);
        assert_ne!(a >> 48, 0);
    }

    #[test]
    fn test_unknown_ids_rejected() {
        assert!(FuncSet::from_ids(0, 0, 0, 0).is_ok());
        assert!(FuncSet::from_ids(99, 0, 0, 0).is_err());
        assert!(FuncSet::from_ids(0, 1, 0, 0).is_err());
        assert!(FuncSet::from_ids(0, 0, 7, 0).is_err());
        assert!(FuncSet::from_ids(0, 0, 0, 3).is_err());
    }

    #[test]
    fn test_registry_lists_every_kind() {
        assert_eq!(FUNC_REGISTRY.hashes.len(), 2);
        assert_eq!(FUNC_REGISTRY.merges.len(), 3);
    }

    #[test]
    fn test_merge_add_u64() {
        let mut new = 3u64.to_le_bytes().to_vec();
        let old = 5u64.to_le_bytes().to_vec();
        merge_value(MergeKind::AddU64, &mut new, &old);
        assert_eq!(u64::from_le_bytes(new.try_into().unwrap()), 8);
    }

    #[test]
    fn test_merge_bitor_keeps_old_flags() {
        let mut new = vec![0b0000_0001u8, 0, 0, 0];
        let old = vec![0b0000_0110u8, 0, 0, 0];
        merge_value(MergeKind::BitOr, &mut new, &old);
        assert_eq!(new[0], 0b0000_0111);
    }

    #[test]
    fn test_merge_replace_is_noop() {
        let mut new = vec![9u8; 8];
        merge_value(MergeKind::Replace, &mut new, &[1u8; 8]);
        assert_eq!(new, vec![9u8; 8]);
    }
}
