//! Key to shard routing.
//!
//! Routing is a pure function of the key and the node count. Integers route by
//! magnitude, text routes through a byte fold. The fold is deterministic and
//! order sensitive but it is not a general purpose hash: keys sharing a common
//! structure can cluster on a few shards.
use std::fmt;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Width of the fold accumulator.
const LANE_WIDTH: usize = 8;

/// Text keys are conceptually zero padded to a multiple of this many bytes
/// before folding. Zero bytes do not change the fold.
const BLOCK_WIDTH: usize = 64;

/// A value used to pick a shard.
///
/// Non-negative integers of every width normalize to `Unsigned`, so `5_i32`
/// and `5_u64` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardKey {
    /// A negative integer.
    Signed(i128),
    Unsigned(u128),
    Text(String),
    /// A key of a kind routing doesn't understand. The string is a label.
    Opaque(String),
}

impl ShardKey {
    /// Key from anything with a string representation.
    pub fn display(value: &impl fmt::Display) -> Self {
        ShardKey::Text(value.to_string())
    }

    pub fn opaque(label: impl Into<String>) -> Self {
        ShardKey::Opaque(label.into())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signed(v) => write!(f, "{v}"),
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Opaque(v) => write!(f, "<{v}>"),
        }
    }
}

macro_rules! impl_from_signed {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ShardKey {
                fn from(v: $ty) -> Self {
                    let v = v as i128;
                    if v < 0 {
                        ShardKey::Signed(v)
                    } else {
                        ShardKey::Unsigned(v.unsigned_abs())
                    }
                }
            }
        )*
    };
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ShardKey {
                fn from(v: $ty) -> Self {
                    ShardKey::Unsigned(v as u128)
                }
            }
        )*
    };
}

impl_from_signed!(i8, i16, i32, i64, i128, isize);
impl_from_unsigned!(u8, u16, u32, u64, u128, usize);

impl From<&str> for ShardKey {
    fn from(v: &str) -> Self {
        ShardKey::Text(v.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(v: String) -> Self {
        ShardKey::Text(v)
    }
}

impl From<&String> for ShardKey {
    fn from(v: &String) -> Self {
        ShardKey::Text(v.clone())
    }
}

impl From<&ShardKey> for ShardKey {
    fn from(v: &ShardKey) -> Self {
        v.clone()
    }
}

impl From<bool> for ShardKey {
    fn from(v: bool) -> Self {
        ShardKey::Opaque(format!("bool {v}"))
    }
}

impl From<f32> for ShardKey {
    fn from(v: f32) -> Self {
        ShardKey::Opaque(format!("f32 {v}"))
    }
}

impl From<f64> for ShardKey {
    fn from(v: f64) -> Self {
        ShardKey::Opaque(format!("f64 {v}"))
    }
}

/// What to do with keys of an unknown kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownKeyPolicy {
    /// Route to shard 0.
    #[default]
    FirstShard,
    /// Fail routing.
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("cannot route key {0}: unknown key kind")]
    UnroutableKey(ShardKey),
}

/// Compute the shard index for a key.
///
/// Opaque keys always land on shard 0.
pub fn route(key: &ShardKey, nodes: NonZeroUsize) -> usize {
    let n = nodes.get() as u128;
    let idx = match key {
        ShardKey::Signed(v) => v.unsigned_abs() % n,
        ShardKey::Unsigned(v) => v % n,
        ShardKey::Text(s) => u128::from(fold_bytes(s.as_bytes())) % n,
        ShardKey::Opaque(_) => 0,
    };
    // Always less than `nodes`.
    idx as usize
}

/// Fold bytes into a big-endian u64.
///
/// Input is split into 8 byte lanes (zero padded up to a multiple of
/// `BLOCK_WIDTH`), and lanes are summed byte-wise with wrapping arithmetic.
pub fn fold_bytes(bytes: &[u8]) -> u64 {
    let padded_len = bytes.len().div_ceil(BLOCK_WIDTH) * BLOCK_WIDTH;
    let mut acc = [0_u8; LANE_WIDTH];
    for lane_start in (0..padded_len).step_by(LANE_WIDTH) {
        for (offset, slot) in acc.iter_mut().enumerate() {
            let b = bytes.get(lane_start + offset).copied().unwrap_or(0);
            *slot = slot.wrapping_add(b);
        }
    }
    u64::from_be_bytes(acc)
}

/// Routes keys for a fixed number of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRouter {
    nodes: NonZeroUsize,
    unknown: UnknownKeyPolicy,
}

impl KeyRouter {
    pub fn new(nodes: NonZeroUsize, unknown: UnknownKeyPolicy) -> Self {
        KeyRouter { nodes, unknown }
    }

    pub fn nodes(&self) -> NonZeroUsize {
        self.nodes
    }

    pub fn unknown_key_policy(&self) -> UnknownKeyPolicy {
        self.unknown
    }

    pub fn route(&self, key: &ShardKey) -> Result<usize, RouteError> {
        if matches!(key, ShardKey::Opaque(_)) && self.unknown == UnknownKeyPolicy::Reject {
            return Err(RouteError::UnroutableKey(key.clone()));
        }
        Ok(route(key, self.nodes))
    }
}
