//! Deterministic ID types.
//!
//! - `OrderId`, `TradeId`: sequential counters assigned by the engine's `IdGen`.
//! - `RunId`: BLAKE3 fingerprint identifying a single backtest run
//!   (configuration + bar data), for reproducibility bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Sequential ID types ──────────────────────────────────────────────

macro_rules! seq_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

seq_id!(OrderId);
seq_id!(TradeId);

/// Monotonically increasing ID generator.
///
/// One counter is shared across both ID kinds so every issued id is unique
/// within a run regardless of type.
#[derive(Debug, Default)]
pub struct IdGen {
    next: u64,
}

impl IdGen {
    pub fn next_order_id(&mut self) -> OrderId {
        let id = OrderId(self.next);
        self.next += 1;
        id
    }

    pub fn next_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.next);
        self.next += 1;
        id
    }
}

// ── BLAKE3-based run fingerprint ─────────────────────────────────────

/// 32-byte BLAKE3 hash identifying a backtest run, displayed as hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RunId(pub [u8; 32]);

impl RunId {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Incremental construction over several input chunks.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", &self.as_hex()[..16])
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl Serialize for RunId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(d)?;
        let bytes: Vec<u8> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<_, _>>()
            .map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(Self(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_gen_is_monotonic() {
        let mut gen = IdGen::default();
        let a = gen.next_order_id();
        let b = gen.next_order_id();
        assert!(b.0 > a.0);
    }

    #[test]
    fn order_and_trade_ids_never_collide() {
        let mut gen = IdGen::default();
        let o = gen.next_order_id();
        let t = gen.next_trade_id();
        assert_ne!(o.0, t.0);
    }

    #[test]
    fn run_id_is_deterministic() {
        let a = RunId::from_bytes(b"ES:1m:100000");
        let b = RunId::from_bytes(b"ES:1m:100000");
        assert_eq!(a, b);
    }

    #[test]
    fn run_id_differs_on_input() {
        let a = RunId::from_bytes(b"ES:1m");
        let b = RunId::from_bytes(b"NQ:1m");
        assert_ne!(a, b);
    }

    #[test]
    fn run_id_serialization_roundtrip() {
        let id = RunId::from_bytes(b"run");
        let json = serde_json::to_string(&id).unwrap();
        let deser: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deser);
    }

    #[test]
    fn run_id_hex_is_64_chars() {
        assert_eq!(RunId::from_bytes(b"x").as_hex().len(), 64);
    }
}
