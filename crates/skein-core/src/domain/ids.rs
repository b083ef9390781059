//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! ServiceRecord の id は ULID (Universally Unique Lexicographically Sortable Identifier) です。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **分散生成可能**: 複数のワーカープロセスが調整なしで生成できる
//! - **UUID互換**: 128-bit
//!
//! Document 上では ULID の文字列表現（26 文字）として保存します。
//! `Id<T>` は `#[serde(transparent)]` なので、JSON では単なる文字列になります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"svc-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Deterministic id from a raw 128-bit value. Handy for fixtures.
    pub fn from_raw(value: u128) -> Self {
        Self::from_ulid(Ulid::from(value))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Milliseconds since the epoch encoded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        self.ulid.timestamp_ms()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the prefixed display form (`svc-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// ServiceRecord のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {}

impl IdMarker for Service {
    fn prefix() -> &'static str {
        "svc-"
    }
}

/// Identifier of a ServiceRecord (assigned at first persistence).
pub type ServiceId = Id<Service>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        let id = ServiceId::from_ulid(Ulid::new());
        assert!(id.to_string().starts_with("svc-"));
    }

    #[test]
    fn ulid_ids_are_sortable() {
        // ULID は時刻ベースなので、生成順序でソート可能
        let id1 = ServiceId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = ServiceId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id3 = ServiceId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id2 < id3);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ServiceId::from_ulid(Ulid::new());
        let v = serde_json::to_value(id).unwrap();
        assert_eq!(v, serde_json::Value::String(id.as_ulid().to_string()));

        let back: ServiceId = serde_json::from_value(v).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let id = ServiceId::from_ulid(Ulid::new());
        let prefixed: ServiceId = id.to_string().parse().unwrap();
        let bare: ServiceId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
        assert!("svc-not-a-ulid".parse::<ServiceId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<ServiceId>(), size_of::<Ulid>());
    }
}
