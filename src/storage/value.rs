//! Cache item encoding for the remote hash
//!
//! Hash layout under `ged_C:<key>`:
//! - `value`: the cached bytes (absent = miss)
//! - `created_at`: unix seconds of the first write
//! - `updated_at`: unix seconds of the last write (0 = invalidated)
//! - `updated_count`: advisory refresh counter, reset to 0 on overflow

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const FIELD_VALUE: &str = "value";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_UPDATED_COUNT: &str = "updated_count";

/// Decoded cache hash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheItem {
    pub created_at: i64,
    pub updated_at: i64,
    pub updated_count: i64,
    pub value: Option<Bytes>,
}

impl CacheItem {
    /// Decode from HGETALL output; unparseable numbers read as 0
    pub fn from_fields(mut fields: HashMap<String, Bytes>) -> Self {
        let number = |name: &str| fields.get(name).and_then(|v| parse_i64(v)).unwrap_or(0);
        let created_at = number(FIELD_CREATED_AT);
        let updated_at = number(FIELD_UPDATED_AT);
        let updated_count = number(FIELD_UPDATED_COUNT);

        Self {
            created_at,
            updated_at,
            updated_count,
            value: fields.remove(FIELD_VALUE),
        }
    }

    /// Nothing usable is stored: no value, or freshness was reset
    pub fn is_miss(&self) -> bool {
        self.value.is_none() || self.updated_at == 0
    }

    /// Hit iff `updated_at + timeout > now`
    pub fn is_fresh(&self, timeout_secs: i64, now: i64) -> bool {
        self.updated_at.saturating_add(timeout_secs) > now
    }

    /// Stamp a rebuilt value: keep the first creation time, if any
    pub fn refresh(&mut self, now: i64, value: Bytes) {
        if self.created_at < 1 {
            self.created_at = now;
        }
        self.updated_at = now;
        self.value = Some(value);
    }

    /// Fields written back on refresh (the counter is incremented separately)
    pub fn to_fields(&self) -> Vec<(&'static str, Bytes)> {
        let mut buf = itoa::Buffer::new();
        let mut fields = Vec::with_capacity(3);
        if let Some(value) = &self.value {
            fields.push((FIELD_VALUE, value.clone()));
        }
        fields.push((
            FIELD_CREATED_AT,
            Bytes::copy_from_slice(buf.format(self.created_at).as_bytes()),
        ));
        fields.push((
            FIELD_UPDATED_AT,
            Bytes::copy_from_slice(buf.format(self.updated_at).as_bytes()),
        ));
        fields
    }
}

/// Parse an ASCII decimal integer as stored by the remote
pub fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Get the current Unix timestamp in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, Bytes> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    #[test]
    fn test_decode_full_item() {
        let item = CacheItem::from_fields(fields(&[
            ("value", "hello"),
            ("created_at", "100"),
            ("updated_at", "150"),
            ("updated_count", "7"),
        ]));

        assert_eq!(item.created_at, 100);
        assert_eq!(item.updated_at, 150);
        assert_eq!(item.updated_count, 7);
        assert_eq!(item.value.as_deref(), Some(&b"hello"[..]));
        assert!(!item.is_miss());
    }

    #[test]
    fn test_missing_value_is_miss() {
        let item = CacheItem::from_fields(fields(&[("updated_at", "150")]));
        assert!(item.is_miss());

        let item = CacheItem::from_fields(HashMap::new());
        assert!(item.is_miss());
        assert_eq!(item, CacheItem::default());
    }

    #[test]
    fn test_invalidated_is_miss() {
        let item = CacheItem::from_fields(fields(&[("value", "v"), ("updated_at", "0")]));
        assert!(item.is_miss());
    }

    #[test]
    fn test_garbage_numbers_read_as_zero() {
        let item = CacheItem::from_fields(fields(&[("value", "v"), ("updated_at", "soon")]));
        assert_eq!(item.updated_at, 0);
    }

    #[test]
    fn test_freshness_boundary() {
        let item = CacheItem {
            updated_at: 1000,
            value: Some(Bytes::from_static(b"v")),
            ..CacheItem::default()
        };
        assert!(item.is_fresh(10, 1009));
        assert!(!item.is_fresh(10, 1010));
    }

    #[test]
    fn test_refresh_keeps_created_at() {
        let mut item = CacheItem::default();
        item.refresh(50, Bytes::from_static(b"a"));
        assert_eq!((item.created_at, item.updated_at), (50, 50));

        item.refresh(80, Bytes::from_static(b"b"));
        assert_eq!((item.created_at, item.updated_at), (50, 80));
        assert_eq!(item.value.as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn test_to_fields() {
        let mut item = CacheItem::default();
        item.refresh(42, Bytes::from_static(b"payload"));
        let fields = item.to_fields();

        assert_eq!(fields[0], ("value", Bytes::from_static(b"payload")));
        assert_eq!(fields[1], ("created_at", Bytes::from_static(b"42")));
        assert_eq!(fields[2], ("updated_at", Bytes::from_static(b"42")));
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64(b"123"), Some(123));
        assert_eq!(parse_i64(b"-5"), Some(-5));
        assert_eq!(parse_i64(b"12a"), None);
    }
}
