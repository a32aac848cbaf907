//! Typed access to structured records
//!
//! Header, source and index records are self-describing JSON values. A
//! [`Record`] wraps one and offers accessors that fail with a format error on
//! a missing key or a type mismatch, so parsing code reads as a list of
//! required fields.

use crate::{Result, StreamError};
use serde_json::Value;

/// Borrowed view of a structured record with typed accessors.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    context: &'a str,
    value: &'a Value,
}

impl<'a> Record<'a> {
    /// Wrap `value`; `context` names the record in error messages.
    pub fn new(context: &'a str, value: &'a Value) -> Self {
        Self { context, value }
    }

    /// Optional field lookup; `None` when absent or when the record is not an object.
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.value.get(key)
    }

    /// Required field of any type.
    pub fn field(&self, key: &str) -> Result<&'a Value> {
        self.get(key).ok_or_else(|| self.error(key, "is missing"))
    }

    pub fn i64(&self, key: &str) -> Result<i64> {
        self.field(key)?.as_i64().ok_or_else(|| self.error(key, "is not an integer"))
    }

    pub fn u64(&self, key: &str) -> Result<u64> {
        self.field(key)?.as_u64().ok_or_else(|| self.error(key, "is not an unsigned integer"))
    }

    pub fn str(&self, key: &str) -> Result<&'a str> {
        self.field(key)?.as_str().ok_or_else(|| self.error(key, "is not a string"))
    }

    /// Nested record under `key`, which must be an object.
    pub fn nested(&self, key: &str) -> Result<Record<'a>> {
        let value = self.field(key)?;
        if !value.is_object() {
            return Err(self.error(key, "is not an object"));
        }
        Ok(Record { context: self.context, value })
    }

    fn error(&self, key: &str, problem: &str) -> StreamError {
        StreamError::format_error(self.context, format!("field '{}' {}", key, problem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors_read_matching_fields() -> Result<()> {
        let value = json!({
            "id": 3,
            "uri": "file://cam",
            "offset": -5,
            "packet": { "size_bytes": 100 }
        });
        let record = Record::new("source descriptor", &value);
        assert_eq!(record.u64("id")?, 3);
        assert_eq!(record.i64("offset")?, -5);
        assert_eq!(record.str("uri")?, "file://cam");
        assert_eq!(record.nested("packet")?.u64("size_bytes")?, 100);
        Ok(())
    }

    #[test]
    fn mismatches_are_format_errors_naming_the_field() {
        let value = json!({ "id": "zero", "packet": 5 });
        let record = Record::new("source descriptor", &value);

        let err = record.u64("id").unwrap_err();
        assert!(matches!(err, StreamError::Format { .. }));
        assert!(err.to_string().contains("'id'"));

        assert!(record.nested("packet").is_err());
        let missing = record.str("driver").unwrap_err();
        assert!(missing.to_string().contains("missing"));
    }

    #[test]
    fn non_object_records_have_no_fields() {
        let value = json!([1, 2, 3]);
        let record = Record::new("index", &value);
        assert!(record.get("src_packet_index").is_none());
        assert!(record.field("src_packet_index").is_err());
    }
}
