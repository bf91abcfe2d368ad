//! Document type (C2): an ordered field map with stable identity and a
//! self-describing binary payload encoding.
//!
//! Grounded on the teacher's `model::Node` (id + ordered property map) with
//! the field storage widened from `BTreeMap` to an order-preserving `Vec`,
//! since spec.md requires insertion order to survive a round trip (E1).

use crate::error::{CoreError, Result};
use crate::value::{TypedValue, TAG_BOOL, TAG_F32, TAG_F64, TAG_I32, TAG_I64, TAG_STR};

/// Sentinel `page_id` for a document not yet assigned to a page.
pub const UNSET: u64 = u64::MAX;

/// `document_id` field name rendered in [`Document::to_display_string`].
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    document_id: u64,
    page_id: u64,
    offset: u32,
    decompressed_size: u32,
    compressed_size: u32,
    fields: Vec<(String, TypedValue)>,
}

impl Document {
    #[must_use]
    pub fn new(document_id: u64) -> Self {
        Self {
            document_id,
            page_id: UNSET,
            offset: 0,
            decompressed_size: 0,
            compressed_size: 0,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn document_id(&self) -> u64 {
        self.document_id
    }

    #[must_use]
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn decompressed_size(&self) -> u32 {
        self.decompressed_size
    }

    #[must_use]
    pub fn compressed_size(&self) -> u32 {
        self.compressed_size
    }

    /// Called by [`crate::page::Page::insert`] once placement is decided.
    pub fn mark_placed(&mut self, page_id: u64, offset: u32, dcs: u32, cs: u32) {
        self.page_id = page_id;
        self.offset = offset;
        self.decompressed_size = dcs;
        self.compressed_size = cs;
    }

    /// Inserts or overwrites a field, preserving first-insertion order.
    pub fn set(&mut self, key: impl Into<String>, value: TypedValue) -> &mut Self {
        let key = key.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key, value));
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TypedValue> {
        if key == ID_FIELD {
            return None;
        }
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &TypedValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encodes the field map (excluding `_id`, which lives in the record
    /// header) as `key_len:u16 BE | key utf8 | type_tag:u8 | value bytes`
    /// repeated per field. Self-describing and round-trip exact, per
    /// spec.md's "implementer may choose any self-describing encoding".
    #[must_use]
    pub fn encode_fields(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, value) in &self.fields {
            let key_bytes = key.as_bytes();
            buf.extend_from_slice(&(key_bytes.len() as u16).to_be_bytes());
            buf.extend_from_slice(key_bytes);
            buf.push(value.type_tag());
            match value {
                TypedValue::Str(s) => {
                    let bytes = s.as_bytes();
                    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    buf.extend_from_slice(bytes);
                }
                TypedValue::I32(v) => buf.extend_from_slice(&v.to_be_bytes()),
                TypedValue::I64(v) => buf.extend_from_slice(&v.to_be_bytes()),
                TypedValue::F32(v) => buf.extend_from_slice(&v.to_be_bytes()),
                TypedValue::F64(v) => buf.extend_from_slice(&v.to_be_bytes()),
                TypedValue::Bool(v) => buf.push(u8::from(*v)),
            }
        }
        buf
    }

    /// Inverse of [`Document::encode_fields`].
    pub fn decode_fields(bytes: &[u8]) -> Result<Vec<(String, TypedValue)>> {
        let mut fields = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let key_len = read_u16(bytes, cursor)? as usize;
            cursor += 2;
            let key_bytes = slice(bytes, cursor, key_len)?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| corrupt("field name is not valid utf-8"))?;
            cursor += key_len;
            let tag = *bytes.get(cursor).ok_or_else(|| corrupt("truncated field tag"))?;
            cursor += 1;
            let (value, consumed) = decode_value(tag, bytes, cursor)?;
            cursor += consumed;
            fields.push((key, value));
        }
        Ok(fields)
    }

    /// Builds a document from a decoded field list and known identity/size
    /// metadata, used by [`crate::page::Page::retrieve`].
    #[must_use]
    pub fn from_parts(
        document_id: u64,
        page_id: u64,
        offset: u32,
        decompressed_size: u32,
        compressed_size: u32,
        fields: Vec<(String, TypedValue)>,
    ) -> Self {
        Self {
            document_id,
            page_id,
            offset,
            decompressed_size,
            compressed_size,
            fields,
        }
    }

    /// Renders `{"_id": ..., "k": v, ...}` per spec.md E1.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.fields.len() + 1);
        parts.push(format!("\"_id\": {}", self.document_id));
        for (key, value) in &self.fields {
            parts.push(format!("\"{key}\": {}", value.to_display_string()));
        }
        format!("{{{}}}", parts.join(", "))
    }
}

fn decode_value(tag: u8, bytes: &[u8], at: usize) -> Result<(TypedValue, usize)> {
    match tag {
        TAG_STR => {
            let len = read_u32(bytes, at)? as usize;
            let s = slice(bytes, at + 4, len)?;
            let s = String::from_utf8(s.to_vec()).map_err(|_| corrupt("string value is not valid utf-8"))?;
            Ok((TypedValue::Str(s), 4 + len))
        }
        TAG_I32 => Ok((TypedValue::I32(i32::from_be_bytes(read_n(bytes, at)?)), 4)),
        TAG_I64 => Ok((TypedValue::I64(i64::from_be_bytes(read_n(bytes, at)?)), 8)),
        TAG_F32 => Ok((TypedValue::F32(f32::from_be_bytes(read_n(bytes, at)?)), 4)),
        TAG_F64 => Ok((TypedValue::F64(f64::from_be_bytes(read_n(bytes, at)?)), 8)),
        TAG_BOOL => {
            let byte = *bytes.get(at).ok_or_else(|| corrupt("truncated bool value"))?;
            Ok((TypedValue::Bool(byte != 0), 1))
        }
        _ => Err(corrupt("unknown field type tag")),
    }
}

fn corrupt(reason: &str) -> CoreError {
    CoreError::CorruptPage {
        page_id: 0,
        reason: reason.to_string(),
    }
}

fn slice(bytes: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    bytes
        .get(at..at + len)
        .ok_or_else(|| corrupt("field payload truncated"))
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(read_n(bytes, at)?))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(read_n(bytes, at)?))
}

fn read_n<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N]> {
    slice(bytes, at, N)?.try_into().map_err(|_| corrupt("size mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_round_trip_preserves_order_and_types() {
        let mut doc = Document::new(123_456_789);
        doc.set("vehicleMake", TypedValue::Str("Subaru".into()));
        doc.set("vehicleModel", TypedValue::Str("Forester".into()));
        doc.set("vehicleYear", TypedValue::I32(2017));
        doc.set("vehicleType", TypedValue::Str("automobile".into()));
        doc.set("vehicleBodyStyle", TypedValue::Str("SUV".into()));
        doc.set("vehiclePrice", TypedValue::F64(28500.99));
        doc.set("hasHeating", TypedValue::Bool(true));

        let encoded = doc.encode_fields();
        let decoded = Document::decode_fields(&encoded).unwrap();
        let rebuilt = Document::from_parts(doc.document_id(), UNSET, 0, 0, 0, decoded);

        assert_eq!(doc.fields, rebuilt.fields);
    }

    #[test]
    fn e1_to_display_string() {
        let mut doc = Document::new(123_456_789);
        doc.set("vehicleMake", TypedValue::Str("Subaru".into()));
        doc.set("vehicleModel", TypedValue::Str("Forester".into()));
        doc.set("vehicleYear", TypedValue::I32(2017));
        doc.set("vehicleType", TypedValue::Str("automobile".into()));
        doc.set("vehicleBodyStyle", TypedValue::Str("SUV".into()));
        doc.set("vehiclePrice", TypedValue::F64(28500.99));
        doc.set("hasHeating", TypedValue::Bool(true));

        assert_eq!(
            doc.to_display_string(),
            "{\"_id\": 123456789, \"vehicleMake\": \"Subaru\", \"vehicleModel\": \"Forester\", \
             \"vehicleYear\": 2017, \"vehicleType\": \"automobile\", \"vehicleBodyStyle\": \"SUV\", \
             \"vehiclePrice\": 28500.99, \"hasHeating\": true}"
        );
    }

    #[test]
    fn overwriting_a_field_keeps_its_original_position() {
        let mut doc = Document::new(1);
        doc.set("a", TypedValue::I32(1));
        doc.set("b", TypedValue::I32(2));
        doc.set("a", TypedValue::I32(99));
        let names: Vec<_> = doc.fields().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(doc.get("a"), Some(&TypedValue::I32(99)));
    }
}
