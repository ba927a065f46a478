//! Attribute value mappers
//!
//! Pluggable per-attribute decoders applied to raw directory values before
//! they reach a [`DirectoryEntry`](crate::entry::DirectoryEntry). Unmapped
//! attributes pass through unchanged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::entry::{AvatarBlob, PropertyValue, RawValue};

/// Decoder for the values of one attribute.
///
/// Implementations must be pure.
pub trait AttributeValueMapper: Send + Sync + fmt::Debug {
    /// Map a raw value of `attribute_id` into its domain value.
    fn map(&self, attribute_id: &str, value: RawValue) -> PropertyValue;
}

/// Pass-through conversion of a raw value.
#[must_use]
pub fn passthrough(value: RawValue) -> PropertyValue {
    match value {
        RawValue::Text(s) => PropertyValue::String(s),
        RawValue::Binary(b) => PropertyValue::Binary(b),
    }
}

/// Renders a binary Windows security identifier as `S-1-5-21-…`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidAttributeMapper;

impl SidAttributeMapper {
    /// Decode a binary SID.
    ///
    /// Layout: revision byte, sub-authority count byte, 48-bit big-endian
    /// identifier authority, then little-endian 32-bit sub-authorities.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<String> {
        if bytes.len() < 8 {
            return None;
        }
        let revision = bytes[0];
        let count = usize::from(bytes[1]);
        if bytes.len() < 8 + count * 4 {
            return None;
        }

        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let authority = u64::from_be_bytes(head) & 0xffff_ffff_ffff;

        let mut sid = format!("S-{revision}-{authority}");
        for chunk in bytes[8..8 + count * 4].chunks_exact(4) {
            let sub = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            sid.push('-');
            sid.push_str(&sub.to_string());
        }
        Some(sid)
    }
}

impl AttributeValueMapper for SidAttributeMapper {
    fn map(&self, _attribute_id: &str, value: RawValue) -> PropertyValue {
        match value {
            RawValue::Binary(bytes) => match Self::decode(&bytes) {
                Some(sid) => PropertyValue::String(sid),
                None => PropertyValue::Binary(bytes),
            },
            other => passthrough(other),
        }
    }
}

/// Wraps binary image payloads for avatar handling on person upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvatarAttributeMapper;

impl AttributeValueMapper for AvatarAttributeMapper {
    fn map(&self, _attribute_id: &str, value: RawValue) -> PropertyValue {
        match value {
            RawValue::Binary(bytes) => PropertyValue::Avatar(AvatarBlob::new(bytes)),
            other => passthrough(other),
        }
    }
}

/// Registry of mappers keyed by attribute id (case-insensitive).
#[derive(Debug, Clone, Default)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn AttributeValueMapper>>,
}

impl MapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper for an attribute id.
    #[must_use]
    pub fn with_mapper(
        mut self,
        attribute_id: impl AsRef<str>,
        mapper: Arc<dyn AttributeValueMapper>,
    ) -> Self {
        self.register(attribute_id, mapper);
        self
    }

    pub fn register(&mut self, attribute_id: impl AsRef<str>, mapper: Arc<dyn AttributeValueMapper>) {
        self.mappers
            .insert(attribute_id.as_ref().to_ascii_lowercase(), mapper);
    }

    /// Map one value; attributes without a mapper pass through.
    #[must_use]
    pub fn map(&self, attribute_id: &str, value: RawValue) -> PropertyValue {
        match self.mappers.get(&attribute_id.to_ascii_lowercase()) {
            Some(mapper) => {
                tracing::trace!(attribute = attribute_id, ?mapper, "Mapping attribute value");
                mapper.map(attribute_id, value)
            }
            None => passthrough(value),
        }
    }

    /// Map all values of an attribute.
    #[must_use]
    pub fn map_all(&self, attribute_id: &str, values: Vec<RawValue>) -> Vec<PropertyValue> {
        values
            .into_iter()
            .map(|value| self.map(attribute_id, value))
            .collect()
    }

    /// Map all values of an attribute to text, dropping values without a text form.
    #[must_use]
    pub fn map_text(&self, attribute_id: &str, values: Vec<RawValue>) -> Vec<String> {
        self.map_all(attribute_id, values)
            .iter()
            .filter_map(PropertyValue::to_text)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sid() -> Vec<u8> {
        // S-1-5-21-1004336348-1177238915-682003330-512
        let mut bytes = vec![1u8, 5, 0, 0, 0, 0, 0, 5];
        for sub in [21u32, 1_004_336_348, 1_177_238_915, 682_003_330, 512] {
            bytes.extend_from_slice(&sub.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_sid_decode() {
        assert_eq!(
            SidAttributeMapper::decode(&sample_sid()).as_deref(),
            Some("S-1-5-21-1004336348-1177238915-682003330-512")
        );
    }

    #[test]
    fn test_sid_decode_truncated() {
        let mut bytes = sample_sid();
        bytes.truncate(12);
        assert!(SidAttributeMapper::decode(&bytes).is_none());
        assert!(SidAttributeMapper::decode(&[1, 0]).is_none());

        let mapped = SidAttributeMapper.map("objectSid", RawValue::Binary(bytes.clone()));
        assert_eq!(mapped, PropertyValue::Binary(bytes));
    }

    #[test]
    fn test_sid_mapper_text_passthrough() {
        let mapped = SidAttributeMapper.map("objectSid", RawValue::Text("S-1-5".into()));
        assert_eq!(mapped, PropertyValue::String("S-1-5".into()));
    }

    #[test]
    fn test_avatar_mapper_wraps_binary() {
        let mapped = AvatarAttributeMapper.map("jpegPhoto", RawValue::Binary(vec![0xff, 0xd8]));
        assert_eq!(mapped, PropertyValue::Avatar(AvatarBlob::new(vec![0xff, 0xd8])));
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = MapperRegistry::new()
            .with_mapper("objectSid", Arc::new(SidAttributeMapper))
            .with_mapper("jpegPhoto", Arc::new(AvatarAttributeMapper));

        let sid = registry.map("OBJECTSID", RawValue::Binary(sample_sid()));
        assert_eq!(
            sid.as_str(),
            Some("S-1-5-21-1004336348-1177238915-682003330-512")
        );

        let untouched = registry.map("cn", RawValue::Text("dev".into()));
        assert_eq!(untouched, PropertyValue::String("dev".into()));
    }

    #[test]
    fn test_map_text() {
        let registry = MapperRegistry::new().with_mapper("objectSid", Arc::new(SidAttributeMapper));
        let values = registry.map_text(
            "objectSid",
            vec![RawValue::Binary(sample_sid()), RawValue::Text("plain".into())],
        );
        assert_eq!(values.len(), 2);
        assert_eq!(values[1], "plain");
    }
}
