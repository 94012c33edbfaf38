//! Storage endpoint (RSE) model
//!
//! An endpoint is a storage location able to hold file replicas. Placement
//! decisions look at its tier, its storage class, its free space and whether
//! it currently accepts writes.

use crate::error::{ReplixError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Storage class of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    /// Disk-class storage, valid rebalancing target
    Disk,
    /// Archival-class storage (tape)
    Archival,
    /// Any other storage class
    Other(String),
}

impl EndpointType {
    /// Attribute values read as [`EndpointType::Archival`]
    pub const ARCHIVAL_NAMES: [&'static str; 2] = ["TAPE", "ARCHIVAL"];

    /// Canonical attribute value
    pub fn as_str(&self) -> &str {
        match self {
            Self::Disk => "DATADISK",
            Self::Archival => "TAPE",
            Self::Other(value) => value,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self, Self::Disk)
    }

    pub fn is_archival(&self) -> bool {
        matches!(self, Self::Archival)
    }
}

impl From<&str> for EndpointType {
    fn from(s: &str) -> Self {
        match s {
            "DATADISK" | "DISK" => Self::Disk,
            s if Self::ARCHIVAL_NAMES.contains(&s) => Self::Archival,
            other => Self::Other(other.to_string()),
        }
    }
}

impl FromStr for EndpointType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a tier attribute value.
///
/// Boolean `true` is a legacy spelling of tier 1.
pub fn parse_tier(value: &str) -> Result<u8> {
    if value.eq_ignore_ascii_case("true") {
        return Ok(crate::TIER_PRIMARY);
    }
    value.trim().parse::<u8>().map_err(|_| ReplixError::InvalidAttribute {
        key: "tier".to_string(),
        value: value.to_string(),
    })
}

/// Storage endpoint with its attribute map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEndpoint {
    pub id: Uuid,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub tier: u8,
    /// Endpoint currently accepts new replicas
    pub availability_write: bool,
    /// Free space in bytes, if the metric has been collected
    pub free_space: Option<u64>,
    /// Free-form attributes (country, cloud, ...)
    pub attributes: BTreeMap<String, String>,
}

impl StorageEndpoint {
    /// Create a writable endpoint without free-space information
    pub fn new(name: impl Into<String>, endpoint_type: EndpointType, tier: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            endpoint_type,
            tier,
            availability_write: true,
            free_space: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Build an endpoint from a raw attribute map.
    ///
    /// `type` and `tier` are lifted out of the map into typed fields; a
    /// missing type is read as [`EndpointType::Other`] and a missing tier as 0.
    pub fn from_attributes(
        id: Uuid,
        name: impl Into<String>,
        availability_write: bool,
        free_space: Option<u64>,
        mut attributes: BTreeMap<String, String>,
    ) -> Result<Self> {
        let endpoint_type = attributes
            .remove("type")
            .map(|t| EndpointType::from(t.as_str()))
            .unwrap_or_else(|| EndpointType::Other(String::new()));
        let tier = match attributes.remove("tier") {
            Some(value) => parse_tier(&value)?,
            None => 0,
        };

        Ok(Self {
            id,
            name: name.into(),
            endpoint_type,
            tier,
            availability_write,
            free_space,
            attributes,
        })
    }

    pub fn with_free_space(mut self, bytes: u64) -> Self {
        self.free_space = Some(bytes);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Mark the endpoint as not accepting writes
    pub fn read_only(mut self) -> Self {
        self.availability_write = false;
        self
    }

    /// Look up an attribute, including the implicit ones derived from the
    /// typed fields (`rse`, `type`, `tier`, `availability_write`, `freespace`).
    pub fn attribute(&self, key: &str) -> Option<Cow<'_, str>> {
        match key {
            "rse" => Some(Cow::Borrowed(self.name.as_str())),
            "type" => Some(Cow::Borrowed(self.endpoint_type.as_str())),
            "tier" => Some(Cow::Owned(self.tier.to_string())),
            "availability_write" => Some(Cow::Owned(self.availability_write.to_string())),
            "freespace" => self.free_space.map(|f| Cow::Owned(f.to_string())),
            _ => self.attributes.get(key).map(|v| Cow::Borrowed(v.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_type_parse() {
        assert_eq!("DATADISK".parse::<EndpointType>().unwrap(), EndpointType::Disk);
        assert_eq!("TAPE".parse::<EndpointType>().unwrap(), EndpointType::Archival);
        assert_eq!(
            "SCRATCHDISK".parse::<EndpointType>().unwrap(),
            EndpointType::Other("SCRATCHDISK".to_string())
        );
        assert!(!EndpointType::Other("SCRATCHDISK".to_string()).is_disk());
    }

    #[test]
    fn test_archival_names_parse_archival() {
        for name in EndpointType::ARCHIVAL_NAMES {
            assert!(EndpointType::from(name).is_archival(), "{}", name);
        }
        assert!(!EndpointType::from("tape").is_archival());
    }

    #[test]
    fn test_parse_tier() {
        assert_eq!(parse_tier("2").unwrap(), 2);
        assert_eq!(parse_tier("True").unwrap(), 1);
        assert_eq!(parse_tier("true").unwrap(), 1);
        assert!(parse_tier("gold").is_err());
    }

    #[test]
    fn test_from_attributes_lifts_typed_fields() {
        let mut attrs = BTreeMap::new();
        attrs.insert("type".to_string(), "TAPE".to_string());
        attrs.insert("tier".to_string(), "1".to_string());
        attrs.insert("country".to_string(), "CH".to_string());

        let ep = StorageEndpoint::from_attributes(Uuid::new_v4(), "CERN_TAPE", true, None, attrs)
            .unwrap();
        assert_eq!(ep.endpoint_type, EndpointType::Archival);
        assert_eq!(ep.tier, 1);
        assert_eq!(ep.attributes.len(), 1);
        assert_eq!(ep.attribute("country").as_deref(), Some("CH"));
        assert_eq!(ep.attribute("rse").as_deref(), Some("CERN_TAPE"));
        assert_eq!(ep.attribute("type").as_deref(), Some("TAPE"));
    }

    #[test]
    fn test_implicit_attributes() {
        let ep = StorageEndpoint::new("SITE_A", EndpointType::Disk, 2)
            .with_free_space(42)
            .read_only();
        assert_eq!(ep.attribute("tier").as_deref(), Some("2"));
        assert_eq!(ep.attribute("freespace").as_deref(), Some("42"));
        assert_eq!(ep.attribute("availability_write").as_deref(), Some("false"));
        assert_eq!(ep.attribute("missing"), None);
    }
}
