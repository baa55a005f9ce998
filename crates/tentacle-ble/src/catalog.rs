//! Discovered GATT service catalog
//!
//! The catalog is owned by the session and replaced wholesale each time a
//! discovery completes successfully. Callers only ever see clones or the
//! serialized form.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::codec::CharacteristicProperties;
use crate::config::CLIENT_CHARACTERISTIC_CONFIG;
use crate::error::{BleError, Result};

/// Identifies a characteristic within its service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicKey {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Parse a key from UUID strings
    pub fn parse(service: &str, characteristic: &str) -> Result<Self> {
        let service = Uuid::parse_str(service.trim())
            .map_err(|_| BleError::InvalidUuid(format!("service UUID: {service}")))?;
        let characteristic = Uuid::parse_str(characteristic.trim())
            .map_err(|_| BleError::InvalidUuid(format!("characteristic UUID: {characteristic}")))?;
        Ok(Self::new(service, characteristic))
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A characteristic descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub uuid: Uuid,
}

impl Descriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: impl Into<CharacteristicProperties>) -> Self {
        Self {
            uuid,
            properties: properties.into(),
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(Descriptor::new(uuid));
        self
    }

    /// Look up a descriptor by UUID
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }

    /// Whether the characteristic carries a Client Characteristic Configuration Descriptor
    pub fn has_cccd(&self) -> bool {
        self.descriptor(&CLIENT_CHARACTERISTIC_CONFIG).is_some()
    }
}

impl Serialize for Characteristic {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Characteristic", 8)?;
        state.serialize_field("uuid", &self.uuid)?;
        state.serialize_field("properties", &self.properties)?;
        state.serialize_field("isReadable", &self.properties.is_readable())?;
        state.serialize_field("isWritable", &self.properties.is_writable())?;
        state.serialize_field(
            "isWritableNoResponse",
            &self.properties.is_writable_no_response(),
        )?;
        state.serialize_field("isNotifiable", &self.properties.is_notifiable())?;
        state.serialize_field("isIndicatable", &self.properties.is_indicatable())?;
        state.serialize_field("descriptors", &self.descriptors)?;
        state.end()
    }
}

/// A discovered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid, is_primary: bool) -> Self {
        Self {
            uuid,
            is_primary,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic
    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// The full set of services discovered on a peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ServiceCatalog {
    services: Vec<Service>,
}

impl ServiceCatalog {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    /// Resolve a characteristic key against the catalog
    pub fn find(&self, key: &CharacteristicKey) -> Option<&Characteristic> {
        self.service(&key.service)?.characteristic(&key.characteristic)
    }

    /// Serialized form returned by `getServices()`
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.services).unwrap_or_else(|_| "[]".to_string())
    }
}

impl From<Vec<Service>> for ServiceCatalog {
    fn from(services: Vec<Service>) -> Self {
        Self::new(services)
    }
}
