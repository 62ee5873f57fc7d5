//! Typed snapshot of a transport's GATT object hierarchy

use crate::domain::models::ObjectPath;
use std::collections::{BTreeSet, HashMap};

/// Property name carrying a GATT UUID
pub const PROP_UUID: &str = "UUID";
/// Property name carrying characteristic flags
pub const PROP_FLAGS: &str = "Flags";
pub const PROP_ALIAS: &str = "Alias";
pub const PROP_ADDRESS: &str = "Address";

/// Interface tags an object can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Device,
    GattService,
    GattCharacteristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    TextList(Vec<String>),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectEntry {
    pub capabilities: BTreeSet<Capability>,
    pub properties: HashMap<String, PropertyValue>,
}

impl ObjectEntry {
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_property(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(PropertyValue::as_text)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.text(PROP_UUID)
    }
}

/// Object path → entry, in the order the transport reported them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTree {
    entries: Vec<(ObjectPath, ObjectEntry)>,
}

impl ObjectTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry; replacing keeps the original position
    pub fn insert(&mut self, path: ObjectPath, entry: ObjectEntry) {
        match self.entries.iter_mut().find(|(p, _)| *p == path) {
            Some((_, existing)) => *existing = entry,
            None => self.entries.push((path, entry)),
        }
    }

    /// Shorthand for a characteristic entry with a UUID
    pub fn insert_characteristic(&mut self, path: ObjectPath, uuid: &str, flags: &[&str]) {
        let entry = ObjectEntry::default()
            .with_capability(Capability::GattCharacteristic)
            .with_property(PROP_UUID, PropertyValue::Text(uuid.to_string()))
            .with_property(
                PROP_FLAGS,
                PropertyValue::TextList(flags.iter().map(|f| f.to_string()).collect()),
            );
        self.insert(path, entry);
    }

    pub fn get(&self, path: &ObjectPath) -> Option<&ObjectEntry> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectPath, &ObjectEntry)> {
        self.entries.iter().map(|(p, e)| (p, e))
    }

    /// Entries strictly below `ancestor`
    pub fn descendants<'a>(
        &'a self,
        ancestor: &'a ObjectPath,
    ) -> impl Iterator<Item = (&'a ObjectPath, &'a ObjectEntry)> + 'a {
        self.iter().filter(move |(p, _)| p.is_descendant_of(ancestor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The two characteristics a session needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSet {
    pub write: ObjectPath,
    pub notify: ObjectPath,
}
