use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::detect::result::ObjectClass;

/// Maps detector label strings onto `ObjectClass`, case-insensitively.
///
/// Which labels a model emits is deployment configuration; unknown labels map
/// to `ObjectClass::Other` and never take part in correlation.
#[derive(Clone, Debug)]
pub struct LabelMap {
    entries: HashMap<String, ObjectClass>,
}

impl LabelMap {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, label: &str, class: ObjectClass) {
        self.entries.insert(normalize_label(label), class);
    }

    pub fn with(mut self, label: &str, class: ObjectClass) -> Self {
        self.insert(label, class);
        self
    }

    pub fn classify(&self, label: &str) -> ObjectClass {
        self.entries
            .get(&normalize_label(label))
            .copied()
            .unwrap_or(ObjectClass::Other)
    }

    /// Build from `label -> class-name` pairs, e.g. from a config file.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = Self::empty();
        for (label, class) in pairs {
            map.insert(label, parse_class(class)?);
        }
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        Self::empty()
            .with("helmet", ObjectClass::Helmet)
            .with("no-helmet", ObjectClass::NoHelmet)
            .with("no_helmet", ObjectClass::NoHelmet)
            .with("nohelmet", ObjectClass::NoHelmet)
            .with("plate", ObjectClass::Plate)
            .with("license-plate", ObjectClass::Plate)
            .with("license_plate", ObjectClass::Plate)
            .with("vehicle", ObjectClass::Vehicle)
            .with("motorcycle", ObjectClass::Vehicle)
            .with("motorbike", ObjectClass::Vehicle)
    }
}

pub fn parse_class(name: &str) -> Result<ObjectClass> {
    match normalize_label(name).as_str() {
        "helmet" => Ok(ObjectClass::Helmet),
        "no-helmet" | "no_helmet" | "nohelmet" => Ok(ObjectClass::NoHelmet),
        "plate" => Ok(ObjectClass::Plate),
        "vehicle" => Ok(ObjectClass::Vehicle),
        "other" => Ok(ObjectClass::Other),
        other => Err(anyhow!("unknown object class '{}'", other)),
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}
