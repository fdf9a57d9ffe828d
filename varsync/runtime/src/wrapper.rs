use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::protocol::Properties;

pub trait Transform: Send + Sync {
    fn transform(&self, raw: &Value, properties: &Properties) -> Value;
}

/// Projects an array into `{index, item}` rows with 1-based indexes.
/// The `item` property, when set, is copied to each row as `type`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ViewList;

impl Transform for ViewList {
    fn transform(&self, raw: &Value, properties: &Properties) -> Value {
        let Some(items) = raw.as_array() else {
            return Value::Array(Vec::new());
        };

        let item_type = properties.get("item");
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut row = json!({ "index": index + 1, "item": item });
                if let Some(item_type) = item_type {
                    row["type"] = Value::String(item_type.clone());
                }
                row
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct WrapperRegistry {
    wrappers: HashMap<String, Arc<dyn Transform>>,
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        let mut registry = Self {
            wrappers: HashMap::new(),
        };
        registry.register("ViewList", ViewList);
        registry
    }
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, wrapper: impl Transform + 'static) {
        self.wrappers.insert(name.into(), Arc::new(wrapper));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.wrappers.get(name).cloned()
    }

    /// Applies the named wrapper, or passes `raw` through when none is named.
    /// An unknown name passes through as well and is logged.
    pub fn present(&self, name: Option<&str>, raw: Value, properties: &Properties) -> Value {
        let Some(name) = name else {
            return raw;
        };

        match self.wrappers.get(name) {
            Some(wrapper) => wrapper.transform(&raw, properties),
            None => {
                tracing::warn!(wrapper = name, "unknown wrapper; sending raw value");
                raw
            }
        }
    }
}

impl std::fmt::Debug for WrapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.wrappers.keys().collect();
        names.sort();
        f.debug_struct("WrapperRegistry")
            .field("wrappers", &names)
            .finish()
    }
}
