use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Priority, Properties, split_priority};

pub type VarId = i64;

pub const ROOT_ID: VarId = 1;

pub const NO_PARENT: VarId = 0;

pub const PATH_PROPERTY: &str = "path";
pub const CREATE_PROPERTY: &str = "create";
pub const WRAPPER_PROPERTY: &str = "wrapper";
pub const INACTIVE_PROPERTY: &str = "inactive";
pub const ACCESS_PROPERTY: &str = "access";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(String);

impl ObserverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObserverId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub obj: i64,
}

impl ObjectRef {
    pub fn new(obj: i64) -> Self {
        Self { obj }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        map.get("obj")
            .and_then(Value::as_i64)
            .filter(|obj| *obj != 0)
            .map(Self::new)
    }

    pub fn to_value(self) -> Value {
        serde_json::json!({ "obj": self.obj })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub id: VarId,
    pub parent_id: VarId,
    pub value: Value,
    pub properties: Properties,
    pub unbound: bool,
    pub active: bool,
}

impl Variable {
    pub fn new(id: VarId, parent_id: VarId) -> Self {
        Self {
            id,
            parent_id,
            value: Value::Null,
            properties: Properties::new(),
            unbound: false,
            active: false,
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn apply_properties(&mut self, properties: &Properties) {
        for tier in Priority::ALL {
            for (key, value) in properties {
                let (name, priority) = split_priority(key);
                if priority != tier {
                    continue;
                }
                if value.is_empty() {
                    self.properties.remove(name);
                } else {
                    self.properties.insert(name.to_string(), value.clone());
                }
            }
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.property(PATH_PROPERTY)
    }

    pub fn wrapper_name(&self) -> Option<&str> {
        self.property(WRAPPER_PROPERTY)
    }

    pub fn is_suspended(&self) -> bool {
        self.property(INACTIVE_PROPERTY).is_some()
    }

    pub fn object_ref(&self) -> Option<ObjectRef> {
        ObjectRef::from_value(&self.value)
    }
}

/// Hands out ids from one of the disjoint ranges.
///
/// Backend ids count down from `-1`; frontend ids count up from above
/// [`ROOT_ID`], so neither side needs a handshake to vend.
#[derive(Debug, Clone)]
pub struct IdVendor {
    next: VarId,
    step: VarId,
}

impl IdVendor {
    pub fn backend() -> Self {
        Self { next: -1, step: -1 }
    }

    pub fn frontend() -> Self {
        Self::frontend_from(ROOT_ID + 1)
    }

    pub fn frontend_from(start: VarId) -> Self {
        Self {
            next: start.max(ROOT_ID + 1),
            step: 1,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> VarId {
        let id = self.next;
        self.next += self.step;
        id
    }

    pub fn observe(&mut self, id: VarId) {
        if self.step > 0 && id >= self.next {
            self.next = id + 1;
        } else if self.step < 0 && id <= self.next {
            self.next = id - 1;
        }
    }
}
