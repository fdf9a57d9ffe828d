use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::path::{self, Segment};
use crate::protocol::Properties;
use crate::variable::ObjectRef;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PathFailure {
    pub reason: String,
}

impl PathFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub trait AppRuntime {
    fn root(&self) -> Option<ObjectRef>;

    fn instantiate(&mut self, type_name: &str, properties: &Properties)
    -> Result<ObjectRef, String>;

    fn resolve(&mut self, reference: ObjectRef, path: &[Segment]) -> Result<Value, PathFailure>;

    /// Writes `value` at `path`. A trailing method segment invokes the method
    /// with `value` as its argument.
    fn write(
        &mut self,
        reference: ObjectRef,
        path: &[Segment],
        value: Value,
    ) -> Result<(), PathFailure>;
}

type Factory = Box<dyn Fn(&Properties) -> Value + Send>;
type Method = Box<dyn Fn(&mut Value, Value) -> Value + Send>;

#[derive(Default)]
pub struct JsonRuntime {
    objects: HashMap<i64, Value>,
    next_obj: i64,
    root: Option<ObjectRef>,
    types: HashMap<String, Factory>,
    methods: HashMap<String, Method>,
    standard: HashMap<String, ObjectRef>,
}

impl JsonRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: Value) -> ObjectRef {
        self.next_obj += 1;
        self.objects.insert(self.next_obj, value);
        ObjectRef::new(self.next_obj)
    }

    pub fn set_root(&mut self, value: Value) -> ObjectRef {
        let reference = self.insert(value);
        self.root = Some(reference);
        reference
    }

    pub fn object(&self, reference: ObjectRef) -> Option<&Value> {
        self.objects.get(&reference.obj)
    }

    pub fn object_mut(&mut self, reference: ObjectRef) -> Option<&mut Value> {
        self.objects.get_mut(&reference.obj)
    }

    pub fn register_type<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&Properties) -> Value + Send + 'static,
    {
        self.types.insert(type_name.into(), Box::new(factory));
    }

    pub fn register_method<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(&mut Value, Value) -> Value + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(method));
    }

    pub fn register_standard(&mut self, name: impl Into<String>, reference: ObjectRef) {
        self.standard.insert(name.into(), reference);
    }

    fn follow(&self, raw: &Value) -> Value {
        match ObjectRef::from_value(raw) {
            Some(reference) => self.object(reference).cloned().unwrap_or(Value::Null),
            None => raw.clone(),
        }
    }

    fn call(&mut self, name: &str, target: &Value, arg: Value) -> Result<Value, PathFailure> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| PathFailure::new(format!("unknown method '{name}'")))?;

        match ObjectRef::from_value(target) {
            Some(reference) => {
                let object = self
                    .objects
                    .get_mut(&reference.obj)
                    .ok_or_else(|| PathFailure::new(format!("object {} is gone", reference.obj)))?;
                Ok(method(object, arg))
            }
            None => {
                let mut scratch = target.clone();
                Ok(method(&mut scratch, arg))
            }
        }
    }
}

impl AppRuntime for JsonRuntime {
    fn root(&self) -> Option<ObjectRef> {
        self.root
    }

    fn instantiate(
        &mut self,
        type_name: &str,
        properties: &Properties,
    ) -> Result<ObjectRef, String> {
        let factory = self
            .types
            .get(type_name)
            .ok_or_else(|| format!("unknown type '{type_name}'"))?;
        let value = factory(properties);
        Ok(self.insert(value))
    }

    fn resolve(&mut self, reference: ObjectRef, path: &[Segment]) -> Result<Value, PathFailure> {
        let mut trail: Vec<Value> = Vec::new();
        let mut raw = reference.to_value();

        for segment in path {
            let next = match segment {
                Segment::Property(_) | Segment::Index(_) => {
                    let container = self.follow(&raw);
                    path::step(&container, segment).cloned().unwrap_or(Value::Null)
                }
                Segment::Method(name) => self.call(name, &raw, Value::Null)?,
                Segment::Standard(name) => self
                    .standard
                    .get(name)
                    .map_or(Value::Null, |reference| reference.to_value()),
                Segment::Parent => {
                    raw = trail.pop().unwrap_or(Value::Null);
                    continue;
                }
            };

            trail.push(std::mem::replace(&mut raw, next));
            if raw.is_null() {
                return Ok(Value::Null);
            }
        }

        Ok(raw)
    }

    fn write(
        &mut self,
        reference: ObjectRef,
        path: &[Segment],
        value: Value,
    ) -> Result<(), PathFailure> {
        let Some((last, parents)) = path.split_last() else {
            return Err(PathFailure::new("cannot write an empty path"));
        };

        let mut anchor = reference;
        let mut relative: Vec<Segment> = Vec::new();
        let mut current = self.follow(&anchor.to_value());

        for segment in parents {
            let next = match segment {
                Segment::Property(name) => path::step(&current, segment)
                    .filter(|next| !next.is_null())
                    .cloned()
                    .ok_or_else(|| PathFailure::new(format!("segment '{name}' is null")))?,
                Segment::Index(index) => path::step(&current, segment)
                    .filter(|next| !next.is_null())
                    .cloned()
                    .ok_or_else(|| PathFailure::new(format!("index {index} is null")))?,
                Segment::Standard(name) => self
                    .standard
                    .get(name)
                    .map(|reference| reference.to_value())
                    .ok_or_else(|| PathFailure::new(format!("unknown standard '@{name}'")))?,
                Segment::Method(name) if relative.is_empty() => {
                    self.call(name, &anchor.to_value(), Value::Null)?
                }
                other => {
                    return Err(PathFailure::new(format!("cannot write through {other:?}")));
                }
            };

            match ObjectRef::from_value(&next) {
                Some(reference) => {
                    anchor = reference;
                    relative.clear();
                    current = self.follow(&next);
                }
                None if matches!(segment, Segment::Property(_) | Segment::Index(_)) => {
                    relative.push(segment.clone());
                    current = next;
                }
                None => {
                    return Err(PathFailure::new(format!(
                        "{segment:?} did not yield an object"
                    )));
                }
            }
        }

        if let Segment::Method(name) = last {
            if !relative.is_empty() {
                return Err(PathFailure::new(format!(
                    "method '{name}' needs an object receiver"
                )));
            }
            self.call(name, &anchor.to_value(), value)?;
            return Ok(());
        }

        relative.push(last.clone());
        let object = self
            .objects
            .get_mut(&anchor.obj)
            .ok_or_else(|| PathFailure::new(format!("object {} is gone", anchor.obj)))?;
        path::assign_json(object, &relative, value).map_err(PathFailure::new)
    }
}
