use std::collections::HashMap;

use serde_json::Value;

use crate::error::SyncError;
use crate::path::{self, Path};
use crate::runtime::AppRuntime;
use crate::store::VariableStore;
use crate::variable::{ObjectRef, VarId};
use crate::wrapper::WrapperRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: VarId,
    pub value: Value,
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    cache: HashMap<VarId, String>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, id: VarId, presented: &Value) {
        self.cache.insert(id, presented.to_string());
        tracing::trace!(id, "tracking variable");
    }

    pub fn deactivate(&mut self, id: VarId) {
        if self.cache.remove(&id).is_some() {
            tracing::trace!(id, "stopped tracking variable");
        }
    }

    pub fn remember(&mut self, id: VarId, presented: &Value) {
        if let Some(cached) = self.cache.get_mut(&id) {
            *cached = presented.to_string();
        }
    }

    pub fn is_tracking(&self, id: VarId) -> bool {
        self.cache.contains_key(&id)
    }

    pub fn detect<R: AppRuntime + ?Sized>(
        &mut self,
        store: &mut VariableStore,
        runtime: &mut R,
        wrappers: &WrapperRegistry,
    ) -> Vec<Change> {
        let mut ids: Vec<(usize, VarId)> = self
            .cache
            .keys()
            .filter(|id| store.is_tracked(**id))
            .map(|id| (store.lineage(*id).count(), *id))
            .collect();
        ids.sort_unstable();

        let mut changes = Vec::new();
        for (_, id) in ids {
            let value = match present(store, runtime, wrappers, id) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(id, error = %err, "skipping variable during change detection");
                    continue;
                }
            };

            let serialized = value.to_string();
            if self.cache.get(&id) == Some(&serialized) {
                continue;
            }
            self.cache.insert(id, serialized);
            changes.push(Change { id, value });
        }

        if !changes.is_empty() {
            tracing::debug!(changed = changes.len(), "change detection");
        }
        changes
    }
}

pub fn present<R: AppRuntime + ?Sized>(
    store: &mut VariableStore,
    runtime: &mut R,
    wrappers: &WrapperRegistry,
    id: VarId,
) -> Result<Value, SyncError> {
    let value = presented_value(store, runtime, wrappers, id)?;

    if let Some(variable) = store.get_mut(id)
        && variable.path().is_some()
    {
        variable.value = value.clone();
    }
    Ok(value)
}

fn presented_value<R: AppRuntime + ?Sized>(
    store: &VariableStore,
    runtime: &mut R,
    wrappers: &WrapperRegistry,
    id: VarId,
) -> Result<Value, SyncError> {
    let variable = store.get(id).ok_or(SyncError::UnknownVariable(id))?;

    let raw = match variable.path() {
        None => variable.value.clone(),
        Some(raw_path) => {
            let path = Path::parse(raw_path).map_err(|err| SyncError::BadRequest {
                id,
                reason: err.to_string(),
            })?;
            let base = parent_value(store, runtime, wrappers, variable.parent_id)?;
            read_path(runtime, &base, &path)
        }
    };

    Ok(wrappers.present(variable.wrapper_name(), raw, &variable.properties))
}

fn parent_value<R: AppRuntime + ?Sized>(
    store: &VariableStore,
    runtime: &mut R,
    wrappers: &WrapperRegistry,
    parent_id: VarId,
) -> Result<Value, SyncError> {
    match store.get(parent_id) {
        Some(parent) if parent.path().is_some() => {
            presented_value(store, runtime, wrappers, parent_id)
        }
        Some(parent) => Ok(wrappers.present(
            parent.wrapper_name(),
            parent.value.clone(),
            &parent.properties,
        )),
        None => Ok(runtime.root().map_or(Value::Null, |root| root.to_value())),
    }
}

fn read_path<R: AppRuntime + ?Sized>(runtime: &mut R, base: &Value, path: &Path) -> Value {
    match ObjectRef::from_value(base) {
        Some(reference) => runtime
            .resolve(reference, path.segments())
            .unwrap_or_else(|failure| {
                tracing::debug!(path = %path, reason = %failure, "read resolved to null");
                Value::Null
            }),
        None => path::resolve_json(base, path.segments()),
    }
}

/// Writes `value` through the path of variable `id`.
///
/// Object-backed parents are written through the runtime. A literal parent
/// that is not itself path-derived is edited in place in the store.
pub fn write_through<R: AppRuntime + ?Sized>(
    store: &mut VariableStore,
    runtime: &mut R,
    wrappers: &WrapperRegistry,
    id: VarId,
    value: Value,
) -> Result<(), SyncError> {
    let variable = store.get(id).ok_or(SyncError::UnknownVariable(id))?;
    let Some(raw_path) = variable.path() else {
        return Ok(());
    };
    let path = Path::parse(raw_path).map_err(|err| SyncError::BadRequest {
        id,
        reason: err.to_string(),
    })?;
    let parent_id = variable.parent_id;
    let failure = |reason: String| SyncError::PathFailure { id, reason };

    let base = parent_value(store, runtime, wrappers, parent_id)?;
    if let Some(reference) = ObjectRef::from_value(&base) {
        return runtime
            .write(reference, path.segments(), value)
            .map_err(|err| failure(err.reason));
    }

    match store.get_mut(parent_id) {
        Some(parent) if parent.path().is_none() => {
            path::assign_json(&mut parent.value, path.segments(), value).map_err(failure)
        }
        _ => Err(failure(format!("parent of '{path}' is not writable"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Properties;
    use crate::runtime::JsonRuntime;
    use crate::store::NewVariable;
    use crate::variable::{NO_PARENT, PATH_PROPERTY, ROOT_ID, WRAPPER_PROPERTY};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fixture() -> (VariableStore, JsonRuntime) {
        let mut runtime = JsonRuntime::new();
        let root = runtime.set_root(json!({"name": "Homer", "items": [1, 2], "spouse": null}));
        let mut store = VariableStore::new();
        store
            .insert(NewVariable {
                id: Some(ROOT_ID),
                parent_id: NO_PARENT,
                value: root.to_value(),
                ..NewVariable::default()
            })
            .expect("root");
        store.set_active(ROOT_ID, true);
        (store, runtime)
    }

    fn path_var(
        store: &mut VariableStore,
        id: VarId,
        parent_id: VarId,
        path: &str,
        extra: &[(&str, &str)],
    ) {
        let mut properties = props(extra);
        properties.insert(PATH_PROPERTY.to_string(), path.to_string());
        store
            .insert(NewVariable {
                id: Some(id),
                parent_id,
                properties,
                ..NewVariable::default()
            })
            .expect("insert");
        store.set_active(id, true);
    }

    #[test]
    fn detects_changes_once() {
        let (mut store, mut runtime) = fixture();
        let wrappers = WrapperRegistry::new();
        path_var(&mut store, 2, ROOT_ID, "name", &[]);

        let mut tracker = ChangeTracker::new();
        tracker.activate(2, &Value::Null);

        let first = tracker.detect(&mut store, &mut runtime, &wrappers);
        assert_eq!(first, vec![Change { id: 2, value: json!("Homer") }]);
        assert!(tracker.detect(&mut store, &mut runtime, &wrappers).is_empty());

        let root = runtime.root().expect("root");
        runtime.object_mut(root).expect("root object")["name"] = json!("Max");
        let second = tracker.detect(&mut store, &mut runtime, &wrappers);
        assert_eq!(second, vec![Change { id: 2, value: json!("Max") }]);
        assert_eq!(store.get(2).map(|v| v.value.clone()), Some(json!("Max")));
    }

    #[test]
    fn remembered_values_are_not_reported() {
        let (mut store, mut runtime) = fixture();
        let wrappers = WrapperRegistry::new();
        path_var(&mut store, 2, ROOT_ID, "name", &[]);

        let mut tracker = ChangeTracker::new();
        tracker.activate(2, &json!("Homer"));
        let root = runtime.root().expect("root");
        runtime.object_mut(root).expect("root object")["name"] = json!("Max");
        tracker.remember(2, &json!("Max"));

        assert!(tracker.detect(&mut store, &mut runtime, &wrappers).is_empty());
    }

    #[test]
    fn untracked_and_suspended_variables_are_skipped() {
        let (mut store, mut runtime) = fixture();
        let wrappers = WrapperRegistry::new();
        path_var(&mut store, 2, ROOT_ID, "name", &[]);

        let mut tracker = ChangeTracker::new();
        tracker.activate(2, &Value::Null);
        store
            .update(ROOT_ID, None, &props(&[("inactive", "1")]))
            .expect("suspend root");
        assert!(tracker.detect(&mut store, &mut runtime, &wrappers).is_empty());

        store
            .update(ROOT_ID, None, &props(&[("inactive", "")]))
            .expect("resume root");
        assert_eq!(tracker.detect(&mut store, &mut runtime, &wrappers).len(), 1);
    }

    #[test]
    fn wrapper_shapes_presented_value() {
        let (mut store, mut runtime) = fixture();
        let wrappers = WrapperRegistry::new();
        path_var(&mut store, 2, ROOT_ID, "items", &[(WRAPPER_PROPERTY, "ViewList")]);

        let value = present(&mut store, &mut runtime, &wrappers, 2).expect("present");
        assert_eq!(
            value,
            json!([{"index": 1, "item": 1}, {"index": 2, "item": 2}])
        );

        path_var(&mut store, 3, 2, "2.item", &[]);
        assert_eq!(
            present(&mut store, &mut runtime, &wrappers, 3),
            Ok(json!(2))
        );
    }

    #[test]
    fn nullish_read_is_null_but_write_fails() {
        let (mut store, mut runtime) = fixture();
        let wrappers = WrapperRegistry::new();
        path_var(&mut store, 2, ROOT_ID, "spouse.name", &[]);

        assert_eq!(
            present(&mut store, &mut runtime, &wrappers, 2),
            Ok(Value::Null)
        );
        let err = write_through(&mut store, &mut runtime, &wrappers, 2, json!("Marge"))
            .expect_err("null intermediate");
        assert_eq!(err.code(), "path-failure");
        assert_eq!(err.var_id(), 2);
    }

    #[test]
    fn writes_reach_runtime_or_literal_parent() {
        let (mut store, mut runtime) = fixture();
        let wrappers = WrapperRegistry::new();
        path_var(&mut store, 2, ROOT_ID, "name", &[]);
        write_through(&mut store, &mut runtime, &wrappers, 2, json!("Max")).expect("write");
        let root = runtime.root().expect("root");
        assert_eq!(runtime.object(root).map(|o| o["name"].clone()), Some(json!("Max")));

        store
            .insert(NewVariable {
                id: Some(3),
                parent_id: ROOT_ID,
                value: json!({"label": "a"}),
                ..NewVariable::default()
            })
            .expect("literal parent");
        path_var(&mut store, 4, 3, "label", &[]);
        write_through(&mut store, &mut runtime, &wrappers, 4, json!("b")).expect("literal write");
        assert_eq!(store.get(3).map(|v| v.value.clone()), Some(json!({"label": "b"})));
    }
}
