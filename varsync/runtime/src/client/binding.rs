use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use web_time::Instant;

use crate::client::store::{FrontendStore, Inbound, Transport};
use crate::error::SyncError;
use crate::path::Path;
use crate::protocol::{Batch, Properties};
use crate::variable::{ACCESS_PROPERTY, ObserverId, PATH_PROPERTY, VarId};

pub const VALUE_ATTRIBUTE: &str = "ui-value";
pub const ATTR_PREFIX: &str = "ui-attr-";
pub const CLASS_PREFIX: &str = "ui-class-";
pub const STYLE_PREFIX: &str = "ui-style-";
pub const EVENT_PREFIX: &str = "ui-event-";

const INTERACTIVE_TAGS: [&str; 3] = ["input", "textarea", "select"];
const PATH_FAILURE: &str = "path-failure";

pub trait HostElement {
    fn tag_name(&self) -> &str;
    fn attributes(&self) -> Vec<(String, String)>;
    fn live_value(&self) -> Value;
    fn set_value(&mut self, value: &Value);
    fn set_attribute(&mut self, name: &str, value: Option<&str>);
    fn set_class(&mut self, name: &str, present: bool);
    fn set_style(&mut self, name: &str, value: Option<&str>);
    /// `None` clears the error state.
    fn set_error(&mut self, message: Option<&str>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    Action,
}

impl Access {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "r" => Some(Access::Read),
            "w" => Some(Access::Write),
            "rw" => Some(Access::ReadWrite),
            "action" => Some(Access::Action),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "r",
            Access::Write => "w",
            Access::ReadWrite => "rw",
            Access::Action => "action",
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        !matches!(self, Access::Read)
    }

    pub fn suppresses_duplicates(self) -> bool {
        !matches!(self, Access::Action | Access::Write)
    }

    fn default_for(kind: &BindingKind, tag_name: &str) -> Self {
        match kind {
            BindingKind::Event(_) => Access::Action,
            BindingKind::Value
                if INTERACTIVE_TAGS
                    .iter()
                    .any(|tag| tag.eq_ignore_ascii_case(tag_name)) =>
            {
                Access::ReadWrite
            }
            _ => Access::Read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    Value,
    Attr(String),
    Class(String),
    Style(String),
    Event(String),
}

impl BindingKind {
    pub fn from_attribute(name: &str) -> Option<Self> {
        if name == VALUE_ATTRIBUTE {
            return Some(BindingKind::Value);
        }

        let named = |prefix: &str| {
            name.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(str::to_string)
        };
        named(ATTR_PREFIX)
            .map(BindingKind::Attr)
            .or_else(|| named(CLASS_PREFIX).map(BindingKind::Class))
            .or_else(|| named(STYLE_PREFIX).map(BindingKind::Style))
            .or_else(|| named(EVENT_PREFIX).map(BindingKind::Event))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub kind: BindingKind,
    pub var_id: VarId,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

struct BindingContext<E> {
    element: E,
    context_id: VarId,
    observer: ObserverId,
    bindings: Vec<Binding>,
    error_var: Option<VarId>,
}

impl<E> BindingContext<E> {
    fn binding(&self, var_id: VarId) -> Option<&Binding> {
        self.bindings.iter().find(|binding| binding.var_id == var_id)
    }

    fn value_binding(&self) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|binding| binding.kind == BindingKind::Value)
    }

    fn event_binding(&self, event: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|binding| matches!(&binding.kind, BindingKind::Event(name) if name == event))
    }
}

pub struct BindingEngine<E: HostElement, T: Transport> {
    store: FrontendStore<T>,
    contexts: BTreeMap<ElementId, BindingContext<E>>,
    by_var: HashMap<VarId, ElementId>,
    next_element: u64,
}

impl<E: HostElement, T: Transport> BindingEngine<E, T> {
    pub fn new(store: FrontendStore<T>) -> Self {
        Self {
            store,
            contexts: BTreeMap::new(),
            by_var: HashMap::new(),
            next_element: 1,
        }
    }

    /// Creates one child variable under `context_id` per binding declaration
    /// on `element`. The context is watched for as long as the element is
    /// bound. On failure nothing stays created.
    pub fn bind(&mut self, context_id: VarId, element: E) -> Result<ElementId, SyncError> {
        let element_id = ElementId(self.next_element);
        self.next_element += 1;
        let observer = ObserverId::new(format!("element-{}", element_id.0));

        self.store.watch(context_id, &observer)?;

        let mut bindings = Vec::new();
        for (name, raw) in element.attributes() {
            let Some(kind) = BindingKind::from_attribute(&name) else {
                continue;
            };
            match self.create_binding(context_id, kind, &raw, element.tag_name(), &observer) {
                Ok(binding) => bindings.push(binding),
                Err(err) => {
                    for binding in &bindings {
                        self.store.destroy(binding.var_id);
                    }
                    self.store.unwatch(context_id, &observer);
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            element = element_id.0,
            context = context_id,
            bindings = bindings.len(),
            "element bound"
        );
        for binding in &bindings {
            self.by_var.insert(binding.var_id, element_id);
        }
        self.contexts.insert(
            element_id,
            BindingContext {
                element,
                context_id,
                observer,
                bindings,
                error_var: None,
            },
        );
        Ok(element_id)
    }

    fn create_binding(
        &mut self,
        context_id: VarId,
        kind: BindingKind,
        raw: &str,
        tag_name: &str,
        observer: &ObserverId,
    ) -> Result<Binding, SyncError> {
        let path = Path::parse(raw).map_err(|err| SyncError::BadRequest {
            id: context_id,
            reason: format!("binding path '{raw}': {err}"),
        })?;
        let access = match path.param_str(ACCESS_PROPERTY) {
            Some(explicit) => Access::parse(explicit).ok_or_else(|| SyncError::BadRequest {
                id: context_id,
                reason: format!("unknown access mode '{explicit}'"),
            })?,
            None => Access::default_for(&kind, tag_name),
        };

        let mut properties: Properties = path.params_as_properties();
        properties.insert(PATH_PROPERTY.to_string(), path.base().to_string());
        properties.insert(ACCESS_PROPERTY.to_string(), access.as_str().to_string());

        let watcher = access.readable().then_some(observer);
        let var_id = self
            .store
            .create(context_id, None, properties, watcher, false)?;
        Ok(Binding {
            kind,
            var_id,
            access,
        })
    }

    pub fn unbind(&mut self, element_id: ElementId) -> Option<E> {
        let context = self.contexts.remove(&element_id)?;
        for binding in &context.bindings {
            self.by_var.remove(&binding.var_id);
            self.store.destroy(binding.var_id);
        }
        self.store.unwatch(context.context_id, &context.observer);

        tracing::debug!(element = element_id.0, "element unbound");
        Some(context.element)
    }

    pub fn receive(&mut self, batch: Batch) -> Vec<Inbound> {
        let events = self.store.apply(batch);
        for event in &events {
            match event {
                Inbound::Updated(var_id) => self.render(*var_id),
                Inbound::Failed {
                    id,
                    code: Some(code),
                    description,
                } if code == PATH_FAILURE => self.mark_error(*id, description),
                Inbound::Destroyed(var_id) => self.forget_binding(*var_id),
                _ => {}
            }
        }
        events
    }

    pub fn write_value(&mut self, element_id: ElementId, value: Value) -> Result<bool, SyncError> {
        let Some(binding) = self
            .contexts
            .get(&element_id)
            .and_then(|context| context.value_binding())
            .cloned()
        else {
            return Ok(false);
        };
        self.send(&binding, value)
    }

    pub fn input(&mut self, element_id: ElementId) -> Result<bool, SyncError> {
        let Some(live) = self
            .contexts
            .get(&element_id)
            .map(|context| context.element.live_value())
        else {
            return Ok(false);
        };

        let sent = self.write_value(element_id, live)?;
        if sent {
            self.store.flush_user_event();
        }
        Ok(sent)
    }

    /// Fires the element's `event` binding. A pending value change on the same
    /// element goes out first.
    pub fn trigger(
        &mut self,
        element_id: ElementId,
        event: &str,
        payload: Value,
    ) -> Result<bool, SyncError> {
        let Some(context) = self.contexts.get(&element_id) else {
            return Ok(false);
        };
        let Some(action) = context.event_binding(event).cloned() else {
            return Ok(false);
        };
        let live = context.element.live_value();
        let pending = context
            .value_binding()
            .filter(|binding| self.store.value(binding.var_id) != Some(&live))
            .cloned()
            .map(|binding| (binding, live));

        if let Some((binding, live)) = pending {
            self.send(&binding, live)?;
        }
        self.send(&action, payload)?;
        self.store.flush_user_event();
        Ok(true)
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        self.store.poll(now)
    }

    pub fn store(&self) -> &FrontendStore<T> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FrontendStore<T> {
        &mut self.store
    }

    pub fn element(&self, element_id: ElementId) -> Option<&E> {
        self.contexts.get(&element_id).map(|context| &context.element)
    }

    pub fn element_mut(&mut self, element_id: ElementId) -> Option<&mut E> {
        self.contexts
            .get_mut(&element_id)
            .map(|context| &mut context.element)
    }

    pub fn bindings(&self, element_id: ElementId) -> &[Binding] {
        self.contexts
            .get(&element_id)
            .map(|context| context.bindings.as_slice())
            .unwrap_or_default()
    }

    fn send(&mut self, binding: &Binding, value: Value) -> Result<bool, SyncError> {
        if !binding.access.writable() {
            return Ok(false);
        }
        if binding.access.suppresses_duplicates()
            && self.store.value(binding.var_id) == Some(&value)
        {
            tracing::trace!(id = binding.var_id, "unchanged value not sent");
            return Ok(false);
        }

        self.store
            .update(binding.var_id, Some(value), Properties::new())?;
        Ok(true)
    }

    fn render(&mut self, var_id: VarId) {
        let Some(element_id) = self.by_var.get(&var_id) else {
            return;
        };
        let Some(context) = self.contexts.get_mut(element_id) else {
            return;
        };
        let Some(binding) = context.binding(var_id).cloned() else {
            return;
        };

        if context.error_var == Some(var_id) {
            context.error_var = None;
            context.element.set_error(None);
        }
        if !binding.access.readable() {
            return;
        }

        let value = self.store.value(var_id).cloned().unwrap_or(Value::Null);
        let element = &mut context.element;
        match &binding.kind {
            BindingKind::Value => element.set_value(&value),
            BindingKind::Attr(name) => element.set_attribute(name, display(&value).as_deref()),
            BindingKind::Class(name) => element.set_class(name, truthy(&value)),
            BindingKind::Style(name) => element.set_style(name, display(&value).as_deref()),
            BindingKind::Event(_) => {}
        }
    }

    fn mark_error(&mut self, var_id: VarId, description: &str) {
        let Some(context) = self
            .by_var
            .get(&var_id)
            .and_then(|element_id| self.contexts.get_mut(element_id))
        else {
            return;
        };
        context.error_var = Some(var_id);
        context.element.set_error(Some(description));
    }

    fn forget_binding(&mut self, var_id: VarId) {
        let Some(element_id) = self.by_var.remove(&var_id) else {
            return;
        };
        if let Some(context) = self.contexts.get_mut(&element_id) {
            context.bindings.retain(|binding| binding.var_id != var_id);
        }
    }
}

fn display(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
