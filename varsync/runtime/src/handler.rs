use serde_json::Value;

use crate::change::{self, ChangeTracker};
use crate::error::SyncError;
use crate::path::Path;
use crate::protocol::{Message, Properties, split_priority};
use crate::runtime::AppRuntime;
use crate::store::{NewVariable, VariableStore};
use crate::variable::{CREATE_PROPERTY, ObserverId, PATH_PROPERTY, VarId};
use crate::watch::WatchTally;
use crate::wrapper::WrapperRegistry;

#[derive(Debug, Default)]
pub struct SessionState {
    pub store: VariableStore,
    pub tally: WatchTally,
    pub tracker: ChangeTracker,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Dispatch {
    pub messages: Vec<(ObserverId, Message)>,
}

impl Dispatch {
    pub fn push(&mut self, to: &ObserverId, message: Message) {
        self.messages.push((to.clone(), message));
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn for_observer(&self, observer: &ObserverId) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|(to, _)| to == observer)
            .map(|(_, message)| message)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub parent_id: VarId,
    pub value: Option<Value>,
    pub properties: Properties,
    pub id: Option<VarId>,
    pub no_watch: bool,
    pub unbound: bool,
}

pub struct ProtocolHandler<'a, R: AppRuntime + ?Sized> {
    state: &'a mut SessionState,
    runtime: &'a mut R,
    wrappers: &'a WrapperRegistry,
}

impl<'a, R: AppRuntime + ?Sized> ProtocolHandler<'a, R> {
    pub fn new(
        state: &'a mut SessionState,
        runtime: &'a mut R,
        wrappers: &'a WrapperRegistry,
    ) -> Self {
        Self {
            state,
            runtime,
            wrappers,
        }
    }

    pub fn handle(&mut self, from: &ObserverId, message: Message, out: &mut Dispatch) {
        tracing::debug!(observer = %from, kind = message.kind(), id = ?message.id(), "inbound");

        if let Err(err) = self.apply(from, message, out) {
            tracing::warn!(observer = %from, code = err.code(), error = %err, "protocol error");
            out.push(from, err.to_message());
        }
    }

    fn apply(
        &mut self,
        from: &ObserverId,
        message: Message,
        out: &mut Dispatch,
    ) -> Result<(), SyncError> {
        match message {
            Message::Create {
                parent_id,
                value,
                properties,
                id,
                no_watch,
                unbound,
            } => {
                let request = CreateRequest {
                    parent_id,
                    value,
                    properties,
                    id,
                    no_watch,
                    unbound,
                };
                self.create(Some(from), request, out).map(|_| ())
            }
            Message::Update {
                id,
                value,
                properties,
            } => self.update(from, id, value, properties, out),
            Message::Watch { id } => {
                if !self.state.store.contains(id) {
                    return Err(SyncError::UnknownVariable(id));
                }
                self.watch(from, id, true, out)
            }
            Message::Unwatch { id } => {
                self.unwatch(from, id);
                Ok(())
            }
            Message::Destroy { id } => {
                self.destroy(Some(from), id, out);
                Ok(())
            }
            Message::Error {
                id,
                code,
                description,
            } => {
                tracing::warn!(observer = %from, id, code = ?code, "peer reported: {description}");
                Ok(())
            }
        }
    }

    /// Creates a variable. `from` is the requesting observer, or `None` for
    /// backend-originated variables, which are announced to the watchers of
    /// their parent instead.
    pub fn create(
        &mut self,
        from: Option<&ObserverId>,
        request: CreateRequest,
        out: &mut Dispatch,
    ) -> Result<VarId, SyncError> {
        let vended = request.id.is_none();
        let id = match request.id {
            Some(id) => id,
            None => self.state.store.vend_id(),
        };
        self.state.store.check_new(id, request.parent_id)?;

        let mut properties = request.properties;
        if let Some(raw) = base_property(&properties, PATH_PROPERTY) {
            let path = Path::parse(&raw).map_err(|err| SyncError::BadRequest {
                id,
                reason: err.to_string(),
            })?;
            for (key, value) in path.params_as_properties() {
                if base_property(&properties, &key).is_none() {
                    properties.insert(key, value);
                }
            }
        }

        let type_name = base_property(&properties, CREATE_PROPERTY).filter(|t| !t.is_empty());
        let value = match &type_name {
            Some(type_name) => self
                .runtime
                .instantiate(type_name, &properties)
                .map(|reference| reference.to_value())
                .map_err(|reason| {
                    tracing::debug!(id, type_name = %type_name, reason = %reason, "instantiation failed");
                    SyncError::InvalidType {
                        id,
                        type_name: type_name.clone(),
                    }
                })?,
            None => request.value.unwrap_or(Value::Null),
        };

        let derived = type_name.is_some() || base_property(&properties, PATH_PROPERTY).is_some();
        self.state.store.insert(NewVariable {
            id: Some(id),
            parent_id: request.parent_id,
            value,
            properties,
            unbound: request.unbound,
        })?;

        match from {
            Some(from) => {
                if vended {
                    let echo = self.create_message(id, request.no_watch)?;
                    out.push(from, echo);
                }
                if !request.no_watch {
                    self.watch(from, id, derived, out)?;
                }
            }
            None => {
                let announce = self.create_message(id, false)?;
                for watcher in self.state.tally.watchers(request.parent_id) {
                    out.push(&watcher, announce.clone());
                }
            }
        }
        Ok(id)
    }

    fn create_message(&mut self, id: VarId, no_watch: bool) -> Result<Message, SyncError> {
        let value = change::present(&mut self.state.store, &mut *self.runtime, self.wrappers, id)?;
        let variable = self
            .state
            .store
            .get(id)
            .ok_or(SyncError::UnknownVariable(id))?;

        Ok(Message::Create {
            parent_id: variable.parent_id,
            value: Some(value),
            properties: variable.properties.clone(),
            id: Some(id),
            no_watch,
            unbound: variable.unbound,
        })
    }

    fn update(
        &mut self,
        from: &ObserverId,
        id: VarId,
        value: Option<Value>,
        properties: Properties,
        out: &mut Dispatch,
    ) -> Result<(), SyncError> {
        let variable = self
            .state
            .store
            .get(id)
            .ok_or(SyncError::UnknownVariable(id))?;
        let has_path = variable.path().is_some();

        let value = if value.is_some() && self.state.store.is_suspended(id) {
            tracing::debug!(id, "ignoring value for inactive variable");
            None
        } else {
            value
        };

        if let Some(value) = &value
            && has_path
        {
            change::write_through(
                &mut self.state.store,
                &mut *self.runtime,
                self.wrappers,
                id,
                value.clone(),
            )?;
        }

        self.state.store.update(id, value.clone(), &properties)?;
        if let Some(value) = &value {
            self.state.tracker.remember(id, value);
        }

        if value.is_none() && properties.is_empty() {
            return Ok(());
        }
        let relay = Message::Update {
            id,
            value,
            properties,
        };
        for watcher in self.state.tally.watchers(id) {
            if &watcher != from {
                out.push(&watcher, relay.clone());
            }
        }
        Ok(())
    }

    pub fn watch(
        &mut self,
        from: &ObserverId,
        id: VarId,
        snapshot: bool,
        out: &mut Dispatch,
    ) -> Result<(), SyncError> {
        let outcome = self.state.tally.watch(id, from);
        let value = change::present(&mut self.state.store, &mut *self.runtime, self.wrappers, id)?;

        if outcome.first {
            self.state.store.set_active(id, true);
            self.state.tracker.activate(id, &value);
            tracing::debug!(id, "first watcher; tracking changes");
        }

        if snapshot {
            let properties = self
                .state
                .store
                .get(id)
                .map(|variable| variable.properties.clone())
                .unwrap_or_default();
            out.push(
                from,
                Message::Update {
                    id,
                    value: Some(value),
                    properties,
                },
            );
        }
        Ok(())
    }

    pub fn unwatch(&mut self, from: &ObserverId, id: VarId) {
        if self.state.tally.unwatch(id, from).last {
            self.release(id);
        }
    }

    pub fn unwatch_all(&mut self, observer: &ObserverId) -> Vec<VarId> {
        let released = self.state.tally.unwatch_all(observer);
        for id in &released {
            self.release(*id);
        }
        released
    }

    fn release(&mut self, id: VarId) {
        self.state.store.set_active(id, false);
        self.state.tracker.deactivate(id);
        tracing::debug!(id, "last watcher gone; tracking stopped");
    }

    pub fn destroy(&mut self, from: Option<&ObserverId>, id: VarId, out: &mut Dispatch) {
        let watchers = self.state.tally.watchers(id);
        let removed = self.state.store.destroy(id);
        if removed.is_empty() {
            return;
        }

        for removed_id in &removed {
            self.state.tally.forget(*removed_id);
            self.state.tracker.deactivate(*removed_id);
        }
        for watcher in watchers {
            if Some(&watcher) != from {
                out.push(&watcher, Message::Destroy { id });
            }
        }
    }

    pub fn detect_changes(&mut self, out: &mut Dispatch) -> usize {
        let changes =
            self.state
                .tracker
                .detect(&mut self.state.store, &mut *self.runtime, self.wrappers);

        for change in &changes {
            for watcher in self.state.tally.watchers(change.id) {
                out.push(&watcher, Message::update(change.id, change.value.clone()));
            }
        }
        changes.len()
    }
}

fn base_property(properties: &Properties, name: &str) -> Option<String> {
    properties
        .iter()
        .find(|(key, _)| split_priority(key).0 == name)
        .map(|(_, value)| value.clone())
}
