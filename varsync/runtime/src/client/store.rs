use std::time::Duration;

use serde_json::Value;
use web_time::Instant;

use crate::batcher::PriorityQueue;
use crate::config::SyncConfig;
use crate::error::{CodecError, SyncError};
use crate::protocol::{Batch, Message, Properties, prioritize};
use crate::store::{NewVariable, VariableStore};
use crate::variable::{IdVendor, NO_PARENT, ObserverId, ROOT_ID, VarId, Variable};
use crate::watch::WatchTally;

pub trait Transport {
    fn send(&mut self, batch: Batch) -> Result<(), CodecError>;
}

impl Transport for Vec<Batch> {
    fn send(&mut self, batch: Batch) -> Result<(), CodecError> {
        self.push(batch);
        Ok(())
    }
}

pub struct Outbox<T: Transport> {
    transport: T,
    queue: PriorityQueue<Message>,
    window: Duration,
    deadline: Option<Instant>,
}

impl<T: Transport> Outbox<T> {
    pub fn new(transport: T, window: Duration) -> Self {
        Self {
            transport,
            queue: PriorityQueue::new(),
            window,
            deadline: None,
        }
    }

    /// Queues `message`, restarting the quiet window. Creates are sent at
    /// once and alone.
    pub fn queue(&mut self, message: Message, now: Instant) {
        for (priority, piece) in prioritize(message) {
            if piece.is_immediate() {
                self.send(Batch::new(false, vec![piece]));
            } else {
                self.queue.push(priority, piece);
                self.deadline = Some(now + self.window);
            }
        }
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.flush(false);
                true
            }
            _ => false,
        }
    }

    pub fn flush(&mut self, user_event: bool) {
        self.deadline = None;
        if self.queue.is_empty() {
            return;
        }
        let messages = self.queue.drain();
        self.send(Batch::new(user_event, messages));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn send(&mut self, batch: Batch) {
        if let Err(err) = self.transport.send(batch) {
            tracing::warn!(error = %err, "failed to send batch to backend");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Created(VarId),
    Updated(VarId),
    Destroyed(VarId),
    Failed {
        id: VarId,
        code: Option<String>,
        description: String,
    },
}

pub struct FrontendStore<T: Transport> {
    store: VariableStore,
    tally: WatchTally,
    outbox: Outbox<T>,
}

impl<T: Transport> FrontendStore<T> {
    pub fn new(transport: T, config: &SyncConfig) -> Self {
        Self::with_id_base(transport, config, ROOT_ID + 1)
    }

    /// Store whose vended ids start at `base`, for hosts that give each tab
    /// its own range.
    pub fn with_id_base(transport: T, config: &SyncConfig, base: VarId) -> Self {
        let mut store = VariableStore::with_vendor(IdVendor::frontend_from(base));
        let root = store.insert(NewVariable {
            id: Some(ROOT_ID),
            parent_id: NO_PARENT,
            ..NewVariable::default()
        });
        if let Err(err) = root {
            tracing::warn!(error = %err, "root placeholder not inserted");
        }

        Self {
            store,
            tally: WatchTally::new(),
            outbox: Outbox::new(transport, config.client_debounce()),
        }
    }

    /// Creates a variable locally and pushes it to the backend. The id is
    /// known before anything is sent. With an `observer`, the new variable
    /// counts as watched by it; the backend watches on create.
    pub fn create(
        &mut self,
        parent_id: VarId,
        value: Option<Value>,
        properties: Properties,
        observer: Option<&ObserverId>,
        unbound: bool,
    ) -> Result<VarId, SyncError> {
        let id = self.store.insert(NewVariable {
            id: None,
            parent_id,
            value: value.clone().unwrap_or(Value::Null),
            properties: properties.clone(),
            unbound,
        })?;
        if let Some(observer) = observer {
            self.tally.watch(id, observer);
        }

        if !unbound {
            let create = Message::Create {
                parent_id,
                value,
                properties,
                id: Some(id),
                no_watch: observer.is_none(),
                unbound: false,
            };
            self.outbox.queue(create, Instant::now());
        }
        Ok(id)
    }

    pub fn update(
        &mut self,
        id: VarId,
        value: Option<Value>,
        properties: Properties,
    ) -> Result<(), SyncError> {
        self.store.update(id, value.clone(), &properties)?;
        if self.is_unbound(id) {
            return Ok(());
        }

        let update = Message::Update {
            id,
            value,
            properties,
        };
        self.outbox.queue(update, Instant::now());
        Ok(())
    }

    pub fn watch(&mut self, id: VarId, observer: &ObserverId) -> Result<Value, SyncError> {
        let value = self
            .store
            .get(id)
            .map(|variable| variable.value.clone())
            .ok_or(SyncError::UnknownVariable(id))?;

        if self.tally.watch(id, observer).first && !self.is_unbound(id) {
            self.outbox.queue(Message::Watch { id }, Instant::now());
        }
        Ok(value)
    }

    pub fn unwatch(&mut self, id: VarId, observer: &ObserverId) {
        if self.tally.unwatch(id, observer).last && !self.is_unbound(id) {
            self.outbox.queue(Message::Unwatch { id }, Instant::now());
        }
    }

    pub fn destroy(&mut self, id: VarId) -> Vec<VarId> {
        let unbound = self.is_unbound(id);
        let removed = self.store.destroy(id);
        for removed_id in &removed {
            self.tally.forget(*removed_id);
        }

        if !removed.is_empty() && !unbound {
            self.outbox.queue(Message::Destroy { id }, Instant::now());
        }
        removed
    }

    pub fn apply(&mut self, batch: Batch) -> Vec<Inbound> {
        let mut events = Vec::new();

        for message in batch.into_ordered() {
            match message {
                Message::Create {
                    parent_id,
                    value,
                    properties,
                    id: Some(id),
                    unbound,
                    ..
                } => {
                    let applied = if self.store.contains(id) {
                        self.store.update(id, value, &properties)
                    } else {
                        self.store
                            .insert(NewVariable {
                                id: Some(id),
                                parent_id,
                                value: value.unwrap_or(Value::Null),
                                properties,
                                unbound,
                            })
                            .map(|_| ())
                    };
                    match applied {
                        Ok(()) => events.push(Inbound::Created(id)),
                        Err(err) => tracing::warn!(id, error = %err, "inbound create rejected"),
                    }
                }
                Message::Update {
                    id,
                    value,
                    properties,
                } => match self.store.update(id, value, &properties) {
                    Ok(()) => events.push(Inbound::Updated(id)),
                    Err(err) => tracing::debug!(id, error = %err, "update for unknown variable"),
                },
                Message::Destroy { id } => {
                    for removed in self.store.destroy(id) {
                        self.tally.forget(removed);
                        events.push(Inbound::Destroyed(removed));
                    }
                }
                Message::Error {
                    id,
                    code,
                    description,
                } => {
                    tracing::warn!(id, code = ?code, "backend error: {description}");
                    events.push(Inbound::Failed {
                        id,
                        code,
                        description,
                    });
                }
                other => {
                    tracing::trace!(kind = other.kind(), id = ?other.id(), "ignored inbound message");
                }
            }
        }
        events
    }

    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.store.get(id)
    }

    pub fn value(&self, id: VarId) -> Option<&Value> {
        self.store.get(id).map(|variable| &variable.value)
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.store.contains(id)
    }

    pub fn is_unbound(&self, id: VarId) -> bool {
        self.store.get(id).is_some_and(|variable| variable.unbound)
    }

    pub fn watcher_count(&self, id: VarId) -> usize {
        self.tally.count(id)
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        self.outbox.poll(now)
    }

    pub fn flush_user_event(&mut self) {
        self.outbox.flush(true);
    }

    pub fn outbox(&self) -> &Outbox<T> {
        &self.outbox
    }

    pub fn transport(&self) -> &T {
        self.outbox.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.outbox.transport_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> FrontendStore<Vec<Batch>> {
        FrontendStore::new(Vec::new(), &SyncConfig::default())
    }

    fn sent(store: &FrontendStore<Vec<Batch>>) -> Vec<Message> {
        store
            .transport()
            .iter()
            .flat_map(|batch| batch.messages.clone())
            .collect()
    }

    #[test]
    fn outbox_orders_by_priority_and_waits_for_window() {
        let mut outbox = Outbox::new(Vec::<Batch>::new(), Duration::from_millis(5));
        let now = Instant::now();
        let high = Message::Update {
            id: 2,
            value: None,
            properties: [("viewdefs:high".to_string(), "v".to_string())].into(),
        };
        outbox.queue(Message::Watch { id: 3 }, now);
        outbox.queue(high, now);

        assert!(!outbox.poll(now));
        assert!(outbox.poll(now + Duration::from_millis(5)));

        let batch = &outbox.transport()[0];
        assert!(!batch.user_event);
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(
            batch.messages[0],
            Message::Update {
                id: 2,
                value: None,
                properties: [("viewdefs".to_string(), "v".to_string())].into(),
            }
        );
        assert_eq!(batch.messages[1], Message::Watch { id: 3 });
    }

    #[test]
    fn queueing_inside_window_pushes_deadline_back() {
        let window = Duration::from_millis(10);
        let mut outbox = Outbox::new(Vec::<Batch>::new(), window);
        let start = Instant::now();
        outbox.queue(Message::Watch { id: 2 }, start);
        outbox.queue(Message::Watch { id: 3 }, start + window / 2);

        assert!(!outbox.poll(start + window));
        assert_eq!(outbox.next_deadline(), Some(start + window + window / 2));
        assert!(outbox.poll(start + window + window / 2));
        assert_eq!(outbox.transport().len(), 1);
        assert_eq!(outbox.transport()[0].messages.len(), 2);
    }

    #[test]
    fn create_vends_ids_synchronously_and_sends_at_once() {
        let mut store = store();
        let first = store
            .create(ROOT_ID, Some(json!(1)), Properties::new(), None, false)
            .expect("create");
        let second = store
            .create(ROOT_ID, Some(json!(2)), Properties::new(), None, false)
            .expect("create");

        assert_eq!((first, second), (2, 3));
        assert_eq!(store.transport().len(), 2);
        assert!(matches!(
            sent(&store)[0],
            Message::Create { id: Some(2), no_watch: true, .. }
        ));
    }

    #[test]
    fn id_base_is_respected() {
        let mut store = FrontendStore::with_id_base(Vec::<Batch>::new(), &SyncConfig::default(), 1000);
        let id = store
            .create(ROOT_ID, None, Properties::new(), None, true)
            .expect("create");

        assert_eq!(id, 1000);
        assert!(store.transport().is_empty());
    }

    #[test]
    fn watch_forwards_only_on_edges() {
        let mut store = store();
        let (a, b) = (ObserverId::from("a"), ObserverId::from("b"));

        store.watch(ROOT_ID, &a).expect("watch");
        store.watch(ROOT_ID, &b).expect("watch");
        store.unwatch(ROOT_ID, &a);
        store.unwatch(ROOT_ID, &b);
        store.flush_user_event();

        assert_eq!(
            sent(&store),
            vec![Message::Watch { id: ROOT_ID }, Message::Unwatch { id: ROOT_ID }]
        );
    }

    #[test]
    fn update_sets_local_value_before_sending() {
        let mut store = store();
        store
            .update(ROOT_ID, Some(json!("Y")), Properties::new())
            .expect("update");

        assert_eq!(store.value(ROOT_ID), Some(&json!("Y")));
        assert!(store.transport().is_empty());
        assert_eq!(store.outbox().pending_count(), 1);

        store.flush_user_event();
        assert_eq!(sent(&store), vec![Message::update(ROOT_ID, json!("Y"))]);
        assert!(store.transport()[0].user_event);
    }

    #[test]
    fn apply_mirrors_backend_changes() {
        let mut store = store();
        let observer = ObserverId::from("a");
        let batch = Batch::new(
            false,
            vec![
                Message::Create {
                    parent_id: ROOT_ID,
                    value: Some(json!("x")),
                    properties: Properties::new(),
                    id: Some(-1),
                    no_watch: false,
                    unbound: false,
                },
                Message::update(-1, json!("y")),
            ],
        );
        let events = store.apply(batch);
        assert_eq!(events, vec![Inbound::Created(-1), Inbound::Updated(-1)]);
        assert_eq!(store.value(-1), Some(&json!("y")));

        store.watch(-1, &observer).expect("watch");
        let events = store.apply(Batch::new(false, vec![Message::Destroy { id: -1 }]));
        assert_eq!(events, vec![Inbound::Destroyed(-1)]);
        assert_eq!(store.watcher_count(-1), 0);
        assert!(!store.contains(-1));
    }

    #[test]
    fn destroy_is_local_first_and_sent_once() {
        let mut store = store();
        let parent = store
            .create(ROOT_ID, None, Properties::new(), None, false)
            .expect("parent");
        let child = store
            .create(parent, None, Properties::new(), None, false)
            .expect("child");
        store.transport_mut().clear();

        assert_eq!(store.destroy(parent), vec![child, parent]);
        assert!(store.destroy(parent).is_empty());
        store.flush_user_event();
        assert_eq!(sent(&store), vec![Message::Destroy { id: parent }]);
    }
}
