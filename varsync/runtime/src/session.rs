use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::batcher::{BatchSink, OutgoingBatcher};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::executor::Executor;
use crate::handler::{CreateRequest, Dispatch, ProtocolHandler, SessionState};
use crate::protocol::{Batch, Properties};
use crate::runtime::AppRuntime;
use crate::store::NewVariable;
use crate::variable::{NO_PARENT, ObserverId, ROOT_ID, VarId};
use crate::wrapper::WrapperRegistry;

pub struct Session<R: AppRuntime + Send + 'static> {
    label: String,
    config: SyncConfig,
    state: Arc<Mutex<SessionState>>,
    wrappers: Arc<WrapperRegistry>,
    connections: Mutex<HashMap<ObserverId, OutgoingBatcher>>,
    // Declared last: batchers stop before the worker is joined.
    executor: Executor<R>,
}

impl<R: AppRuntime + Send + 'static> Session<R> {
    pub fn new(config: SyncConfig, runtime: R, wrappers: WrapperRegistry) -> io::Result<Self> {
        let label = config.session.clone();
        let executor = Executor::spawn(&label, runtime)?;
        let state = Arc::new(Mutex::new(SessionState::new()));

        let root_state = state.clone();
        let root = executor.execute(move |runtime| {
            let value = runtime.root().map_or(Value::Null, |root| root.to_value());
            root_state.lock().store.insert(NewVariable {
                id: Some(ROOT_ID),
                parent_id: NO_PARENT,
                value,
                ..NewVariable::default()
            })
        });
        if let Err(err) = root.and_then(|inserted| inserted) {
            return Err(io::Error::other(err));
        }

        tracing::info!(session = %label, "session started");
        Ok(Self {
            label,
            config,
            state,
            wrappers: Arc::new(wrappers),
            connections: Mutex::new(HashMap::new()),
            executor,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn connect(&self, observer: ObserverId, sink: impl BatchSink) -> io::Result<()> {
        let batcher = OutgoingBatcher::spawn(
            format!("{}-{observer}", self.label),
            self.config.debounce(),
            sink,
        )?;
        tracing::info!(session = %self.label, observer = %observer, "connected");
        self.connections.lock().insert(observer, batcher);
        Ok(())
    }

    /// Processes one inbound batch from `observer`.
    ///
    /// System traffic arms the debounce timer before any work starts.
    /// User events are answered by an immediate flush to every connection
    /// that has something queued.
    pub fn receive(&self, observer: &ObserverId, batch: Batch) -> Result<(), SyncError> {
        let user_event = batch.user_event;
        if !user_event && let Some(batcher) = self.connections.lock().get(observer) {
            batcher.ensure_debounce_started();
        }

        let messages = batch.into_ordered();
        let from = observer.clone();
        let dispatch = self.run(move |handler, out| {
            for message in messages {
                handler.handle(&from, message, out);
            }
            handler.detect_changes(out);
        })?;

        self.deliver(dispatch, user_event);
        Ok(())
    }

    pub fn disconnect(&self, observer: &ObserverId) -> Result<Vec<VarId>, SyncError> {
        if let Some(batcher) = self.connections.lock().remove(observer) {
            batcher.clear();
        }

        let gone = observer.clone();
        let (released, _) = self.run_with(move |handler, _out| handler.unwatch_all(&gone))?;
        tracing::info!(
            session = %self.label,
            observer = %observer,
            released = released.len(),
            "disconnected"
        );
        Ok(released)
    }

    pub fn create_variable(
        &self,
        parent_id: VarId,
        value: Value,
        properties: Properties,
    ) -> Result<VarId, SyncError> {
        let (id, dispatch) = self.run_with(move |handler, out| {
            handler.create(
                None,
                CreateRequest {
                    parent_id,
                    value: Some(value),
                    properties,
                    ..CreateRequest::default()
                },
                out,
            )
        })?;
        let id = id?;
        self.deliver(dispatch, false);
        Ok(id)
    }

    pub fn set_value(&self, id: VarId, value: Value) -> Result<(), SyncError> {
        self.state
            .lock()
            .store
            .update(id, Some(value), &Properties::new())?;
        self.refresh().map(|_| ())
    }

    pub fn destroy_variable(&self, id: VarId) -> Result<(), SyncError> {
        let dispatch = self.run(move |handler, out| handler.destroy(None, id, out))?;
        self.deliver(dispatch, false);
        Ok(())
    }

    pub fn refresh(&self) -> Result<usize, SyncError> {
        let (changed, dispatch) = self.run_with(|handler, out| handler.detect_changes(out))?;
        self.deliver(dispatch, false);
        Ok(changed)
    }

    pub fn with_runtime<T, F>(&self, job: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut R) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.executor.execute(job)
    }

    pub fn value(&self, id: VarId) -> Option<Value> {
        self.state.lock().store.get(id).map(|v| v.value.clone())
    }

    pub fn watcher_count(&self, id: VarId) -> usize {
        self.state.lock().tally.count(id)
    }

    pub fn is_connected(&self, observer: &ObserverId) -> bool {
        self.connections.lock().contains_key(observer)
    }

    fn run<F>(&self, job: F) -> Result<Dispatch, SyncError>
    where
        F: FnOnce(&mut ProtocolHandler<'_, R>, &mut Dispatch) + Send + 'static,
    {
        self.run_with(job).map(|((), dispatch)| dispatch)
    }

    fn run_with<T, F>(&self, job: F) -> Result<(T, Dispatch), SyncError>
    where
        F: FnOnce(&mut ProtocolHandler<'_, R>, &mut Dispatch) -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state.clone();
        let wrappers = self.wrappers.clone();
        self.executor.execute(move |runtime| {
            let mut state = state.lock();
            let mut out = Dispatch::default();
            let mut handler = ProtocolHandler::new(&mut state, runtime, &wrappers);
            let result = job(&mut handler, &mut out);
            (result, out)
        })
    }

    fn deliver(&self, dispatch: Dispatch, user_event: bool) {
        let connections = self.connections.lock();
        let mut touched: Vec<&ObserverId> = Vec::new();

        for (observer, message) in dispatch.messages {
            match connections.get_key_value(&observer) {
                Some((key, batcher)) => {
                    batcher.queue(message);
                    if !touched.contains(&key) {
                        touched.push(key);
                    }
                }
                None => {
                    tracing::trace!(observer = %observer, kind = message.kind(), "no connection; dropped");
                }
            }
        }

        if user_event {
            for observer in touched {
                if let Some(batcher) = connections.get(observer) {
                    batcher.flush_now(true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::runtime::JsonRuntime;
    use crate::variable::PATH_PROPERTY;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn session() -> Session<JsonRuntime> {
        let mut runtime = JsonRuntime::new();
        runtime.set_root(json!({"name": "Homer", "items": ["a", "b"]}));
        let config = SyncConfig {
            debounce_ms: 50,
            ..SyncConfig::default()
        };
        Session::new(config, runtime, WrapperRegistry::new()).expect("session")
    }

    fn connect(session: &Session<JsonRuntime>, name: &str) -> (ObserverId, Receiver<Batch>) {
        let (tx, rx) = mpsc::channel();
        let observer = ObserverId::from(name);
        session.connect(observer.clone(), tx).expect("connect");
        (observer, rx)
    }

    fn user(messages: Vec<Message>) -> Batch {
        Batch::new(true, messages)
    }

    fn name_var(id: VarId) -> Message {
        Message::Create {
            parent_id: ROOT_ID,
            value: None,
            properties: [(PATH_PROPERTY.to_string(), "name".to_string())].into(),
            id: Some(id),
            no_watch: false,
            unbound: false,
        }
    }

    fn updates(batch: &Batch) -> Vec<(VarId, Option<Value>)> {
        batch
            .messages
            .iter()
            .filter_map(|message| match message {
                Message::Update { id, value, .. } => Some((*id, value.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn root_holds_runtime_root() {
        let session = session();
        assert_eq!(session.value(ROOT_ID), Some(json!({"obj": 1})));
    }

    #[test]
    fn user_event_is_answered_immediately() {
        let session = session();
        let (a, rx) = connect(&session, "a");

        session
            .receive(&a, user(vec![Message::Watch { id: ROOT_ID }, name_var(2)]))
            .expect("receive");

        let batch = rx.recv_timeout(WAIT).expect("reply");
        assert!(batch.user_event);
        assert_eq!(
            updates(&batch),
            vec![
                (ROOT_ID, Some(json!({"obj": 1}))),
                (2, Some(json!("Homer"))),
            ]
        );
    }

    #[test]
    fn system_traffic_is_debounced_into_one_batch() {
        let session = session();
        let (a, rx) = connect(&session, "a");

        session
            .receive(&a, Batch::new(false, vec![Message::Watch { id: ROOT_ID }]))
            .expect("first");
        session
            .receive(&a, Batch::new(false, vec![name_var(2)]))
            .expect("second");

        let batch = rx.recv_timeout(WAIT).expect("debounced");
        assert!(!batch.user_event);
        assert_eq!(batch.messages.len(), 2);
    }

    #[test]
    fn updates_relay_between_connections() {
        let session = session();
        let (a, rx_a) = connect(&session, "a");
        let (b, rx_b) = connect(&session, "b");
        session
            .receive(&a, user(vec![Message::Watch { id: ROOT_ID }, name_var(2)]))
            .expect("a setup");
        session
            .receive(&b, user(vec![Message::Watch { id: 2 }]))
            .expect("b setup");
        rx_a.recv_timeout(WAIT).expect("a snapshot");
        rx_b.recv_timeout(WAIT).expect("b snapshot");

        session
            .receive(&a, user(vec![Message::update(2, json!("Max"))]))
            .expect("update");

        let relayed = rx_b.recv_timeout(WAIT).expect("relay");
        assert_eq!(updates(&relayed), vec![(2, Some(json!("Max")))]);
        assert!(rx_a.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn runtime_changes_flow_out_on_refresh() {
        let session = session();
        let (a, rx) = connect(&session, "a");
        session
            .receive(&a, user(vec![Message::Watch { id: ROOT_ID }, name_var(2)]))
            .expect("setup");
        rx.recv_timeout(WAIT).expect("snapshot");

        session
            .with_runtime(|runtime| {
                if let Some(root) = runtime.root().and_then(|r| runtime.object_mut(r)) {
                    root["name"] = json!("Bart");
                }
            })
            .expect("mutate");
        assert_eq!(session.refresh(), Ok(1));

        let batch = rx.recv_timeout(WAIT).expect("change");
        assert_eq!(updates(&batch), vec![(2, Some(json!("Bart")))]);
    }

    #[test]
    fn backend_created_variables_are_announced() {
        let session = session();
        let (a, rx) = connect(&session, "a");
        session
            .receive(&a, user(vec![Message::Watch { id: ROOT_ID }]))
            .expect("setup");
        rx.recv_timeout(WAIT).expect("snapshot");

        let id = session
            .create_variable(ROOT_ID, json!("toast"), Properties::new())
            .expect("create");

        assert_eq!(id, -1);
        let batch = rx.recv_timeout(WAIT).expect("announce");
        match batch.messages.as_slice() {
            [Message::Create { id: Some(-1), value, .. }] => {
                assert_eq!(value, &Some(json!("toast")));
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_releases_watches() {
        let session = session();
        let (a, _rx_a) = connect(&session, "a");
        let (b, _rx_b) = connect(&session, "b");
        session
            .receive(&a, user(vec![Message::Watch { id: ROOT_ID }, name_var(2)]))
            .expect("a");
        session
            .receive(&b, user(vec![Message::Watch { id: ROOT_ID }]))
            .expect("b");

        let released = session.disconnect(&a).expect("disconnect");

        assert_eq!(released, vec![2]);
        assert_eq!(session.watcher_count(ROOT_ID), 1);
        assert!(!session.is_connected(&a));
    }

    #[test]
    fn errors_come_back_as_messages() {
        let session = session();
        let (a, rx) = connect(&session, "a");

        session
            .receive(&a, user(vec![Message::Watch { id: 99 }]))
            .expect("receive never fails on protocol errors");

        let batch = rx.recv_timeout(WAIT).expect("error reply");
        match batch.messages.as_slice() {
            [Message::Error { id: 99, code, .. }] => {
                assert_eq!(code.as_deref(), Some("not-found"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
