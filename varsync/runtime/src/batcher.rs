use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::CodecError;
use crate::protocol::{Batch, Message, Priority, prioritize};

#[derive(Debug, Clone)]
pub struct PriorityQueue<T> {
    tiers: [VecDeque<T>; 3],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: Priority, item: T) {
        self.tiers[priority.index()].push_back(item);
    }

    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for tier in &mut self.tiers {
            out.extend(tier.drain(..));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) {
        for tier in &mut self.tiers {
            tier.clear();
        }
    }
}

pub trait BatchSink: Send + 'static {
    fn send_batch(&mut self, batch: Batch) -> Result<(), CodecError>;
}

impl BatchSink for Sender<Batch> {
    fn send_batch(&mut self, batch: Batch) -> Result<(), CodecError> {
        self.send(batch).map_err(|_| {
            CodecError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "batch receiver dropped",
            ))
        })
    }
}

struct TimerState {
    queue: PriorityQueue<Message>,
    deadline: Option<Instant>,
    /// Armed ahead of processing; enqueues keep this deadline.
    pinned: bool,
    closed: bool,
}

struct Shared {
    label: String,
    window: Duration,
    state: Mutex<TimerState>,
    wake: Condvar,
    // Lock order: sink, then state.
    sink: Mutex<Box<dyn BatchSink>>,
}

pub struct OutgoingBatcher {
    shared: Arc<Shared>,
    timer: Option<JoinHandle<()>>,
}

impl OutgoingBatcher {
    pub fn spawn(
        label: impl Into<String>,
        window: Duration,
        sink: impl BatchSink,
    ) -> io::Result<Self> {
        let label = label.into();
        let shared = Arc::new(Shared {
            label: label.clone(),
            window,
            state: Mutex::new(TimerState {
                queue: PriorityQueue::new(),
                deadline: None,
                pinned: false,
                closed: false,
            }),
            wake: Condvar::new(),
            sink: Mutex::new(Box::new(sink)),
        });

        let timer_shared = shared.clone();
        let timer = thread::Builder::new()
            .name(format!("varsync-batch-{label}"))
            .spawn(move || timer_loop(&timer_shared))?;

        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }

    pub fn queue(&self, message: Message) {
        for (priority, piece) in prioritize(message) {
            self.enqueue(piece, priority);
        }
    }

    pub fn enqueue(&self, message: Message, priority: Priority) {
        if message.is_immediate() {
            self.send(Batch::new(false, vec![message]));
            return;
        }

        let mut state = self.shared.state.lock();
        state.queue.push(priority, message);
        if !state.pinned {
            state.deadline = Some(Instant::now() + self.shared.window);
        }
        self.shared.wake.notify_one();
    }

    pub fn ensure_debounce_started(&self) {
        let mut state = self.shared.state.lock();
        if state.deadline.is_none() {
            state.deadline = Some(Instant::now() + self.shared.window);
            state.pinned = true;
            self.shared.wake.notify_one();
        }
    }

    pub fn flush_now(&self, user_event: bool) {
        flush(&self.shared, user_event);
    }

    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.queue.clear();
        state.deadline = None;
        state.pinned = false;
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn send(&self, batch: Batch) {
        let mut sink = self.shared.sink.lock();
        deliver(&self.shared.label, sink.as_mut(), batch);
    }
}

impl Drop for OutgoingBatcher {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.wake.notify_one();
        }
        if let Some(timer) = self.timer.take()
            && timer.join().is_err()
        {
            tracing::warn!(connection = %self.shared.label, "batch timer thread panicked");
        }
    }
}

fn timer_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.closed {
            return;
        }
        let deadline = state.deadline;
        match deadline {
            None => shared.wake.wait(&mut state),
            Some(deadline) if Instant::now() >= deadline => {
                drop(state);
                flush(shared, false);
                state = shared.state.lock();
            }
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
        }
    }
}

fn flush(shared: &Shared, user_event: bool) {
    let mut sink = shared.sink.lock();
    let messages = {
        let mut state = shared.state.lock();
        state.deadline = None;
        state.pinned = false;
        state.queue.drain()
    };

    if messages.is_empty() {
        return;
    }
    tracing::trace!(connection = %shared.label, count = messages.len(), user_event, "flush");
    deliver(&shared.label, sink.as_mut(), Batch::new(user_event, messages));
}

fn deliver(label: &str, sink: &mut dyn BatchSink, batch: Batch) {
    if let Err(err) = sink.send_batch(batch) {
        tracing::warn!(connection = %label, error = %err, "failed to send batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Properties;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::mpsc::{self, Receiver};

    const WAIT: Duration = Duration::from_secs(2);

    fn batcher(window: Duration) -> (OutgoingBatcher, Receiver<Batch>) {
        let (tx, rx) = mpsc::channel();
        let batcher = OutgoingBatcher::spawn("test", window, tx).expect("spawn batcher");
        (batcher, rx)
    }

    fn watch(id: i64) -> Message {
        Message::Watch { id }
    }

    #[test]
    fn queue_drains_high_then_medium_then_low() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, "D");
        queue.push(Priority::High, "A");
        queue.push(Priority::Medium, "C");
        queue.push(Priority::High, "B");
        queue.push(Priority::Low, "E");

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.drain(), vec!["A", "B", "C", "D", "E"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_now_sends_one_ordered_batch() {
        let (batcher, rx) = batcher(Duration::from_secs(60));
        batcher.enqueue(watch(4), Priority::Low);
        batcher.enqueue(watch(1), Priority::High);
        batcher.enqueue(watch(3), Priority::Medium);
        batcher.enqueue(watch(2), Priority::High);
        assert_eq!(batcher.pending_count(), 4);

        batcher.flush_now(true);
        let batch = rx.recv_timeout(WAIT).expect("batch");

        assert!(batch.user_event);
        assert_eq!(
            batch.messages,
            vec![watch(1), watch(2), watch(3), watch(4)]
        );
        assert_eq!(batcher.pending_count(), 0);
    }

    #[test]
    fn creates_bypass_the_queue() {
        let (batcher, rx) = batcher(Duration::from_secs(60));
        batcher.enqueue(watch(1), Priority::Medium);
        let create = Message::Create {
            parent_id: 1,
            value: Some(json!(0)),
            properties: Properties::new(),
            id: Some(2),
            no_watch: false,
            unbound: false,
        };
        batcher.queue(create.clone());

        let batch = rx.recv_timeout(WAIT).expect("immediate create");
        assert_eq!(batch.messages, vec![create]);
        assert_eq!(batcher.pending_count(), 1);
    }

    #[test]
    fn debounce_coalesces_a_burst() {
        let (batcher, rx) = batcher(Duration::from_millis(20));
        for id in 1..=5 {
            batcher.queue(watch(id));
        }

        let batch = rx.recv_timeout(WAIT).expect("debounced batch");
        assert!(!batch.user_event);
        assert_eq!(batch.messages.len(), 5);
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
    }

    #[test]
    fn enqueue_during_window_restarts_timer() {
        let (batcher, rx) = batcher(Duration::from_millis(60));
        let first = Instant::now();
        batcher.queue(watch(1));
        thread::sleep(Duration::from_millis(40));
        batcher.queue(watch(2));

        let batch = rx.recv_timeout(WAIT).expect("debounced batch");
        assert_eq!(batch.messages, vec![watch(1), watch(2)]);
        assert!(first.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn pre_armed_timer_fires_without_enqueue_reset() {
        let (batcher, rx) = batcher(Duration::from_millis(30));
        let armed = Instant::now();
        batcher.ensure_debounce_started();
        batcher.queue(watch(1));

        let batch = rx.recv_timeout(WAIT).expect("batch");
        assert_eq!(batch.messages, vec![watch(1)]);
        assert!(armed.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn clear_drops_pending() {
        let (batcher, rx) = batcher(Duration::from_millis(10));
        batcher.queue(watch(1));
        batcher.clear();

        assert_eq!(batcher.pending_count(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
