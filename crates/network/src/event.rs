//! # Per-Connection Event Dispatch
//!
//! Every connection owns one dispatcher task that serializes all listener
//! callbacks: at most one callback is ever in flight for a given connection,
//! no matter how many I/O sources signal at once.
//!
//! # Priority & coalescing
//!
//! Pending work is drained in strict priority order:
//!
//! 1. **Fatal failure**: delivered once; the disconnect event follows as its
//!    immediate successor and everything else pending is discarded.
//! 2. **Disconnect**: delivered once; the task terminates after it.
//! 3. **Shutdown**: queued non-fatal errors are drained first, then the
//!    task exits without touching the data-event flags.
//! 4. **Receive**: a flag, not a queue. Signals between dispatches coalesce
//!    into one callback. The flag is cleared *before* the callback runs, so
//!    a signal arriving mid-callback schedules another round instead of
//!    being lost.
//! 5. **Done-writing**: same coalescing rule.
//! 6. **Non-fatal errors**: FIFO, one callback each; every entry carries
//!    distinct diagnostic payload and is never coalesced.
//!
//! Delivery goes through the crate-internal [`EventSink`] trait; the
//! connection implements it by resolving its current listener. Keeping the
//! dispatcher decoupled from `Connection` makes the serialization guarantees
//! directly testable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use gamewire_core::EngineError;

tokio::task_local! {
    /// Set while the dispatcher task runs, so connection teardown can tell
    /// whether it is being driven from inside a callback.
    pub(crate) static IN_DISPATCH: ();
}

/// One dispatched event
#[derive(Debug)]
pub(crate) enum Event {
    Receive,
    DoneWriting,
    Error(EngineError),
    Failure(EngineError),
    Disconnect,
}

/// Target of event delivery; implemented by `Connection`
#[async_trait]
pub(crate) trait EventSink: Send + Sync {
    async fn deliver(&self, event: Event);
}

#[derive(Default)]
struct EventState {
    receive: bool,
    done_writing: bool,
    disconnect: bool,
    shutdown: bool,
    failure: Option<EngineError>,
    errors: VecDeque<EngineError>,
}

enum Action {
    Failure(EngineError),
    Disconnect,
    Error(EngineError),
    Receive,
    DoneWriting,
    Exit,
}

struct Shared {
    state: Mutex<EventState>,
    wake: Notify,
}

impl Shared {
    /// Pick the highest-priority pending action, consuming its flag
    fn next_action(&self) -> Option<Action> {
        let mut state = self.state.lock();
        if let Some(error) = state.failure.take() {
            Some(Action::Failure(error))
        } else if state.disconnect {
            state.disconnect = false;
            Some(Action::Disconnect)
        } else if state.shutdown {
            // Drain diagnostics before exiting; data flags are dropped.
            match state.errors.pop_front() {
                Some(error) => Some(Action::Error(error)),
                None => Some(Action::Exit),
            }
        } else if state.receive {
            state.receive = false;
            Some(Action::Receive)
        } else if state.done_writing {
            state.done_writing = false;
            Some(Action::DoneWriting)
        } else {
            state.errors.pop_front().map(Action::Error)
        }
    }
}

/// Serialized event queue for exactly one connection
///
/// Cheap to clone; all clones share the same queue and worker task.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    shared: Arc<Shared>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EventState::default()),
                wake: Notify::new(),
            }),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the worker task
    ///
    /// The sink is held weakly; if it goes away the worker stops. Starting
    /// twice is a programming error.
    pub(crate) fn start(&self, sink: Weak<dyn EventSink>) {
        let shared = self.shared.clone();
        let task = tokio::spawn(IN_DISPATCH.scope((), async move {
            loop {
                let Some(action) = shared.next_action() else {
                    shared.wake.notified().await;
                    continue;
                };
                let Some(sink) = sink.upgrade() else { break };
                match action {
                    Action::Failure(error) => {
                        // Terminal: the disconnect is this failure's
                        // immediate successor, all other pending events die.
                        sink.deliver(Event::Failure(error)).await;
                        sink.deliver(Event::Disconnect).await;
                        break;
                    }
                    Action::Disconnect => {
                        sink.deliver(Event::Disconnect).await;
                        break;
                    }
                    Action::Exit => break,
                    Action::Receive => sink.deliver(Event::Receive).await,
                    Action::DoneWriting => sink.deliver(Event::DoneWriting).await,
                    Action::Error(error) => sink.deliver(Event::Error(error)).await,
                }
            }
        }));

        let mut handle = self.handle.lock();
        assert!(handle.is_none(), "event dispatcher started twice");
        *handle = Some(task);
    }

    pub(crate) fn signal_receive(&self) {
        self.shared.state.lock().receive = true;
        self.shared.wake.notify_one();
    }

    pub(crate) fn signal_done_writing(&self) {
        self.shared.state.lock().done_writing = true;
        self.shared.wake.notify_one();
    }

    /// Record a fatal failure; overrides everything else pending
    ///
    /// Only the first failure wins; a connection dies exactly once.
    pub(crate) fn signal_failure(&self, error: EngineError) {
        let mut state = self.shared.state.lock();
        if state.failure.is_none() {
            state.failure = Some(error);
        }
        drop(state);
        self.shared.wake.notify_one();
    }

    pub(crate) fn signal_disconnect(&self) {
        self.shared.state.lock().disconnect = true;
        self.shared.wake.notify_one();
    }

    pub(crate) fn queue_error(&self, error: EngineError) {
        self.shared.state.lock().errors.push_back(error);
        self.shared.wake.notify_one();
    }

    /// Request prompt termination, waking the worker off its wait
    pub(crate) fn shut_down(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_one();
    }

    /// Whether the current task is the dispatcher's own worker
    pub(crate) fn on_dispatch_task() -> bool {
        IN_DISPATCH.try_with(|_| ()).is_ok()
    }

    /// Wait for the worker to finish (no-op if it never started)
    ///
    /// Must not be called from inside a callback; check
    /// [`on_dispatch_task`](Self::on_dispatch_task) first.
    pub(crate) async fn join(&self) {
        let task = self.handle.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    /// Records delivered events and screams if two callbacks ever overlap.
    struct RecordingSink {
        in_callback: AtomicBool,
        overlapped: AtomicBool,
        log: Mutex<Vec<String>>,
        receives: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                in_callback: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                log: Mutex::new(Vec::new()),
                receives: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, event: Event) {
            if self.in_callback.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            // Hold the "callback" open long enough for racing signals to
            // land while it runs.
            sleep(Duration::from_millis(2)).await;
            let name = match &event {
                Event::Receive => {
                    self.receives.fetch_add(1, Ordering::SeqCst);
                    "receive"
                }
                Event::DoneWriting => "done_writing",
                Event::Error(_) => "error",
                Event::Failure(_) => "failure",
                Event::Disconnect => "disconnect",
            };
            self.log.lock().push(name.to_string());
            self.in_callback.store(false, Ordering::SeqCst);
        }
    }

    fn start(sink: &Arc<RecordingSink>) -> EventDispatcher {
        let dispatcher = EventDispatcher::new();
        let weak: Weak<dyn EventSink> = Arc::downgrade(&(sink.clone() as Arc<dyn EventSink>));
        dispatcher.start(weak);
        dispatcher
    }

    #[tokio::test]
    async fn test_callbacks_never_overlap() {
        let sink = RecordingSink::new();
        let dispatcher = start(&sink);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let d = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                match i % 3 {
                    0 => d.signal_receive(),
                    1 => d.queue_error(EngineError::UnknownPacket(i as u8)),
                    _ => d.signal_done_writing(),
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        sleep(Duration::from_millis(100)).await;
        dispatcher.signal_disconnect();
        dispatcher.join().await;

        assert!(!sink.overlapped.load(Ordering::SeqCst));
        let log = sink.log.lock();
        assert_eq!(log.last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test]
    async fn test_failure_then_disconnect_is_terminal() {
        let sink = RecordingSink::new();
        let dispatcher = start(&sink);

        dispatcher.signal_receive();
        dispatcher.queue_error(EngineError::UnknownPacket(1));
        dispatcher.signal_failure(EngineError::UnexpectedDisconnect);
        // Arrives after the failure: must never be delivered.
        dispatcher.queue_error(EngineError::UnknownPacket(2));
        dispatcher.join().await;

        let log = sink.log.lock();
        let failure_at = log.iter().position(|e| e == "failure").unwrap();
        assert_eq!(log[failure_at + 1], "disconnect");
        assert_eq!(log.len(), failure_at + 2, "events delivered after terminal pair: {:?}", *log);
    }

    #[tokio::test]
    async fn test_receive_signals_coalesce() {
        let sink = RecordingSink::new();
        let dispatcher = EventDispatcher::new();

        // Signal many times before the worker ever runs.
        for _ in 0..10 {
            dispatcher.signal_receive();
        }
        let weak: Weak<dyn EventSink> = Arc::downgrade(&(sink.clone() as Arc<dyn EventSink>));
        dispatcher.start(weak);

        sleep(Duration::from_millis(50)).await;
        dispatcher.signal_disconnect();
        dispatcher.join().await;

        assert_eq!(sink.receives.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_fifo_and_not_coalesced() {
        let sink = RecordingSink::new();
        let dispatcher = start(&sink);

        for i in 0..5 {
            dispatcher.queue_error(EngineError::UnknownPacket(i));
        }
        sleep(Duration::from_millis(100)).await;
        dispatcher.signal_disconnect();
        dispatcher.join().await;

        let log = sink.log.lock();
        assert_eq!(log.iter().filter(|e| *e == "error").count(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_drains_errors_then_exits() {
        let sink = RecordingSink::new();
        let dispatcher = EventDispatcher::new();

        dispatcher.queue_error(EngineError::UnknownPacket(1));
        dispatcher.queue_error(EngineError::UnknownPacket(2));
        dispatcher.signal_receive();
        dispatcher.shut_down();

        let weak: Weak<dyn EventSink> = Arc::downgrade(&(sink.clone() as Arc<dyn EventSink>));
        dispatcher.start(weak);
        dispatcher.join().await;

        let log = sink.log.lock();
        assert_eq!(*log, vec!["error", "error"]);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_parked_worker() {
        let sink = RecordingSink::new();
        let dispatcher = start(&sink);

        // Give the worker time to park on the condition wait.
        sleep(Duration::from_millis(20)).await;
        dispatcher.shut_down();

        // Bounded join: the worker must observe the flag promptly.
        tokio::time::timeout(Duration::from_millis(200), dispatcher.join())
            .await
            .expect("shutdown did not wake the parked worker");
    }
}
