//! Deferred callback queue.
//!
//! Native event sources (timers, pin interrupts, I/O completions) hand off
//! "this script function should now run" requests from any thread. The
//! runtime's single script context drains the queue and runs each request's
//! dispatcher, one at a time.
//!
//! ## Guarantees
//!
//! - Enqueue never blocks: a bounded queue that is full refuses the request.
//!   Capacity counts every request not yet dispatched, including one picked
//!   up by `wait_for_work`
//! - FIFO: requests run in the order they were enqueued
//! - A drain processes the requests queued when it started; anything enqueued
//!   while it runs waits for the next drain
//! - Each request is dispatched at most once; there is no retry
//! - A request without a dispatcher, a failing dispatcher or a panicking
//!   dispatcher is logged and skipped, the drain keeps going

use crate::error::{ZjsError, ZjsResult};
use crate::value::{JsFunction, JsObject, JsValue};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, debug_span, error, warn};

/// Converts a payload into a call of the target function
pub type Dispatcher = Arc<dyn Fn(&JsFunction, Payload) -> ZjsResult<JsValue> + Send + Sync>;

/// Event data carried by a request until it is dispatched
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// No arguments
    #[default]
    None,
    /// Ready-made script arguments
    Args(Vec<JsValue>),
    /// Expired timer; passes the arguments given at scheduling time
    Timer { id: u64, args: Vec<JsValue> },
    /// Digital pin edge; passed as `{ pin, value }`
    GpioEdge { pin: u32, value: bool },
    /// Analog pin reading; passed as the bare number
    Analog { pin: u32, value: f64 },
}

impl Payload {
    /// Script arguments for this payload
    pub fn into_args(self) -> Vec<JsValue> {
        match self {
            Payload::None => Vec::new(),
            Payload::Args(args) | Payload::Timer { args, .. } => args,
            Payload::GpioEdge { pin, value } => {
                let event = JsObject::new();
                event.set("pin", pin);
                event.set("value", value);
                vec![JsValue::Object(event)]
            }
            Payload::Analog { value, .. } => vec![JsValue::Number(value)],
        }
    }
}

/// Default dispatcher: call the target with `this = undefined` and the
/// payload's arguments.
pub fn call_with_payload(target: &JsFunction, payload: Payload) -> ZjsResult<JsValue> {
    target.call(&JsValue::Undefined, &payload.into_args())
}

/// A deferred invocation of a script function
pub struct CallbackRequest {
    /// Function to run; the request holds a reference until it is consumed
    pub target: JsFunction,
    /// How to turn `payload` into the call. `None` is a defect.
    pub invoke: Option<Dispatcher>,
    pub payload: Payload,
}

impl CallbackRequest {
    /// Request dispatched through [`call_with_payload`]
    pub fn new(target: JsFunction, payload: Payload) -> Self {
        Self {
            target,
            invoke: Some(Arc::new(call_with_payload)),
            payload,
        }
    }

    pub fn with_dispatcher<F>(target: JsFunction, payload: Payload, dispatcher: F) -> Self
    where
        F: Fn(&JsFunction, Payload) -> ZjsResult<JsValue> + Send + Sync + 'static,
    {
        Self {
            target,
            invoke: Some(Arc::new(dispatcher)),
            payload,
        }
    }
}

impl fmt::Debug for CallbackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRequest")
            .field("target", &self.target)
            .field("has_dispatcher", &self.invoke.is_some())
            .field("payload", &self.payload)
            .finish()
    }
}

/// Lifetime counters for a queue
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub rejected: AtomicU64,
    pub invoked: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub invoked: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            invoked: self.invoked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one [`CallbackQueue::drain_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Dispatchers called, including those that failed
    pub invoked: usize,
    /// Dispatchers that returned an error or panicked
    pub failed: usize,
    /// Requests discarded for lacking a dispatcher
    pub dropped: usize,
}

impl DrainReport {
    /// Requests removed from the queue
    pub fn processed(&self) -> usize {
        self.invoked + self.dropped
    }
}

/// Enqueue handle, cheap to clone and safe to use from any thread
#[derive(Clone)]
pub struct CallbackSender {
    tx: Sender<CallbackRequest>,
    capacity: Option<usize>,
    /// Requests enqueued and not yet dispatched
    pending: Arc<AtomicUsize>,
    stats: Arc<QueueStats>,
}

impl CallbackSender {
    /// Queue a request without blocking.
    pub fn enqueue(&self, request: CallbackRequest) -> ZjsResult<()> {
        let reserved = self.pending.fetch_add(1, Ordering::AcqRel);
        if let Some(capacity) = self.capacity
            && reserved >= capacity
        {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(self.reject(&request, capacity));
        }

        match self.tx.try_send(request) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(request)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(self.reject(&request, self.capacity.unwrap_or_default()))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(ZjsError::QueueDisconnected)
            }
        }
    }

    fn reject(&self, request: &CallbackRequest, capacity: usize) -> ZjsError {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(target_fn = request.target.name(), capacity, "Callback queue full");
        ZjsError::QueueFull { capacity }
    }
}

/// Multi-producer, single-consumer queue of callback requests
pub struct CallbackQueue {
    sender: CallbackSender,
    rx: Receiver<CallbackRequest>,
    /// Head request picked up by `wait_for_work`
    held: Mutex<Option<CallbackRequest>>,
    draining: AtomicBool,
}

impl CallbackQueue {
    /// Unbounded queue
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Queue refusing requests once `capacity` are pending
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        Self {
            sender: CallbackSender {
                tx,
                capacity,
                pending: Arc::new(AtomicUsize::new(0)),
                stats: Arc::new(QueueStats::default()),
            },
            rx,
            held: Mutex::new(None),
            draining: AtomicBool::new(false),
        }
    }

    /// Handle for producers on other threads
    pub fn sender(&self) -> CallbackSender {
        self.sender.clone()
    }

    pub fn enqueue(&self, request: CallbackRequest) -> ZjsResult<()> {
        self.sender.enqueue(request)
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.rx.len() + usize::from(self.held.lock().is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.sender.capacity
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.sender.stats.snapshot()
    }

    /// Block until a request is pending or `timeout` elapses. Returns whether
    /// work is pending. Never dispatches anything.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(request) => {
                // The channel was empty, so this request is the head.
                *self.held.lock() = Some(request);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            // The queue owns a sender, so this cannot happen while it lives.
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Dispatch every request pending at the time of the call, in FIFO order.
    ///
    /// Must only be called from the script context. Fails with
    /// [`ZjsError::ReentrantDrain`] if called from inside a dispatcher.
    pub fn drain_all(&self) -> ZjsResult<DrainReport> {
        if self.draining.swap(true, Ordering::Acquire) {
            error!("drain_all called while already draining");
            return Err(ZjsError::ReentrantDrain);
        }
        let _guard = DrainGuard(&self.draining);
        let _span = debug_span!("drain_callbacks").entered();

        let mut report = DrainReport::default();
        let head = self.held.lock().take();
        let backlog = self.rx.len();
        let requests = head
            .into_iter()
            .chain(std::iter::from_fn(|| self.rx.try_recv().ok()).take(backlog));
        for request in requests {
            self.dispatch(request, &mut report);
        }

        if report.processed() > 0 {
            debug!(
                invoked = report.invoked,
                failed = report.failed,
                dropped = report.dropped,
                "Drained callback queue"
            );
        }
        Ok(report)
    }

    fn dispatch(&self, request: CallbackRequest, report: &mut DrainReport) {
        let stats = &self.sender.stats;
        self.sender.pending.fetch_sub(1, Ordering::AcqRel);
        let CallbackRequest {
            target,
            invoke,
            payload,
        } = request;

        let Some(dispatcher) = invoke else {
            let defect = ZjsError::MissingDispatcher {
                target: target.name().to_string(),
            };
            error!(error = %defect, "Dropping callback request");
            report.dropped += 1;
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        report.invoked += 1;
        stats.invoked.fetch_add(1, Ordering::Relaxed);
        let result = match catch_unwind(AssertUnwindSafe(|| dispatcher(&target, payload))) {
            Ok(result) => result,
            Err(panic) => Err(ZjsError::callback(target.name(), panic_message(&*panic))),
        };
        if let Err(e) = result {
            warn!(target_fn = target.name(), error = %e, "Callback failed");
            report.failed += 1;
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        // `target` drops here, releasing the request's reference.
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: unknown error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: &Arc<Mutex<Vec<f64>>>) -> JsFunction {
        let log = Arc::clone(log);
        JsFunction::new("record", move |_this, args| {
            let n = args.first().and_then(JsValue::as_number).unwrap_or(-1.0);
            log.lock().push(n);
            Ok(JsValue::Undefined)
        })
    }

    fn arg(n: f64) -> Payload {
        Payload::Args(vec![JsValue::Number(n)])
    }

    #[test]
    fn test_fifo_drain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = CallbackQueue::new();
        let func = recorder(&log);

        for i in 0..5 {
            queue
                .enqueue(CallbackRequest::new(func.clone(), arg(i as f64)))
                .unwrap();
        }
        assert_eq!(queue.len(), 5);

        let report = queue.drain_all().unwrap();
        assert_eq!(report.invoked, 5);
        assert_eq!(report.failed, 0);
        assert!(queue.is_empty());
        assert_eq!(*log.lock(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_missing_dispatcher_is_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = CallbackQueue::new();
        let func = recorder(&log);

        queue.enqueue(CallbackRequest::new(func.clone(), arg(1.0))).unwrap();
        queue
            .enqueue(CallbackRequest {
                target: func.clone(),
                invoke: None,
                payload: arg(2.0),
            })
            .unwrap();
        queue.enqueue(CallbackRequest::new(func, arg(3.0))).unwrap();

        let report = queue.drain_all().unwrap();
        assert_eq!(report, DrainReport { invoked: 2, failed: 0, dropped: 1 });
        assert_eq!(*log.lock(), vec![1.0, 3.0]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_failing_and_panicking_dispatchers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let queue = CallbackQueue::new();
        let counter = {
            let hits = Arc::clone(&hits);
            JsFunction::new("count", move |_this, _args| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(JsValue::Undefined)
            })
        };
        let failing = JsFunction::new("fail", |_this, _args| {
            Err(ZjsError::callback("fail", "thrown"))
        });

        queue.enqueue(CallbackRequest::new(failing, Payload::None)).unwrap();
        queue
            .enqueue(CallbackRequest::with_dispatcher(
                counter.clone(),
                Payload::None,
                |_target, _payload| panic!("dispatcher blew up"),
            ))
            .unwrap();
        queue.enqueue(CallbackRequest::new(counter, Payload::None)).unwrap();

        let report = queue.drain_all().unwrap();
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Guard released even though a dispatcher panicked
        assert!(queue.drain_all().is_ok());
    }

    #[test]
    fn test_enqueue_during_drain_waits_for_next_drain() {
        let queue = Arc::new(CallbackQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = recorder(&log);
        let sender = queue.sender();

        let outer = JsFunction::new("outer", move |_this, _args| {
            sender.enqueue(CallbackRequest::new(inner.clone(), arg(2.0)))?;
            Ok(JsValue::Undefined)
        });
        queue.enqueue(CallbackRequest::new(outer, Payload::None)).unwrap();

        assert_eq!(queue.drain_all().unwrap().invoked, 1);
        assert!(log.lock().is_empty());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain_all().unwrap().invoked, 1);
        assert_eq!(*log.lock(), vec![2.0]);
    }

    #[test]
    fn test_reentrant_drain_refused() {
        let queue = Arc::new(CallbackQueue::new());
        let seen = Arc::new(Mutex::new(None));
        let func = {
            let queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            JsFunction::new("reenter", move |_this, _args| {
                *seen.lock() = Some(matches!(queue.drain_all(), Err(ZjsError::ReentrantDrain)));
                Ok(JsValue::Undefined)
            })
        };
        queue.enqueue(CallbackRequest::new(func, Payload::None)).unwrap();

        queue.drain_all().unwrap();
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_bounded_queue_refuses_without_blocking() {
        let queue = CallbackQueue::bounded(2);
        let func = JsFunction::new("noop", |_this, _args| Ok(JsValue::Undefined));

        queue.enqueue(CallbackRequest::new(func.clone(), Payload::None)).unwrap();
        queue.enqueue(CallbackRequest::new(func.clone(), Payload::None)).unwrap();
        let err = queue
            .enqueue(CallbackRequest::new(func.clone(), Payload::None))
            .unwrap_err();
        assert!(matches!(err, ZjsError::QueueFull { capacity: 2 }));

        // Rejected request released its reference on the target
        assert_eq!(func.ref_count(), 3);
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.drain_all().unwrap().invoked, 2);
        assert_eq!(func.ref_count(), 1);
    }

    #[test]
    fn test_bounded_capacity_counts_waited_request() {
        let queue = CallbackQueue::bounded(1);
        assert_eq!(queue.capacity(), Some(1));
        let func = JsFunction::new("noop", |_this, _args| Ok(JsValue::Undefined));

        let sender = queue.sender();
        let first = func.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.enqueue(CallbackRequest::new(first, Payload::None)).unwrap();
        });
        assert!(queue.wait_for_work(Duration::from_secs(5)));
        producer.join().unwrap();

        // The request moved out of the channel still occupies the only slot
        assert!(matches!(
            queue.enqueue(CallbackRequest::new(func.clone(), Payload::None)),
            Err(ZjsError::QueueFull { capacity: 1 })
        ));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain_all().unwrap().invoked, 1);
        assert!(queue.enqueue(CallbackRequest::new(func, Payload::None)).is_ok());
    }

    #[test]
    fn test_wait_for_work_keeps_fifo() {
        let queue = CallbackQueue::new();
        assert!(!queue.wait_for_work(Duration::from_millis(5)));

        let log = Arc::new(Mutex::new(Vec::new()));
        let func = recorder(&log);
        let sender = queue.sender();
        let producer = std::thread::spawn(move || {
            sender.enqueue(CallbackRequest::new(func.clone(), arg(1.0))).unwrap();
            sender.enqueue(CallbackRequest::new(func, arg(2.0))).unwrap();
        });

        assert!(queue.wait_for_work(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(queue.len(), 2);

        queue.drain_all().unwrap();
        assert_eq!(*log.lock(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_gpio_payload_arguments() {
        let args = Payload::GpioEdge { pin: 4, value: true }.into_args();
        let event = args[0].as_object().unwrap();
        assert_eq!(event.get("pin").as_number(), Some(4.0));
        assert_eq!(event.get("value").as_bool(), Some(true));

        let args = Payload::Analog { pin: 0, value: 512.0 }.into_args();
        assert_eq!(args, vec![JsValue::Number(512.0)]);
        let args = Payload::Timer { id: 7, args: vec![JsValue::from("a")] }.into_args();
        assert_eq!(args, vec![JsValue::from("a")]);
        assert!(Payload::None.into_args().is_empty());
    }
}
