//! `setTimeout` / `setInterval` and their `clear*` counterparts.
//!
//! Timers never call script code directly. When a timer expires,
//! [`Timers::process_events`] turns it into a request on the callback queue,
//! so timer callbacks are serialized with every other deferred callback.

use crate::error::{ZjsError, ZjsResult};
use crate::queue::{CallbackRequest, CallbackSender, Payload};
use crate::value::{JsFunction, JsObject, JsValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Script-visible timer id
pub type TimerId = u64;

/// Timer table shared with the binding closures
pub type SharedTimers = Arc<Mutex<Timers>>;

#[derive(Debug)]
struct TimerEntry {
    callback: JsFunction,
    args: Vec<JsValue>,
    deadline: Instant,
    /// Set for `setInterval` timers
    interval: Option<Duration>,
}

/// Pending timers
#[derive(Debug)]
pub struct Timers {
    entries: HashMap<TimerId, TimerEntry>,
    next_id: TimerId,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn shared(self) -> SharedTimers {
        Arc::new(Mutex::new(self))
    }

    /// Schedule `callback(args...)` after `delay`, repeating every `delay`
    /// when `repeat` is set.
    pub fn add(
        &mut self,
        callback: JsFunction,
        delay: Duration,
        repeat: bool,
        args: Vec<JsValue>,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, delay_ms = delay.as_millis() as u64, repeat, "Timer added");
        self.entries.insert(
            id,
            TimerEntry {
                callback,
                args,
                deadline: Instant::now() + delay,
                interval: repeat.then_some(delay),
            },
        );
        id
    }

    /// Cancel a timer. Returns false for unknown ids.
    pub fn clear(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Queue a callback request for every timer expired at `now`, in
    /// deadline order. Intervals are rearmed from `now`; timeouts are
    /// removed. A timer whose request the queue refuses stays expired and is
    /// retried on the next call. Returns the time until the next deadline, if
    /// any timer remains.
    pub fn process_events(&mut self, now: Instant, queue: &CallbackSender) -> Option<Duration> {
        let mut expired: Vec<(Instant, TimerId)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, entry)| (entry.deadline, *id))
            .collect();
        expired.sort_unstable();

        for (_, id) in expired {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let payload = Payload::Timer {
                id,
                args: entry.args.clone(),
            };
            let request = CallbackRequest::new(entry.callback.clone(), payload);
            if let Err(e) = queue.enqueue(request) {
                warn!(id, error = %e, "Could not queue timer callback, retrying");
                continue;
            }
            let interval = entry.interval;
            match interval {
                Some(interval) => entry.deadline = now + interval,
                None => {
                    self.entries.remove(&id);
                }
            }
        }

        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach `setTimeout`, `setInterval`, `clearTimeout` and `clearInterval`.
pub fn install(global: &JsObject, timers: SharedTimers) {
    let t = Arc::clone(&timers);
    global.define_function("setTimeout", move |_this, args| {
        add_timer(&t, "setTimeout", args, false)
    });
    let t = Arc::clone(&timers);
    global.define_function("setInterval", move |_this, args| {
        add_timer(&t, "setInterval", args, true)
    });
    let t = Arc::clone(&timers);
    global.define_function("clearTimeout", move |_this, args| {
        clear_timer(&t, "clearTimeout", args)
    });
    global.define_function("clearInterval", move |_this, args| {
        clear_timer(&timers, "clearInterval", args)
    });
}

fn add_timer(
    timers: &SharedTimers,
    function: &'static str,
    args: &[JsValue],
    repeat: bool,
) -> ZjsResult<JsValue> {
    let (callback, ms, extra) = match args {
        [JsValue::Function(callback), JsValue::Number(ms), extra @ ..] => (callback, *ms, extra),
        _ => {
            return Err(ZjsError::invalid_arguments(
                function,
                "expected (function, milliseconds, ...args)",
            ));
        }
    };
    let delay = if ms.is_finite() && ms > 0.0 {
        Duration::from_millis(ms as u64)
    } else {
        Duration::ZERO
    };

    let id = timers
        .lock()
        .add(callback.clone(), delay, repeat, extra.to_vec());
    Ok(JsValue::Number(id as f64))
}

fn clear_timer(timers: &SharedTimers, function: &'static str, args: &[JsValue]) -> ZjsResult<JsValue> {
    let id = match args.first() {
        Some(JsValue::Number(n)) if n.is_finite() && *n >= 1.0 && n.fract() == 0.0 => {
            *n as TimerId
        }
        _ => return Err(ZjsError::invalid_arguments(function, "expected a timer id")),
    };
    if timers.lock().clear(id) {
        Ok(JsValue::Undefined)
    } else {
        Err(ZjsError::NotFound(format!("timer {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CallbackQueue;

    fn noop() -> JsFunction {
        JsFunction::new("noop", |_this, _args| Ok(JsValue::Undefined))
    }

    #[test]
    fn test_timeout_fires_once() {
        let queue = CallbackQueue::new();
        let mut timers = Timers::new();
        timers.add(noop(), Duration::ZERO, false, Vec::new());

        let wait = timers.process_events(Instant::now(), &queue.sender());
        assert!(wait.is_none());
        assert!(timers.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_interval_rearms() {
        let queue = CallbackQueue::new();
        let mut timers = Timers::new();
        let id = timers.add(noop(), Duration::from_millis(10), true, Vec::new());

        let later = Instant::now() + Duration::from_millis(20);
        let wait = timers.process_events(later, &queue.sender());
        assert_eq!(wait, Some(Duration::from_millis(10)));
        assert_eq!(queue.len(), 1);
        assert_eq!(timers.len(), 1);

        assert!(timers.clear(id));
        assert!(!timers.clear(id));
    }

    #[test]
    fn test_refused_timer_is_retried() {
        let queue = CallbackQueue::bounded(1);
        let mut timers = Timers::new();
        queue.enqueue(CallbackRequest::new(noop(), Payload::None)).unwrap();
        timers.add(noop(), Duration::ZERO, false, Vec::new());

        let now = Instant::now();
        assert_eq!(timers.process_events(now, &queue.sender()), Some(Duration::ZERO));
        assert_eq!(timers.len(), 1);

        queue.drain_all().unwrap();
        assert_eq!(timers.process_events(now, &queue.sender()), None);
        assert!(timers.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_not_yet_due() {
        let queue = CallbackQueue::new();
        let mut timers = Timers::new();
        timers.add(noop(), Duration::from_secs(60), false, Vec::new());

        let wait = timers.process_events(Instant::now(), &queue.sender()).unwrap();
        assert!(wait > Duration::from_secs(59));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let queue = CallbackQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = Timers::new();
        for (name, delay) in [("slow", 30), ("fast", 10), ("mid", 20)] {
            let log = Arc::clone(&log);
            let func = JsFunction::new(name, move |_this, _args| {
                log.lock().push(name);
                Ok(JsValue::Undefined)
            });
            timers.add(func, Duration::from_millis(delay), false, Vec::new());
        }

        timers.process_events(Instant::now() + Duration::from_millis(50), &queue.sender());
        queue.drain_all().unwrap();
        assert_eq!(*log.lock(), vec!["fast", "mid", "slow"]);
    }

    #[test]
    fn test_bindings_validate_arguments() {
        let timers = Timers::new().shared();
        let global = JsObject::new();
        install(&global, Arc::clone(&timers));

        assert!(global.call_method("setTimeout", &[JsValue::from(5u32)]).is_err());
        assert!(
            global
                .call_method("setTimeout", &[JsValue::from(noop()), JsValue::from("5")])
                .is_err()
        );

        let id = global
            .call_method("setInterval", &[JsValue::from(noop()), JsValue::from(5u32)])
            .unwrap();
        assert_eq!(timers.lock().len(), 1);

        assert!(global.call_method("clearInterval", &[id.clone()]).is_ok());
        assert!(matches!(
            global.call_method("clearInterval", &[id]),
            Err(ZjsError::NotFound(_))
        ));
        assert!(global.call_method("clearTimeout", &[]).is_err());

        let id = global
            .call_method("setTimeout", &[JsValue::from(noop()), JsValue::from(5u32)])
            .unwrap();
        assert_eq!(id, JsValue::Number(2.0));
        assert!(matches!(
            global.call_method("clearTimeout", &[JsValue::Number(1.5)]),
            Err(ZjsError::InvalidArguments { .. })
        ));
        assert!(matches!(
            global.call_method("clearTimeout", &[JsValue::Number(2.5)]),
            Err(ZjsError::InvalidArguments { .. })
        ));
        assert_eq!(timers.lock().len(), 1);
    }
}
