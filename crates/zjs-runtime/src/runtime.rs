//! Runtime context and main service loop.
//!
//! The [`Runtime`] owns everything the bindings share: the global object,
//! the buffer registry, the timer table and the callback queue. It is the
//! one script context; other threads only get a [`CallbackSender`].
//!
//! Each loop iteration drains the callback queue, fires expired timers (which
//! enqueue more callbacks) and drains again, so a callback that creates a
//! timer is seen by the same iteration. Between iterations the loop blocks
//! until the next timer deadline or until new work arrives.

use crate::buffer::{self, BufferRegistry, SharedBufferRegistry};
use crate::config::RuntimeConfig;
use crate::error::ZjsResult;
use crate::queue::{CallbackQueue, CallbackRequest, CallbackSender, DrainReport, QueueStatsSnapshot};
use crate::timers::{self, SharedTimers, Timers};
use crate::value::{JsObject, JsValue};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span};

/// Result of one [`Runtime::service`] iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    /// Whether any callback ran or any timer is still pending
    pub serviced: bool,
    /// Time until the next timer deadline
    pub wait: Option<Duration>,
    /// Callback requests handled across both drains
    pub callbacks: DrainReport,
}

/// Why [`Runtime::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Two consecutive iterations found no timers or callbacks
    Idle,
    /// The configured `exit_after` elapsed
    Deadline,
}

pub struct Runtime {
    config: RuntimeConfig,
    global: JsObject,
    buffers: SharedBufferRegistry,
    timers: SharedTimers,
    queue: CallbackQueue,
}

impl Runtime {
    /// Create the runtime and install the global bindings.
    pub fn new(config: RuntimeConfig) -> Self {
        let global = JsObject::new();
        let buffers = BufferRegistry::with_memory_limit(config.buffer_memory_limit).shared();
        let timers = Timers::new().shared();
        let queue = CallbackQueue::with_capacity(config.queue_capacity);

        buffer::install(&global, buffers.clone());
        timers::install(&global, timers.clone());
        debug!(?config, "Runtime initialized");

        Self {
            config,
            global,
            buffers,
            timers,
            queue,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn global(&self) -> &JsObject {
        &self.global
    }

    pub fn buffers(&self) -> &SharedBufferRegistry {
        &self.buffers
    }

    pub fn timers(&self) -> &SharedTimers {
        &self.timers
    }

    pub fn queue(&self) -> &CallbackQueue {
        &self.queue
    }

    /// Enqueue handle for event sources on other threads
    pub fn callback_sender(&self) -> CallbackSender {
        self.queue.sender()
    }

    pub fn enqueue(&self, request: CallbackRequest) -> ZjsResult<()> {
        self.queue.enqueue(request)
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    /// Call a global function with the global object as `this`.
    pub fn call_global(&self, name: &str, args: &[JsValue]) -> ZjsResult<JsValue> {
        self.global.call_method(name, args)
    }

    /// Run one loop iteration.
    pub fn service(&self) -> ZjsResult<Tick> {
        self.buffers.lock().collect_released();

        let first = self.queue.drain_all()?;
        let wait = self
            .timers
            .lock()
            .process_events(Instant::now(), &self.queue.sender());
        let second = self.queue.drain_all()?;

        let callbacks = DrainReport {
            invoked: first.invoked + second.invoked,
            failed: first.failed + second.failed,
            dropped: first.dropped + second.dropped,
        };
        Ok(Tick {
            serviced: callbacks.processed() > 0 || wait.is_some(),
            wait,
            callbacks,
        })
    }

    /// Loop until idle (when auto-exit is on) or until `exit_after` elapses.
    ///
    /// With auto-exit off and no deadline this only returns on error.
    pub fn run(&self) -> ZjsResult<ExitReason> {
        let _span = info_span!("run_loop").entered();
        let deadline = self
            .config
            .exit_after_duration()
            .and_then(|after| Instant::now().checked_add(after));
        let max_wait = self.config.max_idle_wait_duration();
        let mut last_serviced = true;

        loop {
            let tick = self.service()?;

            if self.config.auto_exit && !last_serviced && !tick.serviced {
                info!("No more timers or callbacks found, exiting");
                return Ok(ExitReason::Idle);
            }
            let now = Instant::now();
            if let Some(deadline) = deadline
                && now >= deadline
            {
                info!(
                    exit_after_ms = self.config.exit_after_ms,
                    "Exit deadline reached"
                );
                return Ok(ExitReason::Deadline);
            }
            last_serviced = tick.serviced;

            // An idle iteration under auto-exit is re-checked right away.
            let mut wait = if self.config.auto_exit && !tick.serviced {
                Duration::ZERO
            } else {
                tick.wait.map_or(max_wait, |w| w.min(max_wait))
            };
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            if !wait.is_zero() {
                self.queue.wait_for_work(wait);
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
