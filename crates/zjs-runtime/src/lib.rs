//! zjs-runtime - native bindings and callback bridge for an embedded
//! JavaScript runtime.
//!
//! # Features
//!
//! - **Buffer bindings**: global `Buffer(size)` with `writeUInt8` and
//!   `toString('hex')`, backed by a registry keyed on object identity
//! - **Deferred callbacks**: multi-producer, single-consumer queue that turns
//!   native events into serialized script calls
//! - **Timers**: `setTimeout` / `setInterval` feeding the callback queue
//! - **Main loop**: service iterations with idle auto-exit and deadlines
//!
//! # Example
//!
//! ```
//! use zjs_runtime::{JsValue, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let buf = runtime.call_global("Buffer", &[JsValue::from(4u32)]).unwrap();
//! let buf = buf.as_object().unwrap();
//!
//! buf.call_method("writeUInt8", &[JsValue::from(0xabu32)]).unwrap();
//! let hex = buf.call_method("toString", &[JsValue::from("hex")]).unwrap();
//! assert_eq!(hex.as_str(), Some("ab000000"));
//! ```
//!
//! # Architecture
//!
//! ```text
//!  event sources (any thread)          script context (one thread)
//! ┌──────────────────────────┐        ┌─────────────────────────────┐
//! │ timers, pins, I/O        │        │ Runtime::service            │
//! │   CallbackSender::enqueue├──FIFO─▶│   CallbackQueue::drain_all  │
//! └──────────────────────────┘        │     dispatcher(target, ...) │
//!                                     │       ↓                     │
//!                                     │   Buffer / timer bindings   │
//!                                     └─────────────────────────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod queue;
pub mod runtime;
pub mod timers;
pub mod value;

pub use buffer::{BUFFER_PLACEHOLDER, BufferRecord, BufferRegistry, SharedBufferRegistry};
pub use config::RuntimeConfig;
pub use error::{ZjsError, ZjsResult};
pub use queue::{
    CallbackQueue, CallbackRequest, CallbackSender, Dispatcher, DrainReport, Payload,
    QueueStatsSnapshot, call_with_payload,
};
pub use runtime::{ExitReason, Runtime, Tick};
pub use timers::{SharedTimers, TimerId, Timers};
pub use value::{JsFunction, JsObject, JsValue, ObjectId};

pub mod prelude {
    pub use crate::buffer::{BUFFER_PLACEHOLDER, BufferRegistry};
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{ZjsError, ZjsResult};
    pub use crate::queue::{CallbackQueue, CallbackRequest, CallbackSender, Payload};
    pub use crate::runtime::{ExitReason, Runtime};
    pub use crate::value::{JsFunction, JsObject, JsValue};
}
