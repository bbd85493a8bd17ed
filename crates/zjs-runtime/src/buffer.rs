//! Buffer registry and the script-visible `Buffer` binding.
//!
//! Each `Buffer(size)` call allocates a zero-filled, fixed-size byte array and
//! ties it to the returned wrapper object by the object's identity. Only two
//! methods are exposed to scripts: `writeUInt8(value, offset = 0)` and
//! `toString(encoding?)`.
//!
//! Records are released when their wrapper object is finalized: the
//! finalizer only posts the handle on a channel, and the registry applies the
//! release later on the script context, so the record set is never mutated
//! from another thread.

use crate::error::{ZjsError, ZjsResult};
use crate::value::{JsObject, JsValue, ObjectId};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What `toString()` returns when no encoding is given
pub const BUFFER_PLACEHOLDER: &str = "[Buffer Object]";

/// Registry shared between the runtime and the native binding closures
pub type SharedBufferRegistry = Arc<Mutex<BufferRegistry>>;

/// Native storage tied to one wrapper object
#[derive(Debug)]
pub struct BufferRecord {
    handle: ObjectId,
    storage: Box<[u8]>,
}

impl BufferRecord {
    pub fn handle(&self) -> ObjectId {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.storage
    }
}

/// Registry of live buffers keyed by wrapper identity
pub struct BufferRegistry {
    records: HashMap<ObjectId, BufferRecord>,
    allocated: usize,
    memory_limit: Option<usize>,
    release_tx: Sender<ObjectId>,
    release_rx: Receiver<ObjectId>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::with_memory_limit(None)
    }

    /// Create a registry whose live buffers may hold at most `limit` bytes
    pub fn with_memory_limit(limit: Option<usize>) -> Self {
        let (release_tx, release_rx) = unbounded();
        Self {
            records: HashMap::new(),
            allocated: 0,
            memory_limit: limit,
            release_tx,
            release_rx,
        }
    }

    /// Wrap the registry for sharing with binding closures
    pub fn shared(self) -> SharedBufferRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Allocate `size` zeroed bytes and a new wrapper object owning them.
    ///
    /// Nothing is retained on failure.
    pub fn create(&mut self, size: usize) -> ZjsResult<JsObject> {
        self.collect_released();

        let within_budget = match self.memory_limit {
            Some(limit) => self
                .allocated
                .checked_add(size)
                .is_some_and(|total| total <= limit),
            None => true,
        };
        if !within_budget {
            warn!(
                size,
                allocated = self.allocated,
                limit = ?self.memory_limit,
                "Buffer memory limit reached"
            );
            return Err(ZjsError::Allocation { size });
        }

        let mut storage = Vec::new();
        if storage.try_reserve_exact(size).is_err() {
            warn!(size, "Allocator refused buffer storage");
            return Err(ZjsError::Allocation { size });
        }
        storage.resize(size, 0);

        let handle = JsObject::new();
        let release_tx = self.release_tx.clone();
        handle.add_finalizer(move |id| {
            // The registry may already be gone during teardown.
            let _ = release_tx.send(id);
        });

        self.records.insert(
            handle.id(),
            BufferRecord {
                handle: handle.id(),
                storage: storage.into_boxed_slice(),
            },
        );
        self.allocated += size;
        debug!(handle = %handle.id(), size, "Buffer created");
        Ok(handle)
    }

    pub fn lookup(&self, handle: ObjectId) -> Option<&BufferRecord> {
        self.records.get(&handle)
    }

    /// Store `value` at `offset` and return the next offset.
    pub fn write_u8(&mut self, handle: ObjectId, value: u8, offset: usize) -> ZjsResult<usize> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or_else(|| ZjsError::NotFound(format!("buffer {handle}")))?;
        let size = record.storage.len();
        let slot = record
            .storage
            .get_mut(offset)
            .ok_or(ZjsError::OutOfBounds { offset, size })?;
        *slot = value;
        Ok(offset + 1)
    }

    /// Render the buffer. `None` yields [`BUFFER_PLACEHOLDER`]; `"hex"`
    /// yields two lowercase digits per byte for buffers larger than one byte.
    pub fn to_hex_string(&self, handle: ObjectId, encoding: Option<&str>) -> ZjsResult<String> {
        let record = self
            .lookup(handle)
            .ok_or_else(|| ZjsError::NotFound(format!("buffer {handle}")))?;
        match encoding {
            None => Ok(BUFFER_PLACEHOLDER.to_string()),
            Some("hex") if record.size() > 1 => Ok(hex::encode(&record.storage)),
            Some("hex") => Err(ZjsError::BufferTooSmall {
                size: record.size(),
            }),
            Some(other) => Err(ZjsError::UnsupportedEncoding(other.to_string())),
        }
    }

    /// Drop the record for `handle`, returning its bytes to the budget.
    pub fn release(&mut self, handle: ObjectId) -> bool {
        match self.records.remove(&handle) {
            Some(record) => {
                self.allocated -= record.size();
                debug!(handle = %handle, size = record.size(), "Buffer released");
                true
            }
            None => false,
        }
    }

    /// Apply releases posted by finalizers since the last call.
    pub fn collect_released(&mut self) -> usize {
        let mut released = 0;
        while let Ok(handle) = self.release_rx.try_recv() {
            if self.release(handle) {
                released += 1;
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach the global `Buffer` constructor.
pub fn install(global: &JsObject, registry: SharedBufferRegistry) {
    global.define_function("Buffer", move |_this, args| {
        buffer_constructor(&registry, args)
    });
}

fn buffer_constructor(registry: &SharedBufferRegistry, args: &[JsValue]) -> ZjsResult<JsValue> {
    let size = match args {
        [JsValue::Number(n)] => to_index(*n)
            .ok_or_else(|| ZjsError::invalid_arguments("Buffer", format!("bad size {n}")))?,
        _ => {
            return Err(ZjsError::invalid_arguments(
                "Buffer",
                "expected a single numeric size",
            ));
        }
    };

    let handle = registry.lock().create(size)?;

    let write_registry = Arc::clone(registry);
    handle.define_function("writeUInt8", move |this, args| {
        write_uint8(&write_registry, this, args)
    });
    let read_registry = Arc::clone(registry);
    handle.define_function("toString", move |this, args| {
        to_string(&read_registry, this, args)
    });

    Ok(JsValue::Object(handle))
}

fn write_uint8(registry: &SharedBufferRegistry, this: &JsValue, args: &[JsValue]) -> ZjsResult<JsValue> {
    let value = match args.first() {
        Some(JsValue::Number(v)) => truncate_to_byte(*v),
        _ => {
            return Err(ZjsError::invalid_arguments(
                "writeUInt8",
                "value must be a number",
            ));
        }
    };
    let offset = match args.get(1) {
        None => 0,
        Some(JsValue::Number(n)) => to_index(*n).ok_or_else(|| {
            ZjsError::invalid_arguments("writeUInt8", format!("bad offset {n}"))
        })?,
        Some(other) => {
            return Err(ZjsError::invalid_arguments(
                "writeUInt8",
                format!("offset must be a number, got {}", other.type_name()),
            ));
        }
    };

    let handle = this_handle("writeUInt8", this)?;
    let next = registry.lock().write_u8(handle, value, offset)?;
    Ok(JsValue::from(next))
}

fn to_string(registry: &SharedBufferRegistry, this: &JsValue, args: &[JsValue]) -> ZjsResult<JsValue> {
    let encoding = match args {
        [] => None,
        [JsValue::String(s)] => Some(s.as_ref()),
        _ => {
            return Err(ZjsError::invalid_arguments(
                "Buffer toString",
                "expected at most one string encoding",
            ));
        }
    };

    let handle = this_handle("Buffer toString", this)?;
    let rendered = registry.lock().to_hex_string(handle, encoding)?;
    Ok(JsValue::from(rendered))
}

fn this_handle(function: &'static str, this: &JsValue) -> ZjsResult<ObjectId> {
    match this {
        JsValue::Object(obj) => Ok(obj.id()),
        other => Err(ZjsError::invalid_arguments(
            function,
            format!("receiver is {}, not a Buffer", other.type_name()),
        )),
    }
}

/// Non-negative finite number to an index, fractions truncated
fn to_index(n: f64) -> Option<usize> {
    if n.is_finite() && n >= 0.0 && n <= u32::MAX as f64 {
        Some(n.trunc() as usize)
    } else {
        None
    }
}

/// Modulo-256 truncation; non-finite values become 0
fn truncate_to_byte(v: f64) -> u8 {
    if v.is_finite() { (v.trunc() as i64) as u8 } else { 0 }
}
