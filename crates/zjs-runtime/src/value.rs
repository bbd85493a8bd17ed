//! Host value model.
//!
//! The script engine itself lives outside this crate. The bindings are
//! written against this small model of its value/object/function API: a
//! tagged union of values, objects with reference identity and finalizer
//! hooks, and named native functions. Field lookups return
//! [`JsValue::Undefined`] for missing properties; absence is never signalled
//! through a side channel.

use crate::error::{ZjsError, ZjsResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a script object.
///
/// Assigned once at allocation and never reused, so two handles compare
/// equal only if they refer to the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Closure run once when the last reference to an object goes away
pub type Finalizer = Box<dyn FnOnce(ObjectId) + Send>;

/// Native function body: `(this, args) -> result`
pub type NativeFn = Arc<dyn Fn(&JsValue, &[JsValue]) -> ZjsResult<JsValue> + Send + Sync>;

struct ObjectInner {
    id: ObjectId,
    properties: Mutex<HashMap<String, JsValue>>,
    finalizers: Mutex<Vec<Finalizer>>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        let id = self.id;
        for finalizer in self.finalizers.get_mut().drain(..) {
            finalizer(id);
        }
    }
}

/// Reference-counted script object
#[derive(Clone)]
pub struct JsObject {
    inner: Arc<ObjectInner>,
}

impl JsObject {
    /// Allocate a new empty object with a fresh identity
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
                properties: Mutex::new(HashMap::new()),
                finalizers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identity of this object
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &JsObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read a property; missing properties read as `Undefined`
    pub fn get(&self, name: &str) -> JsValue {
        self.inner
            .properties
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Write a property
    pub fn set(&self, name: &str, value: impl Into<JsValue>) {
        self.inner
            .properties
            .lock()
            .insert(name.to_string(), value.into());
    }

    /// Whether the property exists (even if it holds `undefined`)
    pub fn has(&self, name: &str) -> bool {
        self.inner.properties.lock().contains_key(name)
    }

    /// Attach a native function as a property
    pub fn define_function<F>(&self, name: &str, func: F)
    where
        F: Fn(&JsValue, &[JsValue]) -> ZjsResult<JsValue> + Send + Sync + 'static,
    {
        self.set(name, JsFunction::new(name, func));
    }

    /// Register a finalizer, run when the last handle is dropped
    pub fn add_finalizer<F>(&self, finalizer: F)
    where
        F: FnOnce(ObjectId) + Send + 'static,
    {
        self.inner.finalizers.lock().push(Box::new(finalizer));
    }

    /// Call the function stored under `name` with this object as `this`
    pub fn call_method(&self, name: &str, args: &[JsValue]) -> ZjsResult<JsValue> {
        match self.get(name) {
            JsValue::Function(func) => func.call(&JsValue::Object(self.clone()), args),
            other => Err(ZjsError::callback(
                name,
                format!("property is {}, not a function", other.type_name()),
            )),
        }
    }
}

impl Default for JsObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.inner.properties.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("JsObject")
            .field("id", &self.inner.id)
            .field("properties", &names)
            .finish()
    }
}

struct FunctionInner {
    name: String,
    func: NativeFn,
}

/// Callable script function backed by a native closure
#[derive(Clone)]
pub struct JsFunction {
    inner: Arc<FunctionInner>,
}

impl JsFunction {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&JsValue, &[JsValue]) -> ZjsResult<JsValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: name.to_string(),
                func: Arc::new(func),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn call(&self, this: &JsValue, args: &[JsValue]) -> ZjsResult<JsValue> {
        (self.inner.func)(this, args)
    }

    pub fn ptr_eq(&self, other: &JsFunction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live references, including this one
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for JsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsFunction({})", self.inner.name)
    }
}

/// A script value
#[derive(Clone, Debug, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Arc<str>),
    Object(JsObject),
    Function(JsFunction),
}

impl JsValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            JsValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&JsFunction> {
        match self {
            JsValue::Function(func) => Some(func),
            _ => None,
        }
    }

    /// `typeof`-style name of the variant
    pub fn type_name(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "null",
            JsValue::Boolean(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Object(_) => "object",
            JsValue::Function(_) => "function",
        }
    }
}

/// Strict equality: primitives by value, objects and functions by identity
impl PartialEq for JsValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) => true,
            (JsValue::Null, JsValue::Null) => true,
            (JsValue::Boolean(a), JsValue::Boolean(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Object(a), JsValue::Object(b)) => a.ptr_eq(b),
            (JsValue::Function(a), JsValue::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Boolean(b)
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<u32> for JsValue {
    fn from(n: u32) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<usize> for JsValue {
    fn from(n: usize) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::String(Arc::from(s))
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(Arc::from(s))
    }
}

impl From<JsObject> for JsValue {
    fn from(obj: JsObject) -> Self {
        JsValue::Object(obj)
    }
}

impl From<JsFunction> for JsValue {
    fn from(func: JsFunction) -> Self {
        JsValue::Function(func)
    }
}
