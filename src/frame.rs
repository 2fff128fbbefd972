//! Lexically-chained environment frames and the cooperative runtime guard.
//!
//! Lookup walks up the parent chain; bind only ever writes the innermost
//! frame. Frames form a read-mostly tree: each evaluation branch owns its own
//! chain, and closures only read ancestor frames after creation, so no
//! locking is involved anywhere.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::value::Value;

/// An environment frame. Cloning shares the underlying bindings.
#[derive(Debug, Clone)]
pub struct Frame {
    inner: Rc<FrameData>,
}

#[derive(Debug)]
struct FrameData {
    bindings: RefCell<HashMap<String, Value>>,
    parent: Option<Frame>,
    timebox: RefCell<Option<Rc<Timebox>>>,
    /// Re-entrant evaluation fanned out by an array/object constructor; such
    /// entries must not double-count recursion depth.
    parallel: Cell<bool>,
}

impl Frame {
    pub fn new() -> Frame {
        Frame {
            inner: Rc::new(FrameData {
                bindings: RefCell::new(HashMap::new()),
                parent: None,
                timebox: RefCell::new(None),
                parallel: Cell::new(false),
            }),
        }
    }

    /// A child frame; inherits the parent's runtime bounds.
    pub fn with_parent(parent: &Frame) -> Frame {
        Frame {
            inner: Rc::new(FrameData {
                bindings: RefCell::new(HashMap::new()),
                parent: Some(parent.clone()),
                timebox: RefCell::new(parent.inner.timebox.borrow().clone()),
                parallel: Cell::new(false),
            }),
        }
    }

    /// Bind a value in this frame only.
    pub fn bind(&self, name: impl Into<String>, value: Value) {
        self.inner.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Look a name up, walking the parent chain.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.bindings.borrow().get(name) {
            return Some(value.clone());
        }
        self.inner.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// Install the cooperative runtime guard on this frame. Frames created
    /// below it afterwards inherit the guard.
    pub fn set_runtime_bounds(&self, timeout_ms: u64, max_depth: usize) {
        *self.inner.timebox.borrow_mut() = Some(Rc::new(Timebox::new(timeout_ms, max_depth)));
    }

    pub(crate) fn timebox(&self) -> Option<Rc<Timebox>> {
        self.inner.timebox.borrow().clone()
    }

    pub(crate) fn is_parallel(&self) -> bool {
        self.inner.parallel.get()
    }

    pub(crate) fn set_parallel(&self, parallel: bool) {
        self.inner.parallel.set(parallel);
    }
}

impl Default for Frame {
    fn default() -> Frame {
        Frame::new()
    }
}

/// Protects evaluation from runaway expressions: an infinite loop, unbounded
/// (non-tail) recursion, or excessive stack growth. Depth is tracked at
/// evaluation entry/exit; elapsed wall-clock time is checked on every
/// transition.
#[derive(Debug)]
pub struct Timebox {
    timeout: Duration,
    max_depth: usize,
    start: Instant,
    depth: Cell<usize>,
}

impl Timebox {
    pub fn new(timeout_ms: u64, max_depth: usize) -> Timebox {
        Timebox {
            timeout: Duration::from_millis(timeout_ms),
            max_depth,
            start: Instant::now(),
            depth: Cell::new(0),
        }
    }

    pub fn enter(&self) -> Result<(), Error> {
        self.depth.set(self.depth.get() + 1);
        self.check()
    }

    pub fn exit(&self) -> Result<(), Error> {
        self.depth.set(self.depth.get().saturating_sub(1));
        self.check()
    }

    fn check(&self) -> Result<(), Error> {
        if self.depth.get() > self.max_depth {
            return Err(Error::new("U1001", None));
        }
        if self.start.elapsed() > self.timeout {
            return Err(Error::new("U1002", None));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parent_chain() {
        let root = Frame::new();
        root.bind("x", Value::Integer(1));
        let child = Frame::with_parent(&root);
        child.bind("y", Value::Integer(2));
        assert_eq!(child.lookup("x"), Some(Value::Integer(1)));
        assert_eq!(child.lookup("y"), Some(Value::Integer(2)));
        assert_eq!(root.lookup("y"), None);
    }

    #[test]
    fn bind_shadows_without_touching_parent() {
        let root = Frame::new();
        root.bind("x", Value::Integer(1));
        let child = Frame::with_parent(&root);
        child.bind("x", Value::Integer(9));
        assert_eq!(child.lookup("x"), Some(Value::Integer(9)));
        assert_eq!(root.lookup("x"), Some(Value::Integer(1)));
    }

    #[test]
    fn timebox_limits_depth() {
        let tb = Timebox::new(10_000, 2);
        tb.enter().unwrap();
        tb.enter().unwrap();
        assert_eq!(tb.enter().unwrap_err().code, "U1001");
    }
}
