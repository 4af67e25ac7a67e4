// Evaluation environment: a chain of binding frames plus the per-evaluation
// supplement (call-depth counter, lazily seeded random source, evaluation
// timestamp). Frames are created fresh per evaluation and shared by the
// closures that capture them; the process-wide builtin catalog lives in
// `functions.rs` and is consulted when frame lookup is exhausted.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::functions::NativeFunction;
use crate::value::{FunctionValue, JValue};

/// Default bound on evaluator recursion depth. Tail-recursive lambdas run in
/// the trampoline and never approach this; it guards non-tail recursion and
/// pathological inputs such as deeply nested literal arrays.
pub const DEFAULT_MAX_DEPTH: usize = 300;

// ── Evaluation supplement ────────────────────────────────────────────────────

/// Per-evaluation state threaded implicitly to every frame created during a
/// single top-level `evaluate` call. Never shared across concurrent
/// evaluations.
pub struct EvalSupplement {
    depth: Cell<usize>,
    max_depth: usize,
    rng: RefCell<Option<StdRng>>,
    /// Captured once so `$now`/`$millis` are stable within one evaluation.
    now: DateTime<Utc>,
}

impl EvalSupplement {
    pub fn new() -> Self {
        EvalSupplement {
            depth: Cell::new(0),
            max_depth: DEFAULT_MAX_DEPTH,
            rng: RefCell::new(None),
            now: Utc::now(),
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        EvalSupplement {
            depth: Cell::new(0),
            max_depth,
            rng: RefCell::new(None),
            now: Utc::now(),
        }
    }

    /// Track entry into a recursive evaluation step. Returns false when the
    /// depth bound is exceeded; the caller raises U1001.
    #[inline]
    pub fn try_enter(&self) -> bool {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        depth <= self.max_depth
    }

    #[inline]
    pub fn exit(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }

    /// Next value from the lazily-initialized random source, in [0, 1).
    pub fn random(&self) -> f64 {
        let mut slot = self.rng.borrow_mut();
        let rng = slot.get_or_insert_with(StdRng::from_os_rng);
        rng.random::<f64>()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn millis(&self) -> i64 {
        self.now.timestamp_millis()
    }
}

impl Default for EvalSupplement {
    fn default() -> Self {
        Self::new()
    }
}

// ── Frame chain ──────────────────────────────────────────────────────────────

/// One binding frame. Lookup walks parent links until found or exhausted,
/// returning `Undefined` on exhaustion — never an error. Parents are shared
/// (multiple closures may capture the same enclosing frame), so frames are
/// reference-counted and live as long as their longest-surviving holder.
pub struct Frame {
    bindings: RefCell<HashMap<String, JValue>>,
    parent: Option<Rc<Frame>>,
    supplement: Rc<EvalSupplement>,
}

impl Frame {
    /// The root frame of an evaluation.
    pub fn new_root(supplement: Rc<EvalSupplement>) -> Rc<Frame> {
        Rc::new(Frame {
            bindings: RefCell::new(HashMap::new()),
            parent: None,
            supplement,
        })
    }

    /// A child frame delegating lookups to `parent`.
    pub fn child(parent: &Rc<Frame>) -> Rc<Frame> {
        Rc::new(Frame {
            bindings: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
            supplement: Rc::clone(&parent.supplement),
        })
    }

    /// Bind or rebind a name in this frame.
    pub fn bind(&self, name: impl Into<String>, value: JValue) {
        self.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Look up a name, walking parent frames. `Undefined` when absent.
    pub fn lookup(&self, name: &str) -> JValue {
        if let Some(value) = self.bindings.borrow().get(name) {
            return value.clone();
        }
        match &self.parent {
            Some(parent) => parent.lookup(name),
            None => JValue::Undefined,
        }
    }

    /// Whether the name is bound anywhere in the chain (distinguishes a
    /// binding to `Undefined` from no binding at all).
    pub fn is_bound(&self, name: &str) -> bool {
        if self.bindings.borrow().contains_key(name) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_bound(name),
            None => false,
        }
    }

    #[inline]
    pub fn supplement(&self) -> &Rc<EvalSupplement> {
        &self.supplement
    }
}

impl std::fmt::Debug for Frame {
    // closures may make the chain cyclic; print only this frame's keys
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.bindings.borrow().keys().cloned().collect();
        write!(f, "<frame {:?}>", keys)
    }
}

// ── Host bindings ────────────────────────────────────────────────────────────

/// Bindings supplied by the host for one evaluation: values and native
/// functions layered on top of the builtin catalog. Rebinding a name
/// replaces the prior binding; there is no removal operation.
#[derive(Default)]
pub struct Bindings {
    entries: Vec<(String, JValue)>,
}

impl Bindings {
    pub fn new() -> Self {
        Bindings {
            entries: Vec::new(),
        }
    }

    /// Bind a plain value.
    pub fn bind_value(mut self, name: impl Into<String>, value: JValue) -> Self {
        self.entries.push((name.into(), value));
        self
    }

    /// Bind a native function built through the bridge.
    pub fn bind_function(mut self, name: impl Into<String>, func: NativeFunction) -> Self {
        self.entries
            .push((name.into(), JValue::function(FunctionValue::Native(func))));
        self
    }

    /// Copy the bindings into a frame.
    pub fn apply_to(&self, frame: &Frame) {
        for (name, value) in &self.entries {
            frame.bind(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Rc<Frame> {
        Frame::new_root(Rc::new(EvalSupplement::new()))
    }

    #[test]
    fn test_lookup_walks_parents() {
        let outer = root();
        outer.bind("x", JValue::Integer(1));
        let inner = Frame::child(&outer);
        assert_eq!(inner.lookup("x"), JValue::Integer(1));
    }

    #[test]
    fn test_shadowing() {
        let outer = root();
        outer.bind("x", JValue::Integer(1));
        let inner = Frame::child(&outer);
        inner.bind("x", JValue::Integer(2));
        assert_eq!(inner.lookup("x"), JValue::Integer(2));
        assert_eq!(outer.lookup("x"), JValue::Integer(1));
    }

    #[test]
    fn test_missing_lookup_is_undefined() {
        let frame = root();
        assert_eq!(frame.lookup("nope"), JValue::Undefined);
        assert!(!frame.is_bound("nope"));
    }

    #[test]
    fn test_rebinding_replaces() {
        let frame = root();
        frame.bind("x", JValue::Integer(1));
        frame.bind("x", JValue::Integer(2));
        assert_eq!(frame.lookup("x"), JValue::Integer(2));
    }

    #[test]
    fn test_depth_guard() {
        let supplement = EvalSupplement::with_max_depth(2);
        assert!(supplement.try_enter());
        assert!(supplement.try_enter());
        assert!(!supplement.try_enter());
        supplement.exit();
        supplement.exit();
        supplement.exit();
        assert!(supplement.try_enter());
    }

    #[test]
    fn test_random_in_unit_interval() {
        let supplement = EvalSupplement::new();
        for _ in 0..10 {
            let r = supplement.random();
            assert!((0.0..1.0).contains(&r));
        }
    }

    #[test]
    fn test_now_is_stable_within_evaluation() {
        let supplement = EvalSupplement::new();
        assert_eq!(supplement.millis(), supplement.millis());
    }
}
