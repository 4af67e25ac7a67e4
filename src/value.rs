// JValue: Rc-wrapped document value type for O(1) cloning
// The engine consumes and produces these; sequences and Undefined are
// engine-internal refinements that never leak through the public API.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::ast::{AstNode, CompiledRegex};
use crate::environment::Frame;
use crate::functions::NativeFunction;
use crate::signature::Signature;

// ── Array flags ──────────────────────────────────────────────────────────────

/// Refinement flags carried by array values.
///
/// A plain JSON array has no flags. Arrays created by the evaluator as
/// intermediate path results carry `SEQUENCE` and obey the collapse law
/// (see [`JValue::into_reduced`]). `SINGLETON` suppresses the one-element
/// collapse (`expr[]` syntax), `OUTER_WRAPPER` marks the wrapper created
/// around a non-array input at the head of path evaluation, and `CONS`
/// marks an explicit array constructor whose result must not be flattened
/// into a surrounding sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArrayFlags(u8);

impl ArrayFlags {
    pub const NONE: ArrayFlags = ArrayFlags(0);
    pub const SEQUENCE: ArrayFlags = ArrayFlags(1);
    pub const SINGLETON: ArrayFlags = ArrayFlags(2);
    pub const OUTER_WRAPPER: ArrayFlags = ArrayFlags(4);
    pub const CONS: ArrayFlags = ArrayFlags(8);

    #[inline]
    pub fn has(self, flag: ArrayFlags) -> bool {
        self.0 & flag.0 != 0
    }

    #[inline]
    pub fn with(self, flag: ArrayFlags) -> ArrayFlags {
        ArrayFlags(self.0 | flag.0)
    }

    #[inline]
    pub fn without(self, flag: ArrayFlags) -> ArrayFlags {
        ArrayFlags(self.0 & !flag.0)
    }
}

// ── JValue ───────────────────────────────────────────────────────────────────

/// A JSON-like value with O(1) clone semantics via Rc-wrapping.
///
/// Container types (Array, Object, String) are Rc-wrapped for cheap cloning;
/// mutation goes through `Rc::make_mut` (copy-on-write). `Undefined` is the
/// engine's "no value" sentinel, distinct from JSON `null`, and propagates
/// through missing paths and arguments. Functions are first-class values.
#[derive(Clone, Debug)]
pub enum JValue {
    Undefined,
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(Rc<str>),
    Array(Rc<Vec<JValue>>, ArrayFlags),
    Object(Rc<IndexMap<String, JValue>>),
    Function(Rc<FunctionValue>),
}

// ── Type checks ──────────────────────────────────────────────────────────────

impl JValue {
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, JValue::Undefined)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, JValue::Null)
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, JValue::Bool(_))
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, JValue::Integer(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, JValue::Integer(_) | JValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, JValue::String(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, JValue::Array(..))
    }

    /// True for arrays carrying the `SEQUENCE` flag.
    #[inline]
    pub fn is_sequence(&self) -> bool {
        matches!(self, JValue::Array(_, flags) if flags.has(ArrayFlags::SEQUENCE))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, JValue::Object(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, JValue::Function(_))
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

impl JValue {
    /// Numeric value widened to f64, for either numeric variant.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JValue::Integer(n) => Some(*n as f64),
            JValue::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Exact integer value: `Integer` directly, or an integral `Float`.
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JValue::Integer(n) => Some(*n),
            JValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(*f as i64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_array(&self) -> Option<&Vec<JValue>> {
        match self {
            JValue::Array(arr, _) => Some(arr),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(&self) -> Option<&IndexMap<String, JValue>> {
        match self {
            JValue::Object(map) => Some(map),
            _ => None,
        }
    }

    #[inline]
    pub fn as_function(&self) -> Option<&Rc<FunctionValue>> {
        match self {
            JValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Mutable access to the inner Vec, cloning if shared (Rc::make_mut).
    #[inline]
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<JValue>> {
        match self {
            JValue::Array(arr, _) => Some(Rc::make_mut(arr)),
            _ => None,
        }
    }

    /// Mutable access to the inner IndexMap, cloning if shared.
    #[inline]
    pub fn as_object_mut(&mut self) -> Option<&mut IndexMap<String, JValue>> {
        match self {
            JValue::Object(map) => Some(Rc::make_mut(map)),
            _ => None,
        }
    }

    /// Index into an object by key.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&JValue> {
        match self {
            JValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Index into an array by position.
    #[inline]
    pub fn get_index(&self, index: usize) -> Option<&JValue> {
        match self {
            JValue::Array(arr, _) => arr.get(index),
            _ => None,
        }
    }
}

// ── Constructors ─────────────────────────────────────────────────────────────

impl JValue {
    /// Build a number from an f64, narrowing to `Integer` when the value is
    /// exactly integral. This is the return-conversion rule of the
    /// function-binding bridge.
    #[inline]
    pub fn number(n: f64) -> Self {
        if n.fract() == 0.0 && n.is_finite() && n.abs() < (1i64 << 53) as f64 {
            JValue::Integer(n as i64)
        } else {
            JValue::Float(n)
        }
    }

    #[inline]
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        JValue::String(s.into())
    }

    #[inline]
    pub fn array(v: Vec<JValue>) -> Self {
        JValue::Array(Rc::new(v), ArrayFlags::NONE)
    }

    #[inline]
    pub fn array_with_flags(v: Vec<JValue>, flags: ArrayFlags) -> Self {
        JValue::Array(Rc::new(v), flags)
    }

    /// An engine-internal result sequence.
    #[inline]
    pub fn sequence(v: Vec<JValue>) -> Self {
        JValue::Array(Rc::new(v), ArrayFlags::SEQUENCE)
    }

    #[inline]
    pub fn object(m: IndexMap<String, JValue>) -> Self {
        JValue::Object(Rc::new(m))
    }

    #[inline]
    pub fn function(f: FunctionValue) -> Self {
        JValue::Function(Rc::new(f))
    }
}

// ── Sequence handling ────────────────────────────────────────────────────────

impl JValue {
    /// Flags of an array value; `NONE` for everything else.
    #[inline]
    pub fn flags(&self) -> ArrayFlags {
        match self {
            JValue::Array(_, flags) => *flags,
            _ => ArrayFlags::NONE,
        }
    }

    /// The same array with an extra flag set; non-arrays pass through.
    pub fn with_flag(self, flag: ArrayFlags) -> JValue {
        match self {
            JValue::Array(arr, flags) => JValue::Array(arr, flags.with(flag)),
            other => other,
        }
    }

    /// Apply the sequence collapse law: an empty sequence becomes
    /// `Undefined`, a one-element sequence collapses to its sole element
    /// unless `SINGLETON` is set, anything longer stays an array.
    /// Plain (non-sequence) arrays are returned unchanged.
    pub fn into_reduced(self) -> JValue {
        match self {
            JValue::Array(arr, flags) if flags.has(ArrayFlags::SEQUENCE) => {
                if flags.has(ArrayFlags::SINGLETON) {
                    return JValue::Array(arr, flags);
                }
                match arr.len() {
                    0 => JValue::Undefined,
                    1 => match Rc::try_unwrap(arr) {
                        Ok(mut v) => v.pop().unwrap_or(JValue::Undefined),
                        Err(shared) => shared[0].clone(),
                    },
                    _ => JValue::Array(arr, flags),
                }
            }
            other => other,
        }
    }

    /// Strip engine-internal flags so the value can cross the public API
    /// boundary: sequences collapse, then become plain arrays.
    pub fn into_public(self) -> JValue {
        match self.into_reduced() {
            JValue::Array(arr, _) => JValue::Array(arr, ArrayFlags::NONE),
            other => other,
        }
    }
}

// ── Function values ──────────────────────────────────────────────────────────

/// A first-class function value. All variants are applied through the one
/// `apply_function` entry point in the evaluator.
pub enum FunctionValue {
    /// A builtin or host function bound through the bridge.
    Native(NativeFunction),
    /// A lambda closure: owns its captured frame, parameter names, optional
    /// signature, and body.
    Lambda(LambdaFunction),
    /// A partial application wrapping another function with placeholder slots.
    Partial(PartialFunction),
    /// A regex literal applied as a matcher function.
    Matcher(CompiledRegex),
    /// A `|pattern|update,delete|` transform closure.
    Transformer(TransformerFunction),
    /// Function composition created by `f ~> g` when both sides are functions.
    Chain { first: JValue, second: JValue },
}

pub struct LambdaFunction {
    pub params: Vec<String>,
    pub signature: Option<Signature>,
    pub body: Arc<AstNode>,
    /// Captured lexical environment; lookups fall back through it, never
    /// through the caller's frame.
    pub env: Rc<Frame>,
    /// Context value captured at definition site, used when the body
    /// contains relative paths.
    pub input: JValue,
    pub thunk: bool,
}

pub struct PartialFunction {
    pub func: JValue,
    /// Fixed arguments; `None` marks a placeholder slot.
    pub args: Vec<Option<JValue>>,
}

pub struct TransformerFunction {
    pub pattern: Arc<AstNode>,
    pub update: Arc<AstNode>,
    pub delete: Option<Arc<AstNode>>,
    pub env: Rc<Frame>,
}

impl FunctionValue {
    /// Declared arity, used for context-substitution decisions. Partial
    /// applications report their placeholder count.
    pub fn arity(&self) -> usize {
        match self {
            FunctionValue::Native(native) => native.params.len(),
            FunctionValue::Lambda(lambda) => lambda.params.len(),
            FunctionValue::Partial(partial) => {
                partial.args.iter().filter(|a| a.is_none()).count()
            }
            FunctionValue::Matcher(_) => 1,
            FunctionValue::Transformer(_) => 1,
            FunctionValue::Chain { .. } => 1,
        }
    }
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionValue::Native(native) => write!(f, "<native:{}>", native.name),
            FunctionValue::Lambda(lambda) => write!(f, "<lambda/{}>", lambda.params.len()),
            FunctionValue::Partial(_) => write!(f, "<partial>"),
            FunctionValue::Matcher(regex) => write!(f, "<matcher:/{}/>", regex.pattern),
            FunctionValue::Transformer(_) => write!(f, "<transformer>"),
            FunctionValue::Chain { .. } => write!(f, "<chain>"),
        }
    }
}

// ── From impls ───────────────────────────────────────────────────────────────

impl From<bool> for JValue {
    #[inline]
    fn from(b: bool) -> Self {
        JValue::Bool(b)
    }
}

impl From<i64> for JValue {
    #[inline]
    fn from(n: i64) -> Self {
        JValue::Integer(n)
    }
}

impl From<i32> for JValue {
    #[inline]
    fn from(n: i32) -> Self {
        JValue::Integer(n as i64)
    }
}

impl From<usize> for JValue {
    #[inline]
    fn from(n: usize) -> Self {
        JValue::Integer(n as i64)
    }
}

impl From<f64> for JValue {
    #[inline]
    fn from(n: f64) -> Self {
        JValue::Float(n)
    }
}

impl From<&str> for JValue {
    #[inline]
    fn from(s: &str) -> Self {
        JValue::String(s.into())
    }
}

impl From<String> for JValue {
    #[inline]
    fn from(s: String) -> Self {
        JValue::String(s.into())
    }
}

impl From<Vec<JValue>> for JValue {
    #[inline]
    fn from(v: Vec<JValue>) -> Self {
        JValue::Array(Rc::new(v), ArrayFlags::NONE)
    }
}

impl From<IndexMap<String, JValue>> for JValue {
    #[inline]
    fn from(m: IndexMap<String, JValue>) -> Self {
        JValue::Object(Rc::new(m))
    }
}

// ── PartialEq ────────────────────────────────────────────────────────────────

impl PartialEq for JValue {
    /// Deep equality. Array flags are ignored: a sequence equals the plain
    /// array with the same elements. Integers and floats compare by numeric
    /// value. Functions compare by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JValue::Undefined, JValue::Undefined) => true,
            (JValue::Null, JValue::Null) => true,
            (JValue::Bool(a), JValue::Bool(b)) => a == b,
            (JValue::Integer(a), JValue::Integer(b)) => a == b,
            (JValue::Float(a), JValue::Float(b)) => a == b,
            (JValue::Integer(a), JValue::Float(b)) | (JValue::Float(b), JValue::Integer(a)) => {
                *a as f64 == *b
            }
            (JValue::String(a), JValue::String(b)) => a == b,
            (JValue::Array(a, _), JValue::Array(b, _)) => a == b,
            (JValue::Object(a), JValue::Object(b)) => a == b,
            (JValue::Function(a), JValue::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ── Display ──────────────────────────────────────────────────────────────────

impl fmt::Display for JValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JValue::Undefined => write!(f, "undefined"),
            JValue::Null => write!(f, "null"),
            JValue::Bool(b) => write!(f, "{}", b),
            JValue::Integer(n) => write!(f, "{}", n),
            JValue::Float(n) => format_float(*n, f),
            JValue::String(s) => write!(f, "\"{}\"", escape_json_string(s)),
            JValue::Array(arr, _) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            JValue::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "\"{}\":{}", escape_json_string(k), v)?;
                }
                write!(f, "}}")
            }
            JValue::Function(func) => write!(f, "\"{:?}\"", func),
        }
    }
}

pub(crate) fn escape_json_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c < '\x20' => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

fn format_float(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !n.is_finite() {
        // NaN and +/-Infinity render as null (matching JSON)
        write!(f, "null")
    } else if n.fract() == 0.0 && n.abs() < 1e20 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

// ── Serialization ────────────────────────────────────────────────────────────

impl Serialize for JValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            JValue::Undefined | JValue::Null => serializer.serialize_none(),
            JValue::Bool(b) => serializer.serialize_bool(*b),
            JValue::Integer(n) => serializer.serialize_i64(*n),
            JValue::Float(n) => {
                if n.is_nan() || n.is_infinite() {
                    serializer.serialize_none()
                } else if n.fract() == 0.0 && n.abs() < 1e15 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            JValue::String(s) => serializer.serialize_str(s),
            JValue::Array(arr, _) => {
                let mut seq = serializer.serialize_seq(Some(arr.len()))?;
                for v in arr.iter() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            JValue::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map.iter() {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            JValue::Function(_) => serializer.serialize_str(""),
        }
    }
}

impl<'de> serde::Deserialize<'de> for JValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(JValueVisitor)
    }
}

struct JValueVisitor;

impl<'de> Visitor<'de> for JValueVisitor {
    type Value = JValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "any valid JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<JValue, E> {
        Ok(JValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<JValue, E> {
        Ok(JValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<JValue, E> {
        if v <= i64::MAX as u64 {
            Ok(JValue::Integer(v as i64))
        } else {
            Ok(JValue::Float(v as f64))
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<JValue, E> {
        Ok(JValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<JValue, E> {
        Ok(JValue::string(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<JValue, E> {
        Ok(JValue::String(v.into()))
    }

    fn visit_none<E: de::Error>(self) -> Result<JValue, E> {
        Ok(JValue::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<JValue, E> {
        Ok(JValue::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<JValue, A::Error> {
        let mut vec = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element()? {
            vec.push(elem);
        }
        Ok(JValue::array(vec))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<JValue, A::Error> {
        let mut m = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry()? {
            m.insert(k, v);
        }
        Ok(JValue::object(m))
    }
}

// ── JSON string I/O ──────────────────────────────────────────────────────────

impl JValue {
    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a JSON string into a JValue (single-pass, no intermediate
    /// serde_json::Value).
    pub fn from_json_str(s: &str) -> Result<JValue, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ── Conversion to/from serde_json::Value ─────────────────────────────────────

impl From<serde_json::Value> for JValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => JValue::Null,
            serde_json::Value::Bool(b) => JValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    JValue::Integer(i)
                } else {
                    JValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => JValue::String(s.into()),
            serde_json::Value::Array(arr) => {
                JValue::array(arr.into_iter().map(JValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                let m: IndexMap<String, JValue> =
                    map.into_iter().map(|(k, v)| (k, JValue::from(v))).collect();
                JValue::object(m)
            }
        }
    }
}

impl From<&JValue> for serde_json::Value {
    fn from(v: &JValue) -> Self {
        match v {
            JValue::Undefined | JValue::Null => serde_json::Value::Null,
            JValue::Bool(b) => serde_json::Value::Bool(*b),
            JValue::Integer(n) => serde_json::Value::from(*n),
            JValue::Float(n) => {
                if n.is_nan() || n.is_infinite() {
                    serde_json::Value::Null
                } else {
                    serde_json::json!(*n)
                }
            }
            JValue::String(s) => serde_json::Value::String(s.to_string()),
            JValue::Array(arr, _) => {
                serde_json::Value::Array(arr.iter().map(serde_json::Value::from).collect())
            }
            JValue::Object(map) => {
                let m: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect();
                serde_json::Value::Object(m)
            }
            JValue::Function(_) => serde_json::Value::Null,
        }
    }
}

// ── jvalue! macro ────────────────────────────────────────────────────────────

/// Macro for constructing JValue literals, similar to serde_json::json!
///
/// Usage:
///   jvalue!(null)           → JValue::Null
///   jvalue!(true)           → JValue::Bool(true)
///   jvalue!(42)             → JValue::Integer(42)
///   jvalue!(3.14)           → JValue::Float(3.14)
///   jvalue!("hello")        → JValue::String
///   jvalue!([1, 2, 3])      → JValue::Array
///   jvalue!({"k": v, ...})  → JValue::Object (insertion order preserved)
#[macro_export]
macro_rules! jvalue {
    (null) => {
        $crate::value::JValue::Null
    };

    (true) => {
        $crate::value::JValue::Bool(true)
    };

    (false) => {
        $crate::value::JValue::Bool(false)
    };

    ([ $($elem:tt),* $(,)? ]) => {
        $crate::value::JValue::array(vec![ $( $crate::jvalue!($elem) ),* ])
    };

    ({ $($key:tt : $val:tt),* $(,)? }) => {
        {
            let mut map = indexmap::IndexMap::new();
            $(
                map.insert(($key).to_string(), $crate::jvalue!($val));
            )*
            $crate::value::JValue::object(map)
        }
    };

    ($other:expr) => {
        $crate::value::JValue::from($other)
    };
}

// ── Tests ────────────────────────────────────────────────────────────────────
