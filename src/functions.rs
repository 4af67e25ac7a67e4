// Function-binding bridge and the builtin function catalog.
//
// A native function is a declarative parameter-contract table plus a plain
// fn pointer: each parameter carries behavior flags (propagate-undefined,
// context-fallback, optional-with-default, pack-singleton-to-sequence,
// variadic-tail) that the binder applies before the body runs. Binding is
// two-phase: first without context substitution, then retrying with the
// evaluation context inserted at the first context-eligible parameter.
// Return conversion narrows exactly-integral floats and rejects NaN and
// infinities. The builtin catalog is a process-wide, lazily-built,
// immutable table consulted when environment lookup fails.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::LazyLock;

use crate::ast::CompiledRegex;
use crate::environment::{EvalSupplement, Frame};
use crate::evaluator::{apply_function, EvaluatorError};
use crate::signature::value_code;
use crate::value::{ArrayFlags, FunctionValue, JValue};

// ── Parameter contracts ──────────────────────────────────────────────────────

/// Default substituted for an absent optional argument. Restricted to
/// scalar literals so the catalog can live in a shared static.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    None,
    Integer(i64),
    Bool(bool),
    Str(&'static str),
}

impl ParamDefault {
    fn to_value(self) -> Option<JValue> {
        match self {
            ParamDefault::None => None,
            ParamDefault::Integer(n) => Some(JValue::Integer(n)),
            ParamDefault::Bool(b) => Some(JValue::Bool(b)),
            ParamDefault::Str(s) => Some(JValue::string(s)),
        }
    }
}

/// One positional parameter of a native function.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Accepted type codes (`b n s l a o f`); empty accepts anything.
    pub expects: &'static str,
    /// Short-circuit the whole call to Undefined when this argument is
    /// supplied but undefined.
    pub propagate_undefined: bool,
    /// Substitute the evaluation context when this argument is omitted.
    pub allow_context: bool,
    /// May be omitted without error.
    pub optional: bool,
    pub default: ParamDefault,
    /// Wrap a non-array argument in a singleton array.
    pub pack_sequence: bool,
    /// Collect this and all remaining arguments into one array (must be
    /// the last parameter).
    pub variadic: bool,
}

impl ParamSpec {
    pub fn of(expects: &'static str) -> Self {
        ParamSpec {
            expects,
            propagate_undefined: false,
            allow_context: false,
            optional: false,
            default: ParamDefault::None,
            pack_sequence: false,
            variadic: false,
        }
    }

    pub fn any() -> Self {
        Self::of("")
    }

    pub fn propagate(mut self) -> Self {
        self.propagate_undefined = true;
        self
    }

    pub fn context(mut self) -> Self {
        self.allow_context = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn default_value(mut self, default: ParamDefault) -> Self {
        self.optional = true;
        self.default = default;
        self
    }

    pub fn pack(mut self) -> Self {
        self.pack_sequence = true;
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

/// The uniform implementation contract: validated arguments in, document
/// value out. The context struct carries the evaluation input, the calling
/// frame, and through it the per-evaluation supplement.
pub type NativeImpl = fn(&NativeContext, &[JValue]) -> Result<JValue, EvaluatorError>;

pub struct NativeContext<'a> {
    pub input: &'a JValue,
    pub frame: &'a Rc<Frame>,
    pub name: &'a str,
}

impl NativeContext<'_> {
    pub fn supplement(&self) -> &Rc<EvalSupplement> {
        self.frame.supplement()
    }
}

/// A host callable bound through the bridge.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub func: NativeImpl,
}

impl NativeFunction {
    pub fn new(name: impl Into<String>, func: NativeImpl) -> Self {
        NativeFunction {
            name: name.into(),
            params: Vec::new(),
            func,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction(${}/{})", self.name, self.params.len())
    }
}

// ── Binding ──────────────────────────────────────────────────────────────────

enum Bound {
    /// A propagate-marked parameter received Undefined: the whole call
    /// short-circuits to Undefined.
    Propagate,
    Args(Vec<JValue>),
}

fn bind_args(
    native: &NativeFunction,
    args: &[JValue],
    context_pos: Option<usize>,
) -> Result<Bound, EvaluatorError> {
    let mut out = Vec::with_capacity(native.params.len());
    let mut cursor = 0usize;

    for (pi, param) in native.params.iter().enumerate() {
        if param.variadic {
            let mut rest = Vec::new();
            while cursor < args.len() {
                let value = args[cursor].clone();
                check_arg_type(native, param, &value, pi, context_pos)?;
                rest.push(value);
                cursor += 1;
            }
            out.push(JValue::array(rest));
            continue;
        }

        let present = cursor < args.len();
        let arg = if present {
            let a = args[cursor].clone();
            cursor += 1;
            a
        } else {
            JValue::Undefined
        };

        if arg.is_undefined() {
            if present && param.propagate_undefined {
                return Ok(Bound::Propagate);
            }
            if !present && param.allow_context {
                // force the caller into the context-substitution phase
                return Err(EvaluatorError::ArgumentMismatch {
                    name: native.name.clone(),
                    index: pi + 1,
                });
            }
            if let Some(default) = param.default.to_value() {
                out.push(default);
                continue;
            }
            if param.optional || (present && !param.propagate_undefined) {
                out.push(JValue::Undefined);
                continue;
            }
            // an absent required argument is an arity error even for
            // propagate-marked parameters
            return Err(EvaluatorError::ArgumentMismatch {
                name: native.name.clone(),
                index: pi + 1,
            });
        }

        let mut value = arg;
        if param.pack_sequence && !value.is_array() {
            value = JValue::array(vec![value]);
        }
        check_arg_type(native, param, &value, pi, context_pos)?;
        out.push(value);
    }

    if cursor < args.len() {
        return Err(EvaluatorError::ArgumentMismatch {
            name: native.name.clone(),
            index: cursor + 1,
        });
    }
    Ok(Bound::Args(out))
}

fn check_arg_type(
    native: &NativeFunction,
    param: &ParamSpec,
    value: &JValue,
    index: usize,
    context_pos: Option<usize>,
) -> Result<(), EvaluatorError> {
    if param.expects.is_empty() || param.expects.contains(value_code(value)) {
        return Ok(());
    }
    if context_pos == Some(index) {
        Err(EvaluatorError::ContextTypeMismatch {
            name: native.name.clone(),
            index: index + 1,
        })
    } else {
        Err(EvaluatorError::ArgumentMismatch {
            name: native.name.clone(),
            index: index + 1,
        })
    }
}

/// Invoke a bridge-bound native: bind (two-phase), run, convert the result.
pub fn invoke_native(
    native: &NativeFunction,
    ctx: &NativeContext,
    args: Vec<JValue>,
) -> Result<JValue, EvaluatorError> {
    let bound = match bind_args(native, &args, None) {
        Ok(bound) => bound,
        Err(first_error) => {
            // retry with the evaluation context substituted for the first
            // context-eligible parameter
            let retry = if args.len() < native.params.len() {
                native
                    .params
                    .iter()
                    .position(|p| p.allow_context)
                    .filter(|pos| *pos <= args.len())
            } else {
                None
            };
            match retry {
                Some(pos) => {
                    let mut with_context = args.clone();
                    with_context.insert(pos, ctx.input.clone());
                    bind_args(native, &with_context, Some(pos))?
                }
                None => return Err(first_error),
            }
        }
    };

    match bound {
        Bound::Propagate => Ok(JValue::Undefined),
        Bound::Args(bound_args) => {
            let result = (native.func)(ctx, &bound_args)?;
            convert_result(result)
        }
    }
}

/// Normalize a native's return value: exactly-integral floats narrow to
/// integers; NaN and infinities are dynamic errors.
fn convert_result(value: JValue) -> Result<JValue, EvaluatorError> {
    match value {
        JValue::Float(f) => {
            if !f.is_finite() {
                Err(EvaluatorError::NumberOutOfRange {
                    value: f.to_string(),
                })
            } else {
                Ok(JValue::number(f))
            }
        }
        other => Ok(other),
    }
}

// ── Casting ──────────────────────────────────────────────────────────────────

/// The canonical boolean coercion, one case per value kind: arrays are a
/// recursive OR over their elements, empty containers are falsy, functions
/// are falsy.
pub fn cast_boolean(value: &JValue) -> bool {
    match value {
        JValue::Undefined => false,
        JValue::Null => false,
        JValue::Bool(b) => *b,
        JValue::Integer(n) => *n != 0,
        JValue::Float(f) => *f != 0.0,
        JValue::String(s) => !s.is_empty(),
        JValue::Array(items, _) => items.iter().any(cast_boolean),
        JValue::Object(map) => !map.is_empty(),
        JValue::Function(_) => false,
    }
}

/// The canonical string coercion: strings pass through unquoted, numbers
/// use their JSON rendering (D3001 for non-finite floats), structures
/// serialize as JSON, functions become the empty string.
pub fn cast_string(value: &JValue) -> Result<String, EvaluatorError> {
    match value {
        JValue::Undefined => Ok(String::new()),
        JValue::Null => Ok("null".to_string()),
        JValue::Bool(b) => Ok(b.to_string()),
        JValue::Integer(n) => Ok(n.to_string()),
        JValue::Float(f) => {
            if !f.is_finite() {
                return Err(EvaluatorError::StringOfNonFinite);
            }
            if f.fract() == 0.0 && f.abs() < 1e20 {
                Ok((*f as i64).to_string())
            } else {
                Ok(f.to_string())
            }
        }
        JValue::String(s) => Ok(s.to_string()),
        JValue::Array(..) | JValue::Object(_) => value
            .to_json_string()
            .map_err(|e| EvaluatorError::EvaluationError(e.to_string())),
        JValue::Function(_) => Ok(String::new()),
    }
}

// ── Builtin catalog ──────────────────────────────────────────────────────────

/// Look up a builtin in the process-wide catalog. The catalog is built
/// lazily once and never mutated; host bindings layer on top of it in
/// per-evaluation frames.
pub fn lookup_builtin(name: &str) -> Option<&'static NativeFunction> {
    BUILTINS.get(name)
}

static BUILTINS: LazyLock<BTreeMap<&'static str, NativeFunction>> = LazyLock::new(|| {
    let mut table: BTreeMap<&'static str, NativeFunction> = BTreeMap::new();
    let mut add = |name: &'static str, f: NativeFunction| {
        table.insert(name, f);
    };

    // ── strings ──────────────────────────────────────────────────────────
    add(
        "string",
        NativeFunction::new("string", string::string_fn)
            .param(ParamSpec::any().context().propagate())
            .param(ParamSpec::of("b").optional()),
    );
    add(
        "length",
        NativeFunction::new("length", string::length)
            .param(ParamSpec::of("s").context().propagate()),
    );
    add(
        "substring",
        NativeFunction::new("substring", string::substring)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("n"))
            .param(ParamSpec::of("n").optional()),
    );
    add(
        "substringBefore",
        NativeFunction::new("substringBefore", string::substring_before)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("s")),
    );
    add(
        "substringAfter",
        NativeFunction::new("substringAfter", string::substring_after)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("s")),
    );
    add(
        "uppercase",
        NativeFunction::new("uppercase", string::uppercase)
            .param(ParamSpec::of("s").context().propagate()),
    );
    add(
        "lowercase",
        NativeFunction::new("lowercase", string::lowercase)
            .param(ParamSpec::of("s").context().propagate()),
    );
    add(
        "trim",
        NativeFunction::new("trim", string::trim)
            .param(ParamSpec::of("s").context().propagate()),
    );
    add(
        "pad",
        NativeFunction::new("pad", string::pad)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("n"))
            .param(ParamSpec::of("s").default_value(ParamDefault::Str(" "))),
    );
    add(
        "contains",
        NativeFunction::new("contains", string::contains)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("sf")),
    );
    add(
        "split",
        NativeFunction::new("split", string::split)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("sf"))
            .param(ParamSpec::of("n").optional()),
    );
    add(
        "join",
        NativeFunction::new("join", string::join)
            .param(ParamSpec::of("a").pack())
            .param(ParamSpec::of("s").default_value(ParamDefault::Str(""))),
    );
    add(
        "match",
        NativeFunction::new("match", string::match_fn)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("f"))
            .param(ParamSpec::of("n").optional()),
    );
    add(
        "replace",
        NativeFunction::new("replace", string::replace)
            .param(ParamSpec::of("s").context().propagate())
            .param(ParamSpec::of("sf"))
            .param(ParamSpec::of("sf"))
            .param(ParamSpec::of("n").optional()),
    );

    // ── numbers ──────────────────────────────────────────────────────────
    add(
        "number",
        NativeFunction::new("number", numeric::number_fn)
            .param(ParamSpec::of("nsb").context().propagate()),
    );
    add(
        "abs",
        NativeFunction::new("abs", numeric::abs)
            .param(ParamSpec::of("n").context().propagate()),
    );
    add(
        "floor",
        NativeFunction::new("floor", numeric::floor)
            .param(ParamSpec::of("n").context().propagate()),
    );
    add(
        "ceil",
        NativeFunction::new("ceil", numeric::ceil)
            .param(ParamSpec::of("n").context().propagate()),
    );
    add(
        "round",
        NativeFunction::new("round", numeric::round)
            .param(ParamSpec::of("n").context().propagate())
            .param(ParamSpec::of("n").default_value(ParamDefault::Integer(0))),
    );
    add(
        "power",
        NativeFunction::new("power", numeric::power)
            .param(ParamSpec::of("n").context().propagate())
            .param(ParamSpec::of("n")),
    );
    add(
        "sqrt",
        NativeFunction::new("sqrt", numeric::sqrt)
            .param(ParamSpec::of("n").context().propagate()),
    );
    add("random", NativeFunction::new("random", numeric::random));

    // ── aggregation ──────────────────────────────────────────────────────
    add(
        "sum",
        NativeFunction::new("sum", numeric::sum).param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "max",
        NativeFunction::new("max", numeric::max).param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "min",
        NativeFunction::new("min", numeric::min).param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "average",
        NativeFunction::new("average", numeric::average)
            .param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "count",
        NativeFunction::new("count", arrays::count).param(ParamSpec::any().optional().pack()),
    );

    // ── arrays ───────────────────────────────────────────────────────────
    add(
        "append",
        NativeFunction::new("append", arrays::append_fn)
            .param(ParamSpec::any().optional())
            .param(ParamSpec::any().optional()),
    );
    add(
        "sort",
        NativeFunction::new("sort", arrays::sort)
            .param(ParamSpec::of("a").pack().propagate())
            .param(ParamSpec::of("f").optional()),
    );
    add(
        "reverse",
        NativeFunction::new("reverse", arrays::reverse)
            .param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "distinct",
        NativeFunction::new("distinct", arrays::distinct)
            .param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "zip",
        NativeFunction::new("zip", arrays::zip).param(ParamSpec::any().variadic()),
    );
    add(
        "exists",
        NativeFunction::new("exists", arrays::exists).param(ParamSpec::any().optional()),
    );

    // ── objects ──────────────────────────────────────────────────────────
    add(
        "keys",
        NativeFunction::new("keys", objects::keys)
            .param(ParamSpec::of("oa").context().propagate()),
    );
    add(
        "lookup",
        NativeFunction::new("lookup", objects::lookup)
            .param(ParamSpec::of("oa").context().propagate())
            .param(ParamSpec::of("s")),
    );
    add(
        "spread",
        NativeFunction::new("spread", objects::spread)
            .param(ParamSpec::any().context().propagate()),
    );
    add(
        "merge",
        NativeFunction::new("merge", objects::merge)
            .param(ParamSpec::of("a").pack().propagate()),
    );
    add(
        "each",
        NativeFunction::new("each", objects::each)
            .param(ParamSpec::of("o").context().propagate())
            .param(ParamSpec::of("f")),
    );
    add(
        "sift",
        NativeFunction::new("sift", objects::sift)
            .param(ParamSpec::of("o").context().propagate())
            .param(ParamSpec::of("f")),
    );
    add(
        "type",
        NativeFunction::new("type", objects::type_fn).param(ParamSpec::any().propagate()),
    );
    add(
        "error",
        NativeFunction::new("error", objects::error_fn).param(ParamSpec::of("s").optional()),
    );

    // ── booleans ─────────────────────────────────────────────────────────
    add(
        "boolean",
        NativeFunction::new("boolean", boolean::boolean_fn)
            .param(ParamSpec::any().context().propagate()),
    );
    add(
        "not",
        NativeFunction::new("not", boolean::not_fn)
            .param(ParamSpec::any().context().propagate()),
    );

    // ── higher-order ─────────────────────────────────────────────────────
    add(
        "map",
        NativeFunction::new("map", higher::map)
            .param(ParamSpec::of("a").pack().propagate())
            .param(ParamSpec::of("f")),
    );
    add(
        "filter",
        NativeFunction::new("filter", higher::filter)
            .param(ParamSpec::of("a").pack().propagate())
            .param(ParamSpec::of("f")),
    );
    add(
        "reduce",
        NativeFunction::new("reduce", higher::reduce)
            .param(ParamSpec::of("a").pack().propagate())
            .param(ParamSpec::of("f"))
            .param(ParamSpec::any().optional()),
    );
    add(
        "single",
        NativeFunction::new("single", higher::single)
            .param(ParamSpec::of("a").pack().propagate())
            .param(ParamSpec::of("f").optional()),
    );

    // ── date and time ────────────────────────────────────────────────────
    add("now", NativeFunction::new("now", time::now));
    add("millis", NativeFunction::new("millis", time::millis));
    add(
        "fromMillis",
        NativeFunction::new("fromMillis", time::from_millis)
            .param(ParamSpec::of("n").context().propagate()),
    );
    add(
        "toMillis",
        NativeFunction::new("toMillis", time::to_millis)
            .param(ParamSpec::of("s").context().propagate()),
    );

    table
});

/// Extract the compiled regex from a matcher function value.
fn as_matcher(value: &JValue) -> Option<&CompiledRegex> {
    match value {
        JValue::Function(f) => match &**f {
            FunctionValue::Matcher(regex) => Some(regex),
            _ => None,
        },
        _ => None,
    }
}

// ── String functions ─────────────────────────────────────────────────────────

mod string {
    use super::*;

    pub fn string_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let value = &args[0];
        let prettify = args.get(1).and_then(|v| v.as_bool()).unwrap_or(false);
        if let JValue::String(_) = value {
            return Ok(value.clone());
        }
        if prettify && (value.is_object() || value.is_array()) {
            return value
                .to_json_string_pretty()
                .map(JValue::from)
                .map_err(|e| EvaluatorError::EvaluationError(e.to_string()));
        }
        cast_string(value).map(JValue::from)
    }

    pub fn length(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        Ok(JValue::Integer(s.chars().count() as i64))
    }

    pub fn substring(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let chars: Vec<char> = args[0].as_str().unwrap_or("").chars().collect();
        let len = chars.len() as i64;
        let mut start = args[1].as_f64().unwrap_or(0.0).floor() as i64;
        if start < 0 {
            start = (len + start).max(0);
        }
        let start = start.min(len) as usize;
        let end = match args.get(2) {
            Some(v) if !v.is_undefined() => {
                let length = v.as_f64().unwrap_or(0.0).floor() as i64;
                if length <= 0 {
                    start
                } else {
                    (start + length as usize).min(chars.len())
                }
            }
            _ => chars.len(),
        };
        Ok(JValue::string(
            chars[start..end].iter().collect::<String>(),
        ))
    }

    pub fn substring_before(
        _ctx: &NativeContext,
        args: &[JValue],
    ) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        let sep = args[1].as_str().unwrap_or("");
        Ok(JValue::string(match s.find(sep) {
            Some(pos) => &s[..pos],
            None => s,
        }))
    }

    pub fn substring_after(
        _ctx: &NativeContext,
        args: &[JValue],
    ) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        let sep = args[1].as_str().unwrap_or("");
        Ok(JValue::string(match s.find(sep) {
            Some(pos) => &s[pos + sep.len()..],
            None => s,
        }))
    }

    pub fn uppercase(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::string(
            args[0].as_str().unwrap_or("").to_uppercase(),
        ))
    }

    pub fn lowercase(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::string(
            args[0].as_str().unwrap_or("").to_lowercase(),
        ))
    }

    /// Collapse whitespace runs to single spaces and trim the ends.
    pub fn trim(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let normalized = args[0]
            .as_str()
            .unwrap_or("")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        Ok(JValue::string(normalized))
    }

    /// Pad to `width` characters: positive pads on the right, negative on
    /// the left.
    pub fn pad(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        let width = args[1].as_f64().unwrap_or(0.0) as i64;
        let pad_with = args[2].as_str().unwrap_or(" ");
        let target = width.unsigned_abs() as usize;
        let current = s.chars().count();
        if current >= target || pad_with.is_empty() {
            return Ok(JValue::string(s));
        }
        let padding: String = pad_with
            .chars()
            .cycle()
            .take(target - current)
            .collect();
        Ok(JValue::string(if width < 0 {
            format!("{}{}", padding, s)
        } else {
            format!("{}{}", s, padding)
        }))
    }

    pub fn contains(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        match (&args[1], as_matcher(&args[1])) {
            (_, Some(regex)) => Ok(JValue::Bool(regex.regex.is_match(s))),
            (JValue::String(pattern), _) => Ok(JValue::Bool(s.contains(pattern.as_ref()))),
            _ => Err(EvaluatorError::ArgumentMismatch {
                name: "contains".to_string(),
                index: 2,
            }),
        }
    }

    pub fn split(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        let limit = match args.get(2) {
            Some(v) if !v.is_undefined() => {
                let n = v.as_f64().unwrap_or(0.0);
                if n < 0.0 {
                    return Err(EvaluatorError::SplitLimitNegative);
                }
                Some(n.floor() as usize)
            }
            _ => None,
        };

        let mut parts: Vec<JValue> = match (&args[1], as_matcher(&args[1])) {
            (_, Some(regex)) => regex.regex.split(s).map(JValue::from).collect(),
            (JValue::String(sep), _) => {
                if sep.is_empty() {
                    s.chars().map(|c| JValue::from(c.to_string())).collect()
                } else {
                    s.split(sep.as_ref()).map(JValue::from).collect()
                }
            }
            _ => {
                return Err(EvaluatorError::ArgumentMismatch {
                    name: "split".to_string(),
                    index: 2,
                })
            }
        };
        if let Some(limit) = limit {
            parts.truncate(limit);
        }
        Ok(JValue::array(parts))
    }

    pub fn join(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let sep = args[1].as_str().unwrap_or("");
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str() {
                Some(s) => parts.push(s.to_string()),
                None => {
                    return Err(EvaluatorError::ArrayElementMismatch {
                        name: "join".to_string(),
                        index: 1,
                        type_name: "string".to_string(),
                    })
                }
            }
        }
        Ok(JValue::string(parts.join(sep)))
    }

    pub fn match_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        let regex = as_matcher(&args[1]).ok_or_else(|| EvaluatorError::ArgumentMismatch {
            name: "match".to_string(),
            index: 2,
        })?;
        let limit = match args.get(2) {
            Some(v) if !v.is_undefined() => {
                let n = v.as_f64().unwrap_or(0.0);
                if n < 0.0 {
                    return Err(EvaluatorError::MatchLimitNegative);
                }
                n.floor() as usize
            }
            _ => usize::MAX,
        };

        let mut matches = Vec::new();
        for captures in regex.regex.captures_iter(s) {
            if matches.len() >= limit {
                break;
            }
            let full = captures.get(0).unwrap();
            let groups: Vec<JValue> = captures
                .iter()
                .skip(1)
                .map(|g| match g {
                    Some(m) => JValue::string(m.as_str()),
                    None => JValue::Undefined,
                })
                .collect();
            let mut map = indexmap::IndexMap::new();
            map.insert("match".to_string(), JValue::string(full.as_str()));
            map.insert(
                "index".to_string(),
                JValue::Integer(s[..full.start()].chars().count() as i64),
            );
            map.insert("groups".to_string(), JValue::array(groups));
            matches.push(JValue::object(map));
        }
        Ok(JValue::sequence(matches))
    }

    pub fn replace(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        let limit = match args.get(3) {
            Some(v) if !v.is_undefined() => {
                let n = v.as_f64().unwrap_or(-1.0);
                if n < 0.0 {
                    return Err(EvaluatorError::ReplaceLimitNegative);
                }
                Some(n.floor() as usize)
            }
            _ => None,
        };

        // literal string pattern
        if let JValue::String(pattern) = &args[1] {
            if pattern.is_empty() {
                return Err(EvaluatorError::ReplaceEmptyPattern);
            }
            let replacement = args[2].as_str().ok_or_else(|| {
                EvaluatorError::ArgumentMismatch {
                    name: "replace".to_string(),
                    index: 3,
                }
            })?;
            let replaced = match limit {
                Some(limit) => s.replacen(pattern.as_ref(), replacement, limit),
                None => s.replace(pattern.as_ref(), replacement),
            };
            return Ok(JValue::string(replaced));
        }

        // regex pattern, with string or function replacement
        let regex = as_matcher(&args[1]).ok_or_else(|| EvaluatorError::ArgumentMismatch {
            name: "replace".to_string(),
            index: 2,
        })?;

        let mut result = String::new();
        let mut last_end = 0usize;
        let mut replaced_count = 0usize;
        for captures in regex.regex.captures_iter(s) {
            if let Some(limit) = limit {
                if replaced_count >= limit {
                    break;
                }
            }
            let full = captures.get(0).unwrap();
            result.push_str(&s[last_end..full.start()]);
            match &args[2] {
                JValue::String(template) => {
                    result.push_str(&expand_groups(template, &captures));
                }
                replacement_fn @ JValue::Function(_) => {
                    let groups: Vec<JValue> = captures
                        .iter()
                        .skip(1)
                        .map(|g| match g {
                            Some(m) => JValue::string(m.as_str()),
                            None => JValue::Undefined,
                        })
                        .collect();
                    let mut map = indexmap::IndexMap::new();
                    map.insert("match".to_string(), JValue::string(full.as_str()));
                    map.insert(
                        "index".to_string(),
                        JValue::Integer(s[..full.start()].chars().count() as i64),
                    );
                    map.insert("groups".to_string(), JValue::array(groups));
                    let value = apply_function(
                        replacement_fn,
                        vec![JValue::object(map)],
                        ctx.input,
                        ctx.frame,
                    )?;
                    match value.as_str() {
                        Some(s) => result.push_str(s),
                        None => return Err(EvaluatorError::ReplaceNonString),
                    }
                }
                _ => {
                    return Err(EvaluatorError::ArgumentMismatch {
                        name: "replace".to_string(),
                        index: 3,
                    })
                }
            }
            last_end = full.end();
            replaced_count += 1;
        }
        result.push_str(&s[last_end..]);
        Ok(JValue::string(result))
    }

    /// Expand `$N` group references (and `$$` escapes) in a replacement
    /// template.
    fn expand_groups(template: &str, captures: &regex::Captures) -> String {
        let mut out = String::with_capacity(template.len());
        let chars: Vec<char> = template.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '$' && i + 1 < chars.len() {
                if chars[i + 1] == '$' {
                    out.push('$');
                    i += 2;
                    continue;
                }
                let mut j = i + 1;
                let mut number = String::new();
                while j < chars.len() && chars[j].is_ascii_digit() {
                    number.push(chars[j]);
                    j += 1;
                }
                if !number.is_empty() {
                    let group: usize = number.parse().unwrap_or(0);
                    if let Some(m) = captures.get(group) {
                        out.push_str(m.as_str());
                    }
                    i = j;
                    continue;
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }
}

// ── Numeric functions ────────────────────────────────────────────────────────

mod numeric {
    use super::*;

    pub fn number_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        match &args[0] {
            n @ (JValue::Integer(_) | JValue::Float(_)) => Ok(n.clone()),
            JValue::Bool(b) => Ok(JValue::Integer(if *b { 1 } else { 0 })),
            JValue::String(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(JValue::number(n)),
                _ => Err(EvaluatorError::CannotCastToNumber {
                    value: s.to_string(),
                }),
            },
            other => Err(EvaluatorError::CannotCastToNumber {
                value: other.to_string(),
            }),
        }
    }

    pub fn abs(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(match &args[0] {
            JValue::Integer(n) => JValue::Integer(n.abs()),
            other => JValue::Float(other.as_f64().unwrap_or(0.0).abs()),
        })
    }

    pub fn floor(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::number(args[0].as_f64().unwrap_or(0.0).floor()))
    }

    pub fn ceil(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::number(args[0].as_f64().unwrap_or(0.0).ceil()))
    }

    /// Round half to even (banker's rounding), to the given number of
    /// decimal places.
    pub fn round(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let n = args[0].as_f64().unwrap_or(0.0);
        let precision = args[1].as_f64().unwrap_or(0.0) as i32;
        let factor = 10f64.powi(precision);
        let rounded = round_half_even(n * factor) / factor;
        Ok(JValue::number(rounded))
    }

    fn round_half_even(x: f64) -> f64 {
        let floor = x.floor();
        let diff = x - floor;
        if diff > 0.5 {
            floor + 1.0
        } else if diff < 0.5 {
            floor
        } else if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    }

    pub fn power(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let base = args[0].as_f64().unwrap_or(0.0);
        let exp = args[1].as_f64().unwrap_or(0.0);
        let result = base.powf(exp);
        if !result.is_finite() {
            return Err(EvaluatorError::PowerUnrepresentable {
                base: base.to_string(),
                exp: exp.to_string(),
            });
        }
        Ok(JValue::number(result))
    }

    pub fn sqrt(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let n = args[0].as_f64().unwrap_or(0.0);
        if n < 0.0 {
            return Err(EvaluatorError::SqrtNegative {
                value: n.to_string(),
            });
        }
        Ok(JValue::number(n.sqrt()))
    }

    pub fn random(ctx: &NativeContext, _args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::Float(ctx.supplement().random()))
    }

    fn numbers_of(name: &str, arg: &JValue) -> Result<Vec<f64>, EvaluatorError> {
        let items = arg.as_array().unwrap();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item.as_f64() {
                Some(n) => out.push(n),
                None => {
                    return Err(EvaluatorError::ArrayElementMismatch {
                        name: name.to_string(),
                        index: 1,
                        type_name: "number".to_string(),
                    })
                }
            }
        }
        Ok(out)
    }

    pub fn sum(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let numbers = numbers_of("sum", &args[0])?;
        Ok(JValue::number(numbers.iter().sum()))
    }

    pub fn max(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let numbers = numbers_of("max", &args[0])?;
        Ok(match numbers.iter().cloned().fold(None, |acc: Option<f64>, n| {
            Some(acc.map_or(n, |a| a.max(n)))
        }) {
            Some(n) => JValue::number(n),
            None => JValue::Undefined,
        })
    }

    pub fn min(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let numbers = numbers_of("min", &args[0])?;
        Ok(match numbers.iter().cloned().fold(None, |acc: Option<f64>, n| {
            Some(acc.map_or(n, |a| a.min(n)))
        }) {
            Some(n) => JValue::number(n),
            None => JValue::Undefined,
        })
    }

    pub fn average(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let numbers = numbers_of("average", &args[0])?;
        if numbers.is_empty() {
            return Ok(JValue::Undefined);
        }
        Ok(JValue::number(
            numbers.iter().sum::<f64>() / numbers.len() as f64,
        ))
    }
}

// ── Array functions ──────────────────────────────────────────────────────────

mod arrays {
    use super::*;

    pub fn count(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::Integer(match args.first() {
            None | Some(JValue::Undefined) => 0,
            Some(JValue::Array(items, _)) => items.len() as i64,
            Some(_) => 1,
        }))
    }

    pub fn append_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let a = args.first().cloned().unwrap_or(JValue::Undefined);
        let b = args.get(1).cloned().unwrap_or(JValue::Undefined);
        Ok(crate::utils::append(a, b))
    }

    pub fn sort(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap().clone();
        match args.get(1) {
            Some(comparator @ JValue::Function(_)) => {
                let sorted = crate::utils::merge_sort(items, &mut |a, b| {
                    let res = apply_function(
                        comparator,
                        vec![a.clone(), b.clone()],
                        ctx.input,
                        ctx.frame,
                    )?;
                    Ok::<bool, EvaluatorError>(cast_boolean(&res))
                })?;
                Ok(JValue::array_with_flags(sorted, ArrayFlags::SEQUENCE))
            }
            _ => {
                // the comparator-free form demands a homogeneous array of
                // numbers or strings
                let all_numbers = items.iter().all(|v| v.is_number());
                let all_strings = items.iter().all(|v| v.is_string());
                if !all_numbers && !all_strings {
                    return Err(EvaluatorError::SortHeterogeneous);
                }
                let sorted = crate::utils::merge_sort(items, &mut |a, b| {
                    Ok::<bool, EvaluatorError>(if all_numbers {
                        a.as_f64().unwrap() > b.as_f64().unwrap()
                    } else {
                        a.as_str().unwrap() > b.as_str().unwrap()
                    })
                })?;
                Ok(JValue::array_with_flags(sorted, ArrayFlags::SEQUENCE))
            }
        }
    }

    pub fn reverse(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let mut items = args[0].as_array().unwrap().clone();
        items.reverse();
        Ok(JValue::array_with_flags(items, ArrayFlags::SEQUENCE))
    }

    pub fn distinct(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let mut out: Vec<JValue> = Vec::new();
        for item in items {
            if !out.contains(item) {
                out.push(item.clone());
            }
        }
        Ok(JValue::array_with_flags(out, ArrayFlags::SEQUENCE))
    }

    /// Convolve the argument arrays: `$zip([1,2],[3,4])` is `[[1,3],[2,4]]`,
    /// truncated to the shortest input.
    pub fn zip(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let inputs = args[0].as_array().unwrap();
        if inputs.is_empty() {
            return Ok(JValue::array(Vec::new()));
        }
        let columns: Vec<Vec<JValue>> = inputs
            .iter()
            .map(|v| match v {
                JValue::Array(items, _) => items.as_ref().clone(),
                other => vec![other.clone()],
            })
            .collect();
        let rows = columns.iter().map(|c| c.len()).min().unwrap_or(0);
        let zipped: Vec<JValue> = (0..rows)
            .map(|r| JValue::array(columns.iter().map(|c| c[r].clone()).collect()))
            .collect();
        Ok(JValue::array(zipped))
    }

    pub fn exists(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::Bool(!matches!(
            args.first(),
            None | Some(JValue::Undefined)
        )))
    }
}

// ── Object functions ─────────────────────────────────────────────────────────

mod objects {
    use super::*;

    pub fn keys(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let mut out: Vec<JValue> = Vec::new();
        let mut push_keys = |map: &indexmap::IndexMap<String, JValue>| {
            for key in map.keys() {
                let key_value = JValue::string(key.as_str());
                if !out.contains(&key_value) {
                    out.push(key_value);
                }
            }
        };
        match &args[0] {
            JValue::Object(map) => push_keys(map),
            JValue::Array(items, _) => {
                for item in items.iter() {
                    if let JValue::Object(map) = item {
                        push_keys(map);
                    }
                }
            }
            _ => return Ok(JValue::Undefined),
        }
        Ok(JValue::sequence(out))
    }

    pub fn lookup(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        fn go(input: &JValue, key: &str, out: &mut Vec<JValue>) {
            match input {
                JValue::Object(map) => {
                    if let Some(v) = map.get(key) {
                        out.push(v.clone());
                    }
                }
                JValue::Array(items, _) => {
                    for item in items.iter() {
                        go(item, key, out);
                    }
                }
                _ => {}
            }
        }
        let key = args[1].as_str().unwrap_or("");
        let mut out = Vec::new();
        go(&args[0], key, &mut out);
        Ok(JValue::sequence(out))
    }

    /// Split an object into an array of single-property objects.
    pub fn spread(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        fn go(value: &JValue, out: &mut Vec<JValue>) {
            match value {
                JValue::Object(map) => {
                    for (k, v) in map.iter() {
                        let mut single = indexmap::IndexMap::new();
                        single.insert(k.clone(), v.clone());
                        out.push(JValue::object(single));
                    }
                }
                JValue::Array(items, _) => {
                    for item in items.iter() {
                        go(item, out);
                    }
                }
                other => out.push(other.clone()),
            }
        }
        let mut out = Vec::new();
        go(&args[0], &mut out);
        Ok(JValue::sequence(out))
    }

    pub fn merge(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let mut merged = indexmap::IndexMap::new();
        for item in items {
            match item {
                JValue::Object(map) => {
                    for (k, v) in map.iter() {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    return Err(EvaluatorError::ArrayElementMismatch {
                        name: "merge".to_string(),
                        index: 1,
                        type_name: "object".to_string(),
                    })
                }
            }
        }
        Ok(JValue::object(merged))
    }

    /// Apply a function to each key/value pair, returning the sequence of
    /// results.
    pub fn each(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let map = args[0].as_object().unwrap();
        let func = &args[1];
        let arity = func.as_function().map_or(2, |f| f.arity());
        let mut out = Vec::with_capacity(map.len());
        for (k, v) in map.iter() {
            let mut call_args = vec![v.clone()];
            if arity >= 2 {
                call_args.push(JValue::string(k.as_str()));
            }
            let res = apply_function(func, call_args, ctx.input, ctx.frame)?;
            if !res.is_undefined() {
                out.push(res);
            }
        }
        Ok(JValue::sequence(out))
    }

    /// Filter an object's properties by a predicate over (value, key).
    pub fn sift(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let map = args[0].as_object().unwrap();
        let func = &args[1];
        let arity = func.as_function().map_or(2, |f| f.arity());
        let mut kept = indexmap::IndexMap::new();
        for (k, v) in map.iter() {
            let mut call_args = vec![v.clone()];
            if arity >= 2 {
                call_args.push(JValue::string(k.as_str()));
            }
            if arity >= 3 {
                call_args.push(args[0].clone());
            }
            let res = apply_function(func, call_args, ctx.input, ctx.frame)?;
            if cast_boolean(&res) {
                kept.insert(k.clone(), v.clone());
            }
        }
        if kept.is_empty() {
            return Ok(JValue::Undefined);
        }
        Ok(JValue::object(kept))
    }

    pub fn type_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::string(match &args[0] {
            JValue::Undefined => return Ok(JValue::Undefined),
            JValue::Null => "null",
            JValue::Bool(_) => "boolean",
            JValue::Integer(_) | JValue::Float(_) => "number",
            JValue::String(_) => "string",
            JValue::Array(..) => "array",
            JValue::Object(_) => "object",
            JValue::Function(_) => "function",
        }))
    }

    pub fn error_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let message = args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("$error() function evaluated")
            .to_string();
        Err(EvaluatorError::Custom { message })
    }
}

// ── Boolean functions ────────────────────────────────────────────────────────

mod boolean {
    use super::*;

    pub fn boolean_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::Bool(cast_boolean(&args[0])))
    }

    pub fn not_fn(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::Bool(!cast_boolean(&args[0])))
    }
}

// ── Higher-order functions ───────────────────────────────────────────────────

mod higher {
    use super::*;

    /// Arguments offered to a callback, truncated to its declared arity
    /// (item, index, whole array).
    fn callback_args(func: &JValue, base: Vec<JValue>) -> Vec<JValue> {
        let arity = func.as_function().map_or(1, |f| f.arity()).max(1);
        let mut args = base;
        args.truncate(arity);
        args
    }

    pub fn map(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let func = &args[1];
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let call_args = callback_args(
                func,
                vec![item.clone(), JValue::Integer(i as i64), args[0].clone()],
            );
            let res = apply_function(func, call_args, ctx.input, ctx.frame)?;
            if !res.is_undefined() {
                out.push(res);
            }
        }
        Ok(JValue::sequence(out))
    }

    pub fn filter(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let func = &args[1];
        let mut out = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let call_args = callback_args(
                func,
                vec![item.clone(), JValue::Integer(i as i64), args[0].clone()],
            );
            let res = apply_function(func, call_args, ctx.input, ctx.frame)?;
            if cast_boolean(&res) {
                out.push(item.clone());
            }
        }
        Ok(JValue::sequence(out))
    }

    pub fn reduce(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let func = &args[1];
        if func.as_function().map_or(0, |f| f.arity()) < 2 {
            return Err(EvaluatorError::ReduceArity);
        }
        let init = args.get(2).cloned().unwrap_or(JValue::Undefined);
        let mut iter = items.iter().cloned();
        let mut acc = if init.is_undefined() {
            match iter.next() {
                Some(first) => first,
                None => return Ok(JValue::Undefined),
            }
        } else {
            init
        };
        for item in iter {
            acc = apply_function(func, vec![acc, item], ctx.input, ctx.frame)?;
        }
        Ok(acc)
    }

    /// Exactly one element must satisfy the predicate.
    pub fn single(ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let items = args[0].as_array().unwrap();
        let mut matched: Vec<JValue> = Vec::new();
        match args.get(1) {
            Some(func @ JValue::Function(_)) => {
                for (i, item) in items.iter().enumerate() {
                    let call_args = callback_args(
                        func,
                        vec![item.clone(), JValue::Integer(i as i64), args[0].clone()],
                    );
                    let res = apply_function(func, call_args, ctx.input, ctx.frame)?;
                    if cast_boolean(&res) {
                        matched.push(item.clone());
                    }
                }
            }
            _ => matched = items.clone(),
        }
        if matched.len() != 1 {
            return Err(EvaluatorError::SingleCardinality {
                count: matched.len(),
            });
        }
        Ok(matched.pop().unwrap())
    }
}

// ── Date and time functions ──────────────────────────────────────────────────

mod time {
    use super::*;
    use crate::datetime;

    pub fn now(ctx: &NativeContext, _args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::string(datetime::format_iso8601(
            &ctx.supplement().now(),
        )))
    }

    pub fn millis(ctx: &NativeContext, _args: &[JValue]) -> Result<JValue, EvaluatorError> {
        Ok(JValue::Integer(ctx.supplement().millis()))
    }

    pub fn from_millis(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let ms = args[0].as_f64().unwrap_or(0.0) as i64;
        Ok(JValue::string(datetime::millis_to_iso8601(ms)?))
    }

    pub fn to_millis(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let s = args[0].as_str().unwrap_or("");
        Ok(JValue::Integer(datetime::iso8601_to_millis(s)?))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;

    fn ctx_fixture(input: JValue) -> (JValue, Rc<Frame>) {
        let frame = Frame::new_root(Rc::new(EvalSupplement::new()));
        (input, frame)
    }

    fn call(name: &str, input: JValue, args: Vec<JValue>) -> Result<JValue, EvaluatorError> {
        let native = lookup_builtin(name).expect("builtin exists");
        let (input, frame) = ctx_fixture(input);
        let ctx = NativeContext {
            input: &input,
            frame: &frame,
            name,
        };
        invoke_native(native, &ctx, args)
    }

    #[test]
    fn test_catalog_is_populated() {
        for name in [
            "string", "length", "sum", "count", "map", "filter", "reduce", "now", "keys",
            "boolean", "split", "join", "round", "zip",
        ] {
            assert!(lookup_builtin(name).is_some(), "missing builtin {}", name);
        }
        assert!(lookup_builtin("nope").is_none());
    }

    #[test]
    fn test_propagate_undefined_short_circuits() {
        assert_eq!(
            call("uppercase", JValue::Undefined, vec![JValue::Undefined]).unwrap(),
            JValue::Undefined
        );
        assert_eq!(
            call("sum", JValue::Undefined, vec![JValue::Undefined]).unwrap(),
            JValue::Undefined
        );
    }

    #[test]
    fn test_context_substitution() {
        // no argument: the evaluation context feeds the first parameter
        assert_eq!(
            call("uppercase", jvalue!("abc"), vec![]).unwrap(),
            jvalue!("ABC")
        );
        // context of the wrong type is a distinct error
        let err = call("uppercase", jvalue!(42i64), vec![]).unwrap_err();
        assert_eq!(err.code(), "T0411");
    }

    #[test]
    fn test_two_phase_binding_shifts_args() {
        // $substring(1, 2) with string context binds the context first
        assert_eq!(
            call(
                "substring",
                jvalue!("hello"),
                vec![jvalue!(1i64), jvalue!(2i64)]
            )
            .unwrap(),
            jvalue!("el")
        );
    }

    #[test]
    fn test_wrong_type_is_t0410() {
        let err = call("uppercase", JValue::Undefined, vec![jvalue!(5i64)]).unwrap_err();
        assert_eq!(err.code(), "T0410");
    }

    #[test]
    fn test_extra_args_rejected() {
        let err = call(
            "uppercase",
            JValue::Undefined,
            vec![jvalue!("a"), jvalue!("b")],
        )
        .unwrap_err();
        assert_eq!(err.code(), "T0410");
    }

    #[test]
    fn test_optional_default() {
        assert_eq!(
            call("join", JValue::Undefined, vec![jvalue!(["a", "b"])]).unwrap(),
            jvalue!("ab")
        );
        assert_eq!(
            call(
                "join",
                JValue::Undefined,
                vec![jvalue!(["a", "b"]), jvalue!("-")]
            )
            .unwrap(),
            jvalue!("a-b")
        );
    }

    #[test]
    fn test_pack_singleton() {
        assert_eq!(
            call("sum", JValue::Undefined, vec![jvalue!(5i64)]).unwrap(),
            jvalue!(5i64)
        );
        assert_eq!(
            call("count", JValue::Undefined, vec![jvalue!("one")]).unwrap(),
            jvalue!(1i64)
        );
    }

    #[test]
    fn test_result_narrowing() {
        // floor returns an exactly-integral float, narrowed to an integer
        assert!(matches!(
            call("floor", JValue::Undefined, vec![jvalue!(3.7)]).unwrap(),
            JValue::Integer(3)
        ));
    }

    #[test]
    fn test_cast_boolean_cases() {
        assert!(!cast_boolean(&JValue::Undefined));
        assert!(!cast_boolean(&JValue::Null));
        assert!(!cast_boolean(&jvalue!("")));
        assert!(cast_boolean(&jvalue!("x")));
        assert!(!cast_boolean(&jvalue!(0i64)));
        assert!(cast_boolean(&jvalue!(0.5)));
        assert!(!cast_boolean(&jvalue!([])));
        assert!(cast_boolean(&jvalue!([0i64, 1i64])));
        assert!(!cast_boolean(&jvalue!([0i64, 0i64])));
        assert!(!cast_boolean(&jvalue!({})));
        assert!(cast_boolean(&jvalue!({"a": 1i64})));
    }

    #[test]
    fn test_cast_string() {
        assert_eq!(cast_string(&jvalue!("x")).unwrap(), "x");
        assert_eq!(cast_string(&jvalue!(2.0)).unwrap(), "2");
        assert_eq!(cast_string(&jvalue!(2.5)).unwrap(), "2.5");
        assert_eq!(cast_string(&jvalue!(null)).unwrap(), "null");
        assert_eq!(
            cast_string(&jvalue!({"a": [1i64, "b"]})).unwrap(),
            "{\"a\":[1,\"b\"]}"
        );
        assert_eq!(
            cast_string(&JValue::Float(f64::INFINITY)).unwrap_err().code(),
            "D3001"
        );
    }

    #[test]
    fn test_substring_negative_start() {
        assert_eq!(
            call(
                "substring",
                JValue::Undefined,
                vec![jvalue!("hello"), jvalue!(-3i64)]
            )
            .unwrap(),
            jvalue!("llo")
        );
    }

    #[test]
    fn test_substring_before_after() {
        assert_eq!(
            call(
                "substringBefore",
                JValue::Undefined,
                vec![jvalue!("a-b-c"), jvalue!("-")]
            )
            .unwrap(),
            jvalue!("a")
        );
        assert_eq!(
            call(
                "substringAfter",
                JValue::Undefined,
                vec![jvalue!("a-b-c"), jvalue!("-")]
            )
            .unwrap(),
            jvalue!("b-c")
        );
        // separator absent: the whole string
        assert_eq!(
            call(
                "substringAfter",
                JValue::Undefined,
                vec![jvalue!("abc"), jvalue!("x")]
            )
            .unwrap(),
            jvalue!("abc")
        );
    }

    #[test]
    fn test_trim_collapses_whitespace() {
        assert_eq!(
            call("trim", JValue::Undefined, vec![jvalue!("  a \n b  ")]).unwrap(),
            jvalue!("a b")
        );
    }

    #[test]
    fn test_pad_both_directions() {
        assert_eq!(
            call("pad", JValue::Undefined, vec![jvalue!("ab"), jvalue!(5i64)]).unwrap(),
            jvalue!("ab   ")
        );
        assert_eq!(
            call(
                "pad",
                JValue::Undefined,
                vec![jvalue!("ab"), jvalue!(-5i64), jvalue!("0")]
            )
            .unwrap(),
            jvalue!("000ab")
        );
    }

    #[test]
    fn test_split_variants() {
        assert_eq!(
            call(
                "split",
                JValue::Undefined,
                vec![jvalue!("a,b,c"), jvalue!(",")]
            )
            .unwrap(),
            jvalue!(["a", "b", "c"])
        );
        assert_eq!(
            call(
                "split",
                JValue::Undefined,
                vec![jvalue!("a,b,c"), jvalue!(","), jvalue!(2i64)]
            )
            .unwrap(),
            jvalue!(["a", "b"])
        );
        let err = call(
            "split",
            JValue::Undefined,
            vec![jvalue!("a"), jvalue!(","), jvalue!(-1i64)],
        )
        .unwrap_err();
        assert_eq!(err.code(), "D3020");
    }

    #[test]
    fn test_number_casts() {
        assert_eq!(
            call("number", JValue::Undefined, vec![jvalue!("42")]).unwrap(),
            jvalue!(42i64)
        );
        assert_eq!(
            call("number", JValue::Undefined, vec![jvalue!(true)]).unwrap(),
            jvalue!(1i64)
        );
        let err = call("number", JValue::Undefined, vec![jvalue!("nope")]).unwrap_err();
        assert_eq!(err.code(), "D3030");
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(
            call("round", JValue::Undefined, vec![jvalue!(2.5)]).unwrap(),
            jvalue!(2i64)
        );
        assert_eq!(
            call("round", JValue::Undefined, vec![jvalue!(3.5)]).unwrap(),
            jvalue!(4i64)
        );
        assert_eq!(
            call("round", JValue::Undefined, vec![jvalue!(-2.5)]).unwrap(),
            jvalue!(-2i64)
        );
        assert_eq!(
            call(
                "round",
                JValue::Undefined,
                vec![jvalue!(1.25), jvalue!(1i64)]
            )
            .unwrap(),
            jvalue!(1.2)
        );
    }

    #[test]
    fn test_sqrt_and_power_errors() {
        assert_eq!(
            call("sqrt", JValue::Undefined, vec![jvalue!(-1i64)])
                .unwrap_err()
                .code(),
            "D3060"
        );
        assert_eq!(
            call(
                "power",
                JValue::Undefined,
                vec![jvalue!(10i64), jvalue!(1000i64)]
            )
            .unwrap_err()
            .code(),
            "D3061"
        );
    }

    #[test]
    fn test_aggregation() {
        assert_eq!(
            call("sum", JValue::Undefined, vec![jvalue!([1i64, 2i64, 3i64])]).unwrap(),
            jvalue!(6i64)
        );
        assert_eq!(
            call("max", JValue::Undefined, vec![jvalue!([1i64, 5i64, 3i64])]).unwrap(),
            jvalue!(5i64)
        );
        assert_eq!(
            call("average", JValue::Undefined, vec![jvalue!([1i64, 2i64])]).unwrap(),
            jvalue!(1.5)
        );
        assert!(call("max", JValue::Undefined, vec![jvalue!([])])
            .unwrap()
            .is_undefined());
        let err = call("sum", JValue::Undefined, vec![jvalue!([1i64, "x"])]).unwrap_err();
        assert_eq!(err.code(), "T0412");
    }

    #[test]
    fn test_count_of_undefined_is_zero() {
        assert_eq!(
            call("count", JValue::Undefined, vec![JValue::Undefined]).unwrap(),
            jvalue!(0i64)
        );
    }

    #[test]
    fn test_append_builtin() {
        assert_eq!(
            call(
                "append",
                JValue::Undefined,
                vec![jvalue!([1i64]), jvalue!(2i64)]
            )
            .unwrap(),
            jvalue!([1i64, 2i64])
        );
        assert_eq!(
            call("append", JValue::Undefined, vec![JValue::Undefined, jvalue!(2i64)]).unwrap(),
            jvalue!(2i64)
        );
    }

    #[test]
    fn test_sort_requires_homogeneous_without_comparator() {
        assert_eq!(
            call("sort", JValue::Undefined, vec![jvalue!([3i64, 1i64, 2i64])]).unwrap(),
            jvalue!([1i64, 2i64, 3i64])
        );
        let err = call("sort", JValue::Undefined, vec![jvalue!([1i64, "a"])]).unwrap_err();
        assert_eq!(err.code(), "D3070");
    }

    #[test]
    fn test_distinct_and_reverse() {
        assert_eq!(
            call(
                "distinct",
                JValue::Undefined,
                vec![jvalue!([1i64, 2i64, 1i64, 3i64])]
            )
            .unwrap(),
            jvalue!([1i64, 2i64, 3i64])
        );
        assert_eq!(
            call("reverse", JValue::Undefined, vec![jvalue!([1i64, 2i64])]).unwrap(),
            jvalue!([2i64, 1i64])
        );
    }

    #[test]
    fn test_zip_is_variadic() {
        assert_eq!(
            call(
                "zip",
                JValue::Undefined,
                vec![jvalue!([1i64, 2i64]), jvalue!([3i64, 4i64, 5i64])]
            )
            .unwrap(),
            jvalue!([[1i64, 3i64], [2i64, 4i64]])
        );
    }

    #[test]
    fn test_keys_merges_array_of_objects() {
        assert_eq!(
            call(
                "keys",
                JValue::Undefined,
                vec![jvalue!([{"a": 1i64}, {"b": 2i64, "a": 3i64}])]
            )
            .unwrap(),
            jvalue!(["a", "b"])
        );
    }

    #[test]
    fn test_merge_objects() {
        assert_eq!(
            call(
                "merge",
                JValue::Undefined,
                vec![jvalue!([{"a": 1i64}, {"b": 2i64}, {"a": 9i64}])]
            )
            .unwrap(),
            jvalue!({"a": 9i64, "b": 2i64})
        );
    }

    #[test]
    fn test_spread() {
        assert_eq!(
            call("spread", JValue::Undefined, vec![jvalue!({"a": 1i64, "b": 2i64})]).unwrap(),
            jvalue!([{"a": 1i64}, {"b": 2i64}])
        );
    }

    #[test]
    fn test_type_names() {
        for (v, expected) in [
            (jvalue!(null), "null"),
            (jvalue!(true), "boolean"),
            (jvalue!(1i64), "number"),
            (jvalue!("s"), "string"),
            (jvalue!([]), "array"),
            (jvalue!({}), "object"),
        ] {
            assert_eq!(
                call("type", JValue::Undefined, vec![v]).unwrap(),
                jvalue!(expected)
            );
        }
    }

    #[test]
    fn test_error_builtin() {
        let err = call("error", JValue::Undefined, vec![jvalue!("boom")]).unwrap_err();
        assert_eq!(err.code(), "D3137");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_exists() {
        assert_eq!(
            call("exists", JValue::Undefined, vec![jvalue!(0i64)]).unwrap(),
            jvalue!(true)
        );
        assert_eq!(
            call("exists", JValue::Undefined, vec![JValue::Undefined]).unwrap(),
            jvalue!(false)
        );
    }
}
