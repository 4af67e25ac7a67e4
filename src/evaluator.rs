// Expression evaluator: a recursive tree walk over the optimized AST.
//
// Evaluation is `(node, input, frame) -> value` where the value may be a
// document value, Undefined, or an engine-internal sequence. The central
// `evaluate` wrapper applies the sequence collapse law to every result, so
// the collapse happens at every path-step boundary. The engine is
// re-entrant: a compiled expression is immutable and may be evaluated
// concurrently as long as each call builds its own frame chain.

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::ast::{AstNode, BinaryOp, CompiledRegex, PathStep, SortTerm, Stage, UnaryOp};
use crate::environment::{EvalSupplement, Frame};
use crate::functions::{self, cast_boolean, cast_string};
use crate::signature::SignatureError;
use crate::utils;
use crate::value::{ArrayFlags, FunctionValue, JValue, LambdaFunction, PartialFunction,
    TransformerFunction};

/// Largest sequence the range operator may allocate.
const MAX_RANGE_SIZE: i64 = 10_000_000;

/// Runtime errors: type errors (T-codes) and dynamic errors (D-codes).
/// Every variant leads its message with the stable code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluatorError {
    #[error("T0410: argument {index} of function {name} does not match function signature")]
    ArgumentMismatch { name: String, index: usize },

    #[error("T0411: context value is not a compatible type with argument {index} of function {name}")]
    ContextTypeMismatch { name: String, index: usize },

    #[error("T0412: argument {index} of function {name} must be an array of {type_name}")]
    ArrayElementMismatch {
        name: String,
        index: usize,
        type_name: String,
    },

    #[error("T1003: key in object structure must evaluate to a string; got: {value}")]
    GroupKeyNotString { value: String },

    #[error("T1006: attempted to invoke a non-function")]
    InvokedNonFunction,

    #[error("T1008: attempted to partially apply a non-function")]
    PartialOfNonFunction,

    #[error("T2001: the left side of the {op} operator must evaluate to a number")]
    LeftSideNotNumber { op: String },

    #[error("T2002: the right side of the {op} operator must evaluate to a number")]
    RightSideNotNumber { op: String },

    #[error("T2003: the left side of the range operator (..) must evaluate to an integer")]
    RangeLhsNotInteger,

    #[error("T2004: the right side of the range operator (..) must evaluate to an integer")]
    RangeRhsNotInteger,

    #[error("T2006: the right side of the function application operator ~> must be a function")]
    ApplyRhsNotFunction,

    #[error("T2007: type mismatch when comparing values {lhs} and {rhs} in order-by clause")]
    SortTypeMismatch { lhs: String, rhs: String },

    #[error("T2008: the expressions within an order-by clause must evaluate to numeric or string values")]
    SortValueNotComparable,

    #[error("T2009: the values {lhs} and {rhs} either side of operator {op} must be of the same data type")]
    ComparisonTypeMismatch {
        lhs: String,
        rhs: String,
        op: String,
    },

    #[error("T2010: the expressions either side of operator {op} must evaluate to numeric or string values")]
    ComparisonNotComparable { op: String },

    #[error("T2011: the insert/update clause of the transform expression must evaluate to an object: {value}")]
    TransformUpdateNotObject { value: String },

    #[error("T2012: the delete clause of the transform expression must evaluate to a string or array of strings: {value}")]
    TransformDeleteNotStrings { value: String },

    #[error("T2013: the transform expression can only update or delete properties of an object")]
    TransformTargetNotObject,

    #[error("D1001: number out of range: {value}")]
    NumberOutOfRange { value: String },

    #[error("D1002: cannot negate a non-numeric value: {value}")]
    NegateNonNumeric { value: String },

    #[error("D1009: multiple key definitions evaluate to same key: {key}")]
    AmbiguousGroupKey { key: String },

    #[error("D2014: the size of the sequence allocated by the range operator (..) must not exceed 1e7; got: {size}")]
    RangeTooLarge { size: i64 },

    #[error("D3001: attempting to invoke string function on Infinity or NaN")]
    StringOfNonFinite,

    #[error("D3010: second argument of replace function cannot be an empty string")]
    ReplaceEmptyPattern,

    #[error("D3011: fourth argument of replace function must evaluate to a positive number")]
    ReplaceLimitNegative,

    #[error("D3012: attempted to replace a matched string with a non-string value")]
    ReplaceNonString,

    #[error("D3020: third argument of split function must evaluate to a positive number")]
    SplitLimitNegative,

    #[error("D3040: third argument of match function must evaluate to a positive number")]
    MatchLimitNegative,

    #[error("D3030: unable to cast value to a number: {value}")]
    CannotCastToNumber { value: String },

    #[error("D3050: the second argument of reduce function must be a function with at least two arguments")]
    ReduceArity,

    #[error("D3060: the sqrt function cannot be applied to a negative number: {value}")]
    SqrtNegative { value: String },

    #[error("D3061: the power function has resulted in a value that cannot be represented as a JSON number: base={base}, exponent={exp}")]
    PowerUnrepresentable { base: String, exp: String },

    #[error("D3070: the single argument form of the sort function can only be applied to an array of strings or an array of numbers; use the second argument to specify a comparison function")]
    SortHeterogeneous,

    #[error("D3110: the argument of the toMillis function must be an ISO 8601 formatted timestamp: {value}")]
    InvalidTimestamp { value: String },

    #[error("D3137: {message}")]
    Custom { message: String },

    #[error("D3139: the $single() function expected exactly 1 matching result; got: {count}")]
    SingleCardinality { count: usize },

    #[error("U1001: stack overflow - maximum evaluation depth exceeded")]
    StackOverflow,

    #[error("D3000: {0}")]
    EvaluationError(String),
}

impl EvaluatorError {
    /// The stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            EvaluatorError::ArgumentMismatch { .. } => "T0410",
            EvaluatorError::ContextTypeMismatch { .. } => "T0411",
            EvaluatorError::ArrayElementMismatch { .. } => "T0412",
            EvaluatorError::GroupKeyNotString { .. } => "T1003",
            EvaluatorError::InvokedNonFunction => "T1006",
            EvaluatorError::PartialOfNonFunction => "T1008",
            EvaluatorError::LeftSideNotNumber { .. } => "T2001",
            EvaluatorError::RightSideNotNumber { .. } => "T2002",
            EvaluatorError::RangeLhsNotInteger => "T2003",
            EvaluatorError::RangeRhsNotInteger => "T2004",
            EvaluatorError::ApplyRhsNotFunction => "T2006",
            EvaluatorError::SortTypeMismatch { .. } => "T2007",
            EvaluatorError::SortValueNotComparable => "T2008",
            EvaluatorError::ComparisonTypeMismatch { .. } => "T2009",
            EvaluatorError::ComparisonNotComparable { .. } => "T2010",
            EvaluatorError::TransformUpdateNotObject { .. } => "T2011",
            EvaluatorError::TransformDeleteNotStrings { .. } => "T2012",
            EvaluatorError::TransformTargetNotObject => "T2013",
            EvaluatorError::NumberOutOfRange { .. } => "D1001",
            EvaluatorError::NegateNonNumeric { .. } => "D1002",
            EvaluatorError::AmbiguousGroupKey { .. } => "D1009",
            EvaluatorError::RangeTooLarge { .. } => "D2014",
            EvaluatorError::StringOfNonFinite => "D3001",
            EvaluatorError::ReplaceEmptyPattern => "D3010",
            EvaluatorError::ReplaceLimitNegative => "D3011",
            EvaluatorError::ReplaceNonString => "D3012",
            EvaluatorError::SplitLimitNegative => "D3020",
            EvaluatorError::MatchLimitNegative => "D3040",
            EvaluatorError::CannotCastToNumber { .. } => "D3030",
            EvaluatorError::ReduceArity => "D3050",
            EvaluatorError::SqrtNegative { .. } => "D3060",
            EvaluatorError::PowerUnrepresentable { .. } => "D3061",
            EvaluatorError::SortHeterogeneous => "D3070",
            EvaluatorError::InvalidTimestamp { .. } => "D3110",
            EvaluatorError::Custom { .. } => "D3137",
            EvaluatorError::SingleCardinality { .. } => "D3139",
            EvaluatorError::StackOverflow => "U1001",
            EvaluatorError::EvaluationError(_) => "D3000",
        }
    }
}

impl From<SignatureError> for EvaluatorError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::ArgumentMismatch { name, index } => {
                EvaluatorError::ArgumentMismatch { name, index }
            }
            SignatureError::ContextTypeMismatch { name, index } => {
                EvaluatorError::ContextTypeMismatch { name, index }
            }
            SignatureError::ArrayElementMismatch {
                name,
                index,
                type_name,
            } => EvaluatorError::ArrayElementMismatch {
                name,
                index,
                type_name,
            },
            SignatureError::InvalidSignature { reason } => {
                EvaluatorError::EvaluationError(reason)
            }
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

/// Evaluate a node against an input value and a frame. The result of every
/// node is passed through the sequence collapse law, which is what makes
/// nested paths behave (see value.rs).
pub fn evaluate(
    node: &AstNode,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    let supplement = Rc::clone(frame.supplement());
    if !supplement.try_enter() {
        supplement.exit();
        return Err(EvaluatorError::StackOverflow);
    }
    let result = evaluate_inner(node, input, frame);
    supplement.exit();
    result.map(JValue::into_reduced)
}

fn evaluate_inner(
    node: &AstNode,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    match node {
        // ── Literals ─────────────────────────────────────────────────────
        AstNode::String(s) => Ok(JValue::string(s.as_str())),
        AstNode::Integer(n) => Ok(JValue::Integer(*n)),
        AstNode::Float(n) => Ok(JValue::Float(*n)),
        AstNode::Bool(b) => Ok(JValue::Bool(*b)),
        AstNode::Null => Ok(JValue::Null),
        AstNode::Regex(regex) => Ok(JValue::function(FunctionValue::Matcher(regex.clone()))),

        // ── References ───────────────────────────────────────────────────
        AstNode::Variable(name) => {
            if name.is_empty() {
                // `$` — the evaluation context
                return Ok(input.clone());
            }
            if frame.is_bound(name) {
                return Ok(frame.lookup(name));
            }
            match functions::lookup_builtin(name) {
                Some(native) => Ok(JValue::function(FunctionValue::Native(native.clone()))),
                None => Ok(JValue::Undefined),
            }
        }

        AstNode::Name { value, .. } => Ok(lookup_name(input, value)),

        AstNode::Wildcard => Ok(wildcard_values(input)),

        AstNode::Descendant => {
            if input.is_undefined() {
                return Ok(JValue::Undefined);
            }
            let mut results = Vec::new();
            collect_descendants(input, &mut results);
            Ok(JValue::sequence(results))
        }

        AstNode::ParentSlot { label } => Ok(frame.lookup(label)),

        AstNode::Placeholder => Err(EvaluatorError::EvaluationError(
            "the argument placeholder ? can only be used inside a function invocation".to_string(),
        )),

        // ── Structure ────────────────────────────────────────────────────
        AstNode::Block(exprs) => {
            // a block creates its own scope for := bindings
            let scope = Frame::child(frame);
            let mut result = JValue::Undefined;
            for expr in exprs {
                result = evaluate(expr, input, &scope)?;
            }
            Ok(result)
        }

        AstNode::Array { items } => {
            let mut result = Vec::new();
            for item in items {
                let value = evaluate(item, input, frame)?;
                if value.is_undefined() {
                    continue;
                }
                if matches!(item, AstNode::Array { .. }) {
                    // nested constructors stay nested
                    result.push(value);
                } else {
                    utils::append_into(&mut result, value);
                }
            }
            Ok(JValue::array_with_flags(result, ArrayFlags::CONS))
        }

        AstNode::Object(pairs) => evaluate_group_pairs(pairs, input.clone(), frame),

        AstNode::GroupBy { input: expr, pairs } => {
            let value = evaluate(expr, input, frame)?;
            evaluate_group_pairs(pairs, value, frame)
        }

        AstNode::Filter {
            input: expr,
            predicates,
        } => {
            let mut value = evaluate(expr, input, frame)?;
            for predicate in predicates {
                value = apply_filter(value, predicate, frame)?;
            }
            Ok(value)
        }

        AstNode::KeepArray { input: expr } => {
            let value = evaluate(expr, input, frame)?;
            Ok(match value {
                JValue::Undefined => JValue::Undefined,
                JValue::Array(items, flags) => JValue::Array(
                    items,
                    flags.with(ArrayFlags::SEQUENCE).with(ArrayFlags::SINGLETON),
                ),
                other => JValue::array_with_flags(
                    vec![other],
                    ArrayFlags::SEQUENCE.with(ArrayFlags::SINGLETON),
                ),
            })
        }

        // ── Operators ────────────────────────────────────────────────────
        AstNode::Unary { op, expr } => {
            let value = evaluate(expr, input, frame)?;
            match op {
                UnaryOp::Negate => match value {
                    JValue::Undefined => Ok(JValue::Undefined),
                    JValue::Integer(n) => Ok(JValue::Integer(-n)),
                    JValue::Float(n) => Ok(JValue::Float(-n)),
                    other => Err(EvaluatorError::NegateNonNumeric {
                        value: other.to_string(),
                    }),
                },
            }
        }

        AstNode::Binary { op, lhs, rhs } => evaluate_binary(*op, lhs, rhs, input, frame),

        AstNode::Conditional {
            condition,
            then_branch,
            else_branch,
        } => {
            let test = evaluate(condition, input, frame)?;
            if cast_boolean(&test) {
                evaluate(then_branch, input, frame)
            } else {
                match else_branch {
                    Some(e) => evaluate(e, input, frame),
                    None => Ok(JValue::Undefined),
                }
            }
        }

        AstNode::Bind { name, value } => {
            let bound = evaluate(value, input, frame)?;
            frame.bind(name.clone(), bound.clone());
            Ok(bound)
        }

        // ── Functions ────────────────────────────────────────────────────
        AstNode::Lambda {
            params,
            signature,
            body,
            thunk,
        } => Ok(JValue::function(FunctionValue::Lambda(LambdaFunction {
            params: params.clone(),
            signature: signature.clone(),
            body: std::sync::Arc::clone(body),
            env: Rc::clone(frame),
            input: input.clone(),
            thunk: *thunk,
        }))),

        AstNode::Call { procedure, args } => {
            let func = evaluate(procedure, input, frame)?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate(arg, input, frame)?);
            }
            if !func.is_function() {
                return Err(EvaluatorError::InvokedNonFunction);
            }
            apply_function(&func, evaluated, input, frame)
        }

        AstNode::Partial { procedure, args } => {
            let func = evaluate(procedure, input, frame)?;
            if !func.is_function() {
                return Err(EvaluatorError::PartialOfNonFunction);
            }
            let mut fixed = Vec::with_capacity(args.len());
            for arg in args {
                if matches!(arg, AstNode::Placeholder) {
                    fixed.push(None);
                } else {
                    fixed.push(Some(evaluate(arg, input, frame)?));
                }
            }
            Ok(JValue::function(FunctionValue::Partial(PartialFunction {
                func,
                args: fixed,
            })))
        }

        AstNode::Apply { lhs, rhs } => evaluate_apply(lhs, rhs, input, frame),

        AstNode::Transform {
            pattern,
            update,
            delete,
        } => Ok(JValue::function(FunctionValue::Transformer(
            TransformerFunction {
                pattern: std::sync::Arc::clone(pattern),
                update: std::sync::Arc::clone(update),
                delete: delete.as_ref().map(std::sync::Arc::clone),
                env: Rc::clone(frame),
            },
        ))),

        // ── Paths ────────────────────────────────────────────────────────
        AstNode::Path {
            steps,
            keep_singleton_array,
        } => evaluate_path(steps, *keep_singleton_array, input, frame),

        AstNode::SortTerms(_) => {
            unreachable!("sort step evaluated outside of a path")
        }

        // interim nodes must have been rewritten by the optimizer; reaching
        // one here is a bug in compilation, not a runtime condition
        interim @ (AstNode::Map { .. }
        | AstNode::FilterWrap { .. }
        | AstNode::GroupWrap { .. }
        | AstNode::SortWrap { .. }
        | AstNode::FocusBind { .. }
        | AstNode::IndexBind { .. }
        | AstNode::Parent { .. }) => {
            unreachable!("interim node reached the evaluator: {:?}", interim)
        }
    }
}

// ── Name / wildcard / descendant lookup ──────────────────────────────────────

/// Field lookup with array broadcast: applied to an array, the lookup maps
/// over the elements (recursively for nested arrays), dropping misses and
/// flattening per-element array results into one sequence.
fn lookup_name(input: &JValue, key: &str) -> JValue {
    match input {
        JValue::Object(map) => match map.get(key) {
            Some(value) => value.clone(),
            None => JValue::Undefined,
        },
        JValue::Array(items, _) => {
            let mut results = Vec::new();
            for item in items.iter() {
                let res = lookup_name(item, key);
                match res {
                    JValue::Undefined => {}
                    JValue::Array(inner, _) => results.extend(inner.iter().cloned()),
                    other => results.push(other),
                }
            }
            JValue::sequence(results)
        }
        _ => JValue::Undefined,
    }
}

/// `*` — the property values of an object, with array values flattened all
/// the way down but without recursing into child objects.
fn wildcard_values(input: &JValue) -> JValue {
    let mut target = input;
    // the outer wrapper created around a non-array input is transparent
    if let JValue::Array(items, flags) = input {
        if flags.has(ArrayFlags::OUTER_WRAPPER) && !items.is_empty() {
            target = &items[0];
        }
    }
    let mut results = Vec::new();
    if let JValue::Object(map) = target {
        for value in map.values() {
            match value {
                JValue::Array(..) => utils::flatten_deep_into(value, &mut results),
                other => results.push(other.clone()),
            }
        }
    }
    JValue::sequence(results)
}

/// `**` — depth-first pre-order visit: objects contribute themselves and
/// recurse into their values, arrays recurse without contributing, leaves
/// contribute themselves.
fn collect_descendants(value: &JValue, results: &mut Vec<JValue>) {
    match value {
        JValue::Array(items, _) => {
            for item in items.iter() {
                collect_descendants(item, results);
            }
        }
        JValue::Object(map) => {
            results.push(value.clone());
            for child in map.values() {
                collect_descendants(child, results);
            }
        }
        other => results.push(other.clone()),
    }
}

// ── Binary operators ─────────────────────────────────────────────────────────

fn evaluate_binary(
    op: BinaryOp,
    lhs: &AstNode,
    rhs: &AstNode,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    use BinaryOp::*;
    match op {
        Add | Subtract | Multiply | Divide | Modulo => {
            let left = evaluate(lhs, input, frame)?;
            let right = evaluate(rhs, input, frame)?;
            evaluate_numeric(op, left, right)
        }

        Equal | NotEqual => {
            let left = evaluate(lhs, input, frame)?;
            let right = evaluate(rhs, input, frame)?;
            // an undefined operand makes both = and != false
            if left.is_undefined() || right.is_undefined() {
                return Ok(JValue::Bool(false));
            }
            let eq = left == right;
            Ok(JValue::Bool(if op == Equal { eq } else { !eq }))
        }

        LessThan | LessThanOrEqual | GreaterThan | GreaterThanOrEqual => {
            let left = evaluate(lhs, input, frame)?;
            let right = evaluate(rhs, input, frame)?;
            evaluate_comparison(op, left, right)
        }

        And => {
            let left = evaluate(lhs, input, frame)?;
            if !cast_boolean(&left) {
                return Ok(JValue::Bool(false));
            }
            let right = evaluate(rhs, input, frame)?;
            Ok(JValue::Bool(cast_boolean(&right)))
        }

        Or => {
            let left = evaluate(lhs, input, frame)?;
            if cast_boolean(&left) {
                return Ok(JValue::Bool(true));
            }
            let right = evaluate(rhs, input, frame)?;
            Ok(JValue::Bool(cast_boolean(&right)))
        }

        Concatenate => {
            let left = evaluate(lhs, input, frame)?;
            let right = evaluate(rhs, input, frame)?;
            let mut result = concat_fragment(&left)?;
            result.push_str(&concat_fragment(&right)?);
            Ok(JValue::string(result))
        }

        In => {
            let left = evaluate(lhs, input, frame)?;
            let right = evaluate(rhs, input, frame)?;
            if left.is_undefined() || right.is_undefined() {
                return Ok(JValue::Bool(false));
            }
            let found = match &right {
                JValue::Array(items, _) => items.iter().any(|item| *item == left),
                other => *other == left,
            };
            Ok(JValue::Bool(found))
        }

        Range => {
            let left = evaluate(lhs, input, frame)?;
            let right = evaluate(rhs, input, frame)?;
            evaluate_range(left, right)
        }

        Coalesce => {
            let left = evaluate(lhs, input, frame)?;
            if left.is_undefined() {
                evaluate(rhs, input, frame)
            } else {
                Ok(left)
            }
        }

        Default => {
            let left = evaluate(lhs, input, frame)?;
            if cast_boolean(&left) {
                Ok(left)
            } else {
                evaluate(rhs, input, frame)
            }
        }
    }
}

fn evaluate_numeric(op: BinaryOp, left: JValue, right: JValue) -> Result<JValue, EvaluatorError> {
    if left.is_undefined() || right.is_undefined() {
        return Ok(JValue::Undefined);
    }
    if !left.is_number() {
        return Err(EvaluatorError::LeftSideNotNumber { op: op.to_string() });
    }
    if !right.is_number() {
        return Err(EvaluatorError::RightSideNotNumber { op: op.to_string() });
    }

    // integer arithmetic stays integral while it fits; division always
    // happens in floating point
    if let (JValue::Integer(a), JValue::Integer(b)) = (&left, &right) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Subtract => a.checked_sub(*b),
            BinaryOp::Multiply => a.checked_mul(*b),
            BinaryOp::Modulo if *b != 0 => a.checked_rem(*b),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(JValue::Integer(n));
        }
    }

    let a = left.as_f64().unwrap();
    let b = right.as_f64().unwrap();
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        _ => unreachable!("non-arithmetic op in evaluate_numeric"),
    };
    if !result.is_finite() {
        return Err(EvaluatorError::NumberOutOfRange {
            value: format!("{} {} {}", a, op, b),
        });
    }
    Ok(JValue::number(result))
}

fn evaluate_comparison(
    op: BinaryOp,
    left: JValue,
    right: JValue,
) -> Result<JValue, EvaluatorError> {
    if left.is_undefined() || right.is_undefined() {
        return Ok(JValue::Undefined);
    }
    let comparable =
        |v: &JValue| v.is_number() || v.is_string();
    if !comparable(&left) || !comparable(&right) {
        return Err(EvaluatorError::ComparisonNotComparable { op: op.to_string() });
    }

    let ordering = match (&left, &right) {
        (a, b) if a.is_number() && b.is_number() => a
            .as_f64()
            .unwrap()
            .partial_cmp(&b.as_f64().unwrap())
            .ok_or(EvaluatorError::ComparisonNotComparable { op: op.to_string() })?,
        (JValue::String(a), JValue::String(b)) => a.cmp(b),
        _ => {
            return Err(EvaluatorError::ComparisonTypeMismatch {
                lhs: left.to_string(),
                rhs: right.to_string(),
                op: op.to_string(),
            })
        }
    };

    let result = match op {
        BinaryOp::LessThan => ordering.is_lt(),
        BinaryOp::LessThanOrEqual => ordering.is_le(),
        BinaryOp::GreaterThan => ordering.is_gt(),
        BinaryOp::GreaterThanOrEqual => ordering.is_ge(),
        _ => unreachable!("non-comparison op in evaluate_comparison"),
    };
    Ok(JValue::Bool(result))
}

fn concat_fragment(value: &JValue) -> Result<String, EvaluatorError> {
    if value.is_undefined() {
        return Ok(String::new());
    }
    cast_string(value)
}

fn evaluate_range(left: JValue, right: JValue) -> Result<JValue, EvaluatorError> {
    if left.is_undefined() || right.is_undefined() {
        return Ok(JValue::Undefined);
    }
    let lo = match &left {
        JValue::Integer(n) => *n,
        _ => return Err(EvaluatorError::RangeLhsNotInteger),
    };
    let hi = match &right {
        JValue::Integer(n) => *n,
        _ => return Err(EvaluatorError::RangeRhsNotInteger),
    };
    if lo > hi {
        return Ok(JValue::Undefined);
    }
    let size = hi - lo + 1;
    if size > MAX_RANGE_SIZE {
        return Err(EvaluatorError::RangeTooLarge { size });
    }
    let values: Vec<JValue> = (lo..=hi).map(JValue::Integer).collect();
    // a range is a plain array: `1..1` stays `[1]`
    Ok(JValue::array(values))
}

// ── Path evaluation ──────────────────────────────────────────────────────────

fn evaluate_path(
    steps: &[PathStep],
    keep_singleton_array: bool,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    let first_is_variable = matches!(steps[0].node, AstNode::Variable(_));

    // the input sequence: arrays iterate element-wise unless the path is
    // variable-rooted (absolute) or starts with an array constructor
    let input_items: Vec<JValue> = match input {
        JValue::Array(items, _) if !first_is_variable && !steps[0].cons_array => {
            items.as_ref().clone()
        }
        other => vec![other.clone()],
    };

    if steps.iter().any(|s| s.tuple) {
        return evaluate_tuple_path(steps, keep_singleton_array, input, input_items, frame);
    }

    let mut sequence = input_items;
    let mut result = JValue::Undefined;
    for (i, step) in steps.iter().enumerate() {
        let last = i + 1 == steps.len();
        result = if i == 0 && step.cons_array {
            // an explicit array constructor heads the path: evaluate it once
            // against the original input instead of mapping over it
            let mut value = evaluate(&step.node, input, frame)?;
            for Stage::Filter(predicate) in &step.stages {
                value = apply_filter(value, predicate, frame)?;
            }
            value
        } else {
            evaluate_step(step, &sequence, frame, last)?
        };

        match &result {
            JValue::Undefined => return Ok(JValue::Undefined),
            JValue::Array(items, _) if items.is_empty() => return Ok(JValue::Undefined),
            JValue::Array(items, _) => sequence = items.as_ref().clone(),
            other => sequence = vec![other.clone()],
        }
    }

    if keep_singleton_array {
        result = result.with_flag(ArrayFlags::SEQUENCE.with(ArrayFlags::SINGLETON));
    }
    Ok(result)
}

fn evaluate_step(
    step: &PathStep,
    input_items: &[JValue],
    frame: &Rc<Frame>,
    last_step: bool,
) -> Result<JValue, EvaluatorError> {
    if let AstNode::SortTerms(terms) = &step.node {
        let sorted = sort_values(input_items.to_vec(), terms, frame)?;
        let mut result = JValue::sequence(sorted);
        for Stage::Filter(predicate) in &step.stages {
            result = apply_filter(result, predicate, frame)?;
        }
        return Ok(result);
    }

    // evaluate the step against every element; stages filter each
    // element's result before it joins the output
    let mut per_item = Vec::new();
    for item in input_items {
        let mut res = evaluate(&step.node, item, frame)?;
        for Stage::Filter(predicate) in &step.stages {
            res = apply_filter(res, predicate, frame)?;
        }
        if !res.is_undefined() {
            per_item.push(res);
        }
    }

    // the last step's output stays unflattened when it alone produced
    // exactly one plain array (e.g. a path ending in an array constructor)
    if last_step && per_item.len() == 1 && per_item[0].is_array() && !per_item[0].is_sequence() {
        return Ok(per_item.pop().unwrap());
    }

    let mut out = Vec::new();
    for res in per_item {
        match res {
            JValue::Array(items, flags) if !flags.has(ArrayFlags::CONS) => {
                out.extend(items.iter().cloned());
            }
            other => out.push(other),
        }
    }
    Ok(JValue::sequence(out))
}

// ── Tuple streams ────────────────────────────────────────────────────────────

/// One element of a tuple stream: the value plus the variable bindings
/// (focus/index variables and ancestor slot labels) accumulated so far.
#[derive(Clone)]
struct TupleItem {
    value: JValue,
    bindings: HashMap<String, JValue>,
}

fn tuple_frame(frame: &Rc<Frame>, bindings: &HashMap<String, JValue>) -> Rc<Frame> {
    let child = Frame::child(frame);
    for (name, value) in bindings {
        child.bind(name.clone(), value.clone());
    }
    child
}

fn evaluate_tuple_path(
    steps: &[PathStep],
    keep_singleton_array: bool,
    input: &JValue,
    input_items: Vec<JValue>,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    let mut items: Vec<TupleItem> = input_items
        .into_iter()
        .map(|value| TupleItem {
            value,
            bindings: HashMap::new(),
        })
        .collect();

    for (i, step) in steps.iter().enumerate() {
        if i == 0 && step.cons_array {
            let value = evaluate(&step.node, input, frame)?;
            items = match value {
                JValue::Undefined => Vec::new(),
                JValue::Array(elems, _) => elems
                    .iter()
                    .map(|v| TupleItem {
                        value: v.clone(),
                        bindings: HashMap::new(),
                    })
                    .collect(),
                other => vec![TupleItem {
                    value: other,
                    bindings: HashMap::new(),
                }],
            };
            continue;
        }
        items = evaluate_tuple_step(step, items, frame)?;
        if items.is_empty() {
            return Ok(JValue::Undefined);
        }
    }

    let values: Vec<JValue> = items.into_iter().map(|t| t.value).collect();
    let mut result = JValue::sequence(values);
    if keep_singleton_array {
        result = result.with_flag(ArrayFlags::SINGLETON);
    }
    Ok(result)
}

fn evaluate_tuple_step(
    step: &PathStep,
    items: Vec<TupleItem>,
    frame: &Rc<Frame>,
) -> Result<Vec<TupleItem>, EvaluatorError> {
    if let AstNode::SortTerms(terms) = &step.node {
        let mut sorted = sort_tuples(items, terms, frame)?;
        for Stage::Filter(predicate) in &step.stages {
            sorted = filter_tuples(sorted, predicate, frame)?;
        }
        return Ok(sorted);
    }

    let mut result = Vec::new();
    for item in &items {
        let step_frame = tuple_frame(frame, &item.bindings);
        let res = evaluate(&step.node, &item.value, &step_frame)?;
        if res.is_undefined() {
            continue;
        }
        let values: Vec<JValue> = match res {
            JValue::Array(elems, _) => elems.as_ref().clone(),
            other => vec![other],
        };
        for (position, value) in values.into_iter().enumerate() {
            let mut tuple = TupleItem {
                value: value.clone(),
                bindings: item.bindings.clone(),
            };
            if let Some(focus) = &step.focus_var {
                // focus binding captures the value but keeps the context at
                // the parent level, enabling cross-product joins
                tuple.bindings.insert(focus.clone(), value);
                tuple.value = item.value.clone();
            }
            if let Some(index) = &step.index_var {
                tuple
                    .bindings
                    .insert(index.clone(), JValue::Integer(position as i64));
            }
            for label in &step.ancestors {
                tuple.bindings.insert(label.clone(), item.value.clone());
            }
            result.push(tuple);
        }
    }

    // stages filter the assembled stream, seeing each tuple's bindings
    for Stage::Filter(predicate) in &step.stages {
        result = filter_tuples(result, predicate, frame)?;
    }
    Ok(result)
}

fn filter_tuples(
    items: Vec<TupleItem>,
    predicate: &AstNode,
    frame: &Rc<Frame>,
) -> Result<Vec<TupleItem>, EvaluatorError> {
    // literal index fast path
    if let Some(index) = literal_index(predicate) {
        let len = items.len() as i64;
        let idx = if index < 0 { len + index } else { index };
        if idx < 0 || idx >= len {
            return Ok(Vec::new());
        }
        return Ok(vec![items[idx as usize].clone()]);
    }

    let mut kept = Vec::new();
    for (position, item) in items.iter().enumerate() {
        let item_frame = tuple_frame(frame, &item.bindings);
        let res = evaluate(predicate, &item.value, &item_frame)?;
        if keep_by_predicate(&res, position, items.len()) {
            kept.push(item.clone());
        }
    }
    Ok(kept)
}

// ── Predicate filtering ──────────────────────────────────────────────────────

fn literal_index(predicate: &AstNode) -> Option<i64> {
    match predicate {
        AstNode::Integer(n) => Some(*n),
        AstNode::Float(n) => Some(n.floor() as i64),
        _ => None,
    }
}

/// Does a predicate result retain the element at `position`? Numeric
/// results are positional indexes (0-based, negative counting from the
/// end); anything else is cast to boolean.
fn keep_by_predicate(res: &JValue, position: usize, len: usize) -> bool {
    let indexes: Option<Vec<f64>> = match res {
        JValue::Integer(_) | JValue::Float(_) => Some(vec![res.as_f64().unwrap()]),
        JValue::Array(items, _) if !items.is_empty() && items.iter().all(|v| v.is_number()) => {
            Some(items.iter().map(|v| v.as_f64().unwrap()).collect())
        }
        _ => None,
    };
    match indexes {
        Some(indexes) => indexes.into_iter().any(|raw| {
            let mut idx = raw.floor() as i64;
            if idx < 0 {
                idx += len as i64;
            }
            idx == position as i64
        }),
        None => cast_boolean(res),
    }
}

/// Apply one bracketed predicate to a value (evaluateFilter).
pub(crate) fn apply_filter(
    value: JValue,
    predicate: &AstNode,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    if value.is_undefined() {
        return Ok(JValue::Undefined);
    }
    let items: Vec<JValue> = match &value {
        JValue::Array(arr, _) => arr.as_ref().clone(),
        other => vec![other.clone()],
    };

    if let Some(index) = literal_index(predicate) {
        let len = items.len() as i64;
        let idx = if index < 0 { len + index } else { index };
        if idx < 0 || idx >= len {
            return Ok(JValue::sequence(Vec::new()));
        }
        let item = items[idx as usize].clone();
        // a selected element that is itself an array is not unwrapped
        return Ok(match item {
            JValue::Array(inner, flags) => JValue::Array(inner, flags),
            other => JValue::sequence(vec![other]),
        });
    }

    let mut kept = Vec::new();
    for (position, item) in items.iter().enumerate() {
        let res = evaluate(predicate, item, frame)?;
        if keep_by_predicate(&res, position, items.len()) {
            kept.push(item.clone());
        }
    }
    Ok(JValue::sequence(kept))
}

// ── Sorting ──────────────────────────────────────────────────────────────────

fn compare_terms(
    terms: &[SortTerm],
    a_ctx: &JValue,
    a_frame: &Rc<Frame>,
    b_ctx: &JValue,
    b_frame: &Rc<Frame>,
) -> Result<bool, EvaluatorError> {
    for term in terms {
        let va = evaluate(&term.expr, a_ctx, a_frame)?;
        let vb = evaluate(&term.expr, b_ctx, b_frame)?;

        // undefined sorts to the end regardless of direction
        if va.is_undefined() {
            if vb.is_undefined() {
                continue;
            }
            return Ok(true);
        }
        if vb.is_undefined() {
            return Ok(false);
        }

        let comp = if va.is_number() && vb.is_number() {
            let fa = va.as_f64().unwrap();
            let fb = vb.as_f64().unwrap();
            if fa == fb {
                continue;
            }
            fa > fb
        } else if let (JValue::String(sa), JValue::String(sb)) = (&va, &vb) {
            if sa == sb {
                continue;
            }
            sa > sb
        } else if (va.is_number() || va.is_string()) && (vb.is_number() || vb.is_string()) {
            return Err(EvaluatorError::SortTypeMismatch {
                lhs: va.to_string(),
                rhs: vb.to_string(),
            });
        } else {
            return Err(EvaluatorError::SortValueNotComparable);
        };

        return Ok(if term.descending { !comp } else { comp });
    }
    Ok(false)
}

fn sort_values(
    values: Vec<JValue>,
    terms: &[SortTerm],
    frame: &Rc<Frame>,
) -> Result<Vec<JValue>, EvaluatorError> {
    utils::merge_sort(values, &mut |a, b| compare_terms(terms, a, frame, b, frame))
}

fn sort_tuples(
    items: Vec<TupleItem>,
    terms: &[SortTerm],
    frame: &Rc<Frame>,
) -> Result<Vec<TupleItem>, EvaluatorError> {
    utils::merge_sort(items, &mut |a, b| {
        let fa = tuple_frame(frame, &a.bindings);
        let fb = tuple_frame(frame, &b.bindings);
        compare_terms(terms, &a.value, &fa, &b.value, &fb)
    })
}

// ── Grouping ─────────────────────────────────────────────────────────────────

/// Object constructor / group-by evaluation. Key expressions are evaluated
/// per input element; elements sharing a key accumulate, and the value
/// expression runs once per group with the accumulated items as context.
fn evaluate_group_pairs(
    pairs: &[(AstNode, AstNode)],
    input: JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    struct GroupEntry {
        items: JValue,
        pair_index: usize,
    }

    let items: Vec<JValue> = match input {
        JValue::Undefined => vec![JValue::Undefined],
        JValue::Array(arr, _) if arr.is_empty() => vec![JValue::Undefined],
        JValue::Array(arr, _) => arr.as_ref().clone(),
        other => vec![other],
    };

    let mut groups: indexmap::IndexMap<String, GroupEntry> = indexmap::IndexMap::new();
    for item in &items {
        for (pair_index, (key_expr, _)) in pairs.iter().enumerate() {
            let key = evaluate(key_expr, item, frame)?;
            let key = match key {
                JValue::String(s) => s.to_string(),
                JValue::Undefined => continue,
                other => {
                    return Err(EvaluatorError::GroupKeyNotString {
                        value: other.to_string(),
                    })
                }
            };
            match groups.get_mut(&key) {
                Some(entry) => {
                    // the same key produced by two different pair
                    // definitions during one pass is ambiguous
                    if entry.pair_index != pair_index {
                        return Err(EvaluatorError::AmbiguousGroupKey { key });
                    }
                    entry.items = utils::append(entry.items.clone(), item.clone());
                }
                None => {
                    groups.insert(
                        key,
                        GroupEntry {
                            items: item.clone(),
                            pair_index,
                        },
                    );
                }
            }
        }
    }

    let mut result = indexmap::IndexMap::new();
    for (key, entry) in groups {
        let value = evaluate(&pairs[entry.pair_index].1, &entry.items, frame)?;
        if !value.is_undefined() {
            result.insert(key, value);
        }
    }
    Ok(JValue::object(result))
}

// ── Function application ─────────────────────────────────────────────────────

/// Apply a function value with a trampoline: when the invoked lambda was
/// marked as a tail-call thunk, keep unwrapping and re-applying instead of
/// recursing, bounding stack depth for tail-recursive functions.
pub fn apply_function(
    func: &JValue,
    args: Vec<JValue>,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    let mut result = apply_inner(func, args, input, frame)?;
    loop {
        let tail = match &result {
            JValue::Function(f) => match &**f {
                FunctionValue::Lambda(lambda) if lambda.thunk => {
                    let (procedure, arg_nodes) = match &*lambda.body {
                        AstNode::Call { procedure, args } => (procedure, args),
                        _ => break,
                    };
                    let next_func = evaluate(procedure, &lambda.input, &lambda.env)?;
                    let mut next_args = Vec::with_capacity(arg_nodes.len());
                    for arg in arg_nodes {
                        next_args.push(evaluate(arg, &lambda.input, &lambda.env)?);
                    }
                    if !next_func.is_function() {
                        return Err(EvaluatorError::InvokedNonFunction);
                    }
                    Some((next_func, next_args))
                }
                _ => None,
            },
            _ => None,
        };
        match tail {
            Some((next_func, next_args)) => {
                result = apply_inner(&next_func, next_args, input, frame)?;
            }
            None => break,
        }
    }
    Ok(result)
}

fn apply_inner(
    func: &JValue,
    args: Vec<JValue>,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    let function = match func {
        JValue::Function(f) => f,
        _ => return Err(EvaluatorError::InvokedNonFunction),
    };
    match &**function {
        FunctionValue::Lambda(lambda) => apply_lambda(lambda, args, input),

        FunctionValue::Native(native) => {
            let ctx = functions::NativeContext {
                input,
                frame,
                name: &native.name,
            };
            functions::invoke_native(native, &ctx, args)
        }

        FunctionValue::Partial(partial) => {
            let merged = merge_partial_args(&partial.args, args);
            apply_function(&partial.func, merged, input, frame)
        }

        FunctionValue::Matcher(regex) => apply_matcher(regex, args.first()),

        FunctionValue::Transformer(transformer) => {
            let arg = args.into_iter().next().unwrap_or(JValue::Undefined);
            apply_transform(transformer, arg)
        }

        FunctionValue::Chain { first, second } => {
            let intermediate = apply_function(first, args, input, frame)?;
            apply_function(second, vec![intermediate], input, frame)
        }
    }
}

fn apply_lambda(
    lambda: &LambdaFunction,
    args: Vec<JValue>,
    context: &JValue,
) -> Result<JValue, EvaluatorError> {
    let args = match &lambda.signature {
        Some(sig) => sig.validate("lambda", &args, context)?,
        None => args,
    };
    // bind parameters positionally in a child of the captured closure
    // environment: lexical, not dynamic, scoping. Missing trailing
    // arguments bind to Undefined; extras are ignored.
    let call_frame = Frame::child(&lambda.env);
    for (i, param) in lambda.params.iter().enumerate() {
        let value = args.get(i).cloned().unwrap_or(JValue::Undefined);
        call_frame.bind(param.clone(), value);
    }
    evaluate(&lambda.body, &lambda.input, &call_frame)
}

/// Fill placeholder slots left-to-right from the supplied arguments; extra
/// arguments append at the end, absent ones become Undefined.
fn merge_partial_args(fixed: &[Option<JValue>], supplied: Vec<JValue>) -> Vec<JValue> {
    let mut supplied = supplied.into_iter();
    let mut merged = Vec::with_capacity(fixed.len());
    for slot in fixed {
        match slot {
            Some(value) => merged.push(value.clone()),
            None => merged.push(supplied.next().unwrap_or(JValue::Undefined)),
        }
    }
    merged.extend(supplied);
    merged
}

/// A regex literal applied as a function: match against the string argument
/// and return the match structure, or Undefined when there is no match.
fn apply_matcher(
    regex: &CompiledRegex,
    arg: Option<&JValue>,
) -> Result<JValue, EvaluatorError> {
    let subject = match arg {
        Some(JValue::String(s)) => s,
        Some(JValue::Undefined) | None => return Ok(JValue::Undefined),
        Some(other) => {
            return Err(EvaluatorError::EvaluationError(format!(
                "regular expressions can only be matched against strings, got: {}",
                other
            )))
        }
    };
    match regex.regex.captures(subject) {
        Some(captures) => {
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
                JValue::Integer(subject[..full.start()].chars().count() as i64),
            );
            map.insert("groups".to_string(), JValue::array(groups));
            Ok(JValue::object(map))
        }
        None => Ok(JValue::Undefined),
    }
}

// ── ~> application ───────────────────────────────────────────────────────────

fn evaluate_apply(
    lhs: &AstNode,
    rhs: &AstNode,
    input: &JValue,
    frame: &Rc<Frame>,
) -> Result<JValue, EvaluatorError> {
    let context = evaluate(lhs, input, frame)?;

    // `x ~> $f(args)` invokes $f with x prepended to the arguments
    if let AstNode::Call { procedure, args } = rhs {
        let func = evaluate(procedure, input, frame)?;
        if !func.is_function() {
            return Err(EvaluatorError::ApplyRhsNotFunction);
        }
        let mut evaluated = Vec::with_capacity(args.len() + 1);
        evaluated.push(context);
        for arg in args {
            evaluated.push(evaluate(arg, input, frame)?);
        }
        return apply_function(&func, evaluated, input, frame);
    }

    let func = evaluate(rhs, input, frame)?;
    if !func.is_function() {
        return Err(EvaluatorError::ApplyRhsNotFunction);
    }
    if context.is_function() {
        // function chaining: f ~> g composes
        return Ok(JValue::function(FunctionValue::Chain {
            first: context,
            second: func,
        }));
    }
    apply_function(&func, vec![context], input, frame)
}

// ── Transforms ───────────────────────────────────────────────────────────────

/// `|pattern|update,delete|` applied to a value: deep-clone the argument
/// (callers never observe mutation), select targets by evaluating the
/// pattern against the clone, then merge the update object onto each target
/// and remove the delete keys. Targets are identified by Rc pointer
/// identity while the clone is rebuilt copy-on-write.
fn apply_transform(
    transformer: &TransformerFunction,
    arg: JValue,
) -> Result<JValue, EvaluatorError> {
    if arg.is_undefined() {
        return Ok(JValue::Undefined);
    }
    let clone = arg;

    let matches = evaluate(&transformer.pattern, &clone, &transformer.env)?;
    if matches.is_undefined() {
        return Ok(clone);
    }
    let targets: Vec<JValue> = match matches {
        JValue::Array(items, _) => items.as_ref().clone(),
        other => vec![other],
    };

    rebuild_with_transform(&clone, &targets, transformer)
}

fn rebuild_with_transform(
    value: &JValue,
    targets: &[JValue],
    transformer: &TransformerFunction,
) -> Result<JValue, EvaluatorError> {
    let is_target = |v: &JValue| {
        targets.iter().any(|t| match (t, v) {
            (JValue::Object(a), JValue::Object(b)) => Rc::ptr_eq(a, b),
            (JValue::Array(a, _), JValue::Array(b, _)) => Rc::ptr_eq(a, b),
            (a, b) => a == b && !b.is_object() && !b.is_array(),
        })
    };

    match value {
        JValue::Object(map) => {
            let mut rebuilt = indexmap::IndexMap::with_capacity(map.len());
            for (k, child) in map.iter() {
                rebuilt.insert(
                    k.clone(),
                    rebuild_with_transform(child, targets, transformer)?,
                );
            }
            let mut candidate = rebuilt;
            if is_target(value) {
                apply_transform_clauses(&mut candidate, value, transformer)?;
            }
            Ok(JValue::object(candidate))
        }
        JValue::Array(items, flags) => {
            let mut rebuilt = Vec::with_capacity(items.len());
            for child in items.iter() {
                rebuilt.push(rebuild_with_transform(child, targets, transformer)?);
            }
            Ok(JValue::Array(Rc::new(rebuilt), *flags))
        }
        other => {
            if is_target(other) {
                // merging onto a non-object target only matters when the
                // update would actually change it
                check_scalar_target(other, transformer)?;
            }
            Ok(other.clone())
        }
    }
}

fn apply_transform_clauses(
    candidate: &mut indexmap::IndexMap<String, JValue>,
    original: &JValue,
    transformer: &TransformerFunction,
) -> Result<(), EvaluatorError> {
    let update = evaluate(&transformer.update, original, &transformer.env)?;
    match &update {
        JValue::Undefined => {}
        JValue::Object(props) => {
            for (k, v) in props.iter() {
                candidate.insert(k.clone(), v.clone());
            }
        }
        other => {
            return Err(EvaluatorError::TransformUpdateNotObject {
                value: other.to_string(),
            })
        }
    }

    if let Some(delete) = &transformer.delete {
        let deletions = evaluate(delete, original, &transformer.env)?;
        let keys: Vec<String> = match &deletions {
            JValue::Undefined => Vec::new(),
            JValue::String(s) => vec![s.to_string()],
            JValue::Array(items, _) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in items.iter() {
                    match item {
                        JValue::String(s) => keys.push(s.to_string()),
                        other => {
                            return Err(EvaluatorError::TransformDeleteNotStrings {
                                value: other.to_string(),
                            })
                        }
                    }
                }
                keys
            }
            other => {
                return Err(EvaluatorError::TransformDeleteNotStrings {
                    value: other.to_string(),
                })
            }
        };
        for key in keys {
            candidate.shift_remove(&key);
        }
    }
    Ok(())
}

/// A non-object target is only an error when the update would actually
/// merge properties or the transform declares deletions; an empty update is
/// vacuous, which keeps the identity transform total.
fn check_scalar_target(
    original: &JValue,
    transformer: &TransformerFunction,
) -> Result<(), EvaluatorError> {
    let update = evaluate(&transformer.update, original, &transformer.env)?;
    match &update {
        JValue::Undefined => {}
        JValue::Object(props) if props.is_empty() => {}
        JValue::Object(_) => return Err(EvaluatorError::TransformTargetNotObject),
        other => {
            return Err(EvaluatorError::TransformUpdateNotObject {
                value: other.to_string(),
            })
        }
    }
    if transformer.delete.is_some() {
        return Err(EvaluatorError::TransformTargetNotObject);
    }
    Ok(())
}

// ── Top-level evaluation ─────────────────────────────────────────────────────

/// Evaluate a compiled expression body against an input, building the root
/// frame (with `$$` bound) and the per-evaluation supplement.
pub fn evaluate_with_bindings(
    node: &AstNode,
    input: &JValue,
    bindings: Option<&crate::environment::Bindings>,
) -> Result<JValue, EvaluatorError> {
    let supplement = Rc::new(EvalSupplement::new());
    let root = Frame::new_root(supplement);
    root.bind("$", input.clone());
    if let Some(bindings) = bindings {
        bindings.apply_to(&root);
    }
    let result = evaluate(node, input, &root)?;
    Ok(result.into_public())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;
    use crate::optimizer::process_ast;
    use crate::parser::parse;

    fn eval(expr: &str, data: JValue) -> Result<JValue, EvaluatorError> {
        let ast = process_ast(parse(expr).unwrap()).unwrap();
        evaluate_with_bindings(&ast, &data, None)
    }

    fn eval_ok(expr: &str, data: JValue) -> JValue {
        eval(expr, data).unwrap()
    }

    #[test]
    fn test_basic_path() {
        assert_eq!(eval_ok("a", jvalue!({"a": "b"})), jvalue!("b"));
    }

    #[test]
    fn test_nested_path() {
        assert_eq!(
            eval_ok("a.b.c", jvalue!({"a": {"b": {"c": 42i64}}})),
            jvalue!(42i64)
        );
    }

    #[test]
    fn test_missing_path_is_undefined() {
        assert!(eval_ok("a.nope", jvalue!({"a": {"b": 1i64}})).is_undefined());
    }

    #[test]
    fn test_array_broadcast() {
        assert_eq!(
            eval_ok("a", jvalue!([{"a": "b"}, {"a": "d"}])),
            jvalue!(["b", "d"])
        );
    }

    #[test]
    fn test_singleton_collapse() {
        // one match collapses to the bare value
        assert_eq!(eval_ok("a", jvalue!([{"a": "b"}])), jvalue!("b"));
        // zero matches collapse to undefined
        assert!(eval_ok("a", jvalue!([{"x": 1i64}])).is_undefined());
    }

    #[test]
    fn test_keep_singleton_array() {
        assert_eq!(eval_ok("a[]", jvalue!({"a": "b"})), jvalue!(["b"]));
    }

    #[test]
    fn test_predicate_index_is_zero_based() {
        let data = jvalue!([10i64, 20i64, 30i64]);
        assert_eq!(eval_ok("$[0]", data.clone()), jvalue!(10i64));
        assert_eq!(eval_ok("$[1]", data.clone()), jvalue!(20i64));
        assert_eq!(eval_ok("$[-1]", data), jvalue!(30i64));
    }

    #[test]
    fn test_predicate_filter() {
        let data = jvalue!({"items": [{"p": 1i64}, {"p": 5i64}, {"p": 9i64}]});
        assert_eq!(
            eval_ok("items[p > 3].p", data),
            jvalue!([5i64, 9i64])
        );
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(
            eval_ok("*", jvalue!({"a": 1i64, "b": 2i64})),
            jvalue!([1i64, 2i64])
        );
    }

    #[test]
    fn test_descendant_collects_leaves_and_objects() {
        let result = eval_ok("**", jvalue!({"a": {"b": 1i64}}));
        let items = result.as_array().unwrap();
        // root object, nested object, and the leaf
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_ok("1 + 2 * 3", JValue::Undefined), jvalue!(7i64));
        assert_eq!(eval_ok("10 / 4", JValue::Undefined), jvalue!(2.5));
        assert_eq!(eval_ok("10 % 3", JValue::Undefined), jvalue!(1i64));
        assert_eq!(eval_ok("-(3 + 2)", JValue::Undefined), jvalue!(-5i64));
    }

    #[test]
    fn test_integer_arithmetic_stays_integral() {
        assert!(matches!(eval_ok("2 + 3", JValue::Undefined), JValue::Integer(5)));
        assert!(matches!(eval_ok("2 * 3", JValue::Undefined), JValue::Integer(6)));
    }

    #[test]
    fn test_division_by_zero_is_dynamic_error() {
        assert_eq!(eval("1 / 0", JValue::Undefined).unwrap_err().code(), "D1001");
    }

    #[test]
    fn test_arithmetic_type_errors() {
        assert_eq!(
            eval("\"a\" + 1", JValue::Undefined).unwrap_err().code(),
            "T2001"
        );
        assert_eq!(
            eval("1 + \"a\"", JValue::Undefined).unwrap_err().code(),
            "T2002"
        );
    }

    #[test]
    fn test_undefined_propagates_through_arithmetic() {
        assert!(eval_ok("nothing + 1", jvalue!({"a": 1i64})).is_undefined());
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval_ok("1 < 2", JValue::Undefined), jvalue!(true));
        assert_eq!(eval_ok("\"a\" < \"b\"", JValue::Undefined), jvalue!(true));
        assert_eq!(
            eval("1 < \"a\"", JValue::Undefined).unwrap_err().code(),
            "T2009"
        );
        assert_eq!(
            eval("true < false", JValue::Undefined).unwrap_err().code(),
            "T2010"
        );
    }

    #[test]
    fn test_equality_with_undefined_is_false() {
        assert_eq!(eval_ok("nothing = 1", jvalue!({})), jvalue!(false));
        assert_eq!(eval_ok("nothing != 1", jvalue!({})), jvalue!(false));
    }

    #[test]
    fn test_deep_equality() {
        assert_eq!(
            eval_ok("a = b", jvalue!({"a": [1i64, 2i64], "b": [1i64, 2i64]})),
            jvalue!(true)
        );
    }

    #[test]
    fn test_boolean_operators_short_circuit() {
        assert_eq!(eval_ok("false and (1/0 = 0)", JValue::Undefined), jvalue!(false));
        assert_eq!(eval_ok("true or (1/0 = 0)", JValue::Undefined), jvalue!(true));
    }

    #[test]
    fn test_concatenation() {
        assert_eq!(
            eval_ok("\"a\" & 1 & nothing", jvalue!({})),
            jvalue!("a1")
        );
    }

    #[test]
    fn test_range() {
        assert_eq!(eval_ok("[1..4]", JValue::Undefined), jvalue!([1i64, 2i64, 3i64, 4i64]));
        assert_eq!(eval_ok("1..1", JValue::Undefined), jvalue!([1i64]));
        assert!(eval_ok("3..1", JValue::Undefined).is_undefined());
        assert_eq!(
            eval("1.5 .. 3", JValue::Undefined).unwrap_err().code(),
            "T2003"
        );
        assert_eq!(
            eval("1 .. \"a\"", JValue::Undefined).unwrap_err().code(),
            "T2004"
        );
    }

    #[test]
    fn test_range_size_cap() {
        assert_eq!(
            eval("1..100000000", JValue::Undefined).unwrap_err().code(),
            "D2014"
        );
    }

    #[test]
    fn test_conditional() {
        assert_eq!(eval_ok("true ? 1 : 2", JValue::Undefined), jvalue!(1i64));
        assert_eq!(eval_ok("false ? 1 : 2", JValue::Undefined), jvalue!(2i64));
        assert!(eval_ok("false ? 1", JValue::Undefined).is_undefined());
    }

    #[test]
    fn test_coalesce_and_default() {
        assert_eq!(eval_ok("nothing ?? 5", jvalue!({})), jvalue!(5i64));
        assert_eq!(eval_ok("3 ?? 5", jvalue!({})), jvalue!(3i64));
        assert_eq!(eval_ok("0 ?: 5", jvalue!({})), jvalue!(5i64));
        assert_eq!(eval_ok("7 ?: 5", jvalue!({})), jvalue!(7i64));
    }

    #[test]
    fn test_block_scoping() {
        assert_eq!(
            eval_ok("($x := 2; $y := 3; $x * $y)", JValue::Undefined),
            jvalue!(6i64)
        );
    }

    #[test]
    fn test_variable_shadowing_is_lexical() {
        let expr = "($x := 1; $f := function(){ $x }; ($x := 99; $f()))";
        // the lambda captured the frame where $x was 1... but := rebinding
        // happens in a child scope, so the closure still sees the original
        assert_eq!(eval_ok(expr, JValue::Undefined), jvalue!(1i64));
    }

    #[test]
    fn test_array_constructor_flattens_path_results() {
        let data = jvalue!({"a": [1i64, 2i64]});
        // nested constructors stay nested, field values append
        assert_eq!(eval_ok("[a, 3]", data.clone()), jvalue!([1i64, 2i64, 3i64]));
        assert_eq!(
            eval_ok("[[1, 2], [3]]", JValue::Undefined),
            jvalue!([[1i64, 2i64], [3i64]])
        );
    }

    #[test]
    fn test_object_constructor() {
        assert_eq!(
            eval_ok("{\"double\": a * 2}", jvalue!({"a": 21i64})),
            jvalue!({"double": 42i64})
        );
    }

    #[test]
    fn test_grouping() {
        let data = jvalue!({"items": [
            {"kind": "a", "v": 1i64},
            {"kind": "b", "v": 2i64},
            {"kind": "a", "v": 3i64}
        ]});
        assert_eq!(
            eval_ok("items{kind: $sum(v)}", data),
            jvalue!({"a": 4i64, "b": 2i64})
        );
    }

    #[test]
    fn test_group_key_must_be_string() {
        assert_eq!(
            eval("{1: 2}", jvalue!({})).unwrap_err().code(),
            "T1003"
        );
    }

    #[test]
    fn test_ambiguous_group_key() {
        let data = jvalue!([{"k": "x"}]);
        assert_eq!(
            eval("${k: 1, \"x\": 2}", data).unwrap_err().code(),
            "D1009"
        );
    }

    #[test]
    fn test_sort_ascending_and_descending() {
        let data = jvalue!({"nums": [3i64, 1i64, 2i64]});
        assert_eq!(eval_ok("nums^($)", data.clone()), jvalue!([1i64, 2i64, 3i64]));
        assert_eq!(eval_ok("nums^(>$)", data), jvalue!([3i64, 2i64, 1i64]));
    }

    #[test]
    fn test_sort_is_stable_with_keys() {
        let data = jvalue!({"items": [
            {"g": 2i64, "n": "a"},
            {"g": 1i64, "n": "b"},
            {"g": 2i64, "n": "c"},
            {"g": 1i64, "n": "d"}
        ]});
        assert_eq!(
            eval_ok("items^(g).n", data),
            jvalue!(["b", "d", "a", "c"])
        );
    }

    #[test]
    fn test_sort_mixed_types_is_error() {
        let data = jvalue!({"xs": [{"k": 1i64}, {"k": "a"}]});
        assert_eq!(eval("xs^(k)", data).unwrap_err().code(), "T2007");
    }

    #[test]
    fn test_lambda_definition_and_call() {
        assert_eq!(
            eval_ok("($add := function($a, $b){ $a + $b }; $add(2, 3))", JValue::Undefined),
            jvalue!(5i64)
        );
    }

    #[test]
    fn test_lambda_missing_args_bind_undefined() {
        assert_eq!(
            eval_ok(
                "($f := function($a, $b){ $exists($b) }; $f(1))",
                JValue::Undefined
            ),
            jvalue!(false)
        );
    }

    #[test]
    fn test_lambda_closure_captures_environment() {
        let expr = "($make := function($n){ function($x){ $x + $n } }; $inc := $make(1); $inc(41))";
        assert_eq!(eval_ok(expr, JValue::Undefined), jvalue!(42i64));
    }

    #[test]
    fn test_lambda_signature_validation() {
        let expr = "($f := function($x)<n:n>{ $x * 2 }; $f(\"nope\"))";
        assert_eq!(eval(expr, JValue::Undefined).unwrap_err().code(), "T0410");
    }

    #[test]
    fn test_calling_non_function() {
        assert_eq!(
            eval("$nope(1)", JValue::Undefined).unwrap_err().code(),
            "T1006"
        );
    }

    #[test]
    fn test_partial_application() {
        let expr = "($add := function($a, $b){ $a + $b }; $add2 := $add(?, 2); $add2(40))";
        assert_eq!(eval_ok(expr, JValue::Undefined), jvalue!(42i64));
    }

    #[test]
    fn test_partial_of_non_function() {
        assert_eq!(
            eval("$nope(?, 2)", JValue::Undefined).unwrap_err().code(),
            "T1008"
        );
    }

    #[test]
    fn test_apply_operator() {
        assert_eq!(eval_ok("[1, 2, 3] ~> $sum", JValue::Undefined), jvalue!(6i64));
        // with an invocation, the context is prepended to the arguments
        assert_eq!(
            eval_ok("\"hello\" ~> $substring(0, 4)", JValue::Undefined),
            jvalue!("hell")
        );
        assert_eq!(
            eval("1 ~> 2", JValue::Undefined).unwrap_err().code(),
            "T2006"
        );
    }

    #[test]
    fn test_function_chaining() {
        let expr = "($f := function($x){ $x + 1 }; $g := function($x){ $x * 2 }; $h := $f ~> $g; $h(5))";
        assert_eq!(eval_ok(expr, JValue::Undefined), jvalue!(12i64));
    }

    #[test]
    fn test_tail_call_trampoline() {
        let expr = "($f := function($n, $acc){ $n <= 0 ? $acc : $f($n - 1, $acc + $n) }; $f(10000, 0))";
        assert_eq!(eval_ok(expr, JValue::Undefined), jvalue!(50005000i64));
    }

    #[test]
    fn test_non_tail_recursion_depth_guard() {
        // deliberately non-tail-recursive: $f(...) + 0 is not a tail call
        let expr = "($f := function($n){ $n <= 0 ? 0 : $f($n - 1) + 0 }; $f(100000))";
        assert_eq!(eval(expr, JValue::Undefined).unwrap_err().code(), "U1001");
    }

    #[test]
    fn test_ancestor_reference() {
        let data = jvalue!({"data": [
            {"id": 1i64, "name": "a"},
            {"id": 2i64, "name": "b"}
        ]});
        assert_eq!(eval_ok("data.name.%.id", data), jvalue!([1i64, 2i64]));
    }

    #[test]
    fn test_index_binding() {
        let data = jvalue!({"letters": ["a", "b", "c"]});
        assert_eq!(
            eval_ok("letters#$i.$i", data),
            jvalue!([0i64, 1i64, 2i64])
        );
    }

    #[test]
    fn test_focus_binding_keeps_parent_context() {
        let data = jvalue!({"orders": [{"id": 1i64}, {"id": 2i64}], "tag": "t"});
        // after @$o the context stays at the parent level
        assert_eq!(
            eval_ok("orders@$o.{\"id\": $o.id, \"tag\": tag}", data),
            jvalue!([{"id": 1i64, "tag": "t"}, {"id": 2i64, "tag": "t"}])
        );
    }

    #[test]
    fn test_transform_updates_matches() {
        let data = jvalue!({"product": {"price": 10i64}});
        assert_eq!(
            eval_ok("$ ~> |product|{\"price\": price * 2}|", data),
            jvalue!({"product": {"price": 20i64}})
        );
    }

    #[test]
    fn test_transform_delete_clause() {
        let data = jvalue!({"product": {"price": 10i64, "tmp": true}});
        assert_eq!(
            eval_ok("$ ~> |product|{}, \"tmp\"|", data),
            jvalue!({"product": {"price": 10i64}})
        );
    }

    #[test]
    fn test_transform_does_not_mutate_input() {
        let data = jvalue!({"product": {"price": 10i64}});
        let ast = process_ast(parse("$ ~> |product|{\"price\": 0}|").unwrap()).unwrap();
        let _ = evaluate_with_bindings(&ast, &data, None).unwrap();
        assert_eq!(data, jvalue!({"product": {"price": 10i64}}));
    }

    #[test]
    fn test_identity_transform_is_identity() {
        for data in [
            jvalue!({"a": [1i64, {"b": null}], "c": "x"}),
            jvalue!([1i64, 2i64]),
            jvalue!("scalar"),
            jvalue!(null),
        ] {
            assert_eq!(eval_ok("$ ~> |$|{}|", data.clone()), data);
        }
    }

    #[test]
    fn test_transform_update_must_be_object() {
        let data = jvalue!({"a": {"b": 1i64}});
        assert_eq!(
            eval("$ ~> |a|\"nope\"|", data).unwrap_err().code(),
            "T2011"
        );
    }

    #[test]
    fn test_transform_delete_must_be_strings() {
        let data = jvalue!({"a": {"b": 1i64}});
        assert_eq!(
            eval("$ ~> |a|{}, 42|", data).unwrap_err().code(),
            "T2012"
        );
    }

    #[test]
    fn test_regex_matcher_value() {
        let result = eval_ok("$match(\"ababa\", /ab/)", JValue::Undefined);
        let arr = result.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0].get("match"), Some(&jvalue!("ab")));
        assert_eq!(arr[0].get("index"), Some(&jvalue!(0i64)));
    }

    #[test]
    fn test_last_step_array_constructor_not_unwrapped() {
        let data = jvalue!({"a": {"b": 1i64}});
        assert_eq!(eval_ok("a.[b]", data), jvalue!([1i64]));
    }

    #[test]
    fn test_root_variable() {
        let data = jvalue!({"a": {"b": 1i64}, "top": 9i64});
        assert_eq!(eval_ok("a.($$.top)", data), jvalue!(9i64));
    }

    #[test]
    fn test_negate_non_number() {
        assert_eq!(
            eval("-\"a\"", JValue::Undefined).unwrap_err().code(),
            "D1002"
        );
    }
}
