// jsonata-engine - JSONata query and transformation engine for Rust
// Copyright (c) 2026 jsonata-engine contributors
// Licensed under the MIT License

//! # jsonata-engine
//!
//! A JSONata query and transformation engine: a textual expression language
//! that selects, reshapes, and aggregates data held in a JSON-like document
//! model.
//!
//! The pipeline is a hand-written tokenizer, a Pratt (top-down operator
//! precedence) parser producing a raw AST, a post-parse optimizer pass that
//! flattens dotted chains into step-based paths, attaches predicates and
//! order-by clauses to the right step, resolves `%` ancestor references to
//! compile-time slots, and wraps tail calls as thunks, and a tree-walking
//! evaluator implementing JSONata's sequence semantics (implicit array
//! flattening, singleton collapse, undefined propagation) with lambda
//! closures, partial application, grouping, sorting, and the
//! `|pattern|update,delete|` transform syntax.
//!
//! - `value` — the document value type ([`JValue`]) and sequence flags
//! - `parser` — tokenizer and Pratt parser
//! - `optimizer` — raw-AST to evaluable-AST rewrite
//! - `evaluator` — the tree walk and its runtime errors
//! - `environment` — binding frames and the per-evaluation supplement
//! - `functions` — the function-binding bridge and builtin catalog
//! - `signature` — `<...>` type-signature validation
//! - `datetime` — `$now`/`$millis`/`$fromMillis`/`$toMillis` support
//!
//! ## Usage
//!
//! Compile once, evaluate many times:
//!
//! ```
//! use jsonata_engine::{compile, value::JValue};
//!
//! let expr = compile("orders[price > 100].product").unwrap();
//!
//! let data = JValue::from_json_str(
//!     r#"{"orders": [
//!         {"product": "A", "price": 150},
//!         {"product": "B", "price": 50}
//!     ]}"#,
//! )
//! .unwrap();
//!
//! let result = expr.evaluate(&data).unwrap();
//! assert_eq!(result, JValue::from("A"));
//! ```
//!
//! A compiled expression is immutable and may be shared across threads;
//! every evaluation builds its own environment chain.

use std::sync::Arc;

use thiserror::Error;

pub mod ast;
pub mod datetime;
pub mod environment;
pub mod evaluator;
pub mod functions;
pub mod optimizer;
pub mod parser;
pub mod signature;
pub mod utils;
pub mod value;

pub use environment::Bindings;
pub use evaluator::EvaluatorError;
pub use functions::{NativeContext, NativeFunction, ParamDefault, ParamSpec};
pub use parser::ParserError;
pub use value::JValue;

/// Anything `compile` or `evaluate` can report: a static (compile-time)
/// error or a runtime (type/dynamic) error. Both kinds carry a stable short
/// code; static errors also carry a source character offset.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error("D3120: invalid JSON input: {0}")]
    InvalidJson(String),
}

impl Error {
    /// The stable error code (`S0xxx` static, `T0xxx`/`T1xxx`/`T2xxx` type,
    /// `D1xxx`-`D3xxx` dynamic).
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parser(e) => e.code(),
            Error::Evaluator(e) => e.code(),
            Error::InvalidJson(_) => "D3120",
        }
    }

    /// Source character offset, available for static errors.
    pub fn position(&self) -> Option<usize> {
        match self {
            Error::Parser(e) => Some(e.position()),
            _ => None,
        }
    }
}

/// A compiled JSONata expression.
///
/// Compilation is a pure function of the source text; the resulting AST is
/// immutable and reusable, so one `JsonataExpression` may be evaluated
/// repeatedly (and concurrently) against different inputs.
#[derive(Debug)]
pub struct JsonataExpression {
    ast: Arc<ast::AstNode>,
}

impl JsonataExpression {
    /// Evaluate against an input value with the default environment (the
    /// builtin catalog only).
    pub fn evaluate(&self, input: &JValue) -> Result<JValue, Error> {
        Ok(evaluator::evaluate_with_bindings(&self.ast, input, None)?)
    }

    /// Evaluate with additional host bindings layered over the builtins.
    pub fn evaluate_with_bindings(
        &self,
        input: &JValue,
        bindings: &Bindings,
    ) -> Result<JValue, Error> {
        Ok(evaluator::evaluate_with_bindings(
            &self.ast,
            input,
            Some(bindings),
        )?)
    }

    /// Evaluate with JSON string input and output, avoiding document-value
    /// construction at the call site.
    pub fn evaluate_json(&self, json: &str) -> Result<String, Error> {
        let input =
            JValue::from_json_str(json).map_err(|e| Error::InvalidJson(e.to_string()))?;
        let result = self.evaluate(&input)?;
        result
            .to_json_string()
            .map_err(|e| Error::InvalidJson(e.to_string()))
    }

    /// The optimized AST.
    pub fn ast(&self) -> &ast::AstNode {
        &self.ast
    }
}

/// Compile a JSONata expression: tokenize, parse, and run the optimizer
/// pass. Pure function of the text; all static errors are raised here, and
/// the evaluator is never reached for an invalid expression.
pub fn compile(expression: &str) -> Result<JsonataExpression, Error> {
    let raw = parser::parse(expression)?;
    let ast = optimizer::process_ast(raw)?;
    Ok(JsonataExpression { ast: Arc::new(ast) })
}

/// Compile and evaluate in one step. For repeated evaluations of the same
/// expression, use [`compile`] once instead.
pub fn evaluate(expression: &str, input: &JValue) -> Result<JValue, Error> {
    compile(expression)?.evaluate(input)
}
