// Abstract syntax tree definitions
//
// The parser produces a raw tree containing interim construction nodes
// (Map, FilterWrap, GroupWrap, FocusBind, IndexBind, Parent); the optimizer
// pass in `optimizer.rs` rewrites those into the final step-based Path form.
// After optimization no interim variant is reachable from the root, and the
// evaluator treats one as a programming error rather than a runtime error.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::signature::Signature;

/// A regex literal, compiled at parse time.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    pub pattern: String,
    pub flags: String,
    pub regex: Regex,
}

impl CompiledRegex {
    pub fn case_insensitive(&self) -> bool {
        self.flags.contains('i')
    }
}

impl PartialEq for CompiledRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.flags == other.flags
    }
}

impl fmt::Display for CompiledRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.pattern, self.flags)
    }
}

/// One term of an order-by clause: the key expression and its direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SortTerm {
    pub expr: AstNode,
    pub descending: bool,
}

/// A stage applied while extracting a path step: predicates following a
/// step segment filter during the step, not as a separate step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Filter/predicate stage `[expr]`
    Filter(AstNode),
}

/// One segment of a compiled path expression.
///
/// Beyond the step node itself a step carries the stages attached by the
/// optimizer, context-variable bindings (`#$i` index, `@$v` focus), the
/// ancestor slot labels that must be captured when this step runs, and the
/// array-constructor / keep-singleton markers the evaluator consults.
#[derive(Debug, Clone, PartialEq)]
pub struct PathStep {
    pub node: AstNode,
    pub stages: Vec<Stage>,
    /// `#$i` — bind the item's position in the step output to this variable.
    pub index_var: Option<String>,
    /// `@$v` — bind the item itself to this variable for the rest of the path.
    pub focus_var: Option<String>,
    /// Ancestor slot labels resolved to this step; the step's input value is
    /// bound under each label while iterating.
    pub ancestors: Vec<String>,
    /// Step participates in tuple-stream evaluation (set when the step or a
    /// later one needs per-item bindings).
    pub tuple: bool,
    /// `step[]` — retain the singleton array for this step's output.
    pub keep_array: bool,
    /// Step is an explicit array constructor: as first step it is evaluated
    /// once rather than mapped over the input, as last step its result is
    /// not flattened into the surrounding sequence.
    pub cons_array: bool,
}

impl PathStep {
    pub fn new(node: AstNode) -> Self {
        PathStep {
            node,
            stages: Vec::new(),
            index_var: None,
            focus_var: None,
            ancestors: Vec::new(),
            tuple: false,
            keep_array: false,
            cons_array: false,
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // Logical
    And,
    Or,

    // String
    Concatenate,

    // Range
    Range,

    // Membership
    In,

    // Coalescing (??) and default (?:)
    Coalesce,
    Default,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Concatenate => "&",
            BinaryOp::Range => "..",
            BinaryOp::In => "in",
            BinaryOp::Coalesce => "??",
            BinaryOp::Default => "?:",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Numeric negation (-)
    Negate,
}

/// AST node types.
///
/// A closed set: the optimizer and evaluator dispatch by exhaustive match,
/// so a missing case is a compile error rather than a latent runtime hole.
#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    // ── Literals ─────────────────────────────────────────────────────────
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
    Regex(CompiledRegex),

    // ── References ───────────────────────────────────────────────────────
    /// Variable reference. `""` is the context reference `$`; `"$"` is the
    /// root reference `$$` (bound once at evaluation entry).
    Variable(String),

    /// Field name in a path step. `escaped` records backquoted names.
    Name { value: String, escaped: bool },

    /// `*` — property values of the current object
    Wildcard,

    /// `**` — all descendants, depth-first pre-order
    Descendant,

    /// `%` — ancestor reference, unresolved (interim; the optimizer rewrites
    /// every occurrence into `ParentSlot` or rejects the expression)
    Parent { position: usize },

    /// Resolved ancestor reference: looks up the slot label bound by the
    /// owning path step during tuple-stream evaluation.
    ParentSlot { label: String },

    /// `?` — placeholder in a partial-application argument list
    Placeholder,

    // ── Structure ────────────────────────────────────────────────────────
    /// Parenthesized expression sequence `(a; b; c)`; evaluates to the last
    /// expression, with a child frame for local bindings.
    Block(Vec<AstNode>),

    /// Array constructor `[a, b, c]`
    Array { items: Vec<AstNode> },

    /// Object constructor `{k: v, ...}`
    Object(Vec<(AstNode, AstNode)>),

    /// Unary operation (numeric negation)
    Unary { op: UnaryOp, expr: Box<AstNode> },

    /// Binary operation
    Binary {
        op: BinaryOp,
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
    },

    /// Conditional `cond ? then : else`
    Conditional {
        condition: Box<AstNode>,
        then_branch: Box<AstNode>,
        else_branch: Option<Box<AstNode>>,
    },

    /// Variable binding `$name := value`
    Bind { name: String, value: Box<AstNode> },

    /// Function application / chain operator `lhs ~> rhs`
    Apply { lhs: Box<AstNode>, rhs: Box<AstNode> },

    /// Lambda literal `function($a, $b)<sig>{ body }`. `thunk` marks the
    /// zero-parameter wrappers created by tail-call detection. The body is
    /// reference-counted so closures capture it without copying the tree.
    Lambda {
        params: Vec<String>,
        signature: Option<Signature>,
        body: Arc<AstNode>,
        thunk: bool,
    },

    /// Function invocation
    Call {
        procedure: Box<AstNode>,
        args: Vec<AstNode>,
    },

    /// Partial application: at least one argument is a placeholder
    Partial {
        procedure: Box<AstNode>,
        args: Vec<AstNode>,
    },

    // ── Path form (post-optimization) ────────────────────────────────────
    /// A path expression as an ordered step list.
    Path {
        steps: Vec<PathStep>,
        keep_singleton_array: bool,
    },

    /// An order-by clause as a path step: sorts the sequence accumulated by
    /// the preceding steps.
    SortTerms(Vec<SortTerm>),

    /// Grouping `expr{k: v, ...}` — aggregates the input sequence by key.
    GroupBy {
        input: Box<AstNode>,
        pairs: Vec<(AstNode, AstNode)>,
    },

    /// Predicates applied to a non-path expression (`$f()[0]` and the like).
    Filter {
        input: Box<AstNode>,
        predicates: Vec<AstNode>,
    },

    /// Transform `|pattern|update, delete|`; evaluates to a function value
    /// closing over the clauses.
    Transform {
        pattern: Arc<AstNode>,
        update: Arc<AstNode>,
        delete: Option<Arc<AstNode>>,
    },

    // ── Interim construction nodes (parser output only) ──────────────────
    /// Dotted path `lhs . rhs` before flattening.
    Map {
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        position: usize,
    },

    /// Bracketed predicate `input[pred]` before stage attachment.
    FilterWrap {
        input: Box<AstNode>,
        predicate: Box<AstNode>,
        position: usize,
    },

    /// Grouping `input{...}` before attachment.
    GroupWrap {
        input: Box<AstNode>,
        pairs: Vec<(AstNode, AstNode)>,
        position: usize,
    },

    /// Sort `input^(terms)` before conversion to a sort step.
    SortWrap {
        input: Box<AstNode>,
        terms: Vec<SortTerm>,
        position: usize,
    },

    /// Focus binding `input@$var` before attachment to a step.
    FocusBind {
        input: Box<AstNode>,
        var: String,
        position: usize,
    },

    /// Index binding `input#$var` before attachment to a step.
    IndexBind {
        input: Box<AstNode>,
        var: String,
        position: usize,
    },

    /// Empty brackets `input[]` — retain the singleton array. Folded into
    /// the owning path by the optimizer when the operand is a path; kept as
    /// a wrapper (evaluated as a singleton-preserving marker) otherwise.
    KeepArray { input: Box<AstNode> },
}

impl fmt::Display for AstNode {
    /// Render the node back to expression syntax. Reparsing the rendering
    /// yields an equivalent tree for literals, paths, and operator
    /// expressions; nodes with no surface syntax of their own (resolved
    /// parent slots, interim forms) render as placeholders.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AstNode::String(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            AstNode::Integer(n) => write!(f, "{}", n),
            AstNode::Float(n) => write!(f, "{}", n),
            AstNode::Bool(b) => write!(f, "{}", b),
            AstNode::Null => write!(f, "null"),
            AstNode::Regex(r) => write!(f, "{}", r),
            AstNode::Variable(name) => write!(f, "${}", name),
            AstNode::Name { value, escaped } => {
                if *escaped {
                    write!(f, "`{}`", value)
                } else {
                    write!(f, "{}", value)
                }
            }
            AstNode::Wildcard => write!(f, "*"),
            AstNode::Descendant => write!(f, "**"),
            AstNode::Parent { .. } | AstNode::ParentSlot { .. } => write!(f, "%"),
            AstNode::Placeholder => write!(f, "?"),
            AstNode::Block(exprs) => {
                write!(f, "(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            AstNode::Array { items } => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            AstNode::Object(pairs) | AstNode::GroupWrap { pairs, .. } => {
                if let AstNode::GroupWrap { input, .. } = self {
                    write!(f, "{}", input)?;
                }
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            // no parentheses here: parenthesized source becomes an explicit
            // Block node, so grouping survives rendering on its own
            AstNode::Unary { expr, .. } => write!(f, "-{}", expr),
            AstNode::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            AstNode::Conditional {
                condition,
                then_branch,
                else_branch,
            } => match else_branch {
                Some(e) => write!(f, "{} ? {} : {}", condition, then_branch, e),
                None => write!(f, "{} ? {}", condition, then_branch),
            },
            AstNode::Bind { name, value } => write!(f, "${} := {}", name, value),
            AstNode::Apply { lhs, rhs } => write!(f, "{} ~> {}", lhs, rhs),
            AstNode::Lambda { params, body, .. } => {
                write!(f, "function(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "${}", p)?;
                }
                write!(f, "){{{}}}", body)
            }
            AstNode::Call { procedure, args } | AstNode::Partial { procedure, args } => {
                write!(f, "{}(", procedure)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            AstNode::Path { steps, .. } => {
                for (i, step) in steps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", step.node)?;
                    for Stage::Filter(p) in &step.stages {
                        write!(f, "[{}]", p)?;
                    }
                    if step.keep_array {
                        write!(f, "[]")?;
                    }
                }
                Ok(())
            }
            AstNode::SortTerms(terms) => {
                write!(f, "^(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}{}", if t.descending { ">" } else { "<" }, t.expr)?;
                }
                write!(f, ")")
            }
            AstNode::GroupBy { input, pairs } => {
                write!(f, "{}{{", input)?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            AstNode::Filter { input, predicates } => {
                write!(f, "{}", input)?;
                for p in predicates {
                    write!(f, "[{}]", p)?;
                }
                Ok(())
            }
            AstNode::Transform {
                pattern,
                update,
                delete,
            } => match delete {
                Some(d) => write!(f, "|{}|{}, {}|", pattern, update, d),
                None => write!(f, "|{}|{}|", pattern, update),
            },
            AstNode::Map { lhs, rhs, .. } => write!(f, "{}.{}", lhs, rhs),
            AstNode::FilterWrap {
                input, predicate, ..
            } => write!(f, "{}[{}]", input, predicate),
            AstNode::SortWrap { input, terms, .. } => {
                write!(f, "{}^(", input)?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}{}", if t.descending { ">" } else { "<" }, t.expr)?;
                }
                write!(f, ")")
            }
            AstNode::FocusBind { input, var, .. } => write!(f, "{}@${}", input, var),
            AstNode::IndexBind { input, var, .. } => write!(f, "{}#${}", input, var),
            AstNode::KeepArray { input } => write!(f, "{}[]", input),
        }
    }
}

impl AstNode {
    /// True for literal nodes that may not appear as a path step.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            AstNode::Integer(_) | AstNode::Float(_) | AstNode::Bool(_) | AstNode::Null
        )
    }

    /// True for the interim variants that must not survive optimization.
    pub fn is_interim(&self) -> bool {
        matches!(
            self,
            AstNode::Map { .. }
                | AstNode::FilterWrap { .. }
                | AstNode::GroupWrap { .. }
                | AstNode::SortWrap { .. }
                | AstNode::FocusBind { .. }
                | AstNode::IndexBind { .. }
                | AstNode::Parent { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_check() {
        assert!(AstNode::Integer(1).is_literal());
        assert!(AstNode::Bool(true).is_literal());
        assert!(AstNode::Null.is_literal());
        assert!(!AstNode::String("a".to_string()).is_literal());
        assert!(!AstNode::Wildcard.is_literal());
    }

    #[test]
    fn test_interim_check() {
        let dot = AstNode::Map {
            lhs: Box::new(AstNode::Name {
                value: "a".to_string(),
                escaped: false,
            }),
            rhs: Box::new(AstNode::Name {
                value: "b".to_string(),
                escaped: false,
            }),
            position: 1,
        };
        assert!(dot.is_interim());
        assert!(AstNode::Parent { position: 0 }.is_interim());
        assert!(!AstNode::Wildcard.is_interim());
    }

    #[test]
    fn test_compiled_regex_equality() {
        let a = CompiledRegex {
            pattern: "ab+".to_string(),
            flags: "i".to_string(),
            regex: Regex::new("(?i)ab+").unwrap(),
        };
        let b = CompiledRegex {
            pattern: "ab+".to_string(),
            flags: "i".to_string(),
            regex: Regex::new("(?i)ab+").unwrap(),
        };
        assert_eq!(a, b);
    }
}
