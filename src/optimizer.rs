// Post-parse AST rewrite: a single bottom-up pass over the raw parse tree
// producing the final evaluable form.
//
// Responsibilities: flatten interim dot chains into step-based Path nodes,
// attach predicate/sort/group/context-binding stages to the right step with
// ordering enforcement, resolve `%` ancestor references to positional slot
// labels, and wrap tail-position calls in lambda bodies as thunks for the
// evaluator's trampoline. Every rejection here is a static error raised
// before any data is touched.

use crate::ast::{AstNode, PathStep, Stage};
use crate::parser::ParserError;

/// An unresolved ancestor reference working its way outward. `level` counts
/// how many enclosing steps remain to be crossed before the slot binds.
/// `from_predicate` marks slots escaping a bracketed predicate, whose first
/// level refers to the predicated step's own input rather than the step
/// before it.
#[derive(Debug, Clone)]
struct Slot {
    label: String,
    level: usize,
    position: usize,
    from_predicate: bool,
}

#[derive(Debug)]
struct Processed {
    node: AstNode,
    seeking: Vec<Slot>,
}

impl Processed {
    fn plain(node: AstNode) -> Self {
        Processed {
            node,
            seeking: Vec::new(),
        }
    }
}

/// Rewrite a raw parse tree into the final evaluable AST.
///
/// After this pass no interim node remains reachable from the root; an
/// ancestor reference that cannot be grounded in an enclosing step is
/// rejected with S0217.
pub fn process_ast(node: AstNode) -> Result<AstNode, ParserError> {
    let mut optimizer = Optimizer { next_slot: 0 };
    let processed = optimizer.process(node)?;
    if let Some(slot) = processed.seeking.first() {
        return Err(ParserError::UnresolvedAncestor {
            position: slot.position,
        });
    }
    Ok(processed.node)
}

struct Optimizer {
    next_slot: usize,
}

impl Optimizer {
    fn process(&mut self, node: AstNode) -> Result<Processed, ParserError> {
        match node {
            // ── Leaves ───────────────────────────────────────────────────
            AstNode::String(_)
            | AstNode::Integer(_)
            | AstNode::Float(_)
            | AstNode::Bool(_)
            | AstNode::Null
            | AstNode::Regex(_)
            | AstNode::Variable(_)
            | AstNode::Name { .. }
            | AstNode::Wildcard
            | AstNode::Descendant
            | AstNode::Placeholder
            | AstNode::ParentSlot { .. } => Ok(Processed::plain(node)),

            AstNode::Parent { position } => {
                let label = format!("!{}", self.next_slot);
                self.next_slot += 1;
                Ok(Processed {
                    node: AstNode::ParentSlot {
                        label: label.clone(),
                    },
                    seeking: vec![Slot {
                        label,
                        level: 1,
                        position,
                        from_predicate: false,
                    }],
                })
            }

            // ── Path construction ────────────────────────────────────────
            AstNode::Map { lhs, rhs, position } => {
                let left = self.process(*lhs)?;
                let mut seeking = left.seeking;
                let (mut steps, mut keep_singleton) = into_steps(left.node, position)?;

                let right = self.process(*rhs)?;
                let right_steps = match right.node {
                    AstNode::Path {
                        steps: rsteps,
                        keep_singleton_array,
                    } => {
                        keep_singleton |= keep_singleton_array;
                        rsteps
                    }
                    other => {
                        let (rsteps, rkeep) = into_steps(other, position)?;
                        keep_singleton |= rkeep;
                        rsteps
                    }
                };
                let mut right_seeking = right.seeking;
                for step in right_steps {
                    steps.push(step);
                    if !right_seeking.is_empty() {
                        let index = steps.len() - 1;
                        resolve_step_slots(
                            &mut steps,
                            index,
                            std::mem::take(&mut right_seeking),
                            &mut seeking,
                        );
                    }
                }
                keep_singleton |= steps.iter().any(|s| s.keep_array);
                tag_cons_steps(&mut steps);
                Ok(Processed {
                    node: AstNode::Path {
                        steps,
                        keep_singleton_array: keep_singleton,
                    },
                    seeking,
                })
            }

            // ── Predicate attachment ─────────────────────────────────────
            AstNode::FilterWrap {
                input,
                predicate,
                position,
            } => {
                let inp = self.process(*input)?;
                let pred = self.process(*predicate)?;
                let mut seeking = inp.seeking;

                match inp.node {
                    AstNode::GroupBy { .. } => {
                        Err(ParserError::PredicateAfterGroup { position })
                    }
                    AstNode::Path {
                        mut steps,
                        keep_singleton_array,
                    } => {
                        let last = steps.len() - 1;
                        steps[last].stages.push(Stage::Filter(pred.node));
                        attach_predicate_slots(&mut steps, last, pred.seeking, &mut seeking);
                        Ok(Processed {
                            node: AstNode::Path {
                                steps,
                                keep_singleton_array,
                            },
                            seeking,
                        })
                    }
                    AstNode::Filter {
                        input,
                        mut predicates,
                    } => {
                        // merge into the existing predicate node
                        predicates.push(pred.node);
                        seeking.extend(mark_predicate_slots(pred.seeking));
                        Ok(Processed {
                            node: AstNode::Filter { input, predicates },
                            seeking,
                        })
                    }
                    other => {
                        seeking.extend(mark_predicate_slots(pred.seeking));
                        Ok(Processed {
                            node: AstNode::Filter {
                                input: Box::new(other),
                                predicates: vec![pred.node],
                            },
                            seeking,
                        })
                    }
                }
            }

            // ── Grouping ─────────────────────────────────────────────────
            AstNode::GroupWrap {
                input,
                pairs,
                position,
            } => {
                let inp = self.process(*input)?;
                if matches!(inp.node, AstNode::GroupBy { .. }) {
                    return Err(ParserError::MultipleGroups { position });
                }
                let mut seeking = inp.seeking;
                let mut processed_pairs = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let pk = self.process(k)?;
                    let pv = self.process(v)?;
                    seeking.extend(pk.seeking);
                    seeking.extend(pv.seeking);
                    processed_pairs.push((pk.node, pv.node));
                }
                Ok(Processed {
                    node: AstNode::GroupBy {
                        input: Box::new(inp.node),
                        pairs: processed_pairs,
                    },
                    seeking,
                })
            }

            // ── Sort step ────────────────────────────────────────────────
            AstNode::SortWrap {
                input,
                terms,
                position,
            } => {
                let inp = self.process(*input)?;
                let mut seeking = inp.seeking;
                let (mut steps, keep_singleton) = match inp.node {
                    AstNode::Path {
                        steps,
                        keep_singleton_array,
                    } => (steps, keep_singleton_array),
                    other => into_steps(other, position)?,
                };
                let mut term_seeking = Vec::new();
                let mut processed_terms = Vec::with_capacity(terms.len());
                for term in terms {
                    let pt = self.process(term.expr)?;
                    term_seeking.extend(pt.seeking);
                    processed_terms.push(crate::ast::SortTerm {
                        expr: pt.node,
                        descending: term.descending,
                    });
                }
                steps.push(PathStep::new(AstNode::SortTerms(processed_terms)));
                let index = steps.len() - 1;
                resolve_step_slots(&mut steps, index, term_seeking, &mut seeking);
                Ok(Processed {
                    node: AstNode::Path {
                        steps,
                        keep_singleton_array: keep_singleton,
                    },
                    seeking,
                })
            }

            // ── Context-variable bindings ────────────────────────────────
            AstNode::FocusBind {
                input,
                var,
                position,
            } => {
                let inp = self.process(*input)?;
                let seeking = inp.seeking;
                let (mut steps, keep_singleton) = match inp.node {
                    AstNode::Path {
                        steps,
                        keep_singleton_array,
                    } => (steps, keep_singleton_array),
                    other => into_steps(other, position)?,
                };
                let last = steps.len() - 1;
                check_binding_order(&steps[last], position)?;
                steps[last].focus_var = Some(var);
                steps[last].tuple = true;
                Ok(Processed {
                    node: AstNode::Path {
                        steps,
                        keep_singleton_array: keep_singleton,
                    },
                    seeking,
                })
            }

            AstNode::IndexBind {
                input,
                var,
                position,
            } => {
                let inp = self.process(*input)?;
                let seeking = inp.seeking;
                let (mut steps, keep_singleton) = match inp.node {
                    AstNode::Path {
                        steps,
                        keep_singleton_array,
                    } => (steps, keep_singleton_array),
                    other => into_steps(other, position)?,
                };
                let last = steps.len() - 1;
                check_binding_order(&steps[last], position)?;
                steps[last].index_var = Some(var);
                steps[last].tuple = true;
                Ok(Processed {
                    node: AstNode::Path {
                        steps,
                        keep_singleton_array: keep_singleton,
                    },
                    seeking,
                })
            }

            // ── Keep-singleton marker ────────────────────────────────────
            AstNode::KeepArray { input } => {
                let inp = self.process(*input)?;
                let seeking = inp.seeking;
                match inp.node {
                    AstNode::Path { mut steps, .. } => {
                        let last = steps.len() - 1;
                        steps[last].keep_array = true;
                        Ok(Processed {
                            node: AstNode::Path {
                                steps,
                                keep_singleton_array: true,
                            },
                            seeking,
                        })
                    }
                    AstNode::Name { .. } | AstNode::Wildcard | AstNode::Descendant => {
                        let mut step = PathStep::new(inp.node);
                        step.keep_array = true;
                        Ok(Processed {
                            node: AstNode::Path {
                                steps: vec![step],
                                keep_singleton_array: true,
                            },
                            seeking,
                        })
                    }
                    other => Ok(Processed {
                        node: AstNode::KeepArray {
                            input: Box::new(other),
                        },
                        seeking,
                    }),
                }
            }

            // ── Lambdas and tail calls ───────────────────────────────────
            AstNode::Lambda {
                params,
                signature,
                body,
                thunk,
            } => {
                let processed_body = self.process(std::sync::Arc::unwrap_or_clone(body))?;
                let seeking = processed_body.seeking;
                let optimized_body = if thunk {
                    processed_body.node
                } else {
                    tail_call_optimize(processed_body.node)
                };
                Ok(Processed {
                    node: AstNode::Lambda {
                        params,
                        signature,
                        body: std::sync::Arc::new(optimized_body),
                        thunk,
                    },
                    seeking,
                })
            }

            // ── Plain recursion ──────────────────────────────────────────
            AstNode::Block(exprs) => {
                let mut seeking = Vec::new();
                let mut out = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    let p = self.process(expr)?;
                    seeking.extend(p.seeking);
                    out.push(p.node);
                }
                Ok(Processed {
                    node: AstNode::Block(out),
                    seeking,
                })
            }

            AstNode::Array { items } => {
                let mut seeking = Vec::new();
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let p = self.process(item)?;
                    seeking.extend(p.seeking);
                    out.push(p.node);
                }
                Ok(Processed {
                    node: AstNode::Array { items: out },
                    seeking,
                })
            }

            AstNode::Object(pairs) => {
                let mut seeking = Vec::new();
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let pk = self.process(k)?;
                    let pv = self.process(v)?;
                    seeking.extend(pk.seeking);
                    seeking.extend(pv.seeking);
                    out.push((pk.node, pv.node));
                }
                Ok(Processed {
                    node: AstNode::Object(out),
                    seeking,
                })
            }

            AstNode::Unary { op, expr } => {
                let p = self.process(*expr)?;
                Ok(Processed {
                    node: AstNode::Unary {
                        op,
                        expr: Box::new(p.node),
                    },
                    seeking: p.seeking,
                })
            }

            AstNode::Binary { op, lhs, rhs } => {
                let pl = self.process(*lhs)?;
                let pr = self.process(*rhs)?;
                let mut seeking = pl.seeking;
                seeking.extend(pr.seeking);
                Ok(Processed {
                    node: AstNode::Binary {
                        op,
                        lhs: Box::new(pl.node),
                        rhs: Box::new(pr.node),
                    },
                    seeking,
                })
            }

            AstNode::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                let pc = self.process(*condition)?;
                let pt = self.process(*then_branch)?;
                let mut seeking = pc.seeking;
                seeking.extend(pt.seeking);
                let pe = match else_branch {
                    Some(e) => {
                        let p = self.process(*e)?;
                        seeking.extend(p.seeking);
                        Some(Box::new(p.node))
                    }
                    None => None,
                };
                Ok(Processed {
                    node: AstNode::Conditional {
                        condition: Box::new(pc.node),
                        then_branch: Box::new(pt.node),
                        else_branch: pe,
                    },
                    seeking,
                })
            }

            AstNode::Bind { name, value } => {
                let p = self.process(*value)?;
                Ok(Processed {
                    node: AstNode::Bind {
                        name,
                        value: Box::new(p.node),
                    },
                    seeking: p.seeking,
                })
            }

            AstNode::Apply { lhs, rhs } => {
                let pl = self.process(*lhs)?;
                let pr = self.process(*rhs)?;
                let mut seeking = pl.seeking;
                seeking.extend(pr.seeking);
                Ok(Processed {
                    node: AstNode::Apply {
                        lhs: Box::new(pl.node),
                        rhs: Box::new(pr.node),
                    },
                    seeking,
                })
            }

            AstNode::Call { procedure, args } => {
                let pp = self.process(*procedure)?;
                let mut seeking = pp.seeking;
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    let pa = self.process(arg)?;
                    seeking.extend(pa.seeking);
                    out.push(pa.node);
                }
                Ok(Processed {
                    node: AstNode::Call {
                        procedure: Box::new(pp.node),
                        args: out,
                    },
                    seeking,
                })
            }

            AstNode::Partial { procedure, args } => {
                let pp = self.process(*procedure)?;
                let mut seeking = pp.seeking;
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    let pa = self.process(arg)?;
                    seeking.extend(pa.seeking);
                    out.push(pa.node);
                }
                Ok(Processed {
                    node: AstNode::Partial {
                        procedure: Box::new(pp.node),
                        args: out,
                    },
                    seeking,
                })
            }

            AstNode::Transform {
                pattern,
                update,
                delete,
            } => {
                let pp = self.process(std::sync::Arc::unwrap_or_clone(pattern))?;
                let pu = self.process(std::sync::Arc::unwrap_or_clone(update))?;
                let mut seeking = pp.seeking;
                seeking.extend(pu.seeking);
                let pd = match delete {
                    Some(d) => {
                        let p = self.process(std::sync::Arc::unwrap_or_clone(d))?;
                        seeking.extend(p.seeking);
                        Some(std::sync::Arc::new(p.node))
                    }
                    None => None,
                };
                Ok(Processed {
                    node: AstNode::Transform {
                        pattern: std::sync::Arc::new(pp.node),
                        update: std::sync::Arc::new(pu.node),
                        delete: pd,
                    },
                    seeking,
                })
            }

            // already-final nodes reached through recursion
            AstNode::Path { .. }
            | AstNode::SortTerms(_)
            | AstNode::GroupBy { .. }
            | AstNode::Filter { .. } => Ok(Processed::plain(node)),
        }
    }
}

/// Convert a processed node into path steps, applying the step legality
/// rules: literals are rejected (S0213), strings coerce to names, an
/// existing predicate wrapper unwraps into a predicated step, and explicit
/// array constructors are tagged.
fn into_steps(node: AstNode, position: usize) -> Result<(Vec<PathStep>, bool), ParserError> {
    match node {
        AstNode::Path {
            steps,
            keep_singleton_array,
        } => Ok((steps, keep_singleton_array)),
        AstNode::Filter { input, predicates } => {
            if input.is_literal() {
                return Err(literal_step_error(&input, position));
            }
            let mut step = PathStep::new(coerce_string_step(*input));
            step.stages = predicates.into_iter().map(Stage::Filter).collect();
            Ok((vec![step], false))
        }
        other => {
            if other.is_literal() {
                return Err(literal_step_error(&other, position));
            }
            let mut step = PathStep::new(coerce_string_step(other));
            if matches!(step.node, AstNode::Array { .. }) {
                step.cons_array = true;
            }
            Ok((vec![step], false))
        }
    }
}

fn literal_step_error(node: &AstNode, position: usize) -> ParserError {
    let value = match node {
        AstNode::Integer(n) => n.to_string(),
        AstNode::Float(n) => n.to_string(),
        AstNode::Bool(b) => b.to_string(),
        AstNode::Null => "null".to_string(),
        other => format!("{:?}", other),
    };
    ParserError::LiteralPathStep { value, position }
}

/// String literals appearing as path steps become name steps.
fn coerce_string_step(node: AstNode) -> AstNode {
    match node {
        AstNode::String(s) => AstNode::Name {
            value: s,
            escaped: false,
        },
        other => other,
    }
}

/// Tag explicit array constructors at the head and tail of a path: the
/// first is evaluated once rather than mapped over the input, the last is
/// not flattened into the surrounding sequence.
fn tag_cons_steps(steps: &mut [PathStep]) {
    if let Some(first) = steps.first_mut() {
        if matches!(first.node, AstNode::Array { .. }) {
            first.cons_array = true;
        }
    }
    if let Some(last) = steps.last_mut() {
        if matches!(last.node, AstNode::Array { .. }) {
            last.cons_array = true;
        }
    }
}

/// S0215/S0216: a context-variable binding must precede predicates and any
/// order-by clause already on the step.
fn check_binding_order(step: &PathStep, position: usize) -> Result<(), ParserError> {
    if !step.stages.is_empty() {
        return Err(ParserError::ContextBindingAfterPredicate { position });
    }
    if matches!(step.node, AstNode::SortTerms(_)) {
        return Err(ParserError::ContextBindingAfterSort { position });
    }
    Ok(())
}

fn mark_predicate_slots(slots: Vec<Slot>) -> Vec<Slot> {
    slots
        .into_iter()
        .map(|mut slot| {
            slot.from_predicate = true;
            slot
        })
        .collect()
}

/// Resolve the slots carried by the step at `index` against the steps
/// before it: each earlier non-parent step consumes one level, each parent
/// step adds one. A slot reaching level zero binds to that step (the step's
/// input value is captured under the slot's label at runtime); anything
/// left over propagates outward through `pending`. Predicate-borne slots
/// spend their first level on the step at `index` itself.
fn resolve_step_slots(
    steps: &mut [PathStep],
    index: usize,
    slots: Vec<Slot>,
    pending: &mut Vec<Slot>,
) {
    for mut slot in slots {
        let mut level = slot.level;
        if slot.from_predicate {
            slot.from_predicate = false;
            if level == 1 {
                steps[index].ancestors.push(slot.label.clone());
                steps[index].tuple = true;
                continue;
            }
            level -= 1;
        }
        let mut resolved = false;
        let mut i = index as isize - 1;
        while i >= 0 {
            let step = &mut steps[i as usize];
            if matches!(step.node, AstNode::ParentSlot { .. }) {
                level += 1;
            } else {
                level -= 1;
            }
            if level == 0 {
                step.ancestors.push(slot.label.clone());
                step.tuple = true;
                resolved = true;
                break;
            }
            i -= 1;
        }
        if !resolved {
            slot.level = level;
            pending.push(slot);
        }
    }
}

/// Resolve slots escaping a predicate attached directly to the step at
/// `index`.
fn attach_predicate_slots(
    steps: &mut [PathStep],
    index: usize,
    slots: Vec<Slot>,
    pending: &mut Vec<Slot>,
) {
    resolve_step_slots(steps, index, mark_predicate_slots(slots), pending);
}

/// Wrap tail-position calls in a lambda body as zero-parameter thunks so
/// the evaluator's trampoline can run self-recursive tail calls without
/// stack growth. Tail positions recurse through blocks and conditionals.
fn tail_call_optimize(body: AstNode) -> AstNode {
    match body {
        call @ AstNode::Call { .. } => AstNode::Lambda {
            params: Vec::new(),
            signature: None,
            body: std::sync::Arc::new(call),
            thunk: true,
        },
        AstNode::Conditional {
            condition,
            then_branch,
            else_branch,
        } => AstNode::Conditional {
            condition,
            then_branch: Box::new(tail_call_optimize(*then_branch)),
            else_branch: else_branch.map(|e| Box::new(tail_call_optimize(*e))),
        },
        AstNode::Block(mut exprs) => {
            if let Some(last) = exprs.pop() {
                exprs.push(tail_call_optimize(last));
            }
            AstNode::Block(exprs)
        }
        other => other,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
