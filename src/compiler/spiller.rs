//! The stack spiller: rewrites a lambda tree so that every node that
//! must be entered with an empty evaluation stack (a spill site) is so
//! reached.
//!
//! The walk models the abstract stack as a single bit: empty or not at
//! each child position. When a child that requires an empty stack sits
//! at a position where operands are already on the stack, the enclosing
//! node is rewritten into a block that evaluates every operand into a
//! fresh temporary first, then rebuilds the node from the temporaries.
//! The requirement propagates upward until a position that is entered at
//! empty stack absorbs it. Side-effect order is preserved, and no
//! operand is ever evaluated twice.

use std::sync::Arc;

use crate::tree::{CatchClause, Expr, ExprKind, ExprRef, LambdaNode, SwitchCase, Var, VarRef};

use super::error::CompileError;
use super::stack_guard::{with_guard, DEFAULT_GUARD_DEPTH};

/// Rewrite a lambda so every spill site is entered at stack depth zero.
/// Returns the original reference when nothing needed spilling.
pub(crate) fn spill(lambda: &ExprRef) -> Result<ExprRef, CompileError> {
    match lambda.kind() {
        ExprKind::Lambda(_) => {
            let rw = rewrite(lambda, true, 0)?;
            Ok(rw.expr)
        }
        _ => Err(CompileError::invalid("expected a lambda at the top level")
            .with_expression(lambda)),
    }
}

struct Rewrite {
    expr: ExprRef,
    /// The rewritten expression must be entered with an empty stack.
    requires_empty: bool,
    changed: bool,
}

impl Rewrite {
    fn unchanged(expr: &ExprRef) -> Rewrite {
        Rewrite {
            expr: expr.clone(),
            requires_empty: false,
            changed: false,
        }
    }
}

fn rewrite(expr: &ExprRef, at_empty: bool, depth: usize) -> Result<Rewrite, CompileError> {
    with_guard(depth, DEFAULT_GUARD_DEPTH, move || {
        rewrite_inner(expr, at_empty, depth)
    })
}

/// Rewrite operand-style children: the first child is evaluated at the
/// node's entry depth, every later child with earlier operands already
/// on the stack. If any child demands an empty stack from a non-empty
/// position, all operands are spilled to temporaries.
fn rewrite_operands(
    expr: &ExprRef,
    at_empty: bool,
    children: Vec<ExprRef>,
    depth: usize,
    rebuild: impl FnOnce(Vec<ExprRef>) -> ExprKind,
) -> Result<Rewrite, CompileError> {
    let mut rewritten = Vec::with_capacity(children.len());
    let mut changed = false;
    let mut need_spill = false;
    for (i, child) in children.iter().enumerate() {
        let position_empty = i == 0 && at_empty;
        let rw = rewrite(child, position_empty, depth + 1)?;
        if rw.requires_empty && !position_empty {
            need_spill = true;
        }
        changed |= rw.changed;
        rewritten.push(rw.expr);
    }

    if !need_spill {
        let expr = if changed {
            Expr::rebuild(expr.ty().clone(), rebuild(rewritten))
        } else {
            expr.clone()
        };
        return Ok(Rewrite {
            expr,
            requires_empty: false,
            changed,
        });
    }

    // Hoist every operand into a temporary, in evaluation order, then
    // rebuild the node reading the temporaries.
    let mut temps: Vec<VarRef> = Vec::with_capacity(rewritten.len());
    let mut stmts: Vec<ExprRef> = Vec::with_capacity(rewritten.len() + 1);
    let mut operands: Vec<ExprRef> = Vec::with_capacity(rewritten.len());
    for child in rewritten {
        let temp = Var::new("$spilled", child.ty().clone());
        stmts.push(Expr::assign(Expr::variable(&temp), child));
        operands.push(Expr::variable(&temp));
        temps.push(temp);
    }
    stmts.push(Expr::rebuild(expr.ty().clone(), rebuild(operands)));
    let block = Expr::rebuild(
        expr.ty().clone(),
        ExprKind::Block {
            vars: temps,
            exprs: stmts,
        },
    );
    Ok(Rewrite {
        expr: block,
        requires_empty: !at_empty,
        changed: true,
    })
}

/// Rewrite children that all sit at the node's entry depth; the node
/// cannot absorb a spill itself and only propagates the requirement.
struct Inherited {
    changed: bool,
    requires: bool,
}

impl Inherited {
    fn new() -> Inherited {
        Inherited {
            changed: false,
            requires: false,
        }
    }

    fn child(
        &mut self,
        expr: &ExprRef,
        at_empty: bool,
        depth: usize,
    ) -> Result<ExprRef, CompileError> {
        let rw = rewrite(expr, at_empty, depth + 1)?;
        self.changed |= rw.changed;
        if rw.requires_empty && !at_empty {
            self.requires = true;
        }
        Ok(rw.expr)
    }

    fn opt_child(
        &mut self,
        expr: &Option<ExprRef>,
        at_empty: bool,
        depth: usize,
    ) -> Result<Option<ExprRef>, CompileError> {
        match expr {
            Some(e) => Ok(Some(self.child(e, at_empty, depth)?)),
            None => Ok(None),
        }
    }

    fn finish(self, original: &ExprRef, kind: ExprKind) -> Rewrite {
        let expr = if self.changed {
            Expr::rebuild(original.ty().clone(), kind)
        } else {
            original.clone()
        };
        Rewrite {
            expr,
            requires_empty: self.requires,
            changed: self.changed,
        }
    }
}

fn rewrite_inner(expr: &ExprRef, at_empty: bool, depth: usize) -> Result<Rewrite, CompileError> {
    let d = depth + 1;
    match expr.kind() {
        // Leaves, and quoted trees, which stay data.
        ExprKind::Constant(_)
        | ExprKind::Variable(_)
        | ExprKind::CellRef { .. }
        | ExprKind::Quote { .. }
        | ExprKind::RuntimeVariables { .. } => Ok(Rewrite::unchanged(expr)),

        ExprKind::Lambda(node) => {
            let body = rewrite(&node.body, true, d)?;
            if !body.changed {
                return Ok(Rewrite::unchanged(expr));
            }
            let rebuilt = Expr::rebuild(
                expr.ty().clone(),
                ExprKind::Lambda(Arc::new(LambdaNode {
                    name: node.name.clone(),
                    params: node.params.clone(),
                    body: body.expr,
                    ret: node.ret.clone(),
                    sig: node.sig.clone(),
                })),
            );
            Ok(Rewrite {
                expr: rebuilt,
                requires_empty: false,
                changed: true,
            })
        }

        ExprKind::Block { vars, exprs } => {
            let mut walk = Inherited::new();
            let new_exprs = exprs
                .iter()
                .map(|e| walk.child(e, at_empty, d))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(walk.finish(
                expr,
                ExprKind::Block {
                    vars: vars.clone(),
                    exprs: new_exprs,
                },
            ))
        }

        ExprKind::Invoke { target, args } => {
            if let ExprKind::Lambda(node) = target.kind() {
                // Inlined invoke: arguments are stored into parameters one
                // by one and the body runs at the invoke's entry depth.
                let mut walk = Inherited::new();
                let new_args = args
                    .iter()
                    .map(|a| walk.child(a, at_empty, d))
                    .collect::<Result<Vec<_>, _>>()?;
                let body = walk.child(&node.body, at_empty, d)?;
                let new_target = if walk.changed {
                    Expr::rebuild(
                        target.ty().clone(),
                        ExprKind::Lambda(Arc::new(LambdaNode {
                            name: node.name.clone(),
                            params: node.params.clone(),
                            body,
                            ret: node.ret.clone(),
                            sig: node.sig.clone(),
                        })),
                    )
                } else {
                    target.clone()
                };
                return Ok(walk.finish(
                    expr,
                    ExprKind::Invoke {
                        target: new_target,
                        args: new_args,
                    },
                ));
            }
            let mut children = vec![target.clone()];
            children.extend(args.iter().cloned());
            rewrite_operands(expr, at_empty, children, d, |mut ops| {
                let target = ops.remove(0);
                ExprKind::Invoke { target, args: ops }
            })
        }

        ExprKind::Call { method, args } => {
            let method = method.clone();
            rewrite_operands(expr, at_empty, args.clone(), d, move |ops| ExprKind::Call {
                method,
                args: ops,
            })
        }

        ExprKind::New { ctor, args } => {
            let ctor = ctor.clone();
            rewrite_operands(expr, at_empty, args.clone(), d, move |ops| ExprKind::New {
                ctor,
                args: ops,
            })
        }

        ExprKind::NewArray { items } => {
            rewrite_operands(expr, at_empty, items.clone(), d, |ops| ExprKind::NewArray {
                items: ops,
            })
        }

        ExprKind::Index { array, index } => rewrite_operands(
            expr,
            at_empty,
            vec![array.clone(), index.clone()],
            d,
            |mut ops| {
                let index = ops.pop().expect("two operands");
                let array = ops.pop().expect("two operands");
                ExprKind::Index { array, index }
            },
        ),

        ExprKind::Assign { target, value } => match target.kind() {
            // Variable and cell stores take no operand stack; the value
            // is evaluated at the node's entry depth and stored once.
            ExprKind::Variable(_) | ExprKind::CellRef { .. } => {
                let mut walk = Inherited::new();
                let new_value = walk.child(value, at_empty, d)?;
                Ok(walk.finish(
                    expr,
                    ExprKind::Assign {
                        target: target.clone(),
                        value: new_value,
                    },
                ))
            }
            ExprKind::Index { array, index } => {
                let target_ty = target.ty().clone();
                rewrite_operands(
                    expr,
                    at_empty,
                    vec![array.clone(), index.clone(), value.clone()],
                    d,
                    move |mut ops| {
                        let value = ops.pop().expect("three operands");
                        let index = ops.pop().expect("three operands");
                        let array = ops.pop().expect("three operands");
                        ExprKind::Assign {
                            target: Expr::rebuild(target_ty, ExprKind::Index { array, index }),
                            value,
                        }
                    },
                )
            }
            _ => Err(CompileError::invalid("assignment target must be a variable, index, or cell")
                .with_expression(expr)),
        },

        ExprKind::Binary {
            op,
            checked,
            lhs,
            rhs,
        } => {
            if op.is_short_circuit() {
                // The right operand only runs after the left is popped.
                let mut walk = Inherited::new();
                let new_lhs = walk.child(lhs, at_empty, d)?;
                let new_rhs = walk.child(rhs, at_empty, d)?;
                return Ok(walk.finish(
                    expr,
                    ExprKind::Binary {
                        op: *op,
                        checked: *checked,
                        lhs: new_lhs,
                        rhs: new_rhs,
                    },
                ));
            }
            let (op, checked) = (*op, *checked);
            rewrite_operands(
                expr,
                at_empty,
                vec![lhs.clone(), rhs.clone()],
                d,
                move |mut ops| {
                    let rhs = ops.pop().expect("two operands");
                    let lhs = ops.pop().expect("two operands");
                    ExprKind::Binary {
                        op,
                        checked,
                        lhs,
                        rhs,
                    }
                },
            )
        }

        ExprKind::Unary {
            op,
            checked,
            operand,
        } => {
            let (op, checked) = (*op, *checked);
            rewrite_operands(
                expr,
                at_empty,
                vec![operand.clone()],
                d,
                move |mut ops| ExprKind::Unary {
                    op,
                    checked,
                    operand: ops.pop().expect("one operand"),
                },
            )
        }

        ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } => {
            let mut walk = Inherited::new();
            let new_test = walk.child(test, at_empty, d)?;
            let new_true = walk.child(if_true, at_empty, d)?;
            let new_false = walk.child(if_false, at_empty, d)?;
            Ok(walk.finish(
                expr,
                ExprKind::Conditional {
                    test: new_test,
                    if_true: new_true,
                    if_false: new_false,
                },
            ))
        }

        ExprKind::Loop {
            body,
            break_label,
            continue_label,
        } => {
            let mut walk = Inherited::new();
            let new_body = walk.child(body, at_empty, d)?;
            Ok(walk.finish(
                expr,
                ExprKind::Loop {
                    body: new_body,
                    break_label: break_label.clone(),
                    continue_label: continue_label.clone(),
                },
            ))
        }

        ExprKind::Label { target, default } => {
            let mut walk = Inherited::new();
            let new_default = walk.opt_child(default, at_empty, d)?;
            Ok(walk.finish(
                expr,
                ExprKind::Label {
                    target: target.clone(),
                    default: new_default,
                },
            ))
        }

        ExprKind::Goto {
            kind,
            target,
            value,
        } => {
            let mut walk = Inherited::new();
            let new_value = walk.opt_child(value, at_empty, d)?;
            Ok(walk.finish(
                expr,
                ExprKind::Goto {
                    kind: *kind,
                    target: target.clone(),
                    value: new_value,
                },
            ))
        }

        ExprKind::Throw { value } => {
            let mut walk = Inherited::new();
            let new_value = walk.opt_child(value, at_empty, d)?;
            Ok(walk.finish(expr, ExprKind::Throw { value: new_value }))
        }

        // A try is a spill site: every section starts at empty stack.
        ExprKind::Try {
            body,
            handlers,
            finally,
            fault,
        } => {
            let mut changed = false;
            let body_rw = rewrite(body, true, d)?;
            changed |= body_rw.changed;
            let mut new_handlers = Vec::with_capacity(handlers.len());
            for h in handlers {
                let filter = match &h.filter {
                    Some(filter) => {
                        let rw = rewrite(filter, true, d)?;
                        changed |= rw.changed;
                        Some(rw.expr)
                    }
                    None => None,
                };
                let hbody = rewrite(&h.body, true, d)?;
                changed |= hbody.changed;
                if changed {
                    let mut clause = CatchClause::new(h.var.clone(), hbody.expr);
                    if let Some(filter) = filter {
                        clause = clause.with_filter(filter);
                    }
                    new_handlers.push(clause);
                } else {
                    new_handlers.push(h.clone());
                }
            }
            let new_finally = match finally {
                Some(e) => {
                    let rw = rewrite(e, true, d)?;
                    changed |= rw.changed;
                    Some(rw.expr)
                }
                None => None,
            };
            let new_fault = match fault {
                Some(e) => {
                    let rw = rewrite(e, true, d)?;
                    changed |= rw.changed;
                    Some(rw.expr)
                }
                None => None,
            };
            let rebuilt = if changed {
                Expr::rebuild(
                    expr.ty().clone(),
                    ExprKind::Try {
                        body: body_rw.expr,
                        handlers: new_handlers,
                        finally: new_finally,
                        fault: new_fault,
                    },
                )
            } else {
                expr.clone()
            };
            Ok(Rewrite {
                expr: rebuilt,
                requires_empty: !at_empty,
                changed,
            })
        }

        // A switch is likewise entered at empty stack.
        ExprKind::Switch {
            value,
            cases,
            default,
        } => {
            let mut walk = Inherited::new();
            let new_value = walk.child(value, at_empty, d)?;
            let new_cases = cases
                .iter()
                .map(|c| {
                    Ok(SwitchCase::new(
                        c.values.clone(),
                        walk.child(&c.body, at_empty, d)?,
                    ))
                })
                .collect::<Result<Vec<_>, CompileError>>()?;
            let new_default = walk.opt_child(default, at_empty, d)?;
            let mut rw = walk.finish(
                expr,
                ExprKind::Switch {
                    value: new_value,
                    cases: new_cases,
                    default: new_default,
                },
            );
            rw.requires_empty = !at_empty;
            Ok(rw)
        }

        ExprKind::Dynamic { binder, args } => {
            let binder = binder.clone();
            rewrite_operands(expr, at_empty, args.clone(), d, move |ops| {
                ExprKind::Dynamic { binder, args: ops }
            })
        }
    }
}
