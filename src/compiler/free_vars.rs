//! Free-variable analysis over a sub-tree.
//!
//! Used by the constant allocator to decide whether a quoted tree needs
//! a live cell-environment, and by the emitter to lay that environment
//! out. The result order is first-use order, so both callers see the
//! same layout.

use im::HashSet as ImHashSet;
use rustc_hash::FxHashSet;

use crate::tree::{ExprKind, ExprRef, VarId, VarRef};

use super::stack_guard::{with_guard, DEFAULT_GUARD_DEPTH};

/// Find all free variables of an expression: variables used but not
/// declared within it, in first-use order.
pub(crate) fn free_variables(expr: &ExprRef) -> Vec<VarRef> {
    let mut found = Vec::new();
    let mut seen = FxHashSet::default();
    collect(expr, &ImHashSet::new(), &mut seen, &mut found, 0);
    found
}

fn collect(
    expr: &ExprRef,
    bound: &ImHashSet<VarId>,
    seen: &mut FxHashSet<VarId>,
    found: &mut Vec<VarRef>,
    depth: usize,
) {
    with_guard(depth, DEFAULT_GUARD_DEPTH, move || {
        collect_inner(expr, bound, seen, found, depth)
    })
}

fn collect_inner(
    expr: &ExprRef,
    bound: &ImHashSet<VarId>,
    seen: &mut FxHashSet<VarId>,
    found: &mut Vec<VarRef>,
    depth: usize,
) {
    let d = depth + 1;
    match expr.kind() {
        ExprKind::Variable(var) => {
            if !bound.contains(&var.id()) && seen.insert(var.id()) {
                found.push(var.clone());
            }
        }
        ExprKind::Constant(_) | ExprKind::CellRef { .. } => {}
        ExprKind::Block { vars, exprs } => {
            let mut inner = bound.clone();
            for v in vars {
                inner.insert(v.id());
            }
            for e in exprs {
                collect(e, &inner, seen, found, d);
            }
        }
        ExprKind::Lambda(node) => {
            let mut inner = bound.clone();
            for p in &node.params {
                inner.insert(p.id());
            }
            collect(&node.body, &inner, seen, found, d);
        }
        ExprKind::Invoke { target, args } => {
            collect(target, bound, seen, found, d);
            for a in args {
                collect(a, bound, seen, found, d);
            }
        }
        ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
            for a in args {
                collect(a, bound, seen, found, d);
            }
        }
        ExprKind::NewArray { items } => {
            for item in items {
                collect(item, bound, seen, found, d);
            }
        }
        ExprKind::Index { array, index } => {
            collect(array, bound, seen, found, d);
            collect(index, bound, seen, found, d);
        }
        ExprKind::Assign { target, value } => {
            collect(target, bound, seen, found, d);
            collect(value, bound, seen, found, d);
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            collect(lhs, bound, seen, found, d);
            collect(rhs, bound, seen, found, d);
        }
        ExprKind::Unary { operand, .. } => collect(operand, bound, seen, found, d),
        ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } => {
            collect(test, bound, seen, found, d);
            collect(if_true, bound, seen, found, d);
            collect(if_false, bound, seen, found, d);
        }
        ExprKind::Loop { body, .. } => collect(body, bound, seen, found, d),
        ExprKind::Label { default, .. } => {
            if let Some(e) = default {
                collect(e, bound, seen, found, d);
            }
        }
        ExprKind::Goto { value, .. } => {
            if let Some(e) = value {
                collect(e, bound, seen, found, d);
            }
        }
        ExprKind::Try {
            body,
            handlers,
            finally,
            fault,
        } => {
            collect(body, bound, seen, found, d);
            for h in handlers {
                let mut inner = bound.clone();
                if let Some(v) = &h.var {
                    inner.insert(v.id());
                }
                if let Some(filter) = &h.filter {
                    collect(filter, &inner, seen, found, d);
                }
                collect(&h.body, &inner, seen, found, d);
            }
            if let Some(e) = finally {
                collect(e, bound, seen, found, d);
            }
            if let Some(e) = fault {
                collect(e, bound, seen, found, d);
            }
        }
        ExprKind::Switch {
            value,
            cases,
            default,
        } => {
            collect(value, bound, seen, found, d);
            for c in cases {
                collect(&c.body, bound, seen, found, d);
            }
            if let Some(e) = default {
                collect(e, bound, seen, found, d);
            }
        }
        ExprKind::Throw { value } => {
            if let Some(e) = value {
                collect(e, bound, seen, found, d);
            }
        }
        ExprKind::Quote { operand } => collect(operand, bound, seen, found, d),
        ExprKind::RuntimeVariables { vars } => {
            for var in vars {
                if !bound.contains(&var.id()) && seen.insert(var.id()) {
                    found.push(var.clone());
                }
            }
        }
        ExprKind::Dynamic { args, .. } => {
            for a in args {
                collect(a, bound, seen, found, d);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Expr, Type, Var};

    #[test]
    fn test_free_variable_found() {
        let x = Var::new("x", Type::Int);
        let free = free_variables(&Expr::add(Expr::variable(&x), Expr::int(1)));
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id(), x.id());
    }

    #[test]
    fn test_lambda_binds_its_parameters() {
        let x = Var::new("x", Type::Int);
        let y = Var::new("y", Type::Int);
        let lam = Expr::lambda(
            None,
            vec![x.clone()],
            Type::Int,
            Expr::add(Expr::variable(&x), Expr::variable(&y)),
        );
        let free = free_variables(&lam);
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id(), y.id());
    }

    #[test]
    fn test_block_declarations_shadow() {
        let x = Var::new("x", Type::Int);
        let block = Expr::block(vec![x.clone()], vec![Expr::variable(&x)]);
        assert!(free_variables(&block).is_empty());
    }

    #[test]
    fn test_first_use_order_and_dedup() {
        let a = Var::new("a", Type::Int);
        let b = Var::new("b", Type::Int);
        let e = Expr::add(
            Expr::add(Expr::variable(&b), Expr::variable(&a)),
            Expr::variable(&b),
        );
        let free = free_variables(&e);
        assert_eq!(free.len(), 2);
        assert_eq!(free[0].id(), b.id());
        assert_eq!(free[1].id(), a.id());
    }

    #[test]
    fn test_catch_variable_is_bound_in_handler() {
        let ex = Var::new("ex", Type::Object);
        let body = Expr::try_catch(
            Expr::int(1),
            vec![crate::tree::CatchClause::new(
                Some(ex.clone()),
                Expr::block(vec![], vec![Expr::variable(&ex), Expr::int(2)]),
            )],
        );
        assert!(free_variables(&body).is_empty());
    }
}
