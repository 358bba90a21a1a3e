//! Bound constants: per-lambda interning of live runtime values that
//! cannot be materialized from bytecode alone, plus auxiliary slots the
//! emitter fills later (quoted trees, cell environments, call sites,
//! runtime-variable tables, switch dispatch tables, nested method
//! handles).

use rustc_hash::FxHashMap;

use crate::runtime::ops::CallSite;
use crate::runtime::{ConstantsRecord, Value};
use crate::tree::{ExprKind, ExprRef, NodeId, Type};

use super::error::CompileError;
use super::free_vars::free_variables;
use super::stack_guard::{with_guard, DEFAULT_GUARD_DEPTH};
use super::CompilerOptions;

// ============================================================================
// BoundConstants
// ============================================================================

/// The ordered constant slots of one lambda. Values are interned by
/// reference identity: the same object used twice occupies one slot.
#[derive(Default)]
pub(crate) struct BoundConstants {
    values: Vec<(Value, Type)>,
    index_of: FxHashMap<(usize, Type), usize>,
    ref_counts: Vec<usize>,
}

impl BoundConstants {
    /// Intern a live value, returning its slot and bumping its count.
    pub(crate) fn add_reference(
        &mut self,
        value: Value,
        ty: Type,
    ) -> Result<usize, CompileError> {
        let identity = value.identity().ok_or_else(|| {
            CompileError::constant(format!(
                "{} constants are emitted inline, not bound",
                value.kind_name()
            ))
        })?;
        let key = (identity, ty.clone());
        if let Some(&slot) = self.index_of.get(&key) {
            self.ref_counts[slot] += 1;
            return Ok(slot);
        }
        let slot = self.values.len();
        self.values.push((value, ty));
        self.ref_counts.push(1);
        self.index_of.insert(key, slot);
        Ok(slot)
    }

    /// Reserve an unfilled slot the emitter will populate.
    pub(crate) fn allocate(&mut self, ty: Type) -> usize {
        let slot = self.values.len();
        self.values.push((Value::Nil, ty));
        self.ref_counts.push(0);
        slot
    }

    /// Populate a reserved slot.
    pub(crate) fn fill(&mut self, slot: usize, value: Value) {
        self.values[slot].0 = value;
    }

    /// Slot of an already-interned value.
    pub(crate) fn lookup(&self, value: &Value, ty: &Type) -> Option<usize> {
        let identity = value.identity()?;
        self.index_of.get(&(identity, ty.clone())).copied()
    }

    pub(crate) fn count(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn ref_count(&self, slot: usize) -> usize {
        self.ref_counts[slot]
    }

    pub(crate) fn slot_type(&self, slot: usize) -> &Type {
        &self.values[slot].1
    }

    /// Freeze into the record the generated function reads at runtime.
    pub(crate) fn freeze(&self) -> std::sync::Arc<ConstantsRecord> {
        ConstantsRecord::new(self.values.iter().map(|(v, _)| v.clone()).collect())
    }
}

// ============================================================================
// Auxiliary slots
// ============================================================================

/// Reserved slots for nodes whose constants only exist once emission
/// reaches them.
#[derive(Debug, Clone)]
pub(crate) enum Aux {
    Quote {
        tree: usize,
        cell_env: Option<usize>,
    },
    Variables {
        table: usize,
    },
    StringSwitch {
        table: usize,
    },
    Site {
        slot: usize,
    },
    Lambda {
        method: usize,
        constants: usize,
    },
}

/// The allocation result: one [`BoundConstants`] per lambda plus the
/// auxiliary slot table keyed by node id.
pub(crate) struct ConstantPlan {
    pub per_lambda: FxHashMap<NodeId, BoundConstants>,
    pub aux: FxHashMap<NodeId, Aux>,
}

// ============================================================================
// Allocator
// ============================================================================

/// Walk the tree and allocate every bound constant and auxiliary slot.
pub(crate) fn allocate(
    root: &ExprRef,
    options: &CompilerOptions,
) -> Result<ConstantPlan, CompileError> {
    let mut alloc = Allocator {
        plan: ConstantPlan {
            per_lambda: FxHashMap::default(),
            aux: FxHashMap::default(),
        },
        options: options.clone(),
    };
    match root.kind() {
        ExprKind::Lambda(node) => {
            alloc.plan.per_lambda.insert(root.id(), BoundConstants::default());
            alloc.walk(&node.body, root.id(), 0)?;
            Ok(alloc.plan)
        }
        _ => Err(CompileError::invalid("expected a lambda at the top level").with_expression(root)),
    }
}

struct Allocator {
    plan: ConstantPlan,
    options: CompilerOptions,
}

impl Allocator {
    fn consts(&mut self, lambda: NodeId) -> &mut BoundConstants {
        self.plan.per_lambda.entry(lambda).or_default()
    }

    fn walk(&mut self, expr: &ExprRef, lambda: NodeId, depth: usize) -> Result<(), CompileError> {
        with_guard(depth, DEFAULT_GUARD_DEPTH, move || {
            self.walk_inner(expr, lambda, depth)
        })
    }

    fn walk_inner(
        &mut self,
        expr: &ExprRef,
        lambda: NodeId,
        depth: usize,
    ) -> Result<(), CompileError> {
        let d = depth + 1;
        match expr.kind() {
            ExprKind::Constant(value) => {
                if !value.is_inline_emittable() {
                    self.consts(lambda)
                        .add_reference(value.clone(), expr.ty().clone())?;
                }
            }

            ExprKind::CellRef { cell } => {
                self.consts(lambda)
                    .add_reference(Value::Cell(cell.clone()), Type::Object)?;
            }

            ExprKind::Variable(_) => {}

            ExprKind::RuntimeVariables { .. } => {
                let table = self.consts(lambda).allocate(Type::array(Type::Int));
                self.plan.aux.insert(expr.id(), Aux::Variables { table });
            }

            ExprKind::Quote { operand } => {
                // The quoted tree stays data; only its free variables
                // matter here, to decide whether a cell environment is
                // needed.
                let tree = self.consts(lambda).allocate(Type::Tree);
                let cell_env = if free_variables(operand).is_empty() {
                    None
                } else {
                    Some(self.consts(lambda).allocate(Type::Object))
                };
                self.plan.aux.insert(expr.id(), Aux::Quote { tree, cell_env });
            }

            ExprKind::Dynamic { binder, args } => {
                // The call site is created exactly once, here, and reused
                // by every run of the generated code.
                let site = CallSite::new(binder.clone());
                let slot = self
                    .consts(lambda)
                    .add_reference(Value::Obj(site), Type::Object)?;
                self.plan.aux.insert(expr.id(), Aux::Site { slot });
                for a in args {
                    self.walk(a, lambda, d)?;
                }
            }

            ExprKind::Lambda(node) => {
                // A nested lambda compiles to its own method with its own
                // constants; the enclosing lambda carries the handle pair.
                let method = self.consts(lambda).allocate(Type::Object);
                let constants = self.consts(lambda).allocate(Type::Object);
                self.plan.aux.insert(expr.id(), Aux::Lambda { method, constants });
                self.plan
                    .per_lambda
                    .entry(expr.id())
                    .or_default();
                self.walk(&node.body, expr.id(), d)?;
            }

            ExprKind::Invoke { target, args } => {
                if let ExprKind::Lambda(node) = target.kind() {
                    // Inlined invoke: the body's constants belong to the
                    // current lambda.
                    for a in args {
                        self.walk(a, lambda, d)?;
                    }
                    self.walk(&node.body, lambda, d)?;
                } else {
                    self.walk(target, lambda, d)?;
                    for a in args {
                        self.walk(a, lambda, d)?;
                    }
                }
            }

            ExprKind::Switch {
                value,
                cases,
                default,
            } => {
                self.walk(value, lambda, d)?;
                let all_strings = cases
                    .iter()
                    .flat_map(|c| c.values.iter())
                    .all(|v| matches!(v, Value::Str(_)));
                let case_count: usize = cases.iter().map(|c| c.values.len()).sum();
                if all_strings && case_count >= self.options.string_switch_threshold {
                    let table = self.consts(lambda).allocate(Type::Object);
                    self.plan.aux.insert(expr.id(), Aux::StringSwitch { table });
                } else {
                    // Linear dispatch compares against each case value.
                    for case in cases {
                        for v in &case.values {
                            if !v.is_inline_emittable() {
                                self.consts(lambda)
                                    .add_reference(v.clone(), value.ty().clone())?;
                            }
                        }
                    }
                }
                for case in cases {
                    self.walk(&case.body, lambda, d)?;
                }
                if let Some(e) = default {
                    self.walk(e, lambda, d)?;
                }
            }

            ExprKind::Block { exprs, .. } => {
                for e in exprs {
                    self.walk(e, lambda, d)?;
                }
            }
            ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
                for a in args {
                    self.walk(a, lambda, d)?;
                }
            }
            ExprKind::NewArray { items } => {
                for item in items {
                    self.walk(item, lambda, d)?;
                }
            }
            ExprKind::Index { array, index } => {
                self.walk(array, lambda, d)?;
                self.walk(index, lambda, d)?;
            }
            ExprKind::Assign { target, value } => {
                self.walk(target, lambda, d)?;
                self.walk(value, lambda, d)?;
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk(lhs, lambda, d)?;
                self.walk(rhs, lambda, d)?;
            }
            ExprKind::Unary { operand, .. } => self.walk(operand, lambda, d)?,
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.walk(test, lambda, d)?;
                self.walk(if_true, lambda, d)?;
                self.walk(if_false, lambda, d)?;
            }
            ExprKind::Loop { body, .. } => self.walk(body, lambda, d)?,
            ExprKind::Label { default, .. } => {
                if let Some(e) = default {
                    self.walk(e, lambda, d)?;
                }
            }
            ExprKind::Goto { value, .. } => {
                if let Some(e) = value {
                    self.walk(e, lambda, d)?;
                }
            }
            ExprKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                self.walk(body, lambda, d)?;
                for h in handlers {
                    if let Some(filter) = &h.filter {
                        self.walk(filter, lambda, d)?;
                    }
                    self.walk(&h.body, lambda, d)?;
                }
                if let Some(e) = finally {
                    self.walk(e, lambda, d)?;
                }
                if let Some(e) = fault {
                    self.walk(e, lambda, d)?;
                }
            }
            ExprKind::Throw { value } => {
                if let Some(e) = value {
                    self.walk(e, lambda, d)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Expr, SwitchCase, Type, Var};

    fn plan_of(body: ExprRef) -> (NodeId, ConstantPlan) {
        let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
        let plan = allocate(&lam, &CompilerOptions::default()).unwrap();
        (lam.id(), plan)
    }

    #[test]
    fn test_inline_constants_are_not_bound() {
        let (id, plan) = plan_of(Expr::add(Expr::int(1), Expr::int(2)));
        assert_eq!(plan.per_lambda[&id].count(), 0);
    }

    #[test]
    fn test_shared_object_occupies_one_slot() {
        let big = Value::big(1234567890123456789_i64);
        let body = Expr::add(
            Expr::constant(big.clone(), Type::BigInt),
            Expr::constant(big.clone(), Type::BigInt),
        );
        let (id, plan) = plan_of(body);
        let consts = &plan.per_lambda[&id];
        assert_eq!(consts.count(), 1);
        assert_eq!(consts.ref_count(0), 2);
    }

    #[test]
    fn test_distinct_objects_get_distinct_slots() {
        let body = Expr::add(
            Expr::constant(Value::big(7), Type::BigInt),
            Expr::constant(Value::big(7), Type::BigInt),
        );
        let (id, plan) = plan_of(body);
        assert_eq!(plan.per_lambda[&id].count(), 2);
    }

    #[test]
    fn test_quote_with_free_variables_gets_two_slots() {
        let x = Var::new("x", Type::Int);
        let body = Expr::block(
            vec![x.clone()],
            vec![Expr::quote(Expr::variable(&x))],
        );
        let (id, plan) = plan_of(body);
        let consts = &plan.per_lambda[&id];
        assert_eq!(consts.count(), 2);
        assert_eq!(*consts.slot_type(0), Type::Tree);
        assert_eq!(*consts.slot_type(1), Type::Object);
    }

    #[test]
    fn test_closed_quote_gets_one_slot() {
        let body = Expr::quote(Expr::int(1));
        let (id, plan) = plan_of(body);
        assert_eq!(plan.per_lambda[&id].count(), 1);
        match plan.aux.values().next() {
            Some(Aux::Quote { cell_env: None, .. }) => {}
            other => panic!("expected closed quote aux, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_lambda_gets_handle_pair_and_own_constants() {
        let inner = Expr::lambda(None, vec![], Type::BigInt,
            Expr::constant(Value::big(5), Type::BigInt));
        let inner_id = inner.id();
        let (outer_id, plan) = plan_of(Expr::block(vec![], vec![inner, Expr::int(0)]));
        // outer carries method + constants slots for the nested lambda
        assert_eq!(plan.per_lambda[&outer_id].count(), 2);
        // the big-int constant lives in the nested lambda's own record
        assert_eq!(plan.per_lambda[&inner_id].count(), 1);
    }

    #[test]
    fn test_inlined_invoke_shares_constants() {
        let x = Var::new("x", Type::BigInt);
        let inner = Expr::lambda(None, vec![x.clone()], Type::BigInt, Expr::variable(&x));
        let body = Expr::invoke(inner, vec![Expr::constant(Value::big(5), Type::BigInt)]);
        let (outer_id, plan) = plan_of(body);
        // one slot for the argument constant, none for handles
        assert_eq!(plan.per_lambda[&outer_id].count(), 1);
        assert_eq!(plan.per_lambda.len(), 1);
    }

    #[test]
    fn test_string_switch_reserves_table() {
        let cases: Vec<SwitchCase> = (0..7)
            .map(|i| SwitchCase::new(vec![Value::Str(format!("k{i}").into())], Expr::int(i)))
            .collect();
        let body = Expr::switch(Expr::string("k3"), cases, Some(Expr::int(-1)));
        let (id, plan) = plan_of(body);
        assert_eq!(plan.per_lambda[&id].count(), 1);
        assert!(matches!(
            plan.aux.values().next(),
            Some(Aux::StringSwitch { .. })
        ));
    }

    #[test]
    fn test_small_string_switch_stays_linear() {
        let cases: Vec<SwitchCase> = (0..3)
            .map(|i| SwitchCase::new(vec![Value::Str(format!("k{i}").into())], Expr::int(i)))
            .collect();
        let body = Expr::switch(Expr::string("k1"), cases, Some(Expr::int(-1)));
        let (id, plan) = plan_of(body);
        assert_eq!(plan.per_lambda[&id].count(), 0);
        assert!(plan.aux.is_empty());
    }

    #[test]
    fn test_runtime_variables_reserve_table_slot() {
        let x = Var::new("x", Type::Int);
        let body = Expr::block(vec![x.clone()], vec![Expr::runtime_variables(vec![x.clone()])]);
        let (id, plan) = plan_of(body);
        let consts = &plan.per_lambda[&id];
        assert_eq!(consts.count(), 1);
        assert_eq!(*consts.slot_type(0), Type::array(Type::Int));
    }
}
