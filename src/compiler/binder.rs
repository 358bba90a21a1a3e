//! The variable binder: classifies every variable declaration as an
//! argument, a stack local, a boxed cell, or a hoisted slot of its
//! defining lambda's closure record, and lays the closure records out.
//!
//! Two passes. The first collects, for every variable, the lambdas that
//! reference it and whether a quote or runtime-variables node does; the
//! second classifies and assigns closure-record field indices. Field 0
//! of a record is the parent back-reference when the lambda has an
//! enclosing record.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::tree::{ExprKind, ExprRef, NodeId, VarId, VarRef};

use super::error::CompileError;
use super::free_vars::free_variables;
use super::stack_guard::{with_guard, DEFAULT_GUARD_DEPTH};

// ============================================================================
// Results
// ============================================================================

/// Where a variable lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarStorage {
    /// Incoming machine argument slot.
    Argument(u16),
    /// Stack slot of the generated function.
    Local,
    /// A shared cell held in a local; quotes alias it.
    Boxed,
    /// Field of the defining lambda's closure record.
    Hoisted { index: u16 },
    /// A shared cell held in a closure-record field.
    HoistedBoxed { index: u16 },
}

impl VarStorage {
    pub(crate) fn is_boxed(&self) -> bool {
        matches!(self, VarStorage::Boxed | VarStorage::HoistedBoxed { .. })
    }

    pub(crate) fn hoisted_index(&self) -> Option<u16> {
        match self {
            VarStorage::Hoisted { index } | VarStorage::HoistedBoxed { index } => Some(*index),
            _ => None,
        }
    }
}

/// Closure layout of one lambda.
#[derive(Debug, Default)]
pub(crate) struct LambdaInfo {
    /// Hoisted variables in declaration order, excluding the parent slot.
    pub hoisted: Vec<VarRef>,
    /// Whether field 0 holds the enclosing closure record.
    pub has_parent_field: bool,
    /// Total record arity including the parent slot.
    pub record_arity: usize,
    pub needs_closure: bool,
    /// References variables hoisted in an enclosing lambda, so the
    /// generated function needs the environment's locals.
    pub uses_outer: bool,
    /// Enclosing lambda, if any.
    pub parent: Option<NodeId>,
}

#[derive(Debug)]
pub(crate) struct Analysis {
    pub var_storage: FxHashMap<VarId, VarStorage>,
    /// Defining lambda of each variable.
    pub var_home: FxHashMap<VarId, NodeId>,
    pub lambdas: FxHashMap<NodeId, LambdaInfo>,
}

impl Analysis {
    pub(crate) fn storage(&self, id: VarId) -> Option<VarStorage> {
        self.var_storage.get(&id).copied()
    }

    /// Record-bearing lambdas enclosing `lambda`, nearest first.
    pub(crate) fn record_chain(&self, lambda: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = self.lambdas.get(&lambda).and_then(|info| info.parent);
        while let Some(id) = cursor {
            let info = &self.lambdas[&id];
            if info.needs_closure {
                chain.push(id);
            }
            cursor = info.parent;
        }
        chain
    }
}

// ============================================================================
// Pass 1: reference collection
// ============================================================================

struct VarInfo {
    var: VarRef,
    home_lambda: NodeId,
    param_index: Option<u16>,
    ref_lambdas: FxHashSet<NodeId>,
    quoted: bool,
    runtime_ref: bool,
}

struct Collector {
    scopes: Vec<FxHashSet<VarId>>,
    vars: FxHashMap<VarId, VarInfo>,
    order: Vec<VarId>,
    lambda_stack: Vec<NodeId>,
    lambda_parent: FxHashMap<NodeId, Option<NodeId>>,
    labels: FxHashMap<NodeId, FxHashSet<u64>>,
    gotos: Vec<(NodeId, crate::tree::LabelRef)>,
}

impl Collector {
    fn current_lambda(&self) -> NodeId {
        *self.lambda_stack.last().expect("always inside a lambda")
    }

    fn declare(&mut self, var: &VarRef, param_index: Option<u16>) -> Result<(), CompileError> {
        if var.is_by_ref() {
            return Err(CompileError::not_supported(format!(
                "by-ref variable '{var}'"
            ))
            .with_suggestion("pass a cell instead"));
        }
        if self.vars.contains_key(&var.id()) {
            return Err(CompileError::invalid(format!(
                "variable '{var}' is declared in more than one scope"
            )));
        }
        self.scopes
            .last_mut()
            .expect("declare inside a scope")
            .insert(var.id());
        self.vars.insert(
            var.id(),
            VarInfo {
                var: var.clone(),
                home_lambda: self.current_lambda(),
                param_index,
                ref_lambdas: FxHashSet::default(),
                quoted: false,
                runtime_ref: false,
            },
        );
        self.order.push(var.id());
        Ok(())
    }

    fn reference(&mut self, var: &VarRef) -> Result<&mut VarInfo, CompileError> {
        let declared = self.scopes.iter().rev().any(|s| s.contains(&var.id()));
        if !declared {
            return Err(CompileError::invalid(format!("undeclared variable '{var}'")));
        }
        let lambda = self.current_lambda();
        let info = self
            .vars
            .get_mut(&var.id())
            .expect("declared variables are collected");
        info.ref_lambdas.insert(lambda);
        Ok(info)
    }

    fn define_label(&mut self, label: &crate::tree::LabelRef) -> Result<(), CompileError> {
        let lambda = self.current_lambda();
        if !self.labels.entry(lambda).or_default().insert(label.id()) {
            return Err(CompileError::invalid(format!(
                "label '{}' marked more than once",
                label.name()
            )));
        }
        Ok(())
    }

    fn walk(&mut self, expr: &ExprRef, depth: usize) -> Result<(), CompileError> {
        with_guard(depth, DEFAULT_GUARD_DEPTH, move || self.walk_inner(expr, depth))
    }

    fn walk_inner(&mut self, expr: &ExprRef, depth: usize) -> Result<(), CompileError> {
        let d = depth + 1;
        match expr.kind() {
            ExprKind::Variable(var) => {
                self.reference(var)?;
            }

            ExprKind::Constant(_) | ExprKind::CellRef { .. } => {}

            ExprKind::Block { vars, exprs } => {
                self.scopes.push(FxHashSet::default());
                for v in vars {
                    self.declare(v, None)?;
                }
                for e in exprs {
                    self.walk(e, d)?;
                }
                self.scopes.pop();
            }

            ExprKind::Lambda(node) => {
                self.lambda_parent
                    .insert(expr.id(), Some(self.current_lambda()));
                self.lambda_stack.push(expr.id());
                self.scopes.push(FxHashSet::default());
                for (i, p) in node.params.iter().enumerate() {
                    self.declare(p, Some(i as u16))?;
                }
                self.walk(&node.body, d)?;
                self.scopes.pop();
                self.lambda_stack.pop();
            }

            ExprKind::Invoke { target, args } => {
                if let ExprKind::Lambda(node) = target.kind() {
                    // Inlined: the parameters live in the current lambda,
                    // in a scope keyed by this invoke node.
                    for a in args {
                        self.walk(a, d)?;
                    }
                    self.scopes.push(FxHashSet::default());
                    for p in &node.params {
                        self.declare(p, None)?;
                    }
                    self.walk(&node.body, d)?;
                    self.scopes.pop();
                } else {
                    self.walk(target, d)?;
                    for a in args {
                        self.walk(a, d)?;
                    }
                }
            }

            ExprKind::Quote { operand } => {
                for var in free_variables(operand) {
                    let info = self.reference(&var)?;
                    info.quoted = true;
                }
            }

            ExprKind::RuntimeVariables { vars } => {
                for var in vars {
                    let info = self.reference(var)?;
                    info.runtime_ref = true;
                }
            }

            ExprKind::Loop {
                body,
                break_label,
                continue_label,
            } => {
                if let Some(l) = break_label {
                    self.define_label(l)?;
                }
                if let Some(l) = continue_label {
                    self.define_label(l)?;
                }
                self.walk(body, d)?;
            }

            ExprKind::Label { target, default } => {
                self.define_label(target)?;
                if let Some(e) = default {
                    self.walk(e, d)?;
                }
            }

            ExprKind::Goto { target, value, .. } => {
                self.gotos.push((self.current_lambda(), target.clone()));
                if let Some(e) = value {
                    self.walk(e, d)?;
                }
            }

            ExprKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                self.walk(body, d)?;
                for h in handlers {
                    self.scopes.push(FxHashSet::default());
                    if let Some(v) = &h.var {
                        self.declare(v, None)?;
                    }
                    if let Some(filter) = &h.filter {
                        self.walk(filter, d)?;
                    }
                    self.walk(&h.body, d)?;
                    self.scopes.pop();
                }
                if let Some(e) = finally {
                    self.walk(e, d)?;
                }
                if let Some(e) = fault {
                    self.walk(e, d)?;
                }
            }

            ExprKind::Switch {
                value,
                cases,
                default,
            } => {
                self.walk(value, d)?;
                for c in cases {
                    self.walk(&c.body, d)?;
                }
                if let Some(e) = default {
                    self.walk(e, d)?;
                }
            }

            ExprKind::Call { args, .. }
            | ExprKind::New { args, .. }
            | ExprKind::Dynamic { args, .. } => {
                for a in args {
                    self.walk(a, d)?;
                }
            }
            ExprKind::NewArray { items } => {
                for item in items {
                    self.walk(item, d)?;
                }
            }
            ExprKind::Index { array, index } => {
                self.walk(array, d)?;
                self.walk(index, d)?;
            }
            ExprKind::Assign { target, value } => {
                self.walk(target, d)?;
                self.walk(value, d)?;
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk(lhs, d)?;
                self.walk(rhs, d)?;
            }
            ExprKind::Unary { operand, .. } => self.walk(operand, d)?,
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.walk(test, d)?;
                self.walk(if_true, d)?;
                self.walk(if_false, d)?;
            }
            ExprKind::Throw { value } => {
                if let Some(e) = value {
                    self.walk(e, d)?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Pass 2: classification
// ============================================================================

/// Analyze a top-level lambda. The result is a pure function of the
/// tree: re-running it yields identical classifications.
pub(crate) fn analyze(root: &ExprRef) -> Result<Analysis, CompileError> {
    let node = root
        .as_lambda()
        .ok_or_else(|| CompileError::invalid("expected a lambda at the top level"))?;

    let mut collector = Collector {
        scopes: Vec::new(),
        vars: FxHashMap::default(),
        order: Vec::new(),
        lambda_stack: vec![root.id()],
        lambda_parent: FxHashMap::default(),
        labels: FxHashMap::default(),
        gotos: Vec::new(),
    };
    collector.lambda_parent.insert(root.id(), None);
    collector.scopes.push(FxHashSet::default());
    for (i, p) in node.params.iter().enumerate() {
        collector.declare(p, Some(i as u16))?;
    }
    collector.walk(&node.body, 0)?;

    // Every goto must target a label of its own lambda.
    for (lambda, label) in &collector.gotos {
        let defined = collector
            .labels
            .get(lambda)
            .map_or(false, |set| set.contains(&label.id()));
        if !defined {
            return Err(CompileError::invalid(format!(
                "goto with no matching label '{}'",
                label.name()
            )));
        }
    }

    let mut analysis = Analysis {
        var_storage: FxHashMap::default(),
        var_home: FxHashMap::default(),
        lambdas: FxHashMap::default(),
    };
    for (id, parent) in &collector.lambda_parent {
        analysis.lambdas.insert(
            *id,
            LambdaInfo {
                parent: *parent,
                ..LambdaInfo::default()
            },
        );
    }

    // Classify in declaration order so closure layouts are deterministic.
    for var_id in &collector.order {
        let info = &collector.vars[var_id];
        let captured = info.ref_lambdas.iter().any(|l| *l != info.home_lambda);
        let storage = if info.quoted {
            if captured || info.runtime_ref {
                VarStorage::HoistedBoxed { index: 0 }
            } else {
                VarStorage::Boxed
            }
        } else if captured || info.runtime_ref {
            VarStorage::Hoisted { index: 0 }
        } else if let Some(i) = info.param_index {
            VarStorage::Argument(i)
        } else {
            VarStorage::Local
        };
        if matches!(storage, VarStorage::Hoisted { .. } | VarStorage::HoistedBoxed { .. }) {
            analysis
                .lambdas
                .get_mut(&info.home_lambda)
                .expect("home lambda is known")
                .hoisted
                .push(info.var.clone());
        }
        analysis.var_storage.insert(*var_id, storage);
        analysis.var_home.insert(*var_id, info.home_lambda);

        // Mark every lambda between the use and the declaration as
        // needing the outer environment.
        for used_in in &info.ref_lambdas {
            let mut cursor = *used_in;
            while cursor != info.home_lambda {
                let entry = analysis
                    .lambdas
                    .get_mut(&cursor)
                    .expect("reference lambdas are known");
                entry.uses_outer = true;
                cursor = entry.parent.expect("declaration encloses every use");
            }
        }
    }

    // Closure layout: needs_closure first, then parent links and indices.
    let lambda_ids: Vec<NodeId> = analysis.lambdas.keys().copied().collect();
    for id in &lambda_ids {
        let info = analysis.lambdas.get_mut(id).expect("listed above");
        info.needs_closure = !info.hoisted.is_empty();
    }
    for id in &lambda_ids {
        let has_record = analysis.lambdas[id].needs_closure;
        let has_parent_field = has_record && !analysis.record_chain(*id).is_empty();
        let info = analysis.lambdas.get_mut(id).expect("listed above");
        info.has_parent_field = has_parent_field;
        info.record_arity = info.hoisted.len() + usize::from(has_parent_field);
        let offset = u16::from(has_parent_field);
        let updates: Vec<(VarId, u16)> = info
            .hoisted
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id(), i as u16 + offset))
            .collect();
        for (var_id, index) in updates {
            let storage = analysis
                .var_storage
                .get_mut(&var_id)
                .expect("hoisted variables are classified");
            *storage = match storage {
                VarStorage::Hoisted { .. } => VarStorage::Hoisted { index },
                VarStorage::HoistedBoxed { .. } => VarStorage::HoistedBoxed { index },
                ref other => **other,
            };
        }
    }

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Expr, ExprRef, Type, Var};

    fn lambda1(param: &VarRef, body: ExprRef) -> ExprRef {
        Expr::lambda(None, vec![param.clone()], body.ty().clone(), body)
    }

    #[test]
    fn test_plain_parameter_stays_argument() {
        let x = Var::new("x", Type::Int);
        let lam = lambda1(&x, Expr::variable(&x));
        let analysis = analyze(&lam).unwrap();
        assert_eq!(analysis.storage(x.id()), Some(VarStorage::Argument(0)));
        assert!(!analysis.lambdas[&lam.id()].needs_closure);
    }

    #[test]
    fn test_block_variable_is_local() {
        let x = Var::new("x", Type::Int);
        let v = Var::new("v", Type::Int);
        let body = Expr::block(
            vec![v.clone()],
            vec![
                Expr::assign(Expr::variable(&v), Expr::variable(&x)),
                Expr::variable(&v),
            ],
        );
        let lam = lambda1(&x, body);
        let analysis = analyze(&lam).unwrap();
        assert_eq!(analysis.storage(v.id()), Some(VarStorage::Local));
    }

    #[test]
    fn test_captured_parameter_is_hoisted() {
        let x = Var::new("x", Type::Int);
        let y = Var::new("y", Type::Int);
        let inner = Expr::lambda(
            None,
            vec![y.clone()],
            Type::Int,
            Expr::add(Expr::variable(&x), Expr::variable(&y)),
        );
        let lam = lambda1(&x, inner);
        let analysis = analyze(&lam).unwrap();
        assert_eq!(
            analysis.storage(x.id()),
            Some(VarStorage::Hoisted { index: 0 })
        );
        let info = &analysis.lambdas[&lam.id()];
        assert!(info.needs_closure);
        assert!(!info.has_parent_field);
        assert_eq!(info.record_arity, 1);
        assert_eq!(analysis.storage(y.id()), Some(VarStorage::Argument(0)));
    }

    #[test]
    fn test_record_arity_is_exact() {
        // Three locals, two captured: the record holds exactly two.
        let a = Var::new("a", Type::Int);
        let b = Var::new("b", Type::Int);
        let c = Var::new("c", Type::Int);
        let inner = Expr::lambda(
            None,
            vec![],
            Type::Int,
            Expr::add(Expr::variable(&a), Expr::variable(&c)),
        );
        let body = Expr::block(
            vec![a.clone(), b.clone(), c.clone()],
            vec![Expr::variable(&b), inner, Expr::int(0)],
        );
        let lam = Expr::lambda(None, vec![], Type::Int, body);
        let analysis = analyze(&lam).unwrap();
        let info = &analysis.lambdas[&lam.id()];
        assert_eq!(info.record_arity, 2);
        assert_eq!(analysis.storage(b.id()), Some(VarStorage::Local));
    }

    #[test]
    fn test_quoted_variable_is_boxed() {
        let x = Var::new("x", Type::Int);
        let lam = lambda1(
            &x,
            Expr::block(vec![], vec![Expr::quote(Expr::variable(&x)), Expr::int(0)]),
        );
        let analysis = analyze(&lam).unwrap();
        assert_eq!(analysis.storage(x.id()), Some(VarStorage::Boxed));
    }

    #[test]
    fn test_quoted_and_captured_is_hoisted_boxed() {
        let x = Var::new("x", Type::Int);
        let inner = Expr::lambda(None, vec![], Type::Tree, Expr::quote(Expr::variable(&x)));
        let lam = lambda1(&x, inner);
        let analysis = analyze(&lam).unwrap();
        assert_eq!(
            analysis.storage(x.id()),
            Some(VarStorage::HoistedBoxed { index: 0 })
        );
    }

    #[test]
    fn test_runtime_referenced_is_hoisted() {
        let x = Var::new("x", Type::Int);
        let lam = lambda1(&x, Expr::runtime_variables(vec![x.clone()]));
        let analysis = analyze(&lam).unwrap();
        assert_eq!(
            analysis.storage(x.id()),
            Some(VarStorage::Hoisted { index: 0 })
        );
    }

    #[test]
    fn test_parent_back_reference_occupies_field_zero() {
        // outer captures x in a record; middle captures y AND reads x, so
        // middle's record links to outer's at field 0.
        let x = Var::new("x", Type::Int);
        let y = Var::new("y", Type::Int);
        let z = Var::new("z", Type::Int);
        let innermost = Expr::lambda(
            None,
            vec![z.clone()],
            Type::Int,
            Expr::add(
                Expr::add(Expr::variable(&x), Expr::variable(&y)),
                Expr::variable(&z),
            ),
        );
        let middle = Expr::lambda(None, vec![y.clone()], innermost.ty().clone(), innermost);
        let middle_id = middle.id();
        let outer = Expr::lambda(None, vec![x.clone()], middle.ty().clone(), middle);
        let analysis = analyze(&outer).unwrap();
        let mid = &analysis.lambdas[&middle_id];
        assert!(mid.has_parent_field);
        assert_eq!(mid.record_arity, 2);
        assert_eq!(
            analysis.storage(y.id()),
            Some(VarStorage::Hoisted { index: 1 })
        );
        assert!(mid.uses_outer);
    }

    #[test]
    fn test_undeclared_variable_is_rejected() {
        let x = Var::new("x", Type::Int);
        let lam = Expr::lambda(None, vec![], Type::Int, Expr::variable(&x));
        let err = analyze(&lam).unwrap_err();
        assert!(err.to_string().contains("undeclared variable 'x'"));
    }

    #[test]
    fn test_catch_filter_with_undeclared_variable_is_rejected() {
        let flag = Var::new("flag", Type::Bool);
        let body = Expr::try_catch(
            Expr::int(1),
            vec![crate::tree::CatchClause::new(None, Expr::int(2))
                .with_filter(Expr::variable(&flag))],
        );
        let lam = Expr::lambda(None, vec![], Type::Int, body);
        let err = analyze(&lam).unwrap_err();
        assert_eq!(err.kind, crate::compiler::CompileErrorKind::InvalidOperation);
    }

    #[test]
    fn test_goto_without_label_is_rejected() {
        let target = crate::tree::LabelTarget::new("missing", Type::Void);
        let lam = Expr::lambda(None, vec![], Type::Void, Expr::goto(target, None));
        let err = analyze(&lam).unwrap_err();
        assert!(err.to_string().contains("no matching label"));
    }

    #[test]
    fn test_goto_across_lambda_boundary_is_rejected() {
        let target = crate::tree::LabelTarget::new("outer", Type::Void);
        let inner = Expr::lambda(None, vec![], Type::Void, Expr::goto(target.clone(), None));
        let body = Expr::block(
            vec![],
            vec![Expr::label(target, None), inner, Expr::int(0)],
        );
        let lam = Expr::lambda(None, vec![], Type::Int, body);
        assert!(analyze(&lam).is_err());
    }

    #[test]
    fn test_variable_in_two_scopes_is_rejected() {
        let x = Var::new("x", Type::Int);
        let body = Expr::block(
            vec![],
            vec![
                Expr::block(vec![x.clone()], vec![Expr::variable(&x)]),
                Expr::block(vec![x.clone()], vec![Expr::variable(&x)]),
            ],
        );
        let lam = Expr::lambda(None, vec![], Type::Int, body);
        assert!(analyze(&lam).is_err());
    }

    #[test]
    fn test_classification_is_idempotent() {
        let x = Var::new("x", Type::Int);
        let y = Var::new("y", Type::Int);
        let inner = Expr::lambda(
            None,
            vec![y.clone()],
            Type::Int,
            Expr::add(Expr::variable(&x), Expr::variable(&y)),
        );
        let lam = lambda1(&x, inner);
        let first = analyze(&lam).unwrap();
        let second = analyze(&lam).unwrap();
        assert_eq!(first.var_storage, second.var_storage);
        assert_eq!(first.var_home, second.var_home);
    }

    #[test]
    fn test_inlined_invoke_parameter_is_local_to_enclosing_lambda() {
        let x = Var::new("x", Type::Int);
        let inner = Expr::lambda(None, vec![x.clone()], Type::Int, Expr::variable(&x));
        let body = Expr::invoke(inner, vec![Expr::int(3)]);
        let lam = Expr::lambda(None, vec![], Type::Int, body);
        let analysis = analyze(&lam).unwrap();
        assert_eq!(analysis.storage(x.id()), Some(VarStorage::Local));
        assert_eq!(analysis.var_home[&x.id()], lam.id());
        // No nested lambda was registered for the inlined target.
        assert_eq!(analysis.lambdas.len(), 1);
    }
}
