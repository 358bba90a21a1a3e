//! Runtime helpers called from emitted code through fixed method
//! handles: quote reification, runtime-variables marshalling, dynamic
//! call sites, and string-switch dispatch tables.

use std::fmt;
use std::sync::Arc;

use im::HashSet as ImHashSet;
use once_cell::sync::{Lazy, OnceCell};
use rustc_hash::FxHashMap;

use crate::tree::{
    CatchClause, DynamicBinder, Expr, ExprKind, ExprRef, LambdaNode, SwitchCase, VarId, VarRef,
};

use super::records::RuntimeVariables;
use super::{Method, MethodRef, RuntimeError, Value};

// ============================================================================
// Quote
// ============================================================================

/// Compile-time metadata attached to a quote: the quoted tree's free
/// variables, in cell-environment field order.
#[derive(Debug)]
pub struct QuoteMeta {
    pub vars: Vec<VarRef>,
}

/// Reify a quoted tree: produce a copy with every free-variable
/// reference re-bound to the shared cell held by the cell-environment
/// record. `args`: the quoted tree, the [`QuoteMeta`] object, and the
/// record whose field `i` holds the cell for `meta.vars[i]`.
pub fn quote(args: &[Value]) -> Result<Value, RuntimeError> {
    let tree = args[0]
        .as_tree()
        .ok_or_else(|| RuntimeError::type_error("tree", &args[0]))?;
    let meta = args[1]
        .obj_as::<QuoteMeta>()
        .ok_or_else(|| RuntimeError::type_error("quote metadata", &args[1]))?;
    let env = args[2]
        .as_record()
        .ok_or_else(|| RuntimeError::type_error("record", &args[2]))?;

    let mut cells = FxHashMap::default();
    for (i, var) in meta.vars.iter().enumerate() {
        match env.get(i)? {
            Value::Cell(cell) => {
                cells.insert(var.id(), cell);
            }
            other => return Err(RuntimeError::type_error("cell", &other)),
        }
    }
    let rebound = rebind(tree, &cells, &ImHashSet::new());
    Ok(Value::Tree(rebound))
}

/// Rewrite free references to the given variables into cell references.
/// Declarations shadow: a nested scope re-declaring a variable keeps its
/// own binding untouched.
fn rebind(
    expr: &ExprRef,
    cells: &FxHashMap<VarId, Arc<super::ValueCell>>,
    shadowed: &ImHashSet<VarId>,
) -> ExprRef {
    let each = |e: &ExprRef| rebind(e, cells, shadowed);
    let kind = match expr.kind() {
        ExprKind::Variable(var) => {
            if !shadowed.contains(&var.id()) {
                if let Some(cell) = cells.get(&var.id()) {
                    return Expr::cell_ref(cell.clone(), var.ty().clone());
                }
            }
            ExprKind::Variable(var.clone())
        }
        ExprKind::Constant(v) => ExprKind::Constant(v.clone()),
        ExprKind::CellRef { cell } => ExprKind::CellRef { cell: cell.clone() },
        ExprKind::Block { vars, exprs } => {
            let mut inner = shadowed.clone();
            for v in vars {
                inner.insert(v.id());
            }
            ExprKind::Block {
                vars: vars.clone(),
                exprs: exprs.iter().map(|e| rebind(e, cells, &inner)).collect(),
            }
        }
        ExprKind::Lambda(node) => {
            let mut inner = shadowed.clone();
            for p in &node.params {
                inner.insert(p.id());
            }
            ExprKind::Lambda(Arc::new(LambdaNode {
                name: node.name.clone(),
                params: node.params.clone(),
                body: rebind(&node.body, cells, &inner),
                ret: node.ret.clone(),
                sig: node.sig.clone(),
            }))
        }
        ExprKind::Invoke { target, args } => ExprKind::Invoke {
            target: each(target),
            args: args.iter().map(each).collect(),
        },
        ExprKind::Call { method, args } => ExprKind::Call {
            method: method.clone(),
            args: args.iter().map(each).collect(),
        },
        ExprKind::New { ctor, args } => ExprKind::New {
            ctor: ctor.clone(),
            args: args.iter().map(each).collect(),
        },
        ExprKind::NewArray { items } => ExprKind::NewArray {
            items: items.iter().map(each).collect(),
        },
        ExprKind::Index { array, index } => ExprKind::Index {
            array: each(array),
            index: each(index),
        },
        ExprKind::Assign { target, value } => ExprKind::Assign {
            target: each(target),
            value: each(value),
        },
        ExprKind::Binary {
            op,
            checked,
            lhs,
            rhs,
        } => ExprKind::Binary {
            op: *op,
            checked: *checked,
            lhs: each(lhs),
            rhs: each(rhs),
        },
        ExprKind::Unary {
            op,
            checked,
            operand,
        } => ExprKind::Unary {
            op: *op,
            checked: *checked,
            operand: each(operand),
        },
        ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } => ExprKind::Conditional {
            test: each(test),
            if_true: each(if_true),
            if_false: each(if_false),
        },
        ExprKind::Loop {
            body,
            break_label,
            continue_label,
        } => ExprKind::Loop {
            body: each(body),
            break_label: break_label.clone(),
            continue_label: continue_label.clone(),
        },
        ExprKind::Label { target, default } => ExprKind::Label {
            target: target.clone(),
            default: default.as_ref().map(each),
        },
        ExprKind::Goto {
            kind,
            target,
            value,
        } => ExprKind::Goto {
            kind: *kind,
            target: target.clone(),
            value: value.as_ref().map(each),
        },
        ExprKind::Try {
            body,
            handlers,
            finally,
            fault,
        } => ExprKind::Try {
            body: each(body),
            handlers: handlers
                .iter()
                .map(|h| {
                    let mut inner = shadowed.clone();
                    if let Some(v) = &h.var {
                        inner.insert(v.id());
                    }
                    let mut clause = CatchClause::new(
                        h.var.clone(),
                        rebind(&h.body, cells, &inner),
                    );
                    if let Some(filter) = &h.filter {
                        clause = clause.with_filter(rebind(filter, cells, &inner));
                    }
                    clause
                })
                .collect(),
            finally: finally.as_ref().map(each),
            fault: fault.as_ref().map(each),
        },
        ExprKind::Switch {
            value,
            cases,
            default,
        } => ExprKind::Switch {
            value: each(value),
            cases: cases
                .iter()
                .map(|c| SwitchCase::new(c.values.clone(), each(&c.body)))
                .collect(),
            default: default.as_ref().map(each),
        },
        ExprKind::Throw { value } => ExprKind::Throw {
            value: value.as_ref().map(each),
        },
        ExprKind::Quote { operand } => ExprKind::Quote {
            operand: each(operand),
        },
        ExprKind::RuntimeVariables { vars } => ExprKind::RuntimeVariables { vars: vars.clone() },
        ExprKind::Dynamic { binder, args } => ExprKind::Dynamic {
            binder: binder.clone(),
            args: args.iter().map(each).collect(),
        },
    };
    Expr::rebuild(expr.ty().clone(), kind)
}

// ============================================================================
// Runtime variables
// ============================================================================

/// A flat view over hoisted variables reached through the closure chain.
/// Each entry packs (parent-depth, field-index); the chain is walked on
/// every access so the view stays live.
struct MarshalledVariables {
    base: Arc<dyn RuntimeVariables>,
    table: Vec<(u32, u32)>,
}

impl MarshalledVariables {
    fn resolve(&self, index: usize) -> Result<(Arc<dyn RuntimeVariables>, usize), RuntimeError> {
        let (depth, field) = *self.table.get(index).ok_or(RuntimeError::IndexOutOfRange {
            index: index as i64,
            len: self.table.len(),
        })?;
        let mut record = self.base.clone();
        for _ in 0..depth {
            // Field 0 of a linked record is the parent back-reference.
            record = match record.get(0)? {
                Value::Record(parent) => parent,
                other => return Err(RuntimeError::type_error("record", &other)),
            };
        }
        Ok((record, field as usize))
    }
}

impl RuntimeVariables for MarshalledVariables {
    fn len(&self) -> usize {
        self.table.len()
    }

    fn get(&self, index: usize) -> Result<Value, RuntimeError> {
        let (record, field) = self.resolve(index)?;
        match record.get(field)? {
            Value::Cell(cell) => Ok(cell.get()),
            plain => Ok(plain),
        }
    }

    fn set(&self, index: usize, value: Value) -> Result<(), RuntimeError> {
        let (record, field) = self.resolve(index)?;
        match record.get(field)? {
            Value::Cell(cell) => {
                cell.set(value);
                Ok(())
            }
            _ => record.set(field, value),
        }
    }

    fn field_name(&self, _index: usize) -> Option<&str> {
        None
    }
}

impl fmt::Debug for MarshalledVariables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarshalledVariables[{}]", self.table.len())
    }
}

/// Build a runtime-variables handle from a closure record and a packed
/// `(depth << 32 | index)` table. `args`: the base record and the table.
pub fn create_runtime_variables(args: &[Value]) -> Result<Value, RuntimeError> {
    let base = args[0]
        .as_record()
        .ok_or_else(|| RuntimeError::type_error("record", &args[0]))?
        .clone();
    let table_array = args[1]
        .as_array()
        .ok_or_else(|| RuntimeError::type_error("array", &args[1]))?;
    let table = table_array
        .read()
        .unwrap()
        .iter()
        .map(|v| {
            let packed = v
                .to_int()
                .ok_or_else(|| RuntimeError::type_error("int", v))?;
            Ok((
                ((packed as u64) >> 32) as u32,
                (packed as u64 & 0xffff_ffff) as u32,
            ))
        })
        .collect::<Result<Vec<_>, RuntimeError>>()?;
    Ok(Value::Record(Arc::new(MarshalledVariables { base, table })))
}

/// Concatenation of two runtime-variables handles: indices below
/// `first.len()` address the first handle, the rest the second.
struct MergedVariables {
    first: Arc<dyn RuntimeVariables>,
    second: Arc<dyn RuntimeVariables>,
}

impl RuntimeVariables for MergedVariables {
    fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    fn get(&self, index: usize) -> Result<Value, RuntimeError> {
        if index < self.first.len() {
            self.first.get(index)
        } else {
            self.second.get(index - self.first.len())
        }
    }

    fn set(&self, index: usize, value: Value) -> Result<(), RuntimeError> {
        if index < self.first.len() {
            self.first.set(index, value)
        } else {
            self.second.set(index - self.first.len(), value)
        }
    }

    fn field_name(&self, _index: usize) -> Option<&str> {
        None
    }
}

impl fmt::Debug for MergedVariables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergedVariables[{}]", self.len())
    }
}

pub fn merge_runtime_variables(args: &[Value]) -> Result<Value, RuntimeError> {
    let first = args[0]
        .as_record()
        .ok_or_else(|| RuntimeError::type_error("record", &args[0]))?
        .clone();
    let second = args[1]
        .as_record()
        .ok_or_else(|| RuntimeError::type_error("record", &args[1]))?
        .clone();
    Ok(Value::Record(Arc::new(MergedVariables { first, second })))
}

// ============================================================================
// Dynamic call sites
// ============================================================================

/// A late-bound call site. Created once per `Dynamic` node at constant
/// allocation time and shared by every run of the generated code.
pub struct CallSite {
    binder: Arc<dyn DynamicBinder>,
}

impl CallSite {
    pub fn new(binder: Arc<dyn DynamicBinder>) -> Arc<CallSite> {
        Arc::new(CallSite { binder })
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, RuntimeError> {
        self.binder.bind(args)
    }

    pub fn binder_name(&self) -> &str {
        self.binder.name()
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallSite({})", self.binder.name())
    }
}

/// Dispatch through a call site. `args`: the site followed by the
/// operand values.
pub fn dynamic_invoke(args: &[Value]) -> Result<Value, RuntimeError> {
    let site = args[0]
        .obj_as::<CallSite>()
        .ok_or_else(|| RuntimeError::type_error("call site", &args[0]))?;
    site.invoke(&args[1..])
}

// ============================================================================
// String switch dispatch
// ============================================================================

/// Case-string lookup table for hash-dispatched string switches. The
/// map is built lazily on first use and shared by every run.
pub struct SwitchTable {
    cases: Vec<Arc<str>>,
    map: OnceCell<FxHashMap<Arc<str>, i64>>,
}

impl SwitchTable {
    pub fn new(cases: Vec<Arc<str>>) -> Arc<SwitchTable> {
        Arc::new(SwitchTable {
            cases,
            map: OnceCell::new(),
        })
    }

    /// Case index for a scrutinee string, or -1.
    pub fn lookup(&self, key: &str) -> i64 {
        let map = self.map.get_or_init(|| {
            self.cases
                .iter()
                .enumerate()
                .map(|(i, s)| (s.clone(), i as i64))
                .collect()
        });
        map.get(key).copied().unwrap_or(-1)
    }
}

impl fmt::Debug for SwitchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwitchTable[{}]", self.cases.len())
    }
}

/// `args`: the switch table and the scrutinee string.
pub fn switch_index(args: &[Value]) -> Result<Value, RuntimeError> {
    let table = args[0]
        .obj_as::<SwitchTable>()
        .ok_or_else(|| RuntimeError::type_error("switch table", &args[0]))?;
    match &args[1] {
        Value::Str(s) => Ok(Value::Int(table.lookup(s))),
        Value::Nil => Ok(Value::Int(-1)),
        other => Err(RuntimeError::type_error("str", other)),
    }
}

// ============================================================================
// Fixed method handles
// ============================================================================

pub static QUOTE: Lazy<MethodRef> = Lazy::new(|| Method::new("runtime.quote", Some(3), quote));

pub static CREATE_RUNTIME_VARIABLES: Lazy<MethodRef> = Lazy::new(|| {
    Method::new(
        "runtime.create_variables",
        Some(2),
        create_runtime_variables,
    )
});

pub static MERGE_RUNTIME_VARIABLES: Lazy<MethodRef> =
    Lazy::new(|| Method::new("runtime.merge_variables", Some(2), merge_runtime_variables));

pub static DYNAMIC_INVOKE: Lazy<MethodRef> =
    Lazy::new(|| Method::new("runtime.dynamic_invoke", None, dynamic_invoke));

pub static SWITCH_INDEX: Lazy<MethodRef> =
    Lazy::new(|| Method::new("runtime.switch_index", Some(2), switch_index));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::records::new_record;
    use crate::runtime::ValueCell;
    use crate::tree::{Type, Var};

    #[test]
    fn test_switch_table_lookup() {
        let table = SwitchTable::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(table.lookup("b"), 1);
        assert_eq!(table.lookup("missing"), -1);
    }

    #[test]
    fn test_quote_rebinds_free_variable() {
        let x = Var::new("x", Type::Int);
        let tree = Expr::add(Expr::variable(&x), Expr::int(1));

        let cell = ValueCell::new(Value::Int(41));
        let env = new_record(1);
        env.set(0, Value::Cell(cell.clone())).unwrap();
        let meta = QuoteMeta {
            vars: vec![x.clone()],
        };

        let out = quote(&[
            Value::Tree(tree),
            Value::obj(meta),
            Value::Record(env),
        ])
        .unwrap();
        let rebound = out.as_tree().unwrap();
        match rebound.kind() {
            ExprKind::Binary { lhs, .. } => {
                assert!(matches!(lhs.kind(), ExprKind::CellRef { .. }));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_quote_respects_shadowing() {
        let x = Var::new("x", Type::Int);
        // (block [x] x) re-declares x; the inner reference must survive.
        let tree = Expr::block(vec![x.clone()], vec![Expr::variable(&x)]);

        let env = new_record(1);
        env.set(0, Value::Cell(ValueCell::new(Value::Int(0)))).unwrap();
        let meta = QuoteMeta {
            vars: vec![x.clone()],
        };
        let out = quote(&[Value::Tree(tree), Value::obj(meta), Value::Record(env)]).unwrap();
        let rebound = out.as_tree().unwrap();
        match rebound.kind() {
            ExprKind::Block { exprs, .. } => {
                assert!(matches!(exprs[0].kind(), ExprKind::Variable(_)));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_marshalled_variables_walk_chain() {
        // parent record holds y at field 1; child record links to it.
        let parent = new_record(2);
        parent.set(1, Value::Int(10)).unwrap();
        let child = new_record(2);
        child.set(0, Value::Record(parent.clone())).unwrap();
        child.set(1, Value::Int(20)).unwrap();

        // entries: (depth 0, field 1) then (depth 1, field 1)
        let table = Value::array(vec![Value::Int(1), Value::Int((1i64 << 32) | 1)]);
        let vars = create_runtime_variables(&[Value::Record(child), table]).unwrap();
        let handle = vars.as_record().unwrap();
        assert_eq!(handle.get(0).unwrap().to_int(), Some(20));
        assert_eq!(handle.get(1).unwrap().to_int(), Some(10));

        handle.set(1, Value::Int(11)).unwrap();
        assert_eq!(parent.get(1).unwrap().to_int(), Some(11));
    }

    #[test]
    fn test_marshalled_variables_read_through_cells() {
        let rec = new_record(1);
        let cell = ValueCell::new(Value::Int(5));
        rec.set(0, Value::Cell(cell.clone())).unwrap();
        let table = Value::array(vec![Value::Int(0)]);
        let vars = create_runtime_variables(&[Value::Record(rec), table]).unwrap();
        let handle = vars.as_record().unwrap();
        assert_eq!(handle.get(0).unwrap().to_int(), Some(5));
        handle.set(0, Value::Int(9)).unwrap();
        assert_eq!(cell.get().to_int(), Some(9));
    }

    #[test]
    fn test_merged_variables_concatenate() {
        let a = new_record(1);
        a.set(0, Value::Int(1)).unwrap();
        let b = new_record(2);
        b.set(0, Value::Int(2)).unwrap();
        b.set(1, Value::Int(3)).unwrap();
        let merged =
            merge_runtime_variables(&[Value::Record(a), Value::Record(b)]).unwrap();
        let handle = merged.as_record().unwrap();
        assert_eq!(handle.len(), 3);
        assert_eq!(handle.get(2).unwrap().to_int(), Some(3));
    }
}
