//! The lambda emitter: walks a bound lambda body and produces stack
//! machine code, one method per non-inlined lambda.
//!
//! The prologue materializes boxed parameter cells and the closure
//! record, then caches hot constants into locals. The body walk emits
//! every node kind with strict left-to-right evaluation order, reusing
//! scratch locals through the builder's freelist. Labelled jumps that
//! cross exception regions go through `leave` and carry their value in
//! a dedicated local; a prescan decides which labels need one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::emit::{CompiledMethod, Inst, Label, MethodBuilder};
use crate::runtime::ops::{
    QuoteMeta, SwitchTable, CREATE_RUNTIME_VARIABLES, DYNAMIC_INVOKE, QUOTE, SWITCH_INDEX,
};
use crate::runtime::{ConstantsRecord, Value};
use crate::tree::{
    BinaryOp, CatchClause, ExprKind, ExprRef, LabelRef, LambdaRef, NodeId, Type, UnaryOp, VarId,
    VarRef,
};

use super::binder::{Analysis, VarStorage};
use super::constants::{Aux, BoundConstants, ConstantPlan};
use super::error::CompileError;
use super::free_vars::free_variables;
use super::stack_guard::{with_guard, DEFAULT_GUARD_DEPTH};
use super::CompilerOptions;

static METHOD_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Compile one lambda (and, recursively, its non-inlined nested
/// lambdas) into a baked method plus its frozen constants record.
pub(crate) fn compile_lambda(
    plan: &mut ConstantPlan,
    analysis: &Analysis,
    options: &CompilerOptions,
    lambda_expr: &ExprRef,
) -> Result<(Arc<CompiledMethod>, Arc<ConstantsRecord>), CompileError> {
    let node = lambda_expr
        .as_lambda()
        .ok_or_else(|| CompileError::internal("compile_lambda expects a lambda node"))?
        .clone();
    let consts = plan
        .per_lambda
        .remove(&lambda_expr.id())
        .unwrap_or_default();
    let name = node.name.clone().unwrap_or_else(|| {
        format!("lambda_{}", METHOD_COUNTER.fetch_add(1, Ordering::Relaxed))
    });

    let mut prescan = Prescan::new();
    prescan.walk(&node.body)?;

    let fc = FnCompiler {
        plan,
        analysis,
        options,
        lambda_id: lambda_expr.id(),
        node: node.clone(),
        b: MethodBuilder::new(name, node.params.len()),
        consts,
        scopes: Vec::new(),
        closure_local: None,
        outer_chain: analysis.record_chain(lambda_expr.id()),
        const_cache: FxHashMap::default(),
        labels: FxHashMap::default(),
        label_meta: prescan.labels,
        region_ids: prescan.region_ids,
        region_path: Vec::new(),
    };
    fc.compile()
}

// ============================================================================
// Prescan: label definition sites and region paths
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Try,
    Filter,
    Catch,
    Finally,
    Fault,
}

struct LabelMeta {
    def_path: Vec<(u32, Section)>,
    /// Some goto reaches this label from a different region path, so a
    /// non-void label routes its value through a dedicated local.
    cross: bool,
}

struct Prescan {
    counter: u32,
    path: Vec<(u32, Section)>,
    labels: FxHashMap<u64, LabelMeta>,
    gotos: Vec<(u64, Vec<(u32, Section)>)>,
    region_ids: FxHashMap<NodeId, u32>,
}

impl Prescan {
    fn new() -> Prescan {
        Prescan {
            counter: 0,
            path: Vec::new(),
            labels: FxHashMap::default(),
            gotos: Vec::new(),
            region_ids: FxHashMap::default(),
        }
    }

    fn define(&mut self, label: &LabelRef) {
        self.labels.insert(
            label.id(),
            LabelMeta {
                def_path: self.path.clone(),
                cross: false,
            },
        );
    }

    fn walk(&mut self, expr: &ExprRef) -> Result<(), CompileError> {
        self.walk_expr(expr)?;
        // Resolve goto/label pairs and validate region crossings.
        let mut gotos = std::mem::take(&mut self.gotos);
        for (label_id, goto_path) in gotos.drain(..) {
            let meta = self.labels.get_mut(&label_id).ok_or_else(|| {
                CompileError::internal("goto target missing from prescan")
            })?;
            if goto_path == meta.def_path {
                continue;
            }
            let common = meta.def_path.len();
            if goto_path.len() < common || goto_path[..common]
                .iter()
                .map(|(id, _)| id)
                .ne(meta.def_path.iter().map(|(id, _)| id))
            {
                return Err(CompileError::invalid(
                    "goto may not jump into an exception region",
                ));
            }
            for ((_, goto_section), (_, def_section)) in
                goto_path[..common].iter().zip(meta.def_path.iter())
            {
                if goto_section != def_section {
                    return Err(CompileError::invalid(
                        "goto may not jump between sections of an exception region",
                    ));
                }
            }
            for (_, section) in &goto_path[common..] {
                if matches!(section, Section::Finally | Section::Fault | Section::Filter) {
                    return Err(CompileError::invalid(
                        "goto may not jump out of a finally, fault, or filter",
                    ));
                }
            }
            meta.cross = true;
        }
        Ok(())
    }

    fn walk_expr(&mut self, expr: &ExprRef) -> Result<(), CompileError> {
        match expr.kind() {
            // Nested lambdas get their own prescan when they compile,
            // and quoted trees stay data.
            ExprKind::Lambda(_) | ExprKind::Quote { .. } => Ok(()),

            ExprKind::Invoke { target, args } => {
                for a in args {
                    self.walk_expr(a)?;
                }
                if let ExprKind::Lambda(node) = target.kind() {
                    self.walk_expr(&node.body)?;
                } else {
                    self.walk_expr(target)?;
                }
                Ok(())
            }

            ExprKind::Loop {
                body,
                break_label,
                continue_label,
            } => {
                if let Some(l) = break_label {
                    self.define(l);
                }
                if let Some(l) = continue_label {
                    self.define(l);
                }
                self.walk_expr(body)
            }

            ExprKind::Label { target, default } => {
                self.define(target);
                if let Some(e) = default {
                    self.walk_expr(e)?;
                }
                Ok(())
            }

            ExprKind::Goto { target, value, .. } => {
                self.gotos.push((target.id(), self.path.clone()));
                if let Some(e) = value {
                    self.walk_expr(e)?;
                }
                Ok(())
            }

            ExprKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                let rid = self.counter;
                self.counter += 1;
                self.region_ids.insert(expr.id(), rid);
                self.path.push((rid, Section::Try));
                self.walk_expr(body)?;
                for h in handlers {
                    if let Some(filter) = &h.filter {
                        self.set_section(Section::Filter);
                        self.walk_expr(filter)?;
                    }
                    self.set_section(Section::Catch);
                    self.walk_expr(&h.body)?;
                }
                if let Some(e) = finally {
                    self.set_section(Section::Finally);
                    self.walk_expr(e)?;
                }
                if let Some(e) = fault {
                    self.set_section(Section::Fault);
                    self.walk_expr(e)?;
                }
                self.path.pop();
                Ok(())
            }

            ExprKind::Block { exprs, .. } => {
                for e in exprs {
                    self.walk_expr(e)?;
                }
                Ok(())
            }
            ExprKind::Call { args, .. }
            | ExprKind::New { args, .. }
            | ExprKind::Dynamic { args, .. } => {
                for a in args {
                    self.walk_expr(a)?;
                }
                Ok(())
            }
            ExprKind::NewArray { items } => {
                for item in items {
                    self.walk_expr(item)?;
                }
                Ok(())
            }
            ExprKind::Index { array, index } => {
                self.walk_expr(array)?;
                self.walk_expr(index)
            }
            ExprKind::Assign { target, value } => {
                self.walk_expr(target)?;
                self.walk_expr(value)
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs)?;
                self.walk_expr(rhs)
            }
            ExprKind::Unary { operand, .. } => self.walk_expr(operand),
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.walk_expr(test)?;
                self.walk_expr(if_true)?;
                self.walk_expr(if_false)
            }
            ExprKind::Switch {
                value,
                cases,
                default,
            } => {
                self.walk_expr(value)?;
                for c in cases {
                    self.walk_expr(&c.body)?;
                }
                if let Some(e) = default {
                    self.walk_expr(e)?;
                }
                Ok(())
            }
            ExprKind::Throw { value } => {
                if let Some(e) = value {
                    self.walk_expr(e)?;
                }
                Ok(())
            }
            ExprKind::Constant(_)
            | ExprKind::Variable(_)
            | ExprKind::CellRef { .. }
            | ExprKind::RuntimeVariables { .. } => Ok(()),
        }
    }

    fn set_section(&mut self, section: Section) {
        if let Some(top) = self.path.last_mut() {
            top.1 = section;
        }
    }
}

// ============================================================================
// Emit-time storage
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum EmitStorage {
    Arg(u16),
    Local(u16),
    /// Local holding the variable's shared cell.
    CellLocal(u16),
    /// Field of this lambda's closure record.
    Field { index: u16, boxed: bool },
}

struct ScopeFrame {
    vars: FxHashMap<VarId, EmitStorage>,
    borrowed: Vec<(Type, u16)>,
}

struct LabelState {
    label: Label,
    value_local: Option<u16>,
}

// ============================================================================
// FnCompiler
// ============================================================================

struct FnCompiler<'a> {
    plan: &'a mut ConstantPlan,
    analysis: &'a Analysis,
    options: &'a CompilerOptions,
    lambda_id: NodeId,
    node: LambdaRef,
    b: MethodBuilder,
    consts: BoundConstants,
    scopes: Vec<ScopeFrame>,
    closure_local: Option<u16>,
    /// Record-bearing enclosing lambdas, nearest first.
    outer_chain: Vec<NodeId>,
    const_cache: FxHashMap<usize, u16>,
    labels: FxHashMap<u64, LabelState>,
    label_meta: FxHashMap<u64, LabelMeta>,
    region_ids: FxHashMap<NodeId, u32>,
    region_path: Vec<(u32, Section)>,
}

impl<'a> FnCompiler<'a> {
    fn compile(mut self) -> Result<(Arc<CompiledMethod>, Arc<ConstantsRecord>), CompileError> {
        let node = self.node.clone();
        let info = &self.analysis.lambdas[&self.lambda_id];
        let needs_closure = info.needs_closure;
        let has_parent = info.has_parent_field;
        let record_arity = info.record_arity;

        // Parameter scope.
        let mut frame = ScopeFrame {
            vars: FxHashMap::default(),
            borrowed: Vec::new(),
        };
        for p in &node.params {
            let storage = self.storage_of(p)?;
            let emit_storage = self.bind_storage(&mut frame, p, storage);
            frame.vars.insert(p.id(), emit_storage);
        }
        self.scopes.push(frame);

        // Prologue: closure record, boxed parameter cells, cached
        // constants.
        if needs_closure {
            let cl = self.b.declare_local(Type::Variables);
            self.b.emit(Inst::NewRecord(record_arity as u16));
            if has_parent {
                self.b.emit(Inst::Dup);
                self.b.emit(Inst::LoadOuterScope);
                self.b.emit(Inst::StoreField(0));
            }
            for (i, p) in node.params.iter().enumerate() {
                if let Some(index) = self.storage_of(p)?.hoisted_index() {
                    let boxed = self.storage_of(p)?.is_boxed();
                    self.b.emit(Inst::Dup);
                    self.b.emit(Inst::LoadArg(i as u16));
                    if boxed {
                        self.b.emit(Inst::NewCell);
                    }
                    self.b.emit(Inst::StoreField(index));
                }
            }
            self.b.emit(Inst::StoreLocal(cl));
            self.closure_local = Some(cl);
        }
        for (i, p) in node.params.iter().enumerate() {
            if matches!(self.storage_of(p)?, VarStorage::Boxed) {
                let slot = match self.lookup_scope(p.id()) {
                    Some(EmitStorage::CellLocal(slot)) => slot,
                    _ => return Err(CompileError::internal("boxed parameter lost its cell")),
                };
                self.b.emit(Inst::LoadArg(i as u16));
                self.b.emit(Inst::NewCell);
                self.b.emit(Inst::StoreLocal(slot));
            }
        }
        let threshold = self.options.constant_cache_threshold;
        for slot in 0..self.consts.count() {
            if self.consts.ref_count(slot) >= threshold {
                let ty = self.consts.slot_type(slot).clone();
                let local = self.b.declare_local(ty);
                self.b.emit(Inst::LoadConst(slot as u16));
                self.b.emit(Inst::StoreLocal(local));
                self.const_cache.insert(slot, local);
            }
        }

        // Body.
        let ret = node.ret.clone();
        let body_ty = node.body.ty().clone();
        if !ret.is_void() && !body_ty.is_void() && !ret.accepts(&body_ty) {
            return Err(CompileError::invalid(format!(
                "lambda body type '{body_ty}' is not compatible with return type '{ret}'"
            ))
            .with_expression(&node.body));
        }
        let return_label = self.b.define_label();
        let return_local = if ret.is_void() {
            None
        } else {
            Some(self.b.declare_local(ret.clone()))
        };
        if ret.is_void() {
            self.emit_void(&node.body, 0)?;
        } else if body_ty.is_void() {
            self.emit_void(&node.body, 0)?;
            self.b.emit(Inst::Null);
            self.b.emit(Inst::StoreLocal(return_local.expect("non-void return")));
        } else {
            self.emit(&node.body, 0)?;
            self.b.emit(Inst::StoreLocal(return_local.expect("non-void return")));
        }

        // Epilogue: the synthesized return label.
        self.b.emit(Inst::Jump(return_label));
        self.b.mark_label(return_label)?;
        if let Some(rl) = return_local {
            self.b.emit(Inst::LoadLocal(rl));
        }
        self.b.emit(Inst::Ret);

        let record = self.consts.freeze();
        let method = self.b.bake()?;
        Ok((method, record))
    }

    // ========================================================================
    // Scopes and variable access
    // ========================================================================

    fn storage_of(&self, var: &VarRef) -> Result<VarStorage, CompileError> {
        self.analysis.storage(var.id()).ok_or_else(|| {
            CompileError::internal(format!("variable '{var}' was never classified"))
        })
    }

    /// Allocate the emit-time storage of a freshly entered variable.
    fn bind_storage(
        &mut self,
        frame: &mut ScopeFrame,
        var: &VarRef,
        storage: VarStorage,
    ) -> EmitStorage {
        match storage {
            VarStorage::Argument(i) => EmitStorage::Arg(i),
            VarStorage::Local => {
                let slot = self.b.borrow_local(var.ty());
                frame.borrowed.push((var.ty().clone(), slot));
                EmitStorage::Local(slot)
            }
            VarStorage::Boxed => {
                let slot = self.b.borrow_local(&Type::Object);
                frame.borrowed.push((Type::Object, slot));
                EmitStorage::CellLocal(slot)
            }
            VarStorage::Hoisted { index } => EmitStorage::Field {
                index,
                boxed: false,
            },
            VarStorage::HoistedBoxed { index } => EmitStorage::Field { index, boxed: true },
        }
    }

    /// Enter a scope for the given variables, optionally emitting the
    /// per-entry initialization (local reset, cell creation).
    fn push_scope(&mut self, vars: &[VarRef], init: bool) -> Result<(), CompileError> {
        let mut frame = ScopeFrame {
            vars: FxHashMap::default(),
            borrowed: Vec::new(),
        };
        for var in vars {
            let storage = self.storage_of(var)?;
            let emit_storage = self.bind_storage(&mut frame, var, storage);
            frame.vars.insert(var.id(), emit_storage);
        }
        self.scopes.push(frame);
        if init {
            for var in vars {
                self.emit_storage_init(var)?;
            }
        }
        Ok(())
    }

    fn pop_scope(&mut self) {
        if let Some(frame) = self.scopes.pop() {
            for (ty, slot) in frame.borrowed {
                self.b.return_local(&ty, slot);
            }
        }
    }

    /// Reset a variable's storage at scope entry: locals go back to nil,
    /// boxed variables get a fresh cell.
    fn emit_storage_init(&mut self, var: &VarRef) -> Result<(), CompileError> {
        match self.lookup_scope(var.id()) {
            Some(EmitStorage::Local(slot)) => {
                self.b.emit(Inst::Null);
                self.b.emit(Inst::StoreLocal(slot));
            }
            Some(EmitStorage::CellLocal(slot)) => {
                self.b.emit(Inst::Null);
                self.b.emit(Inst::NewCell);
                self.b.emit(Inst::StoreLocal(slot));
            }
            Some(EmitStorage::Field { index, boxed: true }) => {
                self.load_own_record()?;
                self.b.emit(Inst::Null);
                self.b.emit(Inst::NewCell);
                self.b.emit(Inst::StoreField(index));
            }
            _ => {}
        }
        Ok(())
    }

    fn lookup_scope(&self, id: VarId) -> Option<EmitStorage> {
        self.scopes
            .iter()
            .rev()
            .find_map(|frame| frame.vars.get(&id).copied())
    }

    fn load_own_record(&mut self) -> Result<(), CompileError> {
        let cl = self
            .closure_local
            .ok_or_else(|| CompileError::internal("hoisted access with no closure record"))?;
        self.b.emit(Inst::LoadLocal(cl));
        Ok(())
    }

    /// Locate an outer variable: depth along the closure chain plus the
    /// record field, from the binder's classification.
    fn outer_slot(&self, var: &VarRef) -> Result<(usize, u16, bool), CompileError> {
        let home = self
            .analysis
            .var_home
            .get(&var.id())
            .copied()
            .ok_or_else(|| CompileError::internal(format!("variable '{var}' has no home")))?;
        let depth = self
            .outer_chain
            .iter()
            .position(|id| *id == home)
            .ok_or_else(|| {
                CompileError::internal(format!("variable '{var}' is not on the closure chain"))
            })?;
        let storage = self.storage_of(var)?;
        let index = storage.hoisted_index().ok_or_else(|| {
            CompileError::internal(format!("outer variable '{var}' is not hoisted"))
        })?;
        Ok((depth, index, storage.is_boxed()))
    }

    fn load_var(&mut self, var: &VarRef) -> Result<(), CompileError> {
        match self.lookup_scope(var.id()) {
            Some(EmitStorage::Arg(i)) => self.b.emit(Inst::LoadArg(i)),
            Some(EmitStorage::Local(i)) => self.b.emit(Inst::LoadLocal(i)),
            Some(EmitStorage::CellLocal(i)) => {
                self.b.emit(Inst::LoadLocal(i));
                self.b.emit(Inst::LoadCell);
            }
            Some(EmitStorage::Field { index, boxed }) => {
                self.load_own_record()?;
                self.b.emit(Inst::LoadField(index));
                if boxed {
                    self.b.emit(Inst::LoadCell);
                }
            }
            None => {
                let (depth, index, boxed) = self.outer_slot(var)?;
                self.b.emit(Inst::LoadOuterScope);
                for _ in 0..depth {
                    self.b.emit(Inst::LoadField(0));
                }
                self.b.emit(Inst::LoadField(index));
                if boxed {
                    self.b.emit(Inst::LoadCell);
                }
            }
        }
        Ok(())
    }

    /// Store the value on top of the stack into a variable.
    fn store_var(&mut self, var: &VarRef) -> Result<(), CompileError> {
        match self.lookup_scope(var.id()) {
            Some(EmitStorage::Arg(i)) => self.b.emit(Inst::StoreArg(i)),
            Some(EmitStorage::Local(i)) => self.b.emit(Inst::StoreLocal(i)),
            Some(EmitStorage::CellLocal(i)) => {
                let t = self.b.borrow_local(var.ty());
                self.b.emit(Inst::StoreLocal(t));
                self.b.emit(Inst::LoadLocal(i));
                self.b.emit(Inst::LoadLocal(t));
                self.b.emit(Inst::StoreCell);
                self.b.return_local(var.ty(), t);
            }
            Some(EmitStorage::Field { index, boxed }) => {
                let t = self.b.borrow_local(var.ty());
                self.b.emit(Inst::StoreLocal(t));
                self.load_own_record()?;
                if boxed {
                    self.b.emit(Inst::LoadField(index));
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.emit(Inst::StoreCell);
                } else {
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.emit(Inst::StoreField(index));
                }
                self.b.return_local(var.ty(), t);
            }
            None => {
                let (depth, index, boxed) = self.outer_slot(var)?;
                let t = self.b.borrow_local(var.ty());
                self.b.emit(Inst::StoreLocal(t));
                self.b.emit(Inst::LoadOuterScope);
                for _ in 0..depth {
                    self.b.emit(Inst::LoadField(0));
                }
                if boxed {
                    self.b.emit(Inst::LoadField(index));
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.emit(Inst::StoreCell);
                } else {
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.emit(Inst::StoreField(index));
                }
                self.b.return_local(var.ty(), t);
            }
        }
        Ok(())
    }

    /// Push the shared cell of a boxed variable.
    fn load_cell_of(&mut self, var: &VarRef) -> Result<(), CompileError> {
        match self.lookup_scope(var.id()) {
            Some(EmitStorage::CellLocal(i)) => {
                self.b.emit(Inst::LoadLocal(i));
                Ok(())
            }
            Some(EmitStorage::Field { index, boxed: true }) => {
                self.load_own_record()?;
                self.b.emit(Inst::LoadField(index));
                Ok(())
            }
            None => {
                let (depth, index, boxed) = self.outer_slot(var)?;
                if !boxed {
                    return Err(CompileError::internal(format!(
                        "quoted variable '{var}' was not boxed"
                    )));
                }
                self.b.emit(Inst::LoadOuterScope);
                for _ in 0..depth {
                    self.b.emit(Inst::LoadField(0));
                }
                self.b.emit(Inst::LoadField(index));
                Ok(())
            }
            _ => Err(CompileError::internal(format!(
                "quoted variable '{var}' was not boxed"
            ))),
        }
    }

    // ========================================================================
    // Constants
    // ========================================================================

    fn emit_const(&mut self, slot: usize) {
        if let Some(&local) = self.const_cache.get(&slot) {
            self.b.emit(Inst::LoadLocal(local));
        } else {
            self.b.emit(Inst::LoadConst(slot as u16));
        }
    }

    fn emit_constant_value(&mut self, value: &Value, ty: &Type) -> Result<(), CompileError> {
        match value {
            Value::Nil => self.b.emit(Inst::Null),
            Value::Bool(true) => self.b.emit(Inst::True),
            Value::Bool(false) => self.b.emit(Inst::False),
            Value::Int(n) => self.b.emit(Inst::I64(*n)),
            Value::Float(x) => self.b.emit(Inst::F64(*x)),
            Value::Str(s) => self.b.emit(Inst::Str(s.clone())),
            other => {
                let slot = self.consts.lookup(other, ty).ok_or_else(|| {
                    CompileError::constant(format!(
                        "constant of kind '{}' was not allocated",
                        other.kind_name()
                    ))
                })?;
                self.emit_const(slot);
            }
        }
        Ok(())
    }

    fn aux_of(&self, id: NodeId) -> Result<Aux, CompileError> {
        self.plan
            .aux
            .get(&id)
            .cloned()
            .ok_or_else(|| CompileError::internal("auxiliary slots missing for node"))
    }

    // ========================================================================
    // Labels and gotos
    // ========================================================================

    fn ensure_label(&mut self, target: &LabelRef) -> Result<(Label, Option<u16>), CompileError> {
        if let Some(state) = self.labels.get(&target.id()) {
            return Ok((state.label, state.value_local));
        }
        let cross = self
            .label_meta
            .get(&target.id())
            .map_or(false, |meta| meta.cross);
        let label = self.b.define_label();
        let value_local = if cross && !target.ty().is_void() {
            Some(self.b.declare_local(target.ty().clone()))
        } else {
            None
        };
        self.labels.insert(target.id(), LabelState { label, value_local });
        Ok((label, value_local))
    }

    fn emit_goto(
        &mut self,
        target: &LabelRef,
        value: &Option<ExprRef>,
        depth: usize,
    ) -> Result<(), CompileError> {
        let (label, value_local) = self.ensure_label(target)?;
        if !target.ty().is_void() {
            match value {
                Some(v) => self.emit(v, depth + 1)?,
                None => self.b.emit(Inst::Null),
            }
            if let Some(vl) = value_local {
                self.b.emit(Inst::StoreLocal(vl));
            }
        } else if let Some(v) = value {
            self.emit_void(v, depth + 1)?;
        }
        let def_path = self
            .label_meta
            .get(&target.id())
            .map(|meta| meta.def_path.clone())
            .unwrap_or_default();
        let prefix_ok = def_path.len() <= self.region_path.len()
            && self.region_path[..def_path.len()]
                .iter()
                .map(|(id, _)| *id)
                .eq(def_path.iter().map(|(id, _)| *id));
        if !prefix_ok {
            return Err(CompileError::internal("goto crosses into an exception region"));
        }
        if self.region_path.len() == def_path.len() {
            self.b.emit(Inst::Jump(label));
        } else {
            self.b.emit(Inst::Leave(label));
        }
        Ok(())
    }

    // ========================================================================
    // Expression emission
    // ========================================================================

    /// Emit an expression, leaving exactly one value on the stack.
    fn emit(&mut self, expr: &ExprRef, depth: usize) -> Result<(), CompileError> {
        with_guard(depth, DEFAULT_GUARD_DEPTH, move || {
            if expr.ty().is_void() {
                self.emit_void_inner(expr, depth)?;
                self.b.emit(Inst::Null);
                Ok(())
            } else {
                self.emit_value(expr, depth)
            }
        })
    }

    /// Emit an expression purely for its side effects.
    fn emit_void(&mut self, expr: &ExprRef, depth: usize) -> Result<(), CompileError> {
        with_guard(depth, DEFAULT_GUARD_DEPTH, move || {
            self.emit_void_inner(expr, depth)
        })
    }

    fn emit_void_inner(&mut self, expr: &ExprRef, depth: usize) -> Result<(), CompileError> {
        let d = depth + 1;
        match expr.kind() {
            // Pure loads in a void context produce no code.
            ExprKind::Constant(_) | ExprKind::Variable(_) | ExprKind::CellRef { .. } => Ok(()),

            ExprKind::Block { vars, exprs } => {
                self.push_scope(vars, true)?;
                for e in exprs {
                    self.emit_void(e, d)?;
                }
                self.pop_scope();
                Ok(())
            }

            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.emit(test, d)?;
                if is_empty_void(if_false) {
                    let end = self.b.define_label();
                    self.b.emit(Inst::JumpIfFalse(end));
                    self.emit_void(if_true, d)?;
                    self.b.mark_label(end)?;
                } else {
                    let els = self.b.define_label();
                    let end = self.b.define_label();
                    self.b.emit(Inst::JumpIfFalse(els));
                    self.emit_void(if_true, d)?;
                    self.b.emit(Inst::Jump(end));
                    self.b.mark_label(els)?;
                    self.emit_void(if_false, d)?;
                    self.b.mark_label(end)?;
                }
                Ok(())
            }

            ExprKind::Assign { target, value } => self.emit_assign(target, value, true, d),

            ExprKind::Unary {
                op:
                    op @ (UnaryOp::PreIncrementAssign
                    | UnaryOp::PreDecrementAssign
                    | UnaryOp::PostIncrementAssign
                    | UnaryOp::PostDecrementAssign),
                checked,
                operand,
            } => self.emit_incdec(*op, *checked, operand, true),

            ExprKind::Loop {
                body,
                break_label,
                continue_label,
            } => self.emit_loop(body, break_label, continue_label, true, d),

            ExprKind::Try { .. } => self.emit_try(expr, true, d),

            ExprKind::Switch { .. } => self.emit_switch(expr, true, d),

            ExprKind::Label { target, default } => {
                let (label, value_local) = self.ensure_label(target)?;
                if !target.ty().is_void() {
                    match default {
                        Some(e) => self.emit(e, d)?,
                        None => self.b.emit(Inst::Null),
                    }
                    match value_local {
                        Some(vl) => self.b.emit(Inst::StoreLocal(vl)),
                        None => {}
                    }
                    self.b.mark_label(label)?;
                    // Value context discarded: drop whichever path's value.
                    if value_local.is_none() {
                        self.b.emit(Inst::Pop);
                    }
                } else {
                    if let Some(e) = default {
                        self.emit_void(e, d)?;
                    }
                    self.b.mark_label(label)?;
                }
                Ok(())
            }

            ExprKind::Goto { target, value, .. } => self.emit_goto(target, value, d),

            ExprKind::Throw { value } => self.emit_throw(value, d),

            ExprKind::Invoke { target, args } => {
                if let ExprKind::Lambda(node) = target.kind() {
                    let node = node.clone();
                    return self.emit_inline_invoke(&node, args, true, d);
                }
                self.emit_value(expr, depth)?;
                self.b.emit(Inst::Pop);
                Ok(())
            }

            _ => {
                self.emit_value(expr, depth)?;
                self.b.emit(Inst::Pop);
                Ok(())
            }
        }
    }

    fn emit_value(&mut self, expr: &ExprRef, depth: usize) -> Result<(), CompileError> {
        let d = depth + 1;
        match expr.kind() {
            ExprKind::Constant(value) => self.emit_constant_value(value, expr.ty()),

            ExprKind::Variable(var) => {
                let var = var.clone();
                self.load_var(&var)
            }

            ExprKind::CellRef { cell } => {
                let slot = self
                    .consts
                    .lookup(&Value::Cell(cell.clone()), &Type::Object)
                    .ok_or_else(|| CompileError::internal("cell constant was not allocated"))?;
                self.emit_const(slot);
                self.b.emit(Inst::LoadCell);
                Ok(())
            }

            ExprKind::Block { vars, exprs } => {
                self.push_scope(vars, true)?;
                let (last, init) = exprs
                    .split_last()
                    .ok_or_else(|| CompileError::internal("value block with no expressions"))?;
                for e in init {
                    self.emit_void(e, d)?;
                }
                self.emit(last, d)?;
                self.pop_scope();
                Ok(())
            }

            ExprKind::Lambda(_) => self.emit_nested_lambda(expr),

            ExprKind::Invoke { target, args } => {
                if let ExprKind::Lambda(node) = target.kind() {
                    let node = node.clone();
                    return self.emit_inline_invoke(&node, args, false, d);
                }
                self.emit(target, d)?;
                for a in args {
                    self.emit(a, d)?;
                }
                self.b.emit(Inst::Invoke {
                    argc: args.len() as u16,
                });
                Ok(())
            }

            ExprKind::Call { method, args } | ExprKind::New { ctor: method, args } => {
                let method = method.clone();
                for a in args {
                    self.emit(a, d)?;
                }
                self.b.emit(Inst::Call {
                    method,
                    argc: args.len() as u16,
                });
                Ok(())
            }

            ExprKind::NewArray { items } => {
                for item in items {
                    self.emit(item, d)?;
                }
                self.b.emit(Inst::NewArray(items.len() as u16));
                Ok(())
            }

            ExprKind::Index { array, index } => {
                self.emit(array, d)?;
                self.emit(index, d)?;
                self.b.emit(Inst::LoadIndex);
                Ok(())
            }

            ExprKind::Assign { target, value } => self.emit_assign(target, value, false, d),

            ExprKind::Binary {
                op,
                checked,
                lhs,
                rhs,
            } => self.emit_binary(*op, *checked, lhs, rhs, d),

            ExprKind::Unary {
                op,
                checked,
                operand,
            } => match op {
                UnaryOp::PreIncrementAssign
                | UnaryOp::PreDecrementAssign
                | UnaryOp::PostIncrementAssign
                | UnaryOp::PostDecrementAssign => self.emit_incdec(*op, *checked, operand, false),
                UnaryOp::Convert => {
                    self.emit(operand, d)?;
                    self.b.emit(Inst::Convert {
                        to: expr.ty().clone(),
                        checked: *checked,
                    });
                    Ok(())
                }
                UnaryOp::Neg | UnaryOp::Not => {
                    self.emit(operand, d)?;
                    if operand.ty().is_nullable() {
                        // Lifted: an absent operand stays absent.
                        let done = self.b.define_label();
                        self.b.emit(Inst::Dup);
                        self.b.emit(Inst::IsNil);
                        self.b.emit(Inst::JumpIfTrue(done));
                        self.b.emit(match op {
                            UnaryOp::Neg => Inst::Neg { checked: *checked },
                            _ => Inst::Not,
                        });
                        self.b.mark_label(done)?;
                    } else {
                        self.b.emit(match op {
                            UnaryOp::Neg => Inst::Neg { checked: *checked },
                            _ => Inst::Not,
                        });
                    }
                    Ok(())
                }
            },

            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.emit(test, d)?;
                let els = self.b.define_label();
                let end = self.b.define_label();
                self.b.emit(Inst::JumpIfFalse(els));
                self.emit(if_true, d)?;
                self.b.emit(Inst::Jump(end));
                self.b.mark_label(els)?;
                self.emit(if_false, d)?;
                self.b.mark_label(end)?;
                Ok(())
            }

            ExprKind::Loop {
                body,
                break_label,
                continue_label,
            } => self.emit_loop(body, break_label, continue_label, false, d),

            ExprKind::Label { target, default } => {
                let (label, value_local) = self.ensure_label(target)?;
                match default {
                    Some(e) => self.emit(e, d)?,
                    None => self.b.emit(Inst::Null),
                }
                if let Some(vl) = value_local {
                    self.b.emit(Inst::StoreLocal(vl));
                }
                self.b.mark_label(label)?;
                if let Some(vl) = value_local {
                    self.b.emit(Inst::LoadLocal(vl));
                }
                Ok(())
            }

            ExprKind::Try { .. } => self.emit_try(expr, false, d),

            ExprKind::Switch { .. } => self.emit_switch(expr, false, d),

            ExprKind::Quote { operand } => self.emit_quote(expr, operand),

            ExprKind::RuntimeVariables { vars } => self.emit_runtime_variables(expr, vars),

            ExprKind::Dynamic { args, .. } => {
                let aux = self.aux_of(expr.id())?;
                let slot = match aux {
                    Aux::Site { slot } => slot,
                    _ => return Err(CompileError::internal("dynamic node without a call site")),
                };
                self.emit_const(slot);
                for a in args {
                    self.emit(a, d)?;
                }
                self.b.emit(Inst::Call {
                    method: DYNAMIC_INVOKE.clone(),
                    argc: args.len() as u16 + 1,
                });
                Ok(())
            }

            ExprKind::Goto { .. } | ExprKind::Throw { .. } => Err(CompileError::internal(
                "control transfer reached value emission",
            )),
        }
    }

    // ========================================================================
    // Compound emissions
    // ========================================================================

    fn emit_assign(
        &mut self,
        target: &ExprRef,
        value: &ExprRef,
        void_ctx: bool,
        depth: usize,
    ) -> Result<(), CompileError> {
        match target.kind() {
            ExprKind::Variable(var) => {
                let var = var.clone();
                self.emit(value, depth)?;
                if !void_ctx {
                    self.b.emit(Inst::Dup);
                }
                self.store_var(&var)
            }
            ExprKind::Index { array, index } => {
                self.emit(array, depth)?;
                self.emit(index, depth)?;
                self.emit(value, depth)?;
                if void_ctx {
                    self.b.emit(Inst::StoreIndex);
                } else {
                    let t = self.b.borrow_local(value.ty());
                    self.b.emit(Inst::StoreLocal(t));
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.emit(Inst::StoreIndex);
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.return_local(value.ty(), t);
                }
                Ok(())
            }
            ExprKind::CellRef { cell } => {
                let slot = self
                    .consts
                    .lookup(&Value::Cell(cell.clone()), &Type::Object)
                    .ok_or_else(|| CompileError::internal("cell constant was not allocated"))?;
                if void_ctx {
                    self.emit_const(slot);
                    self.emit(value, depth)?;
                    self.b.emit(Inst::StoreCell);
                } else {
                    self.emit(value, depth)?;
                    let t = self.b.borrow_local(value.ty());
                    self.b.emit(Inst::StoreLocal(t));
                    self.emit_const(slot);
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.emit(Inst::StoreCell);
                    self.b.emit(Inst::LoadLocal(t));
                    self.b.return_local(value.ty(), t);
                }
                Ok(())
            }
            _ => Err(
                CompileError::invalid("assignment target must be a variable, index, or cell")
                    .with_expression(target),
            ),
        }
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        checked: bool,
        lhs: &ExprRef,
        rhs: &ExprRef,
        depth: usize,
    ) -> Result<(), CompileError> {
        if op.is_short_circuit() {
            if lhs.ty().is_nullable() || rhs.ty().is_nullable() {
                return Err(CompileError::not_supported(
                    "short-circuit operators on nullable operands",
                ));
            }
            let done = self.b.define_label();
            self.emit(lhs, depth)?;
            self.b.emit(Inst::Dup);
            self.b.emit(match op {
                BinaryOp::AndAlso => Inst::JumpIfFalse(done),
                _ => Inst::JumpIfTrue(done),
            });
            self.b.emit(Inst::Pop);
            self.emit(rhs, depth)?;
            self.b.mark_label(done)?;
            return Ok(());
        }

        let lifted = (lhs.ty().is_nullable() || rhs.ty().is_nullable())
            && !matches!(op, BinaryOp::Eq | BinaryOp::Ne);
        if !lifted {
            self.emit(lhs, depth)?;
            self.emit(rhs, depth)?;
            self.b.emit(Inst::Arith { op, checked });
            return Ok(());
        }

        // Lifted: both operands are tested for presence; the operation
        // runs only when both are present, otherwise the result is
        // absent.
        let lt = self.b.borrow_local(&Type::Object);
        let rt = self.b.borrow_local(&Type::Object);
        let absent = self.b.define_label();
        let done = self.b.define_label();
        self.emit(lhs, depth)?;
        self.b.emit(Inst::StoreLocal(lt));
        self.emit(rhs, depth)?;
        self.b.emit(Inst::StoreLocal(rt));
        self.b.emit(Inst::LoadLocal(lt));
        self.b.emit(Inst::IsNil);
        self.b.emit(Inst::JumpIfTrue(absent));
        self.b.emit(Inst::LoadLocal(rt));
        self.b.emit(Inst::IsNil);
        self.b.emit(Inst::JumpIfTrue(absent));
        self.b.emit(Inst::LoadLocal(lt));
        self.b.emit(Inst::LoadLocal(rt));
        self.b.emit(Inst::Arith { op, checked });
        self.b.emit(Inst::Jump(done));
        self.b.mark_label(absent)?;
        self.b.emit(Inst::Null);
        self.b.mark_label(done)?;
        self.b.return_local(&Type::Object, lt);
        self.b.return_local(&Type::Object, rt);
        Ok(())
    }

    fn emit_incdec(
        &mut self,
        op: UnaryOp,
        checked: bool,
        operand: &ExprRef,
        void_ctx: bool,
    ) -> Result<(), CompileError> {
        let var = match operand.kind() {
            ExprKind::Variable(var) => var.clone(),
            _ => {
                return Err(CompileError::invalid(
                    "increment target must be a variable",
                )
                .with_expression(operand))
            }
        };
        if var.ty().is_nullable() {
            return Err(CompileError::not_supported("lifted increment"));
        }
        let arith_op = match op {
            UnaryOp::PreIncrementAssign | UnaryOp::PostIncrementAssign => BinaryOp::Add,
            _ => BinaryOp::Sub,
        };
        let one = match var.ty() {
            Type::Float => Inst::F64(1.0),
            _ => Inst::I64(1),
        };
        let pre = matches!(
            op,
            UnaryOp::PreIncrementAssign | UnaryOp::PreDecrementAssign
        );
        self.load_var(&var)?;
        if void_ctx {
            self.b.emit(one);
            self.b.emit(Inst::Arith {
                op: arith_op,
                checked,
            });
            self.store_var(&var)
        } else if pre {
            self.b.emit(one);
            self.b.emit(Inst::Arith {
                op: arith_op,
                checked,
            });
            self.b.emit(Inst::Dup);
            self.store_var(&var)
        } else {
            self.b.emit(Inst::Dup);
            self.b.emit(one);
            self.b.emit(Inst::Arith {
                op: arith_op,
                checked,
            });
            self.store_var(&var)
        }
    }

    fn emit_loop(
        &mut self,
        body: &ExprRef,
        break_label: &Option<LabelRef>,
        continue_label: &Option<LabelRef>,
        void_ctx: bool,
        depth: usize,
    ) -> Result<(), CompileError> {
        let brk = match break_label {
            Some(l) => Some((l.clone(), self.ensure_label(l)?)),
            None => None,
        };
        let top = match continue_label {
            Some(l) => self.ensure_label(l)?.0,
            None => self.b.define_label(),
        };
        self.b.mark_label(top)?;
        self.emit_void(body, depth)?;
        self.b.emit(Inst::Jump(top));
        if let Some((target, (label, value_local))) = brk {
            self.b.mark_label(label)?;
            if !target.ty().is_void() {
                match value_local {
                    Some(vl) => {
                        if !void_ctx {
                            self.b.emit(Inst::LoadLocal(vl));
                        }
                    }
                    None => {
                        // Break values arrive on the stack.
                        if void_ctx {
                            self.b.emit(Inst::Pop);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_throw(
        &mut self,
        value: &Option<ExprRef>,
        depth: usize,
    ) -> Result<(), CompileError> {
        match value {
            Some(v) => {
                self.emit(v, depth)?;
                self.b.emit(Inst::Throw);
            }
            None => {
                let in_catch = self
                    .region_path
                    .iter()
                    .any(|(_, section)| *section == Section::Catch);
                if !in_catch {
                    return Err(CompileError::invalid("rethrow outside a catch handler"));
                }
                self.b.emit(Inst::Rethrow);
            }
        }
        Ok(())
    }

    fn emit_try(
        &mut self,
        expr: &ExprRef,
        void_ctx: bool,
        depth: usize,
    ) -> Result<(), CompileError> {
        let (body, handlers, finally, fault) = match expr.kind() {
            ExprKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => (body.clone(), handlers.clone(), finally.clone(), fault.clone()),
            _ => return Err(CompileError::internal("emit_try on a non-try node")),
        };
        let rid = self
            .region_ids
            .get(&expr.id())
            .copied()
            .ok_or_else(|| CompileError::internal("try region missing from prescan"))?;

        let end = self.b.define_label();
        let result = if void_ctx || expr.ty().is_void() {
            None
        } else {
            Some(self.b.borrow_local(expr.ty()))
        };

        self.region_path.push((rid, Section::Try));
        self.b.begin_try();
        match result {
            Some(t) => {
                self.emit(&body, depth)?;
                self.b.emit(Inst::StoreLocal(t));
            }
            None => self.emit_void(&body, depth)?,
        }
        self.b.emit(Inst::Leave(end));

        for clause in &handlers {
            self.emit_catch_clause(clause, result, end, rid, depth)?;
        }

        if let Some(f) = &finally {
            self.set_section(rid, Section::Finally);
            self.b.begin_finally()?;
            self.emit_void(f, depth)?;
            self.b.emit(Inst::EndFinally);
        }
        if let Some(f) = &fault {
            self.set_section(rid, Section::Fault);
            self.b.begin_fault()?;
            self.emit_void(f, depth)?;
            self.b.emit(Inst::EndFinally);
        }

        self.b.end_try()?;
        self.region_path.pop();
        self.b.mark_label(end)?;
        if let Some(t) = result {
            self.b.emit(Inst::LoadLocal(t));
            self.b.return_local(expr.ty(), t);
        }
        Ok(())
    }

    fn emit_catch_clause(
        &mut self,
        clause: &CatchClause,
        result: Option<u16>,
        end: Label,
        rid: u32,
        depth: usize,
    ) -> Result<(), CompileError> {
        // The clause variable's scope covers both the filter and the
        // body; each section binds the incoming exception on entry.
        let scope_vars: Vec<VarRef> = clause.var.iter().cloned().collect();
        self.push_scope(&scope_vars, false)?;

        if let Some(filter) = &clause.filter {
            self.set_section(rid, Section::Filter);
            self.b.begin_filter()?;
            match &clause.var {
                Some(v) => {
                    let v = v.clone();
                    self.emit_storage_init(&v)?;
                    self.store_var(&v)?;
                }
                None => self.b.emit(Inst::Pop),
            }
            self.emit(filter, depth)?;
            self.b.emit(Inst::EndFilter);
        }

        self.set_section(rid, Section::Catch);
        self.b.begin_catch()?;
        match &clause.var {
            Some(v) => {
                let v = v.clone();
                self.emit_storage_init(&v)?;
                self.store_var(&v)?;
            }
            None => self.b.emit(Inst::Pop),
        }
        match result {
            Some(t) => {
                self.emit(&clause.body, depth)?;
                self.b.emit(Inst::StoreLocal(t));
            }
            None => self.emit_void(&clause.body, depth)?,
        }
        self.b.emit(Inst::Leave(end));

        self.pop_scope();
        Ok(())
    }

    fn set_section(&mut self, rid: u32, section: Section) {
        if let Some(top) = self.region_path.last_mut() {
            if top.0 == rid {
                top.1 = section;
            }
        }
    }

    fn emit_switch(
        &mut self,
        expr: &ExprRef,
        void_ctx: bool,
        depth: usize,
    ) -> Result<(), CompileError> {
        let (value, cases, default) = match expr.kind() {
            ExprKind::Switch {
                value,
                cases,
                default,
            } => (value.clone(), cases.clone(), default.clone()),
            _ => return Err(CompileError::internal("emit_switch on a non-switch node")),
        };
        let end = self.b.define_label();
        let case_labels: Vec<Label> = cases.iter().map(|_| self.b.define_label()).collect();

        let hashed = matches!(self.plan.aux.get(&expr.id()), Some(Aux::StringSwitch { .. }));
        if hashed {
            let table_slot = match self.aux_of(expr.id())? {
                Aux::StringSwitch { table } => table,
                _ => unreachable!("checked above"),
            };
            let mut strings = Vec::new();
            let mut flat_labels = Vec::new();
            for (ci, case) in cases.iter().enumerate() {
                for v in &case.values {
                    match v {
                        Value::Str(s) => strings.push(s.clone()),
                        other => {
                            return Err(CompileError::internal(format!(
                                "string switch with non-string case '{other}'"
                            )))
                        }
                    }
                    flat_labels.push(case_labels[ci]);
                }
            }
            self.consts
                .fill(table_slot, Value::Obj(SwitchTable::new(strings)));

            self.emit(&value, depth)?;
            let t = self.b.borrow_local(value.ty());
            self.b.emit(Inst::StoreLocal(t));
            self.emit_const(table_slot);
            self.b.emit(Inst::LoadLocal(t));
            self.b.return_local(value.ty(), t);
            self.b.emit(Inst::Call {
                method: SWITCH_INDEX.clone(),
                argc: 2,
            });
            self.b.emit(Inst::JumpTable(flat_labels.into_boxed_slice()));
        } else {
            self.emit(&value, depth)?;
            let t = self.b.borrow_local(value.ty());
            self.b.emit(Inst::StoreLocal(t));
            for (ci, case) in cases.iter().enumerate() {
                for v in &case.values {
                    self.b.emit(Inst::LoadLocal(t));
                    self.emit_constant_value(v, value.ty())?;
                    self.b.emit(Inst::Arith {
                        op: BinaryOp::Eq,
                        checked: false,
                    });
                    self.b.emit(Inst::JumpIfTrue(case_labels[ci]));
                }
            }
            self.b.return_local(value.ty(), t);
        }

        // Fallthrough: the default arm.
        match &default {
            Some(e) => {
                if void_ctx {
                    self.emit_void(e, depth)?;
                } else {
                    self.emit(e, depth)?;
                }
            }
            None => {
                if !void_ctx {
                    self.b.emit(Inst::Null);
                }
            }
        }
        self.b.emit(Inst::Jump(end));

        for (ci, case) in cases.iter().enumerate() {
            self.b.mark_label(case_labels[ci])?;
            if void_ctx {
                self.emit_void(&case.body, depth)?;
            } else {
                self.emit(&case.body, depth)?;
            }
            self.b.emit(Inst::Jump(end));
        }
        self.b.mark_label(end)?;
        Ok(())
    }

    fn emit_quote(&mut self, expr: &ExprRef, operand: &ExprRef) -> Result<(), CompileError> {
        let (tree_slot, cell_env) = match self.aux_of(expr.id())? {
            Aux::Quote { tree, cell_env } => (tree, cell_env),
            _ => return Err(CompileError::internal("quote node without reserved slots")),
        };
        self.consts.fill(tree_slot, Value::Tree(operand.clone()));
        self.emit_const(tree_slot);

        let env_slot = match cell_env {
            Some(slot) => slot,
            // A closed quote evaluates to the tree itself.
            None => return Ok(()),
        };
        let free = free_variables(operand);
        self.consts.fill(
            env_slot,
            Value::obj(QuoteMeta { vars: free.clone() }),
        );
        self.emit_const(env_slot);
        self.b.emit(Inst::NewRecord(free.len() as u16));
        for (i, var) in free.iter().enumerate() {
            self.b.emit(Inst::Dup);
            self.load_cell_of(var)?;
            self.b.emit(Inst::StoreField(i as u16));
        }
        self.b.emit(Inst::Call {
            method: QUOTE.clone(),
            argc: 3,
        });
        Ok(())
    }

    fn emit_runtime_variables(
        &mut self,
        expr: &ExprRef,
        vars: &[VarRef],
    ) -> Result<(), CompileError> {
        let table_slot = match self.aux_of(expr.id())? {
            Aux::Variables { table } => table,
            _ => return Err(CompileError::internal("runtime-variables node without a table")),
        };
        let own_record = self.analysis.lambdas[&self.lambda_id].needs_closure;
        let chain: Vec<NodeId> = if own_record {
            std::iter::once(self.lambda_id)
                .chain(self.outer_chain.iter().copied())
                .collect()
        } else {
            self.outer_chain.clone()
        };

        let mut entries = Vec::with_capacity(vars.len());
        for var in vars {
            let home = self
                .analysis
                .var_home
                .get(&var.id())
                .copied()
                .ok_or_else(|| CompileError::internal("runtime variable has no home"))?;
            let hop = chain.iter().position(|id| *id == home).ok_or_else(|| {
                CompileError::internal("runtime variable is not on the closure chain")
            })?;
            let index = self.storage_of(var)?.hoisted_index().ok_or_else(|| {
                CompileError::internal("runtime variable was not hoisted")
            })?;
            entries.push(Value::Int(((hop as i64) << 32) | i64::from(index)));
        }
        self.consts.fill(table_slot, Value::array(entries));

        if own_record {
            self.load_own_record()?;
        } else if !self.outer_chain.is_empty() {
            self.b.emit(Inst::LoadOuterScope);
        } else {
            // No variables listed: an empty record keeps the helper total.
            self.b.emit(Inst::NewRecord(0));
        }
        self.emit_const(table_slot);
        self.b.emit(Inst::Call {
            method: CREATE_RUNTIME_VARIABLES.clone(),
            argc: 2,
        });
        Ok(())
    }

    fn emit_nested_lambda(&mut self, expr: &ExprRef) -> Result<(), CompileError> {
        let (method_slot, consts_slot) = match self.aux_of(expr.id())? {
            Aux::Lambda { method, constants } => (method, constants),
            _ => return Err(CompileError::internal("nested lambda without handle slots")),
        };
        let (method, record) =
            compile_lambda(self.plan, self.analysis, self.options, expr)?;
        self.consts.fill(method_slot, Value::Obj(method));
        self.consts.fill(consts_slot, Value::Obj(record));

        self.emit_const(method_slot);
        self.emit_const(consts_slot);
        let nested_uses_outer = self.analysis.lambdas[&expr.id()].uses_outer;
        if nested_uses_outer {
            if self.closure_local.is_some() {
                self.load_own_record()?;
            } else if !self.outer_chain.is_empty() {
                self.b.emit(Inst::LoadOuterScope);
            } else {
                self.b.emit(Inst::Null);
            }
        } else {
            self.b.emit(Inst::Null);
        }
        self.b.emit(Inst::MakeDelegate);
        Ok(())
    }

    fn emit_inline_invoke(
        &mut self,
        node: &LambdaRef,
        args: &[ExprRef],
        void_ctx: bool,
        depth: usize,
    ) -> Result<(), CompileError> {
        if node.params.len() != args.len() {
            return Err(CompileError::invalid(format!(
                "invoke with {} arguments for {} parameters",
                args.len(),
                node.params.len()
            )));
        }
        self.push_scope(&node.params, true)?;
        for (p, a) in node.params.iter().zip(args) {
            self.emit(a, depth)?;
            self.store_var(p)?;
        }
        if void_ctx {
            self.emit_void(&node.body, depth)?;
        } else if node.body.ty().is_void() {
            self.emit_void(&node.body, depth)?;
            self.b.emit(Inst::Null);
        } else {
            self.emit(&node.body, depth)?;
        }
        self.pop_scope();
        Ok(())
    }
}

/// An empty void block, as synthesized for `if` without `else`.
fn is_empty_void(expr: &ExprRef) -> bool {
    matches!(expr.kind(), ExprKind::Block { exprs, .. } if exprs.is_empty())
}
