//! Frame-based dispatch loop for baked methods.
//!
//! Executes a [`CompiledMethod`]'s instruction stream against an
//! evaluation stack. Exception handling follows the emit-layer region
//! tables: `leave` runs intervening finally handlers before transferring
//! control, faults run only during unwinding, and catch filters are
//! evaluated against the in-flight error before any handler is entered.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::emit::{CompiledMethod, HandlerKind, Inst};
use crate::runtime::records::new_record;
use crate::runtime::{
    arith, convert, logical_not, negate, CompiledLambda, ConstantsRecord, Environment,
    RuntimeError, Value, ValueCell,
};

/// Run a method against an optional environment. Arity is the caller's
/// responsibility.
pub(crate) fn run_method(
    method: &Arc<CompiledMethod>,
    env: Option<&Arc<Environment>>,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let mut interp = Interp {
        method,
        env,
        args: args.to_vec(),
        locals: vec![Value::Nil; method.local_count],
    };
    match interp.run(0, Vec::new(), None)? {
        Exit::Value(v) => Ok(v),
        Exit::FilterVerdict(_) => Err(RuntimeError::Internal(
            "filter terminator outside a filter".to_string(),
        )),
    }
}

enum Exit {
    Value(Value),
    FilterVerdict(bool),
}

/// How a suspended control transfer resumes once its pending finally
/// handlers have run.
enum Resume {
    Jump(usize),
    Catch {
        region: usize,
        handler: usize,
        err: RuntimeError,
    },
    Propagate(RuntimeError),
}

struct Cont {
    pending: VecDeque<(usize, usize)>,
    running: Option<(usize, usize)>,
    resume: Resume,
}

struct ActiveCatch {
    err: RuntimeError,
    start: usize,
    end: usize,
}

struct RunState {
    ip: usize,
    stack: Vec<Value>,
    conts: Vec<Cont>,
    active: Vec<ActiveCatch>,
    /// Filter instruction bounds when running a filter; regions outside
    /// the bounds belong to the surrounding execution.
    bounds: Option<(usize, usize)>,
}

struct Interp<'a> {
    method: &'a Arc<CompiledMethod>,
    env: Option<&'a Arc<Environment>>,
    args: Vec<Value>,
    locals: Vec<Value>,
}

enum Flow {
    Next,
    Jump(usize),
    Leave(usize),
    Ret,
    EndFinally,
    EndFilter(bool),
    Rethrow,
}

impl<'a> Interp<'a> {
    fn run(
        &mut self,
        entry: usize,
        stack: Vec<Value>,
        bounds: Option<(usize, usize)>,
    ) -> Result<Exit, RuntimeError> {
        let mut state = RunState {
            ip: entry,
            stack,
            conts: Vec::new(),
            active: Vec::new(),
            bounds,
        };
        loop {
            let inst = match self.method.code.get(state.ip) {
                Some(inst) => inst.clone(),
                None => {
                    return Err(RuntimeError::Internal(format!(
                        "instruction pointer {} out of range",
                        state.ip
                    )))
                }
            };
            let flow = self.step(&inst, &mut state);
            match flow {
                Ok(Flow::Next) => state.ip += 1,
                Ok(Flow::Jump(target)) => state.ip = target,
                Ok(Flow::Ret) => {
                    return Ok(Exit::Value(state.stack.pop().unwrap_or(Value::Nil)))
                }
                Ok(Flow::EndFilter(verdict)) => {
                    if state.bounds.is_some() {
                        return Ok(Exit::FilterVerdict(verdict));
                    }
                    return Err(RuntimeError::Internal(
                        "filter terminator outside a filter".to_string(),
                    ));
                }
                Ok(Flow::Leave(target)) => {
                    if let Some(exit) = self.leave(&mut state, target)? {
                        return Ok(exit);
                    }
                }
                Ok(Flow::EndFinally) => {
                    let cont = state.conts.pop().ok_or_else(|| {
                        RuntimeError::Internal(
                            "finally terminator with no pending transfer".to_string(),
                        )
                    })?;
                    if let Some(exit) = self.start_cont(&mut state, cont)? {
                        return Ok(exit);
                    }
                }
                Ok(Flow::Rethrow) => {
                    let err = match state.active.last() {
                        Some(catch) => catch.err.clone(),
                        None => {
                            return Err(RuntimeError::Internal(
                                "rethrow outside a catch handler".to_string(),
                            ))
                        }
                    };
                    if let Some(exit) = self.handle(&mut state, err)? {
                        return Ok(exit);
                    }
                }
                Err(err) => {
                    if let Some(exit) = self.handle(&mut state, err)? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Control transfers
    // ========================================================================

    /// `leave`: clear the stack, run finally handlers of every region the
    /// transfer exits, then jump.
    fn leave(
        &mut self,
        state: &mut RunState,
        target: usize,
    ) -> Result<Option<Exit>, RuntimeError> {
        let ip = state.ip;
        state.stack.clear();
        state
            .active
            .retain(|c| !(c.start <= ip && ip < c.end) || (c.start <= target && target < c.end));

        let mut pending = VecDeque::new();
        for region in self.method.regions.iter() {
            if !self.in_bounds(state, region.try_start) {
                continue;
            }
            if region.contains(ip) && !region.contains(target) {
                for h in &region.handlers {
                    if matches!(h.kind, HandlerKind::Finally) {
                        pending.push_back((h.start, h.end));
                    }
                }
            }
        }
        self.start_cont(
            state,
            Cont {
                pending,
                running: None,
                resume: Resume::Jump(target),
            },
        )
    }

    /// Run the next pending finally of a continuation, or apply its
    /// resume action if none are left.
    fn start_cont(
        &mut self,
        state: &mut RunState,
        mut cont: Cont,
    ) -> Result<Option<Exit>, RuntimeError> {
        if let Some((start, end)) = cont.pending.pop_front() {
            cont.running = Some((start, end));
            state.stack.clear();
            state.ip = start;
            state.conts.push(cont);
            return Ok(None);
        }
        match cont.resume {
            Resume::Jump(target) => {
                state.ip = target;
                Ok(None)
            }
            Resume::Catch {
                region,
                handler,
                err,
            } => {
                let h = &self.method.regions[region].handlers[handler];
                state.stack.clear();
                state.stack.push(err.to_value());
                state.active.push(ActiveCatch {
                    err,
                    start: h.start,
                    end: h.end,
                });
                state.ip = h.start;
                Ok(None)
            }
            Resume::Propagate(err) => self.propagate(state, err).map(Some),
        }
    }

    fn in_bounds(&self, state: &RunState, ip: usize) -> bool {
        match state.bounds {
            Some((lo, hi)) => lo <= ip && ip < hi,
            None => true,
        }
    }

    /// Exception dispatch: locate a catch whose filter accepts the error,
    /// run intervening finally and fault handlers, then either enter the
    /// catch or propagate.
    fn handle(
        &mut self,
        state: &mut RunState,
        err: RuntimeError,
    ) -> Result<Option<Exit>, RuntimeError> {
        let ip = state.ip;

        // A raise inside a finally abandons the transfer it was part of.
        while state
            .conts
            .last()
            .and_then(|c| c.running)
            .map_or(false, |(s, e)| s <= ip && ip < e)
        {
            state.conts.pop();
        }

        let mut target = None;
        'search: for (ri, region) in self.method.regions.iter().enumerate() {
            if !self.in_bounds(state, region.try_start) {
                continue;
            }
            if !region.try_contains(ip) {
                continue;
            }
            for (hi, h) in region.handlers.iter().enumerate() {
                if let HandlerKind::Catch { filter } = &h.kind {
                    let accepted = match filter {
                        None => true,
                        Some((fs, fe)) => self.eval_filter(*fs, *fe, &err),
                    };
                    if accepted {
                        target = Some((ri, hi));
                        break 'search;
                    }
                }
            }
        }

        let mut pending = VecDeque::new();
        for (ri, region) in self.method.regions.iter().enumerate() {
            if let Some((tri, _)) = target {
                if ri == tri {
                    break;
                }
            }
            if !self.in_bounds(state, region.try_start) {
                continue;
            }
            if region.contains(ip) {
                for h in &region.handlers {
                    if matches!(h.kind, HandlerKind::Finally | HandlerKind::Fault) {
                        pending.push_back((h.start, h.end));
                    }
                }
            }
        }

        let resume = match target {
            Some((region, handler)) => Resume::Catch {
                region,
                handler,
                err,
            },
            None => Resume::Propagate(err),
        };
        self.start_cont(
            state,
            Cont {
                pending,
                running: None,
                resume,
            },
        )
    }

    /// The error escapes this activation. Filters refuse instead of
    /// propagating.
    fn propagate(
        &mut self,
        state: &mut RunState,
        err: RuntimeError,
    ) -> Result<Exit, RuntimeError> {
        if state.bounds.is_some() {
            return Ok(Exit::FilterVerdict(false));
        }
        Err(err)
    }

    fn eval_filter(&mut self, fs: usize, fe: usize, err: &RuntimeError) -> bool {
        match self.run(fs, vec![err.to_value()], Some((fs, fe))) {
            Ok(Exit::FilterVerdict(v)) => v,
            // An error inside a filter refuses the exception.
            _ => false,
        }
    }

    // ========================================================================
    // Instruction execution
    // ========================================================================

    fn step(&mut self, inst: &Inst, state: &mut RunState) -> Result<Flow, RuntimeError> {
        let stack = &mut state.stack;
        match inst {
            Inst::Dup => {
                let top = peek(stack)?.clone();
                stack.push(top);
            }
            Inst::Pop => {
                pop(stack)?;
            }
            Inst::Null => stack.push(Value::Nil),
            Inst::True => stack.push(Value::Bool(true)),
            Inst::False => stack.push(Value::Bool(false)),
            Inst::I64(n) => stack.push(Value::Int(*n)),
            Inst::F64(x) => stack.push(Value::Float(*x)),
            Inst::Str(s) => stack.push(Value::Str(s.clone())),
            Inst::LoadConst(slot) => {
                let env = self.env.ok_or_else(|| {
                    RuntimeError::Internal("constant load with no environment".to_string())
                })?;
                let value = env.constants.get(*slot as usize).ok_or_else(|| {
                    RuntimeError::Internal(format!("constant slot {slot} out of range"))
                })?;
                stack.push(value.clone());
            }
            Inst::LoadOuterScope => {
                let locals = self
                    .env
                    .and_then(|e| e.locals.clone())
                    .unwrap_or(Value::Nil);
                stack.push(locals);
            }
            Inst::LoadArg(i) => {
                let v = self.args.get(*i as usize).cloned().ok_or_else(|| {
                    RuntimeError::Internal(format!("argument {i} out of range"))
                })?;
                stack.push(v);
            }
            Inst::StoreArg(i) => {
                let v = pop(stack)?;
                let slot = self.args.get_mut(*i as usize).ok_or_else(|| {
                    RuntimeError::Internal(format!("argument {i} out of range"))
                })?;
                *slot = v;
            }
            Inst::LoadLocal(i) => {
                let v = self.locals.get(*i as usize).cloned().ok_or_else(|| {
                    RuntimeError::Internal(format!("local {i} out of range"))
                })?;
                stack.push(v);
            }
            Inst::StoreLocal(i) => {
                let v = pop(stack)?;
                let slot = self.locals.get_mut(*i as usize).ok_or_else(|| {
                    RuntimeError::Internal(format!("local {i} out of range"))
                })?;
                *slot = v;
            }
            Inst::NewRecord(arity) => {
                stack.push(Value::Record(new_record(*arity as usize)));
            }
            Inst::LoadField(i) => {
                let record = pop_record(stack)?;
                stack.push(record.get(*i as usize)?);
            }
            Inst::StoreField(i) => {
                let value = pop(stack)?;
                let record = pop_record(stack)?;
                record.set(*i as usize, value)?;
            }
            Inst::NewCell => {
                let v = pop(stack)?;
                stack.push(Value::Cell(ValueCell::new(v)));
            }
            Inst::LoadCell => {
                let cell = pop_cell(stack)?;
                stack.push(cell.get());
            }
            Inst::StoreCell => {
                let value = pop(stack)?;
                let cell = pop_cell(stack)?;
                cell.set(value);
            }
            Inst::NewArray(n) => {
                let at = stack.len().checked_sub(*n as usize).ok_or_else(underflow)?;
                let items = stack.split_off(at);
                stack.push(Value::array(items));
            }
            Inst::LoadIndex => {
                let index = pop_int(stack)?;
                let array = pop_array(stack)?;
                let items = array.read().unwrap();
                let v = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or(RuntimeError::IndexOutOfRange {
                        index,
                        len: items.len(),
                    })?;
                drop(items);
                stack.push(v);
            }
            Inst::StoreIndex => {
                let value = pop(stack)?;
                let index = pop_int(stack)?;
                let array = pop_array(stack)?;
                let mut items = array.write().unwrap();
                let len = items.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or(RuntimeError::IndexOutOfRange { index, len })?;
                *slot = value;
            }
            Inst::IsNil => {
                let v = pop(stack)?;
                stack.push(Value::Bool(v.is_nil()));
            }
            Inst::Arith { op, checked } => {
                let r = pop(stack)?;
                let l = pop(stack)?;
                stack.push(arith(*op, *checked, &l, &r)?);
            }
            Inst::Neg { checked } => {
                let v = pop(stack)?;
                stack.push(negate(*checked, &v)?);
            }
            Inst::Not => {
                let v = pop(stack)?;
                stack.push(logical_not(&v)?);
            }
            Inst::Convert { to, checked } => {
                let v = pop(stack)?;
                stack.push(convert(&v, to, *checked)?);
            }
            Inst::Jump(l) => return Ok(Flow::Jump(self.method.label_target(*l))),
            Inst::JumpIfTrue(l) => {
                if pop_bool(stack)? {
                    return Ok(Flow::Jump(self.method.label_target(*l)));
                }
            }
            Inst::JumpIfFalse(l) => {
                if !pop_bool(stack)? {
                    return Ok(Flow::Jump(self.method.label_target(*l)));
                }
            }
            Inst::JumpTable(labels) => {
                let n = pop_int(stack)?;
                if n >= 0 && (n as usize) < labels.len() {
                    return Ok(Flow::Jump(self.method.label_target(labels[n as usize])));
                }
            }
            Inst::Leave(l) => return Ok(Flow::Leave(self.method.label_target(*l))),
            Inst::EndFinally => return Ok(Flow::EndFinally),
            Inst::EndFilter => {
                let verdict = pop_bool(stack)?;
                return Ok(Flow::EndFilter(verdict));
            }
            Inst::Throw => {
                let v = pop(stack)?;
                return Err(RuntimeError::Thrown(v));
            }
            Inst::Rethrow => return Ok(Flow::Rethrow),
            Inst::Call { method, argc } => {
                let at = stack
                    .len()
                    .checked_sub(*argc as usize)
                    .ok_or_else(underflow)?;
                let args = stack.split_off(at);
                stack.push(method.invoke(&args)?);
            }
            Inst::Invoke { argc } => {
                let at = stack
                    .len()
                    .checked_sub(*argc as usize)
                    .ok_or_else(underflow)?;
                let args = stack.split_off(at);
                let target = pop(stack)?;
                let function = target
                    .as_function()
                    .ok_or_else(|| RuntimeError::type_error("function", &target))?;
                stack.push(function.invoke(&args)?);
            }
            Inst::MakeDelegate => {
                let locals = pop(stack)?;
                let consts = pop(stack)?;
                let method_obj = pop(stack)?;
                let method = method_obj
                    .obj_as::<CompiledMethod>()
                    .ok_or_else(|| RuntimeError::type_error("method handle", &method_obj))?;
                let constants = consts
                    .obj_as::<ConstantsRecord>()
                    .ok_or_else(|| RuntimeError::type_error("constants record", &consts))?;
                let locals = if locals.is_nil() { None } else { Some(locals) };
                let env = if constants.is_empty() && locals.is_none() {
                    None
                } else {
                    Some(Arc::new(Environment { constants, locals }))
                };
                stack.push(Value::Function(CompiledLambda::new(method, env)));
            }
            Inst::Ret => return Ok(Flow::Ret),
        }
        Ok(Flow::Next)
    }
}

// ============================================================================
// Stack helpers
// ============================================================================

fn underflow() -> RuntimeError {
    RuntimeError::Internal("evaluation stack underflow".to_string())
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, RuntimeError> {
    stack.pop().ok_or_else(underflow)
}

fn peek(stack: &[Value]) -> Result<&Value, RuntimeError> {
    stack.last().ok_or_else(underflow)
}

fn pop_bool(stack: &mut Vec<Value>) -> Result<bool, RuntimeError> {
    let v = pop(stack)?;
    v.to_bool()
        .ok_or_else(|| RuntimeError::type_error("bool", &v))
}

fn pop_int(stack: &mut Vec<Value>) -> Result<i64, RuntimeError> {
    let v = pop(stack)?;
    v.to_int().ok_or_else(|| RuntimeError::type_error("int", &v))
}

fn pop_record(
    stack: &mut Vec<Value>,
) -> Result<Arc<dyn crate::runtime::RuntimeVariables>, RuntimeError> {
    let v = pop(stack)?;
    v.as_record()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("record", &v))
}

fn pop_cell(stack: &mut Vec<Value>) -> Result<Arc<ValueCell>, RuntimeError> {
    let v = pop(stack)?;
    v.as_cell()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("cell", &v))
}

fn pop_array(
    stack: &mut Vec<Value>,
) -> Result<Arc<std::sync::RwLock<Vec<Value>>>, RuntimeError> {
    let v = pop(stack)?;
    v.as_array()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("array", &v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::MethodBuilder;
    use crate::tree::BinaryOp;

    fn run(b: MethodBuilder, args: &[Value]) -> Result<Value, RuntimeError> {
        let method = b.bake().unwrap();
        run_method(&method, None, args)
    }

    #[test]
    fn test_arithmetic() {
        let mut b = MethodBuilder::new("m", 0);
        b.emit(Inst::I64(2));
        b.emit(Inst::I64(3));
        b.emit(Inst::Arith {
            op: BinaryOp::Mul,
            checked: false,
        });
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(6));
    }

    #[test]
    fn test_locals_roundtrip() {
        let mut b = MethodBuilder::new("m", 1);
        let l = b.declare_local(crate::tree::Type::Int);
        b.emit(Inst::LoadArg(0));
        b.emit(Inst::StoreLocal(l));
        b.emit(Inst::LoadLocal(l));
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[Value::Int(9)]).unwrap().to_int(), Some(9));
    }

    #[test]
    fn test_conditional_jump() {
        let mut b = MethodBuilder::new("m", 1);
        let else_l = b.define_label();
        b.emit(Inst::LoadArg(0));
        b.emit(Inst::JumpIfFalse(else_l));
        b.emit(Inst::I64(1));
        b.emit(Inst::Ret);
        b.mark_label(else_l).unwrap();
        b.emit(Inst::I64(0));
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[Value::Bool(true)]).unwrap().to_int(), Some(1));
    }

    #[test]
    fn test_throw_and_catch() {
        let mut b = MethodBuilder::new("m", 0);
        let result = b.declare_local(crate::tree::Type::Int);
        let end = b.define_label();
        b.begin_try();
        b.emit(Inst::I64(13));
        b.emit(Inst::Throw);
        b.emit(Inst::Leave(end));
        b.begin_catch().unwrap();
        // exception value is on the stack
        b.emit(Inst::I64(1));
        b.emit(Inst::Arith {
            op: BinaryOp::Add,
            checked: false,
        });
        b.emit(Inst::StoreLocal(result));
        b.emit(Inst::Leave(end));
        b.end_try().unwrap();
        b.mark_label(end).unwrap();
        b.emit(Inst::LoadLocal(result));
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(14));
    }

    #[test]
    fn test_finally_runs_on_leave() {
        let mut b = MethodBuilder::new("m", 0);
        let local = b.declare_local(crate::tree::Type::Int);
        let end = b.define_label();
        b.begin_try();
        b.emit(Inst::Leave(end));
        b.begin_finally().unwrap();
        b.emit(Inst::I64(7));
        b.emit(Inst::StoreLocal(local));
        b.emit(Inst::EndFinally);
        b.end_try().unwrap();
        b.mark_label(end).unwrap();
        b.emit(Inst::LoadLocal(local));
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(7));
    }

    #[test]
    fn test_finally_runs_during_unwind() {
        // try { throw } finally { local = 5 } -- error escapes, but the
        // finally must have run.
        let mut b = MethodBuilder::new("m", 0);
        let _local = b.declare_local(crate::tree::Type::Int);
        let end = b.define_label();
        b.begin_try();
        b.emit(Inst::I64(1));
        b.emit(Inst::Throw);
        b.emit(Inst::Leave(end));
        b.begin_finally().unwrap();
        b.emit(Inst::I64(5));
        b.emit(Inst::StoreLocal(0));
        b.emit(Inst::EndFinally);
        b.end_try().unwrap();
        b.mark_label(end).unwrap();
        b.emit(Inst::Null);
        b.emit(Inst::Ret);
        let err = run(b, &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Thrown(Value::Int(1))));
    }

    #[test]
    fn test_fault_runs_only_on_exception() {
        fn build(throwing: bool) -> MethodBuilder {
            let mut b = MethodBuilder::new("m", 0);
            let _marker = b.declare_local(crate::tree::Type::Int);
            let end = b.define_label();
            b.begin_try();
            b.begin_try();
            if throwing {
                b.emit(Inst::I64(1));
                b.emit(Inst::Throw);
            }
            b.emit(Inst::Leave(end));
            b.begin_fault().unwrap();
            b.emit(Inst::I64(9));
            b.emit(Inst::StoreLocal(0));
            b.emit(Inst::EndFinally);
            b.end_try().unwrap();
            b.emit(Inst::Leave(end));
            b.begin_catch().unwrap();
            b.emit(Inst::Pop);
            b.emit(Inst::Leave(end));
            b.end_try().unwrap();
            b.mark_label(end).unwrap();
            b.emit(Inst::LoadLocal(0));
            b.emit(Inst::Ret);
            b
        }
        assert_eq!(run(build(true), &[]).unwrap().to_int(), Some(9));
        assert!(run(build(false), &[]).unwrap().is_nil());
    }

    #[test]
    fn test_filter_selects_handler() {
        // try { throw 10 } catch when (ex == 1) { 100 } catch { 200 }
        let mut b = MethodBuilder::new("m", 0);
        let result = b.declare_local(crate::tree::Type::Int);
        let end = b.define_label();
        b.begin_try();
        b.emit(Inst::I64(10));
        b.emit(Inst::Throw);
        b.emit(Inst::Leave(end));
        b.begin_filter().unwrap();
        b.emit(Inst::I64(1));
        b.emit(Inst::Arith {
            op: BinaryOp::Eq,
            checked: false,
        });
        b.emit(Inst::EndFilter);
        b.begin_catch().unwrap();
        b.emit(Inst::Pop);
        b.emit(Inst::I64(100));
        b.emit(Inst::StoreLocal(result));
        b.emit(Inst::Leave(end));
        b.begin_catch().unwrap();
        b.emit(Inst::Pop);
        b.emit(Inst::I64(200));
        b.emit(Inst::StoreLocal(result));
        b.emit(Inst::Leave(end));
        b.end_try().unwrap();
        b.mark_label(end).unwrap();
        b.emit(Inst::LoadLocal(result));
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(200));
    }

    #[test]
    fn test_rethrow_escapes() {
        let mut b = MethodBuilder::new("m", 0);
        let end = b.define_label();
        b.begin_try();
        b.emit(Inst::I64(3));
        b.emit(Inst::Throw);
        b.emit(Inst::Leave(end));
        b.begin_catch().unwrap();
        b.emit(Inst::Pop);
        b.emit(Inst::Rethrow);
        b.end_try().unwrap();
        b.mark_label(end).unwrap();
        b.emit(Inst::Null);
        b.emit(Inst::Ret);
        let err = run(b, &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Thrown(Value::Int(3))));
    }

    #[test]
    fn test_record_and_cell_instructions() {
        let mut b = MethodBuilder::new("m", 0);
        b.emit(Inst::NewRecord(2));
        b.emit(Inst::Dup);
        b.emit(Inst::I64(5));
        b.emit(Inst::NewCell);
        b.emit(Inst::StoreField(1));
        b.emit(Inst::LoadField(1));
        b.emit(Inst::LoadCell);
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(5));
    }

    #[test]
    fn test_array_instructions() {
        let mut b = MethodBuilder::new("m", 0);
        b.emit(Inst::I64(1));
        b.emit(Inst::I64(2));
        b.emit(Inst::I64(3));
        b.emit(Inst::NewArray(3));
        b.emit(Inst::I64(1));
        b.emit(Inst::LoadIndex);
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(2));
    }

    #[test]
    fn test_jump_table_falls_through_out_of_range() {
        let mut b = MethodBuilder::new("m", 0);
        let case0 = b.define_label();
        b.emit(Inst::I64(5));
        b.emit(Inst::JumpTable(vec![case0].into_boxed_slice()));
        b.emit(Inst::I64(-1));
        b.emit(Inst::Ret);
        b.mark_label(case0).unwrap();
        b.emit(Inst::I64(0));
        b.emit(Inst::Ret);
        assert_eq!(run(b, &[]).unwrap().to_int(), Some(-1));
    }
}
