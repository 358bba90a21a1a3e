//! Runtime value representation and the objects that live as long as a
//! compiled callable: boxed cells, constants records, environments, and
//! native method handles.

pub mod ops;
pub mod records;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::emit::CompiledMethod;
use crate::tree::{ExprRef, Type};

pub use records::RuntimeVariables;

// ============================================================================
// Value
// ============================================================================

/// A runtime value. Scalars are stored inline; everything else is a
/// shared heap reference. All variants are `Send + Sync`; shared mutable
/// state goes through `RwLock`.
#[derive(Clone)]
pub enum Value {
    /// The null reference; also the absent case of nullable values and
    /// the result of void expressions where one is demanded.
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(Arc<BigInt>),
    Str(Arc<str>),
    Array(Arc<RwLock<Vec<Value>>>),
    Function(Arc<CompiledLambda>),
    /// A reified expression tree.
    Tree(ExprRef),
    /// A single-field shared cell aliasing a variable's storage.
    Cell(Arc<ValueCell>),
    /// A closure record or runtime-variables handle.
    Record(Arc<dyn RuntimeVariables>),
    /// An opaque object reference.
    Obj(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn big(n: impl Into<BigInt>) -> Value {
        Value::BigInt(Arc::new(n.into()))
    }

    pub fn obj<T: Any + Send + Sync>(value: T) -> Value {
        Value::Obj(Arc::new(value))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<RwLock<Vec<Value>>>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<CompiledLambda>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_tree(&self) -> Option<&ExprRef> {
        match self {
            Value::Tree(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<&Arc<ValueCell>> {
        match self {
            Value::Cell(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Arc<dyn RuntimeVariables>> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Downcast an opaque object reference.
    pub fn obj_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Obj(o) => o.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Whether the emitter can materialize this value from bytecode alone,
    /// with no constants-record slot.
    pub(crate) fn is_inline_emittable(&self) -> bool {
        matches!(
            self,
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    /// Reference identity for identity-bearing values; `None` for scalars.
    /// Bound-constant slots are shared by identity, never by structure.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::BigInt(p) => Some(Arc::as_ptr(p) as usize),
            Value::Str(p) => Some(Arc::as_ptr(p) as *const u8 as usize),
            Value::Array(p) => Some(Arc::as_ptr(p) as usize),
            Value::Function(p) => Some(Arc::as_ptr(p) as usize),
            Value::Tree(p) => Some(Arc::as_ptr(p) as usize),
            Value::Cell(p) => Some(Arc::as_ptr(p) as usize),
            Value::Record(p) => Some(Arc::as_ptr(p) as *const () as usize),
            Value::Obj(p) => Some(Arc::as_ptr(p) as *const () as usize),
            _ => None,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::BigInt(_) => "bigint",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
            Value::Tree(_) => "tree",
            Value::Cell(_) => "cell",
            Value::Record(_) => "record",
            Value::Obj(_) => "object",
        }
    }
}

/// Structural equality for scalars and strings, reference identity for
/// everything else. This is the equality used by `==` nodes and switch
/// dispatch.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::BigInt(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(a) => {
                let items = a.read().unwrap();
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Function(l) => write!(f, "{l}"),
            Value::Tree(t) => write!(f, "<tree {t}>"),
            Value::Cell(c) => write!(f, "<cell {}>", c.get()),
            Value::Record(r) => write!(f, "<record/{}>", r.len()),
            Value::Obj(_) => write!(f, "<object>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

// ============================================================================
// Cells
// ============================================================================

/// A single-field heap cell. Shared between generated code and quoted
/// trees so that both observe the same variable storage.
pub struct ValueCell {
    value: RwLock<Value>,
}

impl ValueCell {
    pub fn new(value: Value) -> Arc<ValueCell> {
        Arc::new(ValueCell {
            value: RwLock::new(value),
        })
    }

    pub fn get(&self) -> Value {
        self.value.read().unwrap().clone()
    }

    pub fn set(&self, value: Value) {
        *self.value.write().unwrap() = value;
    }
}

impl fmt::Debug for ValueCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueCell({})", self.get())
    }
}

// ============================================================================
// Native methods
// ============================================================================

type MethodFn = Box<dyn Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync>;

/// A callable method known to the compiler by handle: `Call` and `New`
/// nodes name one, and the runtime helpers are exposed to emitted code
/// through fixed handles of this type.
pub struct Method {
    name: String,
    arity: Option<usize>,
    f: MethodFn,
}

pub type MethodRef = Arc<Method>;

impl Method {
    pub fn new<F>(name: impl Into<String>, arity: Option<usize>, f: F) -> MethodRef
    where
        F: Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        Arc::new(Method {
            name: name.into(),
            arity,
            f: Box::new(f),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, RuntimeError> {
        if let Some(expected) = self.arity {
            if args.len() != expected {
                return Err(RuntimeError::Arity {
                    expected,
                    got: args.len(),
                });
            }
        }
        (self.f)(args)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({})", self.name)
    }
}

// ============================================================================
// Environment and the compiled callable
// ============================================================================

/// The bound constants of one lambda, frozen at delegate-build time.
pub struct ConstantsRecord {
    slots: Box<[Value]>,
}

impl ConstantsRecord {
    pub(crate) fn new(slots: Vec<Value>) -> Arc<ConstantsRecord> {
        Arc::new(ConstantsRecord {
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn empty() -> Arc<ConstantsRecord> {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Value> {
        self.slots.get(slot)
    }
}

impl fmt::Debug for ConstantsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConstantsRecord[{}]", self.slots.len())
    }
}

/// The environment threaded to a generated function: the lambda's own
/// constants plus the enclosing closure record nested lambdas reach
/// through. The top-level call carries no locals.
#[derive(Debug)]
pub struct Environment {
    pub constants: Arc<ConstantsRecord>,
    pub locals: Option<Value>,
}

/// A compiled lambda bound to its environment: the callable the compiler
/// returns, and the value `Function`-typed expressions evaluate to.
pub struct CompiledLambda {
    method: Arc<CompiledMethod>,
    env: Option<Arc<Environment>>,
}

impl CompiledLambda {
    pub(crate) fn new(
        method: Arc<CompiledMethod>,
        env: Option<Arc<Environment>>,
    ) -> Arc<CompiledLambda> {
        Arc::new(CompiledLambda { method, env })
    }

    pub fn name(&self) -> &str {
        self.method.name()
    }

    pub fn param_count(&self) -> usize {
        self.method.param_count()
    }

    /// Run the compiled body with the given arguments.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, RuntimeError> {
        if args.len() != self.method.param_count() {
            return Err(RuntimeError::Arity {
                expected: self.method.param_count(),
                got: args.len(),
            });
        }
        crate::exec::run_method(&self.method, self.env.as_ref(), args)
    }

    /// Instruction listing of the generated body, for debugging.
    pub fn disassemble(&self) -> String {
        self.method.disassemble()
    }
}

impl fmt::Display for CompiledLambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.method.name())
    }
}

impl fmt::Debug for CompiledLambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

// ============================================================================
// Runtime errors
// ============================================================================

/// A failure inside compiled code. The compiler adds no wrapping: these
/// propagate to the caller exactly as raised, and `Try` handlers observe
/// them as values via [`RuntimeError::to_value`].
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// An explicitly thrown value.
    Thrown(Value),
    Type {
        expected: &'static str,
        got: String,
    },
    Overflow,
    DivideByZero,
    IndexOutOfRange {
        index: i64,
        len: usize,
    },
    NullReference,
    Arity {
        expected: usize,
        got: usize,
    },
    /// A fault in the substrate itself; indicates an emitter bug.
    Internal(String),
}

impl RuntimeError {
    pub fn type_error(expected: &'static str, got: &Value) -> RuntimeError {
        RuntimeError::Type {
            expected,
            got: got.kind_name().to_string(),
        }
    }

    /// The value a catch clause binds for this error.
    pub fn to_value(&self) -> Value {
        match self {
            RuntimeError::Thrown(v) => v.clone(),
            other => Value::Str(other.to_string().into()),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Thrown(v) => write!(f, "thrown: {v}"),
            RuntimeError::Type { expected, got } => {
                write!(f, "type error: expected {expected}, got {got}")
            }
            RuntimeError::Overflow => write!(f, "arithmetic overflow"),
            RuntimeError::DivideByZero => write!(f, "division by zero"),
            RuntimeError::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            RuntimeError::NullReference => write!(f, "null reference"),
            RuntimeError::Arity { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            RuntimeError::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

// ============================================================================
// Arithmetic
// ============================================================================

/// Binary arithmetic with the node's checked/unchecked overflow policy.
/// Mixed int/bigint operands promote to bigint; mixed int/float promote
/// to float.
pub(crate) fn arith(
    op: crate::tree::BinaryOp,
    checked: bool,
    l: &Value,
    r: &Value,
) -> Result<Value, RuntimeError> {
    use crate::tree::BinaryOp as B;
    match op {
        B::Add | B::Sub | B::Mul | B::Div | B::Rem => numeric(op, checked, l, r),
        B::And | B::Or | B::Xor => bitwise(op, l, r),
        B::Shl | B::Shr => shift(op, l, r),
        B::Eq => Ok(Value::Bool(l == r)),
        B::Ne => Ok(Value::Bool(l != r)),
        B::Lt | B::Le | B::Gt | B::Ge => compare(op, l, r),
        B::AndAlso | B::OrElse => Err(RuntimeError::Internal(
            "short-circuit operators are lowered to branches".to_string(),
        )),
    }
}

fn numeric(
    op: crate::tree::BinaryOp,
    checked: bool,
    l: &Value,
    r: &Value,
) -> Result<Value, RuntimeError> {
    use crate::tree::BinaryOp as B;
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                B::Add => int_op(checked, a.checked_add(b), || a.wrapping_add(b)),
                B::Sub => int_op(checked, a.checked_sub(b), || a.wrapping_sub(b)),
                B::Mul => int_op(checked, a.checked_mul(b), || a.wrapping_mul(b)),
                B::Div => {
                    if b == 0 {
                        Err(RuntimeError::DivideByZero)
                    } else {
                        int_op(checked, a.checked_div(b), || a.wrapping_div(b))
                    }
                }
                B::Rem => {
                    if b == 0 {
                        Err(RuntimeError::DivideByZero)
                    } else {
                        int_op(checked, a.checked_rem(b), || a.wrapping_rem(b))
                    }
                }
                _ => unreachable!(),
            }
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(op, *a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(op, *a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(op, *a, *b as f64))),
        (Value::BigInt(_), _) | (_, Value::BigInt(_)) => {
            let a = as_bigint(l)?;
            let b = as_bigint(r)?;
            let result = match op {
                B::Add => &*a + &*b,
                B::Sub => &*a - &*b,
                B::Mul => &*a * &*b,
                B::Div => {
                    if b.as_ref() == &BigInt::from(0) {
                        return Err(RuntimeError::DivideByZero);
                    }
                    &*a / &*b
                }
                B::Rem => {
                    if b.as_ref() == &BigInt::from(0) {
                        return Err(RuntimeError::DivideByZero);
                    }
                    &*a % &*b
                }
                _ => unreachable!(),
            };
            Ok(Value::BigInt(Arc::new(result)))
        }
        _ => Err(RuntimeError::type_error("number", if l.to_int().is_some() || l.to_float().is_some() { r } else { l })),
    }
}

fn int_op(
    checked: bool,
    exact: Option<i64>,
    wrapping: impl FnOnce() -> i64,
) -> Result<Value, RuntimeError> {
    match exact {
        Some(n) => Ok(Value::Int(n)),
        None if checked => Err(RuntimeError::Overflow),
        None => Ok(Value::Int(wrapping())),
    }
}

fn float_op(op: crate::tree::BinaryOp, a: f64, b: f64) -> f64 {
    use crate::tree::BinaryOp as B;
    match op {
        B::Add => a + b,
        B::Sub => a - b,
        B::Mul => a * b,
        B::Div => a / b,
        B::Rem => a % b,
        _ => unreachable!(),
    }
}

fn as_bigint(v: &Value) -> Result<Arc<BigInt>, RuntimeError> {
    match v {
        Value::BigInt(b) => Ok(b.clone()),
        Value::Int(n) => Ok(Arc::new(BigInt::from(*n))),
        other => Err(RuntimeError::type_error("bigint", other)),
    }
}

fn bitwise(op: crate::tree::BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    use crate::tree::BinaryOp as B;
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            B::And => a & b,
            B::Or => a | b,
            B::Xor => a ^ b,
            _ => unreachable!(),
        })),
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
            B::And => a & b,
            B::Or => a | b,
            B::Xor => a ^ b,
            _ => unreachable!(),
        })),
        _ => Err(RuntimeError::type_error("int", l)),
    }
}

fn shift(op: crate::tree::BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    use crate::tree::BinaryOp as B;
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let amount = (*b & 0x3f) as u32;
            Ok(Value::Int(match op {
                B::Shl => a.wrapping_shl(amount),
                B::Shr => a.wrapping_shr(amount),
                _ => unreachable!(),
            }))
        }
        _ => Err(RuntimeError::type_error("int", l)),
    }
}

fn compare(op: crate::tree::BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    use crate::tree::BinaryOp as B;
    use std::cmp::Ordering;
    let ord = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a
            .partial_cmp(b)
            .unwrap_or(Ordering::Greater),
        (Value::Int(a), Value::Float(b)) => (*a as f64)
            .partial_cmp(b)
            .unwrap_or(Ordering::Greater),
        (Value::Float(a), Value::Int(b)) => a
            .partial_cmp(&(*b as f64))
            .unwrap_or(Ordering::Greater),
        (Value::BigInt(_), _) | (_, Value::BigInt(_)) => {
            let a = as_bigint(l)?;
            let b = as_bigint(r)?;
            a.cmp(&b)
        }
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        _ => return Err(RuntimeError::type_error("comparable", l)),
    };
    Ok(Value::Bool(match op {
        B::Lt => ord == Ordering::Less,
        B::Le => ord != Ordering::Greater,
        B::Gt => ord == Ordering::Greater,
        B::Ge => ord != Ordering::Less,
        _ => unreachable!(),
    }))
}

pub(crate) fn negate(checked: bool, v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => match n.checked_neg() {
            Some(m) => Ok(Value::Int(m)),
            None if checked => Err(RuntimeError::Overflow),
            None => Ok(Value::Int(n.wrapping_neg())),
        },
        Value::Float(x) => Ok(Value::Float(-x)),
        Value::BigInt(b) => Ok(Value::BigInt(Arc::new(-(&**b)))),
        other => Err(RuntimeError::type_error("number", other)),
    }
}

pub(crate) fn logical_not(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        Value::Int(n) => Ok(Value::Int(!n)),
        other => Err(RuntimeError::type_error("bool", other)),
    }
}

/// Conversion to a declared type. Checked conversions raise on narrowing
/// loss; unchecked conversions truncate.
pub(crate) fn convert(v: &Value, to: &Type, checked: bool) -> Result<Value, RuntimeError> {
    let target = to.non_nullable();
    if to.is_nullable() && v.is_nil() {
        return Ok(Value::Nil);
    }
    if v.is_nil() && !to.is_nullable() && !matches!(target, Type::Object | Type::Str | Type::Void) {
        return Err(RuntimeError::NullReference);
    }
    match (v, target) {
        (_, Type::Object) => Ok(v.clone()),
        (Value::Int(n), Type::Int) => Ok(Value::Int(*n)),
        (Value::Int(n), Type::Float) => Ok(Value::Float(*n as f64)),
        (Value::Int(n), Type::BigInt) => Ok(Value::big(*n)),
        (Value::Float(x), Type::Float) => Ok(Value::Float(*x)),
        (Value::Float(x), Type::Int) => {
            let t = x.trunc();
            if checked && (t < i64::MIN as f64 || t > i64::MAX as f64 || x.is_nan()) {
                Err(RuntimeError::Overflow)
            } else {
                Ok(Value::Int(t as i64))
            }
        }
        (Value::BigInt(b), Type::Int) => match b.to_i64() {
            Some(n) => Ok(Value::Int(n)),
            None if checked => Err(RuntimeError::Overflow),
            None => {
                let digit = b.iter_u64_digits().next().unwrap_or(0) as i64;
                Ok(Value::Int(if b.sign() == num_bigint::Sign::Minus {
                    digit.wrapping_neg()
                } else {
                    digit
                }))
            }
        },
        (Value::BigInt(b), Type::BigInt) => Ok(Value::BigInt(b.clone())),
        (Value::BigInt(b), Type::Float) => Ok(Value::Float(b.to_f64().unwrap_or(f64::INFINITY))),
        (Value::Bool(b), Type::Bool) => Ok(Value::Bool(*b)),
        (Value::Str(s), Type::Str) => Ok(Value::Str(s.clone())),
        (other, _) if !to.is_nullable() => {
            // Same-type identity conversions on reference values.
            Ok(other.clone())
        }
        (other, _) => Ok(other.clone()),
    }
}
