//! Expression tree data model.
//!
//! Trees are immutable once built: every node is an [`Expr`] behind an
//! `Arc`, carrying a kind, a declared type, and a node id stamped at
//! construction. The compiler never mutates a tree; all analysis results
//! live in side tables keyed by [`NodeId`]. Variable identity is the
//! variable's id, never its diagnostic name.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::runtime::{RuntimeError, Value, ValueCell};

// ============================================================================
// Identity
// ============================================================================

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LABEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a tree node. Unique per constructed node for the lifetime
/// of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

/// Identity of a variable declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(u64);

fn fresh_node_id() -> NodeId {
    NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
}

// ============================================================================
// Types
// ============================================================================

/// Static type of an expression or variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int,
    Float,
    BigInt,
    Str,
    /// Any runtime value; the null reference inhabits this type.
    Object,
    /// A value of the inner type, or absent.
    Nullable(Box<Type>),
    Array(Box<Type>),
    Function(Arc<FnSig>),
    /// A reified expression tree.
    Tree,
    /// An indexable runtime-variables handle.
    Variables,
}

impl Type {
    pub fn nullable(inner: Type) -> Type {
        Type::Nullable(Box::new(inner))
    }

    pub fn array(element: Type) -> Type {
        Type::Array(Box::new(element))
    }

    /// Strip one layer of `Nullable`, if present.
    pub fn non_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Whether a value of `from` is acceptable where `self` is expected,
    /// without an explicit conversion.
    pub fn accepts(&self, from: &Type) -> bool {
        self == from
            || matches!(self, Type::Object)
            || matches!(self, Type::Nullable(inner) if inner.as_ref() == from)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::BigInt => write!(f, "bigint"),
            Type::Str => write!(f, "str"),
            Type::Object => write!(f, "object"),
            Type::Nullable(inner) => write!(f, "{inner}?"),
            Type::Array(elem) => write!(f, "[{elem}]"),
            Type::Function(sig) => write!(f, "{sig}"),
            Type::Tree => write!(f, "tree"),
            Type::Variables => write!(f, "variables"),
        }
    }
}

/// A function signature. Signatures are interned through the global
/// signature cache so that `Type::Function` comparisons are cheap and
/// identical signatures share one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnSig {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl fmt::Display for FnSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

// ============================================================================
// Variables and Labels
// ============================================================================

/// A variable declaration. Declared in exactly one scope (a block's
/// declarations, a lambda's parameters, or a catch clause); every use
/// must be lexically inside that scope.
#[derive(Debug)]
pub struct Var {
    id: VarId,
    name: String,
    ty: Type,
    by_ref: bool,
}

pub type VarRef = Arc<Var>;

impl Var {
    pub fn new(name: impl Into<String>, ty: Type) -> VarRef {
        Arc::new(Var {
            id: VarId(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            ty,
            by_ref: false,
        })
    }

    pub fn new_by_ref(name: impl Into<String>, ty: Type) -> VarRef {
        Arc::new(Var {
            id: VarId(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            ty,
            by_ref: true,
        })
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn is_by_ref(&self) -> bool {
        self.by_ref
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "$v{}", self.id.0)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Target of a labelled jump. Carries the type of the value the jump
/// transfers, `Void` for plain jumps.
#[derive(Debug)]
pub struct LabelTarget {
    id: u64,
    name: String,
    ty: Type,
}

pub type LabelRef = Arc<LabelTarget>;

impl LabelTarget {
    pub fn new(name: impl Into<String>, ty: Type) -> LabelRef {
        Arc::new(LabelTarget {
            id: NEXT_LABEL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ty,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }
}

// ============================================================================
// Node kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// Short-circuiting boolean and.
    AndAlso,
    /// Short-circuiting boolean or.
    OrElse,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_short_circuit(&self) -> bool {
        matches!(self, BinaryOp::AndAlso | BinaryOp::OrElse)
    }

    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::AndAlso => "&&",
            BinaryOp::OrElse => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    /// Conversion to the node's declared type.
    Convert,
    PreIncrementAssign,
    PreDecrementAssign,
    PostIncrementAssign,
    PostDecrementAssign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GotoKind {
    Goto,
    Break,
    Continue,
}

/// One handler of a `Try` node. The clause variable, when present, is a
/// scope of its own covering both the filter and the body.
#[derive(Debug, Clone)]
pub struct CatchClause {
    pub(crate) id: NodeId,
    pub var: Option<VarRef>,
    pub filter: Option<ExprRef>,
    pub body: ExprRef,
}

impl CatchClause {
    pub fn new(var: Option<VarRef>, body: ExprRef) -> CatchClause {
        CatchClause {
            id: fresh_node_id(),
            var,
            filter: None,
            body,
        }
    }

    pub fn with_filter(mut self, filter: ExprRef) -> CatchClause {
        self.filter = Some(filter);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    /// Constant test values; the case fires when the scrutinee equals any
    /// of them.
    pub values: Vec<Value>,
    pub body: ExprRef,
}

impl SwitchCase {
    pub fn new(values: Vec<Value>, body: ExprRef) -> SwitchCase {
        SwitchCase { values, body }
    }
}

/// Binder of a `Dynamic` node: late-bound call semantics supplied by the
/// caller. A call site wrapping the binder is created once, at constant
/// allocation time, and shared by every invocation of the generated code.
pub trait DynamicBinder: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn bind(&self, args: &[Value]) -> Result<Value, RuntimeError>;
}

/// Body and parameters of a lambda node.
#[derive(Debug)]
pub struct LambdaNode {
    pub name: Option<String>,
    pub params: Vec<VarRef>,
    pub body: ExprRef,
    pub ret: Type,
    pub sig: Arc<FnSig>,
}

pub type LambdaRef = Arc<LambdaNode>;

#[derive(Debug, Clone)]
pub enum ExprKind {
    Constant(Value),
    Variable(VarRef),
    Block {
        vars: Vec<VarRef>,
        exprs: Vec<ExprRef>,
    },
    Lambda(LambdaRef),
    Invoke {
        target: ExprRef,
        args: Vec<ExprRef>,
    },
    Call {
        method: crate::runtime::MethodRef,
        args: Vec<ExprRef>,
    },
    New {
        ctor: crate::runtime::MethodRef,
        args: Vec<ExprRef>,
    },
    NewArray {
        items: Vec<ExprRef>,
    },
    Index {
        array: ExprRef,
        index: ExprRef,
    },
    Assign {
        target: ExprRef,
        value: ExprRef,
    },
    Binary {
        op: BinaryOp,
        checked: bool,
        lhs: ExprRef,
        rhs: ExprRef,
    },
    Unary {
        op: UnaryOp,
        checked: bool,
        operand: ExprRef,
    },
    Conditional {
        test: ExprRef,
        if_true: ExprRef,
        if_false: ExprRef,
    },
    Loop {
        body: ExprRef,
        break_label: Option<LabelRef>,
        continue_label: Option<LabelRef>,
    },
    Label {
        target: LabelRef,
        default: Option<ExprRef>,
    },
    Goto {
        kind: GotoKind,
        target: LabelRef,
        value: Option<ExprRef>,
    },
    Try {
        body: ExprRef,
        handlers: Vec<CatchClause>,
        finally: Option<ExprRef>,
        fault: Option<ExprRef>,
    },
    Switch {
        value: ExprRef,
        cases: Vec<SwitchCase>,
        default: Option<ExprRef>,
    },
    Throw {
        /// `None` rethrows the exception of the innermost enclosing catch.
        value: Option<ExprRef>,
    },
    Quote {
        operand: ExprRef,
    },
    RuntimeVariables {
        vars: Vec<VarRef>,
    },
    Dynamic {
        binder: Arc<dyn DynamicBinder>,
        args: Vec<ExprRef>,
    },
    /// A variable reference re-bound to a shared cell. Produced by the
    /// quote helper; never built by collaborators directly.
    CellRef {
        cell: Arc<ValueCell>,
    },
}

// ============================================================================
// Expr
// ============================================================================

/// An expression tree node: a kind, a declared type, and an identity.
#[derive(Debug)]
pub struct Expr {
    id: NodeId,
    ty: Type,
    kind: ExprKind,
}

pub type ExprRef = Arc<Expr>;

impl Expr {
    fn make(ty: Type, kind: ExprKind) -> ExprRef {
        Arc::new(Expr {
            id: fresh_node_id(),
            ty,
            kind,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    /// Rebuild a node with an explicit type, preserving the declared type
    /// of an original node across tree rewrites.
    pub(crate) fn rebuild(ty: Type, kind: ExprKind) -> ExprRef {
        Self::make(ty, kind)
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    /// A constant with an explicit declared type.
    pub fn constant(value: Value, ty: Type) -> ExprRef {
        Self::make(ty, ExprKind::Constant(value))
    }

    pub fn int(n: i64) -> ExprRef {
        Self::constant(Value::Int(n), Type::Int)
    }

    pub fn float(x: f64) -> ExprRef {
        Self::constant(Value::Float(x), Type::Float)
    }

    pub fn boolean(b: bool) -> ExprRef {
        Self::constant(Value::Bool(b), Type::Bool)
    }

    pub fn string(s: impl Into<Arc<str>>) -> ExprRef {
        Self::constant(Value::Str(s.into()), Type::Str)
    }

    /// The null reference, typed as the given type.
    pub fn nil(ty: Type) -> ExprRef {
        Self::constant(Value::Nil, ty)
    }

    pub fn variable(var: &VarRef) -> ExprRef {
        Self::make(var.ty().clone(), ExprKind::Variable(var.clone()))
    }

    /// A block with its own variable scope. Evaluates to the value of the
    /// last expression, `Void` when empty.
    pub fn block(vars: Vec<VarRef>, exprs: Vec<ExprRef>) -> ExprRef {
        let ty = exprs.last().map(|e| e.ty().clone()).unwrap_or(Type::Void);
        Self::make(ty, ExprKind::Block { vars, exprs })
    }

    pub fn lambda(
        name: Option<&str>,
        params: Vec<VarRef>,
        ret: Type,
        body: ExprRef,
    ) -> ExprRef {
        let sig = crate::compiler::delegate::signature(
            params.iter().map(|p| p.ty().clone()).collect(),
            ret.clone(),
        );
        let ty = Type::Function(sig.clone());
        Self::make(
            ty,
            ExprKind::Lambda(Arc::new(LambdaNode {
                name: name.map(str::to_owned),
                params,
                body,
                ret,
                sig,
            })),
        )
    }

    pub fn invoke(target: ExprRef, args: Vec<ExprRef>) -> ExprRef {
        let ty = match target.ty() {
            Type::Function(sig) => sig.ret.clone(),
            _ => Type::Object,
        };
        Self::make(ty, ExprKind::Invoke { target, args })
    }

    pub fn call(method: crate::runtime::MethodRef, ret: Type, args: Vec<ExprRef>) -> ExprRef {
        Self::make(ret, ExprKind::Call { method, args })
    }

    pub fn new_object(
        ctor: crate::runtime::MethodRef,
        ty: Type,
        args: Vec<ExprRef>,
    ) -> ExprRef {
        Self::make(ty, ExprKind::New { ctor, args })
    }

    pub fn new_array(element: Type, items: Vec<ExprRef>) -> ExprRef {
        Self::make(Type::array(element), ExprKind::NewArray { items })
    }

    pub fn index(array: ExprRef, index: ExprRef) -> ExprRef {
        let ty = match array.ty() {
            Type::Array(elem) => elem.as_ref().clone(),
            _ => Type::Object,
        };
        Self::make(ty, ExprKind::Index { array, index })
    }

    /// Assignment. The target must be a variable, an index expression, or
    /// a cell reference; anything else is rejected at compile time.
    pub fn assign(target: ExprRef, value: ExprRef) -> ExprRef {
        let ty = target.ty().clone();
        Self::make(ty, ExprKind::Assign { target, value })
    }

    pub fn binary(op: BinaryOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        let ty = binary_result_type(op, lhs.ty(), rhs.ty());
        Self::make(
            ty,
            ExprKind::Binary {
                op,
                checked: false,
                lhs,
                rhs,
            },
        )
    }

    /// Arithmetic with overflow detection; overflow raises at runtime.
    pub fn binary_checked(op: BinaryOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        let ty = binary_result_type(op, lhs.ty(), rhs.ty());
        Self::make(
            ty,
            ExprKind::Binary {
                op,
                checked: true,
                lhs,
                rhs,
            },
        )
    }

    pub fn add(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn negate(operand: ExprRef) -> ExprRef {
        let ty = operand.ty().clone();
        Self::make(
            ty,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                checked: false,
                operand,
            },
        )
    }

    pub fn not(operand: ExprRef) -> ExprRef {
        let ty = operand.ty().clone();
        Self::make(
            ty,
            ExprKind::Unary {
                op: UnaryOp::Not,
                checked: false,
                operand,
            },
        )
    }

    pub fn convert(operand: ExprRef, to: Type) -> ExprRef {
        Self::make(
            to,
            ExprKind::Unary {
                op: UnaryOp::Convert,
                checked: false,
                operand,
            },
        )
    }

    pub fn convert_checked(operand: ExprRef, to: Type) -> ExprRef {
        Self::make(
            to,
            ExprKind::Unary {
                op: UnaryOp::Convert,
                checked: true,
                operand,
            },
        )
    }

    pub fn increment(op: UnaryOp, var: &VarRef) -> ExprRef {
        debug_assert!(matches!(
            op,
            UnaryOp::PreIncrementAssign
                | UnaryOp::PreDecrementAssign
                | UnaryOp::PostIncrementAssign
                | UnaryOp::PostDecrementAssign
        ));
        let operand = Self::variable(var);
        let ty = operand.ty().clone();
        Self::make(
            ty,
            ExprKind::Unary {
                op,
                checked: false,
                operand,
            },
        )
    }

    pub fn condition(test: ExprRef, if_true: ExprRef, if_false: ExprRef) -> ExprRef {
        let ty = if_true.ty().clone();
        Self::make(
            ty,
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            },
        )
    }

    /// `if` without an `else`; the node is void-typed.
    pub fn if_then(test: ExprRef, then: ExprRef) -> ExprRef {
        Self::make(
            Type::Void,
            ExprKind::Conditional {
                test,
                if_true: then,
                if_false: Self::make(Type::Void, ExprKind::Block {
                    vars: Vec::new(),
                    exprs: Vec::new(),
                }),
            },
        )
    }

    /// An infinite loop, exited through its break label. The loop's type
    /// is the break label's type.
    pub fn loop_(
        body: ExprRef,
        break_label: Option<LabelRef>,
        continue_label: Option<LabelRef>,
    ) -> ExprRef {
        let ty = break_label
            .as_ref()
            .map(|l| l.ty().clone())
            .unwrap_or(Type::Void);
        Self::make(
            ty,
            ExprKind::Loop {
                body,
                break_label,
                continue_label,
            },
        )
    }

    pub fn label(target: LabelRef, default: Option<ExprRef>) -> ExprRef {
        let ty = target.ty().clone();
        Self::make(ty, ExprKind::Label { target, default })
    }

    pub fn goto(target: LabelRef, value: Option<ExprRef>) -> ExprRef {
        Self::make(
            Type::Void,
            ExprKind::Goto {
                kind: GotoKind::Goto,
                target,
                value,
            },
        )
    }

    pub fn break_(target: LabelRef, value: Option<ExprRef>) -> ExprRef {
        Self::make(
            Type::Void,
            ExprKind::Goto {
                kind: GotoKind::Break,
                target,
                value,
            },
        )
    }

    pub fn continue_(target: LabelRef) -> ExprRef {
        Self::make(
            Type::Void,
            ExprKind::Goto {
                kind: GotoKind::Continue,
                target,
                value: None,
            },
        )
    }

    pub fn try_catch(body: ExprRef, handlers: Vec<CatchClause>) -> ExprRef {
        let ty = body.ty().clone();
        Self::make(
            ty,
            ExprKind::Try {
                body,
                handlers,
                finally: None,
                fault: None,
            },
        )
    }

    pub fn try_finally(body: ExprRef, finally: ExprRef) -> ExprRef {
        let ty = body.ty().clone();
        Self::make(
            ty,
            ExprKind::Try {
                body,
                handlers: Vec::new(),
                finally: Some(finally),
                fault: None,
            },
        )
    }

    pub fn try_catch_finally(
        body: ExprRef,
        handlers: Vec<CatchClause>,
        finally: ExprRef,
    ) -> ExprRef {
        let ty = body.ty().clone();
        Self::make(
            ty,
            ExprKind::Try {
                body,
                handlers,
                finally: Some(finally),
                fault: None,
            },
        )
    }

    /// A try whose handler runs only when the body raises, then rethrows.
    pub fn try_fault(body: ExprRef, fault: ExprRef) -> ExprRef {
        let ty = body.ty().clone();
        Self::make(
            ty,
            ExprKind::Try {
                body,
                handlers: Vec::new(),
                finally: None,
                fault: Some(fault),
            },
        )
    }

    pub fn switch(
        value: ExprRef,
        cases: Vec<SwitchCase>,
        default: Option<ExprRef>,
    ) -> ExprRef {
        let ty = cases
            .first()
            .map(|c| c.body.ty().clone())
            .unwrap_or(Type::Void);
        Self::make(
            ty,
            ExprKind::Switch {
                value,
                cases,
                default,
            },
        )
    }

    pub fn throw(value: ExprRef) -> ExprRef {
        Self::make(Type::Void, ExprKind::Throw { value: Some(value) })
    }

    pub fn rethrow() -> ExprRef {
        Self::make(Type::Void, ExprKind::Throw { value: None })
    }

    /// Reify the operand as a tree value at runtime, with free variables
    /// re-bound to shared cells aliasing the enclosing lambda's storage.
    pub fn quote(operand: ExprRef) -> ExprRef {
        Self::make(Type::Tree, ExprKind::Quote { operand })
    }

    pub fn runtime_variables(vars: Vec<VarRef>) -> ExprRef {
        Self::make(Type::Variables, ExprKind::RuntimeVariables { vars })
    }

    pub fn dynamic(binder: Arc<dyn DynamicBinder>, ret: Type, args: Vec<ExprRef>) -> ExprRef {
        Self::make(ret, ExprKind::Dynamic { binder, args })
    }

    pub(crate) fn cell_ref(cell: Arc<ValueCell>, ty: Type) -> ExprRef {
        Self::make(ty, ExprKind::CellRef { cell })
    }

    /// The lambda payload, if this node is a lambda.
    pub fn as_lambda(&self) -> Option<&LambdaRef> {
        match &self.kind {
            ExprKind::Lambda(node) => Some(node),
            _ => None,
        }
    }
}

/// Result type of a binary node: comparisons yield `Bool` (ordered
/// comparisons on nullable operands yield `Nullable<Bool>`); arithmetic
/// on a nullable operand re-wraps, everything else takes the left
/// operand's type.
fn binary_result_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Type {
    let lifted = lhs.is_nullable() || rhs.is_nullable();
    if op.is_comparison() {
        if lifted && !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            Type::nullable(Type::Bool)
        } else {
            Type::Bool
        }
    } else if op.is_short_circuit() {
        Type::Bool
    } else if lifted {
        Type::nullable(lhs.non_nullable().clone())
    } else {
        lhs.clone()
    }
}

// ============================================================================
// Display
// ============================================================================

const MAX_DISPLAY_DEPTH: usize = 24;

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_expr(self, f, 0)
    }
}

fn fmt_expr(expr: &Expr, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    if depth > MAX_DISPLAY_DEPTH {
        return write!(f, "...");
    }
    let d = depth + 1;
    match expr.kind() {
        ExprKind::Constant(v) => write!(f, "{v}"),
        ExprKind::Variable(var) => write!(f, "{var}"),
        ExprKind::Block { exprs, .. } => {
            write!(f, "(block")?;
            for e in exprs {
                write!(f, " ")?;
                fmt_expr(e, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::Lambda(node) => {
            write!(f, "(lambda (")?;
            for (i, p) in node.params.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{p}")?;
            }
            write!(f, ") ")?;
            fmt_expr(&node.body, f, d)?;
            write!(f, ")")
        }
        ExprKind::Invoke { target, args } => {
            write!(f, "(invoke ")?;
            fmt_expr(target, f, d)?;
            for a in args {
                write!(f, " ")?;
                fmt_expr(a, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::Call { method, args } => {
            write!(f, "({}", method.name())?;
            for a in args {
                write!(f, " ")?;
                fmt_expr(a, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::New { ctor, args } => {
            write!(f, "(new {}", ctor.name())?;
            for a in args {
                write!(f, " ")?;
                fmt_expr(a, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::NewArray { items } => {
            write!(f, "(array")?;
            for a in items {
                write!(f, " ")?;
                fmt_expr(a, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::Index { array, index } => {
            write!(f, "(index ")?;
            fmt_expr(array, f, d)?;
            write!(f, " ")?;
            fmt_expr(index, f, d)?;
            write!(f, ")")
        }
        ExprKind::Assign { target, value } => {
            write!(f, "(set ")?;
            fmt_expr(target, f, d)?;
            write!(f, " ")?;
            fmt_expr(value, f, d)?;
            write!(f, ")")
        }
        ExprKind::Binary { op, lhs, rhs, .. } => {
            write!(f, "({} ", op.symbol())?;
            fmt_expr(lhs, f, d)?;
            write!(f, " ")?;
            fmt_expr(rhs, f, d)?;
            write!(f, ")")
        }
        ExprKind::Unary { op, operand, .. } => {
            let name = match op {
                UnaryOp::Neg => "neg",
                UnaryOp::Not => "not",
                UnaryOp::Convert => "convert",
                UnaryOp::PreIncrementAssign => "pre-inc",
                UnaryOp::PreDecrementAssign => "pre-dec",
                UnaryOp::PostIncrementAssign => "post-inc",
                UnaryOp::PostDecrementAssign => "post-dec",
            };
            write!(f, "({name} ")?;
            fmt_expr(operand, f, d)?;
            write!(f, ")")
        }
        ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } => {
            write!(f, "(if ")?;
            fmt_expr(test, f, d)?;
            write!(f, " ")?;
            fmt_expr(if_true, f, d)?;
            write!(f, " ")?;
            fmt_expr(if_false, f, d)?;
            write!(f, ")")
        }
        ExprKind::Loop { body, .. } => {
            write!(f, "(loop ")?;
            fmt_expr(body, f, d)?;
            write!(f, ")")
        }
        ExprKind::Label { target, .. } => write!(f, "(label {})", target.name()),
        ExprKind::Goto { target, value, .. } => {
            write!(f, "(goto {}", target.name())?;
            if let Some(v) = value {
                write!(f, " ")?;
                fmt_expr(v, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::Try { body, .. } => {
            write!(f, "(try ")?;
            fmt_expr(body, f, d)?;
            write!(f, " ...)")
        }
        ExprKind::Switch { value, cases, .. } => {
            write!(f, "(switch ")?;
            fmt_expr(value, f, d)?;
            write!(f, " [{} cases])", cases.len())
        }
        ExprKind::Throw { value: Some(v) } => {
            write!(f, "(throw ")?;
            fmt_expr(v, f, d)?;
            write!(f, ")")
        }
        ExprKind::Throw { value: None } => write!(f, "(rethrow)"),
        ExprKind::Quote { operand } => {
            write!(f, "(quote ")?;
            fmt_expr(operand, f, d)?;
            write!(f, ")")
        }
        ExprKind::RuntimeVariables { vars } => {
            write!(f, "(runtime-variables")?;
            for v in vars {
                write!(f, " {v}")?;
            }
            write!(f, ")")
        }
        ExprKind::Dynamic { binder, args } => {
            write!(f, "(dynamic {}", binder.name())?;
            for a in args {
                write!(f, " ")?;
                fmt_expr(a, f, d)?;
            }
            write!(f, ")")
        }
        ExprKind::CellRef { .. } => write!(f, "(cell-ref)"),
    }
}
