//! The compilation pipeline: stack spiller, constant allocator,
//! variable binder, lambda emitter, and delegate assembly.
//!
//! `compile` takes a validated lambda tree and returns a callable bound
//! to its environment. All compile-time failures are fatal and leave no
//! partial artifact; runtime failures inside the produced callable
//! propagate unwrapped.

pub(crate) mod binder;
pub(crate) mod constants;
pub(crate) mod delegate;
pub mod error;
pub(crate) mod free_vars;
pub(crate) mod lambda;
pub(crate) mod spiller;
pub(crate) mod stack_guard;

use std::sync::Arc;

use crate::runtime::CompiledLambda;
use crate::tree::ExprRef;

pub use error::{CompileError, CompileErrorKind};

/// Tuning knobs for a compilation.
#[derive(Clone, Debug)]
pub struct CompilerOptions {
    /// Copy a bound constant into a local when it is read at least this
    /// many times. The default threshold of 3 is a heuristic: too eager
    /// inside branches, too shy inside loops.
    pub constant_cache_threshold: usize,
    /// Use hash-table dispatch for string switches with at least this
    /// many case values; fewer compare linearly.
    pub string_switch_threshold: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            constant_cache_threshold: 3,
            string_switch_threshold: 7,
        }
    }
}

/// Compile a lambda tree into a callable.
///
/// The tree must be a well-formed, validated lambda; invoking the
/// result with arguments matching the lambda's signature executes the
/// tree's semantics.
///
/// # Example
/// ```
/// use arbor::{compile, Expr, Type, Value, Var};
///
/// let x = Var::new("x", Type::Int);
/// let lam = Expr::lambda(None, vec![x.clone()], Type::Int,
///     Expr::add(Expr::variable(&x), Expr::int(1)));
/// let f = compile(&lam).unwrap();
/// assert_eq!(f.invoke(&[Value::Int(41)]).unwrap().to_int(), Some(42));
/// ```
pub fn compile(tree: &ExprRef) -> Result<Arc<CompiledLambda>, CompileError> {
    compile_with_options(tree, &CompilerOptions::default())
}

/// Compile with explicit options.
pub fn compile_with_options(
    tree: &ExprRef,
    options: &CompilerOptions,
) -> Result<Arc<CompiledLambda>, CompileError> {
    let spilled = spiller::spill(tree)?;
    let mut plan = constants::allocate(&spilled, options)?;
    let analysis = binder::analyze(&spilled)?;
    let (method, record) = lambda::compile_lambda(&mut plan, &analysis, options, &spilled)?;
    Ok(delegate::build(method, record))
}
