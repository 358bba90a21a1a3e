pub mod compiler;
pub mod emit;
pub mod exec;
pub mod runtime;
pub mod tree;

// Re-export commonly used items for convenience
pub use compiler::{compile, compile_with_options, CompileError, CompileErrorKind, CompilerOptions};
pub use runtime::{CompiledLambda, Method, RuntimeError, RuntimeVariables, Value};
pub use tree::{
    BinaryOp, CatchClause, DynamicBinder, Expr, ExprKind, ExprRef, GotoKind, Type, UnaryOp, Var,
};
