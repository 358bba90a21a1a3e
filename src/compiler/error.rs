//! Compile-time error types.

use std::fmt;

use crate::emit::EmitError;
use crate::tree::Expr;

/// Categories of compilation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Malformed tree: a caller bug such as a variable used outside its
    /// declaring scope or a goto with no matching label.
    InvalidOperation,
    /// A live constant the substrate cannot materialize.
    CannotCompileConstant,
    /// A construct the emitter cannot realize.
    ExpressionNotSupported,
    /// A fault in the compiler itself.
    Internal,
}

/// A compilation failure with context. Compile errors are fatal: the
/// compilation leaves no partial artifact and is never retried.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// The category of error
    pub kind: CompileErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The expression that caused the error (if available)
    pub expression: Option<String>,
    /// Suggestion for how to fix or work around the error
    pub suggestion: Option<String>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            expression: None,
            suggestion: None,
        }
    }

    /// Add expression context to the error.
    pub fn with_expression(mut self, expr: &Expr) -> Self {
        self.expression = Some(expr.to_string());
        self
    }

    /// Add a suggestion for fixing the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Create an invalid-operation error.
    pub fn invalid(what: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::InvalidOperation, what)
    }

    /// Create an unsupported-expression error.
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::ExpressionNotSupported, what)
    }

    /// Create a cannot-compile-constant error.
    pub fn constant(what: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::CannotCompileConstant, what)
    }

    /// Create an internal compiler error.
    pub fn internal(what: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Internal, what)
    }
}

/// Byte budget for expression context in error messages.
const MAX_CONTEXT: usize = 72;

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref expr) = self.expression {
            write!(f, " in: ")?;
            if expr.len() <= MAX_CONTEXT {
                write!(f, "{expr}")?;
            } else {
                // Oversized context is cut at a token boundary.
                let mut cut = 0;
                let mut last_space = None;
                for (i, c) in expr.char_indices() {
                    if i >= MAX_CONTEXT {
                        break;
                    }
                    if c.is_whitespace() {
                        last_space = Some(i);
                    }
                    cut = i + c.len_utf8();
                }
                write!(f, "{} ...", &expr[..last_space.unwrap_or(cut)])?;
            }
        }
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

impl From<EmitError> for CompileError {
    fn from(err: EmitError) -> CompileError {
        CompileError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Expr;

    #[test]
    fn test_display_plain() {
        let err = CompileError::invalid("undeclared variable 'x'");
        assert_eq!(err.to_string(), "undeclared variable 'x'");
    }

    #[test]
    fn test_display_with_suggestion() {
        let err = CompileError::not_supported("by-ref parameter")
            .with_suggestion("pass a cell instead");
        assert!(err.to_string().contains("pass a cell"));
    }

    #[test]
    fn test_display_with_expression() {
        let err =
            CompileError::invalid("bad node").with_expression(&Expr::add(Expr::int(1), Expr::int(2)));
        assert!(err.to_string().contains("(+ 1 2)"));
    }

    #[test]
    fn test_kind() {
        assert_eq!(
            CompileError::constant("x").kind,
            CompileErrorKind::CannotCompileConstant
        );
    }

    #[test]
    fn test_long_expression_is_cut_at_a_token_boundary() {
        let mut e = Expr::int(0);
        for _ in 0..40 {
            e = Expr::add(e, Expr::int(1));
        }
        let err = CompileError::invalid("deep").with_expression(&e);
        let rendered = err.to_string();
        assert!(rendered.len() < 200);
        assert!(rendered.ends_with("..."));
        // The cut lands between tokens, not inside one.
        let context = rendered
            .split(" in: ")
            .nth(1)
            .and_then(|rest| rest.strip_suffix(" ..."))
            .expect("cut context");
        assert!(!context.ends_with(char::is_whitespace));
    }
}
