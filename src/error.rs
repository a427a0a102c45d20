//! Compile-time errors.
//!
//! Every failure during compilation is one of four kinds. All of them are
//! raised synchronously from the offending handler and unwind the whole
//! pipeline through `?`; partial IR is discarded by the caller.

use thiserror::Error;

use crate::sexpr::{Sexpr, SourceLoc};

#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed special form: wrong shape, wrong arity, or a
    /// toplevel-only form used in expression position.
    #[error("syntax error: {message}: {form}")]
    Syntax { message: String, form: Sexpr },

    /// An inlined or embedded call with the wrong number of arguments,
    /// detected at compile time.
    #[error("wrong number of arguments: {name} requires {}, but got {got}", required_arity(.required, .variadic))]
    Arity {
        name: String,
        required: usize,
        variadic: bool,
        got: usize,
    },

    /// Any other failure during compilation.
    #[error("compile error: {}{message}", .location.as_ref().map(|l| format!("{l}: ")).unwrap_or_default())]
    Compile {
        message: String,
        location: Option<SourceLoc>,
    },

    /// Invariant violation inside the compiler. Indicates a bug.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

fn required_arity(required: &usize, variadic: &bool) -> String {
    if *variadic {
        format!("{required} or more")
    } else {
        required.to_string()
    }
}

impl CompileError {
    pub fn syntax(message: impl Into<String>, form: &Sexpr) -> Self {
        Self::Syntax {
            message: message.into(),
            form: form.clone(),
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
            location: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Attach a source location if the error does not carry one yet.
    pub fn with_location(self, location: Option<SourceLoc>) -> Self {
        match self {
            Self::Compile {
                message,
                location: None,
            } => Self::Compile { message, location },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexpr::Sexpr;

    #[test]
    fn arity_error_mentions_expectations() {
        let e = CompileError::Arity {
            name: "car".into(),
            required: 1,
            variadic: false,
            got: 2,
        };
        let msg = e.to_string();
        assert!(msg.contains("car"));
        assert!(msg.contains('1'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn syntax_error_carries_the_form() {
        let e = CompileError::syntax("malformed if", &Sexpr::Fixnum(7));
        assert!(e.to_string().contains('7'));
    }
}
