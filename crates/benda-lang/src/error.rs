pub mod compile;
pub mod runtime;

use miette::Diagnostic;

use crate::Value;
use compile::CompileError;
use runtime::RuntimeError;

/// Error returned to host code by every engine entry point.
#[derive(PartialEq, Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("\"{function}\" differs: compiled {compiled}, interpreted {reference}")]
    Mismatch {
        function: String,
        compiled: Value,
        reference: Value,
    },
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl Error {
    pub fn is_compile_error(&self) -> bool {
        matches!(self, Error::Compile(_))
    }
}

impl Diagnostic for Error {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let c = match self {
            Error::Compile(CompileError::TypeError(_)) => "CompileError::TypeError",
            Error::Compile(CompileError::MatchCompilationError { .. }) => {
                "CompileError::MatchCompilationError"
            }
            Error::Compile(CompileError::UnsupportedConstruct(_, _)) => {
                "CompileError::UnsupportedConstruct"
            }
            Error::Compile(CompileError::UndefinedFunction(_)) => "CompileError::UndefinedFunction",
            Error::Compile(CompileError::UndefinedVariable(_, _)) => {
                "CompileError::UndefinedVariable"
            }
            Error::Compile(CompileError::ArityMismatch(_, _, _)) => "CompileError::ArityMismatch",
            Error::Runtime(RuntimeError::DivisionByZero) => "RuntimeError::DivisionByZero",
            Error::Runtime(RuntimeError::HostFunction(_, _)) => "RuntimeError::HostFunction",
            Error::Runtime(RuntimeError::TypeMismatch(_, _)) => "RuntimeError::TypeMismatch",
            Error::Runtime(RuntimeError::ArityMismatch(_, _, _)) => "RuntimeError::ArityMismatch",
            Error::Runtime(RuntimeError::UndefinedVariable(_)) => "RuntimeError::UndefinedVariable",
            Error::Runtime(RuntimeError::NotDefined(_)) => "RuntimeError::NotDefined",
            Error::Runtime(RuntimeError::RecursionError(_)) => "RuntimeError::RecursionError",
            Error::Mismatch { .. } => "Error::Mismatch",
            Error::InvalidOptions(_) => "Error::InvalidOptions",
        };

        Some(Box::new(c))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        match self {
            Error::Compile(CompileError::UnsupportedConstruct(_, _)) => Some(Box::new(
                "Only let, return, match and expressions compile; leave the function undecorated",
            )),
            Error::Compile(CompileError::MatchCompilationError { .. }) => Some(Box::new(
                "Constructor patterns name a variant of the sum and bind all fields or none",
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::Compile(CompileError::TypeError("x".into())), "CompileError::TypeError")]
    #[case(Error::Runtime(RuntimeError::DivisionByZero), "RuntimeError::DivisionByZero")]
    #[case(Error::InvalidOptions("bits".into()), "Error::InvalidOptions")]
    fn test_diagnostic_code(#[case] error: Error, #[case] expected: &str) {
        assert_eq!(error.code().map(|c| c.to_string()), Some(expected.to_string()));
    }

    #[test]
    fn test_display_is_transparent() {
        let error: Error = CompileError::UndefinedFunction("gen_tree".into()).into();
        assert_eq!(error.to_string(), "\"gen_tree\" is not defined");
        assert!(error.is_compile_error());
    }

    #[test]
    fn test_help_for_unsupported_construct() {
        let error: Error = CompileError::UnsupportedConstruct("f".into(), "while".into()).into();
        assert!(error.help().is_some());
    }
}
