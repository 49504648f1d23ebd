use thiserror::Error;

type FunctionName = String;

/// Errors raised while executing compiled code or interpreting host code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Divided by 0")]
    DivisionByZero,
    #[error("Host function \"{0}\" failed: {1}")]
    HostFunction(FunctionName, String),
    #[error("Invalid types for \"{0}\", got {1}")]
    TypeMismatch(String, String),
    #[error("Invalid number of arguments in \"{0}\", expected {1}, got {2}")]
    ArityMismatch(FunctionName, usize, usize),
    #[error("Undefined variable \"{0}\"")]
    UndefinedVariable(String),
    #[error("\"{0}\" is not defined")]
    NotDefined(FunctionName),
    #[error("Maximum recursion depth exceeded \"{0}\"")]
    RecursionError(u32),
}
