use thiserror::Error;

type FunctionName = String;
type TypeName = String;

/// Errors raised while lowering types or compiling one specialization.
///
/// They are produced at first compilation of a signature and cached with it,
/// so every later call with the same signature reports the same error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Cannot compile match in \"{function}\": {reason}")]
    MatchCompilationError {
        function: FunctionName,
        reason: String,
    },
    #[error("Unsupported construct in \"{0}\": {1}")]
    UnsupportedConstruct(FunctionName, String),
    #[error("\"{0}\" is not defined")]
    UndefinedFunction(FunctionName),
    #[error("Undefined variable \"{1}\" in \"{0}\"")]
    UndefinedVariable(FunctionName, String),
    #[error("Invalid number of arguments in \"{0}\", expected {1}, got {2}")]
    ArityMismatch(FunctionName, usize, usize),
}

impl CompileError {
    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError(message.into())
    }

    pub(crate) fn unknown_field(record: TypeName, field: &str) -> Self {
        Self::TypeError(format!("record \"{}\" has no field \"{}\"", record, field))
    }
}
