//! Lowering of AST declarations into LLVM IR, one compilation unit (module) at a time.

mod module_ctx;
mod visitor;

use inkwell::builder::BuilderError;
use thiserror::Error;

pub use module_ctx::ModuleCtx;

#[derive(Debug, Error)]
pub enum CodeGenError {
    #[error("unknown variable name: {0}")]
    UnknownVariable(String),
    #[error("unknown function referenced: {0}")]
    UnknownFunction(String),
    #[error("call to function {callee} requires {expected} arguments but {given} were given")]
    ArityMismatch {
        callee: String,
        expected: usize,
        given: usize,
    },
    #[error("function {0} cannot be redefined")]
    Redefinition(String),
    #[error("prototype {name} declares {given} parameters but this unit already declares it with {expected}")]
    ConflictingPrototype {
        name: String,
        expected: usize,
        given: usize,
    },
    #[error("body of function {0} produced no value")]
    NoValue(String),
    #[error("generated code for function {0} failed verification")]
    InvalidFunction(String),
    #[error("no insertion point for {0}")]
    NoInsertPoint(&'static str),
    #[error("IR builder failure: {0}")]
    Builder(#[from] BuilderError),
}
