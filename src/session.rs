use std::fmt;

use futures::{executor, stream};
use inkwell::{context::Context, values::AnyValue, OptimizationLevel};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    ast::{AnyAst, FunctionAst, PrototypeAst, ANON_EXPR},
    code_gen::{CodeGenError, ModuleCtx},
    jit::{Jit, JitError},
    parser::{Parser, ParserError},
};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Keep the IR of every lowered declaration in its [`Evaluation`].
    pub print_ir: bool,
    pub opt_level: OptimizationLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            print_ir: false,
            opt_level: OptimizationLevel::None,
        }
    }
}

/// Outcome of one top-level declaration.
///
/// `ir` is only filled in when [`SessionConfig::print_ir`] is set.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Defined { name: String, ir: Option<String> },
    Declared { name: String, ir: Option<String> },
    Value { value: f64, ir: Option<String> },
}

impl Evaluation {
    pub fn ir(&self) -> Option<&str> {
        match self {
            Evaluation::Defined { ir, .. }
            | Evaluation::Declared { ir, .. }
            | Evaluation::Value { ir, .. } => ir.as_deref(),
        }
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluation::Defined { name, .. } => write!(f, "Read function definition {}", name),
            Evaluation::Declared { name, .. } => write!(f, "Read extern {}", name),
            Evaluation::Value { value, .. } => write!(f, "Evaluated to {}", value),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("syntax error: {0}")]
    Parser(#[from] ParserError),
    #[error(transparent)]
    CodeGen(#[from] CodeGenError),
    #[error(transparent)]
    Jit(#[from] JitError),
}

/// One independent incremental compiler: a code generator feeding an execution engine.
pub struct Session<'ctx> {
    code_gen: ModuleCtx<'ctx>,
    jit: Jit<'ctx>,
    config: SessionConfig,
}

impl<'ctx> Session<'ctx> {
    pub fn new(context: &'ctx Context, config: SessionConfig) -> Result<Self, SessionError> {
        let jit = Jit::new(context, config.opt_level)?;
        let mut code_gen = ModuleCtx::new("unit.0", context);
        code_gen.set_data_layout(jit.data_layout());

        Ok(Self {
            code_gen,
            jit,
            config,
        })
    }

    /// Parses and evaluates every declaration in `source`, in order.
    ///
    /// A syntax error skips to the start of the next declaration.
    pub fn eval_source(&mut self, source: &str) -> Vec<Result<Evaluation, SessionError>> {
        let mut char_stream = stream::iter(source.chars());
        let mut parser = Parser::from_char_stream(&mut char_stream);
        let mut results = Vec::new();

        let task = async {
            loop {
                match parser.parse_any().await {
                    Ok(Some(ast)) => results.push(self.eval_declaration(&ast)),
                    Ok(None) => break,
                    Err(e) => {
                        results.push(Err(e.into()));
                        if parser.synchronize().await.is_err() {
                            break;
                        }
                    }
                }
            }
        };
        executor::block_on(task);

        results
    }

    /// Lowers one declaration, hands it to the engine and, for a bare expression, runs it.
    pub fn eval_declaration(&mut self, ast: &AnyAst) -> Result<Evaluation, SessionError> {
        match ast {
            AnyAst::Expr(_) => self.eval_anonymous(ast),
            AnyAst::Function(function) if function.is_anonymous() => self.eval_anonymous(ast),
            AnyAst::Function(function) => self.eval_definition(ast, function),
            AnyAst::Prototype(prototype) => self.eval_extern(ast, prototype),
        }
    }

    fn eval_definition(
        &mut self,
        ast: &AnyAst,
        function: &FunctionAst,
    ) -> Result<Evaluation, SessionError> {
        let name = function.prototype.name.clone();
        let ir = self.lower(ast)?;

        let module = self.code_gen.extract_module();
        if let Err(e) = self.jit.add_unit(module) {
            // The body never reached the engine.
            self.code_gen.forget_definition(&name);
            warn!(error = %e, name = %name, "failed to add definition");
            return Err(e.into());
        }

        Ok(Evaluation::Defined { name, ir })
    }

    fn eval_extern(
        &mut self,
        ast: &AnyAst,
        prototype: &PrototypeAst,
    ) -> Result<Evaluation, SessionError> {
        let name = prototype.name.clone();
        let ir = self.lower(ast)?;

        let module = self.code_gen.extract_module();
        if let Err(e) = self.jit.add_unit(module) {
            warn!(error = %e, name = %name, "failed to add extern");
            return Err(e.into());
        }

        Ok(Evaluation::Declared { name, ir })
    }

    fn eval_anonymous(&mut self, ast: &AnyAst) -> Result<Evaluation, SessionError> {
        // The name is reused by the next expression.
        let ir = self.lower(ast).map_err(|e| {
            self.code_gen.forget(ANON_EXPR);
            e
        })?;
        let module = self.code_gen.extract_module();
        self.code_gen.forget(ANON_EXPR);

        let handle = self.jit.add_transient_unit(module)?;
        let result = handle.run(ANON_EXPR);
        if let Err(e) = handle.remove() {
            warn!(error = %e, "failed to remove anonymous expression");
        }

        let value = result?;
        debug!(value, "evaluated anonymous expression");
        Ok(Evaluation::Value { value, ir })
    }

    /// Lowers `ast` into the current unit, throwing the unit away on failure.
    fn lower(&mut self, ast: &AnyAst) -> Result<Option<String>, SessionError> {
        if let Err(e) = self.code_gen.lower(ast) {
            self.code_gen.discard_module();
            return Err(e.into());
        }

        let function = self.code_gen.take_function();
        let ir = match function {
            Some(function) if self.config.print_ir => Some(function.print_to_string().to_string()),
            _ => None,
        };
        Ok(ir)
    }
}
