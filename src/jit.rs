use std::collections::HashSet;

use inkwell::{
    context::Context,
    data_layout::DataLayout,
    execution_engine::ExecutionEngine,
    module::Module,
    support::{load_visible_symbols, search_for_address_of_symbol},
    targets::{InitializationConfig, Target},
    OptimizationLevel,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Native-code engine that keeps every definition unit alive and runs top-level expressions in
/// units of their own.
pub struct Jit<'ctx> {
    context: &'ctx Context,
    execution_engine: ExecutionEngine<'ctx>,
    /// Every retained unit, starting with the empty root the engine was created from.
    units: Vec<Module<'ctx>>,
}

impl<'ctx> Jit<'ctx> {
    pub fn new(context: &'ctx Context, opt_level: OptimizationLevel) -> Result<Self, JitError> {
        Target::initialize_native(&InitializationConfig::default()).map_err(JitError::Target)?;
        // Host functions such as `sin` resolve against the running process.
        load_visible_symbols();

        let root = context.create_module("root");
        let execution_engine = root
            .create_jit_execution_engine(opt_level)
            .map_err(|e| JitError::CreateEngine(e.to_string()))?;

        Ok(Self {
            context,
            execution_engine,
            units: vec![root],
        })
    }

    /// The layout every unit handed to this engine should carry.
    pub fn data_layout(&self) -> DataLayout {
        self.execution_engine.get_target_data().get_data_layout()
    }

    /// Hands `module` over for good; its functions stay callable by every later unit.
    pub fn add_unit(&mut self, module: Module<'ctx>) -> Result<(), JitError> {
        let name = module_name(&module);
        self.execution_engine
            .add_module(&module)
            .map_err(|()| JitError::AddModule(name.clone()))?;
        debug!(unit = %name, "added unit");

        self.units.push(module);
        Ok(())
    }

    /// Hands `module` over until the returned handle is removed or dropped.
    pub fn add_transient_unit(
        &self,
        module: Module<'ctx>,
    ) -> Result<UnitHandle<'_, 'ctx>, JitError> {
        let name = module_name(&module);
        self.execution_engine
            .add_module(&module)
            .map_err(|()| JitError::AddModule(name.clone()))?;
        debug!(unit = %name, "added transient unit");

        Ok(UnitHandle {
            jit: self,
            module: Some(module),
        })
    }

    /// Address of the compiled `name`, compiling whatever unit defines it first.
    ///
    /// Only meant for names of retained units: the engine keeps answering with the code of a
    /// removed transient unit, e.g. for the anonymous expression, until another unit replaces it.
    pub fn lookup(&self, name: &str) -> Result<usize, JitError> {
        let address = self
            .execution_engine
            .get_function_address(name)
            .map_err(|_| JitError::SymbolNotFound(name.to_string()))?;
        debug!(name, address, "resolved symbol");
        Ok(address)
    }

    /// Names reachable from `module` that neither a retained unit nor the process defines.
    pub fn undefined_symbols(&self, module: &Module<'ctx>) -> Vec<String> {
        undefined_symbols(module, &self.units)
    }
}

/// A unit that leaves the engine again once it has been used.
pub struct UnitHandle<'jit, 'ctx> {
    jit: &'jit Jit<'ctx>,
    module: Option<Module<'ctx>>,
}

impl<'jit, 'ctx> UnitHandle<'jit, 'ctx> {
    /// Runs the nullary function `name` of this unit.
    ///
    /// Refuses to run when some function the unit can reach is defined nowhere, since calling
    /// into it would take the whole process down.
    pub fn run(&self, name: &str) -> Result<f64, JitError> {
        let Some(module) = &self.module else {
            return Err(JitError::SymbolNotFound(name.to_string()));
        };
        let Some(function) = module.get_function(name) else {
            return Err(JitError::SymbolNotFound(name.to_string()));
        };

        let undefined = self.jit.undefined_symbols(module);
        if !undefined.is_empty() {
            return Err(JitError::UndefinedFunctions(undefined));
        }

        // SAFETY: every function reachable from `function` resolves, and host functions are
        // called with the `double(double, ...)` signature their declaration gives them.
        let value = unsafe { self.jit.execution_engine.run_function(function, &[]) };
        Ok(value.as_float(&self.jit.context.f64_type()))
    }

    /// Takes the unit out of the engine.
    pub fn remove(mut self) -> Result<(), JitError> {
        match self.module.take() {
            Some(module) => self.release(&module),
            None => Ok(()),
        }
    }

    fn release(&self, module: &Module<'ctx>) -> Result<(), JitError> {
        let name = module_name(module);
        self.jit
            .execution_engine
            .remove_module(module)
            .map_err(|e| JitError::RemoveModule(format!("{}: {:?}", name, e)))?;
        debug!(unit = %name, "removed transient unit");
        Ok(())
    }
}

impl Drop for UnitHandle<'_, '_> {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            if let Err(e) = self.release(&module) {
                warn!(error = %e, "failed to release transient unit");
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum JitError {
    #[error("failed to initialize the native target: {0}")]
    Target(String),
    #[error("failed to create the execution engine: {0}")]
    CreateEngine(String),
    #[error("unit {0} could not be added to the execution engine")]
    AddModule(String),
    #[error("failed to remove unit {0}")]
    RemoveModule(String),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("undefined functions: {}", .0.join(", "))]
    UndefinedFunctions(Vec<String>),
}

fn module_name(module: &Module) -> String {
    module.get_name().to_string_lossy().into_owned()
}

/// Follows body-less declarations from `module` through the units that define them.
///
/// A name no unit defines is still resolvable when the process itself exports it.
fn undefined_symbols<'ctx>(module: &Module<'ctx>, units: &[Module<'ctx>]) -> Vec<String> {
    let mut undefined = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = declarations(module);

    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }

        let defining_unit = units.iter().find(|unit| {
            unit.get_function(&name)
                .map_or(false, |function| function.count_basic_blocks() != 0)
        });
        match defining_unit {
            Some(unit) => pending.extend(declarations(unit)),
            None if search_for_address_of_symbol(&name).is_some() => {
                debug!(name = %name, "resolved from the process");
            }
            None => undefined.push(name),
        }
    }

    undefined.sort();
    undefined
}

/// Names of the functions `module` declares without a body.
fn declarations(module: &Module) -> Vec<String> {
    module
        .get_functions()
        .filter(|function| function.count_basic_blocks() == 0)
        .map(|function| function.get_name().to_string_lossy().into_owned())
        .collect()
}
