use std::collections::{HashMap, HashSet};

use inkwell::{
    builder::Builder,
    context::Context,
    data_layout::DataLayout,
    module::{Linkage, Module},
    passes::PassManager,
    types::BasicMetadataTypeEnum,
    values::{FloatValue, FunctionValue},
};
use tracing::debug;

use crate::ast::PrototypeAst;

/// Code generation state for the currently accumulating compilation unit.
///
/// The current `module` is swapped out by [`ModuleCtx::extract_module`] once a declaration has been
/// lowered. Prototypes and the names of defined functions outlive every module, so that a later
/// unit can call into an earlier one.
pub struct ModuleCtx<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    pass_manager: PassManager<FunctionValue<'ctx>>,
    data_layout: Option<DataLayout>,
    module_count: usize,

    /// Parameter bindings of the function body being lowered.
    named_values: HashMap<String, FloatValue<'ctx>>,

    /// Lowered expressions; children push, parents pop.
    values: Vec<FloatValue<'ctx>>,

    /// Lowered prototypes and functions.
    functions: Vec<FunctionValue<'ctx>>,

    /// The most recent prototype of every declared name, across all units.
    prototypes: HashMap<String, PrototypeAst>,

    /// Names whose bodies have been lowered and not forgotten since.
    defined: HashSet<String>,
}

impl<'ctx> ModuleCtx<'ctx> {
    pub fn new(module_name: &str, context: &'ctx Context) -> Self {
        let module = context.create_module(module_name);
        let builder = context.create_builder();
        let pass_manager = create_pass_manager(&module);

        ModuleCtx {
            context,
            module,
            builder,
            pass_manager,
            data_layout: None,
            module_count: 0,
            named_values: HashMap::new(),
            values: Vec::new(),
            functions: Vec::new(),
            prototypes: HashMap::new(),
            defined: HashSet::new(),
        }
    }

    /// Stamps the current and every future module with the layout of the target they run on.
    pub fn set_data_layout(&mut self, data_layout: DataLayout) {
        self.module.set_data_layout(&data_layout);
        self.data_layout = Some(data_layout);
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    pub fn builder(&self) -> &Builder<'ctx> {
        &self.builder
    }

    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    pub(super) fn named_values(&self) -> &HashMap<String, FloatValue<'ctx>> {
        &self.named_values
    }

    pub(super) fn named_values_mut(&mut self) -> &mut HashMap<String, FloatValue<'ctx>> {
        &mut self.named_values
    }

    pub(super) fn pass_manager(&self) -> &PassManager<FunctionValue<'ctx>> {
        &self.pass_manager
    }

    pub(super) fn push_value(&mut self, value: FloatValue<'ctx>) {
        self.values.push(value);
    }

    pub(super) fn push_function(&mut self, function: FunctionValue<'ctx>) {
        self.functions.push(function);
    }

    pub(super) fn value_depth(&self) -> usize {
        self.values.len()
    }

    pub(super) fn truncate_values(&mut self, depth: usize) {
        self.values.truncate(depth);
    }

    /// Pops the value produced by the most recently lowered expression.
    pub fn code_value(&mut self) -> Option<FloatValue<'ctx>> {
        self.values.pop()
    }

    /// Pops the callable produced by the most recently lowered prototype or function.
    pub fn take_function(&mut self) -> Option<FunctionValue<'ctx>> {
        self.functions.pop()
    }

    pub fn prototype(&self, name: &str) -> Option<&PrototypeAst> {
        self.prototypes.get(name)
    }

    pub(super) fn record_prototype(&mut self, prototype: &PrototypeAst) -> Option<PrototypeAst> {
        self.prototypes
            .insert(prototype.name.clone(), prototype.clone())
    }

    pub(super) fn restore_prototype(&mut self, name: &str, previous: Option<PrototypeAst>) {
        match previous {
            Some(previous) => {
                self.prototypes.insert(name.to_string(), previous);
            }
            None => {
                self.prototypes.remove(name);
            }
        }
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defined.contains(name)
    }

    pub(super) fn mark_defined(&mut self, name: &str) {
        self.defined.insert(name.to_string());
    }

    /// Drops the record of a body for `name`, e.g. when its unit never reached the engine.
    ///
    /// The prototype stays callable.
    pub fn forget_definition(&mut self, name: &str) {
        self.defined.remove(name);
    }

    /// Drops every trace of `name`, as if it had never been declared.
    pub fn forget(&mut self, name: &str) {
        self.defined.remove(name);
        self.prototypes.remove(name);
    }

    /// Looks `name` up for a call.
    ///
    /// 1. a callable already in the current module;
    /// 2. a prototype seen in an earlier module, re-declared into the current one (the engine
    ///    resolves the body by name when the unit runs);
    /// 3. otherwise the name was never declared.
    pub fn get_function(&mut self, name: &str) -> Option<FunctionValue<'ctx>> {
        if let Some(function) = self.module.get_function(name) {
            return Some(function);
        }

        let prototype = self.prototypes.get(name)?.clone();
        debug!(name, "re-declaring function from an earlier unit");
        Some(self.declare(&prototype))
    }

    /// Adds a body-less `double name(double, ...)` to the current module.
    pub(super) fn declare(&self, prototype: &PrototypeAst) -> FunctionValue<'ctx> {
        // Make the function type: double(double, double) etc.

        // (double, double)
        let double_type = BasicMetadataTypeEnum::FloatType(self.context.f64_type());
        let doubles = vec![double_type; prototype.args.len()];

        // double(double, double)
        let fn_type = self.context.f64_type().fn_type(&doubles, false);

        // External linkage:
        // - the function may be defined outside the current module
        // - it is callable by functions outside the module
        let function =
            self.module
                .add_function(prototype.name.as_str(), fn_type, Some(Linkage::External));

        name_params(function, prototype);
        function
    }

    /// Hands the current module over and starts accumulating into a fresh one.
    ///
    /// Nothing inside the returned module is referenced by this context afterwards.
    pub fn extract_module(&mut self) -> Module<'ctx> {
        let fresh = self.fresh_module();
        self.pass_manager = create_pass_manager(&fresh);
        self.reset_lowering_state();

        std::mem::replace(&mut self.module, fresh)
    }

    /// Throws the current module away, e.g. after a failed declaration.
    pub fn discard_module(&mut self) {
        let module = self.extract_module();
        debug!(
            module = %module.get_name().to_string_lossy(),
            "discarding unit"
        );
    }

    fn fresh_module(&mut self) -> Module<'ctx> {
        self.module_count += 1;
        let name = format!("unit.{}", self.module_count);
        let module = self.context.create_module(&name);
        if let Some(data_layout) = &self.data_layout {
            module.set_data_layout(data_layout);
        }
        module
    }

    fn reset_lowering_state(&mut self) {
        self.builder.clear_insertion_position();
        self.named_values.clear();
        self.values.clear();
        self.functions.clear();
    }
}

/// Names the parameters after the prototype, so the IR reads `%x` instead of `%0`.
pub(super) fn name_params(function: FunctionValue, prototype: &PrototypeAst) {
    for (param, name) in function.get_param_iter().zip(&prototype.args) {
        param.into_float_value().set_name(name);
    }
}

/// The fixed simplification pipeline every finished function goes through.
fn create_pass_manager<'ctx>(module: &Module<'ctx>) -> PassManager<FunctionValue<'ctx>> {
    let pass_manager = PassManager::create(module);
    pass_manager.add_instruction_combining_pass();
    pass_manager.add_reassociate_pass();
    pass_manager.add_gvn_pass();
    pass_manager.add_cfg_simplification_pass();
    pass_manager.initialize();
    pass_manager
}
