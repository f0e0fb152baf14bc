use inkwell::{
    values::{BasicMetadataValueEnum, FloatValue, FunctionValue},
    FloatPredicate,
};
use tracing::debug;

use crate::ast::{AnyAst, BinaryOp, ExprAst, FunctionAst, PrototypeAst, Visitor};

use super::{
    module_ctx::{name_params, ModuleCtx},
    CodeGenError,
};

impl<'ctx> Visitor for ModuleCtx<'ctx> {
    type Output = Result<(), CodeGenError>;

    fn visit_number(&mut self, value: f64) -> Self::Output {
        // float point
        let value = self.context().f64_type().const_float(value);
        self.push_value(value);
        Ok(())
    }

    fn visit_variable(&mut self, name: &str) -> Self::Output {
        let Some(value) = self.named_values().get(name).copied() else {
            return Err(CodeGenError::UnknownVariable(name.to_string()));
        };
        self.push_value(value);
        Ok(())
    }

    fn visit_binary(&mut self, op: BinaryOp, lhs: &ExprAst, rhs: &ExprAst) -> Self::Output {
        // The left operand is lowered completely before the right one.
        let lhs = self.lower_operand(lhs)?;
        let rhs = self.lower_operand(rhs)?;

        let builder = self.builder();
        let value = match op {
            BinaryOp::Add => builder.build_float_add(lhs, rhs, "addtmp")?,
            BinaryOp::Sub => builder.build_float_sub(lhs, rhs, "subtmp")?,
            BinaryOp::Mul => builder.build_float_mul(lhs, rhs, "multmp")?,
            BinaryOp::Lt | BinaryOp::Gt => {
                let predicate = match op {
                    BinaryOp::Lt => FloatPredicate::ULT,
                    _ => FloatPredicate::UGT,
                };
                let value = builder.build_float_compare(predicate, lhs, rhs, "cmptmp")?;

                // Convert bool 0/1 to double 0.0 or 1.0
                builder.build_unsigned_int_to_float(value, self.context().f64_type(), "booltmp")?
            }
        };

        self.push_value(value);
        Ok(())
    }

    fn visit_call(&mut self, callee: &str, args: &[ExprAst]) -> Self::Output {
        let Some(function) = self.get_function(callee) else {
            return Err(CodeGenError::UnknownFunction(callee.to_string()));
        };

        // Check the number of arguments.
        let expected = function.count_params() as usize;
        if expected != args.len() {
            return Err(CodeGenError::ArityMismatch {
                callee: callee.to_string(),
                expected,
                given: args.len(),
            });
        }

        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(BasicMetadataValueEnum::FloatValue(self.lower_operand(arg)?));
        }

        let call = self.builder().build_call(function, &lowered, "calltmp")?;
        let Some(value) = call.try_as_basic_value().left() else {
            return Err(CodeGenError::NoValue(callee.to_string()));
        };

        self.push_value(value.into_float_value());
        Ok(())
    }

    fn visit_if(&mut self, cond: &ExprAst, then: &ExprAst, else_: &ExprAst) -> Self::Output {
        let cond = self.lower_operand(cond)?;

        // Convert condition to a bool by comparing non-equal to 0.0.
        let zero = self.context().f64_type().const_float(0.0);
        let cond = self
            .builder()
            .build_float_compare(FloatPredicate::ONE, cond, zero, "ifcond")?;

        // The function owning the block the builder is currently in.
        let Some(function) = self
            .builder()
            .get_insert_block()
            .and_then(|block| block.get_parent())
        else {
            return Err(CodeGenError::NoInsertPoint("if expression"));
        };

        let context = self.context();
        let then_block = context.append_basic_block(function, "then");
        let else_block = context.append_basic_block(function, "else");
        let merge_block = context.append_basic_block(function, "ifcont");

        self.builder()
            .build_conditional_branch(cond, then_block, else_block)?;

        // Lowering a branch may append blocks of its own (nested ifs), so the phi takes its
        // incoming edge from wherever the builder ends up.
        self.builder().position_at_end(then_block);
        let then = self.lower_operand(then)?;
        self.builder().build_unconditional_branch(merge_block)?;
        let then_end = self.builder().get_insert_block().unwrap_or(then_block);

        self.builder().position_at_end(else_block);
        let else_ = self.lower_operand(else_)?;
        self.builder().build_unconditional_branch(merge_block)?;
        let else_end = self.builder().get_insert_block().unwrap_or(else_block);

        self.builder().position_at_end(merge_block);
        let phi = self
            .builder()
            .build_phi(self.context().f64_type(), "iftmp")?;
        phi.add_incoming(&[(&then, then_end), (&else_, else_end)]);

        self.push_value(phi.as_basic_value().into_float_value());
        Ok(())
    }

    fn visit_prototype(&mut self, prototype: &PrototypeAst) -> Self::Output {
        let function = match self.module().get_function(&prototype.name) {
            Some(existing) if existing.count_params() as usize == prototype.args.len() => {
                name_params(existing, prototype);
                existing
            }
            Some(existing) => {
                return Err(CodeGenError::ConflictingPrototype {
                    name: prototype.name.clone(),
                    expected: existing.count_params() as usize,
                    given: prototype.args.len(),
                })
            }
            None => self.declare(prototype),
        };

        // Keep the prototype around for the units that follow.
        self.record_prototype(prototype);
        self.push_function(function);
        Ok(())
    }

    fn visit_function(&mut self, function: &FunctionAst) -> Self::Output {
        let name = function.prototype.name.as_str();

        // Function cannot be redefined, neither in this unit nor across units.
        let has_body = |f: FunctionValue| f.count_basic_blocks() != 0;
        if self.is_defined(name) || self.module().get_function(name).map_or(false, has_body) {
            return Err(CodeGenError::Redefinition(name.to_string()));
        }

        // A previous 'extern' in this unit leaves a body-less declaration to fill in.
        let was_declared = self.module().get_function(name).is_some();
        let previous_prototype = self.prototype(name).cloned();

        self.visit_prototype(&function.prototype)?;
        let Some(callable) = self.take_function() else {
            return Err(CodeGenError::NoValue(name.to_string()));
        };

        match self.lower_body(function, callable) {
            Ok(()) => {
                self.mark_defined(name);
                self.push_function(callable);
                Ok(())
            }
            Err(e) => {
                // Error reading body, remove function.
                // If we didn’t delete it, it would live in the symbol table, with a body, preventing future redefinition.
                if was_declared {
                    // Calls elsewhere in the unit still refer to the declaration.
                    clear_body(callable);
                } else {
                    // SAFETY: the function was created above and nothing refers to it yet.
                    unsafe { callable.delete() };
                }
                self.restore_prototype(name, previous_prototype);
                self.builder().clear_insertion_position();

                Err(e)
            }
        }
    }
}

impl<'ctx> ModuleCtx<'ctx> {
    /// Lowers one top-level declaration into the current unit.
    ///
    /// A bare expression becomes the body of the anonymous function. The resulting callable is
    /// left for [`ModuleCtx::take_function`].
    pub fn lower(&mut self, ast: &AnyAst) -> Result<(), CodeGenError> {
        match ast {
            AnyAst::Expr(body) => FunctionAst::anonymous(body.clone()).accept(self),
            ast => ast.accept(self),
        }
    }

    /// Lowers `expr` and pops its value off the value stack.
    fn lower_operand(&mut self, expr: &ExprAst) -> Result<FloatValue<'ctx>, CodeGenError> {
        expr.accept(self)?;
        self.code_value()
            .ok_or_else(|| CodeGenError::NoValue(expr.to_string()))
    }

    fn lower_body(
        &mut self,
        function: &FunctionAst,
        callable: FunctionValue<'ctx>,
    ) -> Result<(), CodeGenError> {
        let name = function.prototype.name.as_str();

        // Create a new basic block to start insertion into.
        let basic_block = self.context().append_basic_block(callable, "entry");
        self.builder().position_at_end(basic_block);

        // Record the function parameters in the NamedValues map.
        // A repeated parameter name binds to its last occurrence.
        self.named_values_mut().clear();
        for (arg, name) in callable.get_param_iter().zip(&function.prototype.args) {
            self.named_values_mut()
                .insert(name.clone(), arg.into_float_value());
        }

        let depth = self.value_depth();
        let value = match function.body.accept(self) {
            Ok(()) => self.code_value(),
            Err(e) => {
                self.truncate_values(depth);
                return Err(e);
            }
        };
        let Some(value) = value else {
            return Err(CodeGenError::NoValue(name.to_string()));
        };

        // Finish off the function.
        self.builder().build_return(Some(&value))?;

        // Validate the generated code, checking for consistency.
        if !callable.verify(false) {
            return Err(CodeGenError::InvalidFunction(name.to_string()));
        }

        self.pass_manager().run_on(&callable);
        debug!(name, "lowered function");

        Ok(())
    }
}

/// Strips the body off `function`, leaving a declaration.
fn clear_body(function: FunctionValue) {
    let blocks = function.get_basic_blocks();

    // Without terminators no block is used any more.
    for block in &blocks {
        if let Some(terminator) = block.get_terminator() {
            terminator.erase_from_basic_block();
        }
    }

    // Erase instructions once their last user is gone.
    loop {
        let mut erased = false;
        for block in &blocks {
            let mut instruction = block.get_first_instruction();
            while let Some(current) = instruction {
                instruction = current.get_next_instruction();
                if current.get_first_use().is_none() {
                    current.erase_from_basic_block();
                    erased = true;
                }
            }
        }
        if !erased {
            break;
        }
    }

    for block in blocks {
        // SAFETY: the block is empty and nothing branches into it.
        let _ = unsafe { block.delete() };
    }
}

#[cfg(test)]
mod tests {
    use inkwell::{context::Context, values::AnyValue};

    use super::*;

    fn var(name: &str) -> ExprAst {
        ExprAst::Variable(name.to_string())
    }

    fn proto(name: &str, args: &[&str]) -> PrototypeAst {
        PrototypeAst {
            name: name.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    fn function(name: &str, args: &[&str], body: ExprAst) -> FunctionAst {
        FunctionAst {
            prototype: proto(name, args),
            body,
        }
    }

    fn binary(op: BinaryOp, lhs: ExprAst, rhs: ExprAst) -> ExprAst {
        ExprAst::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn call(callee: &str, args: Vec<ExprAst>) -> ExprAst {
        ExprAst::Call {
            callee: callee.to_string(),
            args,
        }
    }

    /// Positions the builder inside a scratch function so bare expressions can be lowered.
    fn enter_scratch_function(ctx: &ModuleCtx) {
        let fn_type = ctx.context().f64_type().fn_type(&[], false);
        let scratch = ctx.module().add_function("scratch", fn_type, None);
        let entry = ctx.context().append_basic_block(scratch, "entry");
        ctx.builder().position_at_end(entry);
    }

    fn ir(function: FunctionValue) -> String {
        function.print_to_string().to_string()
    }

    #[test]
    fn test_number() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        ExprAst::Number(1.0).accept(&mut ctx).unwrap();

        let value = ctx.code_value().unwrap();
        assert_eq!(value.print_to_string().to_string(), "double 1.000000e+00");
        assert!(ctx.code_value().is_none());
    }

    #[test]
    fn test_sum_folds_to_constant() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);
        enter_scratch_function(&ctx);

        AnyAst::Expr(binary(BinaryOp::Add, ExprAst::Number(3.0), ExprAst::Number(4.0)))
            .accept(&mut ctx)
            .unwrap();

        let value = ctx.code_value().unwrap();
        assert_eq!(value.get_constant(), Some((7.0, false)));
        assert_eq!(value.print_to_string().to_string(), "double 7.000000e+00");
    }

    #[test]
    fn test_lower_bare_expression() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        ctx.lower(&AnyAst::Expr(ExprAst::Number(2.0))).unwrap();

        let function = ctx.take_function().unwrap();
        assert_eq!(
            function.get_name().to_str().unwrap(),
            crate::ast::ANON_EXPR
        );
        assert!(ctx.is_defined(crate::ast::ANON_EXPR));
    }

    #[test]
    fn test_binary_lt() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);
        enter_scratch_function(&ctx);

        binary(BinaryOp::Lt, ExprAst::Number(0.0), ExprAst::Number(2.0))
            .accept(&mut ctx)
            .unwrap();

        let value = ctx.code_value().unwrap();
        assert_eq!(value.print_to_string().to_string(), "double 1.000000e+00");
    }

    #[test]
    fn test_binary_gt() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);
        enter_scratch_function(&ctx);

        binary(BinaryOp::Gt, ExprAst::Number(0.0), ExprAst::Number(2.0))
            .accept(&mut ctx)
            .unwrap();

        let value = ctx.code_value().unwrap();
        assert_eq!(value.print_to_string().to_string(), "double 0.000000e+00");
    }

    #[test]
    fn test_unknown_variable() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        let err = var("x").accept(&mut ctx).unwrap_err();
        assert!(matches!(err, CodeGenError::UnknownVariable(name) if name == "x"));
    }

    #[test]
    fn test_parameters_do_not_leak_into_next_function() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function("f", &["x"], var("x")).accept(&mut ctx).unwrap();
        let err = function("g", &[], var("x")).accept(&mut ctx).unwrap_err();
        assert!(matches!(err, CodeGenError::UnknownVariable(ref name) if name == "x"));
        assert!(ctx.module().get_function("g").is_none());
    }

    #[test]
    fn test_operands_lowered_left_to_right() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("f", &["x"]).accept(&mut ctx).unwrap();
        proto("g", &["x"]).accept(&mut ctx).unwrap();
        function(
            "h",
            &[],
            binary(
                BinaryOp::Add,
                call("f", vec![ExprAst::Number(1.0)]),
                call("g", vec![ExprAst::Number(2.0)]),
            ),
        )
        .accept(&mut ctx)
        .unwrap();

        let ir = ir(ctx.take_function().unwrap());
        let f = ir.find("call double @f(").unwrap();
        let g = ir.find("call double @g(").unwrap();
        assert!(f < g, "{}", ir);
    }

    #[test]
    fn test_prototype() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &["x", "y"]).accept(&mut ctx).unwrap();

        let value = ctx.take_function().unwrap();
        assert_eq!(ir(value), "declare double @foo(double, double)\n");
        assert_eq!(ctx.prototype("foo"), Some(&proto("foo", &["x", "y"])));
    }

    #[test]
    fn test_function() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function("foo", &["x", "y"], ExprAst::Number(1.0))
            .accept(&mut ctx)
            .unwrap();

        let value = ctx.take_function().unwrap();
        assert_eq!(
            ir(value),
            "define double @foo(double %x, double %y) {\nentry:\n  ret double 1.000000e+00\n}\n"
        );
        assert!(ctx.is_defined("foo"));
    }

    #[test]
    fn test_call() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function("foo", &["x", "y"], ExprAst::Number(4.0))
            .accept(&mut ctx)
            .unwrap();
        function(
            "bar",
            &["a"],
            call("foo", vec![var("a"), ExprAst::Number(2.0)]),
        )
        .accept(&mut ctx)
        .unwrap();

        let value = ctx.take_function().unwrap();
        assert!(ir(value).contains("call double @foo(double %a, double 2.000000e+00)"));
    }

    #[test]
    fn test_call_errors() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &["x"]).accept(&mut ctx).unwrap();

        let err = function("bar", &[], call("foo", vec![]))
            .accept(&mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            CodeGenError::ArityMismatch { ref callee, expected: 1, given: 0 } if callee == "foo"
        ));
        assert_eq!(
            err.to_string(),
            "call to function foo requires 1 arguments but 0 were given"
        );

        let err = function("baz", &[], call("nope", vec![]))
            .accept(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, CodeGenError::UnknownFunction(name) if name == "nope"));

        // Neither failed body left a callable behind.
        assert!(ctx.module().get_function("bar").is_none());
        assert!(ctx.module().get_function("baz").is_none());
        assert!(ctx.prototype("bar").is_none());
        assert!(!ctx.is_defined("bar"));
    }

    #[test]
    fn test_if() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &[]).accept(&mut ctx).unwrap();
        proto("bar", &[]).accept(&mut ctx).unwrap();
        function(
            "baz",
            &["x"],
            ExprAst::If {
                cond: Box::new(var("x")),
                then: Box::new(call("foo", vec![])),
                else_: Box::new(call("bar", vec![])),
            },
        )
        .accept(&mut ctx)
        .unwrap();

        let ir = ir(ctx.take_function().unwrap());
        assert!(ir.contains("fcmp one double %x, 0.000000e+00"));
        assert!(ir.contains("call double @foo()"));
        assert!(ir.contains("call double @bar()"));
        assert!(ir.contains("phi double"));
    }

    #[test]
    fn test_function_with_different_arg_name() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &["a"]).accept(&mut ctx).unwrap();
        function("foo", &["b"], var("b")).accept(&mut ctx).unwrap();

        let value = ctx.take_function().unwrap();
        assert_eq!(
            ir(value),
            "define double @foo(double %b) {\nentry:\n  ret double %b\n}\n"
        );
    }

    #[test]
    fn test_extern_then_define_across_units() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &["a"]).accept(&mut ctx).unwrap();
        ctx.extract_module();

        function("foo", &["a"], var("a")).accept(&mut ctx).unwrap();
        assert!(ctx.is_defined("foo"));
    }

    #[test]
    fn test_redefinition() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function("foo", &[], ExprAst::Number(1.0))
            .accept(&mut ctx)
            .unwrap();

        // Same unit.
        let err = function("foo", &[], ExprAst::Number(2.0))
            .accept(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, CodeGenError::Redefinition(ref name) if name == "foo"));

        // Later unit.
        ctx.extract_module();
        let err = function("foo", &[], ExprAst::Number(2.0))
            .accept(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, CodeGenError::Redefinition(ref name) if name == "foo"));
        assert_eq!(err.to_string(), "function foo cannot be redefined");
    }

    #[test]
    fn test_failed_body_keeps_extern_declaration() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &["x"]).accept(&mut ctx).unwrap();
        let err = function("foo", &["x"], var("y"))
            .accept(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, CodeGenError::UnknownVariable(_)));

        let foo = ctx.module().get_function("foo").unwrap();
        assert_eq!(foo.count_basic_blocks(), 0);
        assert_eq!(ctx.prototype("foo"), Some(&proto("foo", &["x"])));

        // The declaration can still be given a body.
        function("foo", &["x"], var("x")).accept(&mut ctx).unwrap();
    }

    #[test]
    fn test_failed_branch_keeps_extern_declaration() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("foo", &["x"]).accept(&mut ctx).unwrap();
        function("bar", &[], call("foo", vec![ExprAst::Number(1.0)]))
            .accept(&mut ctx)
            .unwrap();

        let body = ExprAst::If {
            cond: Box::new(binary(BinaryOp::Lt, var("x"), ExprAst::Number(1.0))),
            then: Box::new(var("x")),
            else_: Box::new(var("y")),
        };
        let err = function("foo", &["x"], body).accept(&mut ctx).unwrap_err();
        assert!(matches!(err, CodeGenError::UnknownVariable(ref name) if name == "y"));

        let foo = ctx.module().get_function("foo").unwrap();
        assert_eq!(foo.count_basic_blocks(), 0);
        assert!(ctx.module().get_function("bar").unwrap().verify(false));
    }

    #[test]
    fn test_cross_unit_resolution() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function("one", &[], ExprAst::Number(1.0))
            .accept(&mut ctx)
            .unwrap();
        let first = ctx.extract_module();
        assert!(first.get_function("one").is_some());
        assert!(ctx.module().get_function("one").is_none());

        function(
            "two",
            &[],
            binary(BinaryOp::Add, call("one", vec![]), call("one", vec![])),
        )
        .accept(&mut ctx)
        .unwrap();

        // `one` is re-declared, without a body, into the unit that calls it.
        let one = ctx.module().get_function("one").unwrap();
        assert_eq!(one.count_basic_blocks(), 0);
        assert!(ir(ctx.take_function().unwrap()).contains("call double @one()"));
    }

    #[test]
    fn test_redeclaration_overwrites_prototype() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("f", &["x"]).accept(&mut ctx).unwrap();
        ctx.extract_module();
        proto("f", &["x", "y"]).accept(&mut ctx).unwrap();
        ctx.extract_module();

        assert_eq!(ctx.prototype("f"), Some(&proto("f", &["x", "y"])));
        let err = function("g", &[], call("f", vec![ExprAst::Number(1.0)]))
            .accept(&mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            CodeGenError::ArityMismatch { expected: 2, given: 1, .. }
        ));
    }

    #[test]
    fn test_conflicting_prototype_in_one_unit() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        proto("f", &["x"]).accept(&mut ctx).unwrap();
        let err = proto("f", &["x", "y"]).accept(&mut ctx).unwrap_err();
        assert!(matches!(
            err,
            CodeGenError::ConflictingPrototype { expected: 1, given: 2, .. }
        ));
    }

    #[test]
    fn test_duplicate_parameters_shadow() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function("pick", &["x", "x"], var("x"))
            .accept(&mut ctx)
            .unwrap();

        let ir = ir(ctx.take_function().unwrap());
        // The body returns the second parameter.
        let ret = ir.lines().find(|line| line.contains("ret double")).unwrap();
        assert!(!ret.ends_with("%x"), "{}", ir);
    }

    #[test]
    fn test_forget() {
        let context = Context::create();
        let mut ctx = ModuleCtx::new("test", &context);

        function(crate::ast::ANON_EXPR, &[], ExprAst::Number(1.0))
            .accept(&mut ctx)
            .unwrap();
        ctx.extract_module();
        ctx.forget(crate::ast::ANON_EXPR);

        assert!(ctx.prototype(crate::ast::ANON_EXPR).is_none());
        function(crate::ast::ANON_EXPR, &[], ExprAst::Number(2.0))
            .accept(&mut ctx)
            .unwrap();
    }
}
