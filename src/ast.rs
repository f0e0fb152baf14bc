use std::fmt;

/// Reserved prototype name of an anonymous top-level expression.
///
/// Identifiers must start with an alphabetic character, so source text can never name it.
pub const ANON_EXPR: &str = "__anon_expr";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Lt,
    Gt,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
        }
    }
}

/// - Learn more: <https://llvm.org/docs/tutorial/MyFirstLanguageFrontend/LangImpl02.html#the-abstract-syntax-tree-ast>
#[derive(Debug, PartialEq, Clone)]
pub enum ExprAst {
    Number(f64),
    Variable(String),
    Binary {
        op: BinaryOp,
        lhs: Box<ExprAst>,
        rhs: Box<ExprAst>,
    },
    Call {
        callee: String,
        args: Vec<ExprAst>,
    },
    If {
        cond: Box<ExprAst>,
        then: Box<ExprAst>,
        else_: Box<ExprAst>,
    },
}

/// - Learn more: <https://llvm.org/docs/tutorial/MyFirstLanguageFrontend/LangImpl02.html#the-abstract-syntax-tree-ast>
#[derive(Debug, PartialEq, Clone)]
pub struct PrototypeAst {
    pub name: String,
    pub args: Vec<String>,
}

impl PrototypeAst {
    pub fn anonymous() -> Self {
        Self {
            name: ANON_EXPR.to_string(),
            args: Vec::new(),
        }
    }
}

/// - Learn more: <https://llvm.org/docs/tutorial/MyFirstLanguageFrontend/LangImpl02.html#the-abstract-syntax-tree-ast>
#[derive(Debug, PartialEq, Clone)]
pub struct FunctionAst {
    pub prototype: PrototypeAst,
    pub body: ExprAst,
}

impl FunctionAst {
    /// Wraps a bare expression in the reserved zero-argument prototype.
    pub fn anonymous(body: ExprAst) -> Self {
        Self {
            prototype: PrototypeAst::anonymous(),
            body,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.prototype.name == ANON_EXPR
    }
}

/// One top-level declaration.
#[derive(Debug, PartialEq, Clone)]
pub enum AnyAst {
    Expr(ExprAst),
    Prototype(PrototypeAst),
    Function(FunctionAst),
}

/// A handler for every concrete node variant.
///
/// `accept` on a node invokes exactly the handler matching its variant, so passes over the tree
/// are written without touching the node definitions.
pub trait Visitor {
    type Output;

    fn visit_number(&mut self, value: f64) -> Self::Output;
    fn visit_variable(&mut self, name: &str) -> Self::Output;
    fn visit_binary(&mut self, op: BinaryOp, lhs: &ExprAst, rhs: &ExprAst) -> Self::Output;
    fn visit_call(&mut self, callee: &str, args: &[ExprAst]) -> Self::Output;
    fn visit_if(&mut self, cond: &ExprAst, then: &ExprAst, else_: &ExprAst) -> Self::Output;
    fn visit_prototype(&mut self, prototype: &PrototypeAst) -> Self::Output;
    fn visit_function(&mut self, function: &FunctionAst) -> Self::Output;
}

impl ExprAst {
    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> V::Output {
        match self {
            ExprAst::Number(value) => visitor.visit_number(*value),
            ExprAst::Variable(name) => visitor.visit_variable(name),
            ExprAst::Binary { op, lhs, rhs } => visitor.visit_binary(*op, lhs, rhs),
            ExprAst::Call { callee, args } => visitor.visit_call(callee, args),
            ExprAst::If { cond, then, else_ } => visitor.visit_if(cond, then, else_),
        }
    }
}

impl PrototypeAst {
    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> V::Output {
        visitor.visit_prototype(self)
    }
}

impl FunctionAst {
    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> V::Output {
        visitor.visit_function(self)
    }
}

impl AnyAst {
    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> V::Output {
        match self {
            AnyAst::Expr(expr) => expr.accept(visitor),
            AnyAst::Prototype(prototype) => prototype.accept(visitor),
            AnyAst::Function(function) => function.accept(visitor),
        }
    }
}

// Parenthesized prefix form, e.g. `(function (prototype double x) (* 2 x))`.

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl fmt::Display for ExprAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprAst::Number(value) => write!(f, "{}", value),
            ExprAst::Variable(name) => f.write_str(name),
            ExprAst::Binary { op, lhs, rhs } => write!(f, "({} {} {})", op, lhs, rhs),
            ExprAst::Call { callee, args } => {
                write!(f, "(call {}", callee)?;
                write_list(f, args)?;
                f.write_str(")")
            }
            ExprAst::If { cond, then, else_ } => write!(f, "(if {} {} {})", cond, then, else_),
        }
    }
}

impl fmt::Display for PrototypeAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(prototype {}", self.name)?;
        write_list(f, &self.args)?;
        f.write_str(")")
    }
}

impl fmt::Display for FunctionAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(function {} {})", self.prototype, self.body)
    }
}

impl fmt::Display for AnyAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyAst::Expr(expr) => expr.fmt(f),
            AnyAst::Prototype(prototype) => prototype.fmt(f),
            AnyAst::Function(function) => function.fmt(f),
        }
    }
}

/// Writes ` a, b, c`; nothing for an empty list.
fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        let sep = if i == 0 { " " } else { ", " };
        write!(f, "{}{}", sep, item)?;
    }
    Ok(())
}
