use std::collections::HashMap;

use async_recursion::async_recursion;
use lazy_static::lazy_static;
use thiserror::Error;

use crate::{
    ast::{AnyAst, BinaryOp, ExprAst, FunctionAst, PrototypeAst},
    lexer::{CharStream, Lexer, LexerError},
    token::{Location, Token, TokenKind},
    token_src::TokenSource,
};

lazy_static! {
    /// - 1 is lowest precedence
    static ref BIN_OP_PRECEDENCE: HashMap<TokenKind, (BinaryOp, u8)> = {
        let mut m = HashMap::new();
        m.insert(TokenKind::Less, (BinaryOp::Lt, 10));
        m.insert(TokenKind::Greater, (BinaryOp::Gt, 10));
        m.insert(TokenKind::Plus, (BinaryOp::Add, 20));
        m.insert(TokenKind::Minus, (BinaryOp::Sub, 20));
        m.insert(TokenKind::Star, (BinaryOp::Mul, 40));
        m
    };
}

pub struct Parser<'stream> {
    token_src: TokenSource<'stream>,
}

impl<'stream> Parser<'stream> {
    pub fn from_token_src(token_src: TokenSource<'stream>) -> Self {
        Self { token_src }
    }

    pub fn from_char_stream(char_stream: &'stream mut CharStream<'stream>) -> Self {
        let lexer = Lexer::new(char_stream);
        Self::from_token_src(TokenSource::new(lexer))
    }

    /// - ```text
    ///   top
    ///     ::= definition
    ///     ::= external
    ///     ::= toplevelexpr
    ///     ::= ';'
    ///   ```
    /// - Returns `None` at the end of input.
    pub async fn parse_any(&mut self) -> Result<Option<AnyAst>, ParserError> {
        loop {
            let kind = self.peek_token().await?.kind;
            let ast = match kind {
                TokenKind::Eof => return Ok(None),
                TokenKind::Semicolon => {
                    // eat ';'
                    self.take_token().await?;
                    continue;
                }
                TokenKind::Def => AnyAst::Function(self.parse_definition().await?),
                TokenKind::Extern => AnyAst::Prototype(self.parse_extern().await?),
                _ => AnyAst::Function(self.parse_top_level_expr().await?),
            };
            return Ok(Some(ast));
        }
    }

    /// Discards the remains of a failed declaration.
    ///
    /// Stops after the next `;`, or right before the next `def`, `extern` or the end of input.
    pub async fn synchronize(&mut self) -> Result<(), ParserError> {
        loop {
            let kind = match self.peek_token().await {
                Ok(token) => token.kind,
                // The lexer has already moved past the offending input.
                Err(_) => continue,
            };

            match kind {
                TokenKind::Eof | TokenKind::Def | TokenKind::Extern => return Ok(()),
                TokenKind::Semicolon => {
                    self.take_token().await?;
                    return Ok(());
                }
                _ => {
                    self.take_token().await?;
                }
            }
        }
    }

    /// - `numberexpr ::= number`
    async fn parse_number_expr(&mut self) -> Result<ExprAst, ParserError> {
        let token = self
            .expect(TokenKind::Number, "when expecting a number")
            .await?;

        match token.text.parse::<f64>() {
            Ok(n) => Ok(ExprAst::Number(n)),
            Err(_) => Err(ParserError::syntax(
                token.location,
                format!("invalid number literal '{}'", token.text),
            )),
        }
    }

    /// - `parenexpr ::= '(' expression ')'`
    async fn parse_paren_expr(&mut self) -> Result<ExprAst, ParserError> {
        // eat '('
        self.expect(TokenKind::LeftParen, "when expecting '('").await?;

        let expr = self.parse_expression().await?;

        // eat ')'
        self.expect(TokenKind::RightParen, "when expecting ')'").await?;

        Ok(expr)
    }

    /// - ```text
    ///   identifierexpr
    ///     ::= identifier
    ///     ::= identifier '(' (expression (',' expression)*)? ')'
    ///   ```
    async fn parse_identifier_expr(&mut self) -> Result<ExprAst, ParserError> {
        let id_name = self
            .expect(TokenKind::Identifier, "when expecting an identifier")
            .await?
            .text;

        if self.peek_token().await?.kind != TokenKind::LeftParen {
            // Simple variable ref.
            return Ok(ExprAst::Variable(id_name));
        }

        // Call.
        // eat '('
        self.take_token().await?;

        let mut args = Vec::new();

        if self.peek_token().await?.kind == TokenKind::RightParen {
            // eat ')'
            self.take_token().await?;
        } else {
            loop {
                args.push(self.parse_expression().await?);

                let token = self.take_token().await?;
                match token.kind {
                    TokenKind::RightParen => break,
                    TokenKind::Comma => (),
                    _ => {
                        return Err(ParserError::syntax(
                            token.location,
                            format!(
                                "unexpected {} when expecting ')' or ',' in argument list",
                                token
                            ),
                        ))
                    }
                }
            }
        }

        Ok(ExprAst::Call {
            callee: id_name,
            args,
        })
    }

    /// - `ifexpr ::= 'if' expression 'then' expression 'else' expression`
    async fn parse_if_expr(&mut self) -> Result<ExprAst, ParserError> {
        self.expect(TokenKind::If, "when expecting 'if'").await?;
        let cond = self.parse_expression().await?;

        self.expect(TokenKind::Then, "when expecting 'then'").await?;
        let then = self.parse_expression().await?;

        self.expect(TokenKind::Else, "when expecting 'else'").await?;
        let else_ = self.parse_expression().await?;

        Ok(ExprAst::If {
            cond: Box::new(cond),
            then: Box::new(then),
            else_: Box::new(else_),
        })
    }

    /// - ```text
    ///   primary
    ///     ::= identifierexpr
    ///     ::= numberexpr
    ///     ::= parenexpr
    ///     ::= ifexpr
    ///   ```
    #[async_recursion]
    async fn parse_primary(&mut self) -> Result<ExprAst, ParserError> {
        let token = self.peek_token().await?.clone();
        match token.kind {
            TokenKind::LeftParen => self.parse_paren_expr().await,
            TokenKind::Identifier => self.parse_identifier_expr().await,
            TokenKind::Number => self.parse_number_expr().await,
            TokenKind::If => self.parse_if_expr().await,
            _ => Err(ParserError::syntax(
                token.location,
                format!("unexpected {} when expecting an expression", token),
            )),
        }
    }

    /// - ```text
    ///   expression
    ///     ::= primary binoprhs
    ///   ```
    #[async_recursion]
    pub async fn parse_expression(&mut self) -> Result<ExprAst, ParserError> {
        let lhs = self.parse_primary().await?;

        // 0: minimal operator precedence, so that every operator can be handled by this function.
        self.parse_bin_op_rhs(0, lhs).await
    }

    /// - ```text
    ///   binoprhs
    ///     ::= (binop primary)*
    ///   ```
    /// - Algorithm: precedence climbing
    ///   - Learn more: <https://ycpcs.github.io/cs340-fall2018/lectures/lecture06.html>
    /// - e.g. 1 < 2 < 3 < 4 + 5 * 6 + 7 + 8 * 9 < 10
    ///
    ///   ```text
    ///     prec_level
    ///      ^
    ///      |
    ///   40 |          *     *
    ///      |
    ///   20 |        +   + +
    ///   10 |  < < <           <
    ///      +--------------------> time
    ///   ```
    ///
    ///   - `prec_level`: the precedence level of the operator currently being handled.
    ///   - All operators at the same level group into a left-skewed binary tree.
    ///   - Every time the `prec_level` jumps to a higher level, a new left-skewed binary tree is created.
    ///     - The new tree becomes the right branch of the original left-skewed binary tree.
    ///
    ///   ```text
    ///                    <
    ///        <            10
    ///      <         +
    ///    <  3      +   *
    ///   1 2    +    7 8 9
    ///         4  *
    ///           5 6
    ///   ```
    #[async_recursion]
    async fn parse_bin_op_rhs(
        &mut self,
        min_prec: u8,
        mut lhs: ExprAst,
    ) -> Result<ExprAst, ParserError> {
        loop {
            let Some((op, op_prec)) = self.try_peek_bin_op_and_prec().await? else {
                // This token is not a binary operator.
                return Ok(lhs);
            };

            // The operator of every iteration handled in this function MUST have a precedence AT LEAST as high as `min_prec`.
            if op_prec < min_prec {
                // Return to the previous level of precedence.
                return Ok(lhs);
            }

            // Eat binop.
            self.take_token().await?;

            let mut rhs = self.parse_primary().await?;

            // RHS is either:
            if let Some((_, next_prec)) = self.try_peek_bin_op_and_prec().await? {
                if op_prec < next_prec {
                    // - a binary expression binding tighter than `op`, which climbs
                    //   until it meets an operator no stronger than `op`
                    rhs = self.parse_bin_op_rhs(op_prec + 1, rhs).await?;
                }
            }
            // - or a primary expression

            // LHS is always the expression root of the previous iteration.
            lhs = ExprAst::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };

            //         /
            //        op
            //       /  \
            //     op'  rhs
            //    /   \
            //  lhs' rhs'
            //
            // - `x'`: variables of the previous iteration
        }
    }

    async fn try_peek_bin_op_and_prec(&mut self) -> Result<Option<(BinaryOp, u8)>, ParserError> {
        let kind = self.peek_token().await?.kind;
        Ok(BIN_OP_PRECEDENCE.get(&kind).copied())
    }

    /// - ```text
    ///   prototype
    ///     ::= id '(' (id (',' id)*)? ')'
    ///   ```
    async fn parse_prototype(&mut self) -> Result<PrototypeAst, ParserError> {
        let name = self
            .expect(TokenKind::Identifier, "when expecting a function name in prototype")
            .await?
            .text;

        // Eat '('.
        let left_paren = self
            .expect(TokenKind::LeftParen, "when expecting '(' in prototype")
            .await?;

        let mut args = Vec::new();

        if self.peek_token().await?.kind == TokenKind::RightParen {
            // Eat ')'.
            self.take_token().await?;
            return Ok(PrototypeAst { name, args });
        }

        loop {
            let token = self.take_token().await?;
            match token.kind {
                TokenKind::Identifier => args.push(token.text),
                TokenKind::Eof => {
                    return Err(ParserError::syntax(
                        token.location,
                        format!(
                            "unexpected end of input, expected ')' closing the '(' at {}",
                            left_paren.location
                        ),
                    ))
                }
                _ => {
                    return Err(ParserError::syntax(
                        token.location,
                        format!("invalid argument name {} in prototype", token),
                    ))
                }
            }

            let token = self.take_token().await?;
            match token.kind {
                TokenKind::RightParen => break,
                TokenKind::Comma => (),
                _ => {
                    return Err(ParserError::syntax(
                        token.location,
                        format!("unexpected {} when expecting ')' or ',' in prototype", token),
                    ))
                }
            }
        }

        Ok(PrototypeAst { name, args })
    }

    /// - ```text
    ///   definition ::= 'def' prototype expression
    ///   ```
    pub async fn parse_definition(&mut self) -> Result<FunctionAst, ParserError> {
        // Eat 'def'.
        self.expect(TokenKind::Def, "when expecting 'def'").await?;

        let prototype = self.parse_prototype().await?;
        let body = self.parse_expression().await?;

        Ok(FunctionAst { prototype, body })
    }

    /// - ```text
    ///   external ::= 'extern' prototype
    ///   ```
    pub async fn parse_extern(&mut self) -> Result<PrototypeAst, ParserError> {
        // Eat 'extern'.
        self.expect(TokenKind::Extern, "when expecting 'extern'")
            .await?;

        self.parse_prototype().await
    }

    /// - ```text
    ///   toplevelexpr ::= expression
    ///   ```
    pub async fn parse_top_level_expr(&mut self) -> Result<FunctionAst, ParserError> {
        let body = self.parse_expression().await?;

        Ok(FunctionAst::anonymous(body))
    }

    pub async fn parse_semicolon(&mut self) -> Result<(), ParserError> {
        self.expect(TokenKind::Semicolon, "when expecting ';'")
            .await?;
        Ok(())
    }

    pub async fn parse_eof(&mut self) -> Result<(), ParserError> {
        self.expect(TokenKind::Eof, "when expecting end of input")
            .await?;
        Ok(())
    }

    /// Takes the next token if it is of `kind`; otherwise fails naming the token.
    async fn expect(&mut self, kind: TokenKind, context: &str) -> Result<Token, ParserError> {
        let token = self.take_token().await?;
        if token.kind != kind {
            return Err(ParserError::syntax(
                token.location,
                format!("unexpected {} {}", token, context),
            ));
        }
        Ok(token)
    }

    async fn take_token(&mut self) -> Result<Token, ParserError> {
        Ok(self.token_src.take().await?)
    }

    async fn peek_token(&mut self) -> Result<&Token, ParserError> {
        Ok(self.token_src.peek().await?)
    }
}

#[derive(Debug, PartialEq, Clone, Error)]
pub enum ParserError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error("line {line}, position {position}: {message}")]
    Syntax {
        line: usize,
        position: usize,
        message: String,
    },
}

impl ParserError {
    fn syntax(location: Location, message: String) -> Self {
        ParserError::Syntax {
            line: location.line,
            position: location.position,
            message,
        }
    }
}
