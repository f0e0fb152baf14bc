use crate::{
    lexer::{Lexer, LexerError},
    token::Token,
};

/// Single-token lookahead over a [`Lexer`].
pub struct TokenSource<'stream> {
    token: Option<Token>,
    lexer: Lexer<'stream>,
}

impl<'stream> TokenSource<'stream> {
    pub fn new(lexer: Lexer<'stream>) -> Self {
        Self { lexer, token: None }
    }

    pub async fn take(&mut self) -> Result<Token, LexerError> {
        match self.token.take() {
            Some(token) => Ok(token),
            None => self.lexer.get_token().await,
        }
    }

    pub async fn peek(&mut self) -> Result<&Token, LexerError> {
        let token = match self.token.take() {
            Some(token) => token,
            None => self.lexer.get_token().await?,
        };

        Ok(self.token.insert(token))
    }
}
