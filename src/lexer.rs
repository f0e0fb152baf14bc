use async_recursion::async_recursion;
use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::token::{Location, Token, TokenKind};

pub type CharStream<'a> = dyn Stream<Item = char> + Unpin + Send + 'a;

/// - Learn more: <https://llvm.org/docs/tutorial/MyFirstLanguageFrontend/LangImpl01.html#the-lexer>
pub struct Lexer<'stream> {
    source: &'stream mut CharStream<'stream>,

    /// The current character emitted by the source stream.
    char: char,

    /// The source stream has run dry; `char` is no longer meaningful.
    eof: bool,

    /// Where `char` sits in the source.
    location: Location,

    /// Where the next character pulled from the stream will sit.
    cursor: Location,
}

impl<'stream> Lexer<'stream> {
    pub fn new(source: &'stream mut CharStream<'stream>) -> Self {
        Self {
            source,
            char: ' ',
            eof: false,
            location: Location::default(),
            cursor: Location::default(),
        }
    }

    #[async_recursion]
    pub async fn get_token(&mut self) -> Result<Token, LexerError> {
        // Skip any whitespace.
        while self.char.is_whitespace() {
            self.next_char().await;
        }

        let start = self.location;

        // Collect the identifier.
        if self.char.is_alphabetic() {
            let mut identifier = String::new();
            identifier.push(self.char);

            loop {
                self.next_char().await;
                if self.char.is_alphanumeric() {
                    identifier.push(self.char);
                } else {
                    break;
                }
            }

            let kind = match identifier.as_str() {
                "def" => TokenKind::Def,
                "extern" => TokenKind::Extern,
                "if" => TokenKind::If,
                "then" => TokenKind::Then,
                "else" => TokenKind::Else,
                _ => TokenKind::Identifier,
            };
            return Ok(Token::new(kind, identifier, start));
        }

        // Collect the number.
        if self.char.is_ascii_digit() || self.char == '.' {
            let mut number = String::new();
            number.push(self.char);

            loop {
                self.next_char().await;
                if self.char.is_ascii_digit() || self.char == '.' {
                    number.push(self.char);
                } else {
                    break;
                }
            }

            if number.parse::<f64>().is_err() {
                return Err(LexerError::InvalidNumber {
                    text: number,
                    location: start,
                });
            }
            return Ok(Token::new(TokenKind::Number, number, start));
        }

        // Skip comments.
        if self.char == '#' {
            loop {
                self.next_char().await;
                if self.char == '\r' || self.char == '\n' || self.eof {
                    break;
                }
            }

            return self.get_token().await;
        }

        // Collect EOF.
        if self.eof {
            return Ok(Token::new(TokenKind::Eof, "", start));
        }

        let kind = match self.char {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '<' => TokenKind::Less,
            '>' => TokenKind::Greater,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            unexpected => {
                self.next_char().await;
                return Err(LexerError::UnexpectedChar {
                    char: unexpected,
                    location: start,
                });
            }
        };

        let text = self.char.to_string();
        self.next_char().await;
        Ok(Token::new(kind, text, start))
    }

    async fn next_char(&mut self) {
        self.location = self.cursor;
        if self.eof {
            return;
        }
        match self.source.next().await {
            Some(char) => {
                self.char = char;
                if char == '\n' {
                    self.cursor.line += 1;
                    self.cursor.position = 0;
                } else {
                    self.cursor.position += 1;
                }
            }
            None => {
                self.char = '\0';
                self.eof = true;
            }
        }
    }
}

#[derive(Debug, PartialEq, Clone, Error)]
pub enum LexerError {
    #[error("{location}: invalid number literal '{text}'")]
    InvalidNumber { text: String, location: Location },
    #[error("{location}: unexpected character '{char}'")]
    UnexpectedChar { char: char, location: Location },
}
