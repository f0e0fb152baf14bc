use std::fmt;

/// - Learn more: <https://llvm.org/docs/tutorial/MyFirstLanguageFrontend/LangImpl01.html#the-lexer>
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum TokenKind {
    Eof,

    // commands
    Def,
    Extern,

    // reserved for control flow
    If,
    Then,
    Else,

    // primary
    Identifier,
    Number,

    // operators
    Plus,
    Minus,
    Star,
    Less,
    Greater,

    // punctuation
    Comma,
    Semicolon,
    LeftParen,
    RightParen,
}

/// Zero-based line and character offset within that line.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Location {
    pub line: usize,
    pub position: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, position {}", self.line, self.position)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub location: Location,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, location: Location) -> Self {
        Self {
            kind,
            text: text.into(),
            location,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => f.write_str("end of input"),
            _ => write!(f, "'{}'", self.text),
        }
    }
}
