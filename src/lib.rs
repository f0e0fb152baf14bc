pub mod ast;
pub mod code_gen;
pub mod jit;
pub mod lexer;
pub mod parser;
pub mod session;
pub mod token;
pub mod token_src;
