//! Task script language
//!
//! One statement per line, `#` starts a comment:
//!
//! ```text
//! rotated = rot90(image)        # assignment
//! output rotated                # publish a variable
//! output total = sum(rotated)   # assign and publish
//! update("halfway", 1, 2)       # bare call
//! ```

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Var(String),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { name: String, expr: Expr },
    Output { name: String, expr: Option<Expr> },
    Expr(Expr),
}

/// A statement and its 1-based source line
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub number: usize,
    pub stmt: Stmt,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

pub fn parse(source: &str) -> Result<Vec<Line>, SyntaxError> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = index + 1;
        let tokens = tokenize(text).map_err(|message| SyntaxError { line: number, message })?;
        if tokens.is_empty() {
            continue;
        }
        let stmt = Parser::new(tokens)
            .statement()
            .map_err(|message| SyntaxError { line: number, message })?;
        lines.push(Line { number, stmt });
    }
    Ok(lines)
}

// ─────────────────────────────────────────────────────────────────────────────
// Lexer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Equals,
    Minus,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(x) => write!(f, "{x}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Equals => f.write_str("="),
            Token::Minus => f.write_str("-"),
        }
    }
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            '#' => break,
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '=' | '-' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    '=' => Token::Equals,
                    _ => Token::Minus,
                });
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, '\\')) => text.push('\\'),
                            Some((_, '"')) => text.push('"'),
                            Some((_, other)) => return Err(format!("unknown escape \\{other}")),
                            None => return Err("unterminated string".into()),
                        },
                        Some((_, other)) => text.push(other),
                        None => return Err("unterminated string".into()),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '.' || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = line[start..end].replace('_', "");
                tokens.push(number(&literal)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(line[start..end].to_string()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

fn number(literal: &str) -> Result<Token, String> {
    if let Ok(i) = literal.parse::<i64>() {
        return Ok(Token::Int(i));
    }
    literal
        .parse::<f64>()
        .map(Token::Float)
        .map_err(|_| format!("invalid number {literal:?}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn statement(mut self) -> Result<Stmt, String> {
        let stmt = match (self.tokens.first(), self.tokens.get(1)) {
            (Some(Token::Ident(keyword)), Some(Token::Ident(_))) if keyword == "output" => {
                self.pos = 1;
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err("expected an output name".into()),
                };
                let expr = match self.peek() {
                    Some(Token::Equals) => {
                        self.pos += 1;
                        Some(self.expr()?)
                    }
                    _ => None,
                };
                Stmt::Output { name, expr }
            }
            (Some(Token::Ident(name)), Some(Token::Equals)) => {
                let name = name.clone();
                self.pos = 2;
                Stmt::Assign {
                    name,
                    expr: self.expr()?,
                }
            }
            _ => Stmt::Expr(self.expr()?),
        };

        match self.peek() {
            None => Ok(stmt),
            Some(token) => Err(format!("unexpected {token} after statement")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::Float(x)) => Ok(Expr::Float(x)),
            Some(Token::Minus) => match self.next() {
                Some(Token::Int(i)) => Ok(Expr::Int(-i)),
                Some(Token::Float(x)) => Ok(Expr::Float(-x)),
                _ => Err("expected a number after '-'".into()),
            },
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let args = self.args()?;
                    Ok(Expr::Call { name, args })
                }
                _ => Ok(Expr::Var(name)),
            },
            Some(token) => Err(format!("unexpected {token}")),
            None => Err("expected an expression".into()),
        }
    }

    fn args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(token) => return Err(format!("expected , or ), found {token}")),
                None => return Err("expected ) at end of line".into()),
            }
        }
    }
}
