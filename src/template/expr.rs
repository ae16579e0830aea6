//! Expression tokenizer and parser.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! ternary    := or ("if" or "else" ternary)?
//! or         := and ("or" and)*
//! and        := cmp ("and" cmp)*
//! cmp        := sum (("==" | "!=" | "<" | ">" | "<=" | ">=") sum)?
//! sum        := term (("+" | "-") term)*
//! term       := factor (("*" | "/") factor)*
//! factor     := "-" factor | "not" factor | postfix
//! postfix    := primary ("." ident | "[" (int | string) "]")*
//! primary    := int | float | string | "true" | "false" | "null"
//!             | ident | "(" ternary ")"
//! ```
//!
//! Parsing is independent of evaluation so expressions can be checked at
//! validate time without an environment.

use crate::error::TemplateError;

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    /// Dotted field access (`outputs.fetch.body`).
    Field(String),
    /// Numeric subscript (`items[0]`).
    Index(usize),
    /// Quoted subscript (`outputs["fetch-orders"]`).
    Key(String),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Reference into the environment, e.g. `inputs.x` or `outputs.a[0]`.
    Path(Vec<PathSeg>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `value if cond else fallback`.
    Ternary {
        value: Box<Expr>,
        cond: Box<Expr>,
        fallback: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    EqEq,
    NotEq,
    Le,
    Ge,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
}

fn tokenize(src: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(TemplateError::syntax(src, "single '=' is not an operator"));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    return Err(TemplateError::syntax(src, "expected '!='"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    s.push(ch);
                }
                if !closed {
                    return Err(TemplateError::syntax(src, "unterminated string literal"));
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let mut num = String::new();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        num.push(d);
                        chars.next();
                    } else if d == '.' {
                        // Lookahead: `1.x` is field access on an int literal,
                        // which the grammar does not allow; only digits
                        // continue a float.
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().is_some_and(|n| n.is_ascii_digit()) {
                            is_float = true;
                            num.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                if is_float {
                    let f = num
                        .parse::<f64>()
                        .map_err(|e| TemplateError::syntax(src, e.to_string()))?;
                    tokens.push(Token::Float(f));
                } else {
                    let i = num
                        .parse::<i64>()
                        .map_err(|e| TemplateError::syntax(src, e.to_string()))?;
                    tokens.push(Token::Int(i));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(TemplateError::syntax(
                    src,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn err(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::syntax(self.src, message)
    }

    fn ternary(&mut self) -> Result<Expr, TemplateError> {
        let value = self.or()?;
        if self.eat_keyword("if") {
            let cond = self.or()?;
            if !self.eat_keyword("else") {
                return Err(self.err("expected 'else' in conditional expression"));
            }
            let fallback = self.ternary()?;
            return Ok(Expr::Ternary {
                value: Box::new(value),
                cond: Box::new(cond),
                fallback: Box::new(fallback),
            });
        }
        Ok(value)
    }

    fn or(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            let right = self.and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.comparison()?;
        while self.eat_keyword("and") {
            let right = self.comparison()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, TemplateError> {
        let left = self.sum()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.sum()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn sum(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, TemplateError> {
        if self.eat_keyword("not") {
            let operand = self.factor()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            let operand = self.factor()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, TemplateError> {
        let base = self.primary()?;

        let mut path = match base {
            Expr::Path(segs) => segs,
            other => {
                // Subscripts and field access only apply to references.
                if matches!(self.peek(), Some(Token::Dot) | Some(Token::LBracket)) {
                    return Err(self.err("field access is only supported on references"));
                }
                return Ok(other);
            }
        };

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => path.push(PathSeg::Field(name)),
                        _ => return Err(self.err("expected field name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let seg = match self.next() {
                        Some(Token::Int(i)) if i >= 0 => PathSeg::Index(i as usize),
                        Some(Token::Int(_)) => {
                            return Err(self.err("negative subscripts are not supported"))
                        }
                        Some(Token::Str(s)) => PathSeg::Key(s),
                        _ => return Err(self.err("expected integer or string subscript")),
                    };
                    if !matches!(self.next(), Some(Token::RBracket)) {
                        return Err(self.err("expected ']'"));
                    }
                    path.push(seg);
                }
                _ => break,
            }
        }

        Ok(Expr::Path(path))
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::Float(f)) => Ok(Expr::Float(f)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "if" | "else" | "and" | "or" | "not" => {
                    Err(self.err(format!("unexpected keyword '{}'", name)))
                }
                _ => Ok(Expr::Path(vec![PathSeg::Field(name)])),
            },
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                if !matches!(self.next(), Some(Token::RParen)) {
                    return Err(self.err("expected ')'"));
                }
                Ok(inner)
            }
            Some(tok) => Err(self.err(format!("unexpected token {:?}", tok))),
            None => Err(self.err("unexpected end of expression")),
        }
    }
}

/// Parse a single expression (the contents of one `${...}` or a compiled
/// condition string).
pub fn parse_expr(src: &str) -> Result<Expr, TemplateError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(TemplateError::syntax(src, "empty expression"));
    }
    let mut parser = Parser { src, tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.err("trailing tokens after expression"));
    }
    Ok(expr)
}

/// Render a path back to source form for error messages.
pub fn path_to_string(segs: &[PathSeg]) -> String {
    let mut out = String::new();
    for (i, seg) in segs.iter().enumerate() {
        match seg {
            PathSeg::Field(name) => {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSeg::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
            PathSeg::Key(key) => {
                out.push_str("[\"");
                out.push_str(key);
                out.push_str("\"]");
            }
        }
    }
    out
}
