//! Tokenizer and recursive-descent parser for script expressions.

use super::value::BinOp;
use super::EvalError;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Expr>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Chained comparison `a < b <= c`.
    Compare(Box<Expr>, Vec<(BinOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Every name read by this expression, in source order.
    pub fn names(&self, out: &mut Vec<String>) {
        match self {
            Expr::Name(n) => {
                if !out.contains(n) {
                    out.push(n.clone());
                }
            }
            Expr::List(items) => items.iter().for_each(|e| e.names(out)),
            Expr::Attr(obj, _) => obj.names(out),
            Expr::Index(obj, key) => {
                obj.names(out);
                key.names(out);
            }
            Expr::Call(func, args) => {
                func.names(out);
                args.iter().for_each(|e| e.names(out));
            }
            Expr::Neg(e) | Expr::Not(e) => e.names(out),
            Expr::Binary(_, l, r) | Expr::And(l, r) | Expr::Or(l, r) => {
                l.names(out);
                r.names(out);
            }
            Expr::Compare(first, rest) => {
                first.names(out);
                rest.iter().for_each(|(_, e)| e.names(out));
            }
            Expr::IfElse { cond, then, otherwise } => {
                cond.names(out);
                then.names(out);
                otherwise.names(out);
            }
            Expr::None | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Punct(&'static str),
    Eof,
}

const PUNCTUATION: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "(", ")", "[", "]",
    ",", ".",
];

fn tokenize(src: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let leading_dot = c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
        if c.is_ascii_digit() || leading_dot {
            let start = i;
            let mut is_float = false;
            while i < chars.len()
                && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_')
            {
                if chars[i] == '.' {
                    if is_float {
                        break;
                    }
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| syntax(src, "invalid number"))?)
            } else {
                Token::Int(text.parse().map_err(|_| syntax(src, "invalid number"))?)
            };
            tokens.push(token);
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            while i < chars.len() && chars[i] != quote {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                    text.push(match chars[i] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    text.push(chars[i]);
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(syntax(src, "unterminated string literal"));
            }
            i += 1;
            tokens.push(Token::Str(text));
            continue;
        }

        for p in PUNCTUATION {
            let len = p.len();
            if i + len <= chars.len() && chars[i..i + len].iter().copied().eq(p.chars()) {
                tokens.push(Token::Punct(*p));
                i += len;
                continue 'outer;
            }
        }
        return Err(syntax(src, &format!("unexpected character '{c}'")));
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn syntax(src: &str, msg: &str) -> EvalError {
    EvalError::Syntax(format!("{msg} in `{src}`"))
}

/// Parse a full expression.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { src, tokens, pos: 0 };
    if parser.peek() == &Token::Eof {
        return Err(syntax(src, "empty expression"));
    }
    let expr = parser.ternary()?;
    if parser.peek() != &Token::Eof {
        return Err(syntax(src, "unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'s> {
    src: &'s str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        // the token stream always ends with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        self.pos += 1;
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == kw)
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), EvalError> {
        if self.is_punct(p) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(self.src, &format!("expected '{p}'")))
        }
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        let then = self.or_expr()?;
        if self.is_keyword("if") {
            self.pos += 1;
            let cond = self.or_expr()?;
            if !self.is_keyword("else") {
                return Err(syntax(self.src, "expected 'else'"));
            }
            self.pos += 1;
            let otherwise = self.ternary()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(then)
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and_expr()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.not_expr()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        if self.is_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<BinOp> {
        let op = match self.peek() {
            Token::Punct("==") => BinOp::Eq,
            Token::Punct("!=") => BinOp::Ne,
            Token::Punct("<") => BinOp::Lt,
            Token::Punct("<=") => BinOp::Le,
            Token::Punct(">") => BinOp::Gt,
            Token::Punct(">=") => BinOp::Ge,
            Token::Name(n) if n == "in" => BinOp::In,
            Token::Name(n) if n == "not" => {
                if matches!(self.tokens.get(self.pos + 1), Some(Token::Name(m)) if m == "in") {
                    self.pos += 1;
                    BinOp::NotIn
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Punct("+") => BinOp::Add,
                Token::Punct("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Punct("*") => BinOp::Mul,
                Token::Punct("/") => BinOp::Div,
                Token::Punct("//") => BinOp::FloorDiv,
                Token::Punct("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.is_punct("-") {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.is_punct("+") {
            self.pos += 1;
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, EvalError> {
        let base = self.postfix()?;
        if self.is_punct("**") {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.atom()?;
        loop {
            if self.is_punct(".") {
                self.pos += 1;
                match self.next() {
                    Token::Name(attr) => expr = Expr::Attr(Box::new(expr), attr),
                    _ => return Err(syntax(self.src, "expected attribute name")),
                }
            } else if self.is_punct("[") {
                self.pos += 1;
                let key = self.ternary()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else if self.is_punct("(") {
                self.pos += 1;
                let args = self.sequence(")")?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn sequence(&mut self, close: &str) -> Result<Vec<Expr>, EvalError> {
        let mut items = Vec::new();
        while !self.is_punct(close) {
            items.push(self.ternary()?);
            if self.is_punct(",") {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.expect_punct(close)?;
        Ok(items)
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Token::Int(i) => Ok(Expr::Int(i)),
            Token::Float(f) => Ok(Expr::Float(f)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Name(n) => Ok(match n.as_str() {
                "True" | "true" => Expr::Bool(true),
                "False" | "false" => Expr::Bool(false),
                "None" => Expr::None,
                "if" | "else" | "and" | "or" | "not" | "in" => {
                    return Err(syntax(self.src, &format!("unexpected keyword '{n}'")))
                }
                _ => Expr::Name(n),
            }),
            Token::Punct("(") => {
                let inner = self.ternary()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::List(self.sequence("]")?)),
            Token::Punct(p) => Err(syntax(self.src, &format!("unexpected '{p}'"))),
            Token::Eof => Err(syntax(self.src, "unexpected end of expression")),
        }
    }
}
