use anyhow::{anyhow, bail, Result};
use serde_json::Value;

use super::lexer::Token;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Method(Box<Expr>, String, Vec<Expr>),
    Filter(Box<Expr>, String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        then: Box<Expr>,
        condition: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
}

impl Expr {
    /// True if `name` is used as a root identifier anywhere in the tree.
    pub(crate) fn references(&self, name: &str) -> bool {
        match self {
            Expr::Literal(_) => false,
            Expr::Name(n) => n == name,
            Expr::List(items) | Expr::Call(_, items) => items.iter().any(|e| e.references(name)),
            Expr::Dict(pairs) => pairs
                .iter()
                .any(|(k, v)| k.references(name) || v.references(name)),
            Expr::Attr(target, _) | Expr::Neg(target) | Expr::Not(target) => {
                target.references(name)
            }
            Expr::Index(a, b) | Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.references(name) || b.references(name)
            }
            Expr::Method(target, _, args) | Expr::Filter(target, _, args) => {
                target.references(name) || args.iter().any(|e| e.references(name))
            }
            Expr::Conditional {
                then,
                condition,
                otherwise,
            } => {
                then.references(name)
                    || condition.references(name)
                    || otherwise.as_ref().map_or(false, |e| e.references(name))
            }
        }
    }
}

pub(crate) fn parse(tokens: Vec<Token>) -> Result<Expr> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.conditional()?;
    if let Some(token) = parser.peek() {
        bail!("unexpected token {:?}", token);
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(i)) if i == keyword)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(anyhow!("expected '{}', found {:?}", op, self.peek()))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(anyhow!("expected identifier, found {:?}", other)),
        }
    }

    fn conditional(&mut self) -> Result<Expr> {
        let then = self.or()?;
        if self.eat_keyword("if") {
            let condition = self.or()?;
            let otherwise = if self.eat_keyword("else") {
                Some(Box::new(self.conditional()?))
            } else {
                None
            };
            return Ok(Expr::Conditional {
                then: Box::new(then),
                condition: Box::new(condition),
                otherwise,
            });
        }
        Ok(then)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.not()?;
        while self.eat_keyword("and") {
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut left = self.concat()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("==")) => BinaryOp::Eq,
                Some(Token::Op("!=")) => BinaryOp::Ne,
                Some(Token::Op("<")) => BinaryOp::Lt,
                Some(Token::Op("<=")) => BinaryOp::Le,
                Some(Token::Op(">")) => BinaryOp::Gt,
                Some(Token::Op(">=")) => BinaryOp::Ge,
                Some(Token::Ident(k)) if k == "in" => BinaryOp::In,
                Some(Token::Ident(k))
                    if k == "not"
                        && matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(n)) if n == "in") =>
                {
                    BinaryOp::NotIn
                }
                _ => return Ok(left),
            };
            self.pos += if op == BinaryOp::NotIn { 2 } else { 1 };
            let right = self.concat()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn concat(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        while self.eat_op("~") {
            let right = self.additive()?;
            left = Expr::Binary(BinaryOp::Concat, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                BinaryOp::Add
            } else if self.eat_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinaryOp::Mul
            } else if self.eat_op("//") {
                BinaryOp::FloorDiv
            } else if self.eat_op("/") {
                BinaryOp::Div
            } else if self.eat_op("%") {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.filtered()
    }

    fn filtered(&mut self) -> Result<Expr> {
        let mut expr = self.postfix()?;
        while self.eat_op("|") {
            let name = self.ident()?;
            let args = if self.eat_op("(") {
                self.arguments(")")?
            } else {
                Vec::new()
            };
            expr = Expr::Filter(Box::new(expr), name, args);
        }
        Ok(expr)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_op(".") {
                let name = self.ident()?;
                if self.eat_op("(") {
                    let args = self.arguments(")")?;
                    expr = Expr::Method(Box::new(expr), name, args);
                } else {
                    expr = Expr::Attr(Box::new(expr), name);
                }
            } else if self.eat_op("[") {
                let index = self.conditional()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close` (already past the opener).
    fn arguments(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat_op(close) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat_op(close) {
                return Ok(args);
            }
            self.expect_op(",")?;
            // trailing comma
            if self.eat_op(close) {
                return Ok(args);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::from(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Op("(")) => {
                let expr = self.conditional()?;
                self.expect_op(")")?;
                Ok(expr)
            }
            Some(Token::Op("[")) => Ok(Expr::List(self.arguments("]")?)),
            Some(Token::Op("{")) => {
                let mut pairs = Vec::new();
                if self.eat_op("}") {
                    return Ok(Expr::Dict(pairs));
                }
                loop {
                    let key = self.conditional()?;
                    self.expect_op(":")?;
                    let value = self.conditional()?;
                    pairs.push((key, value));
                    if self.eat_op("}") {
                        return Ok(Expr::Dict(pairs));
                    }
                    self.expect_op(",")?;
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "none" | "None" | "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.at_op("(") => {
                    self.pos += 1;
                    let args = self.arguments(")")?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Name(name)),
            },
            other => Err(anyhow!("unexpected token {:?}", other)),
        }
    }
}
