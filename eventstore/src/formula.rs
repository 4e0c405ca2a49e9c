//! The pricing formula language.
//!
//! A plan component's cost is an arithmetic expression over the usage
//! interval's attributes, e.g. `ceil($time_in_seconds/3600) * 0.01`. The
//! language has decimal literals, the four operators, unary minus,
//! parentheses, the functions `ceil` and `floor`, and four variables:
//! `$time_in_seconds`, `$memory_in_mb`, `$storage_in_mb`,
//! `$number_of_nodes`. Formulas are parsed to an AST once (at reference-data
//! load) and evaluated per interval segment with `rust_decimal` arithmetic,
//! so no host-language evaluation is ever involved.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("formula parse error: {0}")]
    Parse(String),
    #[error("undefined variable ${0}")]
    UndefinedVariable(String),
    #[error("division by zero in pricing formula")]
    DivisionByZero,
    #[error("numeric overflow evaluating pricing formula")]
    Overflow,
}

/// The variables a formula may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    TimeInSeconds,
    MemoryInMb,
    StorageInMb,
    NumberOfNodes,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "time_in_seconds" => Some(Variable::TimeInSeconds),
            "memory_in_mb" => Some(Variable::MemoryInMb),
            "storage_in_mb" => Some(Variable::StorageInMb),
            "number_of_nodes" => Some(Variable::NumberOfNodes),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Variable::TimeInSeconds => "time_in_seconds",
            Variable::MemoryInMb => "memory_in_mb",
            Variable::StorageInMb => "storage_in_mb",
            Variable::NumberOfNodes => "number_of_nodes",
        }
    }
}

/// Bindings for one evaluation. Attributes that are null on the usage event
/// stay `None`; referencing one is an undefined-variable error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vars {
    pub time_in_seconds: Decimal,
    pub memory_in_mb: Option<Decimal>,
    pub storage_in_mb: Option<Decimal>,
    pub number_of_nodes: Option<Decimal>,
}

impl Vars {
    fn get(&self, var: Variable) -> Result<Decimal, FormulaError> {
        let value = match var {
            Variable::TimeInSeconds => Some(self.time_in_seconds),
            Variable::MemoryInMb => self.memory_in_mb,
            Variable::StorageInMb => self.storage_in_mb,
            Variable::NumberOfNodes => self.number_of_nodes,
        };
        value.ok_or_else(|| FormulaError::UndefinedVariable(var.name().to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Ceil,
    Floor,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(Decimal),
    Variable(Variable),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        arg: Box<Expr>,
    },
}

/// A parsed pricing formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    ast: Expr,
    source: String,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.expression()?;
        if let Some(tok) = parser.peek() {
            return Err(FormulaError::Parse(format!("unexpected {tok} after expression")));
        }
        Ok(Formula {
            ast,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, vars: &Vars) -> Result<Decimal, FormulaError> {
        eval(&self.ast, vars)
    }
}

fn eval(expr: &Expr, vars: &Vars) -> Result<Decimal, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Variable(var) => vars.get(*var),
        Expr::Neg(inner) => Ok(-eval(inner, vars)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, vars)?;
            let rhs = eval(rhs, vars)?;
            match op {
                BinOp::Add => lhs.checked_add(rhs).ok_or(FormulaError::Overflow),
                BinOp::Sub => lhs.checked_sub(rhs).ok_or(FormulaError::Overflow),
                BinOp::Mul => lhs.checked_mul(rhs).ok_or(FormulaError::Overflow),
                BinOp::Div => {
                    if rhs.is_zero() {
                        return Err(FormulaError::DivisionByZero);
                    }
                    // Decimal division carries 28 significant digits and
                    // rounds half-even when the quotient exceeds them.
                    lhs.checked_div(rhs).ok_or(FormulaError::Overflow)
                }
            }
        }
        Expr::Call { func, arg } => {
            let arg = eval(arg, vars)?;
            Ok(match func {
                Func::Ceil => arg.ceil(),
                Func::Floor => arg.floor(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Variable(Variable),
    Func(Func),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Variable(v) => write!(f, "variable ${}", v.name()),
            Token::Func(Func::Ceil) => f.write_str("ceil"),
            Token::Func(Func::Floor) => f.write_str("floor"),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
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
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '$' => {
                chars.next();
                let name: String = take_while(&mut chars, |c| c.is_ascii_alphanumeric() || c == '_');
                if name.is_empty() {
                    return Err(FormulaError::Parse("'$' without a variable name".to_string()));
                }
                let var = Variable::from_name(&name)
                    .ok_or_else(|| FormulaError::UndefinedVariable(name.clone()))?;
                tokens.push(Token::Variable(var));
            }
            '0'..='9' | '.' => {
                let literal: String = take_while(&mut chars, |c| c.is_ascii_digit() || c == '.');
                let n = literal.parse::<Decimal>().map_err(|_| {
                    FormulaError::Parse(format!("invalid number literal {literal:?}"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() => {
                let word: String = take_while(&mut chars, |c| c.is_ascii_alphanumeric() || c == '_');
                let func = match word.as_str() {
                    "ceil" => Func::Ceil,
                    "floor" => Func::Floor,
                    _ => {
                        return Err(FormulaError::Parse(format!("unknown function {word:?}")));
                    }
                };
                tokens.push(Token::Func(func));
            }
            other => {
                return Err(FormulaError::Parse(format!(
                    "unexpected character {other:?} at offset {pos}"
                )));
            }
        }
    }

    Ok(tokens)
}

fn take_while(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    pred: impl Fn(char) -> bool,
) -> String {
    let mut out = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if !pred(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<(), FormulaError> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(FormulaError::Parse(format!("expected {expected}, found {tok}"))),
            None => Err(FormulaError::Parse(format!(
                "expected {expected}, found end of formula"
            ))),
        }
    }

    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            _ => None,
        } {
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Variable(var)) => Ok(Expr::Variable(var)),
            Some(Token::Func(func)) => {
                self.expect(Token::LParen)?;
                let arg = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Call {
                    func,
                    arg: Box::new(arg),
                })
            }
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(tok) => Err(FormulaError::Parse(format!("unexpected {tok}"))),
            None => Err(FormulaError::Parse("unexpected end of formula".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn eval_with_time(source: &str, seconds: i64) -> Result<Decimal, FormulaError> {
        Formula::parse(source)?.evaluate(&Vars {
            time_in_seconds: Decimal::from(seconds),
            memory_in_mb: Some(Decimal::from(1024)),
            storage_in_mb: Some(Decimal::from(512)),
            number_of_nodes: Some(Decimal::from(2)),
        })
    }

    #[test]
    fn prices_an_hour_of_compute() {
        assert_eq!(
            eval_with_time("ceil($time_in_seconds/3600) * 0.01", 3600).unwrap(),
            dec("0.01")
        );
    }

    #[test]
    fn ceil_rounds_partial_hours_up() {
        assert_eq!(
            eval_with_time("ceil($time_in_seconds/3600) * 0.01", 3601).unwrap(),
            dec("0.02")
        );
        assert_eq!(eval_with_time("ceil($time_in_seconds/3600)", 1).unwrap(), dec("1"));
    }

    #[test]
    fn floor_truncates() {
        assert_eq!(eval_with_time("floor($time_in_seconds/3600)", 7199).unwrap(), dec("1"));
    }

    #[test]
    fn respects_precedence_and_parens() {
        assert_eq!(eval_with_time("1 + 2 * 3", 0).unwrap(), dec("7"));
        assert_eq!(eval_with_time("(1 + 2) * 3", 0).unwrap(), dec("9"));
        assert_eq!(eval_with_time("10 - 2 - 3", 0).unwrap(), dec("5"));
        assert_eq!(eval_with_time("-2 * 3", 0).unwrap(), dec("-6"));
    }

    #[test]
    fn binds_all_four_variables() {
        assert_eq!(
            eval_with_time(
                "$memory_in_mb * $number_of_nodes + $storage_in_mb + $time_in_seconds",
                8
            )
            .unwrap(),
            dec("2568")
        );
    }

    #[test]
    fn null_attribute_is_undefined() {
        let formula = Formula::parse("$memory_in_mb * 2").unwrap();
        let err = formula
            .evaluate(&Vars {
                time_in_seconds: Decimal::from(60),
                ..Vars::default()
            })
            .unwrap_err();
        assert_eq!(err, FormulaError::UndefinedVariable("memory_in_mb".to_string()));
    }

    #[test]
    fn unknown_variable_is_rejected() {
        assert_eq!(
            Formula::parse("$price_in_gold").unwrap_err(),
            FormulaError::UndefinedVariable("price_in_gold".to_string())
        );
    }

    #[test]
    fn division_by_zero_fails() {
        assert_eq!(eval_with_time("1 / 0", 0).unwrap_err(), FormulaError::DivisionByZero);
        assert_eq!(
            eval_with_time("1 / (2 - 2)", 0).unwrap_err(),
            FormulaError::DivisionByZero
        );
    }

    #[test]
    fn division_keeps_high_precision() {
        let third = eval_with_time("1 / 3", 0).unwrap();
        // 28 significant digits, well past the 20 fractional digits pricing
        // requires.
        assert_eq!(third, dec("0.3333333333333333333333333333"));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(Formula::parse("1 +"), Err(FormulaError::Parse(_))));
        assert!(matches!(Formula::parse("ceil 3"), Err(FormulaError::Parse(_))));
        assert!(matches!(Formula::parse("ceil(3"), Err(FormulaError::Parse(_))));
        assert!(matches!(Formula::parse("max(1)"), Err(FormulaError::Parse(_))));
        assert!(matches!(Formula::parse("1 ^ 2"), Err(FormulaError::Parse(_))));
        assert!(matches!(Formula::parse("$"), Err(FormulaError::Parse(_))));
        assert!(matches!(Formula::parse(""), Err(FormulaError::Parse(_))));
    }

    #[test]
    fn keeps_its_source_text() {
        let formula = Formula::parse("ceil($time_in_seconds/3600) * 1").unwrap();
        assert_eq!(formula.source(), "ceil($time_in_seconds/3600) * 1");
    }
}
