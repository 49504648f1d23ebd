//! Host function definitions.
//!
//! A [`FunctionDef`] is the statement tree a host front end hands over for a
//! decorated or plain host function. The same tree drives the reference
//! interpreter and the compiler.

use std::fmt::{self, Display, Formatter};

use crate::Ident;
use crate::error::runtime::RuntimeError;
use crate::value::Uint;

pub type Block = Vec<Stmt>;
pub type Params = Vec<Ident>;

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Ident,
    pub params: Params,
    pub body: Block,
}

impl FunctionDef {
    pub fn new(name: &str, params: &[&str], body: Block) -> Self {
        Self {
            name: Ident::new(name),
            params: params.iter().map(|p| Ident::new(p)).collect(),
            body,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(Ident, Expr),
    Return(Expr),
    /// Statement form of `match`: falls through when no arm matches.
    Match(Expr, Vec<Arm<Block>>),
    /// Host-only loop.
    While(Expr, Block),
    Expr(Expr),
}

impl Stmt {
    pub fn bind(name: &str, expr: Expr) -> Self {
        Stmt::Let(Ident::new(name), expr)
    }

    pub fn ret(expr: Expr) -> Self {
        Stmt::Return(expr)
    }

    pub fn matches(subject: Expr, arms: Vec<Arm<Block>>) -> Self {
        Stmt::Match(subject, arms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(u64),
    Var(Ident),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Call of a decorated function, a host function, or a record constructor.
    Call(Ident, Vec<Expr>),
    Field(Box<Expr>, Ident),
    Match(Box<Expr>, Vec<Arm<Expr>>),
    /// The incomplete-match sentinel.
    Incomplete,
}

impl Expr {
    pub fn lit(n: u64) -> Self {
        Expr::Literal(n)
    }

    pub fn var(name: &str) -> Self {
        Expr::Var(Ident::new(name))
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Expr::Call(Ident::new(name), args)
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn field(expr: Expr, name: &str) -> Self {
        Expr::Field(Box::new(expr), Ident::new(name))
    }

    pub fn matches(subject: Expr, arms: Vec<Arm<Expr>>) -> Self {
        Expr::Match(Box::new(subject), arms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arm<B> {
    pub pattern: Pattern,
    pub body: B,
}

impl<B> Arm<B> {
    pub fn new(pattern: Pattern, body: B) -> Self {
        Self { pattern, body }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// `Ctor(a, b)` binds every field; `Ctor()` binds none. `_` skips a field.
    Constructor(Ident, Vec<Ident>),
    Literal(u64),
    Bind(Ident),
    Wildcard,
}

impl Pattern {
    pub fn ctor(name: &str, binders: &[&str]) -> Self {
        Pattern::Constructor(
            Ident::new(name),
            binders.iter().map(|b| Ident::new(b)).collect(),
        )
    }

    pub fn bind(name: &str) -> Self {
        Pattern::Bind(Ident::new(name))
    }

    #[inline]
    pub fn is_catch_all(&self) -> bool {
        matches!(self, Pattern::Bind(_) | Pattern::Wildcard)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Constructor(name, binders) => {
                let binders = binders.iter().map(|b| b.as_str()).collect::<Vec<_>>();
                write!(f, "{}({})", name, binders.join(", "))
            }
            Pattern::Literal(n) => write!(f, "{}", n),
            Pattern::Bind(name) => write!(f, "{}", name),
            Pattern::Wildcard => write!(f, "_"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Applies the operator at width `bits`. Operands are already masked; the
    /// result wraps to the same width.
    pub fn apply(self, lhs: u64, rhs: u64, bits: u8) -> Result<u64, RuntimeError> {
        let n = match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::Div => lhs.checked_div(rhs).ok_or(RuntimeError::DivisionByZero)?,
            BinOp::Rem => lhs.checked_rem(rhs).ok_or(RuntimeError::DivisionByZero)?,
            BinOp::BitAnd => lhs & rhs,
            BinOp::BitOr => lhs | rhs,
            BinOp::BitXor => lhs ^ rhs,
            BinOp::Shl => shift_amount(rhs).map_or(0, |s| lhs << s),
            BinOp::Shr => shift_amount(rhs).map_or(0, |s| lhs >> s),
            BinOp::Eq => u64::from(lhs == rhs),
            BinOp::Ne => u64::from(lhs != rhs),
            BinOp::Lt => u64::from(lhs < rhs),
            BinOp::Le => u64::from(lhs <= rhs),
            BinOp::Gt => u64::from(lhs > rhs),
            BinOp::Ge => u64::from(lhs >= rhs),
        };
        Ok(n & Uint::mask(bits))
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

fn shift_amount(rhs: u64) -> Option<u32> {
    u32::try_from(rhs).ok().filter(|s| *s < u64::BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BinOp::Add, (1 << 24) - 1, 1, 24, 0)]
    #[case(BinOp::Sub, 0, 1, 24, (1 << 24) - 1)]
    #[case(BinOp::Mul, 1 << 23, 2, 24, 0)]
    #[case(BinOp::Div, 7, 2, 24, 3)]
    #[case(BinOp::Rem, 7, 2, 24, 1)]
    #[case(BinOp::Shl, 1, 24, 24, 0)]
    #[case(BinOp::Shl, 1, 100, 64, 0)]
    #[case(BinOp::Shr, 8, 3, 24, 1)]
    #[case(BinOp::Lt, 1, 2, 24, 1)]
    #[case(BinOp::Ge, 1, 2, 24, 0)]
    #[case(BinOp::BitXor, 0b1100, 0b1010, 8, 0b0110)]
    fn test_apply(
        #[case] op: BinOp,
        #[case] lhs: u64,
        #[case] rhs: u64,
        #[case] bits: u8,
        #[case] expected: u64,
    ) {
        assert_eq!(op.apply(lhs, rhs, bits), Ok(expected));
    }

    #[rstest]
    #[case(BinOp::Div)]
    #[case(BinOp::Rem)]
    fn test_division_by_zero(#[case] op: BinOp) {
        assert_eq!(op.apply(1, 0, 24), Err(RuntimeError::DivisionByZero));
    }

    #[test]
    fn test_pattern_display() {
        assert_eq!(Pattern::ctor("Node", &["l", "r"]).to_string(), "Node(l, r)");
        assert_eq!(Pattern::Wildcard.to_string(), "_");
        assert!(Pattern::bind("x").is_catch_all());
        assert!(!Pattern::Literal(0).is_catch_all());
    }
}
