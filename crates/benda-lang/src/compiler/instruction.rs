//! Register instruction set executed by [`super::machine`].

use std::fmt;

use smallvec::SmallVec;

use crate::ast::BinOp;
use crate::types::{Layout, PackedField, RecordType};

pub type Pc = u32;
pub type Args = SmallVec<[Reg; 4]>;

/// Frame-relative register index.
///
/// Parameters occupy `Reg(0)..Reg(arity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u32);

impl Reg {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// How to read one field out of a record value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Packed(PackedField),
    Boxed(u16),
}

impl FieldAccess {
    /// # Panics
    ///
    /// Panics if `index` is not a field of `record`.
    pub fn of(record: &RecordType, index: usize) -> Self {
        match &record.layout {
            Layout::Packed(slots) => FieldAccess::Packed(slots[index]),
            Layout::Boxed => FieldAccess::Boxed(index as u16),
        }
    }
}

/// Representation a constructor builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Packed(SmallVec<[PackedField; 4]>),
    /// Width to wrap each scalar field to; `None` for record fields.
    Boxed(SmallVec<[Option<u8>; 4]>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Const {
        dst: Reg,
        value: u64,
    },
    Move {
        dst: Reg,
        src: Reg,
    },
    Incomplete {
        dst: Reg,
    },
    Binary {
        dst: Reg,
        op: BinOp,
        bits: u8,
        lhs: Reg,
        rhs: Reg,
    },
    Construct {
        dst: Reg,
        tag: u8,
        shape: Shape,
        args: Args,
    },
    /// Jumps through `table[tag]`; the sentinel and out-of-range tags take
    /// `default`.
    SwitchTag {
        subject: Reg,
        table: Box<[Pc]>,
        default: Pc,
    },
    SwitchScalar {
        subject: Reg,
        cases: Box<[(u64, Pc)]>,
        default: Pc,
    },
    Unpack {
        subject: Reg,
        fields: SmallVec<[(Reg, FieldAccess); 4]>,
    },
    Field {
        dst: Reg,
        subject: Reg,
        access: FieldAccess,
    },
    Call {
        dst: Reg,
        site: u32,
        args: Args,
    },
    CallSelf {
        dst: Reg,
        args: Args,
    },
    CallHost {
        dst: Reg,
        site: u32,
        args: Args,
    },
    Jump {
        target: Pc,
    },
    Return {
        src: Reg,
    },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regs = |args: &Args| args.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ");
        match self {
            Op::Const { dst, value } => write!(f, "{} = const {}", dst, value),
            Op::Move { dst, src } => write!(f, "{} = {}", dst, src),
            Op::Incomplete { dst } => write!(f, "{} = incomplete", dst),
            Op::Binary { dst, op, bits, lhs, rhs } => {
                write!(f, "{} = {} {} {} as u{}", dst, lhs, op.symbol(), rhs, bits)
            }
            Op::Construct { dst, tag, args, .. } => {
                write!(f, "{} = construct #{}({})", dst, tag, regs(args))
            }
            Op::SwitchTag { subject, table, default } => {
                write!(f, "switch tag {} {:?} else {}", subject, table, default)
            }
            Op::SwitchScalar { subject, cases, default } => {
                write!(f, "switch {} {:?} else {}", subject, cases, default)
            }
            Op::Unpack { subject, fields } => {
                let dsts = fields.iter().map(|(r, _)| r.to_string()).collect::<Vec<_>>();
                write!(f, "{} = unpack {}", dsts.join(", "), subject)
            }
            Op::Field { dst, subject, access } => write!(f, "{} = {}.{:?}", dst, subject, access),
            Op::Call { dst, site, args } => write!(f, "{} = call @{}({})", dst, site, regs(args)),
            Op::CallSelf { dst, args } => write!(f, "{} = call self({})", dst, regs(args)),
            Op::CallHost { dst, site, args } => {
                write!(f, "{} = call host @{}({})", dst, site, regs(args))
            }
            Op::Jump { target } => write!(f, "jump {}", target),
            Op::Return { src } => write!(f, "return {}", src),
        }
    }
}
