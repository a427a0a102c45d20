//! VM instruction set as seen by the compiler.
//!
//! Opcodes are opaque to every pass except for the peephole rules and the
//! operand fitting predicates. Immediate parameters (arg counts, local
//! depth/offset, small integers) are carried inside the variant; heap
//! operands (literals, identifiers, labels, code blocks) travel in the
//! `Operand` slot next to the instruction in the code buffer.

use parse_display::Display;

/// Signed operands must fit in 20 bits.
pub const MIN_SIGNED_OPERAND: i64 = -524288;
pub const MAX_SIGNED_OPERAND: i64 = 524287;
pub const MAX_UNSIGNED_OPERAND: i64 = 524287;

pub fn fits_signed_operand(n: i64) -> bool {
    (MIN_SIGNED_OPERAND..=MAX_SIGNED_OPERAND).contains(&n)
}

pub fn fits_unsigned_operand(n: i64) -> bool {
    (0..=MAX_UNSIGNED_OPERAND).contains(&n)
}

#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum Insn {
    // constants
    #[display("CONST")]
    Const,
    #[display("CONST-PUSH")]
    ConstPush,
    #[display("CONST-RET")]
    ConstRet,
    #[display("CONSTI {0}")]
    Consti(i64),
    #[display("CONSTI-PUSH {0}")]
    ConstiPush(i64),
    #[display("CONSTN")]
    ConstN,
    #[display("CONSTN-PUSH")]
    ConstNPush,
    #[display("CONSTF")]
    ConstF,
    #[display("CONSTF-PUSH")]
    ConstFPush,
    #[display("CONSTU")]
    ConstU,
    #[display("CONSTU-PUSH")]
    ConstUPush,

    // local references, generic and short forms
    #[display("LREF {depth} {offset}")]
    Lref { depth: u32, offset: u32 },
    #[display("LREF-PUSH {depth} {offset}")]
    LrefPush { depth: u32, offset: u32 },
    #[display("LREF0_0")]
    Lref00,
    #[display("LREF0_1")]
    Lref01,
    #[display("LREF0_2")]
    Lref02,
    #[display("LREF0_3")]
    Lref03,
    #[display("LREF0_4")]
    Lref04,
    #[display("LREF1_0")]
    Lref10,
    #[display("LREF1_1")]
    Lref11,
    #[display("LREF1_2")]
    Lref12,
    #[display("LREF1_3")]
    Lref13,
    #[display("LREF1_4")]
    Lref14,
    #[display("LREF0_0-PUSH")]
    Lref00Push,
    #[display("LREF0_1-PUSH")]
    Lref01Push,
    #[display("LREF0_2-PUSH")]
    Lref02Push,
    #[display("LREF0_3-PUSH")]
    Lref03Push,
    #[display("LREF0_4-PUSH")]
    Lref04Push,
    #[display("LREF1_0-PUSH")]
    Lref10Push,
    #[display("LREF1_1-PUSH")]
    Lref11Push,
    #[display("LREF1_2-PUSH")]
    Lref12Push,
    #[display("LREF1_3-PUSH")]
    Lref13Push,
    #[display("LREF1_4-PUSH")]
    Lref14Push,
    #[display("LSET {depth} {offset}")]
    Lset { depth: u32, offset: u32 },

    // globals
    #[display("GREF")]
    Gref,
    #[display("PUSH-GREF")]
    PushGref,
    #[display("GREF-CALL {0}")]
    GrefCall(u32),
    #[display("GREF-TAIL-CALL {0}")]
    GrefTailCall(u32),
    #[display("GSET")]
    Gset,
    #[display("DEFINE {0}")]
    Define(u32),

    // stack and control
    #[display("PUSH")]
    Push,
    #[display("RET")]
    Ret,
    #[display("JUMP")]
    Jump,
    #[display("PRE-CALL {0}")]
    PreCall(u32),
    #[display("PUSH-PRE-CALL {0}")]
    PushPreCall(u32),
    #[display("CALL {0}")]
    Call(u32),
    #[display("TAIL-CALL {0}")]
    TailCall(u32),
    #[display("LOCAL-ENV {0}")]
    LocalEnv(u32),
    #[display("POP-LOCAL-ENV")]
    PopLocalEnv,
    #[display("LOCAL-ENV-CLOSURES {0}")]
    LocalEnvClosures(u32),
    #[display("LOCAL-ENV-CALL {0}")]
    LocalEnvCall(u32),
    #[display("LOCAL-ENV-TAIL-CALL {0}")]
    LocalEnvTailCall(u32),
    #[display("LOCAL-ENV-JUMP {0}")]
    LocalEnvJump(u32),
    #[display("CLOSURE")]
    Closure,
    #[display("RECEIVE {reqargs} {optarg}")]
    Receive { reqargs: u32, optarg: bool },
    #[display("TAIL-RECEIVE {reqargs} {optarg}")]
    TailReceive { reqargs: u32, optarg: bool },
    #[display("PROMISE")]
    Promise,

    // branches; the target label rides in the operand slot
    #[display("BF")]
    Bf,
    #[display("BNNULL")]
    Bnnull,
    #[display("BNEQ")]
    Bneq,
    #[display("BNEQV")]
    Bneqv,
    #[display("BNEQC")]
    Bneqc,
    #[display("BNEQVC")]
    Bneqvc,
    #[display("BNUMNE")]
    Bnumne,
    #[display("BNUMNEI {0}")]
    Bnumnei(i64),
    #[display("BNLT")]
    Bnlt,
    #[display("BNLE")]
    Bnle,
    #[display("BNGT")]
    Bngt,
    #[display("BNGE")]
    Bnge,
    #[display("RT")]
    Rt,
    #[display("RF")]
    Rf,

    // operations emitted through ASM nodes and constructor IR
    #[display("NULLP")]
    Nullp,
    #[display("NOT")]
    Not,
    #[display("EQ")]
    Eq,
    #[display("EQV")]
    Eqv,
    #[display("MEMV")]
    Memv,
    #[display("CONS")]
    Cons,
    #[display("CAR")]
    Car,
    #[display("CDR")]
    Cdr,
    #[display("CAAR")]
    Caar,
    #[display("CADR")]
    Cadr,
    #[display("CDAR")]
    Cdar,
    #[display("CDDR")]
    Cddr,
    #[display("LIST {0}")]
    List(u32),
    #[display("LIST-STAR {0}")]
    ListStar(u32),
    #[display("APPEND {0}")]
    Append(u32),
    #[display("VEC {0}")]
    Vec(u32),
    #[display("LIST2VEC")]
    List2Vec,
    #[display("NUMADD2")]
    NumAdd2,
    #[display("NUMSUB2")]
    NumSub2,
    #[display("NUMMUL2")]
    NumMul2,
    #[display("NUMDIV2")]
    NumDiv2,
    #[display("NUMADDI {0}")]
    NumAddI(i64),
    #[display("NUMSUBI {0}")]
    NumSubI(i64),
    #[display("NUMEQ2")]
    NumEq2,
    #[display("NUMLT2")]
    NumLt2,
    #[display("NUMLE2")]
    NumLe2,
    #[display("NUMGT2")]
    NumGt2,
    #[display("NUMGE2")]
    NumGe2,
}

impl Insn {
    /// The canonical (possibly short-form) local-reference instruction.
    pub fn lref(depth: u32, offset: u32) -> Insn {
        match (depth, offset) {
            (0, 0) => Insn::Lref00,
            (0, 1) => Insn::Lref01,
            (0, 2) => Insn::Lref02,
            (0, 3) => Insn::Lref03,
            (0, 4) => Insn::Lref04,
            (1, 0) => Insn::Lref10,
            (1, 1) => Insn::Lref11,
            (1, 2) => Insn::Lref12,
            (1, 3) => Insn::Lref13,
            (1, 4) => Insn::Lref14,
            _ => Insn::Lref { depth, offset },
        }
    }

    /// The push-fused twin of a local-reference instruction, for the
    /// combiner.
    pub fn lref_push_twin(&self) -> Option<Insn> {
        Some(match self {
            Insn::Lref { depth, offset } => Insn::LrefPush {
                depth: *depth,
                offset: *offset,
            },
            Insn::Lref00 => Insn::Lref00Push,
            Insn::Lref01 => Insn::Lref01Push,
            Insn::Lref02 => Insn::Lref02Push,
            Insn::Lref03 => Insn::Lref03Push,
            Insn::Lref04 => Insn::Lref04Push,
            Insn::Lref10 => Insn::Lref10Push,
            Insn::Lref11 => Insn::Lref11Push,
            Insn::Lref12 => Insn::Lref12Push,
            Insn::Lref13 => Insn::Lref13Push,
            Insn::Lref14 => Insn::Lref14Push,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_lref_forms_cover_two_depths_and_five_offsets() {
        assert_eq!(Insn::lref(0, 0), Insn::Lref00);
        assert_eq!(Insn::lref(1, 4), Insn::Lref14);
        assert_eq!(Insn::lref(2, 0), Insn::Lref { depth: 2, offset: 0 });
        assert_eq!(Insn::lref(0, 5), Insn::Lref { depth: 0, offset: 5 });
    }

    #[test]
    fn operand_range_is_twenty_bits() {
        assert!(fits_signed_operand(-524288));
        assert!(fits_signed_operand(524287));
        assert!(!fits_signed_operand(524288));
        assert!(!fits_unsigned_operand(-1));
    }

    #[test]
    fn mnemonics_render() {
        assert_eq!(Insn::Consti(42).to_string(), "CONSTI 42");
        assert_eq!(Insn::lref(1, 2).to_string(), "LREF1_2");
        assert_eq!(Insn::GrefTailCall(3).to_string(), "GREF-TAIL-CALL 3");
    }
}
