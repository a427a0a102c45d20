//! Compiled-code builder.
//!
//! An append-only instruction buffer with label allocation and patching,
//! inspection of the previously appended instruction, and the one-back
//! peephole combiner that fuses adjacent pairs into specialized
//! instructions. `finish` seals the buffer into a `CompiledCode` with its
//! max-stack record; unresolved labels at that point are a compiler bug.

use crate::{
    error::CompileError,
    insn::Insn,
    pack::PackedIForm,
    ptr::P,
    sexpr::{sexp_equal, Identifier, Sexpr, SourceLoc},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LabelId(pub usize);

#[derive(Clone)]
pub enum ClosureInit {
    Code(P<CompiledCode>),
    Datum(Sexpr),
}

impl PartialEq for ClosureInit {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClosureInit::Code(a), ClosureInit::Code(b)) => **a == **b,
            (ClosureInit::Datum(a), ClosureInit::Datum(b)) => sexp_equal(a, b),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub enum Operand {
    None,
    /// Literal datum.
    Obj(Sexpr),
    /// Literal datum plus a branch target (BNEQC and friends).
    ObjLabel(Sexpr, LabelId),
    /// Global identifier (GREF/GSET/DEFINE).
    Id(P<Identifier>),
    Label(LabelId),
    /// Child code block (CLOSURE).
    Code(P<CompiledCode>),
    /// Closure vector of LOCAL-ENV-CLOSURES.
    Closures(Vec<ClosureInit>),
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Operand::None, Operand::None) => true,
            (Operand::Obj(a), Operand::Obj(b)) => sexp_equal(a, b),
            (Operand::ObjLabel(a, la), Operand::ObjLabel(b, lb)) => sexp_equal(a, b) && la == lb,
            (Operand::Id(a), Operand::Id(b)) => {
                crate::sexpr::unwrap_identifier(a) == crate::sexpr::unwrap_identifier(b)
                    && a.module.name == b.module.name
            }
            (Operand::Label(a), Operand::Label(b)) => a == b,
            (Operand::Code(a), Operand::Code(b)) => **a == **b,
            (Operand::Closures(a), Operand::Closures(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Obj(x) => write!(f, " {}", x),
            Operand::ObjLabel(x, l) => write!(f, " {} L{}", x, l.0),
            Operand::Id(id) => write!(f, " {}", crate::sexpr::unwrap_identifier(id)),
            Operand::Label(l) => write!(f, " L{}", l.0),
            Operand::Code(code) => write!(f, " #<code {}>", code.name),
            Operand::Closures(inits) => write!(f, " #<closures {}>", inits.len()),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct Inst {
    pub insn: Insn,
    pub operand: Operand,
    pub src: Option<SourceLoc>,
}

pub struct CompiledCode {
    pub name: Sexpr,
    pub reqargs: u32,
    pub optarg: bool,
    pub code: Vec<Inst>,
    /// Label id to instruction offset, fully resolved.
    pub label_offsets: Vec<usize>,
    pub max_stack: usize,
    pub parent: Option<Sexpr>,
    /// Packed IR snapshot, kept for inlinable definitions.
    pub intform: Option<P<PackedIForm>>,
}

impl PartialEq for CompiledCode {
    fn eq(&self, other: &Self) -> bool {
        sexp_equal(&self.name, &other.name)
            && self.reqargs == other.reqargs
            && self.optarg == other.optarg
            && self.code == other.code
            && self.label_offsets == other.label_offsets
            && self.max_stack == other.max_stack
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "#<code {} req={} opt={} maxstack={}>",
            self.name, self.reqargs, self.optarg, self.max_stack
        )?;
        for (i, inst) in self.code.iter().enumerate() {
            for (l, off) in self.label_offsets.iter().enumerate() {
                if *off == i {
                    writeln!(f, "L{}:", l)?;
                }
            }
            writeln!(f, "  {:4} {}{}", i, inst.insn, inst.operand)?;
        }
        Ok(())
    }
}

pub struct CodeBuilder {
    pub name: Sexpr,
    pub reqargs: u32,
    pub optarg: bool,
    pub parent: Option<Sexpr>,
    pub intform: Option<P<PackedIForm>>,
    code: Vec<Inst>,
    labels: Vec<Option<usize>>,
}

impl CodeBuilder {
    pub fn new(
        reqargs: u32,
        optarg: bool,
        name: Sexpr,
        parent: Option<Sexpr>,
        intform: Option<P<PackedIForm>>,
    ) -> Self {
        Self {
            name,
            reqargs,
            optarg,
            parent,
            intform,
            code: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn new_label(&mut self) -> LabelId {
        self.labels.push(None);
        LabelId(self.labels.len() - 1)
    }

    /// Binds a label to the current emit offset.
    pub fn set_label(&mut self, label: LabelId) {
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn current_insn(&self) -> Option<&Inst> {
        self.code.last()
    }

    pub fn replace_insn(&mut self, inst: Inst) {
        *self.code.last_mut().expect("replace on empty code") = inst;
    }

    /// True when some label is bound to the current offset; combining
    /// across it would break the jump target.
    fn at_label_boundary(&self) -> bool {
        let here = self.code.len();
        self.labels.iter().any(|off| *off == Some(here))
    }

    pub fn emit(&mut self, insn: Insn, src: Option<SourceLoc>) {
        self.put(insn, Operand::None, src);
    }

    pub fn put(&mut self, insn: Insn, operand: Operand, src: Option<SourceLoc>) {
        if !self.at_label_boundary() {
            if let Some(prev) = self.code.last() {
                if let Some(fused) = combine(prev, &insn, &operand) {
                    self.replace_insn(fused);
                    return;
                }
            }
        }
        self.code.push(Inst { insn, operand, src });
    }

    /// Emits the specialized constant-loading instruction for a datum.
    pub fn emit_const(&mut self, value: &Sexpr, src: Option<SourceLoc>) {
        match value {
            Sexpr::Null => self.emit(Insn::ConstN, src),
            Sexpr::Boolean(false) => self.emit(Insn::ConstF, src),
            Sexpr::Undefined => self.emit(Insn::ConstU, src),
            Sexpr::Fixnum(n) if crate::insn::fits_signed_operand(*n) => {
                self.emit(Insn::Consti(*n), src)
            }
            other => self.put(Insn::Const, Operand::Obj(other.clone()), src),
        }
    }

    pub fn finish(self, max_stack: usize) -> Result<P<CompiledCode>, CompileError> {
        let mut label_offsets = Vec::with_capacity(self.labels.len());
        for (i, off) in self.labels.iter().enumerate() {
            match off {
                Some(off) => label_offsets.push(*off),
                None => {
                    return Err(CompileError::internal(format!(
                        "unresolved label L{} in {}",
                        i, self.name
                    )))
                }
            }
        }

        Ok(P(CompiledCode {
            name: self.name,
            reqargs: self.reqargs,
            optarg: self.optarg,
            code: self.code,
            label_offsets,
            max_stack,
            parent: self.parent,
            intform: self.intform,
        }))
    }
}

/// One-back fusion table. Returns the replacement for `prev` when it and
/// the incoming instruction combine.
fn combine(prev: &Inst, insn: &Insn, operand: &Operand) -> Option<Inst> {
    let keep_prev = |fused: Insn| {
        Some(Inst {
            insn: fused,
            operand: prev.operand.clone(),
            src: prev.src.clone(),
        })
    };
    let take_new = |fused: Insn| {
        Some(Inst {
            insn: fused,
            operand: operand.clone(),
            src: prev.src.clone(),
        })
    };

    match insn {
        Insn::Push => {
            if let Some(fused) = prev.insn.lref_push_twin() {
                return keep_prev(fused);
            }
            match prev.insn {
                Insn::Const => keep_prev(Insn::ConstPush),
                Insn::Consti(n) => keep_prev(Insn::ConstiPush(n)),
                Insn::ConstN => keep_prev(Insn::ConstNPush),
                Insn::ConstF => keep_prev(Insn::ConstFPush),
                Insn::ConstU => keep_prev(Insn::ConstUPush),
                Insn::Gref => keep_prev(Insn::PushGref),
                _ => None,
            }
        }
        Insn::Ret => match prev.insn {
            Insn::Const => keep_prev(Insn::ConstRet),
            _ => None,
        },
        Insn::Call(n) => match prev.insn {
            Insn::Gref => keep_prev(Insn::GrefCall(*n)),
            _ => None,
        },
        Insn::TailCall(n) => match prev.insn {
            Insn::Gref => keep_prev(Insn::GrefTailCall(*n)),
            _ => None,
        },
        Insn::PreCall(n) => match prev.insn {
            Insn::Push => take_new(Insn::PushPreCall(*n)),
            _ => None,
        },
        Insn::Car => match prev.insn {
            Insn::Car => keep_prev(Insn::Caar),
            Insn::Cdr => keep_prev(Insn::Cadr),
            _ => None,
        },
        Insn::Cdr => match prev.insn {
            Insn::Car => keep_prev(Insn::Cdar),
            Insn::Cdr => keep_prev(Insn::Cddr),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CodeBuilder {
        CodeBuilder::new(0, false, Sexpr::symbol("test"), None, None)
    }

    #[test]
    fn lref_and_push_fuse() {
        let mut b = builder();
        b.emit(Insn::lref(0, 2), None);
        b.emit(Insn::Push, None);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code.len(), 1);
        assert_eq!(code.code[0].insn, Insn::Lref02Push);
    }

    #[test]
    fn const_ret_fuses_only_for_generic_const() {
        let mut b = builder();
        b.emit_const(&Sexpr::string("s"), None);
        b.emit(Insn::Ret, None);
        b.emit_const(&Sexpr::Fixnum(4), None);
        b.emit(Insn::Ret, None);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code[0].insn, Insn::ConstRet);
        assert_eq!(code.code[1].insn, Insn::Consti(4));
        assert_eq!(code.code[2].insn, Insn::Ret);
    }

    #[test]
    fn labels_block_combination() {
        let mut b = builder();
        b.emit(Insn::Car, None);
        let l = b.new_label();
        b.set_label(l);
        b.emit(Insn::Car, None);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code.len(), 2);
        assert_eq!(code.label_offsets[0], 1);
    }

    #[test]
    fn car_car_becomes_caar() {
        let mut b = builder();
        b.emit(Insn::Car, None);
        b.emit(Insn::Car, None);
        b.emit(Insn::Cdr, None);
        // CAR;CAR -> CAAR, then CDR does not combine with CAAR
        let code = b.finish(0).unwrap();
        assert_eq!(code.code[0].insn, Insn::Caar);
        assert_eq!(code.code[1].insn, Insn::Cdr);
    }

    #[test]
    fn unresolved_label_is_an_internal_error() {
        let mut b = builder();
        let l = b.new_label();
        b.put(Insn::Jump, Operand::Label(l), None);
        assert!(matches!(
            b.finish(0),
            Err(CompileError::Internal(_))
        ));
    }
}
