//! The intermediate representation produced by pass 1 and rewritten by
//! pass 2.
//!
//! The tree is a closed set of tagged nodes held behind `P` handles.
//! Sharing is forbidden except for `Label` nodes, which may be referenced
//! by the jump call sites pass 2 creates; those back-references go through
//! `Goto`, a weak handle, so the refcounted tree stays acyclic.

use std::collections::{HashMap, HashSet};

use crate::{
    insn::Insn,
    ptr::{P, Weak},
    sexpr::{Identifier, Sexpr, SourceLoc},
};

/// Binding site of a lexical variable. The counters track live `LRef` /
/// `LSet` nodes and are maintained by `reset_lvars` and the pass-2
/// rewrites.
pub struct LVar {
    pub name: Sexpr,
    pub initval: Option<P<IForm>>,
    pub ref_count: u32,
    pub set_count: u32,
}

pub fn make_lvar(name: Sexpr) -> P<LVar> {
    P(LVar {
        name,
        initval: None,
        ref_count: 0,
        set_count: 0,
    })
}

impl LVar {
    pub fn is_immutable(&self) -> bool {
        self.set_count == 0
    }

    pub fn reset(&mut self) {
        self.ref_count = 0;
        self.set_count = 0;
    }

    /// The init expression, when it is safe to substitute for a reference.
    pub fn const_value(&self) -> Option<P<IForm>> {
        self.initval.clone().filter(|_| self.is_immutable())
    }
}

impl std::fmt::Debug for LVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<lvar {}.{:p}>", self.name, self)
    }
}

pub const DEFINE_CONST: u32 = 1;
pub const DEFINE_INLINE: u32 = 2;

pub struct Define {
    pub src: Option<SourceLoc>,
    pub flags: u32,
    pub id: P<Identifier>,
    pub value: P<IForm>,
}

pub struct LRef {
    pub lvar: P<LVar>,
}

pub struct LSet {
    pub lvar: P<LVar>,
    pub value: P<IForm>,
}

pub struct GRef {
    pub id: P<Identifier>,
}

pub struct GSet {
    pub src: Option<SourceLoc>,
    pub id: P<Identifier>,
    pub value: P<IForm>,
}

pub struct If {
    pub src: Option<SourceLoc>,
    pub cond: P<IForm>,
    pub consequent: P<IForm>,
    pub alternative: P<IForm>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LetKind {
    Let,
    Rec,
}

pub struct Let {
    pub src: Option<SourceLoc>,
    pub kind: LetKind,
    pub lvars: Vec<P<LVar>>,
    pub inits: Vec<P<IForm>>,
    pub body: P<IForm>,
}

pub struct Receive {
    pub src: Option<SourceLoc>,
    pub reqargs: u32,
    pub optarg: bool,
    pub lvars: Vec<P<LVar>>,
    pub expr: P<IForm>,
    pub body: P<IForm>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LambdaFlag {
    None,
    /// The lambda has been beta-expanded into its call sites; the node
    /// itself must not be compiled.
    Dissolved,
    /// The lambda body was taken over by an inline expansion.
    Inlined,
}

pub struct Lambda {
    pub src: Option<SourceLoc>,
    pub name: Sexpr,
    pub reqargs: u32,
    pub optarg: bool,
    pub lvars: Vec<P<LVar>>,
    pub body: P<IForm>,
    pub flag: LambdaFlag,
    /// Call sites of this lambda when it is statically bound, paired with
    /// the lambda nesting at the call site. Filled by the pass-2 call
    /// handler, consumed when pass 2 leaves the binding `Let`, cleared by
    /// `reset_lvars`.
    pub calls: Vec<(P<IForm>, Vec<P<Lambda>>)>,
    /// Captured variables, when the free-variable analysis runs. Until
    /// then closures conservatively capture the whole enclosing frame
    /// chain and this stays empty.
    pub free_lvars: Vec<P<LVar>>,
}

pub struct Label {
    pub src: Option<SourceLoc>,
    /// Code-generation label, assigned by pass 3 on first visit.
    pub label: Option<usize>,
    pub body: P<IForm>,
}

pub struct Seq {
    pub src: Option<SourceLoc>,
    pub forms: Vec<P<IForm>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallFlag {
    None,
    Local,
    Embed,
    Jump,
    Rec,
    TailRec,
}

pub struct Call {
    pub src: Option<SourceLoc>,
    pub proc: P<IForm>,
    pub args: Vec<P<IForm>>,
    pub flag: CallFlag,
}

pub struct Asm {
    pub src: Option<SourceLoc>,
    pub insn: Insn,
    pub args: Vec<P<IForm>>,
}

pub enum IForm {
    Const(Sexpr),
    It,
    LRef(LRef),
    LSet(LSet),
    GRef(GRef),
    GSet(GSet),
    Define(Define),
    If(If),
    Let(Let),
    Receive(Receive),
    Lambda(P<Lambda>),
    Label(Label),
    Seq(Seq),
    Call(Call),
    Asm(Asm),
    Promise { src: Option<SourceLoc>, expr: P<IForm> },
    Cons { arg0: P<IForm>, arg1: P<IForm> },
    Append { arg0: P<IForm>, arg1: P<IForm> },
    Memv { arg0: P<IForm>, arg1: P<IForm> },
    Eq { arg0: P<IForm>, arg1: P<IForm> },
    Eqv { arg0: P<IForm>, arg1: P<IForm> },
    List { elems: Vec<P<IForm>> },
    ListStar { elems: Vec<P<IForm>> },
    Vector { elems: Vec<P<IForm>> },
    List2Vec { arg: P<IForm> },
    /// Weak back-reference to a shared `Label`, used as the operator of
    /// `Call` nodes with the `Jump` flag.
    Goto(Weak<IForm>),
}

impl IForm {
    /// Small-integer discriminant used by the packer and anywhere a
    /// tag-indexed table is wanted.
    pub fn tag(&self) -> u8 {
        match self {
            IForm::Const(_) => 0,
            IForm::It => 1,
            IForm::LRef(_) => 2,
            IForm::LSet(_) => 3,
            IForm::GRef(_) => 4,
            IForm::GSet(_) => 5,
            IForm::Define(_) => 6,
            IForm::If(_) => 7,
            IForm::Let(_) => 8,
            IForm::Receive(_) => 9,
            IForm::Lambda(_) => 10,
            IForm::Label(_) => 11,
            IForm::Seq(_) => 12,
            IForm::Call(_) => 13,
            IForm::Asm(_) => 14,
            IForm::Promise { .. } => 15,
            IForm::Cons { .. } => 16,
            IForm::Append { .. } => 17,
            IForm::Memv { .. } => 18,
            IForm::Eq { .. } => 19,
            IForm::Eqv { .. } => 20,
            IForm::List { .. } => 21,
            IForm::ListStar { .. } => 22,
            IForm::Vector { .. } => 23,
            IForm::List2Vec { .. } => 24,
            IForm::Goto(_) => 25,
        }
    }

    pub fn src(&self) -> Option<SourceLoc> {
        match self {
            IForm::Define(x) => x.src.clone(),
            IForm::GSet(x) => x.src.clone(),
            IForm::If(x) => x.src.clone(),
            IForm::Let(x) => x.src.clone(),
            IForm::Receive(x) => x.src.clone(),
            IForm::Lambda(x) => x.src.clone(),
            IForm::Label(x) => x.src.clone(),
            IForm::Seq(x) => x.src.clone(),
            IForm::Call(x) => x.src.clone(),
            IForm::Asm(x) => x.src.clone(),
            IForm::Promise { src, .. } => src.clone(),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, IForm::Const(_))
    }

    pub fn as_const(&self) -> Option<&Sexpr> {
        match self {
            IForm::Const(x) => Some(x),
            _ => None,
        }
    }

    pub fn is_lref(&self) -> bool {
        matches!(self, IForm::LRef(_))
    }

    pub fn lref_lvar(&self) -> Option<&P<LVar>> {
        match self {
            IForm::LRef(x) => Some(&x.lvar),
            _ => None,
        }
    }

    pub fn const_undef() -> P<IForm> {
        P(IForm::Const(Sexpr::Undefined))
    }

    pub fn const_nil() -> P<IForm> {
        P(IForm::Const(Sexpr::Null))
    }

    /// True when evaluating the node can have no observable effect.
    pub fn is_transparent(&self) -> bool {
        match self {
            IForm::Const(_) | IForm::It | IForm::Lambda(_) => true,
            IForm::LRef(lref) => lref.lvar.is_immutable(),
            _ => false,
        }
    }
}

pub fn make_seq(src: Option<SourceLoc>, forms: Vec<P<IForm>>) -> P<IForm> {
    if forms.len() == 1 {
        forms.into_iter().next().unwrap()
    } else {
        P(IForm::Seq(Seq { src, forms }))
    }
}

/// Recomputes every LVar's counters from the live tree and clears
/// lambda call-site logs. Run before pass 2 so its bookkeeping starts
/// from accurate counts.
pub fn reset_lvars(iform: &P<IForm>) {
    let mut seen = HashSet::new();
    count(iform, &mut seen);

    fn count(iform: &P<IForm>, seen: &mut HashSet<*const IForm>) {
        let mut iform = iform.clone();
        match &mut *iform {
            IForm::LRef(lref) => lref.lvar.ref_count += 1,
            IForm::LSet(lset) => {
                lset.lvar.set_count += 1;
                count(&lset.value, seen);
            }
            IForm::GSet(gset) => count(&gset.value, seen),
            IForm::Define(def) => count(&def.value, seen),
            IForm::If(c) => {
                count(&c.cond, seen);
                count(&c.consequent, seen);
                count(&c.alternative, seen);
            }
            IForm::Let(var) => {
                for lvar in var.lvars.iter_mut() {
                    lvar.reset();
                }
                for init in &var.inits {
                    count(init, seen);
                }
                count(&var.body, seen);
            }
            IForm::Receive(r) => {
                for lvar in r.lvars.iter_mut() {
                    lvar.reset();
                }
                count(&r.expr, seen);
                count(&r.body, seen);
            }
            IForm::Lambda(lam) => {
                for lvar in lam.lvars.iter_mut() {
                    lvar.reset();
                }
                lam.calls.clear();
                count(&lam.body, seen);
            }
            IForm::Label(label) => {
                if seen.insert(label as *const Label as *const IForm) {
                    count(&label.body, seen);
                }
            }
            IForm::Seq(seq) => {
                for form in &seq.forms {
                    count(form, seen);
                }
            }
            IForm::Call(call) => {
                count(&call.proc, seen);
                for arg in &call.args {
                    count(arg, seen);
                }
            }
            IForm::Asm(asm) => {
                for arg in &asm.args {
                    count(arg, seen);
                }
            }
            IForm::Promise { expr, .. } => count(expr, seen),
            IForm::Cons { arg0, arg1 }
            | IForm::Append { arg0, arg1 }
            | IForm::Memv { arg0, arg1 }
            | IForm::Eq { arg0, arg1 }
            | IForm::Eqv { arg0, arg1 } => {
                count(arg0, seen);
                count(arg1, seen);
            }
            IForm::List { elems } | IForm::ListStar { elems } | IForm::Vector { elems } => {
                for e in elems {
                    count(e, seen);
                }
            }
            IForm::List2Vec { arg } => count(arg, seen),
            IForm::Const(_) | IForm::It | IForm::GRef(_) | IForm::Goto(_) => {}
        }
    }
}

/// Structural clone. LVars bound inside the subtree are rewritten to
/// fresh ones through `lvar_map`; LVars bound outside are kept and their
/// counters bumped for the new references. Labels are memoized so sharing
/// (and the weak `Goto` edges into it) survives the copy.
pub fn iform_copy(iform: &P<IForm>, lvar_map: &mut HashMap<P<LVar>, P<LVar>>) -> P<IForm> {
    let mut label_map = HashMap::new();
    copy(iform, lvar_map, &mut label_map)
}

fn copy_lvar(
    lvar: &P<LVar>,
    lvar_map: &mut HashMap<P<LVar>, P<LVar>>,
) -> P<LVar> {
    let fresh = make_lvar(lvar.name.clone());
    lvar_map.insert(lvar.clone(), fresh.clone());
    fresh
}

fn copy(
    iform: &P<IForm>,
    lvar_map: &mut HashMap<P<LVar>, P<LVar>>,
    label_map: &mut HashMap<P<IForm>, P<IForm>>,
) -> P<IForm> {
    match &**iform {
        IForm::Const(x) => P(IForm::Const(x.clone())),
        IForm::It => P(IForm::It),
        IForm::LRef(lref) => {
            let mut lvar = lvar_map
                .get(&lref.lvar)
                .cloned()
                .unwrap_or_else(|| lref.lvar.clone());
            lvar.ref_count += 1;
            P(IForm::LRef(LRef { lvar }))
        }
        IForm::LSet(lset) => {
            let mut lvar = lvar_map
                .get(&lset.lvar)
                .cloned()
                .unwrap_or_else(|| lset.lvar.clone());
            lvar.set_count += 1;
            let value = copy(&lset.value, lvar_map, label_map);
            P(IForm::LSet(LSet { lvar, value }))
        }
        IForm::GRef(gref) => P(IForm::GRef(GRef { id: gref.id.clone() })),
        IForm::GSet(gset) => P(IForm::GSet(GSet {
            src: gset.src.clone(),
            id: gset.id.clone(),
            value: copy(&gset.value, lvar_map, label_map),
        })),
        IForm::Define(def) => P(IForm::Define(Define {
            src: def.src.clone(),
            flags: def.flags,
            id: def.id.clone(),
            value: copy(&def.value, lvar_map, label_map),
        })),
        IForm::If(c) => P(IForm::If(If {
            src: c.src.clone(),
            cond: copy(&c.cond, lvar_map, label_map),
            consequent: copy(&c.consequent, lvar_map, label_map),
            alternative: copy(&c.alternative, lvar_map, label_map),
        })),
        IForm::Let(var) => {
            let lvars: Vec<_> = var.lvars.iter().map(|lv| copy_lvar(lv, lvar_map)).collect();
            let inits: Vec<_> = var
                .inits
                .iter()
                .map(|init| copy(init, lvar_map, label_map))
                .collect();
            for (lvar, init) in lvars.iter().zip(inits.iter()) {
                let mut lvar = lvar.clone();
                lvar.initval = Some(init.clone());
            }
            P(IForm::Let(Let {
                src: var.src.clone(),
                kind: var.kind,
                lvars,
                inits,
                body: copy(&var.body, lvar_map, label_map),
            }))
        }
        IForm::Receive(r) => {
            let lvars: Vec<_> = r.lvars.iter().map(|lv| copy_lvar(lv, lvar_map)).collect();
            P(IForm::Receive(Receive {
                src: r.src.clone(),
                reqargs: r.reqargs,
                optarg: r.optarg,
                lvars,
                expr: copy(&r.expr, lvar_map, label_map),
                body: copy(&r.body, lvar_map, label_map),
            }))
        }
        IForm::Lambda(lam) => {
            let lvars: Vec<_> = lam.lvars.iter().map(|lv| copy_lvar(lv, lvar_map)).collect();
            P(IForm::Lambda(P(Lambda {
                src: lam.src.clone(),
                name: lam.name.clone(),
                reqargs: lam.reqargs,
                optarg: lam.optarg,
                lvars,
                body: copy(&lam.body, lvar_map, label_map),
                flag: lam.flag,
                calls: vec![],
                free_lvars: vec![],
            })))
        }
        IForm::Label(label) => {
            if let Some(copied) = label_map.get(iform) {
                return copied.clone();
            }
            let placeholder = P(IForm::Label(Label {
                src: label.src.clone(),
                label: label.label,
                body: IForm::const_undef(),
            }));
            label_map.insert(iform.clone(), placeholder.clone());
            let body = copy(&label.body, lvar_map, label_map);
            let mut node = placeholder.clone();
            if let IForm::Label(l) = &mut *node {
                l.body = body;
            }
            placeholder
        }
        IForm::Seq(seq) => P(IForm::Seq(Seq {
            src: seq.src.clone(),
            forms: seq
                .forms
                .iter()
                .map(|f| copy(f, lvar_map, label_map))
                .collect(),
        })),
        IForm::Call(call) => P(IForm::Call(Call {
            src: call.src.clone(),
            proc: copy(&call.proc, lvar_map, label_map),
            args: call
                .args
                .iter()
                .map(|a| copy(a, lvar_map, label_map))
                .collect(),
            flag: call.flag,
        })),
        IForm::Asm(asm) => P(IForm::Asm(Asm {
            src: asm.src.clone(),
            insn: asm.insn.clone(),
            args: asm
                .args
                .iter()
                .map(|a| copy(a, lvar_map, label_map))
                .collect(),
        })),
        IForm::Promise { src, expr } => P(IForm::Promise {
            src: src.clone(),
            expr: copy(expr, lvar_map, label_map),
        }),
        IForm::Cons { arg0, arg1 } => P(IForm::Cons {
            arg0: copy(arg0, lvar_map, label_map),
            arg1: copy(arg1, lvar_map, label_map),
        }),
        IForm::Append { arg0, arg1 } => P(IForm::Append {
            arg0: copy(arg0, lvar_map, label_map),
            arg1: copy(arg1, lvar_map, label_map),
        }),
        IForm::Memv { arg0, arg1 } => P(IForm::Memv {
            arg0: copy(arg0, lvar_map, label_map),
            arg1: copy(arg1, lvar_map, label_map),
        }),
        IForm::Eq { arg0, arg1 } => P(IForm::Eq {
            arg0: copy(arg0, lvar_map, label_map),
            arg1: copy(arg1, lvar_map, label_map),
        }),
        IForm::Eqv { arg0, arg1 } => P(IForm::Eqv {
            arg0: copy(arg0, lvar_map, label_map),
            arg1: copy(arg1, lvar_map, label_map),
        }),
        IForm::List { elems } => P(IForm::List {
            elems: elems.iter().map(|e| copy(e, lvar_map, label_map)).collect(),
        }),
        IForm::ListStar { elems } => P(IForm::ListStar {
            elems: elems.iter().map(|e| copy(e, lvar_map, label_map)).collect(),
        }),
        IForm::Vector { elems } => P(IForm::Vector {
            elems: elems.iter().map(|e| copy(e, lvar_map, label_map)).collect(),
        }),
        IForm::List2Vec { arg } => P(IForm::List2Vec {
            arg: copy(arg, lvar_map, label_map),
        }),
        IForm::Goto(target) => {
            if let Some(orig) = target.upgrade() {
                if let Some(copied) = label_map.get(&orig) {
                    return P(IForm::Goto(Weak::new(copied)));
                }
            }
            P(IForm::Goto(target.clone()))
        }
    }
}

/// Counts IR nodes, stopping as soon as the running count exceeds
/// `limit`. The result never exceeds `limit`; an exact count is returned
/// whenever the tree is no larger than it.
pub fn iform_count_size_upto(iform: &P<IForm>, limit: usize) -> usize {
    fn sum(acc: usize, iform: &P<IForm>, limit: usize) -> usize {
        if acc > limit {
            return acc;
        }
        rec(iform, limit, acc)
    }

    fn sum_list(mut acc: usize, forms: &[P<IForm>], limit: usize) -> usize {
        for f in forms {
            acc = sum(acc, f, limit);
            if acc > limit {
                return acc;
            }
        }
        acc
    }

    fn rec(iform: &P<IForm>, limit: usize, acc: usize) -> usize {
        let acc = acc + 1;
        match &**iform {
            IForm::Const(_)
            | IForm::It
            | IForm::LRef(_)
            | IForm::GRef(_)
            | IForm::Goto(_) => acc,
            IForm::LSet(x) => sum(acc, &x.value, limit),
            IForm::GSet(x) => sum(acc, &x.value, limit),
            IForm::Define(x) => sum(acc, &x.value, limit),
            IForm::If(x) => {
                let acc = sum(acc, &x.cond, limit);
                let acc = sum(acc, &x.consequent, limit);
                sum(acc, &x.alternative, limit)
            }
            IForm::Let(x) => sum(sum_list(acc, &x.inits, limit), &x.body, limit),
            IForm::Receive(x) => sum(sum(acc, &x.expr, limit), &x.body, limit),
            IForm::Lambda(x) => sum(acc, &x.body, limit),
            IForm::Label(x) => sum(acc, &x.body, limit),
            IForm::Seq(x) => sum_list(acc, &x.forms, limit),
            IForm::Call(x) => sum(sum_list(acc, &x.args, limit), &x.proc, limit),
            IForm::Asm(x) => sum_list(acc, &x.args, limit),
            IForm::Promise { expr, .. } => sum(acc, expr, limit),
            IForm::Cons { arg0, arg1 }
            | IForm::Append { arg0, arg1 }
            | IForm::Memv { arg0, arg1 }
            | IForm::Eq { arg0, arg1 }
            | IForm::Eqv { arg0, arg1 } => sum(sum(acc, arg0, limit), arg1, limit),
            IForm::List { elems } | IForm::ListStar { elems } | IForm::Vector { elems } => {
                sum_list(acc, elems, limit)
            }
            IForm::List2Vec { arg } => sum(acc, arg, limit),
        }
    }

    rec(iform, limit, 0).min(limit)
}

/// Structural equality up to LVar and label identity: two trees are
/// equal when they have the same shape and a consistent one-to-one
/// correspondence between their binding sites.
pub fn iform_structural_eq(a: &P<IForm>, b: &P<IForm>) -> bool {
    fn lvar_eq(
        a: &P<LVar>,
        b: &P<LVar>,
        map: &mut HashMap<*const LVar, *const LVar>,
    ) -> bool {
        match map.get(&a.as_ptr()) {
            Some(mapped) => *mapped == b.as_ptr(),
            None => {
                map.insert(a.as_ptr(), b.as_ptr());
                true
            }
        }
    }

    fn all(
        xs: &[P<IForm>],
        ys: &[P<IForm>],
        lmap: &mut HashMap<*const LVar, *const LVar>,
        labmap: &mut HashMap<*const IForm, *const IForm>,
    ) -> bool {
        xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(x, y)| eq(x, y, lmap, labmap))
    }

    fn eq(
        a: &P<IForm>,
        b: &P<IForm>,
        lmap: &mut HashMap<*const LVar, *const LVar>,
        labmap: &mut HashMap<*const IForm, *const IForm>,
    ) -> bool {
        use crate::sexpr::sexp_equal;
        match (&**a, &**b) {
            (IForm::Const(x), IForm::Const(y)) => sexp_equal(x, y),
            (IForm::It, IForm::It) => true,
            (IForm::LRef(x), IForm::LRef(y)) => lvar_eq(&x.lvar, &y.lvar, lmap),
            (IForm::LSet(x), IForm::LSet(y)) => {
                lvar_eq(&x.lvar, &y.lvar, lmap) && eq(&x.value, &y.value, lmap, labmap)
            }
            (IForm::GRef(x), IForm::GRef(y)) => {
                crate::sexpr::unwrap_identifier(&x.id) == crate::sexpr::unwrap_identifier(&y.id)
            }
            (IForm::GSet(x), IForm::GSet(y)) => {
                crate::sexpr::unwrap_identifier(&x.id) == crate::sexpr::unwrap_identifier(&y.id)
                    && eq(&x.value, &y.value, lmap, labmap)
            }
            (IForm::Define(x), IForm::Define(y)) => {
                x.flags == y.flags
                    && crate::sexpr::unwrap_identifier(&x.id)
                        == crate::sexpr::unwrap_identifier(&y.id)
                    && eq(&x.value, &y.value, lmap, labmap)
            }
            (IForm::If(x), IForm::If(y)) => {
                eq(&x.cond, &y.cond, lmap, labmap)
                    && eq(&x.consequent, &y.consequent, lmap, labmap)
                    && eq(&x.alternative, &y.alternative, lmap, labmap)
            }
            (IForm::Let(x), IForm::Let(y)) => {
                x.kind == y.kind
                    && x.lvars.len() == y.lvars.len()
                    && x.lvars
                        .iter()
                        .zip(y.lvars.iter())
                        .all(|(lx, ly)| lvar_eq(lx, ly, lmap))
                    && all(&x.inits, &y.inits, lmap, labmap)
                    && eq(&x.body, &y.body, lmap, labmap)
            }
            (IForm::Receive(x), IForm::Receive(y)) => {
                x.reqargs == y.reqargs
                    && x.optarg == y.optarg
                    && x.lvars.len() == y.lvars.len()
                    && x.lvars
                        .iter()
                        .zip(y.lvars.iter())
                        .all(|(lx, ly)| lvar_eq(lx, ly, lmap))
                    && eq(&x.expr, &y.expr, lmap, labmap)
                    && eq(&x.body, &y.body, lmap, labmap)
            }
            (IForm::Lambda(x), IForm::Lambda(y)) => {
                x.reqargs == y.reqargs
                    && x.optarg == y.optarg
                    && x.flag == y.flag
                    && x.lvars.len() == y.lvars.len()
                    && x.lvars
                        .iter()
                        .zip(y.lvars.iter())
                        .all(|(lx, ly)| lvar_eq(lx, ly, lmap))
                    && eq(&x.body, &y.body, lmap, labmap)
            }
            (IForm::Label(x), IForm::Label(y)) => match labmap.get(&a.as_ptr()) {
                Some(mapped) => *mapped == b.as_ptr(),
                None => {
                    labmap.insert(a.as_ptr(), b.as_ptr());
                    eq(&x.body, &y.body, lmap, labmap)
                }
            },
            (IForm::Seq(x), IForm::Seq(y)) => all(&x.forms, &y.forms, lmap, labmap),
            (IForm::Call(x), IForm::Call(y)) => {
                x.flag == y.flag
                    && eq(&x.proc, &y.proc, lmap, labmap)
                    && all(&x.args, &y.args, lmap, labmap)
            }
            (IForm::Asm(x), IForm::Asm(y)) => {
                x.insn == y.insn && all(&x.args, &y.args, lmap, labmap)
            }
            (IForm::Promise { expr: x, .. }, IForm::Promise { expr: y, .. }) => {
                eq(x, y, lmap, labmap)
            }
            (IForm::Cons { arg0: a0, arg1: a1 }, IForm::Cons { arg0: b0, arg1: b1 })
            | (IForm::Append { arg0: a0, arg1: a1 }, IForm::Append { arg0: b0, arg1: b1 })
            | (IForm::Memv { arg0: a0, arg1: a1 }, IForm::Memv { arg0: b0, arg1: b1 })
            | (IForm::Eq { arg0: a0, arg1: a1 }, IForm::Eq { arg0: b0, arg1: b1 })
            | (IForm::Eqv { arg0: a0, arg1: a1 }, IForm::Eqv { arg0: b0, arg1: b1 }) => {
                eq(a0, b0, lmap, labmap) && eq(a1, b1, lmap, labmap)
            }
            (IForm::List { elems: x }, IForm::List { elems: y })
            | (IForm::ListStar { elems: x }, IForm::ListStar { elems: y })
            | (IForm::Vector { elems: x }, IForm::Vector { elems: y }) => {
                all(x, y, lmap, labmap)
            }
            (IForm::List2Vec { arg: x }, IForm::List2Vec { arg: y }) => eq(x, y, lmap, labmap),
            (IForm::Goto(x), IForm::Goto(y)) => match (x.upgrade(), y.upgrade()) {
                (Some(lx), Some(ly)) => match labmap.get(&lx.as_ptr()) {
                    Some(mapped) => *mapped == ly.as_ptr(),
                    None => P::ptr_eq(&lx, &ly),
                },
                _ => false,
            },
            _ => false,
        }
    }

    eq(a, b, &mut HashMap::new(), &mut HashMap::new())
}

use pretty::{BoxAllocator, DocAllocator, DocBuilder};
use termcolor::{ColorSpec, WriteColor};

impl IForm {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        let binding = |lvar: &P<LVar>, init: &P<IForm>| {
            lvar.name
                .pretty(allocator)
                .append(allocator.space())
                .append(init.pretty(allocator))
                .group()
                .brackets()
        };

        match self {
            IForm::Const(c) => allocator
                .text("const")
                .append(allocator.space())
                .append(c.pretty(allocator))
                .group()
                .parens(),
            IForm::It => allocator.text("it").parens(),
            IForm::LRef(lref) => allocator
                .text("lref")
                .append(allocator.space())
                .append(lref.lvar.name.pretty(allocator))
                .group()
                .parens(),
            IForm::LSet(lset) => allocator
                .text("lset!")
                .append(allocator.space())
                .append(lset.lvar.name.pretty(allocator))
                .append(allocator.space())
                .append(lset.value.pretty(allocator))
                .group()
                .parens(),
            IForm::GRef(gref) => allocator
                .text("gref")
                .append(allocator.space())
                .append(gref.id.name.pretty(allocator))
                .group()
                .parens(),
            IForm::GSet(gset) => allocator
                .text("gset!")
                .append(allocator.space())
                .append(gset.id.name.pretty(allocator))
                .append(allocator.space())
                .append(gset.value.pretty(allocator))
                .group()
                .parens(),
            IForm::Define(def) => allocator
                .text("define")
                .append(allocator.space())
                .append(def.id.name.pretty(allocator))
                .append(allocator.line())
                .append(def.value.pretty(allocator))
                .nest(1)
                .group()
                .parens(),
            IForm::If(c) => allocator
                .text("if")
                .append(allocator.space())
                .append(c.cond.pretty(allocator))
                .append(allocator.line())
                .append(c.consequent.pretty(allocator))
                .append(allocator.line())
                .append(c.alternative.pretty(allocator))
                .nest(1)
                .group()
                .parens(),
            IForm::Let(var) => allocator
                .text(match var.kind {
                    LetKind::Let => "let",
                    LetKind::Rec => "letrec",
                })
                .append(allocator.space())
                .append(
                    allocator
                        .intersperse(
                            var.lvars
                                .iter()
                                .zip(var.inits.iter())
                                .map(|(lv, init)| binding(lv, init)),
                            allocator.line(),
                        )
                        .group()
                        .parens(),
                )
                .append(allocator.line())
                .append(var.body.pretty(allocator))
                .nest(1)
                .group()
                .parens(),
            IForm::Receive(r) => allocator
                .text("receive")
                .append(allocator.space())
                .append(
                    allocator
                        .intersperse(
                            r.lvars.iter().map(|lv| lv.name.pretty(allocator)),
                            allocator.space(),
                        )
                        .parens(),
                )
                .append(allocator.space())
                .append(r.expr.pretty(allocator))
                .append(allocator.line())
                .append(r.body.pretty(allocator))
                .nest(1)
                .group()
                .parens(),
            IForm::Lambda(lam) => allocator
                .text("lambda")
                .append(allocator.space())
                .append(
                    allocator
                        .intersperse(
                            lam.lvars.iter().map(|lv| lv.name.pretty(allocator)),
                            allocator.space(),
                        )
                        .parens(),
                )
                .append(allocator.line())
                .append(lam.body.pretty(allocator))
                .nest(1)
                .group()
                .parens(),
            IForm::Label(label) => allocator
                .text(format!("label {:p}", self))
                .append(allocator.line())
                .append(label.body.pretty(allocator))
                .nest(1)
                .group()
                .parens(),
            IForm::Seq(seq) => allocator
                .text("seq")
                .append(allocator.space())
                .append(allocator.intersperse(
                    seq.forms.iter().map(|f| f.pretty(allocator)),
                    allocator.hardline(),
                ))
                .nest(1)
                .group()
                .parens(),
            IForm::Call(call) => allocator
                .text(match call.flag {
                    CallFlag::None => "call",
                    CallFlag::Local => "call[local]",
                    CallFlag::Embed => "call[embed]",
                    CallFlag::Jump => "call[jump]",
                    CallFlag::Rec => "call[rec]",
                    CallFlag::TailRec => "call[tail-rec]",
                })
                .append(allocator.space())
                .append(call.proc.pretty(allocator))
                .append(allocator.line())
                .append(allocator.intersperse(
                    call.args.iter().map(|a| a.pretty(allocator)),
                    allocator.line(),
                ))
                .nest(1)
                .group()
                .parens(),
            IForm::Asm(asm) => allocator
                .text("asm")
                .append(allocator.space())
                .append(allocator.text(asm.insn.to_string()))
                .append(allocator.space())
                .append(allocator.intersperse(
                    asm.args.iter().map(|a| a.pretty(allocator)),
                    allocator.line(),
                ))
                .group()
                .parens(),
            IForm::Promise { expr, .. } => allocator
                .text("promise")
                .append(allocator.space())
                .append(expr.pretty(allocator))
                .group()
                .parens(),
            IForm::Cons { arg0, arg1 } => two(allocator, "cons", arg0, arg1),
            IForm::Append { arg0, arg1 } => two(allocator, "append", arg0, arg1),
            IForm::Memv { arg0, arg1 } => two(allocator, "memv", arg0, arg1),
            IForm::Eq { arg0, arg1 } => two(allocator, "eq?", arg0, arg1),
            IForm::Eqv { arg0, arg1 } => two(allocator, "eqv?", arg0, arg1),
            IForm::List { elems } => many(allocator, "list", elems),
            IForm::ListStar { elems } => many(allocator, "list*", elems),
            IForm::Vector { elems } => many(allocator, "vector", elems),
            IForm::List2Vec { arg } => allocator
                .text("list->vector")
                .append(allocator.space())
                .append(arg.pretty(allocator))
                .group()
                .parens(),
            IForm::Goto(target) => allocator
                .text(match target.upgrade() {
                    Some(label) => format!("goto {:p}", &*label),
                    None => "goto <dead>".to_string(),
                })
                .parens(),
        }
    }

    pub fn pretty_print(&self, w: &mut dyn WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.render(78, w)
    }
}

fn two<'a, D>(
    allocator: &'a D,
    name: &str,
    arg0: &P<IForm>,
    arg1: &P<IForm>,
) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    allocator
        .text(name.to_string())
        .append(allocator.space())
        .append(arg0.pretty(allocator))
        .append(allocator.space())
        .append(arg1.pretty(allocator))
        .group()
        .parens()
}

fn many<'a, D>(allocator: &'a D, name: &str, elems: &[P<IForm>]) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    allocator
        .text(name.to_string())
        .append(allocator.space())
        .append(allocator.intersperse(elems.iter().map(|e| e.pretty(allocator)), allocator.line()))
        .group()
        .parens()
}

impl std::fmt::Display for IForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = termcolor::Buffer::no_color();
        self.pretty_print(&mut buf).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(buf.as_slice()))
    }
}

impl std::fmt::Debug for IForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lref(lvar: &P<LVar>) -> P<IForm> {
        P(IForm::LRef(LRef { lvar: lvar.clone() }))
    }

    #[test]
    fn reset_lvars_counts_refs_and_sets() {
        let x = make_lvar(Sexpr::symbol("x"));
        let body = make_seq(
            None,
            vec![
                lref(&x),
                P(IForm::LSet(LSet {
                    lvar: x.clone(),
                    value: P(IForm::Const(Sexpr::Fixnum(1))),
                })),
                lref(&x),
            ],
        );
        let node = P(IForm::Let(Let {
            src: None,
            kind: LetKind::Let,
            lvars: vec![x.clone()],
            inits: vec![P(IForm::Const(Sexpr::Fixnum(0)))],
            body,
        }));
        reset_lvars(&node);
        assert_eq!(x.ref_count, 2);
        assert_eq!(x.set_count, 1);
    }

    #[test]
    fn copy_rewrites_bound_lvars_and_keeps_free_ones() {
        let free = make_lvar(Sexpr::symbol("free"));
        let bound = make_lvar(Sexpr::symbol("bound"));
        let node = P(IForm::Let(Let {
            src: None,
            kind: LetKind::Let,
            lvars: vec![bound.clone()],
            inits: vec![P(IForm::Const(Sexpr::Fixnum(1)))],
            body: make_seq(None, vec![lref(&bound), lref(&free)]),
        }));
        reset_lvars(&node);
        let before_free_refs = free.ref_count;

        let mut map = HashMap::new();
        let copied = iform_copy(&node, &mut map);

        // the free lvar picked up one more reference, the bound one did not
        assert_eq!(free.ref_count, before_free_refs + 1);
        assert_eq!(bound.ref_count, 1);

        let IForm::Let(let_) = &*copied else {
            panic!("copy changed the node kind")
        };
        assert!(!P::ptr_eq(&let_.lvars[0], &bound));
        assert_eq!(let_.lvars[0].ref_count, 1);
    }

    #[test]
    fn count_size_is_capped_and_monotonic() {
        let node = make_seq(
            None,
            (0..10)
                .map(|i| P(IForm::Const(Sexpr::Fixnum(i))))
                .collect(),
        );
        let full = iform_count_size_upto(&node, usize::MAX);
        assert_eq!(full, 11);
        for k in 0..16 {
            let capped = iform_count_size_upto(&node, k);
            assert!(capped <= k);
            assert!(full >= capped);
        }
    }
}
