//! Packed IR.
//!
//! `define-inline` bodies and cross-compilation snapshots are stored as
//! a flat vector of nodes with integer cross-references. LVars get
//! their own table so unpacking can clone them: every expansion of a
//! packed body receives fresh binding sites while the topology
//! (including shared labels) is preserved.

use std::collections::HashMap;

use crate::{
    insn::Insn,
    ptr::{P, Weak},
    sexpr::Sexpr,
    tree_il::{
        make_lvar, Asm, Call, CallFlag, Define, GRef, GSet, IForm, If, LRef, LSet, LVar, Label,
        Lambda, LambdaFlag, Let, LetKind, Receive, Seq,
    },
};

pub struct PackedIForm {
    pub nodes: Vec<PackedNode>,
    /// LVar names; indices are referenced from the nodes.
    pub lvars: Vec<Sexpr>,
    pub root: u32,
}

pub enum PackedNode {
    Const(Sexpr),
    It,
    LRef { lvar: u32 },
    LSet { lvar: u32, value: u32 },
    GRef { id: Sexpr },
    GSet { id: Sexpr, value: u32 },
    Define { flags: u32, id: Sexpr, value: u32 },
    If { cond: u32, consequent: u32, alternative: u32 },
    Let { rec: bool, lvars: Vec<u32>, inits: Vec<u32>, body: u32 },
    Receive { reqargs: u32, optarg: bool, lvars: Vec<u32>, expr: u32, body: u32 },
    Lambda { name: Sexpr, reqargs: u32, optarg: bool, lvars: Vec<u32>, body: u32 },
    Label { body: u32 },
    Seq { forms: Vec<u32> },
    Call { proc: u32, args: Vec<u32>, flag: CallFlag },
    Asm { insn: Insn, args: Vec<u32> },
    Promise { expr: u32 },
    /// Two-argument constructor nodes, discriminated by the IR tag.
    Two { tag: u8, arg0: u32, arg1: u32 },
    /// Variadic constructor nodes, discriminated by the IR tag.
    Many { tag: u8, elems: Vec<u32> },
    List2Vec { arg: u32 },
    Goto { label: u32 },
}

struct Packer {
    nodes: Vec<Option<PackedNode>>,
    lvars: Vec<Sexpr>,
    lvar_ids: HashMap<P<LVar>, u32>,
    labels: HashMap<P<IForm>, u32>,
}

impl Packer {
    fn lvar_id(&mut self, lvar: &P<LVar>) -> u32 {
        if let Some(id) = self.lvar_ids.get(lvar) {
            return *id;
        }
        let id = self.lvars.len() as u32;
        self.lvars.push(lvar.name.clone());
        self.lvar_ids.insert(lvar.clone(), id);
        id
    }

    fn pack(&mut self, iform: &P<IForm>) -> u32 {
        if let IForm::Label(_) = &**iform {
            if let Some(id) = self.labels.get(iform) {
                return *id;
            }
        }

        let idx = self.nodes.len() as u32;
        self.nodes.push(None);

        let node = match &**iform {
            IForm::Const(v) => PackedNode::Const(v.clone()),
            IForm::It => PackedNode::It,
            IForm::LRef(x) => PackedNode::LRef {
                lvar: self.lvar_id(&x.lvar),
            },
            IForm::LSet(x) => PackedNode::LSet {
                lvar: self.lvar_id(&x.lvar),
                value: self.pack(&x.value),
            },
            IForm::GRef(x) => PackedNode::GRef {
                id: Sexpr::Identifier(x.id.clone()),
            },
            IForm::GSet(x) => PackedNode::GSet {
                id: Sexpr::Identifier(x.id.clone()),
                value: self.pack(&x.value),
            },
            IForm::Define(x) => PackedNode::Define {
                flags: x.flags,
                id: Sexpr::Identifier(x.id.clone()),
                value: self.pack(&x.value),
            },
            IForm::If(x) => PackedNode::If {
                cond: self.pack(&x.cond),
                consequent: self.pack(&x.consequent),
                alternative: self.pack(&x.alternative),
            },
            IForm::Let(x) => PackedNode::Let {
                rec: x.kind == LetKind::Rec,
                lvars: x.lvars.iter().map(|lv| self.lvar_id(lv)).collect(),
                inits: x.inits.iter().map(|i| self.pack(i)).collect(),
                body: self.pack(&x.body),
            },
            IForm::Receive(x) => PackedNode::Receive {
                reqargs: x.reqargs,
                optarg: x.optarg,
                lvars: x.lvars.iter().map(|lv| self.lvar_id(lv)).collect(),
                expr: self.pack(&x.expr),
                body: self.pack(&x.body),
            },
            IForm::Lambda(x) => PackedNode::Lambda {
                name: x.name.clone(),
                reqargs: x.reqargs,
                optarg: x.optarg,
                lvars: x.lvars.iter().map(|lv| self.lvar_id(lv)).collect(),
                body: self.pack(&x.body),
            },
            IForm::Label(x) => {
                self.labels.insert(iform.clone(), idx);
                PackedNode::Label {
                    body: self.pack(&x.body),
                }
            }
            IForm::Seq(x) => PackedNode::Seq {
                forms: x.forms.iter().map(|f| self.pack(f)).collect(),
            },
            IForm::Call(x) => PackedNode::Call {
                proc: self.pack(&x.proc),
                args: x.args.iter().map(|a| self.pack(a)).collect(),
                flag: x.flag,
            },
            IForm::Asm(x) => PackedNode::Asm {
                insn: x.insn.clone(),
                args: x.args.iter().map(|a| self.pack(a)).collect(),
            },
            IForm::Promise { expr, .. } => PackedNode::Promise {
                expr: self.pack(expr),
            },
            IForm::Cons { arg0, arg1 }
            | IForm::Append { arg0, arg1 }
            | IForm::Memv { arg0, arg1 }
            | IForm::Eq { arg0, arg1 }
            | IForm::Eqv { arg0, arg1 } => PackedNode::Two {
                tag: iform.tag(),
                arg0: self.pack(arg0),
                arg1: self.pack(arg1),
            },
            IForm::List { elems } | IForm::ListStar { elems } | IForm::Vector { elems } => {
                PackedNode::Many {
                    tag: iform.tag(),
                    elems: elems.iter().map(|e| self.pack(e)).collect(),
                }
            }
            IForm::List2Vec { arg } => PackedNode::List2Vec {
                arg: self.pack(arg),
            },
            IForm::Goto(target) => {
                let label = target
                    .upgrade()
                    .and_then(|l| self.labels.get(&l).copied())
                    .unwrap_or(u32::MAX);
                PackedNode::Goto { label }
            }
        };

        self.nodes[idx as usize] = Some(node);
        idx
    }
}

pub fn pack_iform(iform: &P<IForm>) -> PackedIForm {
    let mut packer = Packer {
        nodes: Vec::new(),
        lvars: Vec::new(),
        lvar_ids: HashMap::new(),
        labels: HashMap::new(),
    };
    let root = packer.pack(iform);
    PackedIForm {
        nodes: packer.nodes.into_iter().map(|n| n.unwrap()).collect(),
        lvars: packer.lvars,
        root,
    }
}

struct Unpacker<'a> {
    packed: &'a PackedIForm,
    lvars: Vec<P<LVar>>,
    labels: HashMap<u32, P<IForm>>,
}

impl<'a> Unpacker<'a> {
    fn unpack(&mut self, idx: u32) -> P<IForm> {
        if let Some(label) = self.labels.get(&idx) {
            return label.clone();
        }

        match &self.packed.nodes[idx as usize] {
            PackedNode::Const(v) => P(IForm::Const(v.clone())),
            PackedNode::It => P(IForm::It),
            PackedNode::LRef { lvar } => P(IForm::LRef(LRef {
                lvar: self.lvars[*lvar as usize].clone(),
            })),
            PackedNode::LSet { lvar, value } => {
                let value = self.unpack(*value);
                P(IForm::LSet(LSet {
                    lvar: self.lvars[*lvar as usize].clone(),
                    value,
                }))
            }
            PackedNode::GRef { id } => {
                let Sexpr::Identifier(id) = id else {
                    unreachable!("packed GREF without an identifier")
                };
                P(IForm::GRef(GRef { id: id.clone() }))
            }
            PackedNode::GSet { id, value } => {
                let Sexpr::Identifier(id) = id else {
                    unreachable!("packed GSET without an identifier")
                };
                let id = id.clone();
                let value = self.unpack(*value);
                P(IForm::GSet(GSet {
                    src: None,
                    id,
                    value,
                }))
            }
            PackedNode::Define { flags, id, value } => {
                let Sexpr::Identifier(id) = id else {
                    unreachable!("packed DEFINE without an identifier")
                };
                let id = id.clone();
                let flags = *flags;
                let value = self.unpack(*value);
                P(IForm::Define(Define {
                    src: None,
                    flags,
                    id,
                    value,
                }))
            }
            PackedNode::If {
                cond,
                consequent,
                alternative,
            } => {
                let (cond, consequent, alternative) = (*cond, *consequent, *alternative);
                P(IForm::If(If {
                    src: None,
                    cond: self.unpack(cond),
                    consequent: self.unpack(consequent),
                    alternative: self.unpack(alternative),
                }))
            }
            PackedNode::Let {
                rec,
                lvars,
                inits,
                body,
            } => {
                let rec = *rec;
                let lvar_ids = lvars.clone();
                let init_ids = inits.clone();
                let body = *body;

                let lvars: Vec<_> = lvar_ids
                    .iter()
                    .map(|i| self.lvars[*i as usize].clone())
                    .collect();
                let inits: Vec<_> = init_ids.iter().map(|i| self.unpack(*i)).collect();
                for (lvar, init) in lvars.iter().zip(inits.iter()) {
                    let mut lvar = lvar.clone();
                    lvar.initval = Some(init.clone());
                }
                P(IForm::Let(Let {
                    src: None,
                    kind: if rec { LetKind::Rec } else { LetKind::Let },
                    lvars,
                    inits,
                    body: self.unpack(body),
                }))
            }
            PackedNode::Receive {
                reqargs,
                optarg,
                lvars,
                expr,
                body,
            } => {
                let (reqargs, optarg) = (*reqargs, *optarg);
                let lvar_ids = lvars.clone();
                let (expr, body) = (*expr, *body);
                P(IForm::Receive(Receive {
                    src: None,
                    reqargs,
                    optarg,
                    lvars: lvar_ids
                        .iter()
                        .map(|i| self.lvars[*i as usize].clone())
                        .collect(),
                    expr: self.unpack(expr),
                    body: self.unpack(body),
                }))
            }
            PackedNode::Lambda {
                name,
                reqargs,
                optarg,
                lvars,
                body,
            } => {
                let name = name.clone();
                let (reqargs, optarg) = (*reqargs, *optarg);
                let lvar_ids = lvars.clone();
                let body = *body;
                P(IForm::Lambda(P(Lambda {
                    src: None,
                    name,
                    reqargs,
                    optarg,
                    lvars: lvar_ids
                        .iter()
                        .map(|i| self.lvars[*i as usize].clone())
                        .collect(),
                    body: self.unpack(body),
                    flag: LambdaFlag::None,
                    calls: vec![],
                    free_lvars: vec![],
                })))
            }
            PackedNode::Label { body } => {
                let body = *body;
                let placeholder = P(IForm::Label(Label {
                    src: None,
                    label: None,
                    body: IForm::const_undef(),
                }));
                self.labels.insert(idx, placeholder.clone());
                let unpacked = self.unpack(body);
                let mut node = placeholder.clone();
                if let IForm::Label(l) = &mut *node {
                    l.body = unpacked;
                }
                placeholder
            }
            PackedNode::Seq { forms } => {
                let ids = forms.clone();
                P(IForm::Seq(Seq {
                    src: None,
                    forms: ids.iter().map(|i| self.unpack(*i)).collect(),
                }))
            }
            PackedNode::Call { proc, args, flag } => {
                let (proc, flag) = (*proc, *flag);
                let arg_ids = args.clone();
                P(IForm::Call(Call {
                    src: None,
                    proc: self.unpack(proc),
                    args: arg_ids.iter().map(|i| self.unpack(*i)).collect(),
                    flag,
                }))
            }
            PackedNode::Asm { insn, args } => {
                let insn = insn.clone();
                let arg_ids = args.clone();
                P(IForm::Asm(Asm {
                    src: None,
                    insn,
                    args: arg_ids.iter().map(|i| self.unpack(*i)).collect(),
                }))
            }
            PackedNode::Promise { expr } => {
                let expr = *expr;
                P(IForm::Promise {
                    src: None,
                    expr: self.unpack(expr),
                })
            }
            PackedNode::Two { tag, arg0, arg1 } => {
                let tag = *tag;
                let (arg0, arg1) = (self.unpack(*arg0), self.unpack(*arg1));
                P(match tag {
                    16 => IForm::Cons { arg0, arg1 },
                    17 => IForm::Append { arg0, arg1 },
                    18 => IForm::Memv { arg0, arg1 },
                    19 => IForm::Eq { arg0, arg1 },
                    20 => IForm::Eqv { arg0, arg1 },
                    _ => unreachable!("malformed packed IR: bad two-arg tag {}", tag),
                })
            }
            PackedNode::Many { tag, elems } => {
                let tag = *tag;
                let ids = elems.clone();
                let elems: Vec<_> = ids.iter().map(|i| self.unpack(*i)).collect();
                P(match tag {
                    21 => IForm::List { elems },
                    22 => IForm::ListStar { elems },
                    23 => IForm::Vector { elems },
                    _ => unreachable!("malformed packed IR: bad variadic tag {}", tag),
                })
            }
            PackedNode::List2Vec { arg } => {
                let arg = *arg;
                P(IForm::List2Vec {
                    arg: self.unpack(arg),
                })
            }
            PackedNode::Goto { label } => {
                let label = *label;
                let target = self.labels.get(&label).cloned();
                match target {
                    Some(target) => P(IForm::Goto(Weak::new(&target))),
                    None => P(IForm::It),
                }
            }
        }
    }
}

/// Rebuilds the IR from its packed form with freshly allocated LVars.
pub fn unpack_iform(packed: &PackedIForm) -> P<IForm> {
    let mut unpacker = Unpacker {
        packed,
        lvars: packed.lvars.iter().map(|n| make_lvar(n.clone())).collect(),
        labels: HashMap::new(),
    };
    let root = unpacker.unpack(packed.root);
    crate::tree_il::reset_lvars(&root);
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_il::{iform_copy, iform_structural_eq};

    fn sample_tree() -> P<IForm> {
        let x = make_lvar(Sexpr::symbol("x"));
        let body = P(IForm::Asm(Asm {
            src: None,
            insn: Insn::NumAddI(1),
            args: vec![P(IForm::LRef(LRef { lvar: x.clone() }))],
        }));
        let lam = P(IForm::Lambda(P(Lambda {
            src: None,
            name: Sexpr::symbol("f"),
            reqargs: 1,
            optarg: false,
            lvars: vec![x],
            body,
            flag: LambdaFlag::None,
            calls: vec![],
            free_lvars: vec![],
        })));
        crate::tree_il::reset_lvars(&lam);
        lam
    }

    #[test]
    fn unpack_of_pack_matches_a_copy() {
        let tree = sample_tree();
        let packed = pack_iform(&tree);
        let unpacked = unpack_iform(&packed);
        let copied = iform_copy(&tree, &mut HashMap::new());
        assert!(iform_structural_eq(&unpacked, &copied));
        assert!(iform_structural_eq(&unpacked, &tree));
    }

    #[test]
    fn unpacking_allocates_fresh_lvars() {
        let tree = sample_tree();
        let packed = pack_iform(&tree);
        let a = unpack_iform(&packed);
        let b = unpack_iform(&packed);

        let IForm::Lambda(la) = &*a else { panic!() };
        let IForm::Lambda(lb) = &*b else { panic!() };
        assert!(!P::ptr_eq(&la.lvars[0], &lb.lvars[0]));
        assert_eq!(la.lvars[0].ref_count, 1);
    }

    #[test]
    fn label_sharing_survives_the_round_trip() {
        let shared = P(IForm::Label(Label {
            src: None,
            label: None,
            body: P(IForm::Const(Sexpr::Fixnum(1))),
        }));
        let tree = P(IForm::If(If {
            src: None,
            cond: P(IForm::Const(Sexpr::Boolean(true))),
            consequent: shared.clone(),
            alternative: shared,
        }));

        let unpacked = unpack_iform(&pack_iform(&tree));
        let IForm::If(ifn) = &*unpacked else { panic!() };
        assert!(P::ptr_eq(&ifn.consequent, &ifn.alternative));
    }
}
