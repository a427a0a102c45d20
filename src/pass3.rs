//! Pass 3. Code generation.
//!
//! Context-directed walk from IR to instructions. The context tracks
//! whether the value is the procedure's result (`tail`), whether the
//! stack holds pending arguments (`top` vs `bottom`, deciding PRE-CALL
//! protection), and whether the value is discarded (`stmt`). Every
//! handler returns the maximum additional stack its subtree needs; the
//! entry point records that on the finished code object.

use log::trace;

use crate::{
    code::{ClosureInit, CodeBuilder, CompiledCode, LabelId, Operand},
    error::CompileError,
    insn::{fits_signed_operand, Insn},
    ptr::P,
    sexpr::Sexpr,
    tree_il::{Call, CallFlag, IForm, If, LVar, Lambda, LambdaFlag, Let, LetKind},
};

/// Slots the VM reserves at the head of a local environment frame.
pub const ENV_HEADER_SIZE: usize = 2;
/// Slots a continuation frame occupies on the stack.
pub const CONT_FRAME_SIZE: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Ctx {
    Tail,
    NormalBottom,
    NormalTop,
    StmtBottom,
    StmtTop,
}

impl Ctx {
    fn is_tail(self) -> bool {
        self == Ctx::Tail
    }

    fn is_stmt(self) -> bool {
        matches!(self, Ctx::StmtBottom | Ctx::StmtTop)
    }

    fn is_bottom(self) -> bool {
        matches!(self, Ctx::Tail | Ctx::NormalBottom | Ctx::StmtBottom)
    }

    fn normal(self) -> Ctx {
        if self.is_bottom() {
            Ctx::NormalBottom
        } else {
            Ctx::NormalTop
        }
    }

    fn stmt(self) -> Ctx {
        if self.is_bottom() {
            Ctx::StmtBottom
        } else {
            Ctx::StmtTop
        }
    }
}

/// Runtime environment: list of local frames, innermost first.
pub type Renv = Vec<Vec<P<LVar>>>;

fn renv_lookup(renv: &Renv, lvar: &P<LVar>) -> Result<(u32, u32), CompileError> {
    for (depth, frame) in renv.iter().enumerate() {
        for (offset, lv) in frame.iter().enumerate() {
            if P::ptr_eq(lv, lvar) {
                return Ok((depth as u32, offset as u32));
            }
        }
    }
    Err(CompileError::internal(format!(
        "unresolved local variable {}",
        lvar.name
    )))
}

fn renv_extend(renv: &Renv, frame: Vec<P<LVar>>) -> Renv {
    let mut out = Vec::with_capacity(renv.len() + 1);
    out.push(frame);
    out.extend(renv.iter().cloned());
    out
}

/// Compiles a whole toplevel form into the given builder.
pub fn pass3(iform: &P<IForm>, mut ccb: CodeBuilder) -> Result<P<CompiledCode>, CompileError> {
    trace!("pass3: {}", ccb.name);
    let renv = Renv::new();
    let depth = pass3_rec(iform, &mut ccb, &renv, Ctx::Tail)?;
    ccb.emit(Insn::Ret, None);
    ccb.finish(depth)
}

/// Compiles a lambda body into a fresh child code block.
pub fn compile_lambda(
    lam: &P<Lambda>,
    parent: Option<Sexpr>,
    renv: &Renv,
    intform: Option<P<crate::pack::PackedIForm>>,
) -> Result<P<CompiledCode>, CompileError> {
    let mut ccb = CodeBuilder::new(lam.reqargs, lam.optarg, lam.name.clone(), parent, intform);
    let renv = renv_extend(renv, lam.lvars.clone());
    let depth = pass3_rec(&lam.body, &mut ccb, &renv, Ctx::Tail)?;
    ccb.emit(Insn::Ret, lam.src.clone());
    ccb.finish(ENV_HEADER_SIZE + lam.lvars.len() + depth)
}

fn pass3_rec(
    iform: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
    ctx: Ctx,
) -> Result<usize, CompileError> {
    match &**iform {
        IForm::Const(value) => {
            if !ctx.is_stmt() {
                ccb.emit_const(value, None);
            }
            Ok(0)
        }
        IForm::It => Ok(0),
        IForm::LRef(lref) => {
            if !ctx.is_stmt() {
                let (depth, offset) = renv_lookup(renv, &lref.lvar)?;
                ccb.emit(Insn::lref(depth, offset), None);
            }
            Ok(0)
        }
        IForm::LSet(lset) => {
            let d = pass3_rec(&lset.value, ccb, renv, ctx.normal())?;
            let (depth, offset) = renv_lookup(renv, &lset.lvar)?;
            ccb.emit(Insn::Lset { depth, offset }, None);
            Ok(d)
        }
        IForm::GRef(gref) => {
            ccb.put(Insn::Gref, Operand::Id(gref.id.clone()), None);
            Ok(0)
        }
        IForm::GSet(gset) => {
            let d = pass3_rec(&gset.value, ccb, renv, ctx.normal())?;
            ccb.put(Insn::Gset, Operand::Id(gset.id.clone()), gset.src.clone());
            Ok(d)
        }
        IForm::Define(def) => {
            let d = pass3_rec(&def.value, ccb, renv, ctx.normal())?;
            ccb.put(
                Insn::Define(def.flags),
                Operand::Id(def.id.clone()),
                def.src.clone(),
            );
            Ok(d)
        }
        IForm::Seq(seq) => {
            if seq.forms.is_empty() {
                return Ok(0);
            }
            let last = seq.forms.len() - 1;
            let mut depth = 0;
            for (i, form) in seq.forms.iter().enumerate() {
                let d = pass3_rec(form, ccb, renv, if i == last { ctx } else { ctx.stmt() })?;
                depth = depth.max(d);
            }
            Ok(depth)
        }
        IForm::If(_) => pass3_if(iform, ccb, renv, ctx),
        IForm::Let(_) => pass3_let(iform, ccb, renv, ctx),
        IForm::Receive(recv) => {
            let d_expr = pass3_rec(&recv.expr, ccb, renv, ctx.normal())?;
            let insn = if ctx.is_tail() {
                Insn::TailReceive {
                    reqargs: recv.reqargs,
                    optarg: recv.optarg,
                }
            } else {
                Insn::Receive {
                    reqargs: recv.reqargs,
                    optarg: recv.optarg,
                }
            };
            ccb.emit(insn, recv.src.clone());
            let renv2 = renv_extend(renv, recv.lvars.clone());
            let d_body = pass3_rec(&recv.body, ccb, &renv2, ctx)?;
            if !ctx.is_tail() {
                ccb.emit(Insn::PopLocalEnv, None);
            }
            Ok(d_expr.max(ENV_HEADER_SIZE + recv.lvars.len() + d_body))
        }
        IForm::Lambda(lam) => {
            if lam.flag == LambdaFlag::Dissolved {
                return Err(CompileError::internal(
                    "dissolved lambda reached code generation",
                ));
            }
            let code = compile_lambda(lam, Some(ccb.name.clone()), renv, None)?;
            ccb.put(Insn::Closure, Operand::Code(code), lam.src.clone());
            Ok(0)
        }
        IForm::Label(_) => {
            let placed = {
                let IForm::Label(label) = &**iform else {
                    unreachable!()
                };
                label.label
            };
            match placed {
                Some(id) => {
                    ccb.put(Insn::Jump, Operand::Label(LabelId(id)), None);
                    Ok(0)
                }
                None => {
                    let l = ccb.new_label();
                    {
                        let mut node = iform.clone();
                        let IForm::Label(label) = &mut *node else {
                            unreachable!()
                        };
                        label.label = Some(l.0);
                    }
                    ccb.set_label(l);
                    let IForm::Label(label) = &**iform else {
                        unreachable!()
                    };
                    pass3_rec(&label.body, ccb, renv, ctx)
                }
            }
        }
        IForm::Call(_) => pass3_call(iform, ccb, renv, ctx),
        IForm::Asm(asm) => {
            let d = pass3_op_args(&asm.args, ccb, renv)?;
            ccb.emit(asm.insn.clone(), asm.src.clone());
            Ok(d)
        }
        IForm::Promise { src, expr } => {
            let d = pass3_rec(expr, ccb, renv, ctx.normal())?;
            ccb.emit(Insn::Promise, src.clone());
            Ok(d)
        }
        IForm::Cons { arg0, arg1 } => pass3_binary(Insn::Cons, arg0, arg1, ccb, renv),
        IForm::Append { arg0, arg1 } => pass3_binary(Insn::Append(2), arg0, arg1, ccb, renv),
        IForm::Memv { arg0, arg1 } => pass3_binary(Insn::Memv, arg0, arg1, ccb, renv),
        IForm::Eq { arg0, arg1 } => pass3_binary(Insn::Eq, arg0, arg1, ccb, renv),
        IForm::Eqv { arg0, arg1 } => pass3_binary(Insn::Eqv, arg0, arg1, ccb, renv),
        IForm::List { elems } => {
            if elems.is_empty() {
                if !ctx.is_stmt() {
                    ccb.emit(Insn::ConstN, None);
                }
                return Ok(0);
            }
            let d = pass3_op_args(elems, ccb, renv)?;
            ccb.emit(Insn::List(elems.len() as u32), None);
            Ok(d)
        }
        IForm::ListStar { elems } => {
            let d = pass3_op_args(elems, ccb, renv)?;
            ccb.emit(Insn::ListStar(elems.len() as u32), None);
            Ok(d)
        }
        IForm::Vector { elems } => {
            let d = pass3_op_args(elems, ccb, renv)?;
            ccb.emit(Insn::Vec(elems.len() as u32), None);
            Ok(d)
        }
        IForm::List2Vec { arg } => {
            let d = pass3_rec(arg, ccb, renv, ctx.normal())?;
            ccb.emit(Insn::List2Vec, None);
            Ok(d)
        }
        IForm::Goto(_) => Err(CompileError::internal(
            "jump target outside a jump call reached code generation",
        )),
    }
}

/// Operand convention for operation instructions: all but the last
/// argument are pushed, the last is left in the value register.
fn pass3_op_args(
    args: &[P<IForm>],
    ccb: &mut CodeBuilder,
    renv: &Renv,
) -> Result<usize, CompileError> {
    if args.is_empty() {
        return Ok(0);
    }
    let mut depth = 0;
    let last = args.len() - 1;
    for (i, arg) in args.iter().enumerate() {
        let d = pass3_rec(arg, ccb, renv, Ctx::NormalTop)?;
        if i != last {
            ccb.emit(Insn::Push, None);
        }
        depth = depth.max(i + d);
    }
    Ok(depth + args.len())
}

fn pass3_binary(
    insn: Insn,
    arg0: &P<IForm>,
    arg1: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
) -> Result<usize, CompileError> {
    let d = pass3_op_args(&[arg0.clone(), arg1.clone()], ccb, renv)?;
    ccb.emit(insn, None);
    Ok(d)
}

/// Pushes every argument of a call.
fn pass3_prepare_args(
    args: &[P<IForm>],
    ccb: &mut CodeBuilder,
    renv: &Renv,
) -> Result<usize, CompileError> {
    let mut depth = 0;
    for (i, arg) in args.iter().enumerate() {
        let d = pass3_rec(arg, ccb, renv, Ctx::NormalTop)?;
        ccb.emit(Insn::Push, None);
        depth = depth.max(i + d);
    }
    Ok(depth + args.len())
}

enum TestPlan {
    Generic,
    Branch(Insn),
    BranchConst(Insn, Sexpr),
}

fn pass3_if(
    iform: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
    ctx: Ctx,
) -> Result<usize, CompileError> {
    let IForm::If(node) = &**iform else {
        unreachable!()
    };

    // (if (not x) a b) compiles as (if x b a)
    if let IForm::Asm(asm) = &*node.cond {
        if asm.insn == Insn::Not
            && !matches!(&*node.consequent, IForm::It)
            && !matches!(&*node.alternative, IForm::It)
        {
            let swapped = P(IForm::If(If {
                src: node.src.clone(),
                cond: asm.args[0].clone(),
                consequent: node.alternative.clone(),
                alternative: node.consequent.clone(),
            }));
            return pass3_if(&swapped, ccb, renv, ctx);
        }
    }

    let (d_test, plan) = pass3_emit_test(&node.cond, ccb, renv, ctx)?;

    // return-if-true / return-if-false when a branch is the test value
    if matches!(plan, TestPlan::Generic) && ctx.is_tail() {
        if matches!(&*node.consequent, IForm::It) {
            ccb.emit(Insn::Rt, node.src.clone());
            let d_else = pass3_rec(&node.alternative, ccb, renv, ctx)?;
            return Ok(d_test.max(d_else));
        }
        if matches!(&*node.alternative, IForm::It) {
            ccb.emit(Insn::Rf, node.src.clone());
            let d_then = pass3_rec(&node.consequent, ccb, renv, ctx)?;
            return Ok(d_test.max(d_then));
        }
    }

    let else_label = ccb.new_label();
    match plan {
        TestPlan::Generic => ccb.put(Insn::Bf, Operand::Label(else_label), node.src.clone()),
        TestPlan::Branch(insn) => ccb.put(insn, Operand::Label(else_label), node.src.clone()),
        TestPlan::BranchConst(insn, obj) => {
            ccb.put(insn, Operand::ObjLabel(obj, else_label), node.src.clone())
        }
    }

    let d_then = pass3_rec(&node.consequent, ccb, renv, ctx)?;
    let merge = if ctx.is_tail() {
        ccb.emit(Insn::Ret, None);
        None
    } else {
        let merge = ccb.new_label();
        ccb.put(Insn::Jump, Operand::Label(merge), None);
        Some(merge)
    };

    ccb.set_label(else_label);
    let d_else = pass3_rec(&node.alternative, ccb, renv, ctx)?;
    if let Some(merge) = merge {
        ccb.set_label(merge);
    }

    Ok(d_test.max(d_then).max(d_else))
}

/// Emits the code computing a branch test and picks the branch
/// instruction from the shape of the test.
fn pass3_emit_test(
    test: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
    ctx: Ctx,
) -> Result<(usize, TestPlan), CompileError> {
    fn eq_like(
        arg0: &P<IForm>,
        arg1: &P<IForm>,
        plain: Insn,
        with_const: Insn,
        ccb: &mut CodeBuilder,
        renv: &Renv,
        ctx: Ctx,
    ) -> Result<(usize, TestPlan), CompileError> {
        if let Some(c) = arg0.as_const() {
            let d = pass3_rec(arg1, ccb, renv, ctx.normal())?;
            return Ok((d, TestPlan::BranchConst(with_const, c.clone())));
        }
        if let Some(c) = arg1.as_const() {
            let d = pass3_rec(arg0, ccb, renv, ctx.normal())?;
            return Ok((d, TestPlan::BranchConst(with_const, c.clone())));
        }
        two_sided(arg0, arg1, plain, ccb, renv, ctx)
    }

    fn two_sided(
        arg0: &P<IForm>,
        arg1: &P<IForm>,
        insn: Insn,
        ccb: &mut CodeBuilder,
        renv: &Renv,
        ctx: Ctx,
    ) -> Result<(usize, TestPlan), CompileError> {
        let d0 = pass3_rec(arg0, ccb, renv, ctx.normal())?;
        ccb.emit(Insn::Push, None);
        let d1 = pass3_rec(arg1, ccb, renv, Ctx::NormalTop)?;
        Ok((d0.max(d1 + 1) + 1, TestPlan::Branch(insn)))
    }

    fn small_int(iform: &P<IForm>) -> Option<i64> {
        match iform.as_const() {
            Some(Sexpr::Fixnum(n)) if fits_signed_operand(*n) => Some(*n),
            _ => None,
        }
    }

    if let IForm::Asm(asm) = &**test {
        match asm.insn {
            Insn::Nullp if asm.args.len() == 1 => {
                let d = pass3_rec(&asm.args[0], ccb, renv, ctx.normal())?;
                return Ok((d, TestPlan::Branch(Insn::Bnnull)));
            }
            Insn::Eq if asm.args.len() == 2 => {
                return eq_like(
                    &asm.args[0],
                    &asm.args[1],
                    Insn::Bneq,
                    Insn::Bneqc,
                    ccb,
                    renv,
                    ctx,
                );
            }
            Insn::Eqv if asm.args.len() == 2 => {
                return eq_like(
                    &asm.args[0],
                    &asm.args[1],
                    Insn::Bneqv,
                    Insn::Bneqvc,
                    ccb,
                    renv,
                    ctx,
                );
            }
            Insn::NumEq2 if asm.args.len() == 2 => {
                if let Some(n) = small_int(&asm.args[0]) {
                    let d = pass3_rec(&asm.args[1], ccb, renv, ctx.normal())?;
                    return Ok((d, TestPlan::Branch(Insn::Bnumnei(n))));
                }
                if let Some(n) = small_int(&asm.args[1]) {
                    let d = pass3_rec(&asm.args[0], ccb, renv, ctx.normal())?;
                    return Ok((d, TestPlan::Branch(Insn::Bnumnei(n))));
                }
                return two_sided(&asm.args[0], &asm.args[1], Insn::Bnumne, ccb, renv, ctx);
            }
            Insn::NumLt2 if asm.args.len() == 2 => {
                return two_sided(&asm.args[0], &asm.args[1], Insn::Bnlt, ccb, renv, ctx);
            }
            Insn::NumLe2 if asm.args.len() == 2 => {
                return two_sided(&asm.args[0], &asm.args[1], Insn::Bnle, ccb, renv, ctx);
            }
            Insn::NumGt2 if asm.args.len() == 2 => {
                return two_sided(&asm.args[0], &asm.args[1], Insn::Bngt, ccb, renv, ctx);
            }
            Insn::NumGe2 if asm.args.len() == 2 => {
                return two_sided(&asm.args[0], &asm.args[1], Insn::Bnge, ccb, renv, ctx);
            }
            _ => {}
        }
    }

    match &**test {
        IForm::Eq { arg0, arg1 } => {
            eq_like(arg0, arg1, Insn::Bneq, Insn::Bneqc, ccb, renv, ctx)
        }
        IForm::Eqv { arg0, arg1 } => {
            eq_like(arg0, arg1, Insn::Bneqv, Insn::Bneqvc, ccb, renv, ctx)
        }
        _ => {
            let d = pass3_rec(test, ccb, renv, ctx.normal())?;
            Ok((d, TestPlan::Generic))
        }
    }
}

fn pass3_let(
    iform: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
    ctx: Ctx,
) -> Result<usize, CompileError> {
    if !ctx.is_bottom() {
        // pending arguments below us: shield them with a continuation
        let merge = ccb.new_label();
        ccb.put(Insn::PreCall(0), Operand::Label(merge), None);
        let d = pass3_let_core(iform, ccb, renv, Ctx::Tail)?;
        ccb.emit(Insn::Ret, None);
        ccb.set_label(merge);
        return Ok(d + CONT_FRAME_SIZE);
    }
    pass3_let_core(iform, ccb, renv, ctx)
}

fn pass3_let_core(
    iform: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
    ctx: Ctx,
) -> Result<usize, CompileError> {
    let IForm::Let(node) = &**iform else {
        unreachable!()
    };
    let n = node.lvars.len();

    match node.kind {
        LetKind::Let => {
            let d_inits = pass3_prepare_args(&node.inits, ccb, renv)?;
            ccb.emit(Insn::LocalEnv(n as u32), node.src.clone());
            let renv2 = renv_extend(renv, node.lvars.clone());
            let d_body = pass3_rec(&node.body, ccb, &renv2, ctx)?;
            if !ctx.is_tail() {
                ccb.emit(Insn::PopLocalEnv, None);
            }
            Ok(d_inits.max(ENV_HEADER_SIZE + n + d_body))
        }
        LetKind::Rec => {
            let renv2 = renv_extend(renv, node.lvars.clone());

            // closures and constants go into the frame operand; the
            // rest is initialized after the frame exists
            let mut slots = Vec::with_capacity(n);
            let mut others = Vec::new();
            for (offset, init) in node.inits.iter().enumerate() {
                match &**init {
                    IForm::Lambda(lam) if lam.flag != LambdaFlag::Dissolved => {
                        slots.push(ClosureInit::Code(compile_lambda(
                            lam,
                            Some(ccb.name.clone()),
                            &renv2,
                            None,
                        )?));
                    }
                    IForm::Const(v) => slots.push(ClosureInit::Datum(v.clone())),
                    _ => {
                        slots.push(ClosureInit::Datum(Sexpr::Undefined));
                        others.push((offset, init.clone()));
                    }
                }
            }
            ccb.put(
                Insn::LocalEnvClosures(n as u32),
                Operand::Closures(slots),
                node.src.clone(),
            );

            let mut d_other = 0;
            for (offset, init) in others {
                let d = pass3_rec(&init, ccb, &renv2, Ctx::NormalBottom)?;
                ccb.emit(
                    Insn::Lset {
                        depth: 0,
                        offset: offset as u32,
                    },
                    None,
                );
                d_other = d_other.max(d);
            }

            let d_body = pass3_rec(&node.body, ccb, &renv2, ctx)?;
            if !ctx.is_tail() {
                ccb.emit(Insn::PopLocalEnv, None);
            }
            Ok(ENV_HEADER_SIZE + n + d_other.max(d_body))
        }
    }
}

fn pass3_call(
    iform: &P<IForm>,
    ccb: &mut CodeBuilder,
    renv: &Renv,
    ctx: Ctx,
) -> Result<usize, CompileError> {
    let IForm::Call(node) = &**iform else {
        unreachable!()
    };
    let nargs = node.args.len() as u32;
    let tail = ctx.is_tail();

    match node.flag {
        CallFlag::Local => {
            let merge = if tail {
                None
            } else {
                let m = ccb.new_label();
                ccb.put(Insn::PreCall(nargs), Operand::Label(m), node.src.clone());
                Some(m)
            };
            let d_args = pass3_prepare_args(&node.args, ccb, renv)?;
            let d_proc = pass3_rec(&node.proc, ccb, renv, Ctx::NormalTop)?;
            ccb.emit(
                if tail {
                    Insn::LocalEnvTailCall(nargs)
                } else {
                    Insn::LocalEnvCall(nargs)
                },
                node.src.clone(),
            );
            if let Some(m) = merge {
                ccb.set_label(m);
            }
            let extra = if tail { 0 } else { CONT_FRAME_SIZE };
            Ok(d_args.max(nargs as usize + d_proc) + extra)
        }

        CallFlag::Embed => {
            let IForm::Lambda(lam) = &*node.proc else {
                return Err(CompileError::internal("embed call without a lambda"));
            };
            let merge = if tail {
                None
            } else {
                let m = ccb.new_label();
                ccb.put(Insn::PreCall(nargs), Operand::Label(m), node.src.clone());
                Some(m)
            };
            let d_args = pass3_prepare_args(&node.args, ccb, renv)?;
            ccb.emit(Insn::LocalEnv(nargs), node.src.clone());
            let renv2 = renv_extend(renv, lam.lvars.clone());
            // lam.body is the shared label; compiling it binds the label
            let d_body = pass3_rec(&lam.body, ccb, &renv2, Ctx::Tail)?;
            let extra = if let Some(m) = merge {
                ccb.emit(Insn::Ret, None);
                ccb.set_label(m);
                CONT_FRAME_SIZE
            } else {
                0
            };
            Ok(d_args.max(ENV_HEADER_SIZE + nargs as usize + d_body) + extra)
        }

        CallFlag::Jump => {
            let IForm::Goto(target) = &*node.proc else {
                return Err(CompileError::internal("jump call without a target"));
            };
            let label_node = target
                .upgrade()
                .ok_or_else(|| CompileError::internal("jump target is gone"))?;
            let label_id = {
                let IForm::Label(label) = &*label_node else {
                    return Err(CompileError::internal("jump target is not a label"));
                };
                label
                    .label
                    .ok_or_else(|| CompileError::internal("jump precedes its label"))?
            };

            let merge = if tail {
                None
            } else {
                let m = ccb.new_label();
                ccb.put(Insn::PreCall(nargs), Operand::Label(m), node.src.clone());
                Some(m)
            };
            let d_args = pass3_prepare_args(&node.args, ccb, renv)?;
            ccb.put(
                Insn::LocalEnvJump(nargs),
                Operand::Label(LabelId(label_id)),
                node.src.clone(),
            );
            let extra = if let Some(m) = merge {
                ccb.set_label(m);
                CONT_FRAME_SIZE
            } else {
                0
            };
            Ok(d_args + extra)
        }

        _ => {
            // generic call; a let-operator with simple arguments is
            // rotated so the frame is built before the args are pushed
            if let IForm::Let(l) = &*node.proc {
                let simple = node
                    .args
                    .iter()
                    .all(|a| matches!(&**a, IForm::LRef(_) | IForm::Const(_)));
                if simple {
                    let inner = P(IForm::Call(Call {
                        src: node.src.clone(),
                        proc: l.body.clone(),
                        args: node.args.clone(),
                        flag: node.flag,
                    }));
                    let rotated = P(IForm::Let(Let {
                        src: l.src.clone(),
                        kind: l.kind,
                        lvars: l.lvars.clone(),
                        inits: l.inits.clone(),
                        body: inner,
                    }));
                    return pass3_rec(&rotated, ccb, renv, ctx);
                }
            }

            let merge = if tail {
                None
            } else {
                let m = ccb.new_label();
                ccb.put(Insn::PreCall(nargs), Operand::Label(m), node.src.clone());
                Some(m)
            };
            let d_args = pass3_prepare_args(&node.args, ccb, renv)?;
            let d_proc = pass3_rec(&node.proc, ccb, renv, Ctx::NormalTop)?;
            ccb.emit(
                if tail {
                    Insn::TailCall(nargs)
                } else {
                    Insn::Call(nargs)
                },
                node.src.clone(),
            );
            if let Some(m) = merge {
                ccb.set_label(m);
            }
            let extra = if tail { 0 } else { CONT_FRAME_SIZE };
            Ok(d_args.max(nargs as usize + d_proc) + extra)
        }
    }
}
