//! Pass 2. Optimization.
//!
//! Walks the IR and rewrites it destructively: constant propagation
//! through local references, branch restructuring, dead-binding
//! elimination, and the closure strategy (inline, embed with jumps, or
//! local calls). Nodes are never shared when this pass starts; the only
//! sharing it introduces is through `Label` nodes.

use std::collections::{HashMap, HashSet};

use log::trace;

use crate::{
    error::CompileError,
    inliners::fold_arith2,
    insn::Insn,
    pass1::{adjust_arglist, expand_inlined_procedure},
    ptr::{P, Weak},
    sexpr::Sexpr,
    tree_il::{
        iform_copy, iform_count_size_upto, make_seq, reset_lvars, CallFlag, IForm, If, LVar,
        Label, Lambda, LambdaFlag, Seq,
    },
    vm::CompileFlags,
};

/// Bodies smaller than this many nodes may be inlined into every call
/// site.
pub const SMALL_LAMBDA_SIZE: usize = 12;

pub struct P2Ctx {
    noinline_locals: bool,
}

pub fn pass2(iform: P<IForm>, flags: &CompileFlags) -> Result<P<IForm>, CompileError> {
    reset_lvars(&iform);
    let mut ctx = P2Ctx {
        noinline_locals: flags.noinline_locals,
    };
    let mut penv = Vec::with_capacity(4);
    pass2_rec(iform, &mut penv, true, &mut ctx)
}

fn pass2_rec(
    mut iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    tail: bool,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    match &mut *iform {
        IForm::Define(def) => {
            let value = pass2_rec(def.value.clone(), penv, false, ctx)?;
            def.value = value;
            Ok(iform)
        }
        IForm::LRef(_) => Ok(lref_eliminate(iform.clone())),
        IForm::LSet(lset) => {
            let value = pass2_rec(lset.value.clone(), penv, false, ctx)?;
            lset.value = value;
            Ok(iform)
        }
        IForm::GSet(gset) => {
            let value = pass2_rec(gset.value.clone(), penv, false, ctx)?;
            gset.value = value;
            Ok(iform)
        }
        IForm::Const(_) | IForm::It | IForm::GRef(_) | IForm::Goto(_) | IForm::Label(_) => {
            Ok(iform)
        }
        IForm::If(_) => pass2_if(iform.clone(), penv, tail, ctx),
        IForm::Let(_) => pass2_let(iform.clone(), penv, tail, ctx),
        IForm::Receive(recv) => {
            let expr = pass2_rec(recv.expr.clone(), penv, false, ctx)?;
            recv.expr = expr;
            let body = pass2_rec(recv.body.clone(), penv, tail, ctx)?;
            recv.body = body;
            Ok(iform)
        }
        IForm::Lambda(_) => pass2_lambda(iform.clone(), penv, ctx),
        IForm::Seq(seq) => {
            let n = seq.forms.len();
            for (i, form) in seq.forms.iter_mut().enumerate() {
                *form = pass2_rec(form.clone(), penv, tail && i + 1 == n, ctx)?;
            }
            if n == 1 {
                return Ok(seq.forms[0].clone());
            }
            Ok(iform)
        }
        IForm::Call(_) => pass2_call(iform.clone(), penv, tail, ctx),
        IForm::Asm(_) => pass2_asm(iform.clone(), penv, ctx),
        IForm::Promise { expr, .. } => {
            *expr = pass2_rec(expr.clone(), penv, false, ctx)?;
            Ok(iform)
        }
        IForm::Cons { arg0, arg1 }
        | IForm::Append { arg0, arg1 }
        | IForm::Memv { arg0, arg1 }
        | IForm::Eq { arg0, arg1 }
        | IForm::Eqv { arg0, arg1 } => {
            *arg0 = pass2_rec(arg0.clone(), penv, false, ctx)?;
            *arg1 = pass2_rec(arg1.clone(), penv, false, ctx)?;
            Ok(iform)
        }
        IForm::List { elems } | IForm::ListStar { elems } | IForm::Vector { elems } => {
            for e in elems.iter_mut() {
                *e = pass2_rec(e.clone(), penv, false, ctx)?;
            }
            Ok(iform)
        }
        IForm::List2Vec { arg } => {
            *arg = pass2_rec(arg.clone(), penv, false, ctx)?;
            Ok(iform)
        }
    }
}

/// Replaces a local reference with its constant init, or redirects a
/// reference chain to the ultimate variable.
fn lref_eliminate(iform: P<IForm>) -> P<IForm> {
    let mut seen: Vec<*const LVar> = Vec::new();
    loop {
        let (lvar, init) = {
            let IForm::LRef(lref) = &*iform else {
                return iform;
            };
            if !lref.lvar.is_immutable() {
                return iform;
            }
            match lref.lvar.const_value() {
                Some(init) => (lref.lvar.clone(), init),
                None => return iform,
            }
        };

        match &*init {
            IForm::Const(value) => {
                let value = value.clone();
                let mut lvar = lvar;
                lvar.ref_count -= 1;
                let mut node = iform.clone();
                *node = IForm::Const(value);
                return iform;
            }
            IForm::LRef(inner) if inner.lvar.is_immutable() => {
                if seen.contains(&lvar.as_ptr()) {
                    return iform;
                }
                seen.push(lvar.as_ptr());

                let mut from = lvar;
                from.ref_count -= 1;
                let mut to = inner.lvar.clone();
                to.ref_count += 1;

                let mut node = iform.clone();
                let IForm::LRef(lref) = &mut *node else {
                    unreachable!()
                };
                lref.lvar = inner.lvar.clone();
            }
            _ => return iform,
        }
    }
}

fn pass2_if(
    iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    tail: bool,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    let (cond, cons, alt, src) = {
        let IForm::If(x) = &*iform else { unreachable!() };
        (
            x.cond.clone(),
            x.consequent.clone(),
            x.alternative.clone(),
            x.src.clone(),
        )
    };

    let test = pass2_rec(cond, penv, false, ctx)?;
    let then_form = pass2_rec(cons, penv, tail, ctx)?;
    let else_form = pass2_rec(alt, penv, tail, ctx)?;

    // branch cut: a constant test selects its arm at compile time
    if let IForm::Const(c) = &*test {
        let taken = if c.to_boolean() { then_form } else { else_form };
        return Ok(if matches!(&*taken, IForm::It) {
            test.clone()
        } else {
            taken
        });
    }

    // (if (if t it e0) then else) and the symmetric shapes: pull the
    // inner test out, sharing the duplicated arm through a label when
    // it is too big to copy
    if let IForm::If(inner) = &*test {
        let it_then = matches!(&*inner.consequent, IForm::It);
        let it_else = matches!(&*inner.alternative, IForm::It);
        if it_then && it_else {
            return update_if(iform, inner.cond.clone(), then_form, else_form);
        } else if it_then {
            let (t0, t1) = label_or_dup(then_form);
            let rest = P(IForm::If(If {
                src: src.clone(),
                cond: inner.alternative.clone(),
                consequent: t1,
                alternative: else_form,
            }));
            return update_if(iform, inner.cond.clone(), t0, rest);
        } else if it_else {
            let (e0, e1) = label_or_dup(else_form);
            let rest = P(IForm::If(If {
                src: src.clone(),
                cond: inner.consequent.clone(),
                consequent: then_form,
                alternative: e0,
            }));
            return update_if(iform, inner.cond.clone(), rest, e1);
        }
    }

    update_if(iform, test, then_form, else_form)
}

fn update_if(
    mut iform: P<IForm>,
    new_test: P<IForm>,
    new_then: P<IForm>,
    new_else: P<IForm>,
) -> Result<P<IForm>, CompileError> {
    if P::ptr_eq(&new_then, &new_else) {
        return Ok(make_seq(None, vec![new_test, new_then]));
    }
    let IForm::If(x) = &mut *iform else {
        unreachable!()
    };
    x.cond = new_test;
    x.consequent = new_then;
    x.alternative = new_else;
    Ok(iform)
}

/// Small continuations (LREF/CONST/IT) are duplicated; anything else is
/// materialized as a shared label.
fn label_or_dup(iform: P<IForm>) -> (P<IForm>, P<IForm>) {
    if matches!(&*iform, IForm::LRef(_) | IForm::Const(_) | IForm::It) {
        let copy = iform_copy(&iform, &mut HashMap::new());
        (iform, copy)
    } else {
        let label = P(IForm::Label(Label {
            src: None,
            label: None,
            body: iform,
        }));
        (label.clone(), label)
    }
}

fn pass2_let(
    mut iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    tail: bool,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    let (lvars, inits0, body0, src) = {
        let IForm::Let(l) = &*iform else { unreachable!() };
        (l.lvars.clone(), l.inits.clone(), l.body.clone(), l.src.clone())
    };

    let mut inits = Vec::with_capacity(inits0.len());
    for (lvar, init) in lvars.iter().zip(inits0.into_iter()) {
        let oinit = pass2_rec(init, penv, false, ctx)?;
        let mut lvar = lvar.clone();
        lvar.initval = Some(oinit.clone());
        inits.push(oinit);
    }

    let obody = pass2_rec(body0, penv, tail, ctx)?;

    for (lvar, init) in lvars.iter().zip(inits.iter()) {
        pass2_optimize_closure(lvar, init, ctx)?;
    }

    // dead-binding elimination
    let mut kept_lvars = Vec::new();
    let mut kept_inits = Vec::new();
    let mut hoisted = Vec::new();
    for (lvar, init) in lvars.iter().zip(inits.iter()) {
        if lvar.ref_count == 0 && lvar.is_immutable() {
            trace!("pass2: dropping unused binding {}", lvar.name);
            match &**init {
                // the lambda body was consumed by inlining or embedding
                IForm::Lambda(lam) if lam.flag != LambdaFlag::None => {}
                _ if init.is_transparent() => discard_refs(init),
                _ => hoisted.push(init.clone()),
            }
        } else {
            kept_lvars.push(lvar.clone());
            kept_inits.push(init.clone());
        }
    }

    if kept_lvars.is_empty() {
        if hoisted.is_empty() {
            return Ok(obody);
        }
        hoisted.push(obody);
        return Ok(make_seq(src, hoisted));
    }

    let IForm::Let(l) = &mut *iform else {
        unreachable!()
    };
    l.lvars = kept_lvars;
    l.inits = kept_inits;
    l.body = if hoisted.is_empty() {
        obody
    } else {
        hoisted.push(obody);
        make_seq(None, hoisted)
    };
    Ok(iform)
}

/// Adjusts LVar counters for a subtree that is being dropped from the
/// IR, so the counts keep matching the live tree.
fn discard_refs(iform: &P<IForm>) {
    fn rec(iform: &P<IForm>, seen: &mut HashSet<*const IForm>) {
        match &**iform {
            IForm::LRef(lref) => {
                let mut lvar = lref.lvar.clone();
                lvar.ref_count = lvar.ref_count.saturating_sub(1);
            }
            IForm::LSet(lset) => {
                let mut lvar = lset.lvar.clone();
                lvar.set_count = lvar.set_count.saturating_sub(1);
                rec(&lset.value, seen);
            }
            IForm::GSet(x) => rec(&x.value, seen),
            IForm::Define(x) => rec(&x.value, seen),
            IForm::If(x) => {
                rec(&x.cond, seen);
                rec(&x.consequent, seen);
                rec(&x.alternative, seen);
            }
            IForm::Let(x) => {
                for init in &x.inits {
                    rec(init, seen);
                }
                rec(&x.body, seen);
            }
            IForm::Receive(x) => {
                rec(&x.expr, seen);
                rec(&x.body, seen);
            }
            IForm::Lambda(x) => rec(&x.body, seen),
            IForm::Label(x) => {
                if seen.insert(iform.as_ptr()) {
                    rec(&x.body, seen);
                }
            }
            IForm::Seq(x) => {
                for f in &x.forms {
                    rec(f, seen);
                }
            }
            IForm::Call(x) => {
                rec(&x.proc, seen);
                for a in &x.args {
                    rec(a, seen);
                }
            }
            IForm::Asm(x) => {
                for a in &x.args {
                    rec(a, seen);
                }
            }
            IForm::Promise { expr, .. } => rec(expr, seen),
            IForm::Cons { arg0, arg1 }
            | IForm::Append { arg0, arg1 }
            | IForm::Memv { arg0, arg1 }
            | IForm::Eq { arg0, arg1 }
            | IForm::Eqv { arg0, arg1 } => {
                rec(arg0, seen);
                rec(arg1, seen);
            }
            IForm::List { elems } | IForm::ListStar { elems } | IForm::Vector { elems } => {
                for e in elems {
                    rec(e, seen);
                }
            }
            IForm::List2Vec { arg } => rec(arg, seen),
            IForm::Const(_) | IForm::It | IForm::GRef(_) | IForm::Goto(_) => {}
        }
    }
    rec(iform, &mut HashSet::new());
}

/// Decides, per statically bound closure, between inlining, embedding
/// with jumps, and plain local calls.
fn pass2_optimize_closure(
    lvar: &P<LVar>,
    iform: &P<IForm>,
    _ctx: &mut P2Ctx,
) -> Result<(), CompileError> {
    if !(lvar.is_immutable() && lvar.ref_count > 0) {
        return Ok(());
    }
    let IForm::Lambda(lam) = &**iform else {
        return Ok(());
    };
    let lam = lam.clone();
    let calls = lam.calls.clone();

    if lvar.ref_count as usize == calls.len() {
        let (locals, recs, tail_recs) = classify_calls(&calls, &lam);
        if recs.is_empty() && !locals.is_empty() {
            if locals.len() == 1 {
                return local_call_embedder(lvar, &lam, &locals[0], &tail_recs);
            }
            if tail_recs.is_empty()
                && iform_count_size_upto(iform, SMALL_LAMBDA_SIZE) < SMALL_LAMBDA_SIZE
            {
                return local_call_inliner(lvar, &lam, &locals);
            }
        }
    }

    local_call_optimizer(&lam)
}

/// A TAIL-REC call across a closure boundary is demoted to REC; only
/// calls sitting directly in the lambda (skipping dissolved wrappers)
/// may become jumps.
fn direct_call_p(env: &[P<Lambda>], lam: &P<Lambda>) -> bool {
    for l in env.iter().rev() {
        if P::ptr_eq(l, lam) {
            return true;
        }
        if l.flag == LambdaFlag::Dissolved {
            continue;
        }
        return false;
    }
    false
}

fn classify_calls(
    calls: &[(P<IForm>, Vec<P<Lambda>>)],
    lam: &P<Lambda>,
) -> (Vec<P<IForm>>, Vec<P<IForm>>, Vec<P<IForm>>) {
    let mut locals = Vec::new();
    let mut recs = Vec::new();
    let mut tail_recs = Vec::new();

    for (call, env) in calls {
        let IForm::Call(c) = &**call else { continue };
        match c.flag {
            CallFlag::TailRec => {
                if direct_call_p(env, lam) {
                    tail_recs.push(call.clone());
                } else {
                    recs.push(call.clone());
                }
            }
            CallFlag::Rec => recs.push(call.clone()),
            _ => locals.push(call.clone()),
        }
    }

    (locals, recs, tail_recs)
}

fn local_call_optimizer(lam: &P<Lambda>) -> Result<(), CompileError> {
    let name = lam.name.clone();
    let calls = lam.calls.clone();
    for (call, _) in calls.iter() {
        let mut call = call.clone();
        let IForm::Call(c) = &mut *call else { continue };
        c.flag = CallFlag::Local;
        let args = std::mem::take(&mut c.args);
        c.args = adjust_arglist(lam.reqargs, lam.optarg, args, &name)?;
    }
    let mut lam = lam.clone();
    lam.calls.clear();
    Ok(())
}

/// Embeds the lambda body at its single local call site and turns every
/// tail-recursive self call into a jump to the shared label.
fn local_call_embedder(
    lvar: &P<LVar>,
    lam: &P<Lambda>,
    embed_call: &P<IForm>,
    tail_recs: &[P<IForm>],
) -> Result<(), CompileError> {
    trace!("pass2: embedding {} at its call site", lam.name);
    let name = lam.name.clone();

    {
        let mut call = embed_call.clone();
        let IForm::Call(c) = &mut *call else {
            return Err(CompileError::internal("embed target is not a call"));
        };
        let args = std::mem::take(&mut c.args);
        c.args = adjust_arglist(lam.reqargs, lam.optarg, args, &name)?;
        c.flag = CallFlag::Embed;
        c.proc = P(IForm::Lambda(lam.clone()));
    }
    {
        let mut lvar = lvar.clone();
        lvar.ref_count -= 1;
    }

    let label = P(IForm::Label(Label {
        src: lam.src.clone(),
        label: None,
        body: lam.body.clone(),
    }));
    {
        let mut lam = lam.clone();
        lam.flag = LambdaFlag::Dissolved;
        lam.body = label.clone();
        lam.calls.clear();
    }

    for jcall in tail_recs {
        {
            let mut lvar = lvar.clone();
            lvar.ref_count -= 1;
        }
        let mut call = jcall.clone();
        let IForm::Call(c) = &mut *call else { continue };
        let args = std::mem::take(&mut c.args);
        c.args = adjust_arglist(lam.reqargs, lam.optarg, args, &name)?;
        c.flag = CallFlag::Jump;
        c.proc = P(IForm::Goto(Weak::new(&label)));
    }

    Ok(())
}

/// Copies the body into every local call site. The first site consumes
/// the original body; later sites get fresh copies.
fn local_call_inliner(
    lvar: &P<LVar>,
    lam: &P<Lambda>,
    calls: &[P<IForm>],
) -> Result<(), CompileError> {
    trace!("pass2: inlining {} into {} call sites", lam.name, calls.len());
    {
        let mut lvar = lvar.clone();
        lvar.ref_count = 0;
    }
    {
        let mut lam = lam.clone();
        lam.flag = LambdaFlag::Dissolved;
        lam.calls.clear();
    }

    for (i, call) in calls.iter().enumerate() {
        let target = if i == 0 {
            lam.clone()
        } else {
            let copied = iform_copy(&P(IForm::Lambda(lam.clone())), &mut HashMap::new());
            let IForm::Lambda(l) = &*copied else {
                unreachable!()
            };
            l.clone()
        };

        let (args, src) = {
            let IForm::Call(c) = &**call else { continue };
            (c.args.clone(), c.src.clone())
        };
        let inlined = expand_inlined_procedure(src, &target, args)?;
        let mut node = call.clone();
        *node = IForm::Seq(Seq {
            src: None,
            forms: vec![inlined],
        });
    }

    Ok(())
}

fn pass2_call(
    iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    tail: bool,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    {
        let IForm::Call(c) = &*iform else { unreachable!() };
        // embed and jump calls were finalized by the closure optimizer
        if c.flag != CallFlag::None {
            return Ok(iform);
        }
    }

    // scan the operator first so LREF folding can expose a lambda
    let proc = {
        let IForm::Call(c) = &*iform else { unreachable!() };
        c.proc.clone()
    };
    let proc = pass2_rec(proc, penv, false, ctx)?;
    {
        let mut node = iform.clone();
        let IForm::Call(c) = &mut *node else { unreachable!() };
        c.proc = proc.clone();
    }

    match &*proc {
        IForm::Lambda(lam) => {
            // direct application of a literal lambda: beta-reduce now
            let lam = lam.clone();
            let (args, src) = {
                let IForm::Call(c) = &*iform else { unreachable!() };
                (c.args.clone(), c.src.clone())
            };
            let expanded = expand_inlined_procedure(src, &lam, args)?;
            pass2_rec(expanded, penv, tail, ctx)
        }
        IForm::LRef(lref) => {
            let lvar = lref.lvar.clone();
            let lambda_init = lvar
                .const_value()
                .filter(|init| matches!(&**init, IForm::Lambda(_)));

            if let Some(init) = lambda_init {
                if !ctx.noinline_locals {
                    let IForm::Lambda(lam) = &*init else {
                        unreachable!()
                    };
                    let lam = lam.clone();
                    let self_rec = penv.iter().any(|l| P::ptr_eq(l, &lam));

                    if self_rec {
                        let flag = if tail {
                            CallFlag::TailRec
                        } else {
                            CallFlag::Rec
                        };
                        {
                            let mut node = iform.clone();
                            let IForm::Call(c) = &mut *node else { unreachable!() };
                            c.flag = flag;
                        }
                        {
                            let mut lam = lam.clone();
                            lam.calls.push((iform.clone(), penv.clone()));
                        }
                        return pass2_args(iform, penv, ctx);
                    }

                    if lvar.ref_count == 1 {
                        // sole reference: inline directly
                        {
                            let mut lvar = lvar.clone();
                            lvar.ref_count -= 1;
                        }
                        {
                            let mut lam = lam.clone();
                            lam.flag = LambdaFlag::Inlined;
                        }
                        let (args, src) = {
                            let IForm::Call(c) = &*iform else { unreachable!() };
                            (c.args.clone(), c.src.clone())
                        };
                        let expanded = expand_inlined_procedure(src, &lam, args)?;
                        return pass2_rec(expanded, penv, tail, ctx);
                    }

                    {
                        let mut node = iform.clone();
                        let IForm::Call(c) = &mut *node else { unreachable!() };
                        c.flag = CallFlag::Local;
                    }
                    {
                        let mut lam = lam.clone();
                        lam.calls.push((iform.clone(), penv.clone()));
                    }
                }
            }
            pass2_args(iform, penv, ctx)
        }
        _ => pass2_args(iform, penv, ctx),
    }
}

fn pass2_args(
    mut iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    let IForm::Call(c) = &mut *iform else {
        unreachable!()
    };
    for arg in c.args.iter_mut() {
        *arg = pass2_rec(arg.clone(), penv, false, ctx)?;
    }
    Ok(iform)
}

fn pass2_lambda(
    iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    let lam = {
        let IForm::Lambda(l) = &*iform else { unreachable!() };
        l.clone()
    };

    penv.push(lam.clone());
    let body = pass2_rec(lam.body.clone(), penv, true, ctx)?;
    penv.pop();

    let mut lam = lam;
    lam.body = body;
    Ok(iform)
}

fn pass2_asm(
    mut iform: P<IForm>,
    penv: &mut Vec<P<Lambda>>,
    ctx: &mut P2Ctx,
) -> Result<P<IForm>, CompileError> {
    {
        let IForm::Asm(asm) = &mut *iform else {
            unreachable!()
        };
        for arg in asm.args.iter_mut() {
            *arg = pass2_rec(arg.clone(), penv, false, ctx)?;
        }
    }

    let folded = {
        let IForm::Asm(asm) = &*iform else { unreachable!() };
        if asm.args.iter().all(|a| a.is_const()) {
            let consts: Vec<Sexpr> = asm
                .args
                .iter()
                .map(|a| a.as_const().unwrap().clone())
                .collect();
            fold_asm(&asm.insn, &consts)
        } else {
            None
        }
    };

    match folded {
        Some(value) => Ok(P(IForm::Const(value))),
        None => Ok(iform),
    }
}

fn fold_asm(insn: &Insn, args: &[Sexpr]) -> Option<Sexpr> {
    match insn {
        Insn::Not if args.len() == 1 => Some(Sexpr::Boolean(!args[0].to_boolean())),
        Insn::Nullp if args.len() == 1 => Some(Sexpr::Boolean(args[0].is_null())),
        Insn::NumAddI(_) | Insn::NumSubI(_) if args.len() == 1 => {
            fold_arith2(insn, &args[0], &args[0])
        }
        _ if args.len() == 2 => fold_arith2(insn, &args[0], &args[1]),
        _ => None,
    }
}
