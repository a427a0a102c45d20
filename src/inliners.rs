//! Inlinable global procedures.
//!
//! A global binding may carry an inliner descriptor: a bare VM
//! instruction (arity-checked, emitted as an ASM node), a packed IR body
//! (substituted at the call site, used by `define-inline`), or a
//! procedure that builds IR itself and may decline. The numeric inliners
//! fold constants eagerly and pick immediate-operand instructions for
//! small integers.

use once_cell::sync::Lazy;

use crate::{
    cenv::Cenv,
    error::CompileError,
    insn::{fits_signed_operand, Insn},
    module::{insert_binding, Binding, Module},
    pack::PackedIForm,
    ptr::P,
    sexpr::{intern, Sexpr},
    tree_il::{Asm, IForm},
};

/// Inliner procedures receive the whole source form (for diagnostics),
/// the already-compiled argument IR, and the cenv. Returning `None`
/// declines, and pass 1 falls back to a generic call.
pub type InlinerProc =
    fn(&Sexpr, &[P<IForm>], &Cenv) -> Result<Option<P<IForm>>, CompileError>;

#[derive(Clone)]
pub enum Inliner {
    /// Fixed-arity instruction.
    Asm { insn: Insn, nargs: usize },
    /// Packed IR of a `define-inline` body.
    Packed(P<PackedIForm>),
    Proc(InlinerProc),
}

fn asm1(insn: Insn, arg: P<IForm>) -> P<IForm> {
    P(IForm::Asm(Asm {
        src: None,
        insn,
        args: vec![arg],
    }))
}

fn asm2(insn: Insn, arg0: P<IForm>, arg1: P<IForm>) -> P<IForm> {
    P(IForm::Asm(Asm {
        src: None,
        insn,
        args: vec![arg0, arg1],
    }))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn insn(self) -> Insn {
        match self {
            ArithOp::Add => Insn::NumAdd2,
            ArithOp::Sub => Insn::NumSub2,
            ArithOp::Mul => Insn::NumMul2,
            ArithOp::Div => Insn::NumDiv2,
        }
    }

    fn identity(self) -> Option<i64> {
        match self {
            ArithOp::Add => Some(0),
            ArithOp::Mul => Some(1),
            _ => None,
        }
    }
}

fn num_value(form: &IForm) -> Option<Sexpr> {
    match form.as_const()? {
        n @ (Sexpr::Fixnum(_) | Sexpr::Flonum(_)) => Some(n.clone()),
        _ => None,
    }
}

pub fn fold_arith2(op: &Insn, a: &Sexpr, b: &Sexpr) -> Option<Sexpr> {
    let arith = |fx: fn(i64, i64) -> Option<i64>, fl: fn(f64, f64) -> f64| match (a, b) {
        (Sexpr::Fixnum(x), Sexpr::Fixnum(y)) => fx(*x, *y).map(Sexpr::Fixnum),
        (Sexpr::Flonum(x), Sexpr::Flonum(y)) => Some(Sexpr::Flonum(fl(*x, *y))),
        (Sexpr::Fixnum(x), Sexpr::Flonum(y)) => Some(Sexpr::Flonum(fl(*x as f64, *y))),
        (Sexpr::Flonum(x), Sexpr::Fixnum(y)) => Some(Sexpr::Flonum(fl(*x, *y as f64))),
        _ => None,
    };
    let compare = |fx: fn(&i64, &i64) -> bool, fl: fn(&f64, &f64) -> bool| match (a, b) {
        (Sexpr::Fixnum(x), Sexpr::Fixnum(y)) => Some(Sexpr::Boolean(fx(x, y))),
        (Sexpr::Flonum(x), Sexpr::Flonum(y)) => Some(Sexpr::Boolean(fl(x, y))),
        (Sexpr::Fixnum(x), Sexpr::Flonum(y)) => Some(Sexpr::Boolean(fl(&(*x as f64), y))),
        (Sexpr::Flonum(x), Sexpr::Fixnum(y)) => Some(Sexpr::Boolean(fl(x, &(*y as f64)))),
        _ => None,
    };

    match op {
        Insn::NumAdd2 => arith(i64::checked_add, |x, y| x + y),
        Insn::NumSub2 => arith(i64::checked_sub, |x, y| x - y),
        Insn::NumMul2 => arith(i64::checked_mul, |x, y| x * y),
        Insn::NumDiv2 => match (a, b) {
            (Sexpr::Fixnum(x), Sexpr::Fixnum(y)) if *y != 0 && x % y == 0 => {
                Some(Sexpr::Fixnum(x / y))
            }
            (Sexpr::Flonum(x), Sexpr::Flonum(y)) => Some(Sexpr::Flonum(x / y)),
            (Sexpr::Fixnum(x), Sexpr::Flonum(y)) => Some(Sexpr::Flonum(*x as f64 / y)),
            (Sexpr::Flonum(x), Sexpr::Fixnum(y)) if *y != 0 => {
                Some(Sexpr::Flonum(x / *y as f64))
            }
            _ => None,
        },
        Insn::NumAddI(i) => fold_arith2(&Insn::NumAdd2, a, &Sexpr::Fixnum(*i)),
        Insn::NumSubI(i) => fold_arith2(&Insn::NumSub2, &Sexpr::Fixnum(*i), a),
        Insn::NumEq2 => compare(|x, y| x == y, |x, y| x == y),
        Insn::NumLt2 => compare(|x, y| x < y, |x, y| x < y),
        Insn::NumLe2 => compare(|x, y| x <= y, |x, y| x <= y),
        Insn::NumGt2 => compare(|x, y| x > y, |x, y| x > y),
        Insn::NumGe2 => compare(|x, y| x >= y, |x, y| x >= y),
        _ => None,
    }
}

/// Left-associating binary fold for `+ - * /`. Adjacent constant
/// operands fold at compile time; a small-integer constant against `+`
/// or `-` picks the immediate-operand instruction.
fn fold_numeric(op: ArithOp, args: &[P<IForm>]) -> P<IForm> {
    fn combine(op: ArithOp, acc: P<IForm>, arg: P<IForm>) -> P<IForm> {
        if let (Some(a), Some(b)) = (num_value(&acc), num_value(&arg)) {
            if let Some(folded) = fold_arith2(&op.insn(), &a, &b) {
                return P(IForm::Const(folded));
            }
        }

        if matches!(op, ArithOp::Add | ArithOp::Sub) {
            if let Some(Sexpr::Fixnum(n)) = arg.as_const().cloned() {
                let n = if op == ArithOp::Sub { -n } else { n };
                if fits_signed_operand(n) {
                    return asm1(Insn::NumAddI(n), acc);
                }
            }
            if op == ArithOp::Add {
                if let Some(Sexpr::Fixnum(n)) = acc.as_const().cloned() {
                    if fits_signed_operand(n) {
                        return asm1(Insn::NumAddI(n), arg);
                    }
                }
            }
        }

        asm2(op.insn(), acc, arg)
    }

    let mut acc = args[0].clone();
    for arg in &args[1..] {
        acc = combine(op, acc, arg.clone());
    }
    acc
}

fn arith_inliner(op: ArithOp) -> impl Fn(&Sexpr, &[P<IForm>], &Cenv) -> Result<Option<P<IForm>>, CompileError>
{
    move |form, args, _cenv| {
        match (op, args.len()) {
            (_, 0) => match op.identity() {
                Some(id) => Ok(Some(P(IForm::Const(Sexpr::Fixnum(id))))),
                None => Err(CompileError::syntax("operator needs arguments", form)),
            },
            (ArithOp::Sub, 1) => Ok(Some(fold_numeric(
                ArithOp::Sub,
                &[P(IForm::Const(Sexpr::Fixnum(0))), args[0].clone()],
            ))),
            (ArithOp::Div, 1) => Ok(Some(fold_numeric(
                ArithOp::Div,
                &[P(IForm::Const(Sexpr::Fixnum(1))), args[0].clone()],
            ))),
            (_, 1) => Ok(Some(args[0].clone())),
            _ => Ok(Some(fold_numeric(op, args))),
        }
    }
}

macro_rules! arith {
    ($name:ident, $op:expr) => {
        fn $name(
            form: &Sexpr,
            args: &[P<IForm>],
            cenv: &Cenv,
        ) -> Result<Option<P<IForm>>, CompileError> {
            arith_inliner($op)(form, args, cenv)
        }
    };
}

arith!(inline_add, ArithOp::Add);
arith!(inline_sub, ArithOp::Sub);
arith!(inline_mul, ArithOp::Mul);
arith!(inline_div, ArithOp::Div);

/// Comparisons must be binary; more arguments fall back to the generic
/// procedure call.
fn compare_inliner(insn: &'static Insn) -> InlinerProc {
    // monomorphic fn items per insn, keyed through a table below
    fn build(
        insn: &Insn,
        args: &[P<IForm>],
    ) -> Option<P<IForm>> {
        if args.len() != 2 {
            return None;
        }
        if let (Some(a), Some(b)) = (num_value(&args[0]), num_value(&args[1])) {
            if let Some(folded) = fold_arith2(insn, &a, &b) {
                return Some(P(IForm::Const(folded)));
            }
        }
        Some(asm2(insn.clone(), args[0].clone(), args[1].clone()))
    }

    // fn pointers cannot close over `insn`; dispatch through statics
    macro_rules! entry {
        ($i:expr, $f:ident) => {{
            fn $f(
                _form: &Sexpr,
                args: &[P<IForm>],
                _cenv: &Cenv,
            ) -> Result<Option<P<IForm>>, CompileError> {
                Ok(build(&$i, args))
            }
            $f as InlinerProc
        }};
    }

    match insn {
        Insn::NumEq2 => entry!(Insn::NumEq2, cmp_eq),
        Insn::NumLt2 => entry!(Insn::NumLt2, cmp_lt),
        Insn::NumLe2 => entry!(Insn::NumLe2, cmp_le),
        Insn::NumGt2 => entry!(Insn::NumGt2, cmp_gt),
        Insn::NumGe2 => entry!(Insn::NumGe2, cmp_ge),
        _ => unreachable!("not a comparison instruction"),
    }
}

fn inline_cons(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    if args.len() != 2 {
        return Ok(None);
    }
    Ok(Some(P(IForm::Cons {
        arg0: args[0].clone(),
        arg1: args[1].clone(),
    })))
}

fn inline_eq(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    if args.len() != 2 {
        return Ok(None);
    }
    Ok(Some(P(IForm::Eq {
        arg0: args[0].clone(),
        arg1: args[1].clone(),
    })))
}

fn inline_eqv(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    if args.len() != 2 {
        return Ok(None);
    }
    Ok(Some(P(IForm::Eqv {
        arg0: args[0].clone(),
        arg1: args[1].clone(),
    })))
}

fn inline_memv(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    if args.len() != 2 {
        return Ok(None);
    }
    Ok(Some(P(IForm::Memv {
        arg0: args[0].clone(),
        arg1: args[1].clone(),
    })))
}

fn inline_list(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    Ok(Some(if args.is_empty() {
        IForm::const_nil()
    } else {
        P(IForm::List {
            elems: args.to_vec(),
        })
    }))
}

fn inline_list_star(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    Ok(match args.len() {
        0 => None,
        1 => Some(args[0].clone()),
        _ => Some(P(IForm::ListStar {
            elems: args.to_vec(),
        })),
    })
}

fn inline_append(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    Ok(Some(match args.len() {
        0 => IForm::const_nil(),
        1 => args[0].clone(),
        _ => {
            let mut iter = args.iter().rev();
            let mut acc = iter.next().unwrap().clone();
            for arg in iter {
                acc = P(IForm::Append {
                    arg0: arg.clone(),
                    arg1: acc,
                });
            }
            acc
        }
    }))
}

fn inline_vector(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    Ok(Some(P(IForm::Vector {
        elems: args.to_vec(),
    })))
}

fn inline_list_to_vector(
    _form: &Sexpr,
    args: &[P<IForm>],
    _cenv: &Cenv,
) -> Result<Option<P<IForm>>, CompileError> {
    if args.len() != 1 {
        return Ok(None);
    }
    Ok(Some(P(IForm::List2Vec {
        arg: args[0].clone(),
    })))
}

/// Name to descriptor table for the core inlinable procedures.
pub static CORE_INLINERS: Lazy<Vec<(&'static str, fn() -> Inliner)>> = Lazy::new(|| {
    vec![
        ("car", || Inliner::Asm { insn: Insn::Car, nargs: 1 }),
        ("cdr", || Inliner::Asm { insn: Insn::Cdr, nargs: 1 }),
        ("caar", || Inliner::Asm { insn: Insn::Caar, nargs: 1 }),
        ("cadr", || Inliner::Asm { insn: Insn::Cadr, nargs: 1 }),
        ("cdar", || Inliner::Asm { insn: Insn::Cdar, nargs: 1 }),
        ("cddr", || Inliner::Asm { insn: Insn::Cddr, nargs: 1 }),
        ("null?", || Inliner::Asm { insn: Insn::Nullp, nargs: 1 }),
        ("not", || Inliner::Asm { insn: Insn::Not, nargs: 1 }),
        ("cons", || Inliner::Proc(inline_cons)),
        ("eq?", || Inliner::Proc(inline_eq)),
        ("eqv?", || Inliner::Proc(inline_eqv)),
        ("memv", || Inliner::Proc(inline_memv)),
        ("list", || Inliner::Proc(inline_list)),
        ("list*", || Inliner::Proc(inline_list_star)),
        ("append", || Inliner::Proc(inline_append)),
        ("vector", || Inliner::Proc(inline_vector)),
        ("list->vector", || Inliner::Proc(inline_list_to_vector)),
        ("+", || Inliner::Proc(inline_add)),
        ("-", || Inliner::Proc(inline_sub)),
        ("*", || Inliner::Proc(inline_mul)),
        ("/", || Inliner::Proc(inline_div)),
        ("=", || Inliner::Proc(compare_inliner(&Insn::NumEq2))),
        ("<", || Inliner::Proc(compare_inliner(&Insn::NumLt2))),
        ("<=", || Inliner::Proc(compare_inliner(&Insn::NumLe2))),
        (">", || Inliner::Proc(compare_inliner(&Insn::NumGt2))),
        (">=", || Inliner::Proc(compare_inliner(&Insn::NumGe2))),
    ]
});

pub fn define_core_inliners(module: &mut P<Module>) {
    for (name, make) in CORE_INLINERS.iter() {
        insert_binding(module, intern(name), Binding::Inlinable(make()), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;
    use crate::cenv::Cenv;

    fn cenv() -> Cenv {
        let vm = Vm::new();
        let m = vm.current_module.clone();
        Cenv::bottom(vm, m)
    }

    fn konst(n: i64) -> P<IForm> {
        P(IForm::Const(Sexpr::Fixnum(n)))
    }

    #[test]
    fn addition_of_constants_folds() {
        let out = inline_add(&Sexpr::Null, &[konst(1), konst(2), konst(3)], &cenv())
            .unwrap()
            .unwrap();
        assert_eq!(out.as_const(), Some(&Sexpr::Fixnum(6)));
    }

    #[test]
    fn small_constant_picks_immediate_add() {
        let x = P(IForm::It); // stands in for any non-constant
        let out = inline_add(&Sexpr::Null, &[x, konst(1)], &cenv())
            .unwrap()
            .unwrap();
        let IForm::Asm(asm) = &*out else { panic!("expected ASM") };
        assert_eq!(asm.insn, Insn::NumAddI(1));
        assert_eq!(asm.args.len(), 1);
    }

    #[test]
    fn comparisons_are_binary_only() {
        let out = compare_inliner(&Insn::NumLt2)(
            &Sexpr::Null,
            &[konst(1), konst(2), konst(3)],
            &cenv(),
        )
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn constant_comparison_folds() {
        let out = compare_inliner(&Insn::NumLt2)(&Sexpr::Null, &[konst(1), konst(2)], &cenv())
            .unwrap()
            .unwrap();
        assert_eq!(out.as_const(), Some(&Sexpr::Boolean(true)));
    }
}
