//! End-to-end pipeline tests: source form in, IR or instructions out.

use bask::{
    code::{Inst, Operand},
    compile, compile_p1, compile_p2,
    insn::Insn,
    sexpr::Sexpr,
    tree_il::{iform_copy, iform_structural_eq, CallFlag, IForm, LetKind},
    vm::Vm,
    CompileError,
};

fn sym(s: &str) -> Sexpr {
    Sexpr::symbol(s)
}

fn fix(n: i64) -> Sexpr {
    Sexpr::Fixnum(n)
}

fn l(items: &[Sexpr]) -> Sexpr {
    Sexpr::list(items)
}

fn insns(code: &bask::CompiledCode) -> Vec<Insn> {
    code.code.iter().map(|i| i.insn.clone()).collect()
}

#[test]
fn beta_reduction_and_numeric_folding_yield_a_constant() {
    // ((lambda (x) (+ x 1)) 3)
    let vm = Vm::new();
    let form = l(&[
        l(&[sym("lambda"), l(&[sym("x")]), l(&[sym("+"), sym("x"), fix(1)])]),
        fix(3),
    ]);

    let iform = compile_p2(&vm, &form, None).unwrap();
    assert_eq!(iform.as_const(), Some(&fix(4)));

    let code = compile(&vm, &form, None).unwrap();
    assert_eq!(insns(&code), vec![Insn::Consti(4), Insn::Ret]);
}

#[test]
fn named_let_loop_embeds_and_jumps() {
    // (let loop ((i 0)) (if (= i 10) i (loop (+ i 1))))
    let vm = Vm::new();
    let form = l(&[
        sym("let"),
        sym("loop"),
        l(&[l(&[sym("i"), fix(0)])]),
        l(&[
            sym("if"),
            l(&[sym("="), sym("i"), fix(10)]),
            sym("i"),
            l(&[sym("loop"), l(&[sym("+"), sym("i"), fix(1)])]),
        ]),
    ]);

    let iform = compile_p2(&vm, &form, None).unwrap();
    let IForm::Call(call) = &*iform else {
        panic!("expected the embedded call at the top, got {}", iform);
    };
    assert_eq!(call.flag, CallFlag::Embed);

    let code = compile(&vm, &form, None).unwrap();
    let ops = insns(&code);
    assert!(ops.contains(&Insn::LocalEnv(1)), "frame setup: {}", code);
    assert!(ops.contains(&Insn::Bnumnei(10)), "counted test: {}", code);
    assert!(ops.contains(&Insn::NumAddI(1)), "step: {}", code);
    assert!(
        ops.contains(&Insn::LocalEnvJump(1)),
        "self tail call became a jump: {}",
        code
    );
    assert!(
        !ops.iter().any(|i| matches!(i, Insn::Closure)),
        "no closure is allocated for the loop: {}",
        code
    );
}

#[test]
fn constant_bindings_fold_at_reference_sites() {
    // (define-constant K 42) then K
    let vm = Vm::new();
    compile(&vm, &l(&[sym("define-constant"), sym("K"), fix(42)]), None).unwrap();

    let iform = compile_p1(&vm, &sym("K"), None).unwrap();
    assert_eq!(iform.as_const(), Some(&fix(42)));
}

#[test]
fn case_selects_eq_eqv_memv_by_key_shape() {
    // (case x ((a) 1) ((b c) 2) (else 3))
    let vm = Vm::new();
    let form = l(&[
        sym("case"),
        sym("x"),
        l(&[l(&[sym("a")]), fix(1)]),
        l(&[l(&[sym("b"), sym("c")]), fix(2)]),
        l(&[sym("else"), fix(3)]),
    ]);

    let iform = compile_p1(&vm, &form, None).unwrap();
    let IForm::Let(let_) = &*iform else {
        panic!("case should bind the key, got {}", iform)
    };
    assert_eq!(let_.kind, LetKind::Let);
    let IForm::If(first) = &*let_.body else {
        panic!("expected dispatch chain")
    };
    assert!(matches!(&*first.cond, IForm::Eq { .. }));
    let IForm::If(second) = &*first.alternative else {
        panic!("expected second clause")
    };
    assert!(matches!(&*second.cond, IForm::Memv { .. }));
    assert_eq!(second.consequent.as_const(), Some(&fix(2)));
    assert_eq!(second.alternative.as_const(), Some(&fix(3)));
}

#[test]
fn setter_rewrite_for_set_on_a_form() {
    // (set! (car p) v) == ((setter car) p v)
    let vm = Vm::new();
    let form = l(&[sym("set!"), l(&[sym("car"), sym("p")]), sym("v")]);

    let iform = compile_p1(&vm, &form, None).unwrap();
    let IForm::Call(call) = &*iform else {
        panic!("expected a call, got {}", iform)
    };
    assert_eq!(call.args.len(), 2);
    let IForm::Call(inner) = &*call.proc else {
        panic!("operator should be (setter car), got {}", call.proc)
    };
    let IForm::GRef(gref) = &*inner.proc else {
        panic!("expected gref to setter")
    };
    assert_eq!(bask::sexpr::unwrap_identifier(&gref.id).as_str(), "setter");
}

#[test]
fn quasiquote_builds_cons_append_trees() {
    // `(1 ,(+ 2 3) ,@xs 6)
    let vm = Vm::new();
    let form = l(&[
        sym("quasiquote"),
        l(&[
            fix(1),
            l(&[sym("unquote"), l(&[sym("+"), fix(2), fix(3)])]),
            l(&[sym("unquote-splicing"), sym("xs")]),
            fix(6),
        ]),
    ]);

    let iform = compile_p1(&vm, &form, None).unwrap();
    let IForm::Cons { arg0, arg1 } = &*iform else {
        panic!("expected cons spine, got {}", iform)
    };
    assert_eq!(arg0.as_const(), Some(&fix(1)));
    let IForm::Cons { arg0, arg1 } = &**arg1 else {
        panic!("expected second cons")
    };
    assert_eq!(arg0.as_const(), Some(&fix(5)));
    let IForm::Append { arg0, arg1 } = &**arg1 else {
        panic!("expected append at the splice")
    };
    assert!(matches!(&**arg0, IForm::GRef(_)));
    let tail = arg1.as_const().expect("trailing constants fold");
    assert_eq!(tail.list_length(), Some(1));
    assert_eq!(tail.car(), fix(6));
}

#[test]
fn quasiquote_without_unquote_is_one_constant() {
    let vm = Vm::new();
    let form = l(&[sym("quasiquote"), l(&[fix(1), l(&[fix(2), fix(3)])])]);
    let iform = compile_p1(&vm, &form, None).unwrap();
    assert!(iform.as_const().is_some());
}

#[test]
fn empty_let_compiles_like_its_body() {
    let vm = Vm::new();
    let with_let = l(&[sym("let"), Sexpr::Null, l(&[sym("+"), fix(1), fix(2)])]);
    let bare = l(&[sym("+"), fix(1), fix(2)]);

    let a = compile(&vm, &with_let, None).unwrap();
    let b = compile(&vm, &bare, None).unwrap();
    assert_eq!(*a, *b);
}

#[test]
fn begin_boundaries() {
    let vm = Vm::new();

    // (begin e) == e
    let a = compile(&vm, &l(&[sym("begin"), fix(7)]), None).unwrap();
    let b = compile(&vm, &fix(7), None).unwrap();
    assert_eq!(*a, *b);

    // (begin) yields the undefined value
    let empty = compile(&vm, &l(&[sym("begin")]), None).unwrap();
    assert_eq!(insns(&empty), vec![Insn::ConstU, Insn::Ret]);
}

#[test]
fn constant_if_folds_to_the_taken_branch() {
    let vm = Vm::new();
    let form = l(&[sym("if"), Sexpr::Boolean(true), fix(1), fix(2)]);
    let iform = compile_p2(&vm, &form, None).unwrap();
    assert_eq!(iform.as_const(), Some(&fix(1)));

    let form = l(&[sym("if"), Sexpr::Boolean(false), fix(1), fix(2)]);
    let iform = compile_p2(&vm, &form, None).unwrap();
    assert_eq!(iform.as_const(), Some(&fix(2)));
}

#[test]
fn arity_failing_inlined_call_is_a_compile_time_error() {
    let vm = Vm::new();

    // wrong arity on an instruction inliner
    let err = compile(&vm, &l(&[sym("car"), fix(1), fix(2)]), None).unwrap_err();
    assert!(matches!(err, CompileError::Arity { got: 2, .. }));

    // wrong arity on a beta-reduced lambda
    let form = l(&[
        l(&[sym("lambda"), l(&[sym("x")]), sym("x")]),
        fix(1),
        fix(2),
    ]);
    let err = compile(&vm, &form, None).unwrap_err();
    assert!(matches!(err, CompileError::Arity { got: 2, .. }));
}

#[test]
fn toplevel_only_forms_fail_in_expression_position() {
    let vm = Vm::new();
    let form = l(&[
        sym("lambda"),
        Sexpr::Null,
        l(&[sym("define-constant"), sym("x"), fix(1)]),
        fix(2),
    ]);
    let err = compile(&vm, &form, None).unwrap_err();
    assert!(matches!(err, CompileError::Syntax { .. }));
}

#[test]
fn compiling_twice_yields_identical_instruction_vectors() {
    let vm = Vm::new();
    let form = l(&[
        sym("let"),
        l(&[l(&[sym("x"), fix(1)]), l(&[sym("y"), l(&[sym("f"), fix(2)])])]),
        l(&[sym("cond"), l(&[sym("x"), sym("y")]), l(&[sym("else"), fix(0)])]),
    ]);

    let a = compile(&vm, &form, None).unwrap();
    let b = compile(&vm, &form, None).unwrap();
    assert_eq!(*a, *b);
}

#[test]
fn pass2_is_idempotent() {
    let vm = Vm::new();
    let form = l(&[
        sym("let"),
        sym("loop"),
        l(&[l(&[sym("i"), fix(0)])]),
        l(&[
            sym("if"),
            l(&[sym("="), sym("i"), fix(10)]),
            sym("i"),
            l(&[sym("loop"), l(&[sym("+"), sym("i"), fix(1)])]),
        ]),
    ]);

    let once = compile_p2(&vm, &form, None).unwrap();
    let snapshot = iform_copy(&once, &mut std::collections::HashMap::new());
    let twice = bask::pass2::pass2(once, &vm.flags).unwrap();
    assert!(
        iform_structural_eq(&snapshot, &twice),
        "second pass 2 changed the tree:\n{}\nvs\n{}",
        snapshot,
        twice
    );
}

#[test]
fn internal_defines_build_an_implicit_letrec() {
    let vm = Vm::new();
    // (lambda () (define (f) (g)) (define (g) 1) (f))
    let form = l(&[
        sym("lambda"),
        Sexpr::Null,
        l(&[sym("define"), l(&[sym("f")]), l(&[sym("g")])]),
        l(&[sym("define"), l(&[sym("g")]), fix(1)]),
        l(&[sym("f")]),
    ]);

    let iform = compile_p1(&vm, &form, None).unwrap();
    let IForm::Lambda(lam) = &*iform else { panic!() };
    let IForm::Let(let_) = &*lam.body else {
        panic!("expected implicit letrec, got {}", lam.body)
    };
    assert_eq!(let_.kind, LetKind::Rec);
    assert_eq!(let_.lvars.len(), 2);
}

#[test]
fn cond_arrow_calls_the_receiver_only_when_truthy() {
    let vm = Vm::new();
    // (cond ((f) => g) (else 0))
    let form = l(&[
        sym("cond"),
        l(&[l(&[sym("f")]), sym("=>"), sym("g")]),
        l(&[sym("else"), fix(0)]),
    ]);

    let iform = compile_p1(&vm, &form, None).unwrap();
    let IForm::Let(let_) = &*iform else { panic!("got {}", iform) };
    let IForm::If(ifn) = &*let_.body else { panic!() };
    assert!(matches!(&*ifn.cond, IForm::LRef(_)));
    let IForm::Call(call) = &*ifn.consequent else {
        panic!("consequent should call the receiver")
    };
    assert_eq!(call.args.len(), 1);
}

#[test]
fn receive_compiles_to_a_receive_frame() {
    let vm = Vm::new();
    // (receive (a b) (f) (cons a b))
    let form = l(&[
        sym("receive"),
        l(&[sym("a"), sym("b")]),
        l(&[sym("f")]),
        l(&[sym("cons"), sym("a"), sym("b")]),
    ]);

    let code = compile(&vm, &form, None).unwrap();
    assert!(insns(&code).contains(&Insn::TailReceive {
        reqargs: 2,
        optarg: false
    }));
}

#[test]
fn define_inline_bodies_expand_at_call_sites() {
    let vm = Vm::new();
    compile(
        &vm,
        &l(&[
            sym("define-inline"),
            l(&[sym("twice"), sym("x")]),
            l(&[sym("+"), sym("x"), sym("x")]),
        ]),
        None,
    )
    .unwrap();

    // (twice 21) expands and folds to 42
    let iform = compile_p2(&vm, &l(&[sym("twice"), fix(21)]), None).unwrap();
    assert_eq!(iform.as_const(), Some(&fix(42)));
}

#[test]
fn max_stack_is_recorded() {
    let vm = Vm::new();
    let form = l(&[
        sym("let"),
        l(&[l(&[sym("x"), fix(1)])]),
        l(&[sym("f"), sym("x"), fix(2), fix(3)]),
    ]);
    let code = compile(&vm, &form, None).unwrap();
    assert!(code.max_stack >= 3, "max stack {} too small", code.max_stack);
}

#[test]
fn labels_are_resolved_in_branching_code() {
    let vm = Vm::new();
    let form = l(&[
        sym("if"),
        l(&[sym("null?"), sym("xs")]),
        l(&[sym("f"), fix(1)]),
        l(&[sym("g"), fix(2)]),
    ]);
    let code = compile(&vm, &form, None).unwrap();
    for (i, inst) in code.code.iter().enumerate() {
        if let Operand::Label(l) | Operand::ObjLabel(_, l) = &inst.operand {
            let off = code.label_offsets[l.0];
            assert!(off <= code.code.len(), "label in insn {} dangles", i);
        }
    }
    assert!(insns(&code).contains(&Insn::Bnnull));
}

#[test]
fn gref_call_fuses_in_the_combiner() {
    let vm = Vm::new();
    let code = compile(&vm, &l(&[sym("f"), fix(1)]), None).unwrap();
    let ops = insns(&code);
    assert!(
        ops.contains(&Insn::GrefTailCall(1)),
        "expected fused operator load and tail call: {}",
        code
    );
}

fn _assert_inst_traits(i: &Inst) -> bool {
    // Inst supports structural comparison for the determinism tests
    i == i
}
