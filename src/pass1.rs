//! Pass 1. Parse and resolve.
//!
//! Walks a source form, resolves every name against the compile-time
//! environment, expands macros and inlinable procedures, and produces
//! the IR tree. Special forms are ordinary global bindings of the core
//! module holding a syntax handler, so lexical shadowing works the same
//! way for them as for everything else.

use log::trace;

use crate::{
    cenv::{BindKind, Cenv},
    error::CompileError,
    inliners::Inliner,
    module::{
        call_macro_expander, export_symbols, identifier_global_binding, import_module,
        insert_binding, insert_syntax_binding, make_module, Binding, Module, Syntax,
    },
    pack::{pack_iform, unpack_iform},
    ptr::P,
    sexpr::{
        gensym, identifier_to_symbol, make_identifier, sexp_cons, sexp_eq, strip_syntax,
        Identifier, Sexpr, SourceLoc,
    },
    tree_il::{
        make_lvar, make_seq, Asm, Call, CallFlag, Define, GRef, GSet, IForm, If, LRef, LSet,
        Lambda, LambdaFlag, Let, LetKind, Receive, DEFINE_CONST, DEFINE_INLINE,
    },
    vm::EvalSituation,
};

fn syntax_error<T>(message: &str, form: &Sexpr) -> Result<T, CompileError> {
    Err(CompileError::syntax(message, form))
}

fn check_toplevel(name: &str, form: &Sexpr, cenv: &Cenv) -> Result<(), CompileError> {
    if cenv.is_toplevel() {
        Ok(())
    } else {
        syntax_error(&format!("{} is allowed only at toplevel", name), form)
    }
}

pub fn pass1(program: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if program.is_pair() {
        if !program.is_list() {
            return syntax_error(
                "proper list required for application or macro use",
                program,
            );
        }

        let head = program.car();
        if head.is_identifier() {
            match cenv.lookup(&head, BindKind::Syntax) {
                Sexpr::LVar(lvar) => {
                    let lref = P(IForm::LRef(LRef { lvar }));
                    pass1_call(program, lref, &program.cdr(), cenv)
                }
                Sexpr::Macro(mac) => {
                    let expanded = call_macro_expander(&mac, program, cenv)?;
                    pass1(&expanded, cenv)
                }
                Sexpr::Identifier(id) => global_call(program, id, cenv),
                other => syntax_error(&format!("cannot call: {}", other), program),
            }
        } else {
            let rator = pass1(&head, &cenv.sans_name())?;
            pass1_call(program, rator, &program.cdr(), cenv)
        }
    } else if program.is_identifier() {
        match cenv.lookup(program, BindKind::Lexical) {
            Sexpr::LVar(lvar) => Ok(P(IForm::LRef(LRef { lvar }))),
            Sexpr::Identifier(id) => {
                if !cenv.vm.flags.noinline_consts {
                    if let Some(gloc) = identifier_global_binding(&id) {
                        if let Some(value) = gloc.const_value() {
                            return Ok(P(IForm::Const(value.clone())));
                        }
                    }
                }
                Ok(P(IForm::GRef(GRef { id })))
            }
            other => syntax_error(&format!("cannot reference: {}", other), program),
        }
    } else {
        Ok(P(IForm::Const(program.clone())))
    }
}

fn global_call(program: &Sexpr, id: P<Identifier>, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    let gloc = identifier_global_binding(&id);
    match gloc.as_ref().map(|g| &g.binding) {
        Some(Binding::Syntax(syntax)) => {
            trace!("pass1: syntax {}", syntax.name);
            (syntax.handler)(program, cenv)
        }
        Some(Binding::Macro(mac)) => {
            let mac = mac.clone();
            let expanded = call_macro_expander(&mac, program, cenv)?;
            pass1(&expanded, cenv)
        }
        Some(Binding::Inlinable(inliner)) if !cenv.vm.flags.noinline_globals => {
            let inliner = inliner.clone();
            expand_inliner(inliner, program, id, cenv)
        }
        _ => {
            let gref = P(IForm::GRef(GRef { id }));
            pass1_call(program, gref, &program.cdr(), cenv)
        }
    }
}

/// Common entry for procedure calls.
pub fn pass1_call(
    program: &Sexpr,
    proc: P<IForm>,
    args: &Sexpr,
    cenv: &Cenv,
) -> Result<P<IForm>, CompileError> {
    let cenv_args = cenv.sans_name();
    let iargs = args
        .list_to_vec()
        .iter()
        .map(|a| pass1(a, &cenv_args))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(P(IForm::Call(Call {
        src: cenv.maybe_source(program),
        proc,
        args: iargs,
        flag: CallFlag::None,
    })))
}

fn expand_inliner(
    inliner: Inliner,
    program: &Sexpr,
    id: P<Identifier>,
    cenv: &Cenv,
) -> Result<P<IForm>, CompileError> {
    let cenv_args = cenv.sans_name();
    let iargs = program
        .cdr()
        .list_to_vec()
        .iter()
        .map(|a| pass1(a, &cenv_args))
        .collect::<Result<Vec<_>, _>>()?;

    match inliner {
        Inliner::Asm { insn, nargs } => {
            if iargs.len() != nargs {
                return Err(CompileError::Arity {
                    name: crate::sexpr::unwrap_identifier(&id).to_string(),
                    required: nargs,
                    variadic: false,
                    got: iargs.len(),
                });
            }
            Ok(P(IForm::Asm(Asm {
                src: cenv.maybe_source(program),
                insn,
                args: iargs,
            })))
        }
        Inliner::Packed(packed) => {
            let iform = unpack_iform(&packed);
            let IForm::Lambda(lam) = &*iform else {
                return Err(CompileError::internal(
                    "packed inliner does not contain a lambda",
                ));
            };
            expand_inlined_procedure(cenv.maybe_source(program), lam, iargs)
        }
        Inliner::Proc(f) => match f(program, &iargs, cenv)? {
            Some(iform) => Ok(iform),
            None => Ok(P(IForm::Call(Call {
                src: cenv.maybe_source(program),
                proc: P(IForm::GRef(GRef { id })),
                args: iargs,
                flag: CallFlag::None,
            }))),
        },
    }
}

/// Beta-expansion of a lambda applied to known arguments. The lambda's
/// body is consumed; callers inline a fresh copy when the lambda is
/// referenced elsewhere.
pub fn expand_inlined_procedure(
    src: Option<SourceLoc>,
    lam: &P<Lambda>,
    iargs: Vec<P<IForm>>,
) -> Result<P<IForm>, CompileError> {
    let args = adjust_arglist(lam.reqargs, lam.optarg, iargs, &lam.name)?;
    let lvars = lam.lvars.clone();
    for (lvar, arg) in lvars.iter().zip(args.iter()) {
        let mut lvar = lvar.clone();
        lvar.initval = Some(arg.clone());
    }
    Ok(P(IForm::Let(Let {
        src,
        kind: LetKind::Let,
        lvars,
        inits: args,
        body: lam.body.clone(),
    })))
}

pub fn argcount_is_ok(argc: usize, reqargs: u32, optarg: bool) -> bool {
    (!optarg && argc == reqargs as usize) || (optarg && argc >= reqargs as usize)
}

/// Matches an argument list against `(reqargs, optarg)`; surplus
/// arguments of a variadic procedure are collected into a LIST node
/// bound to the rest variable.
pub fn adjust_arglist(
    reqargs: u32,
    optarg: bool,
    iargs: Vec<P<IForm>>,
    name: &Sexpr,
) -> Result<Vec<P<IForm>>, CompileError> {
    if !argcount_is_ok(iargs.len(), reqargs, optarg) {
        return Err(CompileError::Arity {
            name: format!("{}", name),
            required: reqargs as usize,
            variadic: optarg,
            got: iargs.len(),
        });
    }

    if !optarg {
        Ok(iargs)
    } else {
        let mut reqs = iargs;
        let rest = reqs.split_off(reqargs as usize);
        reqs.push(if rest.is_empty() {
            IForm::const_nil()
        } else {
            P(IForm::List { elems: rest })
        });
        Ok(reqs)
    }
}

/// Compiles a body, collecting leading internal definitions (expanding
/// macros as needed) into an implicit letrec.
pub fn pass1_body(exprs: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    let mut rest = exprs.clone();
    let mut defs: Vec<(Sexpr, Sexpr)> = Vec::new();

    while let Sexpr::Pair(p) = rest.clone() {
        let form = p.0.clone();
        let tail = p.1.clone();

        if !(form.is_pair() && form.is_list() && form.car().is_identifier()) {
            break;
        }

        match cenv.lookup(&form.car(), BindKind::Syntax) {
            Sexpr::LVar(_) => break,
            Sexpr::Macro(mac) => {
                let expanded = call_macro_expander(&mac, &form, cenv)?;
                rest = sexp_cons(expanded, tail);
            }
            Sexpr::Identifier(id) => {
                match identifier_global_binding(&id).as_ref().map(|g| &g.binding) {
                    Some(Binding::Syntax(s)) if s.name == "define" => {
                        let def = parse_internal_define(&form)?;
                        if defs.iter().any(|(n, _)| sexp_eq(n, &def.0)) {
                            return syntax_error("duplicate internal definition", &form);
                        }
                        defs.push(def);
                        rest = tail;
                    }
                    Some(Binding::Syntax(s)) if s.name == "begin" => {
                        rest = Sexpr::append(tail, form.cdr());
                    }
                    Some(Binding::Macro(mac)) => {
                        let mac = mac.clone();
                        let expanded = call_macro_expander(&mac, &form, cenv)?;
                        rest = sexp_cons(expanded, tail);
                    }
                    _ => break,
                }
            }
            _ => break,
        }
    }

    if defs.is_empty() {
        return pass1_body_rest(&rest, cenv);
    }

    let lvars: Vec<_> = defs.iter().map(|(n, _)| make_lvar(n.clone())).collect();
    let frame = Sexpr::list_from_iter(
        defs.iter()
            .zip(lvars.iter())
            .map(|((n, _), lv)| sexp_cons(n.clone(), Sexpr::LVar(lv.clone()))),
    );
    let newenv = cenv.extend(frame, BindKind::Lexical);

    let mut inits = Vec::new();
    for ((name, expr), lvar) in defs.iter().zip(lvars.iter()) {
        let iexpr = pass1(expr, &newenv.add_name(name))?;
        if let IForm::Lambda(lam) = &*iexpr {
            let mut lam = lam.clone();
            lam.name = name.clone();
        }
        let mut lvar = lvar.clone();
        lvar.initval = Some(iexpr.clone());
        inits.push(iexpr);
    }

    let body = pass1_body_rest(&rest, &newenv)?;
    Ok(P(IForm::Let(Let {
        src: None,
        kind: LetKind::Rec,
        lvars,
        inits,
        body,
    })))
}

fn parse_internal_define(form: &Sexpr) -> Result<(Sexpr, Sexpr), CompileError> {
    let args = form.cdr();
    if args.is_pair() && args.car().is_pair() {
        // (define (name . formals) body ...)
        let name = args.caar();
        if !name.is_identifier() {
            return syntax_error("malformed internal define", form);
        }
        let lambda = sexp_cons(
            Sexpr::symbol("lambda"),
            sexp_cons(args.cdar(), args.cdr()),
        );
        Ok((name, lambda))
    } else if args.is_pair() && args.car().is_identifier() {
        if args.cdr().is_null() {
            Ok((args.car(), Sexpr::Undefined))
        } else if args.cddr().is_null() {
            Ok((args.car(), args.cadr()))
        } else {
            syntax_error("malformed internal define", form)
        }
    } else {
        syntax_error("malformed internal define", form)
    }
}

fn pass1_body_rest(exprs: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if exprs.is_null() {
        return Ok(IForm::const_undef());
    }
    if exprs.cdr().is_null() {
        return pass1(&exprs.car(), cenv);
    }

    let stmtenv = cenv.sans_name();
    let items = exprs.list_to_vec();
    let last = items.len() - 1;
    let mut forms = Vec::with_capacity(items.len());
    for (i, e) in items.iter().enumerate() {
        forms.push(pass1(e, if i == last { cenv } else { &stmtenv })?);
    }
    Ok(make_seq(None, forms))
}

fn parse_formals(formals: &Sexpr, form: &Sexpr) -> Result<(Vec<Sexpr>, Option<Sexpr>), CompileError> {
    let mut reqs = Vec::new();
    let mut xs = formals.clone();
    loop {
        match xs.clone() {
            Sexpr::Null => return Ok((reqs, None)),
            Sexpr::Pair(p) => {
                if !p.0.is_identifier() {
                    return syntax_error("invalid formal parameter", form);
                }
                reqs.push(p.0.clone());
                xs = p.1.clone();
            }
            rest if rest.is_identifier() => return Ok((reqs, Some(rest))),
            _ => return syntax_error("invalid formal parameter list", form),
        }
    }
}

/// Builds a LAMBDA node: binds the formals, extends the cenv, compiles
/// the body with internal-define handling.
pub fn pass1_vanilla_lambda(
    form: &Sexpr,
    reqs: Vec<Sexpr>,
    rest: Option<Sexpr>,
    body: &Sexpr,
    cenv: &Cenv,
) -> Result<P<IForm>, CompileError> {
    let reqargs = reqs.len() as u32;
    let optarg = rest.is_some();
    let mut all = reqs;
    if let Some(r) = rest {
        all.push(r);
    }

    let lvars: Vec<_> = all.iter().map(|n| make_lvar(n.clone())).collect();
    let frame = Sexpr::list_from_iter(
        all.iter()
            .zip(lvars.iter())
            .map(|(n, lv)| sexp_cons(n.clone(), Sexpr::LVar(lv.clone()))),
    );

    let lam = P(Lambda {
        src: cenv.maybe_source(form),
        name: cenv.exp_name.clone(),
        reqargs,
        optarg,
        lvars,
        body: IForm::const_undef(),
        flag: LambdaFlag::None,
        calls: vec![],
        free_lvars: vec![],
    });

    let newenv = cenv.extend(frame, BindKind::Lexical).with_proc(lam.clone());
    let body = pass1_body(body, &newenv)?;
    {
        let mut lam = lam.clone();
        lam.body = body;
    }
    Ok(P(IForm::Lambda(lam)))
}

// ---------------------------------------------------------------------
// special form handlers

fn syn_define(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("define", form, cenv)?;
    pass1_define(&form.cdr(), form, 0, cenv.module(), cenv)
}

fn syn_define_constant(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("define-constant", form, cenv)?;
    pass1_define(&form.cdr(), form, DEFINE_CONST, cenv.module(), cenv)
}

fn syn_define_inline(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("define-inline", form, cenv)?;
    pass1_define(&form.cdr(), form, DEFINE_INLINE, cenv.module(), cenv)
}

fn syn_define_in_module(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("define-in-module", form, cenv)?;
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed define-in-module", form);
    }
    let module = ensure_module(&form.cadr(), "define-in-module", false, cenv)?;
    pass1_define(&form.cddr(), form, 0, module, cenv)
}

fn pass1_define(
    args: &Sexpr,
    oform: &Sexpr,
    flags: u32,
    module: P<Module>,
    cenv: &Cenv,
) -> Result<P<IForm>, CompileError> {
    if !args.is_pair() {
        return syntax_error("malformed define", oform);
    }

    // (define (name . formals) body ...) sugar
    if args.car().is_pair() {
        let name = args.caar();
        let lambda = sexp_cons(
            Sexpr::symbol("lambda"),
            sexp_cons(args.cdar(), args.cdr()),
        );
        let rewritten = Sexpr::list(&[name, lambda]);
        return pass1_define(&rewritten, oform, flags, module, cenv);
    }

    let name = args.car();
    if !name.is_identifier() {
        return syntax_error("define: name must be an identifier", oform);
    }

    let value_expr = if args.cdr().is_null() {
        Sexpr::Undefined
    } else if args.cddr().is_null() {
        args.cadr()
    } else {
        return syntax_error("malformed define", oform);
    };

    let id = match &name {
        Sexpr::Identifier(id) => id.clone(),
        _ => make_identifier(name.clone(), module, Sexpr::Null),
    };

    let value = pass1(&value_expr, &cenv.add_name(&name))?;
    if let IForm::Lambda(lam) = &*value {
        let mut lam = lam.clone();
        lam.name = name.clone();
    }

    let binding = if flags & DEFINE_INLINE != 0 && matches!(&*value, IForm::Lambda(_)) {
        Binding::Inlinable(Inliner::Packed(P(pack_iform(&value))))
    } else if flags & DEFINE_CONST != 0 {
        match &*value {
            IForm::Const(v) => Binding::Value(v.clone()),
            _ => Binding::Forward,
        }
    } else {
        Binding::Forward
    };

    let mut target = id.module.clone();
    insert_binding(
        &mut target,
        identifier_to_symbol(&name),
        binding,
        flags & DEFINE_CONST != 0,
    );

    Ok(P(IForm::Define(Define {
        src: cenv.maybe_source(oform),
        flags,
        id,
        value,
    })))
}

fn syn_define_syntax(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    define_transformer("define-syntax", form, cenv)
}

fn syn_define_macro(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    define_transformer("define-macro", form, cenv)
}

fn define_transformer(
    who: &str,
    form: &Sexpr,
    cenv: &Cenv,
) -> Result<P<IForm>, CompileError> {
    check_toplevel(who, form, cenv)?;
    if form.list_length() != Some(3) {
        return syntax_error(&format!("malformed {}", who), form);
    }
    let name = form.cadr();
    if !name.is_identifier() {
        return syntax_error(&format!("{}: name must be an identifier", who), form);
    }

    let Some(hook) = cenv.vm.macro_eval else {
        return Err(CompileError::compile(format!(
            "{}: no transformer evaluator installed by the host",
            who
        )));
    };
    let mac = hook(&form.caddr(), &cenv.add_name(&name))?;

    let mut module = cenv.module();
    insert_binding(
        &mut module,
        identifier_to_symbol(&name),
        Binding::Macro(mac),
        false,
    );
    Ok(IForm::const_undef())
}

fn ensure_module(
    thing: &Sexpr,
    who: &str,
    create: bool,
    cenv: &Cenv,
) -> Result<P<Module>, CompileError> {
    if !thing.is_identifier() {
        return syntax_error(&format!("{}: module name required", who), thing);
    }
    let name = identifier_to_symbol(thing);
    if let Some(m) = cenv.vm.find_module(&name) {
        return Ok(m);
    }
    if create {
        let module = make_module(name);
        let mut vm = cenv.vm.clone();
        vm.register_module(module.clone());
        Ok(module)
    } else {
        Err(CompileError::compile(format!(
            "{}: module {} not found",
            who, name
        )))
    }
}

fn syn_define_module(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("define-module", form, cenv)?;
    if form.list_length().map_or(true, |n| n < 2) {
        return syntax_error("malformed define-module", form);
    }
    let mut module = ensure_module(&form.cadr(), "define-module", true, cenv)?;
    if let Some(core) = cenv.vm.find_module(&crate::sexpr::intern("null")) {
        import_module(&mut module, core);
    }
    let newenv = cenv.with_module(module);
    let forms = form
        .cddr()
        .list_to_vec()
        .iter()
        .map(|e| pass1(e, &newenv))
        .collect::<Result<Vec<_>, _>>()?;
    if forms.is_empty() {
        return Ok(IForm::const_undef());
    }
    Ok(make_seq(cenv.maybe_source(form), forms))
}

fn syn_with_module(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 2) {
        return syntax_error("malformed with-module", form);
    }
    let module = ensure_module(&form.cadr(), "with-module", false, cenv)?;
    let newenv = cenv.with_module(module);
    let body = form.cddr();
    if body.is_null() {
        return Ok(IForm::const_undef());
    }
    pass1_body_rest(&body, &newenv)
}

fn syn_select_module(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("select-module", form, cenv)?;
    if form.list_length() != Some(2) {
        return syntax_error("malformed select-module", form);
    }
    let module = ensure_module(&form.cadr(), "select-module", false, cenv)?;
    let mut vm = cenv.vm.clone();
    vm.current_module = module.clone();
    cenv.set_module(module);
    Ok(IForm::const_undef())
}

fn syn_export(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("export", form, cenv)?;
    let mut module = cenv.module();
    export_symbols(&mut module, &form.cdr())?;
    Ok(IForm::const_undef())
}

fn syn_import(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    check_toplevel("import", form, cenv)?;
    let mut module = cenv.module();
    let mut result = Ok(());
    form.cdr().list_for_each(|name| {
        if result.is_err() {
            return;
        }
        match ensure_module(name, "import", false, cenv) {
            Ok(imported) => import_module(&mut module, imported),
            Err(e) => result = Err(e),
        }
    });
    result?;
    Ok(IForm::const_undef())
}

fn syn_begin(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    let body = form.cdr();
    if body.is_null() {
        return Ok(IForm::const_undef());
    }
    pass1_body_rest(&body, cenv)
}

fn syn_if(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    let (test, consequent, alternative) = match form.list_length() {
        Some(3) => (form.cadr(), form.caddr(), Sexpr::Undefined),
        Some(4) => (form.cadr(), form.caddr(), form.cadddr()),
        _ => return syntax_error("malformed if", form),
    };

    Ok(P(IForm::If(If {
        src: cenv.maybe_source(form),
        cond: pass1(&test, &cenv.sans_name())?,
        consequent: pass1(&consequent, cenv)?,
        alternative: match alternative {
            Sexpr::Undefined => IForm::const_undef(),
            alt => pass1(&alt, cenv)?,
        },
    })))
}

fn syn_lambda(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed lambda", form);
    }
    let (reqs, rest) = parse_formals(&form.cadr(), form)?;
    pass1_vanilla_lambda(form, reqs, rest, &form.cddr(), cenv)
}

struct ParsedBinding {
    name: Sexpr,
    init: Sexpr,
}

fn parse_bindings(bindings: &Sexpr, form: &Sexpr) -> Result<Vec<ParsedBinding>, CompileError> {
    if !bindings.is_list() {
        return syntax_error("invalid binding list", form);
    }
    let mut out = Vec::new();
    let mut err = None;
    bindings.list_for_each(|kv| {
        if err.is_some() {
            return;
        }
        if kv.is_pair() && kv.car().is_identifier() && kv.cdr().is_pair() && kv.cddr().is_null() {
            out.push(ParsedBinding {
                name: kv.car(),
                init: kv.cadr(),
            });
        } else {
            err = Some(CompileError::syntax("invalid binding", kv));
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

fn syn_let(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed let", form);
    }

    let bindings = form.cadr();
    if bindings.is_identifier() {
        return pass1_named_let(form, cenv);
    }
    if bindings.is_null() {
        return pass1_body(&form.cddr(), cenv);
    }

    let parsed = parse_bindings(&bindings, form)?;
    let lvars: Vec<_> = parsed.iter().map(|b| make_lvar(b.name.clone())).collect();

    // init expressions see the outer cenv
    let mut inits = Vec::new();
    for (b, lvar) in parsed.iter().zip(lvars.iter()) {
        let iexpr = pass1(&b.init, &cenv.add_name(&b.name))?;
        let mut lvar = lvar.clone();
        lvar.initval = Some(iexpr.clone());
        inits.push(iexpr);
    }

    let frame = Sexpr::list_from_iter(
        parsed
            .iter()
            .zip(lvars.iter())
            .map(|(b, lv)| sexp_cons(b.name.clone(), Sexpr::LVar(lv.clone()))),
    );
    let newenv = cenv.extend(frame, BindKind::Lexical);
    let body = pass1_body(&form.cddr(), &newenv)?;

    Ok(P(IForm::Let(Let {
        src: cenv.maybe_source(form),
        kind: LetKind::Let,
        lvars,
        inits,
        body,
    })))
}

/// Named let expands to `(letrec ((name (lambda (var ...) body ...)))
/// (name init ...))` rather than the textbook form, so the closure
/// optimizer can spot the loop.
fn pass1_named_let(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 4) {
        return syntax_error("malformed named let", form);
    }
    let name = form.cadr();
    let bindings = form.caddr();
    let body = form.cdddr();

    let parsed = parse_bindings(&bindings, form)?;
    let loop_lvar = make_lvar(name.clone());
    let arg_lvars: Vec<_> = parsed.iter().map(|b| make_lvar(b.name.clone())).collect();

    // the inits see neither the loop name nor the arguments
    let argenv = cenv.sans_name();
    let env1 = cenv.extend(
        Sexpr::list(&[sexp_cons(name.clone(), Sexpr::LVar(loop_lvar.clone()))]),
        BindKind::Lexical,
    );
    let env2 = env1.extend(
        Sexpr::list_from_iter(
            parsed
                .iter()
                .zip(arg_lvars.iter())
                .map(|(b, lv)| sexp_cons(b.name.clone(), Sexpr::LVar(lv.clone()))),
        ),
        BindKind::Lexical,
    );

    let lam = P(Lambda {
        src: cenv.maybe_source(form),
        name: name.clone(),
        reqargs: arg_lvars.len() as u32,
        optarg: false,
        lvars: arg_lvars,
        body: IForm::const_undef(),
        flag: LambdaFlag::None,
        calls: vec![],
        free_lvars: vec![],
    });
    let lambody = pass1_body(&body, &env2.with_proc(lam.clone()))?;
    {
        let mut lam = lam.clone();
        lam.body = lambody;
    }

    let lam_iform = P(IForm::Lambda(lam));
    {
        let mut loop_lvar = loop_lvar.clone();
        loop_lvar.initval = Some(lam_iform.clone());
    }

    let mut cargs = Vec::new();
    for b in parsed.iter() {
        cargs.push(pass1(&b.init, &argenv)?);
    }

    let call = P(IForm::Call(Call {
        src: cenv.maybe_source(form),
        proc: P(IForm::LRef(LRef {
            lvar: loop_lvar.clone(),
        })),
        args: cargs,
        flag: CallFlag::None,
    }));

    Ok(P(IForm::Let(Let {
        src: cenv.maybe_source(form),
        kind: LetKind::Rec,
        lvars: vec![loop_lvar],
        inits: vec![lam_iform],
        body: call,
    })))
}

fn syn_let_star(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed let*", form);
    }
    let parsed = parse_bindings(&form.cadr(), form)?;

    fn rec(
        parsed: &[ParsedBinding],
        body: &Sexpr,
        cenv: &Cenv,
    ) -> Result<P<IForm>, CompileError> {
        let Some(b) = parsed.first() else {
            return pass1_body(body, cenv);
        };
        let lvar = make_lvar(b.name.clone());
        let init = pass1(&b.init, &cenv.add_name(&b.name))?;
        {
            let mut lvar = lvar.clone();
            lvar.initval = Some(init.clone());
        }
        let newenv = cenv.extend(
            Sexpr::list(&[sexp_cons(b.name.clone(), Sexpr::LVar(lvar.clone()))]),
            BindKind::Lexical,
        );
        Ok(P(IForm::Let(Let {
            src: None,
            kind: LetKind::Let,
            lvars: vec![lvar],
            inits: vec![init],
            body: rec(&parsed[1..], body, &newenv)?,
        })))
    }

    rec(&parsed, &form.cddr(), cenv)
}

fn syn_letrec(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed letrec", form);
    }
    let bindings = form.cadr();
    if bindings.is_null() {
        return pass1_body(&form.cddr(), cenv);
    }
    let parsed = parse_bindings(&bindings, form)?;
    let lvars: Vec<_> = parsed.iter().map(|b| make_lvar(b.name.clone())).collect();
    let frame = Sexpr::list_from_iter(
        parsed
            .iter()
            .zip(lvars.iter())
            .map(|(b, lv)| sexp_cons(b.name.clone(), Sexpr::LVar(lv.clone()))),
    );
    // inits see the inner cenv
    let newenv = cenv.extend(frame, BindKind::Lexical);

    let mut inits = Vec::new();
    for (b, lvar) in parsed.iter().zip(lvars.iter()) {
        let iexpr = pass1(&b.init, &newenv.add_name(&b.name))?;
        let mut lvar = lvar.clone();
        lvar.initval = Some(iexpr.clone());
        inits.push(iexpr);
    }

    let body = pass1_body(&form.cddr(), &newenv)?;
    Ok(P(IForm::Let(Let {
        src: cenv.maybe_source(form),
        kind: LetKind::Rec,
        lvars,
        inits,
        body,
    })))
}

/// `do` builds the named-let shape directly so pass 2 can embed the
/// loop.
fn syn_do(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed do", form);
    }
    let specs = form.cadr();
    let test_clause = form.caddr();
    let body = form.cdddr();
    if !specs.is_list() || !test_clause.is_pair() {
        return syntax_error("malformed do", form);
    }

    struct DoVar {
        name: Sexpr,
        init: Sexpr,
        step: Option<Sexpr>,
    }

    let mut vars = Vec::new();
    let mut err = None;
    specs.list_for_each(|spec| {
        if err.is_some() {
            return;
        }
        let ok = spec.is_pair() && spec.car().is_identifier();
        let len = spec.list_length();
        if ok && (len == Some(2) || len == Some(3)) {
            vars.push(DoVar {
                name: spec.car(),
                init: spec.cadr(),
                step: if len == Some(3) {
                    Some(spec.caddr())
                } else {
                    None
                },
            });
        } else {
            err = Some(CompileError::syntax("invalid do binding", spec));
        }
    });
    if let Some(e) = err {
        return Err(e);
    }

    let loop_name = Sexpr::Symbol(gensym("do-loop"));
    let loop_lvar = make_lvar(loop_name.clone());
    let var_lvars: Vec<_> = vars.iter().map(|v| make_lvar(v.name.clone())).collect();

    let env_loop = cenv.extend(
        Sexpr::list(&[sexp_cons(loop_name, Sexpr::LVar(loop_lvar.clone()))]),
        BindKind::Lexical,
    );
    let env_vars = env_loop.extend(
        Sexpr::list_from_iter(
            vars.iter()
                .zip(var_lvars.iter())
                .map(|(v, lv)| sexp_cons(v.name.clone(), Sexpr::LVar(lv.clone()))),
        ),
        BindKind::Lexical,
    );
    let inner = env_vars.sans_name();

    let test = pass1(&test_clause.car(), &inner)?;
    let result = if test_clause.cdr().is_null() {
        IForm::const_undef()
    } else {
        pass1_body_rest(&test_clause.cdr(), &inner)?
    };

    let mut steps = Vec::new();
    for (v, lv) in vars.iter().zip(var_lvars.iter()) {
        steps.push(match &v.step {
            Some(step) => pass1(step, &inner)?,
            None => P(IForm::LRef(LRef { lvar: lv.clone() })),
        });
    }
    let recur = P(IForm::Call(Call {
        src: None,
        proc: P(IForm::LRef(LRef {
            lvar: loop_lvar.clone(),
        })),
        args: steps,
        flag: CallFlag::None,
    }));

    let repeat = if body.is_null() {
        recur
    } else {
        let mut forms = body
            .list_to_vec()
            .iter()
            .map(|e| pass1(e, &inner))
            .collect::<Result<Vec<_>, _>>()?;
        forms.push(recur);
        make_seq(None, forms)
    };

    let lambody = P(IForm::If(If {
        src: None,
        cond: test,
        consequent: result,
        alternative: repeat,
    }));

    let lam = P(Lambda {
        src: cenv.maybe_source(form),
        name: loop_lvar.name.clone(),
        reqargs: var_lvars.len() as u32,
        optarg: false,
        lvars: var_lvars,
        body: lambody,
        flag: LambdaFlag::None,
        calls: vec![],
        free_lvars: vec![],
    });
    let lam_iform = P(IForm::Lambda(lam));
    {
        let mut loop_lvar = loop_lvar.clone();
        loop_lvar.initval = Some(lam_iform.clone());
    }

    let inits = vars
        .iter()
        .map(|v| pass1(&v.init, &cenv.sans_name()))
        .collect::<Result<Vec<_>, _>>()?;
    let call = P(IForm::Call(Call {
        src: cenv.maybe_source(form),
        proc: P(IForm::LRef(LRef {
            lvar: loop_lvar.clone(),
        })),
        args: inits,
        flag: CallFlag::None,
    }));

    Ok(P(IForm::Let(Let {
        src: cenv.maybe_source(form),
        kind: LetKind::Rec,
        lvars: vec![loop_lvar],
        inits: vec![lam_iform],
        body: call,
    })))
}

fn syn_and_let_star(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 2) {
        return syntax_error("malformed and-let*", form);
    }
    let clauses = form.cadr();
    if !clauses.is_list() {
        return syntax_error("malformed and-let*", form);
    }

    fn rec(clauses: &[Sexpr], body: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
        let Some(clause) = clauses.first() else {
            return if body.is_null() {
                Ok(P(IForm::Const(Sexpr::Boolean(true))))
            } else {
                pass1_body(body, cenv)
            };
        };
        let rest = &clauses[1..];
        let last = rest.is_empty() && body.is_null();

        // (var expr) binds; (expr) and a bare variable just test
        if clause.is_pair() && clause.list_length() == Some(2) && clause.car().is_identifier() {
            let name = clause.car();
            let lvar = make_lvar(name.clone());
            let init = pass1(&clause.cadr(), &cenv.add_name(&name))?;
            {
                let mut lvar = lvar.clone();
                lvar.initval = Some(init.clone());
            }
            let newenv = cenv.extend(
                Sexpr::list(&[sexp_cons(name, Sexpr::LVar(lvar.clone()))]),
                BindKind::Lexical,
            );
            let then = if last {
                P(IForm::LRef(LRef { lvar: lvar.clone() }))
            } else {
                rec(rest, body, &newenv)?
            };
            return Ok(P(IForm::Let(Let {
                src: None,
                kind: LetKind::Let,
                lvars: vec![lvar.clone()],
                inits: vec![init],
                body: P(IForm::If(If {
                    src: None,
                    cond: P(IForm::LRef(LRef { lvar })),
                    consequent: then,
                    alternative: P(IForm::Const(Sexpr::Boolean(false))),
                })),
            })));
        }

        let test_expr = if clause.is_pair() && clause.list_length() == Some(1) {
            clause.car()
        } else if clause.is_identifier() {
            clause.clone()
        } else {
            return syntax_error("invalid and-let* clause", clause);
        };

        let test = pass1(&test_expr, &cenv.sans_name())?;
        let then = if last {
            P(IForm::It)
        } else {
            rec(rest, body, cenv)?
        };
        Ok(P(IForm::If(If {
            src: None,
            cond: test,
            consequent: then,
            alternative: P(IForm::Const(Sexpr::Boolean(false))),
        })))
    }

    rec(&clauses.list_to_vec(), &form.cddr(), cenv)
}

fn syn_receive(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 4) {
        return syntax_error("malformed receive", form);
    }
    let (reqs, rest) = parse_formals(&form.cadr(), form)?;
    let expr = pass1(&form.caddr(), &cenv.sans_name())?;

    let reqargs = reqs.len() as u32;
    let optarg = rest.is_some();
    let mut all = reqs;
    if let Some(r) = rest {
        all.push(r);
    }
    let lvars: Vec<_> = all.iter().map(|n| make_lvar(n.clone())).collect();
    let frame = Sexpr::list_from_iter(
        all.iter()
            .zip(lvars.iter())
            .map(|(n, lv)| sexp_cons(n.clone(), Sexpr::LVar(lv.clone()))),
    );
    let newenv = cenv.extend(frame, BindKind::Lexical);
    let body = pass1_body(&form.cdddr(), &newenv)?;

    Ok(P(IForm::Receive(Receive {
        src: cenv.maybe_source(form),
        reqargs,
        optarg,
        lvars,
        expr,
        body,
    })))
}

fn syn_set(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length() != Some(3) {
        return syntax_error("malformed set!", form);
    }
    let target = form.cadr();
    let value = form.caddr();

    // (set! (op arg ...) v) == ((setter op) arg ... v)
    if target.is_pair() {
        let setter = Sexpr::list(&[Sexpr::symbol("setter"), target.car()]);
        let rewritten = sexp_cons(
            setter,
            Sexpr::append(Sexpr::list(&[value]), target.cdr()),
        );
        return pass1(&rewritten, &cenv.sans_name());
    }

    if !target.is_identifier() {
        return syntax_error("set!: not a variable", form);
    }

    let value = pass1(&value, &cenv.add_name(&target))?;
    match cenv.lookup(&target, BindKind::Lexical) {
        Sexpr::LVar(lvar) => Ok(P(IForm::LSet(LSet { lvar, value }))),
        Sexpr::Identifier(id) => Ok(P(IForm::GSet(GSet {
            src: cenv.maybe_source(form),
            id,
            value,
        }))),
        other => syntax_error(&format!("set!: cannot assign to {}", other), form),
    }
}

fn syn_quote(form: &Sexpr, _cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length() != Some(2) {
        return syntax_error("malformed quote", form);
    }
    Ok(P(IForm::Const(strip_syntax(&form.cadr()))))
}

enum QqKeyword {
    Unquote,
    Splice,
    Quasi,
}

fn qq_keyword(form: &Sexpr) -> Option<(QqKeyword, Sexpr)> {
    if form.is_pair()
        && form.car().is_identifier()
        && form.cdr().is_pair()
        && form.cddr().is_null()
    {
        let kind = match identifier_to_symbol(&form.car()).as_str() {
            "unquote" => QqKeyword::Unquote,
            "unquote-splicing" => QqKeyword::Splice,
            "quasiquote" => QqKeyword::Quasi,
            _ => return None,
        };
        Some((kind, form.cadr()))
    } else {
        None
    }
}

fn qq_cons(a: P<IForm>, d: P<IForm>) -> P<IForm> {
    if let (Some(ca), Some(cd)) = (a.as_const(), d.as_const()) {
        return P(IForm::Const(sexp_cons(ca.clone(), cd.clone())));
    }
    P(IForm::Cons { arg0: a, arg1: d })
}

fn qq_append(a: P<IForm>, d: P<IForm>) -> P<IForm> {
    if let (Some(ca), Some(cd)) = (a.as_const(), d.as_const()) {
        if ca.is_list() {
            return P(IForm::Const(Sexpr::append(cd.clone(), ca.clone())));
        }
    }
    P(IForm::Append { arg0: a, arg1: d })
}

fn qq_wrap(keyword: &str, sub: P<IForm>) -> P<IForm> {
    qq_cons(
        P(IForm::Const(Sexpr::symbol(keyword))),
        qq_cons(sub, IForm::const_nil()),
    )
}

/// Quasiquote. Constant-folds whenever every nested unquote yields a
/// constant; otherwise builds constructor IR evaluated at runtime. The
/// depth counter keeps inner quasiquotes inert.
fn quasi(form: &Sexpr, depth: usize, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if let Some((kind, payload)) = qq_keyword(form) {
        match kind {
            QqKeyword::Unquote if depth == 0 => return pass1(&payload, &cenv.sans_name()),
            QqKeyword::Unquote => {
                return Ok(qq_wrap("unquote", quasi(&payload, depth - 1, cenv)?))
            }
            QqKeyword::Splice if depth == 0 => {
                return syntax_error("unquote-splicing in invalid context", form)
            }
            QqKeyword::Splice => {
                return Ok(qq_wrap("unquote-splicing", quasi(&payload, depth - 1, cenv)?))
            }
            QqKeyword::Quasi => {
                return Ok(qq_wrap("quasiquote", quasi(&payload, depth + 1, cenv)?))
            }
        }
    }

    match form {
        Sexpr::Pair(p) => {
            if depth == 0 {
                if let Some((QqKeyword::Splice, payload)) = qq_keyword(&p.0) {
                    let spliced = pass1(&payload, &cenv.sans_name())?;
                    let rest = quasi(&p.1, depth, cenv)?;
                    return Ok(qq_append(spliced, rest));
                }
            }
            let a = quasi(&p.0, depth, cenv)?;
            let d = quasi(&p.1, depth, cenv)?;
            Ok(qq_cons(a, d))
        }
        Sexpr::Vector(v) => {
            let as_list = Sexpr::list(&v.iter().cloned().collect::<Vec<_>>());
            let lf = quasi(&as_list, depth, cenv)?;
            match &*lf {
                IForm::Const(c) => Ok(P(IForm::Const(Sexpr::Vector(P(c.list_to_vec()))))),
                _ => Ok(P(IForm::List2Vec { arg: lf })),
            }
        }
        other => Ok(P(IForm::Const(strip_syntax(other)))),
    }
}

fn syn_quasiquote(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length() != Some(2) {
        return syntax_error("malformed quasiquote", form);
    }
    quasi(&form.cadr(), 0, cenv)
}

fn syn_unquote(form: &Sexpr, _cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    syntax_error("unquote appeared outside quasiquote", form)
}

fn syn_unquote_splicing(form: &Sexpr, _cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    syntax_error("unquote-splicing appeared outside quasiquote", form)
}

fn syn_and(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    fn rec(exprs: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
        if exprs.is_null() {
            return Ok(P(IForm::Const(Sexpr::Boolean(true))));
        }
        if exprs.cdr().is_null() {
            return pass1(&exprs.car(), cenv);
        }
        Ok(P(IForm::If(If {
            src: None,
            cond: pass1(&exprs.car(), &cenv.sans_name())?,
            consequent: rec(&exprs.cdr(), cenv)?,
            alternative: P(IForm::It),
        })))
    }
    rec(&form.cdr(), cenv)
}

fn syn_or(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    fn rec(exprs: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
        if exprs.is_null() {
            return Ok(P(IForm::Const(Sexpr::Boolean(false))));
        }
        if exprs.cdr().is_null() {
            return pass1(&exprs.car(), cenv);
        }
        Ok(P(IForm::If(If {
            src: None,
            cond: pass1(&exprs.car(), &cenv.sans_name())?,
            consequent: P(IForm::It),
            alternative: rec(&exprs.cdr(), cenv)?,
        })))
    }
    rec(&form.cdr(), cenv)
}

fn syn_when(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed when", form);
    }
    Ok(P(IForm::If(If {
        src: cenv.maybe_source(form),
        cond: pass1(&form.cadr(), &cenv.sans_name())?,
        consequent: pass1_body_rest(&form.cddr(), cenv)?,
        alternative: IForm::const_undef(),
    })))
}

fn syn_unless(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed unless", form);
    }
    Ok(P(IForm::If(If {
        src: cenv.maybe_source(form),
        cond: pass1(&form.cadr(), &cenv.sans_name())?,
        consequent: IForm::const_undef(),
        alternative: pass1_body_rest(&form.cddr(), cenv)?,
    })))
}

/// True for the auxiliary keywords `else` and `=>` when they are not
/// shadowed lexically.
fn aux_keyword(form: &Sexpr, name: &str, cenv: &Cenv) -> bool {
    form.is_identifier()
        && identifier_to_symbol(form).as_str() == name
        && !matches!(cenv.lookup(form, BindKind::Lexical), Sexpr::LVar(_))
}

fn syn_cond(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    fn rec(clauses: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
        if clauses.is_null() {
            return Ok(IForm::const_undef());
        }
        let clause = clauses.car();
        let rest = clauses.cdr();
        if !clause.is_pair() || !clause.is_list() {
            return syntax_error("invalid cond clause", &clause);
        }

        if aux_keyword(&clause.car(), "else", cenv) {
            if !rest.is_null() {
                return syntax_error("cond: else clause must be last", &clause);
            }
            return pass1_body_rest(&clause.cdr(), cenv);
        }

        // (test => receiver)
        if clause.list_length() == Some(3) && aux_keyword(&clause.cadr(), "=>", cenv) {
            let test = pass1(&clause.car(), &cenv.sans_name())?;
            let lvar = make_lvar(Sexpr::Symbol(gensym("tmp")));
            {
                let mut lvar = lvar.clone();
                lvar.initval = Some(test.clone());
            }
            let receiver = pass1(&clause.caddr(), &cenv.sans_name())?;
            return Ok(P(IForm::Let(Let {
                src: None,
                kind: LetKind::Let,
                lvars: vec![lvar.clone()],
                inits: vec![test],
                body: P(IForm::If(If {
                    src: None,
                    cond: P(IForm::LRef(LRef { lvar: lvar.clone() })),
                    consequent: P(IForm::Call(Call {
                        src: None,
                        proc: receiver,
                        args: vec![P(IForm::LRef(LRef { lvar }))],
                        flag: CallFlag::None,
                    })),
                    alternative: rec(&rest, cenv)?,
                })),
            })));
        }

        let test = pass1(&clause.car(), &cenv.sans_name())?;
        let consequent = if clause.cdr().is_null() {
            P(IForm::It)
        } else {
            pass1_body_rest(&clause.cdr(), cenv)?
        };
        Ok(P(IForm::If(If {
            src: None,
            cond: test,
            consequent,
            alternative: rec(&rest, cenv)?,
        })))
    }

    if form.cdr().is_null() {
        return syntax_error("cond requires at least one clause", form);
    }
    rec(&form.cdr(), cenv)
}

fn syn_case(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 3) {
        return syntax_error("malformed case", form);
    }
    let key = pass1(&form.cadr(), &cenv.sans_name())?;
    let lvar = make_lvar(Sexpr::Symbol(gensym("tmp")));
    {
        let mut lvar = lvar.clone();
        lvar.initval = Some(key.clone());
    }

    fn rec(
        clauses: &Sexpr,
        lvar: &P<crate::tree_il::LVar>,
        cenv: &Cenv,
    ) -> Result<P<IForm>, CompileError> {
        if clauses.is_null() {
            return Ok(IForm::const_undef());
        }
        let clause = clauses.car();
        let rest = clauses.cdr();
        if !clause.is_pair() || !clause.is_list() {
            return syntax_error("invalid case clause", &clause);
        }

        if aux_keyword(&clause.car(), "else", cenv) {
            if !rest.is_null() {
                return syntax_error("case: else clause must be last", &clause);
            }
            return pass1_body_rest(&clause.cdr(), cenv);
        }

        let data = clause.car();
        if !data.is_list() {
            return syntax_error("invalid case clause", &clause);
        }
        let data = strip_syntax(&data);
        let keyref = |lvar: &P<crate::tree_il::LVar>| {
            P(IForm::LRef(LRef { lvar: lvar.clone() }))
        };

        let test = match data.list_length() {
            Some(0) => P(IForm::Const(Sexpr::Boolean(false))),
            Some(1) => {
                let datum = data.car();
                if datum.is_symbol() {
                    P(IForm::Eq {
                        arg0: keyref(lvar),
                        arg1: P(IForm::Const(datum)),
                    })
                } else {
                    P(IForm::Eqv {
                        arg0: keyref(lvar),
                        arg1: P(IForm::Const(datum)),
                    })
                }
            }
            _ => P(IForm::Memv {
                arg0: keyref(lvar),
                arg1: P(IForm::Const(data)),
            }),
        };

        Ok(P(IForm::If(If {
            src: None,
            cond: test,
            consequent: pass1_body_rest(&clause.cdr(), cenv)?,
            alternative: rec(&rest, lvar, cenv)?,
        })))
    }

    let body = rec(&form.cddr(), &lvar, cenv)?;
    Ok(P(IForm::Let(Let {
        src: cenv.maybe_source(form),
        kind: LetKind::Let,
        lvars: vec![lvar],
        inits: vec![key],
        body,
    })))
}

fn syn_eval_when(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length().map_or(true, |n| n < 2) {
        return syntax_error("malformed eval-when", form);
    }
    let situations = form.cadr();
    if !situations.is_list() {
        return syntax_error("malformed eval-when", form);
    }

    let mut compile_toplevel = false;
    let mut load_toplevel = false;
    let mut execute = false;
    let mut err = None;
    situations.list_for_each(|s| {
        if err.is_some() || !s.is_identifier() {
            if err.is_none() {
                err = Some(CompileError::syntax("invalid eval-when situation", s));
            }
            return;
        }
        match identifier_to_symbol(s).as_str() {
            ":compile-toplevel" => compile_toplevel = true,
            ":load-toplevel" => load_toplevel = true,
            ":execute" => execute = true,
            _ => err = Some(CompileError::syntax("invalid eval-when situation", s)),
        }
    });
    if let Some(e) = err {
        return Err(e);
    }

    let body = form.cddr();

    // off toplevel, eval-when degrades to the body sequence
    if !cenv.is_toplevel() {
        return pass1_body_rest(&body, cenv);
    }

    let situation = cenv.vm.eval_situation;
    if situation == EvalSituation::Compiling && compile_toplevel {
        match cenv.vm.compile_time_eval {
            Some(hook) => {
                let mut result = Ok(());
                body.list_for_each(|e| {
                    if result.is_ok() {
                        result = hook(e, &cenv.module());
                    }
                });
                result?;
            }
            None => log::warn!("eval-when: no compile-time evaluator installed, skipping"),
        }
    }

    let emit = (situation == EvalSituation::Loading && load_toplevel)
        || (situation == EvalSituation::Executing && execute);
    if emit {
        pass1_body_rest(&body, cenv)
    } else {
        Ok(IForm::const_undef())
    }
}

fn syn_delay(form: &Sexpr, cenv: &Cenv) -> Result<P<IForm>, CompileError> {
    if form.list_length() != Some(2) {
        return syntax_error("malformed delay", form);
    }
    // wrap the expression in a thunk
    let thunk = P(Lambda {
        src: cenv.maybe_source(form),
        name: cenv.exp_name.clone(),
        reqargs: 0,
        optarg: false,
        lvars: vec![],
        body: pass1(&form.cadr(), &cenv.sans_name())?,
        flag: LambdaFlag::None,
        calls: vec![],
        free_lvars: vec![],
    });
    Ok(P(IForm::Promise {
        src: cenv.maybe_source(form),
        expr: P(IForm::Lambda(thunk)),
    }))
}

/// Registers the core special forms into a module.
pub fn define_core_syntax(module: &mut P<Module>) {
    macro_rules! syntax {
        ($name:literal => $handler:path) => {
            insert_syntax_binding(
                module,
                $name,
                Syntax {
                    name: $name,
                    handler: $handler,
                },
            )
        };
    }

    syntax!("define" => syn_define);
    syntax!("define-constant" => syn_define_constant);
    syntax!("define-inline" => syn_define_inline);
    syntax!("define-in-module" => syn_define_in_module);
    syntax!("define-syntax" => syn_define_syntax);
    syntax!("define-macro" => syn_define_macro);
    syntax!("define-module" => syn_define_module);
    syntax!("with-module" => syn_with_module);
    syntax!("select-module" => syn_select_module);
    syntax!("export" => syn_export);
    syntax!("import" => syn_import);
    syntax!("begin" => syn_begin);
    syntax!("if" => syn_if);
    syntax!("lambda" => syn_lambda);
    syntax!("let" => syn_let);
    syntax!("let*" => syn_let_star);
    syntax!("letrec" => syn_letrec);
    syntax!("letrec*" => syn_letrec);
    syntax!("do" => syn_do);
    syntax!("and-let*" => syn_and_let_star);
    syntax!("receive" => syn_receive);
    syntax!("set!" => syn_set);
    syntax!("quote" => syn_quote);
    syntax!("quasiquote" => syn_quasiquote);
    syntax!("unquote" => syn_unquote);
    syntax!("unquote-splicing" => syn_unquote_splicing);
    syntax!("and" => syn_and);
    syntax!("or" => syn_or);
    syntax!("when" => syn_when);
    syntax!("unless" => syn_unless);
    syntax!("cond" => syn_cond);
    syntax!("case" => syn_case);
    syntax!("eval-when" => syn_eval_when);
    syntax!("delay" => syn_delay);
}
