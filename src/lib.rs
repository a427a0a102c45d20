//! bask — a three-pass compiler that turns Scheme source (s-expressions)
//! into bytecode for a register-plus-stack virtual machine.
//!
//! The pipeline: pass 1 parses one toplevel form, resolves bindings
//! against the compile-time environment, and expands macros and
//! inlinable procedures into IR; pass 2 rewrites the IR destructively
//! (constant propagation, branch restructuring, dead bindings, closure
//! embedding); pass 3 emits instructions with peephole combination and
//! resolves jump labels into a finished code object.
//!
//! The VM itself, the reader, and the macro-expander engine live
//! outside this crate; the compiler talks to them through the module
//! table, the `Vm` handle, and host hooks.

pub mod cenv;
pub mod code;
pub mod error;
pub mod inliners;
pub mod insn;
pub mod module;
pub mod pack;
pub mod pass1;
pub mod pass2;
pub mod pass3;
pub mod ptr;
pub mod sexpr;
pub mod tree_il;
pub mod vm;

use log::debug;

pub use crate::{
    cenv::Cenv,
    code::{CodeBuilder, CompiledCode},
    error::CompileError,
    module::Module,
    ptr::P,
    sexpr::Sexpr,
    tree_il::IForm,
    vm::Vm,
};

fn bottom_cenv(vm: &P<Vm>, module: Option<P<Module>>) -> Cenv {
    let module = module.unwrap_or_else(|| vm.current_module.clone());
    Cenv::bottom(vm.clone(), module)
}

/// Full pipeline: one toplevel form to a compiled-code object. The
/// optional module overrides the current module for the duration.
pub fn compile(
    vm: &P<Vm>,
    program: &Sexpr,
    module: Option<P<Module>>,
) -> Result<P<CompiledCode>, CompileError> {
    let cenv = bottom_cenv(vm, module);
    let iform = pass1::pass1(program, &cenv)
        .map_err(|e| e.with_location(cenv.maybe_source(program)))?;
    let iform = pass2::pass2(iform, &vm.flags)?;
    debug!("compiling toplevel form:\n{}", iform);
    let ccb = CodeBuilder::new(0, false, Sexpr::symbol("%toplevel"), None, None);
    pass3::pass3(&iform, ccb)
}

/// Compiles a named toplevel procedure directly into its code object,
/// without the closure-allocation instruction a `(define name (lambda
/// ...))` form would go through.
pub fn compile_toplevel_lambda(
    vm: &P<Vm>,
    src: &Sexpr,
    name: &Sexpr,
    formals: &Sexpr,
    body: &Sexpr,
    module: Option<P<Module>>,
) -> Result<P<CompiledCode>, CompileError> {
    let cenv = bottom_cenv(vm, module).add_name(name);
    let lambda_form = sexpr::sexp_cons(
        Sexpr::symbol("lambda"),
        sexpr::sexp_cons(formals.clone(), body.clone()),
    );

    let iform = pass1::pass1(&lambda_form, &cenv)
        .map_err(|e| e.with_location(cenv.maybe_source(src)))?;
    let intform = P(pack::pack_iform(&iform));
    let iform = pass2::pass2(iform, &vm.flags)?;

    let IForm::Lambda(lam) = &*iform else {
        return Err(CompileError::internal(
            "toplevel lambda did not compile to a lambda node",
        ));
    };
    {
        let mut lam = lam.clone();
        lam.name = name.clone();
    }
    pass3::compile_lambda(lam, None, &pass3::Renv::new(), Some(intform))
}

/// Diagnostic entry: pass 1 only.
pub fn compile_p1(
    vm: &P<Vm>,
    program: &Sexpr,
    module: Option<P<Module>>,
) -> Result<P<IForm>, CompileError> {
    let cenv = bottom_cenv(vm, module);
    pass1::pass1(program, &cenv)
}

/// Diagnostic entry: passes 1 and 2.
pub fn compile_p2(
    vm: &P<Vm>,
    program: &Sexpr,
    module: Option<P<Module>>,
) -> Result<P<IForm>, CompileError> {
    let iform = compile_p1(vm, program, module)?;
    pass2::pass2(iform, &vm.flags)
}

/// Diagnostic entry: the full pipeline, like `compile`.
pub fn compile_p3(
    vm: &P<Vm>,
    program: &Sexpr,
    module: Option<P<Module>>,
) -> Result<P<CompiledCode>, CompileError> {
    compile(vm, program, module)
}
