//! Compile-time view of the VM: current module, compile flags, eval
//! situation, and the host hooks the compiler calls out through.
//!
//! The compiler never executes code; when a form demands evaluation (a
//! macro transformer right-hand side, `eval-when` at compile time) it
//! goes through the optional hooks installed here by the host.

use std::collections::HashMap;

use crate::{
    cenv::Cenv,
    error::CompileError,
    module::{import_module, make_module, Module},
    ptr::P,
    sexpr::{intern, EqSexpr, Sexpr, SourceInfo, SourceLoc, Symbol},
};

/// Each flag disables the corresponding optimization.
#[derive(Clone, Copy, Default)]
pub struct CompileFlags {
    pub noinline_consts: bool,
    pub noinline_globals: bool,
    pub noinline_locals: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvalSituation {
    Compiling,
    Loading,
    Executing,
}

/// Evaluates a macro-transformer expression to a macro object.
pub type MacroEvalHook =
    fn(&Sexpr, &Cenv) -> Result<P<crate::module::Macro>, CompileError>;

/// Evaluates a form for effect in a module at compile time
/// (`eval-when` with `:compile-toplevel`).
pub type CompileTimeEvalHook = fn(&Sexpr, &P<Module>) -> Result<(), CompileError>;

pub struct Vm {
    pub modules: HashMap<Symbol, P<Module>>,
    pub current_module: P<Module>,
    pub flags: CompileFlags,
    pub eval_situation: EvalSituation,
    pub macro_eval: Option<MacroEvalHook>,
    pub compile_time_eval: Option<CompileTimeEvalHook>,
    pub sources: SourceInfo,
}

impl Vm {
    /// Builds a VM with the core module (`null`, holding the special
    /// forms and inlinable procedures) and a `user` module importing it.
    pub fn new() -> P<Vm> {
        let mut null = make_module(intern("null"));
        null.export_all = true;

        let mut user = make_module(intern("user"));
        import_module(&mut user, null.clone());

        let mut modules = HashMap::new();
        modules.insert(null.name.clone(), null.clone());
        modules.insert(user.name.clone(), user.clone());

        let vm = P(Vm {
            modules,
            current_module: user,
            flags: CompileFlags::default(),
            eval_situation: EvalSituation::Compiling,
            macro_eval: None,
            compile_time_eval: None,
            sources: SourceInfo::new(),
        });

        crate::pass1::define_core_syntax(&mut null.clone());
        crate::inliners::define_core_inliners(&mut null.clone());
        vm
    }

    pub fn find_module(&self, name: &Symbol) -> Option<P<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn register_module(&mut self, module: P<Module>) {
        self.modules.insert(module.name.clone(), module);
    }

    /// Records a source location for a form; the reader (external to the
    /// core) is expected to call this.
    pub fn register_source(&mut self, form: &Sexpr, loc: SourceLoc) {
        self.sources.insert(EqSexpr(form.clone()), loc);
    }

    pub fn maybe_source(&self, form: &Sexpr) -> Option<SourceLoc> {
        self.sources.get(&EqSexpr(form.clone())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_vm_has_core_and_user_modules() {
        let vm = Vm::new();
        assert!(vm.find_module(&intern("null")).is_some());
        assert!(vm.find_module(&intern("user")).is_some());
        assert_eq!(vm.current_module.name, intern("user"));
    }
}
