//! Modules and global binding cells.
//!
//! The compiler reads and writes the global binding table through this
//! small surface: `find_module` / `make_module` on the `Vm`, and
//! `insert_binding` / `find_binding` here. A binding cell (`Gloc`) tells
//! the compiler what it may assume about a global: a constant value, a
//! syntax compiler, a macro, or an inlinable procedure.

use std::collections::{HashMap, HashSet};

use crate::{
    cenv::Cenv,
    error::CompileError,
    inliners::Inliner,
    ptr::P,
    sexpr::{unwrap_identifier, Identifier, Sexpr, Symbol, SyntaxHandler},
};

/// A macro binding. The transformer is the host-supplied expansion entry
/// point; the compiler calls it with the whole form and the current
/// compile-time environment and recursively compiles the result.
pub struct Macro {
    pub name: Sexpr,
    pub transformer: Box<dyn Fn(&Sexpr, &Cenv) -> Result<Sexpr, CompileError>>,
}

pub fn call_macro_expander(
    mac: &P<Macro>,
    form: &Sexpr,
    cenv: &Cenv,
) -> Result<Sexpr, CompileError> {
    (mac.transformer)(form, cenv)
}

/// A special-form compiler. `name` identifies the form so body scanning
/// can recognize `define` and `begin` bindings wherever they are renamed.
#[derive(Clone, Copy)]
pub struct Syntax {
    pub name: &'static str,
    pub handler: SyntaxHandler,
}

pub enum Binding {
    /// Defined, but the value is unknown to the compiler.
    Forward,
    /// Value known at compile time; foldable when the cell is constant.
    Value(Sexpr),
    Syntax(Syntax),
    Macro(P<Macro>),
    /// A procedure carrying an inliner descriptor.
    Inlinable(Inliner),
}

pub struct Gloc {
    pub name: Symbol,
    pub binding: Binding,
    pub constant: bool,
}

impl Gloc {
    pub fn const_value(&self) -> Option<&Sexpr> {
        match &self.binding {
            Binding::Value(v) if self.constant => Some(v),
            _ => None,
        }
    }
}

pub struct Module {
    pub name: Symbol,
    pub table: HashMap<Symbol, P<Gloc>>,
    pub imports: Vec<P<Module>>,
    pub exports: HashSet<Symbol>,
    pub export_all: bool,
}

pub fn make_module(name: Symbol) -> P<Module> {
    P(Module {
        name,
        table: HashMap::new(),
        imports: Vec::new(),
        exports: HashSet::new(),
        export_all: false,
    })
}

pub fn insert_binding(
    module: &mut P<Module>,
    name: Symbol,
    binding: Binding,
    constant: bool,
) -> P<Gloc> {
    let gloc = P(Gloc {
        name: name.clone(),
        binding,
        constant,
    });
    module.table.insert(name, gloc.clone());
    gloc
}

pub fn insert_syntax_binding(module: &mut P<Module>, name: &str, syntax: Syntax) {
    insert_binding(
        module,
        crate::sexpr::intern(name),
        Binding::Syntax(syntax),
        false,
    );
}

pub fn insert_macro_binding(module: &mut P<Module>, name: &str, mac: P<Macro>) {
    insert_binding(
        module,
        crate::sexpr::intern(name),
        Binding::Macro(mac),
        false,
    );
}

/// Looks a name up in `module`, then through its import chain. A name is
/// visible through an import when the exporter lists it or exports
/// everything.
pub fn find_binding(module: &P<Module>, name: &Symbol) -> Option<P<Gloc>> {
    fn walk(module: &P<Module>, name: &Symbol, seen: &mut Vec<*const Module>, root: bool) -> Option<P<Gloc>> {
        if seen.contains(&module.as_ptr()) {
            return None;
        }
        seen.push(module.as_ptr());

        if let Some(gloc) = module.table.get(name) {
            if root || module.export_all || module.exports.contains(name) {
                return Some(gloc.clone());
            }
        }

        for import in module.imports.iter() {
            if let Some(gloc) = walk(import, name, seen, false) {
                return Some(gloc);
            }
        }

        None
    }

    walk(module, name, &mut Vec::new(), true)
}

pub fn identifier_global_binding(id: &P<Identifier>) -> Option<P<Gloc>> {
    find_binding(&id.module, &unwrap_identifier(id))
}

pub fn export_symbols(module: &mut P<Module>, names: &Sexpr) -> Result<(), CompileError> {
    let mut result = Ok(());
    names.list_for_each(|name| {
        if result.is_err() {
            return;
        }
        match name {
            Sexpr::Symbol(sym) => {
                module.exports.insert(sym.clone());
            }
            Sexpr::Identifier(id) => {
                module.exports.insert(unwrap_identifier(id));
            }
            other => {
                result = Err(CompileError::syntax("export: not a symbol", other));
            }
        }
    });
    result
}

pub fn import_module(module: &mut P<Module>, imported: P<Module>) {
    if !module
        .imports
        .iter()
        .any(|m| P::ptr_eq(m, &imported))
    {
        module.imports.push(imported);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexpr::intern;

    #[test]
    fn bindings_resolve_through_imports() {
        let mut base = make_module(intern("base"));
        base.export_all = true;
        insert_binding(&mut base, intern("x"), Binding::Value(Sexpr::Fixnum(1)), true);

        let mut user = make_module(intern("user"));
        import_module(&mut user, base.clone());

        let gloc = find_binding(&user, &intern("x")).expect("visible through import");
        assert_eq!(gloc.const_value(), Some(&Sexpr::Fixnum(1)));
        assert!(find_binding(&user, &intern("y")).is_none());
    }

    #[test]
    fn unexported_names_stay_private() {
        let mut base = make_module(intern("base"));
        insert_binding(&mut base, intern("hidden"), Binding::Forward, false);

        let mut user = make_module(intern("user"));
        import_module(&mut user, base.clone());
        assert!(find_binding(&user, &intern("hidden")).is_none());

        export_symbols(&mut base, &Sexpr::list(&[Sexpr::symbol("hidden")])).unwrap();
        assert!(find_binding(&user, &intern("hidden")).is_some());
    }
}
