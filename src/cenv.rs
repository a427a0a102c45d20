//! Compile-time environment threaded through pass 1.
//!
//! A `Cenv` is a snapshot: every binding-introducing form produces a new
//! one by `extend`, so sibling expressions never see each other's
//! bindings. Frames are an alist stack `((kind . ((name . obj) ...)) ...)`
//! with the innermost frame first; `obj` is an `LVar` for lexical
//! bindings and a macro for syntactic ones.

use crate::{
    module::Module,
    ptr::P,
    sexpr::{make_identifier, sexp_acons, sexp_eq, Sexpr, SourceLoc},
    tree_il::Lambda,
    vm::Vm,
};

/// Frame kinds. When looking a name up "as" some kind, frames of a kind
/// above it are invisible: a plain variable lookup (Lexical) skips
/// syntactic and pattern frames, a head-position lookup (Syntax) sees
/// lexical and syntactic frames.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum BindKind {
    Lexical = 0,
    Syntax = 1,
    Pattern = 2,
}

impl BindKind {
    pub fn to_fixnum(self) -> i64 {
        self as i64
    }

    pub fn from_fixnum(n: i64) -> BindKind {
        match n {
            0 => BindKind::Lexical,
            1 => BindKind::Syntax,
            _ => BindKind::Pattern,
        }
    }
}

/// Shared current-module slot. Cenvs derived by `extend`/`sans_name`
/// share the holder, so `select-module` is visible to the rest of the
/// enclosing toplevel form; `with_module` makes a fresh holder for a
/// scoped override.
pub struct ModuleHolder(pub P<Module>);

#[derive(Clone)]
pub struct Cenv {
    pub vm: P<Vm>,
    module: P<ModuleHolder>,
    pub frames: Sexpr,
    /// Name the current expression's value is about to be bound to, used
    /// to name anonymous closures. `#f` when there is none.
    pub exp_name: Sexpr,
    /// The lambda whose body is being compiled, when any.
    pub current_proc: Option<P<Lambda>>,
}

impl Cenv {
    pub fn bottom(vm: P<Vm>, module: P<Module>) -> Cenv {
        Cenv {
            vm,
            module: P(ModuleHolder(module)),
            frames: Sexpr::Null,
            exp_name: Sexpr::Boolean(false),
            current_proc: None,
        }
    }

    pub fn module(&self) -> P<Module> {
        self.module.0.clone()
    }

    pub fn set_module(&self, module: P<Module>) {
        let mut holder = self.module.clone();
        holder.0 = module;
    }

    /// Resolves `name` against the frame stack, innermost first. Returns
    /// the bound object (`Sexpr::LVar`, `Sexpr::Macro`), or a global
    /// identifier when no frame binds the name.
    pub fn lookup(&self, name: &Sexpr, kind: BindKind) -> Sexpr {
        let mut y = name.clone();
        let mut frames = self.frames.clone();

        loop {
            while let Sexpr::Pair(fp) = frames.clone() {
                let frame = fp.0.clone();
                frames = fp.1.clone();

                let Sexpr::Fixnum(fkind) = frame.car() else {
                    continue;
                };
                if fkind > kind.to_fixnum() {
                    continue;
                }

                let mut vls = frame.cdr();
                while let Sexpr::Pair(vp) = vls.clone() {
                    if let Sexpr::Pair(binding) = &vp.0 {
                        if sexp_eq(&binding.0, &y) {
                            return binding.1.clone();
                        }
                    }
                    vls = vp.1.clone();
                }
            }

            // strip one identifier wrapping and retry in its captured frames
            if let Sexpr::Identifier(id) = y.clone() {
                frames = id.frames.clone();
                y = id.name.clone();
            } else {
                break;
            }
        }

        match name {
            Sexpr::Symbol(_) => Sexpr::Identifier(make_identifier(
                name.clone(),
                self.module(),
                self.frames.clone(),
            )),
            other => other.clone(),
        }
    }

    pub fn extend(&self, frame: Sexpr, kind: BindKind) -> Cenv {
        Cenv {
            frames: sexp_acons(Sexpr::Fixnum(kind.to_fixnum()), frame, self.frames.clone()),
            ..self.clone()
        }
    }

    pub fn add_name(&self, name: &Sexpr) -> Cenv {
        Cenv {
            exp_name: name.clone(),
            ..self.clone()
        }
    }

    pub fn sans_name(&self) -> Cenv {
        if matches!(self.exp_name, Sexpr::Boolean(false)) {
            self.clone()
        } else {
            Cenv {
                exp_name: Sexpr::Boolean(false),
                ..self.clone()
            }
        }
    }

    pub fn with_module(&self, module: P<Module>) -> Cenv {
        Cenv {
            module: P(ModuleHolder(module)),
            ..self.clone()
        }
    }

    pub fn with_proc(&self, proc: P<Lambda>) -> Cenv {
        Cenv {
            current_proc: Some(proc),
            ..self.clone()
        }
    }

    /// True iff no lexical frame is present.
    pub fn is_toplevel(&self) -> bool {
        let mut frames = self.frames.clone();
        while let Sexpr::Pair(fp) = frames {
            if let Sexpr::Fixnum(k) = fp.0.car() {
                if BindKind::from_fixnum(k) == BindKind::Lexical {
                    return false;
                }
            }
            frames = fp.1.clone();
        }
        true
    }

    pub fn maybe_source(&self, form: &Sexpr) -> Option<SourceLoc> {
        self.vm.maybe_source(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexpr::sexp_cons;
    use crate::tree_il::make_lvar;
    use crate::vm::Vm;

    fn test_cenv() -> Cenv {
        let vm = Vm::new();
        let module = vm.current_module.clone();
        Cenv::bottom(vm, module)
    }

    #[test]
    fn lexical_binding_shadows_and_resolves() {
        let cenv = test_cenv();
        let x = Sexpr::symbol("x");
        let lvar = make_lvar(x.clone());
        let frame = Sexpr::list(&[sexp_cons(x.clone(), Sexpr::LVar(lvar.clone()))]);
        let inner = cenv.extend(frame, BindKind::Lexical);

        assert!(matches!(inner.lookup(&x, BindKind::Lexical), Sexpr::LVar(_)));
        assert!(matches!(cenv.lookup(&x, BindKind::Lexical), Sexpr::Identifier(_)));
        assert!(!inner.is_toplevel());
        assert!(cenv.is_toplevel());
    }

    #[test]
    fn lexical_lookup_skips_syntactic_frames() {
        let cenv = test_cenv();
        let m = Sexpr::symbol("m");
        let frame = Sexpr::list(&[sexp_cons(m.clone(), Sexpr::Fixnum(99))]);
        let inner = cenv.extend(frame, BindKind::Syntax);

        // visible when looked up as syntax, invisible as a variable
        assert!(matches!(inner.lookup(&m, BindKind::Syntax), Sexpr::Fixnum(99)));
        assert!(matches!(
            inner.lookup(&m, BindKind::Lexical),
            Sexpr::Identifier(_)
        ));
        // a syntactic frame alone keeps the cenv at toplevel
        assert!(inner.is_toplevel());
    }

    #[test]
    fn sans_name_drops_the_hint() {
        let cenv = test_cenv().add_name(&Sexpr::symbol("f"));
        assert!(matches!(cenv.exp_name, Sexpr::Symbol(_)));
        assert!(matches!(cenv.sans_name().exp_name, Sexpr::Boolean(false)));
    }
}
