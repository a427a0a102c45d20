//! S-expression data the compiler ingests and carries in `Const` nodes.
//!
//! Heap values (pairs, strings, vectors, identifiers) live behind `P`
//! handles; `sexp_eq` compares those by pointer and everything else by
//! value, `sexp_equal` compares structurally.

use std::{
    cell::RefCell,
    collections::HashMap,
    hash::Hash,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    cenv::Cenv,
    error::CompileError,
    module::{Macro, Module},
    ptr::P,
    tree_il::{IForm, LVar},
};

/// Interned symbol. Equality and hashing are by name, so symbols work as
/// table keys regardless of which interner instance produced them.
#[derive(Clone)]
pub struct Symbol(Rc<str>);

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn intern(name: &str) -> Symbol {
    thread_local! {
        static TABLE: RefCell<HashMap<Box<str>, Rc<str>>> = RefCell::new(HashMap::new());
    }

    TABLE.with(|table| {
        let mut table = table.borrow_mut();
        if let Some(rc) = table.get(name) {
            Symbol(rc.clone())
        } else {
            let rc: Rc<str> = Rc::from(name);
            table.insert(Box::from(name), rc.clone());
            Symbol(rc)
        }
    })
}

/// Process-wide monotonic counter shared with the parameter subsystem;
/// never reset.
static UID: AtomicU64 = AtomicU64::new(1);

pub fn next_uid() -> u64 {
    UID.fetch_add(1, Ordering::Relaxed)
}

pub fn gensym(prefix: &str) -> Symbol {
    Symbol(Rc::from(format!("{}.{}", prefix, next_uid()).as_str()))
}

/// A symbol wrapped with the module and syntactic frames it was seen in.
/// Global references resolve through the identifier's module.
pub struct Identifier {
    pub name: Sexpr,
    pub module: P<Module>,
    pub frames: Sexpr,
}

pub fn make_identifier(name: Sexpr, module: P<Module>, frames: Sexpr) -> P<Identifier> {
    P(Identifier {
        name,
        module,
        frames,
    })
}

pub fn outermost_identifier(id: &P<Identifier>) -> P<Identifier> {
    let mut id = id.clone();
    while let Sexpr::Identifier(inner) = id.name.clone() {
        id = inner;
    }
    id
}

pub fn unwrap_identifier(id: &P<Identifier>) -> Symbol {
    match &outermost_identifier(id).name {
        Sexpr::Symbol(sym) => sym.clone(),
        _ => unreachable!("identifier name must bottom out at a symbol"),
    }
}

pub fn identifier_to_symbol(name: &Sexpr) -> Symbol {
    match name {
        Sexpr::Identifier(id) => unwrap_identifier(id),
        Sexpr::Symbol(sym) => sym.clone(),
        _ => unreachable!("identifier_to_symbol: not an identifier"),
    }
}

pub type SyntaxHandler = fn(&Sexpr, &Cenv) -> Result<P<IForm>, CompileError>;

#[derive(Clone)]
pub enum Sexpr {
    Null,
    Undefined,
    Boolean(bool),
    Fixnum(i64),
    Flonum(f64),
    Char(char),
    Symbol(Symbol),
    String(P<String>),
    Pair(P<(Sexpr, Sexpr)>),
    Vector(P<Vec<Sexpr>>),
    Identifier(P<Identifier>),

    // Compile-time objects that appear in cenv frames.
    LVar(P<LVar>),
    Macro(P<Macro>),
}

/// Pointer equality on heap values, value equality on immediates.
pub fn sexp_eq(x: &Sexpr, y: &Sexpr) -> bool {
    match (x, y) {
        (Sexpr::Null, Sexpr::Null) => true,
        (Sexpr::Undefined, Sexpr::Undefined) => true,
        (Sexpr::Boolean(x), Sexpr::Boolean(y)) => x == y,
        (Sexpr::Fixnum(x), Sexpr::Fixnum(y)) => x == y,
        (Sexpr::Flonum(x), Sexpr::Flonum(y)) => x == y,
        (Sexpr::Char(x), Sexpr::Char(y)) => x == y,
        (Sexpr::Symbol(x), Sexpr::Symbol(y)) => x == y,
        (Sexpr::String(x), Sexpr::String(y)) => P::ptr_eq(x, y),
        (Sexpr::Pair(x), Sexpr::Pair(y)) => P::ptr_eq(x, y),
        (Sexpr::Vector(x), Sexpr::Vector(y)) => P::ptr_eq(x, y),
        (Sexpr::Identifier(x), Sexpr::Identifier(y)) => P::ptr_eq(x, y),
        (Sexpr::LVar(x), Sexpr::LVar(y)) => P::ptr_eq(x, y),
        (Sexpr::Macro(x), Sexpr::Macro(y)) => P::ptr_eq(x, y),
        _ => false,
    }
}

/// Structural equality, the compiler's notion of `equal?`.
pub fn sexp_equal(x: &Sexpr, y: &Sexpr) -> bool {
    match (x, y) {
        (Sexpr::String(x), Sexpr::String(y)) => **x == **y,
        (Sexpr::Pair(x), Sexpr::Pair(y)) => sexp_equal(&x.0, &y.0) && sexp_equal(&x.1, &y.1),
        (Sexpr::Vector(x), Sexpr::Vector(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| sexp_equal(a, b))
        }
        _ => sexp_eq(x, y),
    }
}

impl PartialEq for Sexpr {
    fn eq(&self, other: &Self) -> bool {
        sexp_eq(self, other)
    }
}

impl Eq for Sexpr {}

/// Wrapper keying hash tables by `sexp_eq` identity; used by the
/// source-location side table.
pub struct EqSexpr(pub Sexpr);

impl PartialEq for EqSexpr {
    fn eq(&self, other: &Self) -> bool {
        sexp_eq(&self.0, &other.0)
    }
}

impl Eq for EqSexpr {}

impl Hash for EqSexpr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.0 {
            Sexpr::Pair(p) => p.as_ptr().hash(state),
            Sexpr::Vector(v) => v.as_ptr().hash(state),
            Sexpr::String(s) => s.as_ptr().hash(state),
            Sexpr::Identifier(i) => i.as_ptr().hash(state),
            Sexpr::Symbol(s) => s.hash(state),
            Sexpr::Fixnum(n) => n.hash(state),
            Sexpr::Flonum(n) => n.to_bits().hash(state),
            Sexpr::Char(c) => c.hash(state),
            Sexpr::Boolean(b) => b.hash(state),
            _ => 255u8.hash(state),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: Symbol,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Side table attaching source locations to forms. Populated by whoever
/// read the source; consulted only for diagnostics.
pub type SourceInfo = HashMap<EqSexpr, SourceLoc>;

pub fn sexp_cons(car: Sexpr, cdr: Sexpr) -> Sexpr {
    Sexpr::Pair(P((car, cdr)))
}

pub fn sexp_acons(caar: Sexpr, cdar: Sexpr, cdr: Sexpr) -> Sexpr {
    sexp_cons(sexp_cons(caar, cdar), cdr)
}

impl Sexpr {
    pub fn symbol(name: &str) -> Sexpr {
        Sexpr::Symbol(intern(name))
    }

    pub fn string(s: &str) -> Sexpr {
        Sexpr::String(P(s.to_string()))
    }

    pub fn to_boolean(&self) -> bool {
        !matches!(self, Sexpr::Boolean(false))
    }

    pub fn cons(car: Sexpr, cdr: Sexpr) -> Sexpr {
        sexp_cons(car, cdr)
    }

    pub fn car(&self) -> Sexpr {
        match self {
            Sexpr::Pair(p) => p.0.clone(),
            _ => panic!("car: not a pair"),
        }
    }

    pub fn cdr(&self) -> Sexpr {
        match self {
            Sexpr::Pair(p) => p.1.clone(),
            _ => panic!("cdr: not a pair"),
        }
    }

    pub fn set_car(&mut self, car: Sexpr) {
        match self {
            Sexpr::Pair(p) => p.0 = car,
            _ => panic!("set-car!: not a pair"),
        }
    }

    pub fn set_cdr(&mut self, cdr: Sexpr) {
        match self {
            Sexpr::Pair(p) => p.1 = cdr,
            _ => panic!("set-cdr!: not a pair"),
        }
    }

    pub fn caar(&self) -> Sexpr {
        self.car().car()
    }

    pub fn cadr(&self) -> Sexpr {
        self.cdr().car()
    }

    pub fn cdar(&self) -> Sexpr {
        self.car().cdr()
    }

    pub fn cddr(&self) -> Sexpr {
        self.cdr().cdr()
    }

    pub fn caddr(&self) -> Sexpr {
        self.cddr().car()
    }

    pub fn cdddr(&self) -> Sexpr {
        self.cddr().cdr()
    }

    pub fn cadddr(&self) -> Sexpr {
        self.cdddr().car()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Sexpr::Null)
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Sexpr::Pair(_))
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Sexpr::Symbol(_))
    }

    /// Symbols and wrapped identifiers both name variables.
    pub fn is_identifier(&self) -> bool {
        matches!(self, Sexpr::Symbol(_) | Sexpr::Identifier(_))
    }

    pub fn is_wrapped_identifier(&self) -> bool {
        matches!(self, Sexpr::Identifier(_))
    }

    pub fn is_list(&self) -> bool {
        let mut ls = self.clone();
        while let Sexpr::Pair(p) = ls {
            ls = p.1.clone();
        }
        ls.is_null()
    }

    pub fn list_length(&self) -> Option<usize> {
        let mut ls = self.clone();
        let mut n = 0;
        while let Sexpr::Pair(p) = ls {
            n += 1;
            ls = p.1.clone();
        }
        if ls.is_null() {
            Some(n)
        } else {
            None
        }
    }

    pub fn list(exprs: &[Sexpr]) -> Sexpr {
        let mut res = Sexpr::Null;
        for e in exprs.iter().rev() {
            res = Sexpr::cons(e.clone(), res);
        }
        res
    }

    pub fn list_star(exprs: &[Sexpr]) -> Sexpr {
        let mut res = exprs.last().cloned().unwrap_or(Sexpr::Null);
        for e in exprs.iter().rev().skip(1) {
            res = Sexpr::cons(e.clone(), res);
        }
        res
    }

    pub fn list_from_iter<I>(iter: I) -> Sexpr
    where
        I: IntoIterator<Item = Sexpr>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut res = Sexpr::Null;
        for e in iter.into_iter().rev() {
            res = Sexpr::cons(e, res);
        }
        res
    }

    pub fn list_to_vec(&self) -> Vec<Sexpr> {
        let mut res = vec![];
        let mut ls = self.clone();
        while let Sexpr::Pair(p) = ls {
            res.push(p.0.clone());
            ls = p.1.clone();
        }
        res
    }

    pub fn list_for_each(&self, mut f: impl FnMut(&Sexpr)) {
        let mut ls = self.clone();
        while let Sexpr::Pair(p) = ls {
            f(&p.0);
            ls = p.1.clone();
        }
    }

    pub fn list_reverse(&self) -> Sexpr {
        let mut res = Sexpr::Null;
        let mut ls = self.clone();
        while let Sexpr::Pair(p) = ls {
            res = Sexpr::cons(p.0.clone(), res);
            ls = p.1.clone();
        }
        res
    }

    pub fn append(tail: Sexpr, list: Sexpr) -> Sexpr {
        let items = list.list_to_vec();
        let mut res = tail;
        for e in items.into_iter().rev() {
            res = Sexpr::cons(e, res);
        }
        res
    }

    pub fn assq(&self, key: &Sexpr) -> Sexpr {
        let mut ls = self.clone();
        while let Sexpr::Pair(p) = ls {
            if let Sexpr::Pair(kv) = &p.0 {
                if sexp_eq(&kv.0, key) {
                    return p.0.clone();
                }
            }
            ls = p.1.clone();
        }
        Sexpr::Boolean(false)
    }

    pub fn memq(&self, obj: &Sexpr) -> bool {
        let mut ls = self.clone();
        while let Sexpr::Pair(p) = ls {
            if sexp_eq(&p.0, obj) {
                return true;
            }
            ls = p.1.clone();
        }
        false
    }
}

/// Strips identifier wrappers from a quoted datum, recursively, so
/// macro-introduced identifiers quote as plain symbols.
pub fn strip_syntax(form: &Sexpr) -> Sexpr {
    match form {
        Sexpr::Identifier(id) => Sexpr::Symbol(unwrap_identifier(id)),
        Sexpr::Pair(p) => sexp_cons(strip_syntax(&p.0), strip_syntax(&p.1)),
        Sexpr::Vector(v) => Sexpr::Vector(P(v.iter().map(strip_syntax).collect())),
        other => other.clone(),
    }
}

use pretty::{BoxAllocator, DocAllocator, DocBuilder};
use termcolor::{ColorSpec, WriteColor};

impl Sexpr {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Self::Null => allocator.text("()"),
            Self::Undefined => allocator.text("#<undef>"),
            Self::Boolean(true) => allocator.text("#t"),
            Self::Boolean(false) => allocator.text("#f"),
            Self::Fixnum(n) => allocator.text(format!("{}", n)),
            Self::Flonum(n) => allocator.text(format!("{}", n)),
            Self::Char(c) => allocator.text(format!("#\\{}", c)),
            Self::Symbol(s) => allocator.text(s.to_string()),
            Self::String(s) => allocator.text(format!("{:?}", &**s)),
            Self::Identifier(id) => allocator
                .text("#<id ")
                .append(id.name.pretty(allocator))
                .append(allocator.text(format!("@{}>", id.module.name))),
            Self::LVar(lvar) => allocator
                .text("#<lvar ")
                .append(lvar.name.pretty(allocator))
                .append(allocator.text(format!(".{:p}>", lvar.as_ptr()))),
            Self::Macro(mac) => allocator
                .text("#<macro ")
                .append(mac.name.pretty(allocator))
                .append(allocator.text(">")),

            Self::Pair(pair) => {
                let mut docs = vec![];
                let mut pair = pair.clone();
                loop {
                    docs.push(pair.0.pretty(allocator));
                    match &pair.1 {
                        Self::Pair(next) => pair = next.clone(),
                        Self::Null => break,
                        rest => {
                            docs.push(allocator.text("."));
                            docs.push(rest.pretty(allocator));
                            break;
                        }
                    }
                }

                allocator
                    .intersperse(docs, allocator.softline())
                    .group()
                    .parens()
            }

            Self::Vector(vec) => allocator.text("#").append(
                allocator
                    .intersperse(
                        vec.iter().map(|x| x.pretty(allocator)),
                        allocator.softline(),
                    )
                    .group()
                    .parens(),
            ),
        }
    }

    pub fn pretty_print(&self, w: &mut dyn WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.render(80, w)
    }
}

impl std::fmt::Display for Sexpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = termcolor::Buffer::no_color();
        self.pretty_print(&mut buf).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(buf.as_slice()))
    }
}

impl std::fmt::Debug for Sexpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_shares_storage() {
        let a = intern("foo");
        let b = intern("foo");
        assert_eq!(a, b);
        assert_ne!(intern("foo"), intern("bar"));
    }

    #[test]
    fn list_helpers_round_trip() {
        let ls = Sexpr::list(&[Sexpr::Fixnum(1), Sexpr::Fixnum(2), Sexpr::Fixnum(3)]);
        assert_eq!(ls.list_length(), Some(3));
        assert!(ls.is_list());
        assert_eq!(ls.list_to_vec().len(), 3);
        assert_eq!(format!("{}", ls), "(1 2 3)");
    }

    #[test]
    fn eq_is_identity_on_pairs_equal_is_structural() {
        let a = Sexpr::list(&[Sexpr::Fixnum(1)]);
        let b = Sexpr::list(&[Sexpr::Fixnum(1)]);
        assert!(!sexp_eq(&a, &b));
        assert!(sexp_equal(&a, &b));
        assert!(sexp_eq(&a, &a.clone()));
    }

    #[test]
    fn strip_syntax_leaves_plain_data_alone() {
        let ls = Sexpr::list(&[Sexpr::symbol("a"), Sexpr::Fixnum(2)]);
        assert!(sexp_equal(&strip_syntax(&ls), &ls));
    }

    #[test]
    fn gensyms_are_distinct() {
        assert_ne!(gensym("tmp"), gensym("tmp"));
    }
}
