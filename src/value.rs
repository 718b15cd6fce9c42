//! Terms of the symbolic algebra.
//!
//! Values are immutable trees. Primitives and equations sit behind an [`Arc`],
//! so cloning a value or a whole principal state shares the subtrees.

use std::borrow::Cow;
use std::sync::Arc;

use itertools::Itertools;
use once_cell::sync::Lazy;
use smol_str::SmolStr;
use verisym_parse::ast::Qualifier;

use crate::primitive::PrimitiveName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Declaration {
    Knows,
    Generates,
    Assignment,
}

/// A named constant. Identity is the name alone; the remaining fields are
/// attributes set by the declaration that introduced it.
#[derive(Debug, Clone)]
pub struct Constant {
    pub name: SmolStr,
    pub guard: bool,
    pub fresh: bool,
    pub leaked: bool,
    pub declaration: Option<Declaration>,
    pub qualifier: Option<Qualifier>,
}

impl Constant {
    pub fn named(name: impl Into<SmolStr>) -> Self {
        Constant {
            name: name.into(),
            guard: false,
            fresh: false,
            leaked: false,
            declaration: None,
            qualifier: None,
        }
    }

    pub fn is_g(&self) -> bool {
        self.name == "g"
    }

    pub fn is_nil(&self) -> bool {
        self.name == "nil"
    }

    pub fn is_g_or_nil(&self) -> bool {
        self.is_g() || self.is_nil()
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Constant {}

impl std::hash::Hash for Constant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.guard {
            write!(f, "[{}]", self.name)
        } else if self.is_g() {
            write!(f, "G")
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Primitive {
    pub name: PrimitiveName,
    pub args: Vec<Value>,
    /// Which output of a multi-output primitive this application binds.
    pub output: usize,
    pub check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Equation {
    pub values: Vec<Value>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Constant(Constant),
    Primitive(Arc<Primitive>),
    Equation(Arc<Equation>),
}

fn public_constant(name: &str) -> Constant {
    Constant {
        declaration: Some(Declaration::Knows),
        qualifier: Some(Qualifier::Public),
        ..Constant::named(name)
    }
}

pub static G: Lazy<Value> = Lazy::new(|| Value::Constant(public_constant("g")));
pub static NIL: Lazy<Value> = Lazy::new(|| Value::Constant(public_constant("nil")));
pub static G_NIL: Lazy<Value> = Lazy::new(|| Value::equation(vec![G.clone(), NIL.clone()]));
pub static G_NIL_NIL: Lazy<Value> =
    Lazy::new(|| Value::equation(vec![G.clone(), NIL.clone(), NIL.clone()]));

impl From<Constant> for Value {
    fn from(c: Constant) -> Self {
        Value::Constant(c)
    }
}

impl From<Primitive> for Value {
    fn from(p: Primitive) -> Self {
        Value::Primitive(Arc::new(p))
    }
}

impl Value {
    pub fn equation(values: Vec<Value>) -> Self {
        Value::Equation(Arc::new(Equation { values }))
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Value::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&Arc<Primitive>> {
        match self {
            Value::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_equation(&self) -> Option<&Arc<Equation>> {
        match self {
            Value::Equation(e) => Some(e),
            _ => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Constant(_) => ValueKind::Constant,
            Value::Primitive(_) => ValueKind::Primitive,
            Value::Equation(_) => ValueKind::Equation,
        }
    }

    /// Structural equivalence. Outputs of the outermost primitives are only
    /// compared when `consider_output` is set; nested ones always are.
    pub fn equivalent(&self, other: &Value, consider_output: bool) -> bool {
        match (self, other) {
            (Value::Constant(a), Value::Constant(b)) => a == b,
            (Value::Primitive(a), Value::Primitive(b)) => {
                equivalent_primitives(a, b, consider_output).is_some()
            }
            (Value::Equation(a), Value::Equation(b)) => equivalent_equations(a, b),
            _ => false,
        }
    }

    /// Every constant in the tree, in order of appearance.
    pub fn constants(&self) -> Vec<&Constant> {
        let mut out = Vec::new();
        self.collect_constants(&mut out);
        out
    }

    fn collect_constants<'a>(&'a self, out: &mut Vec<&'a Constant>) {
        match self {
            Value::Constant(c) => out.push(c),
            Value::Primitive(p) => p.args.iter().for_each(|a| a.collect_constants(out)),
            Value::Equation(e) => e.values.iter().for_each(|a| a.collect_constants(out)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Constant,
    Primitive,
    Equation,
}

/// When equivalent, returns the outputs of both applications.
pub fn equivalent_primitives(
    p1: &Primitive,
    p2: &Primitive,
    consider_output: bool,
) -> Option<(usize, usize)> {
    if p1.name != p2.name
        || (consider_output && p1.output != p2.output)
        || p1.args.len() != p2.args.len()
    {
        return None;
    }
    p1.args
        .iter()
        .zip(&p2.args)
        .all(|(a, b)| a.equivalent(b, true))
        .then(|| (p1.output, p2.output))
}

/// `G^a^b` and `G^b^a` are the same key; the base is not compared at that depth.
/// `(G^a)^b` is compared as `G^a^b`.
fn equivalent_equations(e1: &Equation, e2: &Equation) -> bool {
    let (a, b) = (flatten(e1), flatten(e2));
    if a.is_empty() || a.len() != b.len() {
        return false;
    }
    match a.len() {
        1 | 2 => a.iter().zip(b.iter()).all(|(x, y)| x.equivalent(y, true)),
        3 => {
            (a[1].equivalent(&b[1], true) && a[2].equivalent(&b[2], true))
                || (a[1].equivalent(&b[2], true) && a[2].equivalent(&b[1], true))
        }
        _ => false,
    }
}

/// The members of `e` with every nested equation spliced in place.
fn flatten(e: &Equation) -> Cow<'_, [Value]> {
    if !e.values.iter().any(|v| matches!(v, Value::Equation(_))) {
        return Cow::Borrowed(&e.values);
    }
    let mut values = Vec::with_capacity(e.values.len() + 1);
    for v in &e.values {
        match v {
            Value::Equation(inner) => values.extend(flatten(inner).iter().cloned()),
            v => values.push(v.clone()),
        }
    }
    Cow::Owned(values)
}

pub fn find_equivalent(v: &Value, values: &[Value]) -> Option<usize> {
    values.iter().position(|x| v.equivalent(x, true))
}

/// Pushes `v` unless an equivalent value is already present.
pub fn push_unique(values: &mut Vec<Value>, v: Value) -> bool {
    if find_equivalent(&v, values).is_some() {
        return false;
    }
    values.push(v);
    true
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.args.iter().format(", "))?;
        if self.check {
            write!(f, "?")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Equation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.values.iter().format("^"))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Constant(c) => write!(f, "{c}"),
            Value::Primitive(p) => write!(f, "{p}"),
            Value::Equation(e) => write!(f, "{e}"),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Constant(c) => write!(f, "{}", yansi::Paint::blue(c)),
            Value::Primitive(p) => write!(
                f,
                "{}({:?}){}",
                yansi::Paint::magenta(p.name),
                p.args.iter().format(", "),
                if p.check { "?" } else { "" }
            ),
            Value::Equation(e) => write!(f, "{:?}", e.values.iter().format("^")),
        }
    }
}
