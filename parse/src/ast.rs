use std::ops::Deref;

use itertools::Itertools;
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq)]
pub struct Model<S: Deref<Target = str>> {
    pub attacker: AttackerKind,
    pub blocks: Vec<Block<S>>,
    pub queries: Vec<Query<S>>,
}

impl<S: Deref<Target = str>> Model<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Model<T> {
        Model {
            attacker: self.attacker,
            blocks: self.blocks.into_iter().map(|b| b.map(f)).collect(),
            queries: self.queries.into_iter().map(|q| q.map(f)).collect(),
        }
    }

    pub fn principals(&self) -> impl Iterator<Item = &Principal<S>> {
        self.blocks.iter().filter_map(|b| match b {
            Block::Principal(p) => Some(p),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackerKind {
    Active,
    Passive,
}

impl std::fmt::Display for AttackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackerKind::Active => write!(f, "active"),
            AttackerKind::Passive => write!(f, "passive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block<S: Deref<Target = str>> {
    Principal(Principal<S>),
    Message(Message<S>),
    Phase(Phase),
}

impl<S: Deref<Target = str>> Block<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Block<T> {
        match self {
            Block::Principal(p) => Block::Principal(p.map(f)),
            Block::Message(m) => Block::Message(m.map(f)),
            Block::Phase(p) => Block::Phase(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Principal<S: Deref<Target = str>> {
    pub name: Ident<S>,
    pub expressions: Vec<Expression<S>>,
}

impl<S: Deref<Target = str>> Principal<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Principal<T> {
        Principal {
            name: self.name.map(f),
            expressions: self.expressions.into_iter().map(|e| e.map(f)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Public,
    Private,
    Password,
}

impl std::fmt::Display for Qualifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Qualifier::Public => write!(f, "public"),
            Qualifier::Private => write!(f, "private"),
            Qualifier::Password => write!(f, "password"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression<S: Deref<Target = str>> {
    Knows {
        qualifier: Qualifier,
        constants: Vec<Ident<S>>,
    },
    Generates {
        constants: Vec<Ident<S>>,
    },
    Leaks {
        constants: Vec<Ident<S>>,
    },
    Assignment {
        left: Vec<Ident<S>>,
        right: Value<S>,
    },
}

impl<S: Deref<Target = str>> Expression<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Expression<T> {
        let idents = |is: Vec<Ident<S>>| is.into_iter().map(|i| i.map(f)).collect();
        match self {
            Expression::Knows {
                qualifier,
                constants,
            } => Expression::Knows {
                qualifier,
                constants: idents(constants),
            },
            Expression::Generates { constants } => Expression::Generates {
                constants: idents(constants),
            },
            Expression::Leaks { constants } => Expression::Leaks {
                constants: idents(constants),
            },
            Expression::Assignment { left, right } => Expression::Assignment {
                left: idents(left),
                right: right.map(f),
            },
        }
    }
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<S: Deref<Target = str>> {
    Constant(Ident<S>),
    Primitive {
        name: Ident<S>,
        args: Vec<Value<S>>,
        check: bool,
    },
    /// `g^a^b`; only constants may appear in an equation.
    Equation(Vec<Ident<S>>),
}

impl<S: Deref<Target = str>> Value<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Value<T> {
        match self {
            Value::Constant(i) => Value::Constant(i.map(f)),
            Value::Primitive { name, args, check } => Value::Primitive {
                name: name.map(f),
                args: args.into_iter().map(|a| a.map(f)).collect(),
                check,
            },
            Value::Equation(values) => {
                Value::Equation(values.into_iter().map(|i| i.map(f)).collect())
            }
        }
    }

    pub fn span(&self) -> miette::SourceSpan {
        match self {
            Value::Constant(i) => i.span(),
            Value::Primitive { name, .. } => name.span(),
            Value::Equation(values) => values
                .first()
                .map(|i| i.span())
                .unwrap_or_else(|| (0, 0).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message<S: Deref<Target = str>> {
    pub sender: Ident<S>,
    pub recipient: Ident<S>,
    pub constants: Vec<Transfer<S>>,
}

impl<S: Deref<Target = str>> Message<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Message<T> {
        Message {
            sender: self.sender.map(f),
            recipient: self.recipient.map(f),
            constants: self.constants.into_iter().map(|c| c.map(f)).collect(),
        }
    }
}

/// A constant sent in a message, `[c]` when guarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer<S: Deref<Target = str>> {
    pub name: Ident<S>,
    pub guard: bool,
}

impl<S: Deref<Target = str>> Transfer<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Transfer<T> {
        Transfer {
            name: self.name.map(f),
            guard: self.guard,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub number: u32,
    pub span: miette::SourceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Confidentiality,
    Authentication,
    Freshness,
    Unlinkability,
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKind::Confidentiality => write!(f, "confidentiality"),
            QueryKind::Authentication => write!(f, "authentication"),
            QueryKind::Freshness => write!(f, "freshness"),
            QueryKind::Unlinkability => write!(f, "unlinkability"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query<S: Deref<Target = str>> {
    pub kind: QueryKind,
    /// Targets of confidentiality, freshness and unlinkability queries.
    pub constants: Vec<Ident<S>>,
    /// Only set for authentication queries.
    pub message: Option<QueryMessage<S>>,
    pub options: Vec<QueryOption<S>>,
}

impl<S: Deref<Target = str>> Query<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> Query<T> {
        Query {
            kind: self.kind,
            constants: self.constants.into_iter().map(|c| c.map(f)).collect(),
            message: self.message.map(|m| m.map(f)),
            options: self.options.into_iter().map(|o| o.map(f)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage<S: Deref<Target = str>> {
    pub sender: Ident<S>,
    pub recipient: Ident<S>,
    pub constants: Vec<Ident<S>>,
}

impl<S: Deref<Target = str>> QueryMessage<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> QueryMessage<T> {
        QueryMessage {
            sender: self.sender.map(f),
            recipient: self.recipient.map(f),
            constants: self.constants.into_iter().map(|c| c.map(f)).collect(),
        }
    }
}

/// `precondition[A -> B: c]`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOption<S: Deref<Target = str>> {
    pub message: QueryMessage<S>,
}

impl<S: Deref<Target = str>> QueryOption<S> {
    pub fn map<T: Deref<Target = str>>(self, f: impl Fn(S) -> T + Copy) -> QueryOption<T> {
        QueryOption {
            message: self.message.map(f),
        }
    }
}

impl<S: Deref<Target = str>> std::fmt::Display for Value<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Constant(c) => write!(f, "{c}"),
            Value::Primitive { name, args, check } => {
                write!(f, "{}({})", name, args.iter().format(", "))?;
                if *check {
                    write!(f, "?")?;
                }
                Ok(())
            }
            Value::Equation(values) => write!(f, "{}", values.iter().format("^")),
        }
    }
}

impl<S: Deref<Target = str>> std::fmt::Display for Transfer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.guard {
            write!(f, "[{}]", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

impl<S: Deref<Target = str>> std::fmt::Display for QueryMessage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: {}",
            self.sender,
            self.recipient,
            self.constants.iter().format(", ")
        )
    }
}

impl<S: Deref<Target = str>> std::fmt::Display for Query<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.message) {
            (QueryKind::Authentication, Some(message)) => write!(f, "{}? {}", self.kind, message),
            _ => write!(
                f,
                "{}? {}",
                self.kind,
                self.constants.iter().format(", ")
            ),
        }
    }
}

#[derive(Clone)]
pub struct Ident<S>(pub S, pub miette::SourceSpan);

impl<S> Ident<S> {
    pub fn map<T>(self, f: impl Fn(S) -> T + Copy) -> Ident<T> {
        Ident(f(self.0), self.1)
    }
    pub fn span(&self) -> miette::SourceSpan {
        self.1
    }
    pub fn as_str(&self) -> &str
    where
        S: Deref<Target = str>,
    {
        self.as_ref()
    }
    /// `_` on the left-hand side of an assignment.
    pub fn is_unnamed(&self) -> bool
    where
        S: Deref<Target = str>,
    {
        self.as_str() == "_"
    }
}

impl<S: std::hash::Hash> std::hash::Hash for Ident<S> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<S: Ord> Ord for Ident<S> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<S: PartialOrd> PartialOrd for Ident<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

impl<S: PartialEq> PartialEq for Ident<S> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<S: Eq> Eq for Ident<S> {}

impl<S: Deref<Target = str>> std::fmt::Debug for Ident<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.deref())
    }
}
impl<S: Deref<Target = str>> std::fmt::Display for Ident<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.deref())
    }
}
impl<S: Deref<Target = str>> AsRef<str> for Ident<S> {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}
impl<'a> From<&'a str> for Ident<String> {
    fn from(s: &'a str) -> Self {
        Ident(s.to_string(), (0, 0).into())
    }
}
impl<'a> From<&'a str> for Ident<SmolStr> {
    fn from(s: &'a str) -> Self {
        Ident(s.into(), (0, 0).into())
    }
}
