//! The knowledge map: what every constant is, who creates it and who
//! eventually learns it, as declared by the model.

use indexmap::IndexMap;
use smol_str::SmolStr;
use verisym_parse::ast::{self, Block, Expression, Ident, Model, Qualifier};

use crate::error::{pretty_arity, SanityError};
use crate::primitive::{self, PrimitiveName};
use crate::value::{push_unique, Constant, Declaration, Primitive, Value, G, NIL};

/// Principal name used as creator and sender of attacker-made values.
pub const ATTACKER: &str = "Attacker";

#[derive(Debug, Clone)]
pub struct KnowledgeSlot {
    pub constant: Constant,
    pub assigned: Value,
    pub creator: SmolStr,
    /// `(principal, sender)` for everyone besides the creator who knows the constant.
    pub known_by: Vec<(SmolStr, SmolStr)>,
    /// Number of messages and leaks that preceded the declaration.
    pub declared_at: usize,
    /// Phases in which the constant was sent or leaked.
    pub phase: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct WireMessage {
    pub sender: SmolStr,
    pub recipient: SmolStr,
    /// Carries the guard of each transfer.
    pub constants: Vec<Constant>,
}

#[derive(Debug, Clone)]
pub struct KnowledgeMap {
    pub principals: Vec<SmolStr>,
    pub slots: IndexMap<SmolStr, KnowledgeSlot>,
    pub messages: Vec<WireMessage>,
    pub max_declared_at: usize,
    pub max_phase: u32,
}

impl KnowledgeMap {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.get_index_of(name)
    }

    pub fn slot(&self, index: usize) -> Option<&KnowledgeSlot> {
        self.slots.get_index(index).map(|(_, slot)| slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn knows(&self, principal: &str, index: usize) -> bool {
        self.slot(index)
            .map(|slot| {
                slot.creator == principal || slot.known_by.iter().any(|(p, _)| p == principal)
            })
            .unwrap_or(false)
    }

    /// Resolves `a` through the declared assignments. Also returns every
    /// constant met on the way and every nested equation before flattening.
    pub fn resolve_internal_values(&self, a: &Value) -> (Value, Vec<Value>) {
        let mut seen = Vec::new();
        let resolved = self.resolve_internal_values_into(a, &mut seen);
        (resolved, seen)
    }

    fn assigned_of(&self, c: &Constant) -> Option<&Value> {
        self.slots.get(c.name.as_str()).map(|slot| &slot.assigned)
    }

    fn resolve_internal_values_into(&self, a: &Value, seen: &mut Vec<Value>) -> Value {
        let a = match a {
            Value::Constant(c) => {
                push_unique(seen, a.clone());
                match self.assigned_of(c) {
                    Some(assigned) => assigned.clone(),
                    None => return a.clone(),
                }
            }
            a => a.clone(),
        };
        match &a {
            Value::Constant(_) => a,
            Value::Primitive(p) => {
                let args = p
                    .args
                    .iter()
                    .map(|arg| self.resolve_internal_values_into(arg, seen))
                    .collect();
                Value::from(Primitive {
                    args,
                    ..Primitive::clone(p)
                })
            }
            Value::Equation(e) => {
                let mut values = Vec::with_capacity(e.values.len());
                for (i, v) in e.values.iter().enumerate() {
                    let v = self.resolve_twice(v);
                    match &v {
                        Value::Constant(_) => values.push(v),
                        Value::Primitive(_) => {
                            let mut ignored = Vec::new();
                            values.push(self.resolve_internal_values_into(&v, &mut ignored));
                        }
                        Value::Equation(_) => {
                            let mut ignored = Vec::new();
                            let inner = self.resolve_internal_values_into(&v, &mut ignored);
                            push_unique(seen, v.clone());
                            if let Value::Equation(inner) = inner {
                                if i == 0 {
                                    values = inner.values.clone();
                                } else {
                                    values.extend(inner.values.iter().skip(1).cloned());
                                }
                            }
                        }
                    }
                }
                let resolved = Value::equation(values);
                push_unique(seen, resolved.clone());
                resolved
            }
        }
    }

    /// Two steps of constant lookup, as used for equation members.
    fn resolve_twice(&self, v: &Value) -> Value {
        let mut v = v.clone();
        for _ in 0..2 {
            if let Value::Constant(c) = &v {
                if let Some(assigned) = self.assigned_of(c) {
                    v = assigned.clone();
                }
            }
        }
        v
    }

    /// Whether `c` appears anywhere in the declared resolution of `a`.
    pub fn find_constant_in_primitive(&self, c: &Constant, a: &Value) -> bool {
        let (_, seen) = self.resolve_internal_values(a);
        seen.iter()
            .any(|v| matches!(v, Value::Constant(x) if x == c))
    }

    /// Whether `principal` feeds `c` into any primitive or equation it computes.
    pub fn constant_used_by(&self, principal: &str, c: &Constant) -> bool {
        let assigned = match self.assigned_of(c) {
            Some(assigned) => assigned,
            None => return false,
        };
        let target = Value::Constant(c.clone());
        self.slots
            .values()
            .filter(|slot| slot.creator == principal)
            .filter(|slot| !matches!(slot.assigned, Value::Constant(_)))
            .any(|slot| {
                let (_, seen) = self.resolve_internal_values(&slot.assigned);
                seen.iter()
                    .any(|v| v.equivalent(assigned, true) || v.equivalent(&target, true))
            })
    }

    /// Builds the map from a model whose principals and phases were checked.
    pub fn construct(
        src: &str,
        model: &Model<SmolStr>,
        principals: Vec<SmolStr>,
    ) -> Result<Self, SanityError> {
        let mut builder = Builder::new(src, principals)?;
        for block in &model.blocks {
            match block {
                Block::Principal(p) => builder.principal(p)?,
                Block::Message(m) => {
                    builder.declared_at += 1;
                    builder.km.max_declared_at = builder.declared_at;
                    builder.message(m)?;
                }
                Block::Phase(phase) => builder.phase = phase.number,
            }
        }
        builder.km.max_phase = builder.phase;
        Ok(builder.km)
    }
}

struct Builder<'a> {
    src: &'a str,
    km: KnowledgeMap,
    declared_at: usize,
    phase: u32,
    unnamed: usize,
}

impl<'a> Builder<'a> {
    fn new(src: &'a str, principals: Vec<SmolStr>) -> Result<Self, SanityError> {
        let first = principals.first().cloned().ok_or(SanityError::NoPrincipals)?;
        let everyone = principals
            .iter()
            .map(|p| (p.clone(), p.clone()))
            .collect::<Vec<_>>();
        let mut slots = IndexMap::new();
        for value in [&*G, &*NIL] {
            if let Value::Constant(c) = value {
                slots.insert(
                    c.name.clone(),
                    KnowledgeSlot {
                        constant: c.clone(),
                        assigned: value.clone(),
                        creator: first.clone(),
                        known_by: everyone.clone(),
                        declared_at: 0,
                        phase: vec![0],
                    },
                );
            }
        }
        Ok(Builder {
            src,
            km: KnowledgeMap {
                principals,
                slots,
                messages: Vec::new(),
                max_declared_at: 0,
                max_phase: 0,
            },
            declared_at: 0,
            phase: 0,
            unnamed: 0,
        })
    }

    fn src(&self) -> String {
        format!("{}\n", self.src)
    }

    fn principal(&mut self, p: &ast::Principal<SmolStr>) -> Result<(), SanityError> {
        let name = p.name.0.clone();
        for expr in &p.expressions {
            match expr {
                Expression::Knows {
                    qualifier,
                    constants,
                } => self.knows(&name, *qualifier, constants)?,
                Expression::Generates { constants } => self.generates(&name, constants)?,
                Expression::Assignment { left, right } => self.assignment(&name, left, right)?,
                Expression::Leaks { constants } => {
                    self.declared_at += 1;
                    self.leaks(&name, constants)?;
                }
            }
        }
        Ok(())
    }

    fn knows(
        &mut self,
        principal: &SmolStr,
        qualifier: Qualifier,
        constants: &[Ident<SmolStr>],
    ) -> Result<(), SanityError> {
        for ident in constants {
            if let Some(slot) = self.km.slots.get_mut(ident.as_str()) {
                let c = &slot.constant;
                if c.declaration != Some(Declaration::Knows)
                    || c.qualifier != Some(qualifier)
                    || c.fresh
                {
                    return Err(SanityError::InconsistentKnows {
                        src: self.src(),
                        err_span: ident.span(),
                        name: ident.to_string(),
                    });
                }
                if slot.creator != *principal && !slot.known_by.iter().any(|(p, _)| p == principal)
                {
                    slot.known_by.push((principal.clone(), principal.clone()));
                }
                continue;
            }
            let constant = Constant {
                declaration: Some(Declaration::Knows),
                qualifier: Some(qualifier),
                ..Constant::named(ident.0.clone())
            };
            let known_by = match qualifier {
                Qualifier::Public => self
                    .km
                    .principals
                    .iter()
                    .filter(|p| *p != principal)
                    .map(|p| (p.clone(), p.clone()))
                    .collect(),
                Qualifier::Private | Qualifier::Password => Vec::new(),
            };
            self.insert(constant, principal, known_by, None);
        }
        Ok(())
    }

    fn generates(
        &mut self,
        principal: &SmolStr,
        constants: &[Ident<SmolStr>],
    ) -> Result<(), SanityError> {
        for ident in constants {
            if self.km.slots.contains_key(ident.as_str()) {
                return Err(SanityError::GeneratedTwice {
                    src: self.src(),
                    err_span: ident.span(),
                    name: ident.to_string(),
                });
            }
            let constant = Constant {
                fresh: true,
                declaration: Some(Declaration::Generates),
                qualifier: Some(Qualifier::Private),
                ..Constant::named(ident.0.clone())
            };
            self.insert(constant, principal, Vec::new(), None);
        }
        Ok(())
    }

    fn assignment(
        &mut self,
        principal: &SmolStr,
        left: &[Ident<SmolStr>],
        right: &ast::Value<SmolStr>,
    ) -> Result<(), SanityError> {
        let mut used = Vec::new();
        collect_idents(right, &mut used);
        for ident in used {
            let index = self.km.index_of(ident.as_str()).ok_or_else(|| {
                SanityError::UnknownConstant {
                    src: self.src(),
                    err_span: ident.span(),
                    name: ident.to_string(),
                }
            })?;
            if !self.km.knows(principal, index) {
                return Err(SanityError::UsingUnknown {
                    src: self.src(),
                    err_span: ident.span(),
                    principal: principal.to_string(),
                    name: ident.to_string(),
                });
            }
        }

        let value = self.lower(right)?;
        if let ast::Value::Primitive { name, .. } = right {
            let spec = primitive::lookup(name.as_str()).map_err(|_| self.unknown_primitive(name))?;
            if !spec.output.contains(&left.len()) {
                return Err(SanityError::Outputs {
                    src: self.src(),
                    err_span: name.span(),
                    name: name.to_string(),
                    got: left.len(),
                    expected: pretty_arity(spec.output),
                });
            }
        }

        for (output, ident) in left.iter().enumerate() {
            let name = if ident.is_unnamed() {
                let name = SmolStr::from(format!("unnamed_{}", self.unnamed));
                self.unnamed += 1;
                name
            } else {
                ident.0.clone()
            };
            if self.km.slots.contains_key(name.as_str()) {
                return Err(SanityError::AssignedTwice {
                    src: self.src(),
                    err_span: ident.span(),
                    name: name.to_string(),
                });
            }
            let assigned = match &value {
                Value::Primitive(p) => Value::from(Primitive {
                    output,
                    ..Primitive::clone(p)
                }),
                v => v.clone(),
            };
            let constant = Constant {
                declaration: Some(Declaration::Assignment),
                qualifier: Some(Qualifier::Private),
                ..Constant::named(name)
            };
            self.insert(constant, principal, Vec::new(), Some(assigned));
        }
        Ok(())
    }

    fn leaks(
        &mut self,
        principal: &SmolStr,
        constants: &[Ident<SmolStr>],
    ) -> Result<(), SanityError> {
        for ident in constants {
            let index = self.km.index_of(ident.as_str()).ok_or_else(|| {
                SanityError::UnknownConstant {
                    src: self.src(),
                    err_span: ident.span(),
                    name: ident.to_string(),
                }
            })?;
            if !self.km.knows(principal, index) {
                return Err(SanityError::LeakingUnknown {
                    src: self.src(),
                    err_span: ident.span(),
                    principal: principal.to_string(),
                    name: ident.to_string(),
                });
            }
            let phase = self.phase;
            if let Some((_, slot)) = self.km.slots.get_index_mut(index) {
                slot.constant.leaked = true;
                if !slot.phase.contains(&phase) {
                    slot.phase.push(phase);
                }
            }
        }
        Ok(())
    }

    fn message(&mut self, m: &ast::Message<SmolStr>) -> Result<(), SanityError> {
        let sender = m.sender.0.clone();
        let recipient = m.recipient.0.clone();
        let mut constants = Vec::with_capacity(m.constants.len());
        for transfer in &m.constants {
            let ident = &transfer.name;
            let index = self.km.index_of(ident.as_str()).ok_or_else(|| {
                SanityError::UnknownConstant {
                    src: self.src(),
                    err_span: ident.span(),
                    name: ident.to_string(),
                }
            })?;
            if !self.km.knows(&sender, index) {
                return Err(SanityError::SendingUnknown {
                    src: self.src(),
                    err_span: ident.span(),
                    sender: sender.to_string(),
                    name: ident.to_string(),
                });
            }
            if self.km.knows(&recipient, index) {
                return Err(SanityError::ReceivingKnown {
                    src: self.src(),
                    err_span: ident.span(),
                    recipient: recipient.to_string(),
                    name: ident.to_string(),
                });
            }
            let phase = self.phase;
            if let Some((_, slot)) = self.km.slots.get_index_mut(index) {
                slot.known_by.push((recipient.clone(), sender.clone()));
                if !slot.phase.contains(&phase) {
                    slot.phase.push(phase);
                }
                constants.push(Constant {
                    guard: transfer.guard,
                    ..slot.constant.clone()
                });
            }
        }
        self.km.messages.push(WireMessage {
            sender,
            recipient,
            constants,
        });
        Ok(())
    }

    fn insert(
        &mut self,
        constant: Constant,
        creator: &SmolStr,
        known_by: Vec<(SmolStr, SmolStr)>,
        assigned: Option<Value>,
    ) {
        let assigned = assigned.unwrap_or_else(|| Value::Constant(constant.clone()));
        self.km.slots.insert(
            constant.name.clone(),
            KnowledgeSlot {
                constant,
                assigned,
                creator: creator.clone(),
                known_by,
                declared_at: self.declared_at,
                phase: Vec::new(),
            },
        );
    }

    fn constant(&self, ident: &Ident<SmolStr>) -> Result<Value, SanityError> {
        self.km
            .slots
            .get(ident.as_str())
            .map(|slot| Value::Constant(slot.constant.clone()))
            .ok_or_else(|| SanityError::UnknownConstant {
                src: self.src(),
                err_span: ident.span(),
                name: ident.to_string(),
            })
    }

    fn unknown_primitive(&self, name: &Ident<SmolStr>) -> SanityError {
        SanityError::UnknownPrimitive {
            src: self.src(),
            err_span: name.span(),
            name: name.to_string(),
        }
    }

    fn lower(&self, value: &ast::Value<SmolStr>) -> Result<Value, SanityError> {
        match value {
            ast::Value::Constant(ident) => self.constant(ident),
            ast::Value::Primitive { name, args, check } => {
                let id: PrimitiveName = name
                    .as_str()
                    .parse()
                    .map_err(|_| self.unknown_primitive(name))?;
                let spec = primitive::spec(id);
                if !spec.arity.contains(&args.len()) {
                    return Err(SanityError::Arity {
                        src: self.src(),
                        err_span: name.span(),
                        name: name.to_string(),
                        got: args.len(),
                        expected: pretty_arity(spec.arity),
                    });
                }
                if *check && !spec.check {
                    return Err(SanityError::CheckUnsupported {
                        src: self.src(),
                        err_span: name.span(),
                        name: name.to_string(),
                    });
                }
                let args = args
                    .iter()
                    .map(|a| self.lower(a))
                    .collect::<Result<_, _>>()?;
                Ok(Value::from(Primitive {
                    name: id,
                    args,
                    output: 0,
                    check: *check,
                }))
            }
            ast::Value::Equation(idents) => {
                let values = idents
                    .iter()
                    .map(|i| self.constant(i))
                    .collect::<Result<_, _>>()?;
                Ok(Value::equation(values))
            }
        }
    }
}

fn collect_idents<'v>(value: &'v ast::Value<SmolStr>, out: &mut Vec<&'v Ident<SmolStr>>) {
    match value {
        ast::Value::Constant(ident) => out.push(ident),
        ast::Value::Primitive { args, .. } => args.iter().for_each(|a| collect_idents(a, out)),
        ast::Value::Equation(idents) => out.extend(idents.iter()),
    }
}
