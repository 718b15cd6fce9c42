//! Per-principal runtime view of the knowledge map.

use std::sync::Arc;

use itertools::Itertools;
use smol_str::SmolStr;

use crate::error::InternalError;
use crate::knowledge::KnowledgeMap;
use crate::value::{Constant, Primitive, Value};

pub const MAX_RESOLUTION_DEPTH: usize = 65535;

/// The parts of a slot no mutation or rewrite ever changes.
#[derive(Debug)]
pub struct SlotInfo {
    pub constant: Constant,
    /// Received guarded, or created by this principal and sent guarded.
    pub guard: bool,
    pub known: bool,
    /// Every recipient of the constant over the wire.
    pub wire: Vec<SmolStr>,
    /// Recipients that got the constant unguarded at least once.
    pub mutatable_to: Vec<SmolStr>,
    pub known_by: Vec<(SmolStr, SmolStr)>,
    pub declared_at: usize,
    pub phase: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub info: Arc<SlotInfo>,
    pub assigned: Value,
    pub creator: SmolStr,
    pub sender: SmolStr,
    pub rewritten: bool,
    pub before_rewrite: Value,
    pub mutated: bool,
    pub before_mutate: Value,
}

impl Slot {
    pub fn constant(&self) -> &Constant {
        &self.info.constant
    }
}

#[derive(Debug, Clone)]
pub struct PrincipalState {
    pub name: SmolStr,
    pub slots: Vec<Slot>,
    pub max_declared_at: usize,
    /// Bumped for every mutated clone.
    pub generation: u64,
    km: Arc<KnowledgeMap>,
}

impl PrincipalState {
    /// One state per principal, in declaration order.
    pub fn construct_all(km: &Arc<KnowledgeMap>) -> Vec<PrincipalState> {
        km.principals
            .iter()
            .map(|principal| Self::construct(km, principal))
            .collect()
    }

    fn construct(km: &Arc<KnowledgeMap>, principal: &SmolStr) -> PrincipalState {
        let slots = km
            .slots
            .values()
            .map(|k| {
                let mut known = k.creator == *principal;
                let mut sender = k.creator.clone();
                if let Some((_, preceding)) = k.known_by.iter().find(|(p, _)| p == principal) {
                    sender = preceding.clone();
                    known = true;
                }

                let mut wire = Vec::new();
                let mut guard = false;
                let mut mutatable_to = Vec::new();
                let transfers = km.messages.iter().flat_map(|m| {
                    m.constants
                        .iter()
                        .filter(|c| c.name == k.constant.name)
                        .map(move |c| (m, c.guard))
                });
                for (m, guarded) in transfers {
                    if !wire.contains(&m.recipient) {
                        wire.push(m.recipient.clone());
                    }
                    guard |= guarded && (m.recipient == *principal || k.creator == *principal);
                    if !guarded && !mutatable_to.contains(&m.recipient) {
                        mutatable_to.push(m.recipient.clone());
                    }
                }

                Slot {
                    info: Arc::new(SlotInfo {
                        constant: k.constant.clone(),
                        guard,
                        known,
                        wire,
                        mutatable_to,
                        known_by: k.known_by.clone(),
                        declared_at: k.declared_at,
                        phase: k.phase.clone(),
                    }),
                    assigned: k.assigned.clone(),
                    creator: k.creator.clone(),
                    sender,
                    rewritten: false,
                    before_rewrite: k.assigned.clone(),
                    mutated: false,
                    before_mutate: k.assigned.clone(),
                }
            })
            .collect();

        PrincipalState {
            name: principal.clone(),
            slots,
            max_declared_at: km.max_declared_at,
            generation: 0,
            km: km.clone(),
        }
    }

    pub fn knowledge_map(&self) -> &Arc<KnowledgeMap> {
        &self.km
    }

    pub fn index_of(&self, c: &Constant) -> Option<usize> {
        self.km
            .index_of(c.name.as_str())
            .filter(|&i| i < self.slots.len())
    }

    pub fn slot_of(&self, c: &Constant) -> Option<&Slot> {
        self.index_of(c).map(|i| &self.slots[i])
    }

    /// A clone with every mutation and rewrite undone.
    pub fn clone_purified(&self) -> PrincipalState {
        let mut clone = self.clone();
        for slot in &mut clone.slots {
            slot.assigned = slot.before_mutate.clone();
            slot.before_rewrite = slot.before_mutate.clone();
        }
        clone
    }

    /// Drops every slot from `len` on.
    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// Whether slot `i` should be read as this principal originally saw it.
    pub fn should_resolve_to_before_mutate(&self, i: usize) -> bool {
        let slot = &self.slots[i];
        slot.creator == self.name
            || !slot.info.known
            || !slot.info.wire.contains(&self.name)
            || !slot.mutated
    }

    pub fn resolve_constant(&self, c: &Constant) -> (Value, Option<usize>) {
        match self.index_of(c) {
            Some(i) if self.should_resolve_to_before_mutate(i) => {
                (self.slots[i].before_mutate.clone(), Some(i))
            }
            Some(i) => (self.slots[i].assigned.clone(), Some(i)),
            None => (Value::Constant(c.clone()), None),
        }
    }

    /// Replaces constants in `a` by their values as seen from slot `root_index`.
    pub fn resolve_value(
        &self,
        a: &Value,
        root_index: usize,
        force_before_mutate: bool,
    ) -> Result<Value, InternalError> {
        self.resolve_internal(a, a, root_index, force_before_mutate, 0)
    }

    fn resolve_internal(
        &self,
        a: &Value,
        root_value: &Value,
        root_index: usize,
        mut force: bool,
        depth: usize,
    ) -> Result<Value, InternalError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(InternalError::DepthExceeded(MAX_RESOLUTION_DEPTH));
        }
        let mut root_index = root_index;
        let mut root_value = root_value.clone();
        let mut a = a.clone();
        if let Value::Constant(c) = &a {
            let next = match self.index_of(c) {
                Some(next) => next,
                None => return Ok(a),
            };
            if next == root_index {
                if !force {
                    force = self.should_resolve_to_before_mutate(next);
                }
                a = if force {
                    self.slots[next].before_mutate.clone()
                } else {
                    self.resolve_constant(c).0
                };
            } else {
                if matches!(root_value, Value::Primitive(_))
                    && self.creator_of(root_index) != Some(&self.name)
                {
                    force = true;
                }
                force = if force {
                    match self.creator_of(root_index) {
                        Some(creator) => !self.slots[next].info.mutatable_to.contains(creator),
                        None => true,
                    }
                } else {
                    self.should_resolve_to_before_mutate(next)
                };
                a = if force {
                    self.slots[next].before_mutate.clone()
                } else {
                    self.slots[next].assigned.clone()
                };
                root_index = next;
                root_value = a.clone();
            }
        }

        match &a {
            Value::Constant(_) => Ok(a),
            Value::Primitive(p) => {
                if self.creator_of(root_index) == Some(&self.name) {
                    force = false;
                }
                let args = p
                    .args
                    .iter()
                    .map(|arg| self.resolve_internal(arg, &root_value, root_index, force, depth + 1))
                    .collect::<Result<_, _>>()?;
                Ok(Value::from(Primitive {
                    args,
                    ..Primitive::clone(p)
                }))
            }
            Value::Equation(_) => self.resolve_equation(&a, &root_value, root_index, force, depth + 1),
        }
    }

    fn resolve_equation(
        &self,
        a: &Value,
        root_value: &Value,
        root_index: usize,
        mut force: bool,
        depth: usize,
    ) -> Result<Value, InternalError> {
        let e = match a {
            Value::Equation(e) => e,
            _ => return Ok(a.clone()),
        };
        if self.creator_of(root_index) == Some(&self.name) {
            force = false;
        }
        let members = e
            .values
            .iter()
            .map(|v| match v {
                Value::Constant(c) => match self.resolve_constant(c) {
                    (_, Some(i)) if force => self.slots[i].before_mutate.clone(),
                    (resolved, _) => resolved,
                },
                v => v.clone(),
            })
            .collect_vec();

        let mut values = Vec::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            match member {
                Value::Constant(_) => values.push(member.clone()),
                Value::Primitive(_) => values.push(self.resolve_internal(
                    member,
                    root_value,
                    root_index,
                    force,
                    depth + 1,
                )?),
                Value::Equation(_) => {
                    let inner =
                        self.resolve_equation(member, root_value, root_index, force, depth + 1)?;
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
        Ok(Value::equation(values))
    }

    fn creator_of(&self, i: usize) -> Option<&SmolStr> {
        self.slots.get(i).map(|slot| &slot.creator)
    }

    /// A copy in which every assigned and pre-rewrite value is fully resolved.
    pub fn resolve_all(&self) -> Result<PrincipalState, InternalError> {
        let mut resolved = self.clone();
        for (i, slot) in self.slots.iter().enumerate() {
            let force = self.should_resolve_to_before_mutate(i);
            resolved.slots[i].assigned = self.resolve_value(&slot.assigned, i, force)?;
            resolved.slots[i].before_rewrite = self.resolve_value(&slot.before_rewrite, i, force)?;
        }
        Ok(resolved)
    }

    /// Whether resolving `v` from the slot of `c` reaches a generated constant.
    pub fn contains_fresh(&self, v: &Value, c: &Constant) -> Result<bool, InternalError> {
        let root = match self.index_of(c) {
            Some(root) => root,
            None => return Ok(false),
        };
        let resolved = self.resolve_value(v, root, false)?;
        Ok(resolved
            .constants()
            .into_iter()
            .filter_map(|c| self.slot_of(c))
            .any(|slot| slot.constant().fresh))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::knowledge::ATTACKER;
    use crate::sanity;
    use crate::value::NIL;

    pub(crate) fn states(src: &str) -> Vec<PrincipalState> {
        let model = verisym_parse::parse_model(src).unwrap();
        let principals = sanity::declared_principals(src, &model).unwrap();
        let km = Arc::new(KnowledgeMap::construct(src, &model, principals).unwrap());
        PrincipalState::construct_all(&km)
    }

    static GUARDED: &str = r#"
attacker[active]
principal Alice[
    knows private k
    generates a
    ga = G^a
    e = ENC(k, a)
]
Alice -> Bob: [ga], e
principal Bob[
    knows private k
    generates b
    gb = G^b
    ss = ga^b
    d = DEC(k, e)
]
Bob -> Alice: gb
principal Alice[
    s = gb^a
]
queries[ confidentiality? a ]
"#;

    #[test]
    fn wire_and_guards() {
        let states = states(GUARDED);
        let (alice, bob) = (&states[0], &states[1]);
        let ga = alice.slot_of(&Constant::named("ga")).unwrap();
        assert!(ga.info.guard);
        assert_eq!(ga.info.wire, vec![SmolStr::from("Bob")]);
        assert!(ga.info.mutatable_to.is_empty());

        let e = bob.slot_of(&Constant::named("e")).unwrap();
        assert!(!e.info.guard);
        assert!(e.info.known);
        assert_eq!(e.sender, "Alice");
        assert_eq!(e.info.mutatable_to, vec![SmolStr::from("Bob")]);

        let b = alice.slot_of(&Constant::named("b")).unwrap();
        assert!(!b.info.known);
    }

    #[test]
    fn mutations_resolve_only_across_the_wire() {
        let states = states(GUARDED);
        let mut bob = states[1].clone();
        let e = bob.index_of(&Constant::named("e")).unwrap();
        bob.slots[e].assigned = NIL.clone();
        bob.slots[e].before_rewrite = NIL.clone();
        bob.slots[e].mutated = true;
        bob.slots[e].creator = ATTACKER.into();
        bob.slots[e].sender = ATTACKER.into();

        assert!(!bob.should_resolve_to_before_mutate(e));
        let (resolved, index) = bob.resolve_constant(&Constant::named("e"));
        assert_eq!(index, Some(e));
        assert!(resolved.equivalent(&NIL, true));

        let resolved = bob.resolve_all().unwrap();
        let d = resolved.slot_of(&Constant::named("d")).unwrap();
        assert_eq!(d.assigned.to_string(), "DEC(k, nil)");

        let alice = &states[0];
        let (own, _) = alice.resolve_constant(&Constant::named("e"));
        assert_eq!(own.to_string(), "ENC(k, a)");
    }

    #[test]
    fn equations_flatten_on_resolution() {
        let states = states(GUARDED);
        let resolved = states[1].resolve_all().unwrap();
        let ss = resolved.slot_of(&Constant::named("ss")).unwrap();
        assert_eq!(ss.assigned.to_string(), "G^a^b");
    }

    #[test]
    fn purified_clones_forget_mutations() {
        let states = states(GUARDED);
        let mut bob = states[1].clone();
        let e = bob.index_of(&Constant::named("e")).unwrap();
        bob.slots[e].assigned = NIL.clone();
        let clean = bob.clone_purified();
        assert_eq!(clean.slots[e].assigned.to_string(), "ENC(k, a)");
        assert_eq!(states[1].slots[e].assigned.to_string(), "ENC(k, a)");
    }

    #[test]
    fn freshness_follows_resolution() {
        let states = states(GUARDED);
        let bob = &states[1];
        let d = Constant::named("d");
        let (v, _) = bob.resolve_constant(&d);
        assert!(bob.contains_fresh(&v, &d).unwrap());
        let k = Constant::named("k");
        let (v, _) = bob.resolve_constant(&k);
        assert!(!bob.contains_fresh(&v, &k).unwrap());
    }

    #[test]
    fn truncation_hides_later_slots() {
        let states = states(GUARDED);
        let mut alice = states[0].clone();
        let e = alice.index_of(&Constant::named("e")).unwrap();
        alice.truncate(e + 1);
        assert!(alice.index_of(&Constant::named("s")).is_none());
        let (v, i) = alice.resolve_constant(&Constant::named("s"));
        assert_eq!(i, None);
        assert_eq!(v.to_string(), "s");
    }
}
