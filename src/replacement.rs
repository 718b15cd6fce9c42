//! The space of substitutions an active attacker may make on one principal's
//! view of the wire.
//!
//! A [`ReplacementMap`] holds, for every constant the attacker can tamper
//! with, the list of values it could be replaced by. Iterating the map walks
//! every combination as a mixed-radix counter; each [`Frame`] is then applied
//! to a purified clone of the principal state by [`mutate`].

use itertools::Itertools;

use crate::attacker::AttackerState;
use crate::context::Context;
use crate::error::InternalError;
use crate::inject::{inject, matches_skeleton, skeleton};
use crate::knowledge::ATTACKER;
use crate::principal::PrincipalState;
use crate::value::{push_unique, Constant, Primitive, Value, G, G_NIL, G_NIL_NIL, NIL};

#[derive(Debug, Clone)]
pub struct ReplacementMap {
    pub constants: Vec<Constant>,
    pub replacements: Vec<Vec<Value>>,
    depth: Vec<usize>,
    started: bool,
    out_of_replacements: bool,
}

/// One combination of replacements, in the order of
/// [`ReplacementMap::constants`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub combination: Vec<Value>,
    /// Lowest position that changed since the previous frame.
    pub last_increment: usize,
}

impl ReplacementMap {
    pub fn init(
        ctx: &Context,
        state: &PrincipalState,
        attacker: &AttackerState,
        stage: u32,
    ) -> Result<Self, InternalError> {
        tracing::debug!(
            "Initializing Stage {} mutation map for {}...",
            stage,
            state.name
        );
        let mut constants = Vec::new();
        let mut replacements = Vec::new();
        for known in &attacker.known {
            let c = match known {
                Value::Constant(c) => c,
                _ => continue,
            };
            let (a, i) = state.resolve_constant(c);
            let i = match i {
                Some(i) if !skip(ctx, state, attacker, c, i) => i,
                _ => continue,
            };
            let r = match &a {
                Value::Constant(a) => replace_constant(a, i, state, attacker, stage),
                Value::Primitive(_) => replace_primitive(&a, i, state, attacker, ctx, stage)?,
                Value::Equation(e) => replace_equation(e.values.len(), attacker, stage),
            };
            if r.is_empty() {
                continue;
            }
            constants.push(c.clone());
            replacements.push(r);
        }
        Ok(Self::new(constants, replacements))
    }

    fn new(constants: Vec<Constant>, replacements: Vec<Vec<Value>>) -> Self {
        ReplacementMap {
            depth: vec![0; constants.len()],
            constants,
            replacements,
            started: false,
            out_of_replacements: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Number of frames the map yields in total.
    pub fn frame_count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.replacements
            .iter()
            .fold(1usize, |n, r| n.saturating_mul(r.len()))
    }

    fn frame(&self, last_increment: usize) -> Frame {
        Frame {
            combination: self
                .depth
                .iter()
                .zip(&self.replacements)
                .map(|(&d, r)| r[d].clone())
                .collect(),
            last_increment,
        }
    }
}

impl Iterator for ReplacementMap {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.out_of_replacements || self.is_empty() {
            self.out_of_replacements = true;
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.frame(0));
        }
        let mut i = self.depth.len() - 1;
        loop {
            self.depth[i] += 1;
            if self.depth[i] < self.replacements[i].len() {
                break;
            }
            self.depth[i] = 0;
            if i == 0 {
                self.out_of_replacements = true;
                return None;
            }
            i -= 1;
        }
        Some(self.frame(i))
    }
}

/// Constants the attacker cannot or need not tamper with in `state`.
fn skip(
    ctx: &Context,
    state: &PrincipalState,
    attacker: &AttackerState,
    c: &Constant,
    i: usize,
) -> bool {
    let slot = &state.slots[i];
    if slot.info.guard && !slot.info.mutatable_to.contains(&slot.sender) {
        return true;
    }
    !slot.info.wire.contains(&state.name)
        || slot.creator == state.name
        || !slot.info.known
        || !ctx.km.constant_used_by(&state.name, c)
        || !slot.info.phase.contains(&attacker.current_phase)
}

fn replace_constant(
    a: &Constant,
    root: usize,
    state: &PrincipalState,
    attacker: &AttackerState,
    stage: u32,
) -> Vec<Value> {
    if a.is_g_or_nil() {
        return Vec::new();
    }
    let mut replacements = vec![NIL.clone()];
    if stage < 3 {
        return replacements;
    }
    let root_declared_at = state.slots[root].info.declared_at;
    for known in &attacker.known {
        let k = match known {
            Value::Constant(k) if !k.is_g_or_nil() => k,
            _ => continue,
        };
        if let (v @ Value::Constant(_), Some(j)) = state.resolve_constant(k) {
            if root_declared_at <= state.slots[j].info.declared_at {
                push_unique(&mut replacements, v);
            }
        }
    }
    replacements
}

fn replace_primitive(
    a: &Value,
    root: usize,
    state: &PrincipalState,
    attacker: &AttackerState,
    ctx: &Context,
    stage: u32,
) -> Result<Vec<Value>, InternalError> {
    let a = state.resolve_value(a, root, false)?;
    let ap = match &a {
        Value::Primitive(ap) => ap,
        _ => return Ok(Vec::new()),
    };
    let shape = skeleton(ap);
    let mut replacements = Vec::new();
    for known in &attacker.known {
        if let Value::Primitive(kp) = known {
            if matches_skeleton(kp, &shape) {
                push_unique(&mut replacements, known.clone());
            }
        }
    }
    for injectant in inject(ap, None, state, ctx, stage) {
        push_unique(&mut replacements, injectant);
    }
    Ok(replacements)
}

fn replace_equation(len: usize, attacker: &AttackerState, stage: u32) -> Vec<Value> {
    let mut replacements = match len {
        1 => vec![G.clone()],
        2 => vec![G_NIL.clone()],
        3 => vec![G_NIL_NIL.clone()],
        _ => Vec::new(),
    };
    if stage < 3 {
        return replacements;
    }
    for known in &attacker.known {
        if matches!(known, Value::Equation(e) if e.values.len() == len) {
            push_unique(&mut replacements, known.clone());
        }
    }
    replacements
}

/// Applies `frame`, whose values line up with `constants`, to a purified
/// clone of `state`.
///
/// Returns `None` when the frame changes nothing at or after its
/// `last_increment`, since an earlier frame already covered it. When a checked
/// primitive of the principal fails under the mutation, the principal stops
/// there and every later slot is dropped.
pub fn mutate(
    state: &PrincipalState,
    frame: &Frame,
    constants: &[Constant],
    ctx: &Context,
) -> Result<Option<PrincipalState>, InternalError> {
    let mut mutated = state.clone_purified();
    mutated.generation += 1;
    let mut worthwhile = false;
    let mut applied = Vec::new();
    for (i, (c, candidate)) in constants.iter().zip(&frame.combination).enumerate() {
        let (ai, ii) = mutated.resolve_constant(c);
        let ii = ii.ok_or_else(|| InternalError::MissingSlot(c.name.clone()))?;
        let current = mutated.resolve_value(&ai, ii, true)?;
        if candidate.equivalent(&current, true) {
            continue;
        }
        let replacement = match (candidate, &current) {
            (Value::Primitive(cp), Value::Primitive(current)) => Value::from(Primitive {
                output: current.output,
                check: current.check,
                ..Primitive::clone(cp)
            }),
            _ => candidate.clone(),
        };
        let slot = &mut mutated.slots[ii];
        slot.creator = ATTACKER.into();
        slot.sender = ATTACKER.into();
        slot.mutated = true;
        slot.assigned = replacement.clone();
        slot.before_rewrite = replacement;
        applied.push(candidate);
        if i >= frame.last_increment {
            worthwhile = true;
        }
    }
    if !worthwhile {
        return Ok(None);
    }
    for candidate in applied {
        ctx.attacker.put_mutated_to(candidate, &state.name);
    }
    tracing::trace!(
        "Mutating {} (generation {}): {}",
        mutated.name,
        mutated.generation,
        constants
            .iter()
            .zip(&frame.combination)
            .map(|(c, v)| format!("{c} → {v}"))
            .format(", ")
    );

    let mut mutated = mutated.resolve_all()?;
    let failed = mutated.perform_all_rewrites();
    let aborted = failed
        .iter()
        .find(|(p, i)| p.check && mutated.slots[*i].creator == mutated.name);
    if let Some(&(_, index)) = aborted {
        let declared_at = mutated.slots[index].info.declared_at;
        let last = mutated.slots.last().map(|slot| slot.info.declared_at);
        if last == Some(declared_at) {
            mutated.truncate(index + 1);
        } else if let Some(first) = mutated
            .slots
            .iter()
            .position(|slot| slot.info.declared_at == declared_at)
        {
            mutated.truncate(first + 1);
        }
    }
    Ok(Some(mutated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::primitive::PrimitiveName::*;
    use crate::value::tests::{c, p};
    use smol_str::SmolStr;

    static DH: &str = r#"
attacker[active]
principal Alice[
    knows private k
    generates a, x
    ga = G^a
    e = ENC(k, x)
]
Alice -> Bob: ga, e
principal Bob[
    knows private k
    generates b
    d = DEC(k, e)
    ss = ga^b
]
queries[ confidentiality? x ]
"#;

    fn names(map: &ReplacementMap) -> Vec<&str> {
        map.constants.iter().map(|c| c.name.as_str()).sorted().collect()
    }

    #[test]
    fn counts_through_every_combination() {
        let mut map = ReplacementMap::new(
            vec![Constant::named("a"), Constant::named("b")],
            vec![vec![c("x"), c("y")], vec![c("u"), c("v"), c("w")]],
        );
        assert_eq!(map.frame_count(), 6);
        let frames = map.by_ref().collect_vec();
        assert_eq!(frames.len(), 6);
        assert_eq!(
            frames.iter().map(|f| f.last_increment).collect_vec(),
            vec![0, 1, 1, 0, 1, 1]
        );
        assert_eq!(frames[3].combination, vec![c("y"), c("u")]);
        assert!(map.next().is_none());
    }

    #[test]
    fn empty_maps_yield_nothing() {
        let mut map = ReplacementMap::new(Vec::new(), Vec::new());
        assert!(map.next().is_none());
        assert_eq!(map.frame_count(), 0);
    }

    #[test]
    fn only_received_values_are_replaced() {
        let (ctx, states) = context(DH);
        ctx.attacker.absorb_phase_values(&states[0], 0).unwrap();
        let attacker = ctx.attacker.read();

        let alice = ReplacementMap::init(&ctx, &states[0], &attacker, 1).unwrap();
        assert!(alice.is_empty());

        let bob = ReplacementMap::init(&ctx, &states[1], &attacker, 1).unwrap();
        assert_eq!(names(&bob), vec!["e", "ga"]);
        let ga = bob.constants.iter().position(|c| c.name == "ga").unwrap();
        assert_eq!(bob.replacements[ga], vec![G_NIL.clone()]);
        let e = bob.constants.iter().position(|c| c.name == "e").unwrap();
        assert!(bob.replacements[e]
            .iter()
            .any(|r| r.equivalent(&p(Enc, vec![c("k"), c("x")]), true)));
    }

    #[test]
    fn mutations_stay_in_the_clone() {
        let (ctx, states) = context(DH);
        ctx.attacker.absorb_phase_values(&states[0], 0).unwrap();
        let attacker = ctx.attacker.read();
        let mut map = ReplacementMap::init(&ctx, &states[1], &attacker, 1).unwrap();
        let frame = map.next().unwrap();

        let bob = mutate(&states[1], &frame, &map.constants, &ctx).unwrap().unwrap();
        assert_eq!(bob.generation, 1);
        let ga = bob.slot_of(&Constant::named("ga")).unwrap();
        assert!(ga.mutated);
        assert_eq!(ga.creator, ATTACKER);
        assert_eq!(ga.assigned.to_string(), "G^nil");
        let ss = bob.slot_of(&Constant::named("ss")).unwrap();
        assert_eq!(ss.assigned.to_string(), "G^nil^b");

        let original = states[1].slot_of(&Constant::named("ga")).unwrap();
        assert!(!original.mutated);
        assert_eq!(original.assigned.to_string(), "G^a");
    }

    #[test]
    fn frames_that_change_nothing_new_are_skipped() {
        let (ctx, states) = context(DH);
        let map = ReplacementMap::new(
            vec![Constant::named("ga")],
            vec![vec![Value::equation(vec![G.clone(), c("a")])]],
        );
        let frame = Frame {
            combination: map.replacements[0].clone(),
            last_increment: 0,
        };
        assert!(mutate(&states[1], &frame, &map.constants, &ctx).unwrap().is_none());
    }

    #[test]
    fn skipped_frames_record_no_mutation_targets() {
        let (ctx, states) = context(DH);
        ctx.attacker.put_write(G_NIL.clone(), &states[1]);
        let frame = Frame {
            combination: vec![G_NIL.clone(), p(Enc, vec![c("nil"), c("nil")])],
            last_increment: 2,
        };
        let constants = [Constant::named("ga"), Constant::named("e")];
        assert!(mutate(&states[1], &frame, &constants, &ctx).unwrap().is_none());
        assert!(ctx.attacker.read().mutated_to.iter().all(Vec::is_empty));

        let frame = Frame {
            last_increment: 0,
            ..frame
        };
        assert!(mutate(&states[1], &frame, &constants, &ctx).unwrap().is_some());
        let attacker = ctx.attacker.read();
        let i = attacker.index_of(&G_NIL).unwrap();
        assert_eq!(attacker.mutated_to[i], vec![SmolStr::from("Bob")]);
    }

    #[test]
    fn guarded_constants_are_never_replaced() {
        let (ctx, states) = context(
            r#"
attacker[active]
principal Alice[
    generates a, b
    ga = G^a
    gb = G^b
]
Alice -> Bob: [ga], gb
principal Bob[
    generates c
    s1 = ga^c
    s2 = gb^c
]
queries[ confidentiality? s1 ]
"#,
        );
        ctx.attacker.absorb_phase_values(&states[0], 0).unwrap();
        let map = ReplacementMap::init(&ctx, &states[1], &ctx.attacker.read(), 1).unwrap();
        assert_eq!(names(&map), vec!["gb"]);
    }

    #[test]
    fn failed_checks_truncate_the_principal() {
        let (ctx, states) = context(
            r#"
attacker[active]
principal Alice[
    knows private k
    knows public ad
    generates m
    e = AEAD_ENC(k, m, ad)
]
Alice -> Bob: e
principal Bob[
    knows private k
    knows public ad
    d = AEAD_DEC(k, e, ad)?
    h = HASH(d)
]
queries[ confidentiality? m ]
"#,
        );
        let forged = p(AeadEnc, vec![c("nil"), c("nil"), c("nil")]);
        let map = ReplacementMap::new(vec![Constant::named("e")], vec![vec![forged]]);
        let frame = Frame {
            combination: map.replacements[0].clone(),
            last_increment: 0,
        };
        let bob = mutate(&states[1], &frame, &map.constants, &ctx).unwrap().unwrap();
        assert!(bob.index_of(&Constant::named("d")).is_some());
        assert!(bob.index_of(&Constant::named("h")).is_none());
    }
}
