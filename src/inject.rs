//! Forging primitive applications out of what the attacker knows.

use std::sync::Arc;

use itertools::Itertools;

use crate::context::Context;
use crate::primitive;
use crate::principal::PrincipalState;
use crate::value::{push_unique, Primitive, Value, NIL};

/// Upper bound on the applications forged for one primitive.
pub const MAX_INJECTANTS: usize = 8192;

/// `p` with every constant and equation argument replaced by `nil`.
pub fn skeleton(p: &Primitive) -> Primitive {
    Primitive {
        name: p.name,
        args: p
            .args
            .iter()
            .map(|a| match a {
                Value::Primitive(inner) => Value::from(skeleton(inner)),
                _ => NIL.clone(),
            })
            .collect(),
        output: p.output,
        check: false,
    }
}

pub fn matches_skeleton(p: &Primitive, skeleton_of: &Primitive) -> bool {
    p.name == skeleton_of.name
        && Value::from(skeleton(p)).equivalent(&Value::from(skeleton_of.clone()), true)
}

/// Gives the attacker the skeleton of `p` and of each primitive inside it,
/// unless it already holds something of that shape.
pub fn inject_missing_skeletons(p: &Primitive, state: &PrincipalState, ctx: &Context) {
    let s = skeleton(p);
    let held = ctx
        .attacker
        .read()
        .known
        .iter()
        .filter_map(Value::as_primitive)
        .any(|k| matches_skeleton(k, &s));
    if !held {
        let known = Value::from(s);
        if ctx.attacker.put_write(known.clone(), state) {
            tracing::debug!("Constructed skeleton {}.", known);
        }
    }
    for arg in &p.args {
        if let Value::Primitive(inner) = arg {
            inject_missing_skeletons(inner, state, ctx);
        }
    }
}

/// Stages 0 and 1 forge nothing; stage 2 forges everything but explosive
/// primitives.
pub fn stage_restricted(p: &Primitive, stage: u32) -> bool {
    match stage {
        0 | 1 => true,
        2 => primitive::spec(p.name).explosive,
        _ => false,
    }
}

/// Every application of `p`'s primitive the attacker can build with
/// arguments shaped like `p`'s.
pub fn inject(
    p: &Arc<Primitive>,
    root: Option<&Arc<Primitive>>,
    state: &PrincipalState,
    ctx: &Context,
    stage: u32,
) -> Vec<Value> {
    if ctx.results.all_resolved() || !primitive::spec(p.name).injectable {
        return Vec::new();
    }
    let root = root.unwrap_or(p);
    if stage_restricted(p, stage) {
        return Vec::new();
    }
    inject_missing_skeletons(p, state, ctx);

    let attacker = ctx.attacker.read();
    let mut candidates = vec![Vec::new(); p.args.len()];
    for (arg, candidates) in candidates.iter_mut().enumerate() {
        for k in &attacker.known {
            let k = match k {
                Value::Constant(c) => match state.index_of(c) {
                    Some(i) => state.slots[i].assigned.clone(),
                    None => continue,
                },
                k => k.clone(),
            };
            if !admissible(&k, arg, p, root, stage) {
                continue;
            }
            if let Value::Primitive(kp) = &k {
                if stage >= 3 {
                    for nested in inject(kp, Some(root), state, ctx, stage) {
                        push_unique(candidates, nested);
                    }
                }
            }
            push_unique(candidates, k);
        }
    }

    let mut injectants = Vec::new();
    for args in candidates.into_iter().multi_cartesian_product() {
        if injectants.len() >= MAX_INJECTANTS {
            tracing::warn!(
                "Injection for {} truncated at {} candidates.",
                p.name,
                MAX_INJECTANTS
            );
            break;
        }
        let forged = Value::from(Primitive {
            name: p.name,
            args,
            output: p.output,
            check: p.check,
        });
        if tracing::enabled!(tracing::Level::TRACE) {
            ctx.attacker.put_conceivable(forged.clone());
        }
        push_unique(&mut injectants, forged);
    }
    injectants
}

/// Whether `k` may stand in for argument `arg` of `p`.
fn admissible(
    k: &Value,
    arg: usize,
    p: &Arc<Primitive>,
    root: &Arc<Primitive>,
    stage: u32,
) -> bool {
    let own = Value::Primitive(p.clone());
    let root = Value::Primitive(root.clone());
    if k.equivalent(&own, true) || k.equivalent(&root, true) {
        return false;
    }
    match (k, &p.args[arg]) {
        (Value::Constant(c), Value::Constant(_)) => !c.is_g(),
        (Value::Primitive(kp), Value::Primitive(target)) => {
            !stage_restricted(kp, stage) && matches_skeleton(kp, &skeleton(target))
        }
        (Value::Equation(ke), Value::Equation(target)) => {
            ke.values.len() == target.values.len()
                && ke
                    .values
                    .iter()
                    .zip(&target.values)
                    .all(|(a, b)| a.kind() == b.kind())
        }
        _ => false,
    }
}
