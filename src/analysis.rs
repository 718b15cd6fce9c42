//! Saturates the attacker's knowledge against one principal state, then
//! checks the queries against the result.

use itertools::Itertools;

use crate::attacker::AttackerState;
use crate::context::Context;
use crate::error::InternalError;
use crate::info::output_text;
use crate::possible::{
    possible_to_decompose, possible_to_obtain_passwords, possible_to_passively_decompose,
    possible_to_recompose, possible_to_reconstruct_equation, possible_to_reconstruct_primitive,
};
use crate::primitive::PrimitiveName;
use crate::principal::PrincipalState;
use crate::query::resolve_queries;
use crate::results::AnalysisCounter;
use crate::value::Value;

/// Runs deductions until a full pass learns nothing, then resolves queries.
pub fn analysis(state: &PrincipalState, ctx: &Context, stage: u32) -> Result<(), InternalError> {
    while deduce(state, &ctx.attacker.read(), ctx)? {}
    let n = ctx.counter.increment();
    if AnalysisCounter::should_report(n) {
        tracing::debug!("Stage {}, Analysis {}...", stage, n);
    }
    resolve_queries(state, ctx)
}

/// One pass. Stops at the first value learned and returns whether there was one.
fn deduce(
    state: &PrincipalState,
    attacker: &AttackerState,
    ctx: &Context,
) -> Result<bool, InternalError> {
    for a in &attacker.known {
        if resolve(a, state, ctx)?
            || decompose(a, state, attacker, ctx)
            || passively_decompose(a, state, ctx)
        {
            return Ok(true);
        }
    }
    for slot in &state.slots {
        if reconstruct(&slot.assigned, state, attacker, ctx)
            || recompose(&slot.assigned, state, attacker, ctx)
        {
            return Ok(true);
        }
    }
    for a in &attacker.known {
        if equivalize(a, state, ctx) || passwords(a, state, ctx) || concat(a, state, ctx) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn learn(revealed: &Value, state: &PrincipalState, ctx: &Context) -> bool {
    ctx.attacker.put_write(revealed.clone(), state)
}

fn resolve(a: &Value, state: &PrincipalState, ctx: &Context) -> Result<bool, InternalError> {
    let c = match a {
        Value::Constant(c) => c,
        _ => return Ok(false),
    };
    let i = match state.index_of(c) {
        Some(i) => i,
        None => return Ok(false),
    };
    let resolved = state.resolve_value(a, i, false)?;
    if learn(&resolved, state, ctx) {
        tracing::debug!("{} obtained by resolving {}.", output_text(&resolved), c);
        return Ok(true);
    }
    Ok(false)
}

fn decompose(a: &Value, state: &PrincipalState, attacker: &AttackerState, ctx: &Context) -> bool {
    let p = match a {
        Value::Primitive(p) => p,
        _ => return false,
    };
    match possible_to_decompose(p, &attacker.known) {
        Some((revealed, used)) if learn(&revealed, state, ctx) => {
            tracing::debug!(
                "{} obtained by decomposing {} with {}.",
                output_text(&revealed),
                a,
                used.iter().format(", ")
            );
            true
        }
        _ => false,
    }
}

fn passively_decompose(a: &Value, state: &PrincipalState, ctx: &Context) -> bool {
    let p = match a {
        Value::Primitive(p) => p,
        _ => return false,
    };
    let mut learned = false;
    for revealed in possible_to_passively_decompose(p) {
        if learn(&revealed, state, ctx) {
            tracing::debug!(
                "{} obtained as associated data of {}.",
                output_text(&revealed),
                a
            );
            learned = true;
        }
    }
    learned
}

fn recompose(a: &Value, state: &PrincipalState, attacker: &AttackerState, ctx: &Context) -> bool {
    let p = match a {
        Value::Primitive(p) => p,
        _ => return false,
    };
    match possible_to_recompose(p, &attacker.known) {
        Some((revealed, used)) if learn(&revealed, state, ctx) => {
            tracing::debug!(
                "{} obtained by recomposing {} with {}.",
                output_text(&revealed),
                a,
                used.iter().format(", ")
            );
            true
        }
        _ => false,
    }
}

/// Arguments first, so that nested applications are learned before the
/// application that contains them.
fn reconstruct(a: &Value, state: &PrincipalState, attacker: &AttackerState, ctx: &Context) -> bool {
    let used = match a {
        Value::Constant(_) => return false,
        Value::Primitive(p) => {
            if p.args.iter().any(|arg| reconstruct(arg, state, attacker, ctx)) {
                return true;
            }
            if p.name.is_core() {
                return false;
            }
            possible_to_reconstruct_primitive(p, &attacker.known)
        }
        Value::Equation(e) => possible_to_reconstruct_equation(e, &attacker.known),
    };
    match used {
        Some(used) if learn(a, state, ctx) => {
            tracing::debug!(
                "{} obtained by reconstructing with {}.",
                output_text(a),
                used.iter().format(", ")
            );
            true
        }
        _ => false,
    }
}

fn equivalize(a: &Value, state: &PrincipalState, ctx: &Context) -> bool {
    let resolved = match a {
        Value::Constant(c) => state.resolve_constant(c).0,
        a => a.clone(),
    };
    let mut learned = false;
    for slot in &state.slots {
        if resolved.equivalent(&slot.assigned, true) && learn(&slot.assigned, state, ctx) {
            tracing::debug!(
                "{} obtained by equivalizing with the current resolution of {}.",
                output_text(&slot.assigned),
                a
            );
            learned = true;
        }
    }
    learned
}

fn passwords(a: &Value, state: &PrincipalState, ctx: &Context) -> bool {
    let mut learned = false;
    for revealed in possible_to_obtain_passwords(a, state) {
        if learn(&revealed, state, ctx) {
            tracing::debug!(
                "{} obtained as a password unsafely used within {}.",
                output_text(&revealed),
                a
            );
            learned = true;
        }
    }
    learned
}

fn concat(a: &Value, state: &PrincipalState, ctx: &Context) -> bool {
    let p = match a {
        Value::Primitive(p) if p.name == PrimitiveName::Concat => p,
        _ => return false,
    };
    let mut learned = false;
    for revealed in &p.args {
        if learn(revealed, state, ctx) {
            tracing::debug!(
                "{} obtained as a concatenated fragment of {}.",
                output_text(revealed),
                a
            );
            learned = true;
        }
    }
    learned
}
