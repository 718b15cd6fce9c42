//! Checks each unresolved query against an analysed principal state.

use smol_str::SmolStr;
use verisym_parse::ast::{Ident, Query, QueryKind, QueryMessage};

use crate::attacker::AttackerState;
use crate::context::Context;
use crate::error::InternalError;
use crate::info::{mutated_values, result_summary};
use crate::knowledge::ATTACKER;
use crate::possible::{
    possible_to_force_rewrite, possible_to_recompose, possible_to_reconstruct_primitive,
};
use crate::primitive;
use crate::principal::PrincipalState;
use crate::results::{QueryOptionResult, VerifyResult};
use crate::rewrite::possible_to_rewrite;
use crate::value::{Constant, Value};

pub fn resolve_queries(state: &PrincipalState, ctx: &Context) -> Result<(), InternalError> {
    let attacker = ctx.attacker.read();
    for (index, result) in ctx.results.read().into_iter().enumerate() {
        if result.resolved {
            continue;
        }
        let query = &result.query;
        let attacked = match query.kind {
            QueryKind::Confidentiality => confidentiality(query, state, &attacker, ctx),
            QueryKind::Authentication => authentication(query, state, &attacker, ctx),
            QueryKind::Freshness => freshness(query, state, ctx)?,
            QueryKind::Unlinkability => unlinkability(query, state, &attacker, ctx)?,
        };
        if let Some(attacked) = attacked {
            if ctx.results.put_write(index, attacked.clone()) {
                tracing::info!("{} — {}", attacked.query, attacked.summary);
            }
        }
    }
    Ok(())
}

/// The declared constant named by `ident`.
fn constant(ctx: &Context, ident: &Ident<SmolStr>) -> Constant {
    ctx.km
        .slots
        .get(ident.as_str())
        .map(|slot| slot.constant.clone())
        .unwrap_or_else(|| Constant::named(ident.0.clone()))
}

fn attacked(
    query: &Query<SmolStr>,
    state: &PrincipalState,
    ctx: &Context,
    mutated: &str,
    summary: &str,
) -> VerifyResult {
    let options = preconditions(query, state, ctx);
    VerifyResult {
        query: query.clone(),
        resolved: true,
        summary: result_summary(mutated, summary, &options),
        options,
    }
}

fn confidentiality(
    query: &Query<SmolStr>,
    state: &PrincipalState,
    attacker: &AttackerState,
    ctx: &Context,
) -> Option<VerifyResult> {
    let c = constant(ctx, query.constants.first()?);
    // A replaced slot holds the attacker's own value, so fall back to the
    // declared one there.
    let v = match state.slot_of(&c) {
        Some(slot) if !slot.mutated => slot.assigned.clone(),
        _ => ctx.km.resolve_internal_values(&Value::Constant(c.clone())).0,
    };
    let ii = attacker.index_of(&v)?;
    let mutated = mutated_values(&ctx.km, &attacker.provenance[ii]);
    let summary = format!("{} ({}) is obtained by Attacker.", c, attacker.known[ii]);
    Some(attacked(query, state, ctx, &mutated, &summary))
}

/// Attacked when the recipient accepts the constant from someone other than
/// the declared sender and goes on to use it in a primitive that passes.
/// A check the attacker can only pass by forging it with leaked keys counts
/// as a forced pass. That breaks authentication of unguarded constants only,
/// whoever sent them.
fn authentication(
    query: &Query<SmolStr>,
    state: &PrincipalState,
    attacker: &AttackerState,
    ctx: &Context,
) -> Option<VerifyResult> {
    let message = query.message.as_ref()?;
    if state.name != message.recipient.as_str() {
        return None;
    }
    let c = constant(ctx, message.constants.first()?);
    let i = state.index_of(&c)?;
    let sender = state.slots[i].sender.clone();
    if sender == ATTACKER
        && state.slots[i]
            .before_mutate
            .equivalent(&state.slots[i].assigned, true)
    {
        return None;
    }
    let guarded = state.slots[i].info.guard;
    let honest_sender = sender.as_str() == message.sender.as_str();
    if honest_sender && guarded {
        return None;
    }

    for declared in ctx.km.slots.values() {
        if declared.creator != state.name || !matches!(declared.assigned, Value::Primitive(_)) {
            continue;
        }
        if !ctx.km.find_constant_in_primitive(&c, &declared.assigned) {
            continue;
        }
        let j = state.index_of(&declared.constant)?;
        let b = &state.slots[j].before_rewrite;
        let bp = match b {
            Value::Primitive(bp) => bp,
            _ => continue,
        };
        let forced = if !primitive::spec(bp.name).has_rule() || possible_to_rewrite(bp).0 {
            false
        } else if possible_to_force_rewrite(bp, &attacker.known) {
            true
        } else {
            continue;
        };
        if (forced && guarded) || (honest_sender && !forced) {
            continue;
        }
        let (resolved, _) = state.resolve_constant(&c);
        let mut summary = format!(
            "{} ({}), sent by {} and not by {}, is successfully used in {} within {}'s state.",
            c, resolved, sender, message.sender, b, message.recipient
        );
        if forced {
            summary.push_str(" (forced pass)");
        }
        let mutated = mutated_values(&ctx.km, state);
        return Some(attacked(query, state, ctx, &mutated, &summary));
    }
    None
}

fn freshness(
    query: &Query<SmolStr>,
    state: &PrincipalState,
    ctx: &Context,
) -> Result<Option<VerifyResult>, InternalError> {
    let c = match query.constants.first() {
        Some(ident) => constant(ctx, ident),
        None => return Ok(None),
    };
    if state.contains_fresh(&Value::Constant(c.clone()), &c)? {
        return Ok(None);
    }
    let (resolved, _) = state.resolve_constant(&c);
    let summary = format!(
        "{} ({}) is not a fresh value. If used as a message, it could be replayed, leading to potential replay attacks.",
        c, resolved
    );
    let mutated = mutated_values(&ctx.km, state);
    Ok(Some(attacked(query, state, ctx, &mutated, &summary)))
}

/// Unlinkability over values: every constant must be fresh, and no two may
/// be the same primitive output the attacker can produce.
fn unlinkability(
    query: &Query<SmolStr>,
    state: &PrincipalState,
    attacker: &AttackerState,
    ctx: &Context,
) -> Result<Option<VerifyResult>, InternalError> {
    let constants = query
        .constants
        .iter()
        .map(|ident| constant(ctx, ident))
        .collect::<Vec<_>>();
    for c in &constants {
        if state.contains_fresh(&Value::Constant(c.clone()), c)? {
            continue;
        }
        let (resolved, _) = state.resolve_constant(c);
        let summary = format!(
            "{} ({}) cannot be a suitable unlinkability candidate since it does not satisfy freshness.",
            c, resolved
        );
        let mutated = mutated_values(&ctx.km, state);
        return Ok(Some(attacked(query, state, ctx, &mutated, &summary)));
    }

    let assigned = constants
        .iter()
        .map(|c| {
            state
                .slot_of(c)
                .map_or_else(|| Value::Constant(c.clone()), |slot| slot.assigned.clone())
        })
        .collect::<Vec<_>>();
    for (i, a) in assigned.iter().enumerate() {
        for (ii, aa) in assigned.iter().enumerate() {
            if i == ii || !a.equivalent(aa, false) {
                continue;
            }
            let obtainable = match a {
                Value::Primitive(p) => {
                    possible_to_reconstruct_primitive(p, &attacker.known).is_some()
                        || possible_to_recompose(p, &attacker.known).is_some()
                }
                _ => false,
            };
            if !obtainable {
                continue;
            }
            let summary = format!(
                "{} and {} are not unlinkable since they are the output of the same primitive ({}), which can be obtained by Attacker.",
                constants[i], constants[ii], a
            );
            let mutated = mutated_values(&ctx.km, state);
            return Ok(Some(attacked(query, state, ctx, &mutated, &summary)));
        }
    }
    Ok(None)
}

/// A precondition is contradicted when its recipient got the constant from
/// its sender in `state`.
fn preconditions(
    query: &Query<SmolStr>,
    state: &PrincipalState,
    ctx: &Context,
) -> Vec<QueryOptionResult> {
    query
        .options
        .iter()
        .map(|option| {
            let message = &option.message;
            let contradicted = message
                .constants
                .first()
                .and_then(|ident| state.slot_of(&constant(ctx, ident)))
                .and_then(|slot| {
                    slot.info
                        .known_by
                        .iter()
                        .find(|(recipient, _)| recipient.as_str() == message.recipient.as_str())
                })
                .map_or(false, |(_, sender)| sender.as_str() == message.sender.as_str());
            QueryOptionResult {
                option: format!("precondition[{}]", message),
                resolved: contradicted,
                summary: if contradicted {
                    contradiction(message)
                } else {
                    String::new()
                },
            }
        })
        .collect()
}

fn contradiction(message: &QueryMessage<SmolStr>) -> String {
    format!(
        "{} sends {} to {} despite the query being contradicted.",
        message.sender,
        message.constants.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
        message.recipient
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::replacement::{mutate, ReplacementMap};

    static SIGNED: &str = r#"
attacker[active]
principal Alice[
    knows private sk
    generates m
    pk = G^sk
    s = SIGN(sk, m)
]
Alice -> Bob: pk
Alice -> Bob: m, s
principal Bob[
    generates n
    v = SIGNVERIF(pk, m, s)?
    h = HASH(m, n)
]
queries[
    authentication? Alice -> Bob: m
    freshness? pk
    freshness? n
    unlinkability? m, pk
]
"#;

    #[test]
    fn honest_runs_authenticate() {
        let (ctx, states) = context(SIGNED);
        let bob = states[1].resolve_all().unwrap();
        resolve_queries(&bob, &ctx).unwrap();
        let results = ctx.results.read();
        assert!(!results[0].resolved);
        assert!(results[1].resolved);
        assert!(results[1]
            .summary
            .contains("pk (G^sk) is not a fresh value."));
        assert!(!results[2].resolved);
        assert!(results[3].resolved);
        assert!(results[3]
            .summary
            .contains("pk (G^sk) cannot be a suitable unlinkability candidate"));
    }

    #[test]
    fn accepted_forgeries_break_authentication() {
        let (ctx, states) = context(
            r#"
attacker[active]
principal Alice[
    knows private k
    generates m
    h = MAC(k, m)
]
Alice -> Bob: m, h
principal Bob[
    knows private k
    x = HASH(m)
]
queries[ authentication? Alice -> Bob: m[ precondition[Alice -> Bob: h] ] ]
"#,
        );
        let map = ReplacementMap::init(&ctx, &states[1], &ctx.attacker.read(), 1).unwrap();
        assert!(map.is_empty(), "the attacker has not seen the wire yet");

        ctx.attacker.absorb_phase_values(&states[0], 0).unwrap();
        let mut map = ReplacementMap::init(&ctx, &states[1], &ctx.attacker.read(), 1).unwrap();
        let m = map.constants.iter().position(|c| c.name == "m").unwrap();
        let frame = map.next().unwrap();
        assert!(frame.combination[m].to_string() == "nil");
        let bob = mutate(&states[1], &frame, &map.constants, &ctx).unwrap().unwrap();
        resolve_queries(&bob, &ctx).unwrap();

        let result = &ctx.results.read()[0];
        assert!(result.resolved);
        assert!(result.summary.contains("m → nil (mutated by attacker)"));
        assert!(result
            .summary
            .contains("m (nil), sent by Attacker and not by Alice, is successfully used in HASH(nil) within Bob's state."));
        assert!(!result.summary.contains("forced pass"));
        assert_eq!(result.options.len(), 1);
        assert!(result.options[0].resolved);
        assert!(result
            .summary
            .contains("Alice sends h to Bob despite the query being contradicted."));
    }

    #[test]
    fn other_recipients_are_ignored() {
        let (ctx, states) = context(SIGNED);
        let query = ctx.results.read()[0].query.clone();
        let mut alice = states[0].clone();
        let m = alice.index_of(&Constant::named("m")).unwrap();
        alice.slots[m].sender = ATTACKER.into();
        assert!(authentication(&query, &alice, &ctx.attacker.read(), &ctx).is_none());
    }
}
