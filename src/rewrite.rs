//! Rewriting of values by the primitive rules.
//!
//! Everything here is a pure function of the value being rewritten, except
//! [`PrincipalState::perform_all_rewrites`], which applies the results to a
//! resolved state.

use std::sync::Arc;

use crate::primitive::{self, RewriteRule};
use crate::principal::PrincipalState;
use crate::value::{Equation, Primitive, Value, NIL};

/// The outcome of rewriting a single value.
#[derive(Debug, Clone)]
pub struct Rewrite {
    /// Applications whose rewrite rule did not fire.
    pub failed: Vec<Arc<Primitive>>,
    /// Whether `value` should replace the value that was rewritten.
    pub rewritten: bool,
    pub value: Value,
}

/// Whether the rule of `p` fires, and the values `p` stands for afterwards.
///
/// Primitive arguments are rewritten first. Applications without a rule, and
/// failing applications of primitives that cannot be checked, pass unchanged.
pub fn possible_to_rewrite(p: &Arc<Primitive>) -> (bool, Vec<Value>) {
    let p = with_rewritten_args(p);
    let spec = primitive::spec(p.name);
    let unchanged = || vec![Value::Primitive(p.clone())];

    if p.name.is_core() {
        return match spec.core_rule {
            Some(rule) => rule.apply(&p),
            None => (!spec.check, unchanged()),
        };
    }

    let rule = match &spec.rewrite {
        Some(rule) => rule,
        None => return (true, unchanged()),
    };
    match p.args.get(rule.from) {
        Some(Value::Primitive(inner))
            if inner.name == rule.name && rule_matches(&p, inner, rule) =>
        {
            match rule.to.apply(inner) {
                Some(v) => (true, vec![v]),
                None => (!spec.check, unchanged()),
            }
        }
        _ => (!spec.check, unchanged()),
    }
}

fn with_rewritten_args(p: &Arc<Primitive>) -> Arc<Primitive> {
    let mut changed = false;
    let args = p
        .args
        .iter()
        .map(|arg| match arg {
            Value::Primitive(inner) => {
                let (_, values) = possible_to_rewrite(inner);
                match values.into_iter().next() {
                    Some(v) => {
                        changed |= v != *arg;
                        v
                    }
                    None => arg.clone(),
                }
            }
            arg => arg.clone(),
        })
        .collect();
    if !changed {
        return p.clone();
    }
    Arc::new(Primitive {
        args,
        ..Primitive::clone(p)
    })
}

fn rewritten_if_passing(v: Value) -> Value {
    if let Value::Primitive(p) = &v {
        if let (true, values) = possible_to_rewrite(p) {
            if let Some(first) = values.into_iter().next() {
                return first;
            }
        }
    }
    v
}

/// Every matched outer argument must equal one of its candidate inner ones.
fn rule_matches(outer: &Primitive, inner: &Primitive, rule: &RewriteRule) -> bool {
    rule.matching.iter().all(|(a, candidates)| {
        candidates.iter().any(|&m| {
            let (outer_arg, inner_arg) = match (outer.args.get(*a), inner.args.get(m)) {
                (Some(o), Some(i)) => (o, i),
                _ => return false,
            };
            let filtered = match rule.filter(m).apply(outer, outer_arg) {
                Some(v) => v,
                None => return false,
            };
            let filtered = rewritten_if_passing(filtered);
            let inner_arg = rewritten_if_passing(inner_arg.clone());
            filtered.equivalent(&inner_arg, true)
        })
    })
}

/// `SHAMIR_JOIN` of two distinct shares of the same split gives back the secret.
pub fn possible_to_rebuild(p: &Primitive) -> Option<Value> {
    let spec = primitive::spec(p.name);
    if p.name.is_core() {
        return None;
    }
    let rule = spec.rebuild.as_ref()?;
    for group in rule.given {
        let has = group
            .iter()
            .filter_map(|&g| p.args.get(g))
            .filter_map(Value::as_primitive)
            .filter(|arg| arg.name == rule.name)
            .collect::<Vec<_>>();
        if has.len() < group.len() {
            continue;
        }
        let first = has[0];
        let distinct_shares = has[1..].iter().all(|other| {
            crate::value::equivalent_primitives(first, other, false)
                .map_or(false, |(o1, o2)| o1 != o2)
        });
        if distinct_shares {
            if let Some(secret) = first.args.get(rule.reveal) {
                return Some(secret.clone());
            }
        }
    }
    None
}

fn rewrite_arguments(p: &Arc<Primitive>) -> (Arc<Primitive>, Vec<Arc<Primitive>>, bool) {
    let mut failed = Vec::new();
    let mut changed = false;
    let args = p
        .args
        .iter()
        .map(|arg| {
            let r = match arg {
                Value::Constant(_) => return arg.clone(),
                Value::Primitive(inner) => rewrite_primitive(inner),
                Value::Equation(inner) => rewrite_equation(inner),
            };
            failed.extend(r.failed);
            if r.rewritten && r.value != *arg {
                changed = true;
                r.value
            } else {
                arg.clone()
            }
        })
        .collect();
    if !changed {
        return (p.clone(), failed, false);
    }
    let p = Arc::new(Primitive {
        args,
        ..Primitive::clone(p)
    });
    (p, failed, true)
}

pub fn rewrite_primitive(p: &Arc<Primitive>) -> Rewrite {
    let (mut current, mut failed, mut rewritten) = rewrite_arguments(p);

    if let Some(rebuilt) = possible_to_rebuild(&current) {
        rewritten = true;
        match rebuilt {
            Value::Primitive(q) => current = q,
            value => {
                return Rewrite {
                    failed,
                    rewritten,
                    value,
                }
            }
        }
    }

    let (root, values) = possible_to_rewrite(&current);
    let mut index = 0;
    if !root {
        if let Some(Value::Primitive(f)) = values.first() {
            failed.push(f.clone());
        }
    } else if p.name.is_core() {
        index = p.output;
    }
    match values.into_iter().nth(index) {
        Some(value) => Rewrite {
            failed,
            rewritten: rewritten || root,
            value,
        },
        None => Rewrite {
            failed,
            rewritten: true,
            value: NIL.clone(),
        },
    }
}

/// Rewrites the primitives of an equation. A primitive that rewrites to an
/// equation is spliced in.
pub fn rewrite_equation(e: &Arc<Equation>) -> Rewrite {
    let mut failed = Vec::new();
    let mut rewritten = false;
    let mut values = Vec::with_capacity(e.values.len());
    for v in &e.values {
        match v {
            Value::Constant(_) => values.push(v.clone()),
            Value::Primitive(p) => {
                if !primitive::spec(p.name).has_rule() {
                    values.push(v.clone());
                    continue;
                }
                let r = rewrite_primitive(p);
                failed.extend(r.failed);
                if !r.rewritten {
                    values.push(v.clone());
                    continue;
                }
                rewritten = true;
                match r.value {
                    Value::Equation(inner) => values.extend(inner.values.iter().cloned()),
                    value => values.push(value),
                }
            }
            Value::Equation(inner) => {
                let r = rewrite_equation(inner);
                failed.extend(r.failed);
                if r.rewritten {
                    rewritten = true;
                    values.push(r.value);
                } else {
                    values.push(v.clone());
                }
            }
        }
    }
    Rewrite {
        failed,
        rewritten,
        value: Value::equation(values),
    }
}

impl PrincipalState {
    /// Rewrites every assigned value in place and returns the applications
    /// whose rules failed, with the slot they were found in.
    pub fn perform_all_rewrites(&mut self) -> Vec<(Arc<Primitive>, usize)> {
        let mut failed = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let r = match &slot.assigned {
                Value::Constant(_) => continue,
                Value::Primitive(p) => rewrite_primitive(p),
                Value::Equation(e) => rewrite_equation(e),
            };
            failed.extend(r.failed.into_iter().map(|p| (p, i)));
            if !r.rewritten {
                continue;
            }
            if slot.assigned != r.value {
                slot.rewritten = true;
            }
            if !slot.mutated {
                slot.before_mutate = r.value.clone();
            }
            slot.assigned = r.value;
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::PrimitiveName::*;
    use crate::value::tests::{c, eq, p};
    use crate::value::{Constant, G};

    fn checked(v: Value) -> Arc<Primitive> {
        let p = v.as_primitive().unwrap();
        Arc::new(Primitive {
            check: true,
            ..Primitive::clone(p)
        })
    }

    fn prim(v: &Value) -> &Arc<Primitive> {
        v.as_primitive().unwrap()
    }

    #[test]
    fn aead_round_trip() {
        let enc = p(AeadEnc, vec![c("k"), c("m"), c("ad")]);
        let dec = p(AeadDec, vec![c("k"), enc.clone(), c("ad")]);
        let r = rewrite_primitive(prim(&dec));
        assert!(r.rewritten);
        assert!(r.failed.is_empty());
        assert_eq!(r.value, c("m"));

        let wrong = p(AeadDec, vec![c("k2"), enc, c("ad")]);
        let r = rewrite_primitive(prim(&wrong));
        assert!(!r.rewritten);
        assert_eq!(r.failed.len(), 1);
        assert_eq!(r.value, wrong);
    }

    #[test]
    fn unchecked_failures_pass_unchanged() {
        let dec = p(Dec, vec![c("k"), p(Enc, vec![c("k2"), c("m")])]);
        let (ok, values) = possible_to_rewrite(prim(&dec));
        assert!(ok);
        assert_eq!(values, vec![dec]);
    }

    #[test]
    fn signatures_verify_to_nil() {
        let gk = eq(vec![G.clone(), c("k")]);
        let sig = p(Sign, vec![c("k"), c("m")]);
        let verif = p(SignVerif, vec![gk.clone(), c("m"), sig.clone()]);
        assert_eq!(rewrite_primitive(prim(&verif)).value, *NIL);

        let forged = p(SignVerif, vec![gk, c("m2"), sig]);
        let r = rewrite_primitive(&checked(forged));
        assert_eq!(r.failed.len(), 1);
        assert!(r.failed[0].check);
    }

    #[test]
    fn pke_uses_public_key() {
        let gk = eq(vec![G.clone(), c("k")]);
        let enc = p(PkeEnc, vec![gk, c("m")]);
        let dec = p(PkeDec, vec![c("k"), enc]);
        assert_eq!(rewrite_primitive(prim(&dec)).value, c("m"));
    }

    #[test]
    fn ring_signatures_accept_any_member_order() {
        let gk = |k| eq(vec![G.clone(), c(k)]);
        let sig = p(RingSign, vec![c("ka"), gk("kb"), gk("kc"), c("m")]);
        let verif = p(
            RingSignVerif,
            vec![gk("kb"), gk("ka"), gk("kc"), c("m"), sig],
        );
        let (ok, values) = possible_to_rewrite(prim(&verif));
        assert!(ok);
        assert_eq!(values, vec![NIL.clone()]);
    }

    #[test]
    fn unblinding() {
        let blinded = p(Blind, vec![c("k"), c("m")]);
        let sig = p(Sign, vec![c("a"), blinded]);
        let unblind = p(Unblind, vec![c("k"), c("m"), sig]);
        let r = rewrite_primitive(prim(&unblind));
        assert_eq!(r.value, p(Sign, vec![c("a"), c("m")]));
    }

    #[test]
    fn split_picks_output() {
        let concat = p(Concat, vec![c("a"), c("b"), c("c")]);
        let split = Arc::new(Primitive {
            name: Split,
            args: vec![concat],
            output: 2,
            check: false,
        });
        assert_eq!(rewrite_primitive(&split).value, c("c"));

        let out_of_range = Arc::new(Primitive {
            output: 4,
            ..Primitive::clone(&split)
        });
        assert_eq!(rewrite_primitive(&out_of_range).value, *NIL);
    }

    #[test]
    fn assert_only_passes_on_equal_arguments() {
        let ok = p(Assert, vec![p(Hash, vec![c("a")]), p(Hash, vec![c("a")])]);
        assert!(rewrite_primitive(prim(&ok)).failed.is_empty());
        let bad = p(Assert, vec![c("a"), c("b")]);
        assert_eq!(rewrite_primitive(prim(&bad)).failed.len(), 1);
    }

    #[test]
    fn shamir_shares_rebuild_the_secret() {
        let share = |output| {
            Value::from(Primitive {
                name: ShamirSplit,
                args: vec![c("k")],
                output,
                check: false,
            })
        };
        let join = p(ShamirJoin, vec![share(0), share(2)]);
        assert_eq!(rewrite_primitive(prim(&join)).value, c("k"));

        let same = p(ShamirJoin, vec![share(1), share(1)]);
        assert!(possible_to_rebuild(prim(&same)).is_none());
    }

    #[test]
    fn nested_failures_surface() {
        let bad = checked(p(AeadDec, vec![c("k"), c("x"), c("ad")]));
        let outer = p(Hash, vec![p(Enc, vec![c("k"), Value::Primitive(bad)])]);
        let r = rewrite_primitive(prim(&outer));
        assert_eq!(r.failed.len(), 1);
    }

    #[test]
    fn equations_splice_rewritten_members() {
        let gx = eq(vec![G.clone(), c("x")]);
        let dec = p(Dec, vec![c("k"), p(Enc, vec![c("k"), gx])]);
        let e = Arc::new(Equation {
            values: vec![dec, c("y")],
        });
        let r = rewrite_equation(&e);
        assert!(r.rewritten);
        assert_eq!(r.value.to_string(), "G^x^y");

        let hashed = Arc::new(Equation {
            values: vec![G.clone(), p(Hash, vec![c("a")])],
        });
        let r = rewrite_equation(&hashed);
        assert!(!r.rewritten);
        assert_eq!(r.value.to_string(), "G^HASH(a)");
    }

    #[test]
    fn state_rewrites_are_idempotent() {
        let states = crate::principal::tests::states(
            r#"
attacker[passive]
principal Alice[ knows private k generates m e = AEAD_ENC(k, m, nil) ]
Alice -> Bob: e
principal Bob[ knows private k d = AEAD_DEC(k, e, nil)? ]
queries[ confidentiality? m ]
"#,
        );
        let mut bob = states[1].resolve_all().unwrap();
        assert!(bob.perform_all_rewrites().is_empty());
        let d = bob.index_of(&Constant::named("d")).unwrap();
        assert!(bob.slots[d].rewritten);
        assert_eq!(bob.slots[d].assigned, c("m"));
        assert_eq!(bob.slots[d].before_mutate, c("m"));

        let once = bob.clone();
        assert!(bob.perform_all_rewrites().is_empty());
        for (a, b) in once.slots.iter().zip(&bob.slots) {
            assert_eq!(a.assigned, b.assigned);
        }
    }
}
