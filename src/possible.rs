//! Deduction predicates over the attacker's knowledge.
//!
//! Each predicate answers whether one more value can be derived from the
//! values the attacker already holds. None of them change the knowledge;
//! the analysis pass decides what to add.

use std::sync::Arc;

use crate::primitive::{self, PrimitiveName};
use crate::principal::PrincipalState;
use crate::rewrite::possible_to_rewrite;
use crate::value::{find_equivalent, equivalent_primitives, Equation, Primitive, Value, G};
use verisym_parse::ast::Qualifier;

fn is_known(v: &Value, known: &[Value]) -> bool {
    find_equivalent(v, known).is_some()
}

/// Whether `a` is held or can be built again from what is held.
fn obtainable(a: &Value, known: &[Value]) -> bool {
    if is_known(a, known) {
        return true;
    }
    match a {
        Value::Constant(_) => false,
        Value::Primitive(p) => {
            possible_to_reconstruct_primitive(p, known).is_some()
                || possible_to_decompose(p, known).is_some()
        }
        Value::Equation(e) => possible_to_reconstruct_equation(e, known).is_some(),
    }
}

/// Opening `p` with its given arguments reveals one argument. Returns the
/// revealed value and the arguments used to get it.
pub fn possible_to_decompose(p: &Primitive, known: &[Value]) -> Option<(Value, Vec<Value>)> {
    if p.name.is_core() {
        return None;
    }
    let rule = primitive::spec(p.name).decompose.as_ref()?;
    let mut has = Vec::new();
    for (position, &g) in rule.given.iter().enumerate() {
        let a = match p.args.get(g) {
            Some(a) => a,
            None => continue,
        };
        let a = match rule.filter(position).apply(p, a) {
            Some(a) => a,
            None => continue,
        };
        if obtainable(&a, known) {
            has.push(a);
        }
    }
    if has.len() >= rule.given.len() {
        let revealed = p.args.get(rule.reveal)?.clone();
        return Some((revealed, has));
    }
    None
}

/// Arguments of `p` the attacker reads without holding any key.
pub fn possible_to_passively_decompose(p: &Primitive) -> Vec<Value> {
    if p.name.is_core() {
        return Vec::new();
    }
    match primitive::spec(p.name).decompose.as_ref() {
        Some(rule) => rule
            .passive_reveal
            .iter()
            .filter_map(|&i| p.args.get(i).cloned())
            .collect(),
        None => Vec::new(),
    }
}

/// Enough outputs of a multi-output application reveal its input.
pub fn possible_to_recompose(p: &Primitive, known: &[Value]) -> Option<(Value, Vec<Value>)> {
    if p.name.is_core() {
        return None;
    }
    let rule = primitive::spec(p.name).recompose.as_ref()?;
    for group in rule.given {
        let mut outputs = Vec::new();
        for &output in group.iter() {
            let held = known.iter().find(|v| match v {
                Value::Primitive(v) => {
                    v.output == output && equivalent_primitives(p, v, false).is_some()
                }
                _ => false,
            });
            if let Some(v) = held {
                outputs.push(v.clone());
            }
            if outputs.len() >= group.len() {
                let revealed = p.args.get(rule.reveal)?.clone();
                return Some((revealed, outputs));
            }
        }
    }
    None
}

/// Every argument is obtainable, so the attacker can apply `p` themself.
pub fn possible_to_reconstruct_primitive(p: &Arc<Primitive>, known: &[Value]) -> Option<Vec<Value>> {
    if !possible_to_rewrite(p).0 {
        return None;
    }
    p.args
        .iter()
        .all(|a| obtainable(a, known))
        .then(|| p.args.clone())
}

/// `G^a^b` can be built from `a` and `b`, or from `a` and `G^b`, or from `G^a`
/// and `b`.
pub fn possible_to_reconstruct_equation(e: &Equation, known: &[Value]) -> Option<Vec<Value>> {
    match e.values.as_slice() {
        [] | [_] => None,
        [_, s] => is_known(s, known).then(|| vec![s.clone()]),
        [_, s0, s1, ..] => {
            let g = |s: &Value| Value::equation(vec![G.clone(), s.clone()]);
            let (hs0, hs1) = (is_known(s0, known), is_known(s1, known));
            if hs0 && hs1 {
                return Some(vec![s0.clone(), s1.clone()]);
            }
            let (g0, g1) = (g(s0), g(s1));
            if hs0 && is_known(&g1, known) {
                return Some(vec![s0.clone(), g1]);
            }
            if is_known(&g0, known) && hs1 {
                return Some(vec![g0, s1.clone()]);
            }
            None
        }
    }
}

/// A failing check the attacker can still make pass, because they hold the
/// key it opens with. Signature checks need the secret behind the public key.
pub fn possible_to_force_rewrite(p: &Primitive, known: &[Value]) -> bool {
    match p.name {
        PrimitiveName::AeadDec | PrimitiveName::Dec | PrimitiveName::PkeDec => {
            p.args.first().map_or(false, |k| obtainable(k, known))
        }
        PrimitiveName::SignVerif => match p.args.first() {
            Some(Value::Equation(pk)) if pk.values.len() == 2 => obtainable(&pk.values[1], known),
            Some(pk) => obtainable(pk, known),
            None => false,
        },
        _ => false,
    }
}

/// Passwords in `a` that are not protected by a password hashing primitive.
///
/// A password is protected when its immediate parent is a primitive that
/// hashes passwords at that argument position.
pub fn possible_to_obtain_passwords(a: &Value, state: &PrincipalState) -> Vec<Value> {
    let mut passwords = Vec::new();
    collect_passwords(a, None, state, &mut passwords);
    passwords
}

fn collect_passwords(
    a: &Value,
    parent: Option<(PrimitiveName, usize)>,
    state: &PrincipalState,
    passwords: &mut Vec<Value>,
) {
    match a {
        Value::Constant(c) => {
            let (resolved, _) = state.resolve_constant(c);
            let password = match &resolved {
                Value::Constant(r) => r.qualifier == Some(Qualifier::Password),
                _ => false,
            };
            let hashed = parent
                .map(|(name, i)| primitive::spec(name).hashes_password_at(i))
                .unwrap_or(false);
            if password && !hashed {
                crate::value::push_unique(passwords, resolved);
            }
        }
        Value::Primitive(p) => {
            for (i, arg) in p.args.iter().enumerate() {
                collect_passwords(arg, Some((p.name, i)), state, passwords);
            }
        }
        Value::Equation(e) => {
            for v in &e.values {
                collect_passwords(v, None, state, passwords);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::PrimitiveName::*;
    use crate::value::tests::{c, eq, p};
    use crate::value::Constant;

    fn prim(v: &Value) -> &Arc<Primitive> {
        v.as_primitive().unwrap()
    }

    /// `knowledge` is what the attacker holds; each goal is tried against it.
    macro_rules! scenario {
        (knowledge: [$($k:expr),* $(,)?]; derives: [$($yes:expr),* $(,)?]; blocked: [$($no:expr),* $(,)?];) => {
            let known: Vec<Value> = vec![$($k),*];
            $(
                assert!(obtainable(&$yes, &known), "expected to derive {}", $yes);
            )*
            $(
                assert!(!obtainable(&$no, &known), "derived {} unexpectedly", $no);
            )*
        };
    }

    #[test]
    fn symmetric_encryption() {
        scenario! {
            knowledge: [c("k"), c("m")];
            derives: [
                p(Enc, vec![c("k"), c("m")]),
                p(Hash, vec![c("k"), c("m")]),
            ];
            blocked: [
                p(Enc, vec![c("k2"), c("m")]),
                c("k2"),
            ];
        }
    }

    #[test]
    fn nested_reconstruction() {
        scenario! {
            knowledge: [c("a"), p(Hash, vec![c("b")])];
            derives: [
                p(Enc, vec![c("a"), p(Hash, vec![c("b")])]),
                p(Mac, vec![p(Hash, vec![c("b")]), c("a")]),
            ];
            blocked: [
                p(Hash, vec![c("b"), c("a")]),
            ];
        }
    }

    #[test]
    fn diffie_hellman() {
        let ga = eq(vec![G.clone(), c("a")]);
        let gb = eq(vec![G.clone(), c("b")]);
        scenario! {
            knowledge: [ga.clone(), c("b")];
            derives: [
                eq(vec![G.clone(), c("a"), c("b")]),
                eq(vec![G.clone(), c("b"), c("a")]),
                gb.clone(),
            ];
            blocked: [
                c("a"),
                eq(vec![G.clone(), c("a"), c("c")]),
            ];
        }
    }

    #[test]
    fn decomposition_reveals_plaintext() {
        let e = p(AeadEnc, vec![c("k"), c("m"), c("ad")]);
        let (revealed, used) = possible_to_decompose(prim(&e), &[c("k")]).unwrap();
        assert_eq!(revealed, c("m"));
        assert_eq!(used, vec![c("k")]);
        assert!(possible_to_decompose(prim(&e), &[c("m")]).is_none());

        let pke = p(PkeEnc, vec![eq(vec![G.clone(), c("sk")]), c("m")]);
        let (revealed, _) = possible_to_decompose(prim(&pke), &[c("sk")]).unwrap();
        assert_eq!(revealed, c("m"));
        assert!(possible_to_decompose(prim(&p(Hash, vec![c("m")])), &[c("m")]).is_none());
    }

    #[test]
    fn decomposition_with_derivable_key() {
        let key = p(Hash, vec![c("s")]);
        let e = p(Enc, vec![key, c("m")]);
        let (revealed, _) = possible_to_decompose(prim(&e), &[c("s")]).unwrap();
        assert_eq!(revealed, c("m"));
    }

    #[test]
    fn associated_data_is_readable() {
        let e = p(AeadEnc, vec![c("k"), c("m"), c("ad")]);
        assert_eq!(possible_to_passively_decompose(prim(&e)), vec![c("ad")]);
        let e = p(Enc, vec![c("k"), c("m")]);
        assert!(possible_to_passively_decompose(prim(&e)).is_empty());
    }

    #[test]
    fn recomposition_needs_two_shares() {
        let share = |output| {
            Value::from(Primitive {
                name: ShamirSplit,
                args: vec![c("k")],
                output,
                check: false,
            })
        };
        let target = share(0);
        assert!(possible_to_recompose(prim(&target), &[share(0)]).is_none());
        let (revealed, used) = possible_to_recompose(prim(&target), &[share(2), share(1)]).unwrap();
        assert_eq!(revealed, c("k"));
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn failing_checks_cannot_be_reconstructed() {
        let known = [c("k"), c("x"), c("ad")];
        let dec = Value::from(Primitive {
            name: AeadDec,
            args: vec![c("k"), c("x"), c("ad")],
            output: 0,
            check: true,
        });
        assert!(possible_to_reconstruct_primitive(prim(&dec), &known).is_none());
    }

    #[test]
    fn equation_reconstruction_requires_an_exponent() {
        let e = Equation {
            values: vec![G.clone(), c("a"), c("b")],
        };
        assert!(possible_to_reconstruct_equation(&e, &[c("a")]).is_none());
        let used = possible_to_reconstruct_equation(&e, &[eq(vec![G.clone(), c("a")]), c("b")]);
        assert_eq!(used.unwrap().len(), 2);
    }

    #[test]
    fn leaked_keys_force_failing_checks() {
        let pk = eq(vec![G.clone(), c("sk")]);
        let verif = Primitive {
            name: SignVerif,
            args: vec![pk.clone(), c("m2"), p(Sign, vec![c("sk"), c("m1")])],
            output: 0,
            check: true,
        };
        assert!(!possible_to_force_rewrite(&verif, &[pk.clone(), c("m2")]));
        assert!(possible_to_force_rewrite(&verif, &[c("sk")]));

        let dec = Primitive {
            name: AeadDec,
            args: vec![p(Hash, vec![c("s")]), c("x"), c("ad")],
            output: 0,
            check: true,
        };
        assert!(!possible_to_force_rewrite(&dec, &[c("x"), c("ad")]));
        assert!(possible_to_force_rewrite(&dec, &[c("s")]));

        let hash = Primitive {
            name: Hash,
            args: vec![c("s")],
            output: 0,
            check: false,
        };
        assert!(!possible_to_force_rewrite(&hash, &[c("s")]));
    }

    #[test]
    fn passwords_leak_unless_hashed() {
        let states = crate::principal::tests::states(
            r#"
attacker[passive]
principal Alice[
    knows password pw
    knows private k
    h = PW_HASH(pw)
    e1 = ENC(pw, k)
    e2 = ENC(k, pw)
]
queries[ confidentiality? pw ]
"#,
        );
        let alice = &states[0];
        let resolved = alice.resolve_all().unwrap();
        let value = |name: &str| {
            resolved
                .slot_of(&Constant::named(name))
                .unwrap()
                .assigned
                .clone()
        };
        assert!(possible_to_obtain_passwords(&value("h"), alice).is_empty());
        assert!(possible_to_obtain_passwords(&value("e2"), alice).is_empty());
        let leaked = possible_to_obtain_passwords(&value("e1"), alice);
        assert_eq!(leaked, vec![c("pw")]);
        assert_eq!(possible_to_obtain_passwords(&c("pw"), alice), vec![c("pw")]);
    }
}
