//! Checks that a parsed model describes a protocol the engine can run.

use std::sync::Arc;

use smol_str::SmolStr;
use verisym_parse::ast::{Block, Ident, Model, Query, QueryKind, QueryMessage};

use crate::error::SanityError;
use crate::knowledge::KnowledgeMap;
use crate::value::{Equation, Primitive, Value};

const MAX_PRINCIPALS: usize = 64;

fn prep_src(src: &str) -> String {
    format!("{}\n", src)
}

/// Phases must count up from 1 without gaps.
pub fn check_phases(src: &str, model: &Model<SmolStr>) -> Result<(), SanityError> {
    let mut last = 0;
    for block in &model.blocks {
        let phase = match block {
            Block::Phase(phase) => phase,
            _ => continue,
        };
        if phase.number <= last {
            return Err(SanityError::PhaseNotIncreasing {
                src: prep_src(src),
                err_span: phase.span,
                phase: phase.number,
                last,
            });
        }
        if phase.number != last + 1 {
            return Err(SanityError::PhaseSkipped {
                src: prep_src(src),
                err_span: phase.span,
                phase: phase.number,
                last,
            });
        }
        last = phase.number;
    }
    Ok(())
}

/// Principals in order of their first principal block. Every principal named
/// by a message or an authentication query must be among them.
pub fn declared_principals(
    src: &str,
    model: &Model<SmolStr>,
) -> Result<Vec<SmolStr>, SanityError> {
    let mut declared: Vec<SmolStr> = Vec::new();
    for p in model.principals() {
        if !declared.contains(&p.name.0) {
            declared.push(p.name.0.clone());
        }
    }

    let mut referenced: Vec<&Ident<SmolStr>> = Vec::new();
    for block in &model.blocks {
        if let Block::Message(m) = block {
            referenced.push(&m.sender);
            referenced.push(&m.recipient);
        }
    }
    for query in &model.queries {
        if let Some(m) = &query.message {
            referenced.push(&m.sender);
            referenced.push(&m.recipient);
        }
        for option in &query.options {
            referenced.push(&option.message.sender);
            referenced.push(&option.message.recipient);
        }
    }
    if let Some(unknown) = referenced.into_iter().find(|p| !declared.contains(&p.0)) {
        return Err(SanityError::UnknownPrincipal {
            src: prep_src(src),
            err_span: unknown.span(),
            name: unknown.to_string(),
        });
    }

    if declared.is_empty() {
        return Err(SanityError::NoPrincipals);
    }
    if declared.len() > MAX_PRINCIPALS {
        return Err(SanityError::TooManyPrincipals {
            count: declared.len(),
        });
    }
    Ok(declared)
}

pub fn check_queries(
    src: &str,
    model: &Model<SmolStr>,
    km: &KnowledgeMap,
) -> Result<(), SanityError> {
    for query in &model.queries {
        QueryCheck { src, km, query }.run()?;
    }
    Ok(())
}

struct QueryCheck<'a> {
    src: &'a str,
    km: &'a KnowledgeMap,
    query: &'a Query<SmolStr>,
}

impl QueryCheck<'_> {
    fn run(&self) -> Result<(), SanityError> {
        match (self.query.kind, &self.query.message) {
            (QueryKind::Authentication, Some(message)) => {
                self.authentication(message)?;
            }
            (QueryKind::Unlinkability, _) => {
                if self.query.constants.len() < 2 {
                    return Err(SanityError::UnlinkabilityTooFew {
                        src: prep_src(self.src),
                        err_span: self.span(),
                        query: self.query.to_string(),
                    });
                }
                for c in &self.query.constants {
                    self.exists(c)?;
                }
            }
            _ => {
                for c in &self.query.constants {
                    self.exists(c)?;
                }
            }
        }
        for option in &self.query.options {
            let message = &option.message;
            if message.constants.len() != 1 {
                return Err(SanityError::PreconditionConstants {
                    src: prep_src(self.src),
                    err_span: self.span(),
                    query: self.query.to_string(),
                });
            }
            self.exists(&message.constants[0])?;
            self.check_known(message)?;
        }
        Ok(())
    }

    fn span(&self) -> miette::SourceSpan {
        self.query
            .constants
            .first()
            .or_else(|| self.query.message.as_ref().and_then(|m| m.constants.first()))
            .map(|c| c.span())
            .unwrap_or_else(|| (0, 0).into())
    }

    fn exists(&self, c: &Ident<SmolStr>) -> Result<usize, SanityError> {
        self.km
            .index_of(c.as_str())
            .ok_or_else(|| SanityError::QueryUnknownConstant {
                src: prep_src(self.src),
                err_span: c.span(),
                kind: self.query.kind.to_string(),
                query: self.query.to_string(),
                name: c.to_string(),
            })
    }

    fn authentication(&self, message: &QueryMessage<SmolStr>) -> Result<(), SanityError> {
        if let Some(first) = message.constants.first() {
            self.exists(first)?;
        }
        if message.constants.len() != 1 {
            return Err(SanityError::AuthenticationConstants {
                src: prep_src(self.src),
                err_span: self.span(),
                query: self.query.to_string(),
            });
        }
        self.check_known(message)
    }

    /// The sender must know the constant, the recipient must receive it and
    /// use it in a primitive.
    fn check_known(&self, message: &QueryMessage<SmolStr>) -> Result<(), SanityError> {
        let ident = &message.constants[0];
        let index = self.exists(ident)?;
        if !self.km.knows(&message.sender.0, index) {
            return Err(SanityError::AuthenticationNotSent {
                src: prep_src(self.src),
                err_span: ident.span(),
                query: self.query.to_string(),
                sender: message.sender.to_string(),
                name: ident.to_string(),
            });
        }
        if !self.km.knows(&message.recipient.0, index) {
            return Err(SanityError::AuthenticationNotReceived {
                src: prep_src(self.src),
                err_span: ident.span(),
                query: self.query.to_string(),
                recipient: message.recipient.to_string(),
                name: ident.to_string(),
            });
        }
        let used = self
            .km
            .slot(index)
            .map(|slot| self.km.constant_used_by(&message.recipient.0, &slot.constant))
            .unwrap_or(false);
        if !used {
            return Err(SanityError::AuthenticationNotUsed {
                src: prep_src(self.src),
                err_span: ident.span(),
                query: self.query.to_string(),
                recipient: message.recipient.to_string(),
                name: ident.to_string(),
            });
        }
        Ok(())
    }
}

/// Fails on the first failed rewrite of a checked primitive.
pub fn fail_on_checked(
    principal: &str,
    failed: &[(Arc<Primitive>, usize)],
) -> Result<(), SanityError> {
    match failed.iter().find(|(p, _)| p.check) {
        Some((p, _)) => Err(SanityError::CheckedPrimitiveFails {
            principal: principal.to_string(),
            primitive: p.to_string(),
        }),
        None => Ok(()),
    }
}

/// Equations reachable from `a` must be `G^x` or `G^x^y`.
pub fn check_equation_generators(a: &Value) -> Result<(), SanityError> {
    match a {
        Value::Constant(_) => Ok(()),
        Value::Primitive(p) => p.args.iter().try_for_each(|arg| match arg {
            Value::Constant(_) => Ok(()),
            arg => check_equation_generators(arg),
        }),
        Value::Equation(e) => check_equation_root_generator(e),
    }
}

fn check_equation_root_generator(e: &Equation) -> Result<(), SanityError> {
    if e.values.len() > 3 {
        return Err(SanityError::EquationLayers {
            equation: e.to_string(),
        });
    }
    for (i, v) in e.values.iter().enumerate() {
        let is_g = matches!(v, Value::Constant(c) if c.is_g());
        if i == 0 && !is_g {
            return Err(SanityError::EquationGenerator {
                equation: e.to_string(),
            });
        }
        if i > 0 && is_g {
            return Err(SanityError::EquationMisusedGenerator {
                equation: e.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::tests::{c, eq};
    use crate::value::G;

    fn check(src: &str) -> Result<KnowledgeMap, SanityError> {
        let model = verisym_parse::parse_model(src).unwrap();
        check_phases(src, &model)?;
        let principals = declared_principals(src, &model)?;
        let km = KnowledgeMap::construct(src, &model, principals)?;
        check_queries(src, &model, &km)?;
        Ok(km)
    }

    #[test]
    fn phases_must_not_skip() {
        let src = "attacker[passive] principal A[] phase[1] principal A[] phase[3] queries[]";
        match check(src) {
            Err(SanityError::PhaseSkipped { phase, last, .. }) => {
                assert_eq!((phase, last), (3, 1));
            }
            other => panic!("unexpected {other:?}"),
        }

        let src = "attacker[passive] principal A[] phase[1] phase[1] queries[]";
        assert!(matches!(
            check(src),
            Err(SanityError::PhaseNotIncreasing { .. })
        ));
    }

    #[test]
    fn undeclared_principals() {
        let src = "attacker[passive] principal A[ knows private x ] A -> B: x queries[]";
        match check(src) {
            Err(SanityError::UnknownPrincipal { name, .. }) => assert_eq!(name, "B"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn too_many_principals() {
        let mut src = String::from("attacker[passive] ");
        for i in 0..65 {
            src.push_str(&format!("principal P{i}[] "));
        }
        src.push_str("queries[]");
        assert!(matches!(
            check(&src),
            Err(SanityError::TooManyPrincipals { count: 65 })
        ));
    }

    #[test]
    fn query_targets_must_exist() {
        let src = "attacker[passive] principal A[ knows private x ] queries[ confidentiality? y ]";
        match check(src) {
            Err(e @ SanityError::QueryUnknownConstant { .. }) => assert_eq!(
                e.to_string(),
                "confidentiality query (confidentiality? y) refers to unknown constant (y)"
            ),
            other => panic!("unexpected {other:?}"),
        }

        let src = "attacker[passive] principal A[ generates x ] queries[ unlinkability? x ]";
        assert!(matches!(
            check(src),
            Err(SanityError::UnlinkabilityTooFew { .. })
        ));
    }

    #[test]
    fn authentication_needs_a_use() {
        let src = r#"
attacker[active]
principal Alice[ knows private k generates m c = ENC(k, m) ]
Alice -> Bob: c
principal Bob[ knows private k ]
queries[ authentication? Alice -> Bob: c ]
"#;
        assert!(matches!(
            check(src),
            Err(SanityError::AuthenticationNotUsed { .. })
        ));

        let used = src.replace(
            "principal Bob[ knows private k ]",
            "principal Bob[ knows private k m2 = DEC(k, c) ]",
        );
        check(&used).unwrap();

        let unsent = used.replace(
            "authentication? Alice -> Bob: c",
            "authentication? Bob -> Alice: m2",
        );
        assert!(matches!(
            check(&unsent),
            Err(SanityError::AuthenticationNotReceived { .. })
        ));
    }

    #[test]
    fn equation_shapes() {
        assert!(check_equation_generators(&eq(vec![G.clone(), c("a"), c("b")])).is_ok());
        assert!(matches!(
            check_equation_generators(&eq(vec![G.clone(), c("a"), c("b"), c("c")])),
            Err(SanityError::EquationLayers { .. })
        ));
        assert!(matches!(
            check_equation_generators(&eq(vec![c("a"), c("b")])),
            Err(SanityError::EquationGenerator { .. })
        ));
        assert!(matches!(
            check_equation_generators(&eq(vec![G.clone(), G.clone()])),
            Err(SanityError::EquationMisusedGenerator { .. })
        ));
    }
}
