//! The primitive registry.
//!
//! Every primitive of the model language is described by a [`PrimitiveSpec`].
//! Rules that need to inspect or reshape an argument do so through a
//! [`Filter`], so the table stays plain data.

use std::str::FromStr;
use std::sync::Arc;

use crate::value::{Equation, Primitive, Value, G, NIL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveName {
    Assert,
    Concat,
    Split,
    PwHash,
    Hash,
    Hkdf,
    AeadEnc,
    AeadDec,
    Enc,
    Dec,
    Mac,
    Sign,
    SignVerif,
    PkeEnc,
    PkeDec,
    ShamirSplit,
    ShamirJoin,
    RingSign,
    RingSignVerif,
    Blind,
    Unblind,
}

impl PrimitiveName {
    pub const ALL: [PrimitiveName; 21] = [
        PrimitiveName::Assert,
        PrimitiveName::Concat,
        PrimitiveName::Split,
        PrimitiveName::PwHash,
        PrimitiveName::Hash,
        PrimitiveName::Hkdf,
        PrimitiveName::AeadEnc,
        PrimitiveName::AeadDec,
        PrimitiveName::Enc,
        PrimitiveName::Dec,
        PrimitiveName::Mac,
        PrimitiveName::Sign,
        PrimitiveName::SignVerif,
        PrimitiveName::PkeEnc,
        PrimitiveName::PkeDec,
        PrimitiveName::ShamirSplit,
        PrimitiveName::ShamirJoin,
        PrimitiveName::RingSign,
        PrimitiveName::RingSignVerif,
        PrimitiveName::Blind,
        PrimitiveName::Unblind,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveName::Assert => "ASSERT",
            PrimitiveName::Concat => "CONCAT",
            PrimitiveName::Split => "SPLIT",
            PrimitiveName::PwHash => "PW_HASH",
            PrimitiveName::Hash => "HASH",
            PrimitiveName::Hkdf => "HKDF",
            PrimitiveName::AeadEnc => "AEAD_ENC",
            PrimitiveName::AeadDec => "AEAD_DEC",
            PrimitiveName::Enc => "ENC",
            PrimitiveName::Dec => "DEC",
            PrimitiveName::Mac => "MAC",
            PrimitiveName::Sign => "SIGN",
            PrimitiveName::SignVerif => "SIGNVERIF",
            PrimitiveName::PkeEnc => "PKE_ENC",
            PrimitiveName::PkeDec => "PKE_DEC",
            PrimitiveName::ShamirSplit => "SHAMIR_SPLIT",
            PrimitiveName::ShamirJoin => "SHAMIR_JOIN",
            PrimitiveName::RingSign => "RINGSIGN",
            PrimitiveName::RingSignVerif => "RINGSIGNVERIF",
            PrimitiveName::Blind => "BLIND",
            PrimitiveName::Unblind => "UNBLIND",
        }
    }

    /// `ASSERT`, `CONCAT` and `SPLIT` are handled by [`CoreRule`]s instead of the
    /// generic rule machinery.
    pub fn is_core(self) -> bool {
        matches!(
            self,
            PrimitiveName::Assert | PrimitiveName::Concat | PrimitiveName::Split
        )
    }
}

impl std::fmt::Display for PrimitiveName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrimitiveError {
    #[error("unknown primitive ({0})")]
    Unknown(String),
    #[error("{0} is not a core primitive")]
    NotCore(PrimitiveName),
    #[error("{0} is a core primitive")]
    Core(PrimitiveName),
}

impl FromStr for PrimitiveName {
    type Err = PrimitiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrimitiveName::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PrimitiveError::Unknown(s.to_string()))
    }
}

/// How an argument is presented to a rule before it is compared or looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// The argument as is.
    Pass,
    /// `G^x` becomes `x`. Anything else is rejected.
    PeelGenerator,
    /// `x` becomes `G^x`. Equations are rejected.
    WrapGenerator,
    /// Any two-value equation `b^x` becomes `x`. Anything else is rejected.
    PeelExponent,
    /// The first two arguments of the outer primitive, wrapped in `BLIND`.
    BlindOuter,
    Reject,
}

impl Filter {
    pub fn apply(self, outer: &Primitive, value: &Value) -> Option<Value> {
        match self {
            Filter::Pass => Some(value.clone()),
            Filter::PeelGenerator => match value {
                Value::Equation(e) if e.values.len() == 2 && e.values[0].equivalent(&G, true) => {
                    Some(e.values[1].clone())
                }
                _ => None,
            },
            Filter::WrapGenerator => match value {
                Value::Constant(_) | Value::Primitive(_) => Some(Value::Equation(Arc::new(
                    Equation {
                        values: vec![G.clone(), value.clone()],
                    },
                ))),
                Value::Equation(_) => None,
            },
            Filter::PeelExponent => match value {
                Value::Equation(e) if e.values.len() == 2 => Some(e.values[1].clone()),
                _ => None,
            },
            Filter::BlindOuter => {
                if outer.args.len() < 2 {
                    return None;
                }
                Some(Value::Primitive(Arc::new(Primitive {
                    name: PrimitiveName::Blind,
                    args: vec![outer.args[0].clone(), outer.args[1].clone()],
                    output: 0,
                    check: false,
                })))
            }
            Filter::Reject => None,
        }
    }
}

/// Knowing the `given` arguments of an application reveals argument `reveal`.
#[derive(Debug, Clone)]
pub struct DecomposeRule {
    pub given: &'static [usize],
    pub reveal: usize,
    /// Filters, one per entry of `given`.
    pub filters: &'static [Filter],
    /// Arguments readable off the output without any key.
    pub passive_reveal: &'static [usize],
}

impl DecomposeRule {
    pub fn filter(&self, position: usize) -> Filter {
        self.filters.get(position).copied().unwrap_or(Filter::Reject)
    }
}

/// Knowing the outputs listed in any one group reveals argument `reveal`.
#[derive(Debug, Clone)]
pub struct RecomposeRule {
    pub given: &'static [&'static [usize]],
    pub reveal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteTo {
    /// The given argument of the inner application.
    Arg(usize),
    /// Verification primitives collapse to `nil`.
    Nil,
    /// `SIGN(a, BLIND(k, m))` becomes `SIGN(a, m)`.
    Unblind,
}

impl RewriteTo {
    pub fn apply(self, inner: &Primitive) -> Option<Value> {
        match self {
            RewriteTo::Arg(i) => inner.args.get(i).cloned(),
            RewriteTo::Nil => Some(NIL.clone()),
            RewriteTo::Unblind => {
                let blinded = inner.args.get(1)?.as_primitive()?;
                Some(Value::Primitive(Arc::new(Primitive {
                    name: PrimitiveName::Sign,
                    args: vec![inner.args.get(0)?.clone(), blinded.args.get(1)?.clone()],
                    output: 0,
                    check: false,
                })))
            }
        }
    }
}

/// `OUTER(.., NAME(..), ..)` collapses when the outer arguments match the inner
/// ones. Argument `a` of the outer application is filtered by the filter of the
/// inner index it is compared with.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub name: PrimitiveName,
    pub from: usize,
    pub to: RewriteTo,
    pub matching: &'static [(usize, &'static [usize])],
    /// Indexed by inner argument position.
    pub filters: &'static [Filter],
}

impl RewriteRule {
    pub fn filter(&self, inner_index: usize) -> Filter {
        self.filters
            .get(inner_index)
            .copied()
            .unwrap_or(Filter::Reject)
    }
}

/// Applications of `name` in each group of argument positions, differing only
/// in their output, rebuild argument `reveal` of the inner application.
#[derive(Debug, Clone)]
pub struct RebuildRule {
    pub name: PrimitiveName,
    pub given: &'static [&'static [usize]],
    pub reveal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRule {
    Assert,
    Split,
}

impl CoreRule {
    /// Returns whether the rule fires and the values the application stands for.
    pub fn apply(self, p: &Arc<Primitive>) -> (bool, Vec<Value>) {
        let unchanged = || vec![Value::Primitive(p.clone())];
        match self {
            CoreRule::Assert => {
                let holds = p.args.len() == 2 && p.args[0].equivalent(&p.args[1], true);
                (holds, unchanged())
            }
            CoreRule::Split => match p.args.first().and_then(Value::as_primitive) {
                Some(inner) if inner.name == PrimitiveName::Concat => (true, inner.args.clone()),
                _ => (false, unchanged()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrimitiveSpec {
    pub name: PrimitiveName,
    pub arity: &'static [usize],
    pub output: &'static [usize],
    pub core_rule: Option<CoreRule>,
    pub decompose: Option<DecomposeRule>,
    pub recompose: Option<RecomposeRule>,
    pub rewrite: Option<RewriteRule>,
    pub rebuild: Option<RebuildRule>,
    pub check: bool,
    pub injectable: bool,
    pub explosive: bool,
    pub password_hashing: &'static [usize],
}

impl PrimitiveSpec {
    /// Whether a rewrite can change an application of this primitive.
    pub fn has_rule(&self) -> bool {
        if self.name.is_core() {
            self.core_rule.is_some()
        } else {
            self.rewrite.is_some()
        }
    }

    pub fn hashes_password_at(&self, index: usize) -> bool {
        self.password_hashing.contains(&index)
    }
}

const ONE: &[usize] = &[1];
const ONE_TO_FIVE: &[usize] = &[1, 2, 3, 4, 5];

const fn plain(
    name: PrimitiveName,
    arity: &'static [usize],
    output: &'static [usize],
) -> PrimitiveSpec {
    PrimitiveSpec {
        name,
        arity,
        output,
        core_rule: None,
        decompose: None,
        recompose: None,
        rewrite: None,
        rebuild: None,
        check: false,
        injectable: false,
        explosive: false,
        password_hashing: &[],
    }
}

static ALL_SPECS: [PrimitiveSpec; 21] = [
    PrimitiveSpec {
        core_rule: Some(CoreRule::Assert),
        check: true,
        ..plain(PrimitiveName::Assert, &[2], ONE)
    },
    PrimitiveSpec {
        injectable: true,
        explosive: true,
        ..plain(PrimitiveName::Concat, &[2, 3, 4, 5], ONE)
    },
    PrimitiveSpec {
        core_rule: Some(CoreRule::Split),
        check: true,
        ..plain(PrimitiveName::Split, ONE, ONE_TO_FIVE)
    },
    PrimitiveSpec {
        injectable: true,
        password_hashing: &[0, 1, 2, 3, 4],
        ..plain(PrimitiveName::PwHash, ONE_TO_FIVE, ONE)
    },
    PrimitiveSpec {
        injectable: true,
        explosive: true,
        ..plain(PrimitiveName::Hash, ONE_TO_FIVE, ONE)
    },
    PrimitiveSpec {
        injectable: true,
        explosive: true,
        ..plain(PrimitiveName::Hkdf, &[3], ONE_TO_FIVE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::Pass],
            passive_reveal: &[2],
        }),
        injectable: true,
        password_hashing: &[1],
        ..plain(PrimitiveName::AeadEnc, &[3], ONE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::Pass],
            passive_reveal: &[],
        }),
        rewrite: Some(RewriteRule {
            name: PrimitiveName::AeadEnc,
            from: 1,
            to: RewriteTo::Arg(1),
            matching: &[(0, &[0]), (2, &[2])],
            filters: &[Filter::Pass, Filter::Reject, Filter::Pass],
        }),
        check: true,
        ..plain(PrimitiveName::AeadDec, &[3], ONE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::Pass],
            passive_reveal: &[],
        }),
        injectable: true,
        password_hashing: &[1],
        ..plain(PrimitiveName::Enc, &[2], ONE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::Pass],
            passive_reveal: &[],
        }),
        rewrite: Some(RewriteRule {
            name: PrimitiveName::Enc,
            from: 1,
            to: RewriteTo::Arg(1),
            matching: &[(0, &[0])],
            filters: &[Filter::Pass],
        }),
        ..plain(PrimitiveName::Dec, &[2], ONE)
    },
    PrimitiveSpec {
        injectable: true,
        password_hashing: &[1],
        ..plain(PrimitiveName::Mac, &[2], ONE)
    },
    PrimitiveSpec {
        injectable: true,
        password_hashing: &[1],
        ..plain(PrimitiveName::Sign, &[2], ONE)
    },
    PrimitiveSpec {
        rewrite: Some(RewriteRule {
            name: PrimitiveName::Sign,
            from: 2,
            to: RewriteTo::Nil,
            matching: &[(0, &[0]), (1, &[1])],
            filters: &[Filter::PeelGenerator, Filter::Pass],
        }),
        check: true,
        ..plain(PrimitiveName::SignVerif, &[3], ONE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::PeelGenerator],
            passive_reveal: &[],
        }),
        injectable: true,
        password_hashing: &[1],
        ..plain(PrimitiveName::PkeEnc, &[2], ONE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::Pass],
            passive_reveal: &[],
        }),
        rewrite: Some(RewriteRule {
            name: PrimitiveName::PkeEnc,
            from: 1,
            to: RewriteTo::Arg(1),
            matching: &[(0, &[0])],
            filters: &[Filter::WrapGenerator],
        }),
        ..plain(PrimitiveName::PkeDec, &[2], ONE)
    },
    PrimitiveSpec {
        recompose: Some(RecomposeRule {
            given: &[&[0, 1], &[0, 2], &[1, 2]],
            reveal: 0,
        }),
        ..plain(PrimitiveName::ShamirSplit, ONE, &[3])
    },
    PrimitiveSpec {
        rebuild: Some(RebuildRule {
            name: PrimitiveName::ShamirSplit,
            given: &[&[0, 1], &[0, 2], &[1, 0], &[1, 2], &[2, 0], &[2, 1]],
            reveal: 0,
        }),
        ..plain(PrimitiveName::ShamirJoin, &[2], ONE)
    },
    PrimitiveSpec {
        injectable: true,
        password_hashing: &[3],
        ..plain(PrimitiveName::RingSign, &[4], ONE)
    },
    PrimitiveSpec {
        rewrite: Some(RewriteRule {
            name: PrimitiveName::RingSign,
            from: 4,
            to: RewriteTo::Nil,
            matching: &[(0, &[0, 1, 2]), (1, &[0, 1, 2]), (2, &[0, 1, 2]), (3, &[3])],
            filters: &[
                Filter::PeelExponent,
                Filter::Pass,
                Filter::Pass,
                Filter::Pass,
                Filter::Pass,
            ],
        }),
        check: true,
        ..plain(PrimitiveName::RingSignVerif, &[5], ONE)
    },
    PrimitiveSpec {
        decompose: Some(DecomposeRule {
            given: &[0],
            reveal: 1,
            filters: &[Filter::Pass],
            passive_reveal: &[],
        }),
        injectable: true,
        password_hashing: &[1],
        ..plain(PrimitiveName::Blind, &[2], ONE)
    },
    PrimitiveSpec {
        rewrite: Some(RewriteRule {
            name: PrimitiveName::Sign,
            from: 2,
            to: RewriteTo::Unblind,
            matching: &[(0, &[1])],
            filters: &[Filter::Reject, Filter::BlindOuter],
        }),
        injectable: true,
        ..plain(PrimitiveName::Unblind, &[3], ONE)
    },
];

/// Any primitive, core or not.
pub fn spec(name: PrimitiveName) -> &'static PrimitiveSpec {
    &ALL_SPECS[name as usize]
}

/// A non-core primitive.
pub fn get(name: PrimitiveName) -> Result<&'static PrimitiveSpec, PrimitiveError> {
    if name.is_core() {
        return Err(PrimitiveError::Core(name));
    }
    Ok(spec(name))
}

pub fn get_core(name: PrimitiveName) -> Result<&'static PrimitiveSpec, PrimitiveError> {
    if !name.is_core() {
        return Err(PrimitiveError::NotCore(name));
    }
    Ok(spec(name))
}

pub fn lookup(name: &str) -> Result<&'static PrimitiveSpec, PrimitiveError> {
    name.parse::<PrimitiveName>().map(spec)
}
