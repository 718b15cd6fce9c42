use std::path::Path;
use std::sync::Arc;

use rayon::iter::{ParallelBridge, ParallelIterator};
use smol_str::SmolStr;
use verisym_parse::ast::{AttackerKind, Model};

use crate::analysis::analysis;
use crate::context::Context;
use crate::error::{InternalError, VerifyError};
use crate::inject::inject_missing_skeletons;
use crate::knowledge::KnowledgeMap;
use crate::principal::PrincipalState;
use crate::replacement::{mutate, Frame, ReplacementMap};
use crate::results::VerifyResult;
use crate::sanity;
use crate::value::Value;

const MAX_FILE_NAME: usize = 64;

/// The outcome of verifying one model.
#[derive(Debug, Clone)]
pub struct Verification {
    pub file_name: String,
    pub results: Vec<VerifyResult>,
}

impl Verification {
    /// One letter per query followed by `1` if it was attacked, e.g. `c1a0`.
    pub fn results_code(&self) -> String {
        self.results.iter().map(VerifyResult::code).collect()
    }

    pub fn all_pass(&self) -> bool {
        self.results.iter().all(|r| !r.resolved)
    }

    pub fn attacked(&self) -> impl Iterator<Item = &VerifyResult> {
        self.results.iter().filter(|r| r.resolved)
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_pass() {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Verification completed for '{}'.", self.file_name)?;
        if self.all_pass() {
            writeln!(f, "All queries pass.")?;
        } else {
            writeln!(f, "Summary of failed queries will follow.")?;
        }
        for result in self.attacked() {
            writeln!(f)?;
            write!(f, "{} — {}", result.query, result.summary)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    parallel: bool,
    max_stage: Option<u32>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self {
            parallel: true,
            max_stage: None,
        }
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyse mutation frames on the rayon pool.
    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Stop the active search after `stage` even if the attacker still learns.
    pub fn with_max_stage(mut self, stage: u32) -> Self {
        self.max_stage = Some(stage);
        self
    }

    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<Verification, VerifyError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        if !file_name.ends_with(".vp") || file_name.len() > MAX_FILE_NAME {
            return Err(VerifyError::FileName { name: file_name });
        }
        let src = std::fs::read_to_string(path).map_err(|source| VerifyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.verify_str(&file_name, &src)
    }

    pub fn verify_str(&self, file_name: &str, src: &str) -> Result<Verification, VerifyError> {
        let span = tracing::info_span!("verify", file = file_name);
        let _enter = span.enter();

        let (model, km) = check_model(src)?;
        let states = PrincipalState::construct_all(&km);

        tracing::info!("Verification initiated for '{}'.", file_name);
        let mut ctx = Context::new(
            km.clone(),
            &model.queries,
            model.attacker == AttackerKind::Active,
        );
        ctx.parallel = self.parallel;
        match model.attacker {
            AttackerKind::Passive => self.passive(&ctx, &states)?,
            AttackerKind::Active => self.active(&ctx, &states)?,
        }
        tracing::info!("Verification completed for '{}'.", file_name);

        Ok(Verification {
            file_name: file_name.to_string(),
            results: ctx.results.read(),
        })
    }

    fn passive(&self, ctx: &Context, states: &[PrincipalState]) -> Result<(), VerifyError> {
        tracing::info!("Attacker is configured as passive.");
        for phase in 0..=ctx.km.max_phase {
            let span = tracing::info_span!("phase", phase);
            let _enter = span.enter();
            tracing::info!("Running at phase {}.", phase);
            ctx.attacker.init(false);
            self.absorb(ctx, states, phase)?;
            standard_run(ctx, states, 0)?;
        }
        Ok(())
    }

    fn active(&self, ctx: &Context, states: &[PrincipalState]) -> Result<(), VerifyError> {
        tracing::info!("Attacker is configured as active.");
        for phase in 0..=ctx.km.max_phase {
            let span = tracing::info_span!("phase", phase);
            let _enter = span.enter();
            tracing::info!("Running at phase {}.", phase);
            ctx.attacker.init(true);
            self.absorb(ctx, states, phase)?;
            standard_run(ctx, states, 0)?;
            self.stages(ctx, states)?;
        }
        Ok(())
    }

    fn absorb(&self, ctx: &Context, states: &[PrincipalState], phase: u32) -> Result<(), VerifyError> {
        if let Some(first) = states.first() {
            ctx.attacker.absorb_phase_values(first, phase)?;
        }
        Ok(())
    }

    /// Mutation stages, until every query is resolved or a stage past the
    /// second teaches the attacker nothing.
    fn stages(&self, ctx: &Context, states: &[PrincipalState]) -> Result<(), VerifyError> {
        let mut known = ctx.attacker.read().known.len();
        let mut stage = 1;
        while !ctx.results.all_resolved() {
            if self.max_stage.map_or(false, |max| stage > max) {
                break;
            }
            let span = tracing::info_span!("stage", stage);
            let _enter = span.enter();
            tracing::info!("Running stage {}.", stage);

            self.stage(ctx, states, stage)?;

            let learned = ctx.attacker.read().known.len();
            if stage >= 3 && learned == known {
                tracing::info!("Stage {} taught the attacker nothing new.", stage);
                break;
            }
            known = learned;
            stage += 1;
        }
        Ok(())
    }

    /// Scans every principal, rebuilding its replacement map whenever the
    /// attacker has learned something since the map was last built.
    ///
    /// `locks[i]` is the size of the attacker's knowledge that principal `i`'s
    /// last map was built from. A principal is not scanned again until that
    /// knowledge grows.
    fn stage(&self, ctx: &Context, states: &[PrincipalState], stage: u32) -> Result<(), VerifyError> {
        let mut locks = vec![None; states.len()];
        loop {
            let mut rescanned = false;
            for (lock, state) in locks.iter_mut().zip(states) {
                if ctx.results.all_resolved() {
                    return Ok(());
                }
                let map = {
                    let attacker = ctx.attacker.read();
                    let known = attacker.known.len();
                    if *lock == Some(known) {
                        continue;
                    }
                    if lock.is_some() {
                        tracing::debug!(
                            "Rebuilding the mutation map for {} with {} known values.",
                            state.name,
                            known
                        );
                    }
                    *lock = Some(known);
                    ReplacementMap::init(ctx, state, &attacker, stage)?
                };
                self.scan(ctx, state, map, stage)?;
                rescanned = true;
            }
            if !rescanned {
                return Ok(());
            }
        }
    }

    /// Analyses every frame of `map` worth analysing.
    fn scan(
        &self,
        ctx: &Context,
        state: &PrincipalState,
        map: ReplacementMap,
        stage: u32,
    ) -> Result<(), InternalError> {
        tracing::trace!(
            "Scanning {} frames for {}.",
            map.frame_count(),
            state.name
        );
        let constants = map.constants.clone();
        let run = |frame: Frame| -> Result<(), InternalError> {
            if ctx.results.all_resolved() {
                return Ok(());
            }
            match mutate(state, &frame, &constants, ctx)? {
                Some(mutated) => analysis(&mutated, ctx, stage),
                None => Ok(()),
            }
        };
        if self.parallel {
            map.par_bridge().try_for_each(run)
        } else {
            map.into_iter().try_for_each(run)
        }
    }
}

/// Parses `src` and checks that it describes a well-formed protocol.
pub fn check_model(src: &str) -> Result<(Model<SmolStr>, Arc<KnowledgeMap>), VerifyError> {
    let model = verisym_parse::parse_model(src)?;
    sanity::check_phases(src, &model)?;
    let principals = sanity::declared_principals(src, &model)?;
    let km = Arc::new(KnowledgeMap::construct(src, &model, principals)?);
    sanity::check_queries(src, &model, &km)?;
    Ok((model, km))
}

/// Analyses each principal as modelled, with no mutation. A checked primitive
/// failing here means the protocol cannot run even without an attacker.
fn standard_run(ctx: &Context, states: &[PrincipalState], stage: u32) -> Result<(), VerifyError> {
    for state in states {
        let mut state = state.resolve_all()?;
        for slot in &state.slots {
            if let Value::Primitive(p) = &slot.assigned {
                inject_missing_skeletons(p, &state, ctx);
            }
        }
        let failed = state.perform_all_rewrites();
        sanity::fail_on_checked(&state.name, &failed)?;
        for slot in &state.slots {
            sanity::check_equation_generators(&slot.assigned)?;
        }
        analysis(&state, ctx, stage)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SanityError;

    fn verify(src: &str) -> Result<Verification, VerifyError> {
        Verifier::new().verify_str("test.vp", src)
    }

    static CLEAR_KEY: &str = r#"
attacker[passive]
principal Alice[
    knows private k
    generates m
    e = ENC(k, m)
]
Alice -> Bob: k, e
principal Bob[ d = DEC(k, e) ]
queries[ confidentiality? m ]
"#;

    static DH: &str = r#"
attacker[passive]
principal Alice[
    generates a
    ga = G^a
]
Alice -> Bob: ga
principal Bob[
    generates b, m
    gb = G^b
    ss = ga^b
    e = AEAD_ENC(ss, m, gb)
]
Bob -> Alice: gb, e
principal Alice[
    ss_a = gb^a
    d = AEAD_DEC(ss_a, e, gb)?
]
queries[ confidentiality? m ]
"#;

    #[test]
    fn keys_in_the_clear() -> Result<(), VerifyError> {
        let verification = verify(CLEAR_KEY)?;
        assert_eq!(verification.results_code(), "c1");
        assert_eq!(verification.exit_code(), 1);
        let report = verification.to_string();
        assert!(report.starts_with("Verification completed for 'test.vp'.\nSummary of failed queries will follow.\n"));
        assert!(report.contains("confidentiality? m — "));
        Ok(())
    }

    #[test]
    fn passive_diffie_hellman_keeps_its_secret() -> Result<(), VerifyError> {
        let verification = verify(DH)?;
        assert_eq!(verification.results_code(), "c0");
        assert_eq!(verification.exit_code(), 0);
        assert!(verification.to_string().ends_with("All queries pass.\n"));
        Ok(())
    }

    #[test]
    fn active_attacker_sits_in_the_middle() -> Result<(), VerifyError> {
        let src = DH.replace("attacker[passive]", "attacker[active]");
        for parallel in [true, false] {
            let verification = Verifier::new()
                .set_parallel(parallel)
                .verify_str("dh.vp", &src)?;
            assert_eq!(verification.results_code(), "c1");
            assert!(verification.results[0]
                .summary
                .contains("ga → G^nil (mutated by attacker)"));
        }
        Ok(())
    }

    #[test]
    fn unauthenticated_messages_can_be_replaced() -> Result<(), VerifyError> {
        let verification = verify(
            r#"
attacker[active]
principal Alice[ generates m ]
Alice -> Bob: m
principal Bob[ h = HASH(m) ]
queries[ authentication? Alice -> Bob: m ]
"#,
        )?;
        assert_eq!(verification.results_code(), "a1");
        assert!(verification.results[0]
            .summary
            .contains("sent by Attacker and not by Alice"));
        Ok(())
    }

    #[test]
    fn macs_authenticate() -> Result<(), VerifyError> {
        let verification = verify(
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
    v = ASSERT(MAC(k, m), h)?
]
queries[ authentication? Alice -> Bob: m ]
"#,
        )?;
        assert_eq!(verification.results_code(), "a0");
        Ok(())
    }

    #[test]
    fn leaks_take_effect_in_their_phase() -> Result<(), VerifyError> {
        let verification = verify(
            r#"
attacker[active]
principal Alice[
    knows private k
    generates n
    e = ENC(k, n)
]
Alice -> Bob: e
principal Bob[
    knows private k
    d = DEC(k, e)
]
phase[1]
principal Alice[ leaks k ]
queries[
    freshness? n
    confidentiality? n
    confidentiality? k
]
"#,
        )?;
        assert_eq!(verification.results_code(), "f0c1c1");
        Ok(())
    }

    #[test]
    fn unlinkability_needs_fresh_values() -> Result<(), VerifyError> {
        let verification = verify(
            r#"
attacker[passive]
principal Alice[
    knows private s
    generates a, b
    ha = HASH(s)
    hb = HASH(s)
]
Alice -> Bob: a, b, ha, hb
principal Bob[ generates r ]
queries[
    unlinkability? a, b
    unlinkability? ha, hb
]
"#,
        )?;
        assert_eq!(verification.results_code(), "u0u1");
        Ok(())
    }

    #[test]
    fn unlinkability_compares_values_after_mutation() -> Result<(), VerifyError> {
        let src = r#"
attacker[active]
principal Alice[ generates x, y ]
Alice -> Bob: x, y
principal Bob[
    h1 = HASH(x)
    h2 = HASH(y)
]
queries[ unlinkability? h1, h2 ]
"#;
        let passive = verify(&src.replace("attacker[active]", "attacker[passive]"))?;
        assert_eq!(passive.results_code(), "u0");

        let verification = Verifier::new().set_parallel(false).verify_str("linked.vp", src)?;
        assert_eq!(verification.results_code(), "u1");
        assert!(verification.results[0]
            .summary
            .contains("h1 and h2 are not unlinkable since they are the output of the same primitive (HASH(nil))"));
        Ok(())
    }

    #[test]
    fn derived_secrets_see_mutations() -> Result<(), VerifyError> {
        let src = DH
            .replace("attacker[passive]", "attacker[active]")
            .replace("confidentiality? m", "confidentiality? ss");
        let verification = Verifier::new().set_parallel(false).verify_str("dh.vp", &src)?;
        assert_eq!(verification.results_code(), "c1");
        let summary = &verification.results[0].summary;
        assert!(summary.contains("ss (G^nil^b) is obtained by Attacker."));
        assert!(summary.contains("ga → G^nil (mutated by attacker)"));
        Ok(())
    }

    static SIGNED: &str = r#"
attacker[active]
principal Alice[
    knows private sk
    generates m1, m2
    pk = G^sk
    s1 = SIGN(sk, m1)
    s2 = SIGN(sk, m2)
]
Alice -> Bob: [pk], m1, s1
Alice -> Bob: m2, s2
principal Bob[
    v1 = SIGNVERIF(pk, m1, s1)?
    v2 = SIGNVERIF(pk, m2, s2)?
]
queries[
    authentication? Alice -> Bob: m2
]
"#;

    #[test]
    fn replayed_signatures_are_accepted() -> Result<(), VerifyError> {
        let verification = verify(SIGNED)?;
        assert_eq!(verification.results_code(), "a1");
        let summary = &verification.results[0].summary;
        assert!(summary.contains("sent by Attacker and not by Alice"));
        assert!(!summary.contains("forced pass"));
        Ok(())
    }

    #[test]
    fn leaked_signing_keys_force_signature_checks() -> Result<(), VerifyError> {
        let src = SIGNED.replace("    s2 = SIGN(sk, m2)\n", "    s2 = SIGN(sk, m2)\n    leaks sk\n");
        assert!(src.contains("leaks sk"));
        for parallel in [true, false] {
            let verification = Verifier::new()
                .set_parallel(parallel)
                .verify_str("signed.vp", &src)?;
            assert_eq!(verification.results_code(), "a1");
            assert!(verification.results[0].summary.contains("(forced pass)"));
        }
        Ok(())
    }

    #[test]
    fn knowledge_learned_mid_stage_reaches_later_principals() -> Result<(), VerifyError> {
        let verification = Verifier::new().set_parallel(false).with_max_stage(1).verify_str(
            "relay.vp",
            r#"
attacker[active]
principal Bob[
    knows private k
    generates y
    gy = G^y
]
Bob -> Alice: gy
principal Alice[
    knows private k
    generates s, m
    gs = G^s
    e1 = ENC(k, gy^s)
    e2 = ENC(k, m)
]
Alice -> Bob: gs, e1, e2
principal Bob[
    d = DEC(k, e2)
    r = HASH(d)
]
queries[
    confidentiality? r
]
"#,
        )?;
        assert_eq!(verification.results_code(), "c1");
        assert!(verification.results[0]
            .summary
            .contains("r (HASH(G^nil^s)) is obtained by Attacker."));
        Ok(())
    }

    #[test]
    fn honest_check_failures_are_fatal() {
        let result = verify(
            r#"
attacker[passive]
principal Alice[
    knows private k
    knows public ad
    generates m
    e = AEAD_ENC(k, m, ad)
]
Alice -> Bob: e
principal Bob[
    knows private j
    knows public ad
    d = AEAD_DEC(j, e, ad)?
]
queries[ confidentiality? m ]
"#,
        );
        match result {
            Err(VerifyError::Sanity(SanityError::CheckedPrimitiveFails { principal, .. })) => {
                assert_eq!(principal, "Bob")
            }
            other => panic!("expected a failed check, got {other:?}"),
        }
    }

    #[test]
    fn file_names_are_checked() {
        let err = Verifier::new().verify_file("model.txt").unwrap_err();
        assert!(matches!(err, VerifyError::FileName { .. }));
        let long = format!("{}.vp", "a".repeat(64));
        let err = Verifier::new().verify_file(long).unwrap_err();
        assert!(matches!(err, VerifyError::FileName { .. }));
        assert_eq!(err.exit_code(), 1);

        let err = Verifier::new().verify_file("missing.vp").unwrap_err();
        assert!(matches!(err, VerifyError::Io { .. }));
    }

    #[test]
    fn parse_errors_surface() {
        let err = verify("attacker[sleepy]").unwrap_err();
        assert!(matches!(err, VerifyError::Parse(_)));
    }
}
