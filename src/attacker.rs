//! The attacker's knowledge, shared by every analysis of a run.
//!
//! The state only ever grows. Readers take an [`Arc`] snapshot, so a frame
//! keeps a consistent view while other frames write.

use std::sync::{Arc, PoisonError, RwLock};

use smol_str::SmolStr;

use crate::error::InternalError;
use crate::principal::PrincipalState;
use crate::value::{find_equivalent, push_unique, Value};
use verisym_parse::ast::Qualifier;

#[derive(Debug, Clone, Default)]
pub struct AttackerState {
    pub active: bool,
    pub current_phase: u32,
    /// Deduplicated under structural equivalence.
    pub known: Vec<Value>,
    /// The state each known value was learned in.
    pub provenance: Vec<Arc<PrincipalState>>,
    /// Whether each known value was observed on the wire.
    pub wire: Vec<bool>,
    /// Principals each known value has already been mutated toward.
    pub mutated_to: Vec<Vec<SmolStr>>,
    /// Values considered during injection. Only ever logged.
    pub conceivable: Vec<Value>,
}

impl AttackerState {
    pub fn knows(&self, v: &Value) -> bool {
        find_equivalent(v, &self.known).is_some()
    }

    pub fn index_of(&self, v: &Value) -> Option<usize> {
        find_equivalent(v, &self.known)
    }

    fn push(&mut self, v: Value, state: Arc<PrincipalState>, wire: bool) -> bool {
        if self.knows(&v) {
            return false;
        }
        self.known.push(v);
        self.provenance.push(state);
        self.wire.push(wire);
        self.mutated_to.push(Vec::new());
        true
    }
}

/// Owner of the shared [`AttackerState`].
#[derive(Debug, Default)]
pub struct Attacker {
    state: RwLock<Arc<AttackerState>>,
}

impl Attacker {
    pub fn new(active: bool) -> Self {
        let attacker = Attacker::default();
        attacker.init(active);
        attacker
    }

    /// Forgets everything; used at the start of each phase.
    pub fn init(&self, active: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = Arc::new(AttackerState {
            active,
            ..AttackerState::default()
        });
    }

    pub fn read(&self) -> Arc<AttackerState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write<R>(&self, f: impl FnOnce(&mut AttackerState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut state))
    }

    /// Adds `known` unless an equivalent value is already held. Returns
    /// whether it was new.
    pub fn put_write(&self, known: Value, state: &PrincipalState) -> bool {
        if self.read().knows(&known) {
            return false;
        }
        let provenance = Arc::new(state.clone());
        self.write(|s| s.push(known, provenance, false))
    }

    /// Records that `value` was mutated toward `principal`.
    pub fn put_mutated_to(&self, value: &Value, principal: &SmolStr) {
        self.write(|s| {
            if let Some(i) = s.index_of(value) {
                if !s.mutated_to[i].contains(principal) {
                    s.mutated_to[i].push(principal.clone());
                }
            }
        })
    }

    pub fn put_conceivable(&self, value: Value) -> bool {
        self.write(|s| push_unique(&mut s.conceivable, value))
    }

    /// Moves to `phase` and learns every constant observable by then.
    ///
    /// Public constants come first, then private constants that were sent
    /// or leaked, together with what they resolve to.
    pub fn absorb_phase_values(
        &self,
        state: &PrincipalState,
        phase: u32,
    ) -> Result<(), InternalError> {
        let provenance = Arc::new(state.clone());
        let mut learned = Vec::new();
        for slot in &state.slots {
            let c = slot.constant();
            if c.qualifier != Some(Qualifier::Public) {
                continue;
            }
            if matches!(slot.info.phase.iter().min(), Some(&earliest) if earliest > phase) {
                continue;
            }
            learned.push(Value::Constant(c.clone()));
        }
        for (i, slot) in state.slots.iter().enumerate() {
            let c = slot.constant();
            if slot.info.wire.is_empty() && !c.leaked {
                continue;
            }
            if c.qualifier != Some(Qualifier::Private) {
                continue;
            }
            let earliest = slot
                .info
                .phase
                .iter()
                .min()
                .ok_or_else(|| InternalError::MissingPhase(c.name.clone()))?;
            if *earliest > phase {
                continue;
            }
            learned.push(Value::Constant(c.clone()));
            learned.push(state.resolve_value(&slot.assigned, i, true)?);
        }

        self.write(|s| {
            s.current_phase = phase;
            for v in learned {
                s.push(v, provenance.clone(), true);
            }
        });
        Ok(())
    }
}
