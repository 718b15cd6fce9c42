//! Human-readable text for deductions and results.

use crate::knowledge::KnowledgeMap;
use crate::primitive;
use crate::principal::PrincipalState;
use crate::results::QueryOptionResult;
use crate::value::Value;

fn literal_number(n: usize) -> String {
    match n {
        0 => "First".to_string(),
        1 => "Second".to_string(),
        2 => "Third".to_string(),
        3 => "Fourth".to_string(),
        4 => "Fifth".to_string(),
        n => format!("{}th", n + 1),
    }
}

/// How a revealed value is named in deduction messages.
pub fn output_text(revealed: &Value) -> String {
    match revealed {
        Value::Primitive(p) => {
            if primitive::spec(p.name).output == [1] {
                format!("Output of {revealed}")
            } else {
                format!("{} output of {revealed}", literal_number(p.output))
            }
        }
        _ => revealed.to_string(),
    }
}

/// One line per slot whose value differs from what the model declares.
pub fn mutated_values(km: &KnowledgeMap, state: &PrincipalState) -> String {
    let mut out = String::new();
    for (slot, declared) in state.slots.iter().zip(km.slots.values()) {
        let (declared, _) = km.resolve_internal_values(&declared.assigned);
        if slot.before_rewrite.equivalent(&declared, false) {
            continue;
        }
        out.push_str(&format!("\n            {} → {}", slot.constant(), slot.assigned));
        if slot.mutated {
            out.push_str(" (mutated by attacker)");
        }
    }
    out
}

pub fn result_summary(mutated: &str, summary: &str, options: &[QueryOptionResult]) -> String {
    let mut contradicted = String::new();
    for option in options.iter().filter(|o| o.resolved) {
        if contradicted.is_empty() {
            contradicted.push_str("            Furthermore, the following options are contradicted:\n");
        }
        contradicted.push_str(&format!("             - {}\n", option.summary));
    }
    let intro = if mutated.is_empty() { "" } else { "When:" };
    format!("{intro}{mutated}\n           {summary}\n{contradicted}")
}
