use std::sync::Arc;

use smol_str::SmolStr;
use verisym_parse::ast::Query;

use crate::attacker::Attacker;
use crate::knowledge::KnowledgeMap;
use crate::results::{AnalysisCounter, Results};

/// Everything one verification run shares between its analyses.
#[derive(Debug)]
pub struct Context {
    pub km: Arc<KnowledgeMap>,
    pub attacker: Attacker,
    pub results: Results,
    pub counter: AnalysisCounter,
    pub parallel: bool,
}

impl Context {
    pub fn new(km: Arc<KnowledgeMap>, queries: &[Query<SmolStr>], active: bool) -> Self {
        Context {
            km,
            attacker: Attacker::new(active),
            results: Results::new(queries),
            counter: AnalysisCounter::default(),
            parallel: true,
        }
    }
}
