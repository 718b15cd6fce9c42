use miette::SourceSpan;
use smol_str::SmolStr;
use verisym_parse::ParseError;

use crate::primitive::PrimitiveError;

/// A model that parses but does not describe a well-formed protocol.
#[derive(Debug, thiserror::Error, miette::Diagnostic, Clone)]
pub enum SanityError {
    #[error("constant does not exist ({name})")]
    #[diagnostic()]
    UnknownConstant {
        #[source_code]
        src: String,
        #[label("'{name}' is never declared")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("principal does not exist ({name})")]
    #[diagnostic(help("Every principal must have a principal block before it sends or receives"))]
    UnknownPrincipal {
        #[source_code]
        src: String,
        #[label("'{name}' is never declared")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("no principals declared")]
    #[diagnostic()]
    NoPrincipals,
    #[error("more than 64 principals ({count}) declared")]
    #[diagnostic()]
    TooManyPrincipals { count: usize },
    #[error("constant is known more than once and in different ways ({name})")]
    #[diagnostic()]
    InconsistentKnows {
        #[source_code]
        src: String,
        #[label("declared again with a different qualifier or declaration")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("generated constant already exists ({name})")]
    #[diagnostic()]
    GeneratedTwice {
        #[source_code]
        src: String,
        #[label("already declared")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("constant assigned twice ({name})")]
    #[diagnostic()]
    AssignedTwice {
        #[source_code]
        src: String,
        #[label("already declared")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("{principal} is using constant ({name}) despite not knowing it")]
    #[diagnostic()]
    UsingUnknown {
        #[source_code]
        src: String,
        #[label("not known by {principal} at this point")]
        err_span: SourceSpan,
        principal: String,
        name: String,
    },
    #[error("{principal} leaks a constant that they do not know ({name})")]
    #[diagnostic()]
    LeakingUnknown {
        #[source_code]
        src: String,
        #[label("not known by {principal} at this point")]
        err_span: SourceSpan,
        principal: String,
        name: String,
    },
    #[error("{sender} is sending constant ({name}) despite not knowing it")]
    #[diagnostic()]
    SendingUnknown {
        #[source_code]
        src: String,
        #[label("not known by {sender} at this point")]
        err_span: SourceSpan,
        sender: String,
        name: String,
    },
    #[error("{recipient} is receiving constant ({name}) despite already knowing it")]
    #[diagnostic()]
    ReceivingKnown {
        #[source_code]
        src: String,
        #[label("already known by {recipient}")]
        err_span: SourceSpan,
        recipient: String,
        name: String,
    },
    #[error("unknown primitive ({name})")]
    #[diagnostic()]
    UnknownPrimitive {
        #[source_code]
        src: String,
        #[label("not a primitive")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("primitive {name} has {got} inputs, expecting {expected}")]
    #[diagnostic()]
    Arity {
        #[source_code]
        src: String,
        #[label("wrong number of inputs")]
        err_span: SourceSpan,
        name: String,
        got: usize,
        expected: String,
    },
    #[error("primitive {name} has {got} outputs, expecting {expected}")]
    #[diagnostic()]
    Outputs {
        #[source_code]
        src: String,
        #[label("wrong number of outputs")]
        err_span: SourceSpan,
        name: String,
        got: usize,
        expected: String,
    },
    #[error("primitive {name} is checked but does not support checking")]
    #[diagnostic(help("Remove the trailing '?'"))]
    CheckUnsupported {
        #[source_code]
        src: String,
        #[label("cannot be checked")]
        err_span: SourceSpan,
        name: String,
    },
    #[error("phase being declared ({phase}) must be superior to last declared phase ({last})")]
    #[diagnostic()]
    PhaseNotIncreasing {
        #[source_code]
        src: String,
        #[label("declared here")]
        err_span: SourceSpan,
        phase: u32,
        last: u32,
    },
    #[error("phase being declared ({phase}) skips phases since last declared phase ({last})")]
    #[diagnostic()]
    PhaseSkipped {
        #[source_code]
        src: String,
        #[label("declared here")]
        err_span: SourceSpan,
        phase: u32,
        last: u32,
    },
    #[error("{kind} query ({query}) refers to unknown constant ({name})")]
    #[diagnostic()]
    QueryUnknownConstant {
        #[source_code]
        src: String,
        #[label("'{name}' is never declared")]
        err_span: SourceSpan,
        kind: String,
        query: String,
        name: String,
    },
    #[error("unlinkability query ({query}) must specify at least two constants")]
    #[diagnostic()]
    UnlinkabilityTooFew {
        #[source_code]
        src: String,
        #[label("only one constant")]
        err_span: SourceSpan,
        query: String,
    },
    #[error("authentication query ({query}) has more than one constant")]
    #[diagnostic()]
    AuthenticationConstants {
        #[source_code]
        src: String,
        #[label("expected a single constant")]
        err_span: SourceSpan,
        query: String,
    },
    #[error("precondition option message ({query}) has more than one constant")]
    #[diagnostic()]
    PreconditionConstants {
        #[source_code]
        src: String,
        #[label("expected a single constant")]
        err_span: SourceSpan,
        query: String,
    },
    #[error("authentication query ({query}) depends on {sender} sending a constant ({name}) that they do not know")]
    #[diagnostic()]
    AuthenticationNotSent {
        #[source_code]
        src: String,
        #[label("never known by {sender}")]
        err_span: SourceSpan,
        query: String,
        sender: String,
        name: String,
    },
    #[error("authentication query ({query}) depends on {recipient} receiving a constant ({name}) that they never receive")]
    #[diagnostic()]
    AuthenticationNotReceived {
        #[source_code]
        src: String,
        #[label("never received by {recipient}")]
        err_span: SourceSpan,
        query: String,
        recipient: String,
        name: String,
    },
    #[error("authentication query ({query}) depends on {recipient} using a constant ({name}) in a primitive, but this never happens")]
    #[diagnostic()]
    AuthenticationNotUsed {
        #[source_code]
        src: String,
        #[label("never used in a primitive by {recipient}")]
        err_span: SourceSpan,
        query: String,
        recipient: String,
        name: String,
    },
    #[error("checked primitive fails: {primitive}")]
    #[diagnostic(help("{principal} cannot complete the protocol even without an attacker"))]
    CheckedPrimitiveFails { principal: String, primitive: String },
    #[error("too many layers in equation ({equation}), maximum is 2")]
    #[diagnostic()]
    EquationLayers { equation: String },
    #[error("equation ({equation}) does not use 'g' as generator")]
    #[diagnostic()]
    EquationGenerator { equation: String },
    #[error("equation ({equation}) uses 'g' not as a generator")]
    #[diagnostic()]
    EquationMisusedGenerator { equation: String },
}

/// An engine invariant did not hold. Never caused by the model itself.
#[derive(Debug, thiserror::Error, miette::Diagnostic, Clone)]
pub enum InternalError {
    #[error("value resolution exceeded the maximum depth of {0}")]
    DepthExceeded(usize),
    #[error("constant ({0}) has no slot where one must exist")]
    MissingSlot(SmolStr),
    #[error("constant ({0}) is observable but was never sent or leaked in any phase")]
    MissingPhase(SmolStr),
    #[error(transparent)]
    Registry(#[from] PrimitiveError),
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VerifyError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sanity(#[from] SanityError),
    #[error("invalid model file name ({name})")]
    #[diagnostic(help("Model files must end in '.vp' and be at most 64 characters long"))]
    FileName { name: String },
    #[error("could not read {path}")]
    #[diagnostic()]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    #[diagnostic(code(verisym::internal))]
    Internal(#[from] InternalError),
}

impl VerifyError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            VerifyError::Internal(_) => 2,
            _ => 1,
        }
    }
}

/// `1`, `2 or 3`, `1, 2, 3, 4, or 5`
pub(crate) fn pretty_arity(arity: &[usize]) -> String {
    match arity {
        [] => String::new(),
        [one] => one.to_string(),
        [a, b] => format!("{a} or {b}"),
        [init @ .., last] => {
            let mut out = String::new();
            for a in init {
                out.push_str(&format!("{a}, "));
            }
            out.push_str(&format!("or {last}"));
            out
        }
    }
}
