pub mod ast;
pub mod chumskyparse;

use miette::SourceSpan;
use smol_str::SmolStr;

use crate::ast::{Block, Expression, Model};
use crate::chumskyparse::ParseFailure;

/// Names of every primitive the model language knows about.
pub const PRIMITIVES: &[&str] = &[
    "ASSERT",
    "CONCAT",
    "SPLIT",
    "PW_HASH",
    "HASH",
    "HKDF",
    "AEAD_ENC",
    "AEAD_DEC",
    "ENC",
    "DEC",
    "MAC",
    "SIGN",
    "SIGNVERIF",
    "PKE_ENC",
    "PKE_DEC",
    "SHAMIR_SPLIT",
    "SHAMIR_JOIN",
    "RINGSIGN",
    "RINGSIGNVERIF",
    "BLIND",
    "UNBLIND",
];

const KEYWORDS: &[&str] = &[
    "attacker",
    "passive",
    "active",
    "principal",
    "knows",
    "generates",
    "leaks",
    "phase",
    "public",
    "private",
    "password",
    "queries",
    "precondition",
    "confidentiality",
    "authentication",
    "freshness",
    "unlinkability",
];

#[derive(Debug, thiserror::Error, miette::Diagnostic, Clone)]
pub enum ParseError {
    #[error("Invalid character")]
    #[diagnostic()]
    InvalidCharacter {
        #[source_code]
        src: String,
        #[label("This character is not valid in a model")]
        err_span: SourceSpan,
    },
    #[error("Unexpected token")]
    #[diagnostic(help("Expected tokens here are: {expected}"))]
    UnexpectedToken {
        #[source_code]
        src: String,
        #[label = "The token \"{token}\" is unexpected in this context."]
        err_span: SourceSpan,
        token: String,
        expected: String,
    },
    #[error("Unexpected end of model")]
    #[diagnostic(help("Expected tokens in this context are:\n{expected}"))]
    UnexpectedEnd {
        #[source_code]
        src: String,
        #[label = "The model ends too early. Are you missing a token?"]
        err_span: SourceSpan,
        expected: String,
    },
    #[error("Unclosed delimiter")]
    #[diagnostic()]
    UnclosedDelimiter {
        #[source_code]
        src: String,
        #[label = "\"{delimiter}\" is never closed"]
        err_span: SourceSpan,
        delimiter: String,
    },
    #[error("{message}")]
    #[diagnostic()]
    Invalid {
        #[source_code]
        src: String,
        #[label = "here"]
        err_span: SourceSpan,
        message: String,
    },
    #[error("Reserved name '{name}'")]
    #[diagnostic(help("Names of primitives, keywords and names starting with 'attacker' or 'unnamed' are reserved"))]
    ReservedName {
        #[source_code]
        src: String,
        #[label("cannot be declared")]
        err_span: SourceSpan,
        name: String,
    },
}

impl ParseError {
    fn new(src: &str, failure: ParseFailure) -> Self {
        let prep_src = || format!("{}\n", src);
        let err_span: SourceSpan = (failure.span.start, failure.span.len()).into();

        if let Some(message) = failure.custom {
            return ParseError::Invalid {
                src: prep_src(),
                err_span,
                message,
            };
        }
        if let Some(delimiter) = failure.unclosed {
            return ParseError::UnclosedDelimiter {
                src: prep_src(),
                err_span,
                delimiter,
            };
        }
        match failure.found {
            Some(_) if failure.lexical => ParseError::InvalidCharacter {
                src: prep_src(),
                err_span,
            },
            Some(token) => ParseError::UnexpectedToken {
                src: prep_src(),
                err_span,
                token,
                expected: failure.expected.join(", "),
            },
            None => ParseError::UnexpectedEnd {
                src: prep_src(),
                err_span: (src.len(), 0).into(),
                expected: failure.expected.join(", "),
            },
        }
    }
}

/// Parses a model and rejects declarations of reserved names.
pub fn parse_model(src: &str) -> Result<Model<SmolStr>, ParseError> {
    let (model, failures) = chumskyparse::parse_model(src);
    if let Some(failure) = failures.into_iter().next() {
        return Err(ParseError::new(src, failure));
    }
    let model = match model {
        Some(model) => model.map(SmolStr::from),
        None => {
            return Err(ParseError::UnexpectedEnd {
                src: format!("{}\n", src),
                err_span: (src.len(), 0).into(),
                expected: "attacker".to_string(),
            })
        }
    };

    check_reserved(src, &model)?;

    Ok(model)
}

/// Whether `name` may not be declared by a model.
pub fn is_reserved(name: &str) -> bool {
    static PREFIX: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"^(attacker|unnamed)").unwrap());

    let lower = name.to_lowercase();
    matches!(lower.as_str(), "g" | "nil" | "unnamed")
        || KEYWORDS.contains(&lower.as_str())
        || PRIMITIVES.iter().any(|p| p.eq_ignore_ascii_case(&lower))
        || PREFIX.is_match(&lower)
}

fn check_reserved(src: &str, model: &Model<SmolStr>) -> Result<(), ParseError> {
    for block in &model.blocks {
        let p = match block {
            Block::Principal(p) => p,
            _ => continue,
        };
        let mut declared = vec![&p.name];
        for expr in &p.expressions {
            match expr {
                Expression::Knows { constants, .. } | Expression::Generates { constants } => {
                    declared.extend(constants.iter())
                }
                Expression::Assignment { left, .. } => {
                    declared.extend(left.iter().filter(|i| !i.is_unnamed()))
                }
                Expression::Leaks { .. } => {}
            }
        }
        if let Some(ident) = declared.into_iter().find(|i| is_reserved(i.as_str())) {
            return Err(ParseError::ReservedName {
                src: format!("{}\n", src),
                err_span: ident.span(),
                name: ident.to_string(),
            });
        }
    }
    Ok(())
}
