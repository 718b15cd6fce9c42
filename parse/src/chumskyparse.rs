use crate::ast::{
    AttackerKind, Block, Expression, Ident, Message, Model, Phase, Principal, Qualifier, Query,
    QueryKind, QueryMessage, QueryOption, Transfer, Value,
};
use chumsky::{prelude::*, Stream};

pub type Span = std::ops::Range<usize>;

fn lexer() -> impl Parser<char, Vec<(Token, Span)>, Error = Simple<char>> {
    let arrow = just("->").or(just("→")).to(Token::Arrow);
    let comma = just(',').to(Token::Comma);
    let colon = just(':').to(Token::Colon);
    let equals = just('=').to(Token::Equals);
    let caret = just('^').to(Token::Caret);
    let question = just('?').to(Token::Question);

    let lparen = just('(').to(Token::LParen);
    let rparen = just(')').to(Token::RParen);
    let lbracket = just('[').to(Token::LBracket);
    let rbracket = just(']').to(Token::RBracket);

    let num = text::int(10).map(Token::Num);

    // A parser for identifiers and keywords
    let word = text::ident().map(|ident: String| match ident.as_str() {
        "attacker" => Token::Attacker,
        "active" => Token::Active,
        "passive" => Token::Passive,
        "principal" => Token::Principal,
        "knows" => Token::Knows,
        "generates" => Token::Generates,
        "leaks" => Token::Leaks,
        "public" => Token::Public,
        "private" => Token::Private,
        "password" => Token::Password,
        "phase" => Token::Phase,
        "queries" => Token::Queries,
        "precondition" => Token::Precondition,
        "confidentiality" => Token::Confidentiality,
        "authentication" => Token::Authentication,
        "freshness" => Token::Freshness,
        "unlinkability" => Token::Unlinkability,
        _ => Token::Ident(ident),
    });

    let token = word
        .or(num)
        .or(arrow)
        .or(comma)
        .or(colon)
        .or(equals)
        .or(caret)
        .or(question)
        .or(lparen)
        .or(rparen)
        .or(lbracket)
        .or(rbracket)
        .recover_with(skip_then_retry_until([]));

    let comment = just("//").then(take_until(just('\n'))).padded();

    token
        .map_with_span(|tok, span| (tok, span))
        .padded_by(comment.repeated())
        .padded()
        .repeated()
        .then_ignore(end())
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum Token {
    Ident(String),
    Num(String),
    Arrow,
    Comma,
    Colon,
    Equals,
    Caret,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Attacker,
    Active,
    Passive,
    Principal,
    Knows,
    Generates,
    Leaks,
    Public,
    Private,
    Password,
    Phase,
    Queries,
    Precondition,
    Confidentiality,
    Authentication,
    Freshness,
    Unlinkability,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Token::Ident(s) | Token::Num(s) => return write!(f, "{s}"),
            Token::Arrow => "->",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Equals => "=",
            Token::Caret => "^",
            Token::Question => "?",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Attacker => "attacker",
            Token::Active => "active",
            Token::Passive => "passive",
            Token::Principal => "principal",
            Token::Knows => "knows",
            Token::Generates => "generates",
            Token::Leaks => "leaks",
            Token::Public => "public",
            Token::Private => "private",
            Token::Password => "password",
            Token::Phase => "phase",
            Token::Queries => "queries",
            Token::Precondition => "precondition",
            Token::Confidentiality => "confidentiality",
            Token::Authentication => "authentication",
            Token::Freshness => "freshness",
            Token::Unlinkability => "unlinkability",
        };
        write!(f, "{s}")
    }
}

fn ident_parser() -> impl Parser<Token, Ident<String>, Error = Simple<Token>> + Clone {
    select! { Token::Ident(var) => var }
        .map_with_span(|var, span: Span| Ident(var, (span.start, span.end - span.start).into()))
}

fn constant_parser() -> impl Parser<Token, Ident<String>, Error = Simple<Token>> + Clone {
    ident_parser().map(|i| i.map(|s| s.to_lowercase()))
}

fn constants_parser() -> impl Parser<Token, Vec<Ident<String>>, Error = Simple<Token>> + Clone {
    constant_parser()
        .separated_by(just(Token::Comma))
        .at_least(1)
}

fn principal_name_parser() -> impl Parser<Token, Ident<String>, Error = Simple<Token>> + Clone {
    ident_parser().map(|i| i.map(|s| title_case(&s)))
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

pub fn value_parser() -> impl Parser<Token, Value<String>, Error = Simple<Token>> + Clone {
    recursive(|value| {
        let primitive = ident_parser()
            .map(|i| i.map(|s| s.to_uppercase()))
            .then(
                value
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(just(Token::Question).or_not())
            .map(|((name, args), check)| Value::Primitive {
                name,
                args,
                check: check.is_some(),
            });
        let equation = constant_parser()
            .then(
                just(Token::Caret)
                    .ignore_then(constant_parser())
                    .repeated()
                    .at_least(1),
            )
            .map(|(base, mut exponents)| {
                exponents.insert(0, base);
                Value::Equation(exponents)
            });
        primitive
            .or(equation)
            .or(constant_parser().map(Value::Constant))
    })
}

fn expression_parser() -> impl Parser<Token, Expression<String>, Error = Simple<Token>> + Clone {
    let qualifier = select! {
        Token::Public => Qualifier::Public,
        Token::Private => Qualifier::Private,
        Token::Password => Qualifier::Password,
    };

    let knows = just(Token::Knows)
        .ignore_then(qualifier)
        .then(constants_parser())
        .map(|(qualifier, constants)| Expression::Knows {
            qualifier,
            constants,
        });
    let generates = just(Token::Generates)
        .ignore_then(constants_parser())
        .map(|constants| Expression::Generates { constants });
    let leaks = just(Token::Leaks)
        .ignore_then(constants_parser())
        .map(|constants| Expression::Leaks { constants });
    let assignment = constants_parser()
        .then_ignore(just(Token::Equals))
        .then(value_parser())
        .try_map(|(left, right), span| match right {
            Value::Constant(_) => Err(Simple::custom(span, "cannot assign value to value")),
            right => Ok(Expression::Assignment { left, right }),
        });

    knows.or(generates).or(leaks).or(assignment)
}

fn query_message_parser(
) -> impl Parser<Token, QueryMessage<String>, Error = Simple<Token>> + Clone {
    principal_name_parser()
        .then_ignore(just(Token::Arrow))
        .then(principal_name_parser())
        .then_ignore(just(Token::Colon))
        .then(constants_parser())
        .map(|((sender, recipient), constants)| QueryMessage {
            sender,
            recipient,
            constants,
        })
}

fn query_parser() -> impl Parser<Token, Query<String>, Error = Simple<Token>> + Clone {
    let option = just(Token::Precondition)
        .ignore_then(
            query_message_parser().delimited_by(just(Token::LBracket), just(Token::RBracket)),
        )
        .map(|message| QueryOption { message });
    let options = option
        .repeated()
        .delimited_by(just(Token::LBracket), just(Token::RBracket))
        .or_not()
        .map(|options| options.unwrap_or_default());

    let kind = select! {
        Token::Confidentiality => QueryKind::Confidentiality,
        Token::Authentication => QueryKind::Authentication,
        Token::Freshness => QueryKind::Freshness,
        Token::Unlinkability => QueryKind::Unlinkability,
    }
    .then_ignore(just(Token::Question));

    let authentication = kind
        .clone()
        .try_map(|kind, span| match kind {
            QueryKind::Authentication => Ok(kind),
            _ => Err(Simple::custom(span, "expected authentication query")),
        })
        .ignore_then(query_message_parser())
        .then(options.clone())
        .map(|(message, options)| Query {
            kind: QueryKind::Authentication,
            constants: vec![],
            message: Some(message),
            options,
        });

    let others = kind
        .try_map(|kind, span| match kind {
            QueryKind::Authentication => {
                Err(Simple::custom(span, "expected a sender and recipient"))
            }
            kind => Ok(kind),
        })
        .then(constants_parser())
        .then(options)
        .map(|((kind, constants), options)| Query {
            kind,
            constants,
            message: None,
            options,
        });

    authentication.or(others)
}

pub fn model_parser() -> impl Parser<Token, Model<String>, Error = Simple<Token>> {
    let attacker = just(Token::Attacker).ignore_then(
        select! {
            Token::Active => AttackerKind::Active,
            Token::Passive => AttackerKind::Passive,
        }
        .delimited_by(just(Token::LBracket), just(Token::RBracket)),
    );

    let principal = just(Token::Principal)
        .ignore_then(principal_name_parser())
        .then(
            expression_parser()
                .repeated()
                .delimited_by(just(Token::LBracket), just(Token::RBracket)),
        )
        .map(|(name, expressions)| Block::Principal(Principal { name, expressions }));

    let transfer = constant_parser()
        .map(|name| Transfer { name, guard: false })
        .or(constant_parser()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map(|name| Transfer { name, guard: true }));

    let message = principal_name_parser()
        .then_ignore(just(Token::Arrow))
        .then(principal_name_parser())
        .then_ignore(just(Token::Colon))
        .then(transfer.separated_by(just(Token::Comma)).at_least(1))
        .map(|((sender, recipient), constants)| {
            Block::Message(Message {
                sender,
                recipient,
                constants,
            })
        });

    let phase = just(Token::Phase)
        .ignore_then(
            select! { Token::Num(n) => n }
                .delimited_by(just(Token::LBracket), just(Token::RBracket)),
        )
        .try_map(|n, span: Span| {
            n.parse::<u32>()
                .map(|number| {
                    Block::Phase(Phase {
                        number,
                        span: (span.start, span.end - span.start).into(),
                    })
                })
                .map_err(|e| Simple::custom(span, e.to_string()))
        });

    let queries = just(Token::Queries).ignore_then(
        query_parser()
            .repeated()
            .delimited_by(just(Token::LBracket), just(Token::RBracket)),
    );

    attacker
        .then(principal.or(phase).or(message).repeated().at_least(1))
        .then(queries)
        .map(|((attacker, blocks), queries)| Model {
            attacker,
            blocks,
            queries,
        })
        .then_ignore(end())
}

/// Lexes and parses `src`. Spans in the result are byte offsets into `src`.
pub fn parse_model(src: &str) -> (Option<Model<String>>, Vec<ParseFailure>) {
    #[allow(clippy::type_complexity)]
    static LEXER: once_cell::sync::Lazy<
        std::sync::Arc<dyn Parser<char, Vec<(Token, Span)>, Error = Simple<char>> + Send + Sync>,
    > = once_cell::sync::Lazy::new(|| std::sync::Arc::new(lexer()));

    let offsets = ByteOffsets::new(src);

    let (tokens, errs) = LEXER.parse_recovery(src);

    if !errs.is_empty() {
        return (
            None,
            errs.into_iter()
                .map(|err| ParseFailure::from_simple(err.map(|c| c.to_string()), &offsets, true))
                .collect(),
        );
    }
    let tokens = match tokens {
        Some(tokens) => tokens,
        None => return (None, vec![]),
    };

    let tokens = tokens
        .into_iter()
        .map(|(tok, span)| (tok, offsets.convert(span)));

    let len = src.len();
    let (model, parse_errs) =
        model_parser().parse_recovery(Stream::from_iter(len..len + 1, tokens));

    (
        model,
        parse_errs
            .into_iter()
            .map(|err| {
                ParseFailure::from_simple(err.map(|tok| tok.to_string()), &ByteOffsets::identity(), false)
            })
            .collect(),
    )
}

/// A parser error with its span already in byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    pub span: Span,
    pub found: Option<String>,
    pub expected: Vec<String>,
    pub unclosed: Option<String>,
    pub custom: Option<String>,
    /// Raised by the lexer rather than the parser.
    pub lexical: bool,
}

impl ParseFailure {
    fn from_simple(err: Simple<String>, offsets: &ByteOffsets, lexical: bool) -> Self {
        let (unclosed, custom) = match err.reason() {
            chumsky::error::SimpleReason::Unclosed { delimiter, .. } => {
                (Some(delimiter.clone()), None)
            }
            chumsky::error::SimpleReason::Custom(msg) => (None, Some(msg.clone())),
            chumsky::error::SimpleReason::Unexpected => (None, None),
        };
        let mut expected = err
            .expected()
            .map(|e| match e {
                Some(e) => format!("\"{e}\""),
                None => "end of input".to_string(),
            })
            .collect::<Vec<_>>();
        expected.sort();
        ParseFailure {
            span: offsets.convert(err.span()),
            found: err.found().cloned(),
            expected,
            unclosed,
            custom,
            lexical,
        }
    }
}

/// Maps chumsky's character indices onto byte offsets.
struct ByteOffsets(Option<Vec<usize>>);

impl ByteOffsets {
    fn new(src: &str) -> Self {
        let mut offsets: Vec<usize> = src.char_indices().map(|(i, _)| i).collect();
        offsets.push(src.len());
        ByteOffsets(Some(offsets))
    }

    fn identity() -> Self {
        ByteOffsets(None)
    }

    fn convert(&self, span: Span) -> Span {
        match &self.0 {
            Some(offsets) => {
                let last = offsets.last().copied().unwrap_or(0);
                let at = |i: usize| offsets.get(i).copied().unwrap_or(last);
                at(span.start)..at(span.end)
            }
            None => span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static HANDSHAKE: &str = r#"
// A toy handshake
attacker[active]

principal Alice[
    knows public c0
    knows private ka
    generates a
    ga = G^a
]

principal Bob[
    knows private kb
    generates b
    gb = g^b
]

Alice -> Bob: ga
Bob -> Alice: [gb]

principal Alice[
    ss_a = gb^a
    e1 = AEAD_ENC(ss_a, c0, nil)
    _ = HASH(e1)
]

phase[1]

principal Bob[
    ss_b = ga^b
    leaks kb
]

Alice → Bob: e1

principal Bob[
    m = AEAD_DEC(ss_b, e1, nil)?
]

queries[
    confidentiality? c0
    authentication? Alice -> Bob: e1[
        precondition[Alice -> Bob: e1]
    ]
    freshness? a
    unlinkability? ga, gb
]
"#;

    #[test]
    fn lexes_comments_and_arrows() {
        let (tokens, errs) = lexer().parse_recovery("// hi\nalice -> bob → [x]");
        assert!(errs.is_empty(), "{errs:?}");
        let tokens: Vec<Token> = tokens.unwrap().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("alice".into()),
                Token::Arrow,
                Token::Ident("bob".into()),
                Token::Arrow,
                Token::LBracket,
                Token::Ident("x".into()),
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn parses_full_model() {
        let (model, errs) = parse_model(HANDSHAKE);
        if !errs.is_empty() {
            panic!("{errs:?}");
        }
        let model = model.unwrap();

        assert_eq!(model.attacker, AttackerKind::Active);
        assert_eq!(model.blocks.len(), 9);
        assert_eq!(model.queries.len(), 4);
        assert_eq!(model.principals().count(), 5);

        match &model.blocks[0] {
            Block::Principal(p) => {
                assert_eq!(p.name.as_str(), "Alice");
                assert_eq!(p.expressions.len(), 4);
                match &p.expressions[3] {
                    Expression::Assignment { left, right } => {
                        assert_eq!(left[0].as_str(), "ga");
                        assert_eq!(right.to_string(), "g^a");
                    }
                    e => panic!("unexpected {e:?}"),
                }
            }
            b => panic!("unexpected {b:?}"),
        }
        match &model.blocks[3] {
            Block::Message(m) => {
                assert_eq!(m.sender.as_str(), "Bob");
                assert!(m.constants[0].guard);
            }
            b => panic!("unexpected {b:?}"),
        }
        assert!(matches!(model.blocks[5], Block::Phase(Phase { number: 1, .. })));
        match &model.blocks[8] {
            Block::Principal(p) => match &p.expressions[0] {
                Expression::Assignment { right, .. } => {
                    assert_eq!(right.to_string(), "AEAD_DEC(ss_b, e1, nil)?")
                }
                e => panic!("unexpected {e:?}"),
            },
            b => panic!("unexpected {b:?}"),
        }

        let auth = &model.queries[1];
        assert_eq!(auth.kind, QueryKind::Authentication);
        assert_eq!(auth.options.len(), 1);
        assert_eq!(auth.to_string(), "authentication? Alice -> Bob: e1");
        assert_eq!(model.queries[3].constants.len(), 2);
    }

    #[test]
    fn rejects_constant_assignment() {
        let src = "attacker[passive] principal A[ knows private x y = x ] queries[]";
        let (_, errs) = parse_model(src);
        assert!(errs
            .iter()
            .any(|e| e.custom.as_deref() == Some("cannot assign value to value")));
    }

    #[test]
    fn spans_are_byte_offsets() {
        let src = "attacker[passive] principal A[ generates x ] A → B: x principal B[ knows private z ] queries[ confidentiality? x ]";
        let (model, errs) = parse_model(src);
        assert!(errs.is_empty(), "{errs:?}");
        let model = model.unwrap();
        let query = &model.queries[0].constants[0];
        assert_eq!(&src[query.span().offset()..query.span().offset() + 1], "x");
    }
}
