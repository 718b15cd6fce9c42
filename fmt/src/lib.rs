use std::fmt::Write;
use std::ops::Deref;

use itertools::Itertools;
use verisym_parse::ast::{Block, Expression, Ident, Model, Query, Value};
use verisym_parse::parse_model;

pub fn prettify(src: &str) -> Result<Option<String>, std::fmt::Error> {
    let model = if let Ok(model) = parse_model(src) {
        model
    } else {
        return Ok(None);
    };

    pretty_model(&model).map(Some)
}

/// Renders a model in canonical form.
pub fn pretty_model<S: Deref<Target = str>>(model: &Model<S>) -> Result<String, std::fmt::Error> {
    let mut buf = String::new();

    writeln!(buf, "attacker[{}]", model.attacker)?;
    writeln!(buf)?;

    for block in model.blocks.iter() {
        match block {
            Block::Principal(p) => {
                writeln!(buf, "principal {}[", p.name)?;
                for expr in p.expressions.iter() {
                    write!(buf, "\t")?;
                    pretty_expression(&mut buf, expr)?;
                    writeln!(buf)?;
                }
                writeln!(buf, "]")?;
            }
            Block::Message(m) => {
                writeln!(
                    buf,
                    "{} -> {}: {}",
                    m.sender,
                    m.recipient,
                    m.constants.iter().format(", ")
                )?;
            }
            Block::Phase(phase) => writeln!(buf, "phase[{}]", phase.number)?,
        }
        writeln!(buf)?;
    }

    writeln!(buf, "queries[")?;
    for query in model.queries.iter() {
        write!(buf, "\t")?;
        pretty_query(&mut buf, query)?;
        writeln!(buf)?;
    }
    writeln!(buf, "]")?;

    Ok(buf)
}

fn pretty_expression<S: Deref<Target = str>>(
    buf: &mut String,
    expr: &Expression<S>,
) -> std::fmt::Result {
    match expr {
        Expression::Knows {
            qualifier,
            constants,
        } => write!(buf, "knows {} {}", qualifier, constants.iter().format(", ")),
        Expression::Generates { constants } => {
            write!(buf, "generates {}", constants.iter().format(", "))
        }
        Expression::Leaks { constants } => write!(buf, "leaks {}", constants.iter().format(", ")),
        Expression::Assignment { left, right } => {
            write!(buf, "{} = ", left.iter().format(", "))?;
            pretty_value(buf, right)
        }
    }
}

fn pretty_constant<S: Deref<Target = str>>(buf: &mut String, c: &Ident<S>) -> std::fmt::Result {
    if c.as_str() == "g" {
        write!(buf, "G")
    } else {
        write!(buf, "{}", c)
    }
}

fn pretty_value<S: Deref<Target = str>>(buf: &mut String, value: &Value<S>) -> std::fmt::Result {
    match value {
        Value::Constant(c) => pretty_constant(buf, c),
        Value::Primitive { name, args, check } => {
            write!(buf, "{}(", name)?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(buf, ", ")?;
                }
                pretty_value(buf, arg)?;
            }
            write!(buf, ")")?;
            if *check {
                write!(buf, "?")?;
            }
            Ok(())
        }
        Value::Equation(values) => {
            for (i, c) in values.iter().enumerate() {
                if i > 0 {
                    write!(buf, "^")?;
                }
                pretty_constant(buf, c)?;
            }
            Ok(())
        }
    }
}

fn pretty_query<S: Deref<Target = str>>(buf: &mut String, query: &Query<S>) -> std::fmt::Result {
    write!(buf, "{}", query)?;
    if query.options.is_empty() {
        return Ok(());
    }
    writeln!(buf, "[")?;
    for option in query.options.iter() {
        writeln!(buf, "\t\tprecondition[{}]", option.message)?;
    }
    write!(buf, "\t]")
}
