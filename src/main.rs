use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use verisym::{Verification, Verifier, VerifyError};
use yansi::Paint;

/// Symbolic verification of cryptographic protocol models
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
enum Args {
    /// Verifies the queries of the given model
    Verify {
        /// The path to the model, ending in `.vp`
        #[clap(value_parser)]
        file: PathBuf,

        /// Analyse mutations on a single thread
        #[clap(long)]
        sequential: bool,

        /// Give up on the active attacker after this stage
        #[clap(long, value_parser)]
        max_stage: Option<u32>,

        /// Print the report without colours
        #[clap(long)]
        no_color: bool,
    },
    /// Prints the given model in canonical layout
    Pretty {
        /// The path to the model
        #[clap(value_parser)]
        file: PathBuf,
    },
}

fn main() {
    let hook = miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .context_lines(4)
                .build(),
        )
    }));
    if let Err(err) = hook {
        eprintln!("{err}");
    }

    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let code = match run(Args::parse()) {
        Ok(code) => code,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32, VerifyError> {
    match args {
        Args::Verify {
            file,
            sequential,
            max_stage,
            no_color,
        } => {
            if no_color || !std::io::stdout().is_terminal() {
                Paint::disable();
            }
            let mut verifier = Verifier::new().set_parallel(!sequential);
            if let Some(stage) = max_stage {
                verifier = verifier.with_max_stage(stage);
            }
            let verification = verifier.verify_file(&file)?;
            print_report(&verification);
            Ok(verification.exit_code())
        }
        Args::Pretty { file } => {
            let src = std::fs::read_to_string(&file).map_err(|source| VerifyError::Io {
                path: file.display().to_string(),
                source,
            })?;
            verisym::verify::check_model(&src)?;
            match verisym_fmt::prettify(&src) {
                Ok(Some(pretty)) => {
                    print!("{pretty}");
                    Ok(0)
                }
                Ok(None) => Ok(1),
                Err(err) => {
                    tracing::error!("could not format {}: {}", file.display(), err);
                    Ok(1)
                }
            }
        }
    }
}

fn print_report(verification: &Verification) {
    println!(
        "Verification completed for '{}'.",
        Paint::new(&verification.file_name).bold()
    );
    if verification.all_pass() {
        println!("{}", Paint::green("All queries pass."));
        return;
    }
    println!("{}", Paint::yellow("Summary of failed queries will follow."));
    for result in verification.attacked() {
        println!();
        println!(
            "{} — {}",
            Paint::red(&result.query).bold(),
            result.summary
        );
    }
}
