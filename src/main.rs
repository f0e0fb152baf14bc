use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use inkwell::{context::Context, OptimizationLevel};
use kaljit::session::{Evaluation, Session, SessionConfig, SessionError};
use rustyline::{error::ReadlineError, DefaultEditor};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const HISTORY_FILE: &str = ".kaljit_history";
const PROMPT: &str = "ready> ";

/// Incremental JIT compiler and REPL for a small expression language
#[derive(Parser)]
#[command(name = "kaljit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// File to evaluate; starts the REPL when omitted
    file: Option<PathBuf>,

    /// Print the IR of every declaration
    #[arg(long)]
    print_ir: bool,

    /// Optimization level of the execution engine
    #[arg(long, value_enum, default_value_t = OptLevel::None)]
    opt_level: OptLevel,
}

#[derive(Clone, Copy, ValueEnum)]
enum OptLevel {
    None,
    Less,
    Default,
    Aggressive,
}

impl From<OptLevel> for OptimizationLevel {
    fn from(level: OptLevel) -> Self {
        match level {
            OptLevel::None => OptimizationLevel::None,
            OptLevel::Less => OptimizationLevel::Less,
            OptLevel::Default => OptimizationLevel::Default,
            OptLevel::Aggressive => OptimizationLevel::Aggressive,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SessionConfig {
        print_ir: cli.print_ir,
        opt_level: cli.opt_level.into(),
    };

    let context = Context::create();
    let mut session = Session::new(&context, config).context("failed to start the session")?;

    match &cli.file {
        Some(file) => run_file(&mut session, file),
        None => {
            repl(&mut session)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_file(session: &mut Session, file: &Path) -> anyhow::Result<ExitCode> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut failed = false;
    for result in session.eval_source(&source) {
        failed |= result.is_err();
        report(result);
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn repl(session: &mut Session) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new().context("failed to start the line editor")?;
    let history_path = history_file_path();
    if editor.load_history(&history_path).is_err() {
        debug!(path = %history_path.display(), "no history loaded");
    }

    loop {
        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("failed to read a line"),
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        for result in session.eval_source(&line) {
            report(result);
        }
    }

    if let Err(e) = editor.save_history(&history_path) {
        warn!(error = %e, path = %history_path.display(), "failed to save history");
    }
    Ok(())
}

fn report(result: Result<Evaluation, SessionError>) {
    match result {
        Ok(evaluation) => {
            if let Some(ir) = evaluation.ir() {
                eprint!("{}", ir);
            }
            println!("{}", evaluation);
        }
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn history_file_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(HISTORY_FILE),
        None => PathBuf::from(HISTORY_FILE),
    }
}
