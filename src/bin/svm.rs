//! `svm` - run, compile and inspect slotvm programs
//!
//! ```text
//! svm run program.svmp
//! svm compile program.svmp -o program.svmb
//! svm decompile program.svmb
//! svm inspect program.svmp --json
//! ```
//!
//! Set `RUST_LOG=slotvm=debug` to trace scope building and execution.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slotvm::{
    Engine, RuntimeConfig, ScopeTree, StdHost, compile_text, decode_binary, encode_binary,
    encode_text,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "svm", version)]
#[command(about = "Slot/scope runtime for a list-only Lisp")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a program; the exit code is the program's
    Run {
        file: PathBuf,

        #[command(flatten)]
        input: InputArgs,

        /// Maximum number of active scope frames
        #[arg(long)]
        max_frames: Option<usize>,

        /// Stop after this many executed instructions
        #[arg(long)]
        step_limit: Option<u64>,
    },
    /// Compile text to the binary form
    Compile {
        file: PathBuf,

        /// Output path (defaults to the input with an .svmb extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the canonical text form of a program
    Decompile {
        file: PathBuf,

        #[command(flatten)]
        input: InputArgs,
    },
    /// Dump the scope table
    Inspect {
        file: PathBuf,

        #[command(flatten)]
        input: InputArgs,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Treat the input as binary regardless of its extension
    #[arg(long)]
    binary: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn is_binary(path: &Path, input: &InputArgs) -> bool {
    input.binary || path.extension().is_some_and(|ext| ext == "svmb")
}

fn load(path: &Path, input: &InputArgs, config: &RuntimeConfig) -> Result<ScopeTree> {
    let tree = if is_binary(path, input) {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        decode_binary(&bytes, config)
    } else {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        compile_text(&source, config)
    };
    tree.with_context(|| format!("loading {}", path.display()))
}

fn print_table(tree: &ScopeTree) {
    println!("{:>5}  {:>6}  {:<12}  {:>5}  slots", "scope", "parent", "label", "len");
    for scope in tree.summary() {
        let parent = scope.parent.map_or_else(|| "-".to_owned(), |p| p.to_string());
        let label = scope.label.unwrap_or_else(|| "-".to_owned());
        println!(
            "{:>5}  {:>6}  {:<12}  {:>5}  {}",
            scope.id,
            parent,
            label,
            scope.slot_count,
            scope.slots.join(" ")
        );
    }
}

fn execute(command: Command) -> Result<ExitCode> {
    let mut config = RuntimeConfig::default();
    match command {
        Command::Run {
            file,
            input,
            max_frames,
            step_limit,
        } => {
            if let Some(max_frames) = max_frames {
                config = config.with_max_frames(max_frames);
            }
            if let Some(limit) = step_limit {
                config = config.with_step_limit(limit);
            }
            let tree = load(&file, &input, &config)?;
            let mut engine = Engine::new(tree, StdHost, config);
            let outcome = engine
                .run()
                .with_context(|| format!("running {}", file.display()))?;
            // process exit statuses are a single byte
            Ok(ExitCode::from(outcome.exit_code as u8))
        }
        Command::Compile { file, output } => {
            let input = InputArgs { binary: false };
            let tree = load(&file, &input, &config)?;
            let output = output.unwrap_or_else(|| file.with_extension("svmb"));
            std::fs::write(&output, encode_binary(&tree))
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(scopes = tree.len(), output = %output.display(), "compiled");
            Ok(ExitCode::SUCCESS)
        }
        Command::Decompile { file, input } => {
            let input = InputArgs {
                binary: input.binary || file.extension().is_none_or(|ext| ext != "svmp"),
            };
            let tree = load(&file, &input, &config)?;
            print!("{}", encode_text(&tree));
            Ok(ExitCode::SUCCESS)
        }
        Command::Inspect { file, input, json } => {
            let tree = load(&file, &input, &config)?;
            if json {
                let dump = serde_json::to_string_pretty(&tree.summary())?;
                println!("{dump}");
            } else {
                print_table(&tree);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match execute(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
