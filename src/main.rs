use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ember::diagnostic::{ansi::AnsiRenderer, json, registry};
use ember::engine::{self, EngineConfig, EngineError};
use ember::{Diagnostic, Engine, Value};

const EXIT_COMPILE: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiagnosticFormat {
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "ember", version)]
#[command(about = "Run ember scripts")]
struct Cli {
    /// Script to run
    file: Option<PathBuf>,

    /// Run CODE instead of a file
    #[arg(short = 'e', long = "eval", value_name = "CODE", conflicts_with = "file")]
    eval: Option<String>,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    dump: bool,

    /// Print the syntax tree as JSON instead of running
    #[arg(long, conflicts_with = "dump")]
    emit_ast: bool,

    #[arg(long, value_enum, default_value_t = DiagnosticFormat::Human)]
    diagnostics: DiagnosticFormat,

    /// Explain a diagnostic code, e.g. EMB-R201
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,

    #[arg(long)]
    no_color: bool,

    /// JSON engine configuration
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Add a directory to the include search path
    #[arg(short = 'I', long = "include-path", value_name = "DIR")]
    include_paths: Vec<PathBuf>,

    #[arg(long, value_name = "N")]
    max_depth: Option<usize>,

    #[arg(long, value_name = "N")]
    max_values: Option<usize>,

    /// Do not report notices
    #[arg(long)]
    no_notices: bool,

    /// Arguments passed to the script as $argv
    #[arg(last = true, value_name = "ARGS")]
    args: Vec<String>,
}

#[derive(Clone, Copy)]
struct Reporter {
    format: DiagnosticFormat,
    use_color: bool,
}

impl Reporter {
    fn render(&self, d: &Diagnostic) -> String {
        match self.format {
            DiagnosticFormat::Human => AnsiRenderer { use_color: self.use_color }.render(d),
            DiagnosticFormat::Json => format!("{}\n", json::render(d)),
        }
    }

    fn emit(&self, d: &Diagnostic) {
        let _ = std::io::stderr().lock().write_all(self.render(d).as_bytes());
    }
}

fn usage_error(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("ember: {message}");
    ExitCode::from(EXIT_COMPILE)
}

fn load_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            EngineConfig::from_json(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    config.include_paths.extend(cli.include_paths.iter().cloned());
    if let Some(depth) = cli.max_depth {
        config.max_recursion_depth = depth;
    }
    if cli.max_values.is_some() {
        config.max_values = cli.max_values;
    }
    if cli.no_notices {
        config.report_notices = false;
    }
    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("EMBER_LOG").unwrap_or_else(|_| EnvFilter::new("off")))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::from(EXIT_COMPILE) } else { ExitCode::SUCCESS };
        }
    };

    if let Some(code) = &cli.explain {
        return match registry::lookup(code) {
            Some(entry) => {
                print!("{}", entry.long);
                ExitCode::SUCCESS
            }
            None => usage_error(format!("unknown diagnostic code '{code}'")),
        };
    }

    let reporter = Reporter {
        format: cli.diagnostics,
        use_color: !cli.no_color && std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal(),
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(message) => return usage_error(message),
    };

    let source = match (&cli.eval, &cli.file) {
        (Some(code), _) => code.clone(),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => return usage_error(EngineError::Io { path: path.clone(), source: e }),
        },
        (None, None) => return usage_error("no script given; pass FILE or -e CODE (see --help)"),
    };

    if cli.emit_ast {
        return match engine::parse_source(&source, config.max_compile_errors) {
            Ok(ast) => match serde_json::to_string_pretty(&ast) {
                Ok(text) => {
                    println!("{text}");
                    ExitCode::SUCCESS
                }
                Err(e) => usage_error(format!("cannot serialize syntax tree: {e}")),
            },
            Err(diagnostics) => {
                diagnostics.iter().for_each(|d| reporter.emit(d));
                ExitCode::from(EXIT_COMPILE)
            }
        };
    }

    let mut engine = Engine::new(config);
    engine.on_output(|bytes| {
        let _ = std::io::stdout().lock().write_all(bytes);
    });
    engine.on_diagnostic(move |d| reporter.emit(d));

    // compile errors already reached the diagnostic consumer
    let program = match engine.compile(&source) {
        Ok(program) => program,
        Err(EngineError::Compile(_)) => return ExitCode::from(EXIT_COMPILE),
        Err(e) => return usage_error(e),
    };

    if cli.dump {
        print!("{}", program.disassemble());
        return ExitCode::SUCCESS;
    }

    engine.set_global("argv", Value::from(cli.args.clone()));

    let outcome = engine.run(program);
    let _ = std::io::stdout().flush();
    match outcome {
        Ok(execution) => {
            debug!(status = execution.exit_status, diagnostics = execution.diagnostics.len(), "finished");
            ExitCode::from((execution.exit_status & 0xff) as u8)
        }
        Err(_) => ExitCode::from(EXIT_FATAL),
    }
}
