//! Embedding API.
//!
//! An [`Engine`] owns the host side of a script: configuration, registered
//! functions and constants, output and diagnostic consumers. Compiling
//! yields a [`Program`] that can be run any number of times.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ast;
use crate::bytecode::Program;
use crate::compiler;
use crate::diagnostic::Diagnostic;
use crate::lexer;
use crate::parser;
use crate::value::Value;
use crate::vm::{Vm, VmError};

mod config;
mod host;
pub mod stream;

pub use config::EngineConfig;
pub use host::{Arity, CallContext, CallOutcome, ConstantFn, Host, HostCallback, HostFunction};
pub use stream::{DeviceTable, OpenMode, StreamDevice, StreamHandle, StreamStat};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("compilation failed with {} error(s)", .0.len())]
    Compile(Vec<Diagnostic>),
    #[error(transparent)]
    Runtime(#[from] VmError),
    #[error("cannot read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Buffered output; empty when an output consumer is installed.
    pub output: String,
    /// Value of a top-level `return`, or null.
    pub result: Value,
    pub exit_status: i32,
    pub globals: HashMap<String, Value>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Tokenizes and parses `source`, stopping after the first stage that
/// reports errors.
pub fn parse_source(source: &str, max_errors: usize) -> Result<ast::Program, Vec<Diagnostic>> {
    let attach = |d: Diagnostic| d.with_source(source);

    let (tokens, lex_errors) = lexer::tokenize_all(source);
    if !lex_errors.is_empty() {
        return Err(lex_errors.iter().take(max_errors.max(1)).map(Diagnostic::from).map(attach).collect());
    }

    let (program, parse_errors) = parser::parse(&tokens, max_errors);
    if !parse_errors.is_empty() {
        return Err(parse_errors.iter().map(Diagnostic::from).map(attach).collect());
    }
    Ok(program)
}

/// Full front end: source to a runnable program.
pub fn compile_source(source: &str, max_errors: usize) -> Result<Program, Vec<Diagnostic>> {
    let ast = parse_source(source, max_errors)?;
    compiler::compile(&ast).map_err(|errors| errors.iter().map(Diagnostic::from).collect())
}

pub struct Engine {
    host: Host,
    globals: Vec<(String, Value)>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine { host: Host::new(config), globals: Vec::new() }
    }

    pub fn config(&self) -> &EngineConfig {
        self.host.config()
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, arity: Arity, callback: F)
    where
        F: Fn(&mut CallContext<'_>, &[Value]) + 'static,
    {
        self.host.register_function(name, arity, callback);
    }

    pub fn register_constant<F>(&mut self, name: impl Into<String>, make: F)
    where
        F: Fn() -> Value + 'static,
    {
        self.host.register_constant(name, make);
    }

    pub fn register_device(&mut self, device: Box<dyn StreamDevice>) {
        self.host.register_device(device);
    }

    /// Binds a global before every subsequent run. Setting a name again
    /// replaces the earlier value.
    pub fn set_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.globals.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.globals.push((name, value)),
        }
    }

    pub fn on_output(&mut self, sink: impl FnMut(&[u8]) + 'static) {
        self.host.on_output(sink);
    }

    pub fn on_diagnostic(&mut self, sink: impl FnMut(&Diagnostic) + 'static) {
        self.host.on_diagnostic(sink);
    }

    /// Compiles a script. Every compile diagnostic reaches the diagnostic
    /// consumer before the error is returned.
    pub fn compile(&mut self, source: &str) -> Result<Program, EngineError> {
        let program = match compile_source(source, self.config().max_compile_errors) {
            Ok(program) => program,
            Err(diagnostics) => {
                for diagnostic in &diagnostics {
                    self.host.forward(diagnostic);
                }
                return Err(EngineError::Compile(diagnostics));
            }
        };
        debug!(
            chunks = program.chunks.len(),
            instructions = program.instruction_count(),
            functions = program.functions.len(),
            "compiled"
        );
        Ok(program)
    }

    pub fn compile_file(&mut self, path: &Path) -> Result<Program, EngineError> {
        let source = std::fs::read_to_string(path)
            .map_err(|source| EngineError::Io { path: path.to_path_buf(), source })?;
        self.compile(&source)
    }

    /// Runs a compiled program. A fatal error is reported to the
    /// diagnostic consumer and returned; buffered output is discarded.
    pub fn run(&mut self, program: Program) -> Result<Execution, VmError> {
        let mut vm = Vm::new(&mut self.host, program);
        let mut outcome = Ok(());
        for (name, value) in &self.globals {
            outcome = vm.set_global(name, value.clone());
            if outcome.is_err() {
                break;
            }
        }
        let outcome = outcome.and_then(|()| vm.run());
        let exit_status = vm.exit_status();
        let globals = vm.globals();
        drop(vm);

        match outcome {
            Ok(result) => Ok(Execution {
                output: String::from_utf8_lossy(&self.host.take_output()).into_owned(),
                result,
                exit_status,
                globals,
                diagnostics: self.host.take_diagnostics(),
            }),
            Err(e) => {
                self.host.report(Diagnostic::from(&e));
                self.host.take_output();
                self.host.take_diagnostics();
                Err(e)
            }
        }
    }

    pub fn eval(&mut self, source: &str) -> Result<Execution, EngineError> {
        let program = self.compile(source)?;
        Ok(self.run(program)?)
    }
}
