use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::diagnostic::{Diagnostic, Severity};
use crate::value::Value;

use super::config::EngineConfig;
use super::stream::{DeviceTable, StreamDevice};

/// How many arguments a host function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    /// Inclusive bounds.
    Range(usize, usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::Range(lo, hi) => (lo..=hi).contains(&n),
            Arity::AtLeast(k) => n >= k,
            Arity::Any => true,
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "argument" } else { "arguments" }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Arity::Exact(k) => write!(f, "exactly {k} {}", plural(k)),
            Arity::Range(lo, hi) => write!(f, "between {lo} and {hi} arguments"),
            Arity::AtLeast(k) => write!(f, "at least {k} {}", plural(k)),
            Arity::Any => f.write_str("any number of arguments"),
        }
    }
}

pub type HostCallback = Rc<dyn Fn(&mut CallContext<'_>, &[Value])>;
pub type ConstantFn = Rc<dyn Fn() -> Value>;

#[derive(Clone)]
pub struct HostFunction {
    pub arity: Arity,
    pub callback: HostCallback,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.arity)
    }
}

// ── Call context ─────────────────────────────────────────────────────

/// What a host function sees of the running script. Output and
/// diagnostics are collected here and handed to the VM on return.
pub struct CallContext<'a> {
    function: &'a str,
    line: u32,
    result: Value,
    output: Vec<u8>,
    diagnostics: Vec<Diagnostic>,
    caller_args: &'a [Value],
    devices: &'a mut DeviceTable,
}

/// Everything a host call produced.
pub struct CallOutcome {
    pub result: Value,
    pub output: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> CallContext<'a> {
    pub fn new(function: &'a str, line: u32, caller_args: &'a [Value], devices: &'a mut DeviceTable) -> Self {
        CallContext {
            function,
            line,
            result: Value::null(),
            output: Vec::new(),
            diagnostics: Vec::new(),
            caller_args,
            devices,
        }
    }

    pub fn function(&self) -> &str {
        self.function
    }

    /// Source line of the call.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Value returned to the script. Null unless set.
    pub fn set_result(&mut self, value: Value) {
        self.result = value;
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(message));
    }

    pub fn notice(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::notice(message));
    }

    /// Every argument passed to the user function the call is made from,
    /// including ones beyond its parameter list. Empty at the top level.
    pub fn caller_args(&self) -> &[Value] {
        self.caller_args
    }

    pub fn device(&mut self, scheme: &str) -> Option<&mut (dyn StreamDevice + 'static)> {
        self.devices.get(scheme)
    }

    pub fn finish(self) -> CallOutcome {
        CallOutcome { result: self.result, output: self.output, diagnostics: self.diagnostics }
    }
}

// ── Builtin constants ────────────────────────────────────────────────

fn builtin_constant(name: &str) -> Option<Value> {
    Some(match name {
        "EMBER_VERSION" => Value::from(env!("CARGO_PKG_VERSION")),
        "PHP_EOL" => Value::from("\n"),
        "PHP_INT_MAX" => Value::from(i64::MAX),
        "PHP_INT_MIN" => Value::from(i64::MIN),
        "PHP_INT_SIZE" => Value::from(8),
        "INF" => Value::from(f64::INFINITY),
        "NAN" => Value::from(f64::NAN),
        "M_PI" => Value::from(std::f64::consts::PI),
        "M_E" => Value::from(std::f64::consts::E),
        _ => return None,
    })
}

// ── Host ─────────────────────────────────────────────────────────────

/// The embedding side of a running script: configuration, foreign
/// functions and constants, output and diagnostic consumers, devices.
pub struct Host {
    config: EngineConfig,
    functions: HashMap<String, HostFunction>,
    constants: HashMap<String, ConstantFn>,
    output: Vec<u8>,
    output_sink: Option<Box<dyn FnMut(&[u8])>>,
    diagnostics: Vec<Diagnostic>,
    diagnostic_sink: Option<Box<dyn FnMut(&Diagnostic)>>,
    devices: DeviceTable,
}

impl Host {
    pub fn new(config: EngineConfig) -> Self {
        Host {
            config,
            functions: HashMap::new(),
            constants: HashMap::new(),
            output: Vec::new(),
            output_sink: None,
            diagnostics: Vec::new(),
            diagnostic_sink: None,
            devices: DeviceTable::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, arity: Arity, callback: F)
    where
        F: Fn(&mut CallContext<'_>, &[Value]) + 'static,
    {
        self.functions.insert(name.into(), HostFunction { arity, callback: Rc::new(callback) });
    }

    pub fn register_constant<F>(&mut self, name: impl Into<String>, make: F)
    where
        F: Fn() -> Value + 'static,
    {
        self.constants.insert(name.into(), Rc::new(make));
    }

    pub fn register_device(&mut self, device: Box<dyn StreamDevice>) {
        self.devices.register(device);
    }

    pub fn on_output(&mut self, sink: impl FnMut(&[u8]) + 'static) {
        self.output_sink = Some(Box::new(sink));
    }

    pub fn on_diagnostic(&mut self, sink: impl FnMut(&Diagnostic) + 'static) {
        self.diagnostic_sink = Some(Box::new(sink));
    }

    pub fn function(&self, name: &str) -> Option<HostFunction> {
        self.functions.get(name).cloned()
    }

    /// Registered constants first, then the builtin ones.
    pub fn constant(&self, name: &str) -> Option<Value> {
        match self.constants.get(name) {
            Some(make) => Some(make()),
            None => builtin_constant(name),
        }
    }

    /// Sends script output to the consumer, or buffers it when none is set.
    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match self.output_sink.as_mut() {
            Some(sink) => sink(bytes),
            None => self.output.extend_from_slice(bytes),
        }
    }

    /// Records a diagnostic and passes it to the consumer. Notices are
    /// dropped when the configuration turns them off.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Notice && !self.config.report_notices {
            return;
        }
        self.forward(&diagnostic);
        self.diagnostics.push(diagnostic);
    }

    /// Passes a diagnostic to the consumer without buffering it.
    pub fn forward(&mut self, diagnostic: &Diagnostic) {
        if let Some(sink) = self.diagnostic_sink.as_mut() {
            sink(diagnostic);
        }
    }

    pub fn devices_mut(&mut self) -> &mut DeviceTable {
        &mut self.devices
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Finds and reads an included file. `scheme://` paths go to the
    /// registered device; relative paths try each include path, then the
    /// working directory.
    pub fn read_include(&mut self, path: &str) -> io::Result<(PathBuf, String)> {
        if let Some(read) = self.devices.read_to_string(path) {
            return read.map(|source| (PathBuf::from(path), source));
        }
        let requested = Path::new(path);
        let mut candidates: Vec<PathBuf> = Vec::new();
        if !requested.is_absolute() {
            candidates.extend(self.config.include_paths.iter().map(|dir| dir.join(requested)));
        }
        candidates.push(requested.to_path_buf());
        for candidate in candidates {
            if candidate.is_file() {
                let source = std::fs::read_to_string(&candidate)?;
                return Ok((candidate, source));
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, "no such file in the include paths"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stream::tests::MemoryDevice;
    use std::cell::RefCell;

    #[test]
    fn arity_bounds_and_messages() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(3));
        assert!(Arity::Range(1, 3).accepts(3));
        assert!(!Arity::Range(1, 3).accepts(0));
        assert!(Arity::AtLeast(1).accepts(9));
        assert!(Arity::Any.accepts(0));
        assert_eq!(Arity::Exact(1).to_string(), "exactly 1 argument");
        assert_eq!(Arity::AtLeast(2).to_string(), "at least 2 arguments");
    }

    #[test]
    fn output_buffers_until_a_sink_is_set() {
        let mut host = Host::new(EngineConfig::default());
        host.write(b"ab");
        assert_eq!(host.take_output(), b"ab");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        host.on_output(move |bytes| sink.borrow_mut().extend_from_slice(bytes));
        host.write(b"cd");
        assert!(host.take_output().is_empty());
        assert_eq!(*seen.borrow(), b"cd");
    }

    #[test]
    fn notices_filtered_by_config() {
        let config = EngineConfig { report_notices: false, ..EngineConfig::default() };
        let mut host = Host::new(config);
        host.report(Diagnostic::notice("quiet"));
        host.report(Diagnostic::warning("loud"));
        let kept = host.take_diagnostics();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].message, "loud");
    }

    #[test]
    fn registered_constants_shadow_builtins() {
        let mut host = Host::new(EngineConfig::default());
        assert_eq!(host.constant("PHP_EOL"), Some(Value::from("\n")));
        host.register_constant("PHP_EOL", || Value::from("\r\n"));
        assert_eq!(host.constant("PHP_EOL"), Some(Value::from("\r\n")));
        assert!(host.constant("php_eol").is_none());
    }

    #[test]
    fn call_context_collects_effects() {
        let mut devices = DeviceTable::default();
        let args = [Value::from(1)];
        let mut ctx = CallContext::new("f", 7, &args, &mut devices);
        ctx.write(b"x");
        ctx.notice("n");
        ctx.set_result(Value::from(true));
        assert_eq!(ctx.caller_args().len(), 1);
        assert!(ctx.device("mem").is_none());
        let outcome = ctx.finish();
        assert_eq!(outcome.output, b"x");
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.result, Value::from(true));
    }

    #[test]
    fn include_resolution_prefers_devices() {
        let mut host = Host::new(EngineConfig::default());
        host.register_device(Box::new(MemoryDevice::new(&[("lib.emb", "$x = 1;")])));
        let (path, source) = host.read_include("mem://lib.emb").unwrap();
        assert_eq!(path, PathBuf::from("mem://lib.emb"));
        assert_eq!(source, "$x = 1;");
        assert!(host.read_include("definitely/not/here.emb").is_err());
    }
}
