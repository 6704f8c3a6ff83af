//! ember: an embeddable, dynamically-typed scripting engine.
//!
//! Source goes through the [`lexer`], the [`parser`] and the [`compiler`]
//! into a [`bytecode::Program`] that the [`vm`] executes. Hosts drive all of
//! it through [`Engine`]:
//!
//! ```
//! use ember::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! let run = engine.eval("$a = [1, 2, 3]; print count_items($a); function count_items($xs) { $n = 0; foreach ($xs as $_) $n++; return $n; }").unwrap();
//! assert_eq!(run.output, "3");
//! ```

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod engine;
pub mod hashmap;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod vm;

pub use bytecode::Program;
pub use diagnostic::{Diagnostic, Severity};
pub use engine::{Arity, CallContext, Engine, EngineConfig, EngineError, Execution, StreamDevice};
pub use hashmap::{Hashmap, Key};
pub use value::Value;
pub use vm::VmError;
