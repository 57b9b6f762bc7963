//! Siskin - a small, embeddable dynamic scripting language runtime.
//!
//! The runtime is built around a uniform tagged [`Value`], a Smalltalk-style
//! single-inheritance object system with metaclasses, cooperative coroutines
//! (fibers) with call/transfer/try/yield semantics, and an embedded bootstrap
//! script that declares the built-in classes in the language itself before
//! native primitives are attached to them.
//!
//! # Architecture
//!
//! Execution flows through three stages:
//!
//! 1. **Scanning & compilation** (`lexer`, `compiler`)
//!    - Significant-newline token stream
//!    - Single-pass compiler emitting typed instructions; every operator is a
//!      signature call on its receiver
//! 2. **The object model** (`value`, `heap`, `symbol`)
//!    - Twelve heap object kinds behind dense handles
//!    - Mark-sweep collection over an intrusive all-objects chain
//!    - Method tables indexed by interned signature symbols
//! 3. **Dispatch** (`vm`, `core`)
//!    - Frame-cached interpreter loop with fiber switching
//!    - ~140 native primitives registered per class after bootstrap
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use siskin::{Config, InterpretResult, Vm};
//!
//! let output = Rc::new(RefCell::new(String::new()));
//! let sink = output.clone();
//! let mut config = Config::default();
//! config.write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
//!
//! let mut vm = Vm::new(config);
//! let result = vm.interpret("main", "System.print(1 + 2)\n");
//! assert_eq!(result, InterpretResult::Success);
//! assert_eq!(output.borrow().as_str(), "3\n");
//! ```

pub mod compiler;
pub mod core;
pub mod heap;
pub mod lexer;
pub mod opcodes;
pub mod symbol;
pub mod value;
pub mod vm;

pub use heap::{Handle, Heap};
pub use value::Value;
pub use vm::{Config, ErrorKind, ForeignClassMethods, InterpretResult, Vm};
