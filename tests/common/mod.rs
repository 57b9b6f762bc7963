//! Shared harness for the integration suites: runs a script in a fresh VM
//! with captured output and error callbacks.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use siskin::{Config, ErrorKind, InterpretResult, Vm};

pub struct Run {
    pub result: InterpretResult,
    pub output: String,
    pub errors: Vec<(ErrorKind, String)>,
}

pub fn run_with_config(mut config: Config, source: &str) -> Run {
    // Honors RUST_LOG when a test needs VM traces.
    let _ = tracing_subscriber::fmt::try_init();
    let output = Rc::new(RefCell::new(String::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let output_sink = output.clone();
    let error_sink = errors.clone();
    config.write = Some(Box::new(move |text| {
        output_sink.borrow_mut().push_str(text);
    }));
    config.error = Some(Box::new(move |kind, _module, _line, message| {
        error_sink.borrow_mut().push((kind, message.to_string()));
    }));
    let mut vm = Vm::new(config);
    let result = vm.interpret("main", source);
    let output = output.borrow().clone();
    let errors = errors.borrow().clone();
    Run {
        result,
        output,
        errors,
    }
}

pub fn run(source: &str) -> Run {
    run_with_config(Config::default(), source)
}

/// Run a script that must succeed, returning what it printed.
pub fn run_ok(source: &str) -> String {
    let run = run(source);
    assert_eq!(
        run.result,
        InterpretResult::Success,
        "script failed: {:?}\noutput: {}",
        run.errors,
        run.output
    );
    run.output
}

/// Run a script that must abort with a runtime error; returns the message.
pub fn run_error(source: &str) -> String {
    let run = run(source);
    assert_eq!(
        run.result,
        InterpretResult::RuntimeError,
        "expected a runtime error, got {:?} with output {:?}",
        run.result,
        run.output
    );
    run.errors
        .iter()
        .find(|(kind, _)| *kind == ErrorKind::Runtime)
        .map(|(_, message)| message.clone())
        .expect("runtime error reported")
}
