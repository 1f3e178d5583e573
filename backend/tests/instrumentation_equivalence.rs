//! Instrumentation must never change what a program computes.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use backend::eval::{Interp, NoopHook, ProgramIo, RunError, Value};
use backend::instrument::instrument_source;
use backend::lang::parse_module;

struct SinkIo {
    stdout: String,
}

impl ProgramIo for SinkIo {
    fn write_stdout(&mut self, data: &str) -> Result<(), RunError> {
        self.stdout.push_str(data);
        Ok(())
    }

    fn write_stderr(&mut self, _data: &str) -> Result<(), RunError> {
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, RunError> {
        Err(RunError::new("EOFError", "no stdin in this test"))
    }
}

fn run_source(source: &str) -> (BTreeMap<String, Value>, String) {
    let module = parse_module(source).expect("parsing");
    let mut hook = NoopHook;
    let mut io = SinkIo {
        stdout: String::new(),
    };
    let mut interp = Interp::new(
        "equiv.py",
        BTreeMap::new(),
        &mut hook,
        &mut io,
        Arc::new(AtomicBool::new(false)),
        Value::None,
    );
    interp.exec_module(&module.body).expect("running");
    (interp.into_globals(), io.stdout)
}

fn assert_equivalent(source: &str) {
    let (plain_globals, plain_out) = run_source(source);

    let module = parse_module(source).expect("parsing");
    let instrumented = instrument_source(source, &module);
    let (inst_globals, inst_out) = run_source(&instrumented.source);

    assert_eq!(inst_out, plain_out, "output diverged for:\n{source}");
    assert_eq!(
        plain_globals.keys().collect::<Vec<_>>(),
        inst_globals.keys().collect::<Vec<_>>(),
        "global names diverged for:\n{source}"
    );
    for (name, value) in &plain_globals {
        // reprs, not identity: function objects are re-created per run
        assert_eq!(
            value.repr(),
            inst_globals[name].repr(),
            "global '{name}' diverged for:\n{source}"
        );
    }
}

#[test]
fn assignments_and_defs_are_untouched_by_instrumentation() {
    assert_equivalent("x = 1\ny = x + 2\n\ndef f(a):\n    return a * 2\n\nz = f(y)\n");
}

#[test]
fn control_flow_is_untouched_by_instrumentation() {
    assert_equivalent(
        "total = 0\nfor i in range(10):\n    if i % 2 == 0:\n        total += i\n    else:\n        total -= 1\nwhile total > 10:\n    total = total - 3\n",
    );
}

#[test]
fn short_circuits_still_short_circuit_when_instrumented() {
    assert_equivalent(
        "def boom():\n    return 1 / 0\n\nsafe = True or boom()\nalso = False and boom()\n",
    );
}

#[test]
fn printed_output_is_identical() {
    assert_equivalent("for i in range(3):\n    print('line', i)\n");
}

#[test]
fn data_structures_survive_instrumentation() {
    assert_equivalent(
        "d = {'a': 1, 'b': 2}\nd['c'] = d['a'] + d['b']\nxs = [1, 2, 3]\nxs[0] = xs[1] * xs[2]\nt = (len(xs), min(xs), max(xs))\n",
    );
}
