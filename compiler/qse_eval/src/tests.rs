// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::backend::{Distribution, ExecutionLog, RecordingBackend};
use crate::{run, EngineConfig, Error, HostValue, RunOutcome};
use indoc::indoc;

fn run_source(
    source: &str,
    args: &[HostValue],
    counts: Distribution,
    config: &EngineConfig,
) -> (Result<RunOutcome, Error>, ExecutionLog) {
    let module = qse_llvm::load_text("test", source).expect("module should parse");
    let graphs = qse_graph::build(&module, false).expect("graphs should build");
    let mut backend = RecordingBackend::new(counts);
    let log = backend.log();
    let outcome = run(&module, &graphs, &mut backend, config, "main", args);
    (outcome, log)
}

fn run_default(source: &str) -> (Result<RunOutcome, Error>, ExecutionLog) {
    run_source(
        source,
        &[],
        Distribution::new(),
        &EngineConfig::default(),
    )
}

fn executed(log: &ExecutionLog) -> Vec<Vec<String>> {
    log.borrow().clone()
}

const BELL: &str = indoc! {r#"
    %Qubit = type opaque
    %Result = type opaque

    define void @main() "entry_point" {
      call void @__quantum__qis__h__body(%Qubit* null)
      call void @__quantum__qis__cnot__body(%Qubit* null, %Qubit* inttoptr (i64 1 to %Qubit*))
      call void @__quantum__qis__mz__body(%Qubit* null, %Result* null)
      call void @__quantum__qis__mz__body(%Qubit* inttoptr (i64 1 to %Qubit*), %Result* inttoptr (i64 1 to %Result*))
      ret void
    }
"#};

#[test]
fn bell_lowers_to_primitive_rotations() {
    let (outcome, log) = run_default(BELL);
    let outcome = outcome.expect("run should succeed");
    assert_eq!(outcome.executions, 1);
    assert_eq!(
        executed(&log),
        vec![vec![
            "z 0 3.141592653589793".to_string(),
            "y 0 1.5707963267948966".to_string(),
            "cx [0] 1 3.141592653589793".to_string(),
            "measure 0".to_string(),
            "measure 1".to_string(),
        ]]
    );
}

#[test]
fn classical_arithmetic_folds_without_backend() {
    let source = indoc! {r#"
        define i64 @main() {
          %a = add i64 20, 3
          %b = mul i64 %a, 2
          %c = sub i64 %b, 4
          %d = sdiv i64 %c, 2
          ret i64 %d
        }
    "#};
    let (outcome, log) = run_default(source);
    let outcome = outcome.expect("run should succeed");
    assert_eq!(outcome.value, Some(HostValue::Int(21)));
    assert_eq!(outcome.executions, 0);
    assert!(executed(&log).is_empty());
}

#[test]
fn select_phi_and_loop_fold() {
    let source = indoc! {r#"
        define i64 @main() {
        entry:
          br label %header
        header:
          %i = phi i64 [ 0, %entry ], [ %next, %body ]
          %sum = phi i64 [ 0, %entry ], [ %added, %body ]
          %done = icmp eq i64 %i, 5
          br i1 %done, label %end, label %body
        body:
          %odd = and i64 %i, 1
          %isodd = icmp eq i64 %odd, 1
          %weight = select i1 %isodd, i64 10, i64 1
          %added = add i64 %sum, %weight
          %next = add i64 %i, 1
          br label %header
        end:
          ret i64 %sum
        }
    "#};
    let (outcome, _) = run_default(source);
    // 1 + 10 + 1 + 10 + 1 = 23
    assert_eq!(
        outcome.expect("run should succeed").value,
        Some(HostValue::Int(23))
    );
}

#[test]
fn entry_arguments_bind_by_type() {
    let source = indoc! {r#"
        define i64 @main(i64 %base, i1 %double) {
        entry:
          br i1 %double, label %yes, label %no
        yes:
          %d = mul i64 %base, 2
          ret i64 %d
        no:
          ret i64 %base
        }
    "#};
    let (outcome, _) = run_source(
        source,
        &[HostValue::Int(21), HostValue::Bool(true)],
        Distribution::new(),
        &EngineConfig::default(),
    );
    assert_eq!(
        outcome.expect("run should succeed").value,
        Some(HostValue::Int(42))
    );
}

#[test]
fn step_limit_aborts_with_step_count_message() {
    let config = EngineConfig {
        step_limit: Some(2),
        ..EngineConfig::default()
    };
    let (outcome, _) = run_source(BELL, &[], Distribution::new(), &config);
    let error = outcome.expect_err("run should abort");
    assert!(
        error.to_string().contains("step count"),
        "message should name the step count: {error}"
    );
}

#[test]
fn recursion_limit_aborts() {
    let source = indoc! {r#"
        define i64 @spin(i64 %n) {
          %m = add i64 %n, 1
          %r = call i64 @spin(i64 %m)
          ret i64 %r
        }

        define i64 @main() {
          %r = call i64 @spin(i64 0)
          ret i64 %r
        }
    "#};
    let (outcome, _) = run_default(source);
    let error = outcome.expect_err("run should abort");
    assert!(
        matches!(unwrap_context(&error), Error::RecursionLimit(256)),
        "got {error:?}"
    );
}

#[test]
fn branch_on_result_forces_execution() {
    let source = indoc! {r#"
        %Qubit = type opaque
        %Result = type opaque

        define i64 @main() {
        entry:
          call void @__quantum__qis__h__body(%Qubit* null)
          %r = call %Result* @__quantum__qis__m__body(%Qubit* null)
          %b = call i1 @__quantum__qis__read_result__body(%Result* %r)
          br i1 %b, label %one, label %zero
        one:
          call void @__quantum__qis__x__body(%Qubit* null)
          ret i64 1
        zero:
          ret i64 0
        }
    "#};
    let counts = Distribution::from([("1".to_string(), 100)]);
    let (outcome, log) = run_source(source, &[], counts, &EngineConfig::default());
    let outcome = outcome.expect("run should succeed");
    assert_eq!(outcome.value, Some(HostValue::Int(1)));
    // One forced execution at the branch and one final flush for the x gate.
    assert_eq!(outcome.executions, 2);
    let circuits = executed(&log);
    assert_eq!(circuits.len(), 2);
    assert_eq!(
        circuits[0],
        vec![
            "z 0 3.141592653589793".to_string(),
            "y 0 1.5707963267948966".to_string(),
            "measure 0".to_string(),
        ]
    );
    assert_eq!(circuits[1], vec!["x 0 3.141592653589793".to_string()]);
}

#[test]
fn deferred_values_fold_after_forcing() {
    let source = indoc! {r#"
        %Qubit = type opaque
        %Result = type opaque

        define i64 @main() {
        entry:
          %r = call %Result* @__quantum__qis__m__body(%Qubit* null)
          %b = call i1 @__quantum__qis__read_result__body(%Result* %r)
          %wide = zext i1 %b to i64
          %sum = add i64 %wide, 41
          %big = icmp sgt i64 %sum, 41
          br i1 %big, label %yes, label %no
        yes:
          ret i64 %sum
        no:
          ret i64 0
        }
    "#};
    let counts = Distribution::from([("1".to_string(), 90), ("0".to_string(), 10)]);
    let (outcome, _) = run_source(source, &[], counts, &EngineConfig::default());
    assert_eq!(
        outcome.expect("run should succeed").value,
        Some(HostValue::Int(42))
    );
}

#[test]
fn result_equal_forces_both_sides() {
    let source = indoc! {r#"
        %Qubit = type opaque
        %Result = type opaque

        define i1 @main() {
          call void @__quantum__qis__h__body(%Qubit* null)
          call void @__quantum__qis__cnot__body(%Qubit* null, %Qubit* inttoptr (i64 1 to %Qubit*))
          %r0 = call %Result* @__quantum__qis__m__body(%Qubit* null)
          %r1 = call %Result* @__quantum__qis__m__body(%Qubit* inttoptr (i64 1 to %Qubit*))
          %one = call %Result* @__quantum__rt__result_get_one()
          %b = call i1 @__quantum__rt__result_equal(%Result* %r1, %Result* %one)
          ret i1 %b
        }
    "#};
    let mostly_ones = Distribution::from([
        ("00".to_string(), 5),
        ("01".to_string(), 5),
        ("10".to_string(), 5),
        ("11".to_string(), 85),
    ]);
    let (outcome, _) = run_source(source, &[], mostly_ones, &EngineConfig::default());
    assert_eq!(
        outcome.expect("run should succeed").value,
        Some(HostValue::Bool(true))
    );

    let mostly_zeros = Distribution::from([
        ("00".to_string(), 85),
        ("01".to_string(), 5),
        ("10".to_string(), 5),
        ("11".to_string(), 5),
    ]);
    let (outcome, _) = run_source(source, &[], mostly_zeros, &EngineConfig::default());
    assert_eq!(
        outcome.expect("run should succeed").value,
        Some(HostValue::Bool(false))
    );
}

#[test]
fn qubit_leaks_are_reported() {
    let source = indoc! {r#"
        %Qubit = type opaque

        define void @main() {
          %q = call %Qubit* @__quantum__rt__qubit_allocate()
          ret void
        }
    "#};
    let (outcome, _) = run_default(source);
    let outcome = outcome.expect("run should succeed");
    assert_eq!(outcome.leaked_qubits, vec![0]);
}

#[test]
fn released_qubits_are_not_leaks_and_reuse_fails() {
    let source = indoc! {r#"
        %Qubit = type opaque

        define void @main() {
          %q = call %Qubit* @__quantum__rt__qubit_allocate()
          call void @__quantum__rt__qubit_release(%Qubit* %q)
          call void @__quantum__qis__x__body(%Qubit* %q)
          ret void
        }
    "#};
    let (outcome, _) = run_default(source);
    let error = outcome.expect_err("gate after release should fail");
    assert!(
        matches!(unwrap_context(&error), Error::QubitUseAfterRelease(0)),
        "got {error:?}"
    );
}

#[test]
fn array_refcounts_gate_lifetime() {
    let source = indoc! {r#"
        %Array = type opaque

        define i64 @main() {
          %a = call %Array* @__quantum__rt__array_create_1d(i32 8, i64 3)
          %p = call i8* @__quantum__rt__array_get_element_ptr_1d(%Array* %a, i64 1)
          %t = bitcast i8* %p to i64*
          store i64 7, i64* %t
          %v = load i64, i64* %t
          call void @__quantum__rt__array_update_reference_count(%Array* %a, i32 -1)
          ret i64 %v
        }
    "#};
    let (outcome, _) = run_default(source);
    let outcome = outcome.expect("run should succeed");
    assert_eq!(outcome.value, Some(HostValue::Int(7)));
    assert!(outcome.leaked_entries.is_empty(), "{:?}", outcome.leaked_entries);
}

#[test]
fn freed_array_refcount_update_is_underflow() {
    let source = indoc! {r#"
        %Array = type opaque

        define void @main() {
          %a = call %Array* @__quantum__rt__array_create_1d(i32 8, i64 1)
          call void @__quantum__rt__array_update_reference_count(%Array* %a, i32 -1)
          call void @__quantum__rt__array_update_reference_count(%Array* %a, i32 -1)
          ret void
        }
    "#};
    let (outcome, _) = run_default(source);
    let error = outcome.expect_err("double free should fail");
    assert!(
        matches!(unwrap_context(&error), Error::RefcountUnderflow(_)),
        "got {error:?}"
    );
}

#[test]
fn projection_cache_replays_invariant_loops() {
    // Two identical calls; the second re-enters the loop header with the
    // same classical fingerprint and replays the cached tail. The step
    // budget is sized to require the replay.
    let source = indoc! {r#"
        define void @noise() {
        entry:
          br label %header
        header:
          %i = phi i64 [ 0, %entry ], [ %next, %body ]
          %done = icmp eq i64 %i, 20
          br i1 %done, label %end, label %body
        body:
          %next = add i64 %i, 1
          br label %header
        end:
          ret void
        }

        define void @main() {
          call void @noise()
          call void @noise()
          ret void
        }
    "#};
    let config = EngineConfig {
        step_limit: Some(150),
        ..EngineConfig::default()
    };
    let (outcome, _) = run_source(source, &[], Distribution::new(), &config);
    outcome.expect("cached replay should fit the step budget");
}

#[test]
fn folding_law_yields_identical_gates() {
    let folded = indoc! {r#"
        %Qubit = type opaque

        define void @main() {
          call void @__quantum__qis__rx__body(double 1.5, %Qubit* null)
          ret void
        }
    "#};
    let computed = indoc! {r#"
        %Qubit = type opaque

        define void @main() {
          %theta = fmul double 0.75, 2.0
          call void @__quantum__qis__rx__body(double %theta, %Qubit* null)
          ret void
        }
    "#};
    let (a, log_a) = run_default(folded);
    let (b, log_b) = run_default(computed);
    a.expect("run should succeed");
    b.expect("run should succeed");
    assert_eq!(executed(&log_a), executed(&log_b));
}

fn unwrap_context(error: &Error) -> &Error {
    match error {
        Error::Context { source, .. } => unwrap_context(source),
        other => other,
    }
}
