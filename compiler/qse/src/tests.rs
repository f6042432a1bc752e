// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{Backend, Builder, Distribution, Error, Executor, RecordingBackend, RequiredFeatures};
use indoc::indoc;

const TWO_ENTRY_POINTS: &str = indoc! {r#"
    define void @first() "entry_point" {
      ret void
    }

    define void @second() "entry_point" {
      ret void
    }
"#};

#[test]
fn ambiguous_entry_points_are_rejected() {
    let mut executor = Executor::new(Box::new(RecordingBackend::default()));
    let error = executor
        .run_ll(TWO_ENTRY_POINTS, &[])
        .expect_err("two entry points cannot be auto-detected");
    assert!(matches!(error, Error::MultipleEntryPoints), "got {error:?}");
}

#[test]
fn named_entry_point_overrides_detection() {
    let module = qse_llvm::load_text("test", TWO_ENTRY_POINTS).expect("module should parse");
    let mut executor = Executor::new(Box::new(RecordingBackend::default()));
    let result = executor
        .run_module(&module, &[], Some("second"))
        .expect("named entry point should run");
    assert!(result.is_none());

    let error = executor
        .run_module(&module, &[], Some("third"))
        .expect_err("unknown name should be rejected");
    assert!(matches!(error, Error::EntryPointNotFound(_)), "got {error:?}");
}

#[test]
fn lone_unattributed_function_is_the_entry() {
    let mut executor = Executor::new(Box::new(RecordingBackend::default()));
    let result = executor
        .run_ll("define void @main() {\n  ret void\n}\n", &[])
        .expect("single function should run");
    assert!(result.is_none());
}

struct Incapable;

impl Backend for Incapable {
    fn create_builder(&mut self) -> Box<dyn Builder> {
        Box::new(crate::RecordingBuilder::default())
    }

    fn execute(&mut self, _builder: &mut dyn Builder) -> Result<Distribution, String> {
        Ok(Distribution::new())
    }

    fn has_features(&self, _required: &RequiredFeatures) -> bool {
        false
    }
}

#[test]
fn incapable_backends_are_skipped_in_order() {
    let recording = RecordingBackend::default();
    let log = recording.log();
    let mut executor = Executor::from_backends(vec![Box::new(Incapable), Box::new(recording)]);
    executor
        .run_ll(
            indoc! {r#"
                %Qubit = type opaque

                define void @main() "entry_point" "required_num_qubits"="2" {
                  call void @__quantum__qis__x__body(%Qubit* null)
                  ret void
                }
            "#},
            &[],
        )
        .expect("second backend should accept the run");
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn all_backends_incapable_is_an_error() {
    let mut executor = Executor::new(Box::new(Incapable));
    let error = executor
        .run_ll("define void @main() {\n  ret void\n}\n", &[])
        .expect_err("no capable backend");
    assert!(matches!(error, Error::NoCapableBackend(_)), "got {error:?}");
}
