// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::module;
use crate::instruction::{Constant, Instruction, Operand, Terminator};
use crate::name::Name;
use crate::types::Ty;
use crate::Error;
use expect_test::expect;
use indoc::indoc;

#[test]
fn base_profile_bell_parses() {
    let source = indoc! {r#"
        %Result = type opaque
        %Qubit = type opaque

        define void @ENTRYPOINT__main() #0 {
          call void @__quantum__qis__h__body(%Qubit* inttoptr (i64 0 to %Qubit*))
          call void @__quantum__qis__cx__body(%Qubit* inttoptr (i64 0 to %Qubit*), %Qubit* inttoptr (i64 1 to %Qubit*))
          call void @__quantum__qis__mz__body(%Qubit* inttoptr (i64 0 to %Qubit*), %Result* inttoptr (i64 0 to %Result*)) #1
          call void @__quantum__rt__result_record_output(%Result* inttoptr (i64 0 to %Result*), i8* null)
          ret void
        }

        declare void @__quantum__qis__h__body(%Qubit*)
        declare void @__quantum__qis__cx__body(%Qubit*, %Qubit*)
        declare void @__quantum__qis__mz__body(%Qubit*, %Result* writeonly) #1
        declare void @__quantum__rt__result_record_output(%Result*, i8*)

        attributes #0 = { "entry_point" "required_num_qubits"="2" "required_num_results"="1" }
        attributes #1 = { "irreversible" }
    "#};
    let module = module("bell", source).expect("module should parse");

    assert_eq!(module.functions.len(), 1);
    assert_eq!(module.declarations.len(), 4);

    let main = &module.functions[0];
    assert!(main.is_entry_point());
    assert_eq!(main.required_qubits(), Some(2));
    assert_eq!(main.required_results(), Some(1));
    assert_eq!(main.blocks.len(), 1);
    assert_eq!(main.blocks[0].instructions.len(), 4);
    assert_eq!(main.blocks[0].terminator, Terminator::Ret(None));

    let Instruction::Call { callee, args, .. } = &main.blocks[0].instructions[1] else {
        panic!("expected call");
    };
    assert_eq!(callee.as_ref(), "__quantum__qis__cx__body");
    assert_eq!(
        args[1],
        Operand::Constant(Constant::IntToPtr {
            value: 1,
            ty: Ty::pointer_to(Ty::Opaque("Qubit".into())),
        })
    );
}

#[test]
fn loop_with_phi_parses() {
    let source = indoc! {r#"
        define i64 @count() {
        entry:
          br label %header
        header:
          %i = phi i64 [ 0, %entry ], [ %next, %body ]
          %done = icmp eq i64 %i, 8
          br i1 %done, label %end, label %body
        body:
          %next = add nuw nsw i64 %i, 1
          br label %header
        end:
          ret i64 %i
        }
    "#};
    let module = module("loop", source).expect("module should parse");
    let func = &module.functions[0];
    assert_eq!(func.blocks.len(), 4);

    let Instruction::Phi { incoming, .. } = &func.blocks[1].instructions[0] else {
        panic!("expected phi");
    };
    assert_eq!(incoming.len(), 2);
    assert_eq!(incoming[0].1, Name::named("entry"));
    assert_eq!(incoming[1].1, Name::named("body"));

    let Terminator::CondBr {
        if_true, if_false, ..
    } = &func.blocks[1].terminator
    else {
        panic!("expected conditional branch");
    };
    assert_eq!(*if_true, Name::named("end"));
    assert_eq!(*if_false, Name::named("body"));
}

#[test]
fn global_string_and_label_gep() {
    let source = indoc! {r#"
        @0 = internal constant [3 x i8] c"0_t\00"

        define void @main() {
          call void @__quantum__rt__result_record_output(%Result* null, i8* getelementptr inbounds ([3 x i8], [3 x i8]* @0, i32 0, i32 0))
          ret void
        }
    "#};
    let module = module("labels", source).expect("module should parse");
    assert_eq!(
        module.globals.get("0").map(Vec::as_slice),
        Some(b"0_t\0".as_slice())
    );

    let Instruction::Call { args, .. } = &module.functions[0].blocks[0].instructions[0] else {
        panic!("expected call");
    };
    let Operand::Constant(Constant::Global { name, .. }) = &args[1] else {
        panic!("expected folded constant gep, got {:?}", args[1]);
    };
    assert_eq!(name.as_ref(), "0");
}

#[test]
fn hex_double_literal_is_bit_pattern() {
    let source = indoc! {r#"
        define void @main() {
          call void @__quantum__qis__rz__body(double 0x400921FB54442D18, %Qubit* null)
          ret void
        }
    "#};
    let module = module("hex", source).expect("module should parse");
    let Instruction::Call { args, .. } = &module.functions[0].blocks[0].instructions[0] else {
        panic!("expected call");
    };
    let Operand::Constant(Constant::Double(theta)) = &args[0] else {
        panic!("expected double constant");
    };
    assert!((theta - std::f64::consts::PI).abs() < f64::EPSILON);
}

#[test]
fn unsupported_opcode_is_rejected() {
    let source = indoc! {r#"
        define void @main() {
          fence seq_cst
          ret void
        }
    "#};
    let error = module("bad", source).expect_err("fence should be rejected");
    expect!["unsupported feature at line 2: opcode `fence`"].assert_eq(&error.to_string());
}

#[test]
fn missing_terminator_is_rejected() {
    let source = indoc! {r#"
        define void @main() {
          %x = add i64 1, 2
        }
    "#};
    let error = module("bad", source).expect_err("should require terminator");
    assert!(matches!(error, Error::Parse(..)), "got {error:?}");
}

#[test]
fn entry_point_detected_from_named_attribute() {
    let source = indoc! {r#"
        define void @main() "EntryPoint" {
          ret void
        }
    "#};
    let module = module("ep", source).expect("module should parse");
    assert!(module.functions[0].is_entry_point());
    assert_eq!(module.entry_points().count(), 1);
}
