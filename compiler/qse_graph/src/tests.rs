// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::build;
use expect_test::expect;
use indoc::indoc;
use qse_llvm::load_text;

fn graph_for(source: &str) -> String {
    let module = load_text("test", source).expect("module should parse");
    let graphs = build(&module, false).expect("graph should build");
    graphs.iter().map(ToString::to_string).collect()
}

#[test]
fn straight_line_has_no_headers() {
    let rendered = graph_for(indoc! {r#"
        define void @main() {
        entry:
          br label %next
        next:
          ret void
        }
    "#});
    expect![[r#"
        graph @main:
          entry: -> next
          next: dom=entry
    "#]]
    .assert_eq(&rendered);
}

#[test]
fn back_edge_marks_loop_header() {
    let rendered = graph_for(indoc! {r#"
        define void @main() {
        entry:
          br label %header
        header:
          %i = phi i64 [ 0, %entry ], [ %next, %body ]
          %done = icmp eq i64 %i, 4
          br i1 %done, label %end, label %body
        body:
          %next = add i64 %i, 1
          br label %header
        end:
          ret void
        }
    "#});
    expect![[r#"
        graph @main:
          entry: -> header
          header: loop-header dom=entry phis=1 -> end body
          body: dom=header -> header
          end: dom=header
    "#]]
    .assert_eq(&rendered);
}

#[test]
fn diamond_dominators() {
    let module = load_text(
        "test",
        indoc! {r#"
            define void @main(i1 %c) {
            entry:
              br i1 %c, label %left, label %right
            left:
              br label %join
            right:
              br label %join
            join:
              ret void
            }
        "#},
    )
    .expect("module should parse");
    let graphs = build(&module, false).expect("graph should build");
    let graph = graphs.get("main").expect("graph should exist");

    let join = graph.block_index[&qse_llvm::Name::named("join")];
    let entry = graph.block_index[&qse_llvm::Name::named("entry")];
    assert_eq!(graph.blocks[join].dominator, Some(entry));
    assert_eq!(graph.blocks[join].predecessors.len(), 2);
    assert!(!graph.blocks[join].loop_header);
}

#[test]
fn phi_naming_non_predecessor_is_rejected() {
    let module = load_text(
        "test",
        indoc! {r#"
            define void @main() {
            entry:
              br label %next
            next:
              %x = phi i64 [ 0, %entry ], [ 1, %other ]
              ret void
            other:
              ret void
            }
        "#},
    )
    .expect("module should parse");
    let error = build(&module, false).expect_err("phi should be rejected");
    assert!(matches!(error, crate::Error::PhiPredecessor { .. }));
}
