//! End-to-end programs through the public API: text or binary in, host output out.

#![expect(clippy::unwrap_used)] // test code OK

use pretty_assertions::assert_eq;
use slotvm::{
    CaptureHost, Engine, Error, Fault, Outcome, RuntimeConfig, ScopeTree, compile_text,
    decode_binary, encode_binary,
};

fn run_tree(tree: ScopeTree, host: CaptureHost) -> (Result<Outcome, Error>, CaptureHost) {
    let config = RuntimeConfig::default().with_step_limit(100_000);
    let mut engine = Engine::new(tree, host, config);
    let result = engine.run();
    (result, engine.into_host())
}

fn run_text(source: &str) -> (Result<Outcome, Error>, CaptureHost) {
    let tree = compile_text(source, &RuntimeConfig::default()).unwrap();
    run_tree(tree, CaptureHost::new())
}

const COUNTING_LOOP: &str = r#"
(set x 0)
(set max 3)
(jump loop)
(print "Done!")
(scope loop
  (println x)
  (set x (add x 1))
  (if (< x max) (jump loop)))
"#;

#[test]
fn counting_loop_prints_then_returns() {
    let (result, host) = run_text(COUNTING_LOOP);
    assert_eq!(result.unwrap().exit_code, 0);
    assert_eq!(host.lines(), vec!["0", "1", "2", "Done!"]);
}

#[test]
fn out_of_range_get_is_an_index_error() {
    let (result, host) = run_text("(set l (list 10 20 30))\n(println (get l 1))\n(println (get l 3))");
    assert_eq!(host.lines(), vec!["20"]);
    match result.unwrap_err() {
        Error::Runtime { scope, slot, fault } => {
            assert_eq!(scope, 0);
            // SET l LIST | PRINTLN GET l 1 | PRINTLN ...
            assert_eq!(slot, 7);
            assert_eq!(fault, Fault::Index { index: 3.0, len: 3 });
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn division_by_zero_is_a_math_error() {
    let (result, _) = run_text("(set d 0) (println (div 10 d))");
    let err = result.unwrap_err();
    assert!(matches!(err.fault(), Some(Fault::Math(_))));
    assert!(err.to_string().starts_with("MathError: division by zero"));
}

#[test]
fn division_by_zero_can_be_caught() {
    let source = r#"
(set d 0)
(try attempt)
(println error)
(exit 4)
(scope attempt
  (println (div 10 d)))
"#;
    let (result, host) = run_text(source);
    assert_eq!(result.unwrap().exit_code, 4);
    assert_eq!(host.lines(), vec!["MathError: division by zero"]);
}

#[test]
fn recoverable_faults_are_caught_with_their_message() {
    let with_file = CaptureHost::new().with_file("notes.txt", "kept");
    let cases: Vec<(&str, CaptureHost, Vec<&str>)> = vec![
        (
            "(set l (list 1 2 3)) (try t) (println error) (scope t (println (get l 3)))",
            CaptureHost::new(),
            vec!["IndexError: index 3 out of range for list of length 3"],
        ),
        (
            "(set h (alloc \"number\" 1)) (try t) (println error) (scope t (set h 1 5))",
            CaptureHost::new(),
            vec!["IndexError: index 1 out of range for list of length 1"],
        ),
        (
            "(try t) (println error) (scope t (println (read_file \"missing.txt\")))",
            CaptureHost::new(),
            vec!["IoError: missing.txt: no such file"],
        ),
        (
            "(try t) (println \"after\") (scope t (println (read_file \"notes.txt\")))",
            with_file,
            vec!["kept", "after"],
        ),
    ];
    for (source, host, expected) in cases {
        let tree = compile_text(source, &RuntimeConfig::default()).unwrap();
        let (result, host) = run_tree(tree, host);
        assert_eq!(result.unwrap().exit_code, 0, "{source}");
        assert_eq!(host.lines(), expected, "{source}");
    }
}

#[test]
fn self_referencing_list_prints_once() {
    let (result, host) = run_text("(set l (list 7 0)) (set l 1 l) (println l) (println (get l 0))");
    result.unwrap();
    assert_eq!(host.lines(), vec!["(7 (...))", "7"]);
}

#[test]
fn oversized_alloc_is_a_limit_error() {
    let source = "(try t) (println \"not reached\") (scope t (set h (alloc \"number\" 4294967295)))";
    let (result, host) = run_text(source);
    assert!(host.transcript.is_empty());
    assert!(matches!(result.unwrap_err().fault(), Some(Fault::LimitExceeded(_))));
}

#[test]
fn binary_and_text_forms_execute_identically() {
    let config = RuntimeConfig::default();
    let programs = [
        COUNTING_LOOP,
        "(set h (alloc \"number\" 3)) (set h 2 (mul 6 7)) (println h) (free h) (exit 9)",
        "(macro twice (v) (println v) (println v)) (twice (sub 5))",
        "(try t) (println error) (scope t (syscall 42))",
    ];
    for source in programs {
        let tree = compile_text(source, &config).unwrap();
        let decoded = decode_binary(&encode_binary(&tree), &config).unwrap();
        assert_eq!(decoded, tree);

        let (text_result, text_host) = run_tree(tree, CaptureHost::new());
        let (binary_result, binary_host) = run_tree(decoded, CaptureHost::new());
        assert_eq!(text_result, binary_result, "outcome of {source}");
        assert_eq!(text_host.transcript, binary_host.transcript, "output of {source}");
    }
}

#[test]
fn names_resolve_upward_only() {
    // the child sees the root binding
    let (result, host) = run_text("(set a 1) (jump child) (scope child (println a))");
    result.unwrap();
    assert_eq!(host.lines(), vec!["1"]);

    // the root never sees a child's binding
    let (result, _) = run_text("(jump child) (println b) (scope child (set b 2))");
    assert!(matches!(result.unwrap_err().fault(), Some(Fault::UnboundName(n)) if n == "b"));
}

#[test]
fn jumps_land_at_slot_zero() {
    // jumping from `inner` back to the active `outer` restarts `outer` from the top
    let source = r#"
(set c (list 0))
(jump outer)
(println "end")
(scope outer
  (println "outer start")
  (set c 0 (add (get c 0) 1))
  (if (< (get c 0) 2) (jump inner))
  (println "outer end")
  (scope inner
    (println "inner")
    (jump outer)))
"#;
    let (result, host) = run_text(source);
    result.unwrap();
    assert_eq!(
        host.lines(),
        vec!["outer start", "inner", "outer start", "outer end", "end"]
    );
}

#[test]
fn scope_ids_are_preorder() {
    let source = "(list (list 1) (list (list 2))) (scope s (list 3))";
    let tree = compile_text(source, &RuntimeConfig::default()).unwrap();
    let parents: Vec<Option<usize>> = tree.iter().map(|s| s.parent).collect();
    assert_eq!(
        parents,
        vec![None, Some(0), Some(1), Some(1), Some(3), Some(0), Some(5)]
    );
    assert_eq!(tree.find_label("s"), Some(5));
    for scope in tree.iter() {
        assert!(scope.children.iter().all(|&child| child > scope.id));
    }
}

#[test]
fn macro_expansion_matches_hand_written_program() {
    let config = RuntimeConfig::default();
    let with_macro = compile_text(
        "(macro log (v) (syscall 0 v)) (set x 1) (log x) (scope s (log (add x 1)))",
        &config,
    )
    .unwrap();
    let by_hand = compile_text(
        "(set x 1) (syscall 0 x) (scope s (syscall 0 (add x 1)))",
        &config,
    )
    .unwrap();
    assert_eq!(with_macro, by_hand);
}

#[test]
fn use_after_free_is_fatal_even_inside_try() {
    let source = r#"
(set h (alloc "list" 2))
(free h)
(try t)
(println "not reached")
(scope t (println (length h)))
"#;
    let (result, host) = run_text(source);
    assert!(host.transcript.is_empty());
    assert!(matches!(result.unwrap_err().fault(), Some(Fault::UseAfterFree(_))));
}

#[test]
fn build_errors_are_reported_before_running() {
    let config = RuntimeConfig::default();
    let cases: Vec<(&str, &str)> = vec![
        ("(print 1 2)", "MalformedOpcodeError"),
        ("(jump nowhere)", "unknown scope label 'nowhere'"),
        ("(print \"open", "ParseError"),
        ("(macro m (v) (m v)) (m 1)", "MacroExpansionError"),
    ];
    for (source, fragment) in cases {
        let err = compile_text(source, &config).unwrap_err();
        assert!(err.is_build_error());
        assert!(err.to_string().contains(fragment), "'{err}' lacks '{fragment}'");
    }
}

#[test]
fn corrupt_binary_reports_offsets() {
    let config = RuntimeConfig::default();
    let bytes = encode_binary(&compile_text("(println \"hi\")", &config).unwrap());

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(matches!(decode_binary(&bad_magic, &config), Err(Error::Codec { offset: 0, .. })));

    for cut in 0..bytes.len() {
        match decode_binary(&bytes[..cut], &config) {
            Err(Error::Codec { offset, .. }) => assert!(offset <= cut, "cut {cut}: offset {offset}"),
            other => panic!("cut {cut}: expected a codec error, got {other:?}"),
        }
    }

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert!(matches!(
        decode_binary(&trailing, &config),
        Err(Error::Codec { offset, .. }) if offset == bytes.len()
    ));
}
