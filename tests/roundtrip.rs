//! Both wire forms rebuild the exact tree they were produced from.

#![expect(clippy::unwrap_used)] // test code OK

use proptest::prelude::*;
use slotvm::macros::is_reserved;
use slotvm::{RuntimeConfig, compile_text, decode_binary, encode_binary, encode_text};

fn identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,5}".prop_filter("reserved word", |s| !is_reserved(s))
}

fn quoted(s: &str) -> String {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\t', "\\t");
    format!("\"{escaped}\"")
}

fn leaf() -> impl Strategy<Value = String> {
    prop_oneof![
        any::<f64>()
            .prop_filter("finite", |n| n.is_finite())
            .prop_map(|n| format!("{n}")),
        any::<i32>().prop_map(|n| n.to_string()),
        "[a-zA-Z0-9 _\\\\\"\n\t]{0,8}".prop_map(|s| quoted(&s)),
        identifier(),
    ]
}

fn expr() -> impl Strategy<Value = String> {
    leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4)
                .prop_map(|items| format!("(list {})", items.join(" "))),
            prop::collection::vec(inner.clone(), 1..4)
                .prop_map(|items| format!("(add {})", items.join(" "))),
            (inner.clone(), inner).prop_map(|(list, index)| format!("(get {list} {index})")),
        ]
    })
}

fn statement() -> impl Strategy<Value = String> {
    prop_oneof![
        (identifier(), expr()).prop_map(|(name, value)| format!("(set {name} {value})")),
        expr().prop_map(|value| format!("(println {value})")),
        (expr(), expr()).prop_map(|(a, b)| format!("(if (< {a} {b}) (jump 0))")),
        expr(),
    ]
}

fn program() -> impl Strategy<Value = String> {
    prop::collection::vec(statement(), 0..6).prop_map(|forms| forms.join("\n"))
}

proptest! {
    #[test]
    fn binary_form_round_trips(source in program()) {
        let config = RuntimeConfig::default();
        let tree = compile_text(&source, &config).unwrap();
        let bytes = encode_binary(&tree);
        prop_assert_eq!(decode_binary(&bytes, &config).unwrap(), tree.clone());
        prop_assert_eq!(encode_binary(&tree), bytes);
    }

    #[test]
    fn text_form_round_trips(source in program()) {
        let config = RuntimeConfig::default();
        let tree = compile_text(&source, &config).unwrap();
        let text = encode_text(&tree);
        let reparsed = compile_text(&text, &config).unwrap();
        prop_assert_eq!(&reparsed, &tree);
        // canonical text is a fixed point
        prop_assert_eq!(encode_text(&reparsed), text);
    }
}
