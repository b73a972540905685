// Generators for random source text shared by the integration tests.

use proptest::prelude::*;

pub fn quoted() -> impl Strategy<Value = String> {
    let piece = prop_oneof![Just("\\\"".to_string()), Just("\\\\".to_string()), "[a-z ]{1,3}"];
    prop::collection::vec(piece, 0..5).prop_map(|pieces| format!("\"{}\"", pieces.concat()))
}

pub fn expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        "[a-z][a-z0-9]{0,6}",
        (-100_000i32..100_000).prop_map(|n| n.to_string()),
        quoted(),
    ];
    leaf.prop_recursive(8, 64, 4, |inner| {
        prop_oneof![
            (
                prop_oneof![Just(""), Just("'"), Just("#"), Just("+"), Just("-"), Just("`")],
                prop::collection::vec(inner.clone(), 0..4),
            )
                .prop_map(|(prefix, items)| format!("{}({})", prefix, items.join(" "))),
            // commas only make sense under a backquote
            (inner.clone(), inner.clone(), inner)
                .prop_map(|(a, b, c)| format!("`({} ,(x {}) ,@({}))", a, b, c)),
        ]
    })
}
