// File: tests/gen_properties.rs
use proptest::prelude::*;

use augur::gen::pipeline::prepare_gen_thread;
use augur::schema::{self, RecordSpec, SchemaConf, Target};
use augur::{GenConf, MsgKind, OutFormat, Thread};

proptest! {
    // max_tokens = 0 resolves to ctx_len
    #[test]
    fn resolve_zero_gives_ctx_len(ctx_len in 1usize..1_000_000) {
        let gc = GenConf::new();
        prop_assert_eq!(gc.resolve_max_tokens(ctx_len, None), ctx_len);
    }

    // max_tokens = -k resolves to ceil(ctx_len * k / 100), at least 1
    #[test]
    fn resolve_percent(ctx_len in 1usize..1_000_000, k in 1i32..=100) {
        let gc = GenConf::new().with_max_tokens(-k);
        let expected = ((ctx_len * k as usize) + 99) / 100;
        prop_assert_eq!(gc.resolve_max_tokens(ctx_len, None), expected.max(1));
    }

    // positive max_tokens is clamped to the provider output cap
    #[test]
    fn resolve_positive_clamps(
        ctx_len in 1usize..1_000_000,
        max_tokens in 1i32..1_000_000,
        limit in 1usize..1_000_000,
    ) {
        let gc = GenConf::new().with_max_tokens(max_tokens);
        let resolved = gc.resolve_max_tokens(ctx_len, Some(limit));
        prop_assert_eq!(resolved, (max_tokens as usize).min(limit));
    }

    // thread preparation keeps the IN ending, never shrinks the thread and
    // never introduces an OUT message
    #[test]
    fn preparation_invariants(
        texts in proptest::collection::vec("[a-zA-Z0-9 ?.]{1,40}", 1..4),
        json_mode in any::<bool>(),
    ) {
        let mut thread = Thread::new();
        for (i, text) in texts.iter().enumerate() {
            if i % 2 == 0 {
                thread.add_in(text.clone()).unwrap();
            } else {
                thread.add_out(text.clone()).unwrap();
            }
        }
        if thread.last_kind() != Some(MsgKind::In) {
            thread.add_in("and so?").unwrap();
        }
        let before_len = thread.len();
        let out_count_before = thread.iter().filter(|m| m.kind == MsgKind::Out).count();

        let format = if json_mode { OutFormat::Json } else { OutFormat::Text };
        let prepared = prepare_gen_thread(&thread, &GenConf::new().with_format(format)).unwrap();

        prop_assert_eq!(prepared.last_kind(), Some(MsgKind::In));
        prop_assert!(prepared.len() >= before_len);
        let out_count_after = prepared.iter().filter(|m| m.kind == MsgKind::Out).count();
        prop_assert_eq!(out_count_after, out_count_before);
    }

    // compiled schemas never contain $ref or title
    #[test]
    fn compiled_schema_is_normalised(field_names in proptest::collection::hash_set("[a-z]{1,8}", 1..5)) {
        let mut spec = RecordSpec::new("Fuzzed");
        for name in &field_names {
            spec = spec.field(name.clone(), Target::Str);
        }
        let (compiled, plan) = schema::compile(&spec.into_target(), &SchemaConf::default()).unwrap();
        let text = compiled.to_string();
        prop_assert!(!text.contains("$ref"));
        prop_assert!(!text.contains("\"title\""));
        // records never wrap
        prop_assert!(plan.output_key.is_none());
    }

    // non-record targets always wrap under a single known property
    #[test]
    fn non_record_targets_wrap(choice in 0usize..4) {
        let target = match choice {
            0 => Target::Bool,
            1 => Target::Int,
            2 => Target::list_of(Target::Str),
            _ => Target::enum_str(&["a", "b"]),
        };
        let (compiled, plan) = schema::compile(&target, &SchemaConf::default()).unwrap();
        prop_assert_eq!(plan.output_key.as_deref(), Some("output"));
        let props = compiled["properties"].as_object().unwrap();
        prop_assert_eq!(props.len(), 1);
        prop_assert!(props.contains_key("output"));
    }
}
