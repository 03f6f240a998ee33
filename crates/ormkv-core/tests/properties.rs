//! Property tests for field conversion, unique-key normalisation and
//! in-memory queryset refinement.

use ormkv_core::proto::Value;
use ormkv_core::query::executor::paginate;
use ormkv_core::{Database, FieldDef, FieldValue, ModelDef};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn arb_people() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-z]{1,6}", 0i64..90), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_integer_and_text_survive_storage(n in any::<i64>(), s in "[ -~]{0,40}") {
        let integer = FieldDef::big_integer();
        let stored = integer.to_storage(&FieldValue::Int(n)).unwrap();
        prop_assert_eq!(integer.from_storage(&stored).unwrap(), FieldValue::Int(n));

        let text = FieldDef::text();
        let stored = text.to_storage(&FieldValue::from(s.as_str())).unwrap();
        prop_assert_eq!(text.from_storage(&stored).unwrap(), FieldValue::Text(s));
    }

    #[test]
    fn prop_unique_keys_ignore_case(s in "[a-zA-Z@.]{1,24}") {
        let lower = Value::Text(s.to_lowercase());
        let upper = Value::Text(s.to_uppercase());
        prop_assert_eq!(lower.unique_key_bytes(), upper.unique_key_bytes());
    }

    #[test]
    fn prop_pagination_composes(len in 0usize..30, o1 in 0usize..10, l1 in 0usize..10, o2 in 0usize..10) {
        let rows: Vec<usize> = (0..len).collect();
        let twice = paginate(paginate(rows.clone(), o1, Some(l1)), o2, None);
        let once = paginate(rows, o1 + o2, Some(l1.saturating_sub(o2)));
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn prop_refining_fetched_set_matches_backend(
        people in arb_people(),
        threshold in 0i64..90,
        slice in prop::option::of((0usize..4, 0usize..6)),
    ) {
        runtime().block_on(async {
            let db = Database::temporary().await.unwrap();
            let manager = db
                .register(
                    ModelDef::builder("app", "Person")
                        .field("name", FieldDef::char(10))
                        .field("age", FieldDef::integer())
                        .ordering(&["name", "age"])
                        .build()
                        .unwrap(),
                )
                .unwrap();
            for (name, age) in &people {
                manager
                    .create(&[("name", name.as_str().into()), ("age", (*age).into())])
                    .await
                    .unwrap();
            }

            let mut base = manager.all();
            let mut remote = manager.filter("age__gte", threshold).exclude("name__startswith", "a");
            if let Some((offset, limit)) = slice {
                base = base.offset(offset).limit(limit);
                remote = remote.offset(offset).limit(limit);
            }
            let fetched = base.fetch().await.unwrap();
            let local = fetched.filter("age__gte", threshold).exclude("name__startswith", "a");
            assert_eq!(local.is_fetched(), slice.is_none());
            let local = local.fetch().await.unwrap();
            let remote = remote.fetch().await.unwrap();

            let pks = |set: &[ormkv_core::Instance]| set.iter().map(|i| i.pk().clone()).collect::<Vec<_>>();
            assert_eq!(pks(local.array()), pks(remote.array()));
            let matching = people
                .iter()
                .filter(|(name, age)| *age >= threshold && !name.starts_with('a'))
                .count();
            let expected = match slice {
                Some((offset, limit)) => matching.saturating_sub(offset).min(limit),
                None => matching,
            };
            assert_eq!(local.array().len(), expected);
        });
    }
}
