use std::collections::HashSet;

use super::types::{SearchContext, SeqField};

/// Fold a turn's extracted filters into the accumulated context.
///
/// Scalars present in `incoming` overwrite, absent ones leave `prior` alone,
/// and keys `incoming` clears are dropped. Sequences append with
/// de-duplication unless `incoming` replaces or clears them. Extension keys
/// overwrite per key. The result never carries clear or replace markers, so
/// merging the same `incoming` twice changes nothing.
pub fn merge(prior: &SearchContext, incoming: &SearchContext) -> SearchContext {
    let mut extra = prior.extra.clone();
    extra.retain(|key, value| !value.is_null() && !incoming.clears(key));
    for (key, value) in &incoming.extra {
        if value.is_null() {
            extra.remove(key);
        } else {
            extra.insert(key.clone(), value.clone());
        }
    }

    let scalar = |key: &str| incoming.clears(key);
    SearchContext {
        neighborhood: pick(&prior.neighborhood, &incoming.neighborhood, scalar("neighborhood")),
        borough: pick(&prior.borough, &incoming.borough, scalar("borough")),
        property_type: pick(&prior.property_type, &incoming.property_type, scalar("propertyType")),
        address: pick(&prior.address, &incoming.address, scalar("address")),
        zipcode: pick(&prior.zipcode, &incoming.zipcode, scalar("zipcode")),
        min_price: pick(&prior.min_price, &incoming.min_price, scalar("minPrice")),
        max_price: pick(&prior.max_price, &incoming.max_price, scalar("maxPrice")),
        bedrooms: pick(&prior.bedrooms, &incoming.bedrooms, scalar("bedrooms")),
        min_bathrooms: pick(&prior.min_bathrooms, &incoming.min_bathrooms, scalar("minBathrooms")),
        min_sqft: pick(&prior.min_sqft, &incoming.min_sqft, scalar("minSqft")),
        max_sqft: pick(&prior.max_sqft, &incoming.max_sqft, scalar("maxSqft")),
        no_fee: pick(&prior.no_fee, &incoming.no_fee, scalar("noFee")),
        tags: merge_seq(&prior.tags, &incoming.tags, scalar("tags")),
        amenities: merge_seq(&prior.amenities, &incoming.amenities, scalar("amenities")),
        extra,
        cleared: Default::default(),
    }
}

fn pick<T: Clone>(prior: &Option<T>, incoming: &Option<T>, cleared: bool) -> Option<T> {
    match incoming {
        Some(value) => Some(value.clone()),
        None if cleared => None,
        None => prior.clone(),
    }
}

fn merge_seq(prior: &SeqField, incoming: &SeqField, cleared: bool) -> SeqField {
    let values: Box<dyn Iterator<Item = &String>> = if incoming.replace || cleared {
        Box::new(incoming.values.iter())
    } else {
        Box::new(prior.values.iter().chain(incoming.values.iter()))
    };

    let mut seen = HashSet::new();
    SeqField {
        values: values.filter(|v| seen.insert(v.as_str())).cloned().collect(),
        replace: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, BTreeSet};

    fn ctx(value: Value) -> SearchContext {
        SearchContext::from_value(value).unwrap()
    }

    #[test]
    fn test_scalar_overwrite_and_preserve() {
        let prior = ctx(json!({"neighborhood": "Williamsburg", "bedrooms": 2}));
        let incoming = ctx(json!({"maxPrice": 3000}));

        assert_eq!(
            merge(&prior, &incoming).to_value(),
            json!({"neighborhood": "Williamsburg", "bedrooms": 2, "maxPrice": 3000})
        );

        let moved = ctx(json!({"neighborhood": "Bushwick"}));
        assert_eq!(
            merge(&prior, &moved).neighborhood.as_deref(),
            Some("Bushwick")
        );
    }

    #[test]
    fn test_explicit_null_clears_key() {
        let prior = ctx(json!({
            "neighborhood": "Astoria",
            "bedrooms": 2,
            "tags": ["Luxury"],
            "laundry": "in-unit",
        }));
        let incoming = ctx(json!({"neighborhood": null, "tags": null, "laundry": null}));

        let merged = merge(&prior, &incoming);
        assert_eq!(merged.to_value(), json!({"bedrooms": 2}));
        assert!(merged.cleared.is_empty());
        assert_eq!(merge(&merged, &incoming), merged);
    }

    #[test]
    fn test_absent_key_is_not_a_clear() {
        let prior = ctx(json!({"neighborhood": "Astoria", "laundry": "in-unit"}));
        let incoming = ctx(json!({"bedrooms": 1}));

        let merged = merge(&prior, &incoming);
        assert_eq!(merged.neighborhood.as_deref(), Some("Astoria"));
        assert_eq!(merged.extra.get("laundry"), Some(&json!("in-unit")));
    }

    #[test]
    fn test_sequences_append_and_dedupe() {
        let prior = ctx(json!({"tags": ["Luxury", "Renovated"]}));
        let incoming = ctx(json!({"tags": ["Renovated", "Pet Friendly"]}));

        let merged = merge(&prior, &incoming);
        assert_eq!(
            merged.tags.values,
            vec!["Luxury", "Renovated", "Pet Friendly"]
        );
        assert!(!merged.tags.replace);
    }

    #[test]
    fn test_sequences_replace_when_marked() {
        let prior = ctx(json!({"amenities": ["gym", "doorman"]}));

        let replaced = merge(&prior, &ctx(json!({"amenities": {"replace": ["pool"]}})));
        assert_eq!(replaced.amenities.values, vec!["pool"]);

        let cleared = merge(&prior, &ctx(json!({"amenities": {"replace": []}})));
        assert!(cleared.amenities.is_unset());
    }

    #[test]
    fn test_unknown_keys_survive_merge() {
        let prior = ctx(json!({"schoolDistrict": 14}));
        let incoming = ctx(json!({"bedrooms": 1, "view": "water"}));

        assert_eq!(
            merge(&prior, &incoming).to_value(),
            json!({"bedrooms": 1, "schoolDistrict": 14, "view": "water"})
        );
    }

    fn arb_words() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-c]{1,2}", 0..4)
    }

    fn arb_seq() -> impl Strategy<Value = SeqField> {
        (arb_words(), any::<bool>()).prop_map(|(values, replace)| SeqField { values, replace })
    }

    fn arb_context() -> impl Strategy<Value = SearchContext> {
        (
            prop::option::of("[A-Z][a-z]{2,8}"),
            prop::option::of(0u64..10_000),
            prop::option::of(0u64..10_000),
            prop::option::of(0u32..6),
            prop::option::of(0.0f64..5.0),
            prop::option::of(any::<bool>()),
            arb_seq(),
            arb_seq(),
            prop::collection::btree_map(
                "x[a-c]",
                prop_oneof![Just(Value::Null), any::<i32>().prop_map(Value::from)],
                0..3,
            ),
            prop::collection::btree_set(
                prop_oneof![
                    Just("neighborhood".to_string()),
                    Just("maxPrice".to_string()),
                    Just("tags".to_string()),
                    "x[a-c]",
                ],
                0..3,
            ),
        )
            .prop_map(
                |(neighborhood, min_price, max_price, bedrooms, baths, no_fee, tags, amenities, extra, cleared)| {
                    SearchContext {
                        neighborhood,
                        min_price,
                        max_price,
                        bedrooms,
                        min_bathrooms: baths,
                        no_fee,
                        tags,
                        amenities,
                        extra: extra.into_iter().collect::<BTreeMap<_, _>>(),
                        cleared: cleared.into_iter().collect::<BTreeSet<_>>(),
                        ..Default::default()
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(a in arb_context(), b in arb_context()) {
            let once = merge(&a, &b);
            let twice = merge(&once, &b);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_keeps_prior_keys(a in arb_context(), b in arb_context()) {
            let merged = merge(&a, &b).to_value();
            let merged = merged.as_object().unwrap();
            for (key, value) in a.to_value().as_object().unwrap() {
                let erased = b.clears(key) || b.extra.get(key).is_some_and(Value::is_null);
                if value.is_null() || key == "tags" || key == "amenities" || erased {
                    continue;
                }
                prop_assert!(merged.contains_key(key), "lost key {}", key);
            }

            let tags = merge(&a, &b).tags;
            if !b.tags.replace && !b.clears("tags") {
                for tag in &a.tags.values {
                    prop_assert!(tags.values.contains(tag));
                }
            }
        }

        #[test]
        fn prop_merge_with_empty_is_identity_on_values(a in arb_context()) {
            let merged = merge(&SearchContext::default(), &a);
            prop_assert_eq!(merged.neighborhood, a.neighborhood);
            prop_assert_eq!(merged.bedrooms, a.bedrooms);
            prop_assert_eq!(merged.max_price, a.max_price);
        }
    }
}
