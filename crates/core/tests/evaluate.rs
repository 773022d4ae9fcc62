#![forbid(unsafe_code)]

use serde_json::{json, Value};
use tally_core::{compare_values, values_equal, QuerySpec, Record};

fn rec(v: Value) -> Record { v.as_object().cloned().expect("fixture must be an object") }

fn fixture() -> Vec<Record> {
    vec![
        rec(json!({"id": 1, "name": "Bolt", "qty": 5, "warehouse": "north", "active": true})),
        rec(json!({"id": 2, "name": "Nut", "qty": 0, "warehouse": "south", "active": true})),
        rec(json!({"id": 3, "name": "Washer", "qty": 5, "warehouse": "north", "active": false})),
        rec(json!({"id": 4, "name": "Anchor", "qty": 12, "warehouse": "south", "active": true})),
        rec(json!({"id": 5, "name": "Rivet", "qty": 0, "warehouse": "north"})),
        rec(json!({"id": 6, "name": "Bracket", "qty": null, "warehouse": "east", "active": true})),
    ]
}

fn ids(rows: &[Record]) -> Vec<i64> { rows.iter().map(|r| r["id"].as_i64().unwrap()).collect() }

#[test]
fn filter_returns_exact_subset_for_every_single_and_pair_filter() {
    let rows = fixture();
    let fields = ["qty", "warehouse", "active"];
    // Every value that appears in the fixture, plus one that never does
    let mut candidates: Vec<(String, Value)> = Vec::new();
    for f in fields {
        for r in rows.iter() {
            candidates.push((f.to_string(), r.get(f).cloned().unwrap_or(Value::Null)));
        }
        candidates.push((f.to_string(), json!("nope")));
    }

    let check = |spec: &QuerySpec| {
        let got = ids(&spec.evaluate(rows.iter()));
        let want: Vec<i64> = rows
            .iter()
            .filter(|r| {
                spec.filter.iter().all(|(k, v)| values_equal(r.get(k).unwrap_or(&Value::Null), v))
            })
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(got, want, "filter {:?}", spec.filter);
    };

    for (f, v) in candidates.iter() {
        check(&QuerySpec::new("items").eq(f.clone(), v.clone()));
        for (g, w) in candidates.iter() {
            if g != f {
                check(&QuerySpec::new("items").eq(f.clone(), v.clone()).eq(g.clone(), w.clone()));
            }
        }
    }
}

#[test]
fn qty_zero_filter_matches_scenario() {
    let rows = vec![
        rec(json!({"id": 1, "name": "A", "qty": 5})),
        rec(json!({"id": 2, "name": "B", "qty": 0})),
    ];
    let out = QuerySpec::new("items").eq("qty", 0).evaluate(rows.iter());
    assert_eq!(out, vec![rec(json!({"id": 2, "name": "B", "qty": 0}))]);
}

#[test]
fn ordering_is_directional_and_stable() {
    let rows = fixture();
    for field in ["qty", "name", "warehouse", "active"] {
        for ascending in [true, false] {
            let out = QuerySpec::new("items").order_by(field, ascending).evaluate(rows.iter());
            assert_eq!(out.len(), rows.len());
            for pair in out.windows(2) {
                let a = pair[0].get(field).unwrap_or(&Value::Null);
                let b = pair[1].get(field).unwrap_or(&Value::Null);
                let o = compare_values(a, b);
                if ascending {
                    assert!(o.is_le(), "{field} asc: {a} before {b}");
                } else {
                    assert!(o.is_ge(), "{field} desc: {a} before {b}");
                }
                // Ties keep fixture order (ids ascending in the fixture)
                if o.is_eq() {
                    assert!(pair[0]["id"].as_i64() < pair[1]["id"].as_i64(), "{field} tie not stable");
                }
            }
        }
    }
}

#[test]
fn nulls_last_ascending_first_descending() {
    let rows = fixture();
    let asc = ids(&QuerySpec::new("items").order_by("qty", true).evaluate(rows.iter()));
    assert_eq!(asc, vec![2, 5, 1, 3, 4, 6]);
    let desc = ids(&QuerySpec::new("items").order_by("qty", false).evaluate(rows.iter()));
    assert_eq!(desc, vec![6, 4, 1, 3, 2, 5]);
}

#[test]
fn limit_takes_prefix_of_filtered_ordered_result() {
    let rows = fixture();
    let full = QuerySpec::new("items").eq("warehouse", "north").order_by("name", true);
    let all = full.evaluate(rows.iter());
    for n in 0..=all.len() + 1 {
        let limited = full.clone().limit(n).evaluate(rows.iter());
        assert!(limited.len() <= n);
        assert_eq!(limited[..], all[..n.min(all.len())]);
    }
}

#[test]
fn selection_projects_after_ordering() {
    let rows = fixture();
    let out = QuerySpec::new("items").select(["name"]).order_by("qty", false).limit(2).evaluate(rows.iter());
    assert_eq!(out, vec![rec(json!({"name": "Bracket"})), rec(json!({"name": "Anchor"}))]);
}
