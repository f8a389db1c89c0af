use arcus_rs::models::settings::MergeStrategy;
use arcus_rs::services::map_reduce::{extract_values, join_documents, merge_documents};
use serde_json::json;

#[test]
fn extract_from_top_level_collection() {
    let doc = json!({"conversations": [{"id": "c1"}, {"id": "c2"}, {"id": "c3"}]});
    assert_eq!(
        extract_values(&doc, "conversations", "id"),
        vec![json!("c1"), json!("c2"), json!("c3")]
    );
}

#[test]
fn extract_skips_elements_without_the_field() {
    let doc = json!({"rows": [{"id": 1}, {"name": "x"}, {"id": 3}, {"id": null}]});
    assert_eq!(extract_values(&doc, "rows", "id"), vec![json!(1), json!(3)]);
}

#[test]
fn extract_missing_path_is_empty() {
    let doc = json!({"a": {"b": []}});
    assert!(extract_values(&doc, "a.c", "id").is_empty());
    assert!(extract_values(&doc, "a.b.c", "id").is_empty());
}

#[test]
fn enrich_uses_default_field_when_unset() {
    let merged = merge_documents(
        &MergeStrategy::Enrich,
        "src",
        &json!({"a": 1}),
        "dst",
        &json!({"b": 2}),
        None,
    )
    .unwrap();
    assert_eq!(merged, json!({"a": 1, "enriched_data": {"b": 2}}));
}

#[test]
fn enrich_uses_configured_field() {
    let merged = merge_documents(
        &MergeStrategy::Enrich,
        "src",
        &json!({"conversations": []}),
        "dst",
        &json!({"followups": []}),
        Some("followup_data"),
    )
    .unwrap();
    assert_eq!(
        merged,
        json!({"conversations": [], "followup_data": {"followups": []}})
    );
}

#[test]
fn enrich_rejects_non_object_source() {
    let err = merge_documents(
        &MergeStrategy::Enrich,
        "src",
        &json!([1, 2, 3]),
        "dst",
        &json!({}),
        None,
    )
    .unwrap_err();
    assert!(err.to_string().contains("enrich"));
}

#[test]
fn flat_merge_target_wins_collisions() {
    let merged = merge_documents(
        &MergeStrategy::Flat,
        "src",
        &json!({"keep": 1, "both": "source"}),
        "dst",
        &json!({"add": 2, "both": "target"}),
        None,
    )
    .unwrap();
    assert_eq!(merged, json!({"keep": 1, "add": 2, "both": "target"}));
}

#[test]
fn join_result_order_follows_base_rows() {
    // The ancillary rows are deliberately shuffled; output order must track
    // the base backend's row order.
    let documents = vec![
        (
            "base".to_string(),
            json!([{"k": "z"}, {"k": "m"}, {"k": "a"}]),
        ),
        (
            "side".to_string(),
            json!([{"k": "a", "v": 1}, {"k": "z", "v": 26}, {"k": "m", "v": 13}]),
        ),
    ];
    let joined = join_documents(&documents, "k", false, None).unwrap();
    assert_eq!(
        joined,
        json!([{"k": "z", "v": 26}, {"k": "m", "v": 13}, {"k": "a", "v": 1}])
    );
}

#[test]
fn join_is_independent_of_ancillary_document_order() {
    let base = ("base".to_string(), json!([{"id": 1}, {"id": 2}]));
    let side_a = ("a".to_string(), json!([{"id": 1, "a": true}]));
    let side_b = ("b".to_string(), json!([{"id": 2, "b": true}]));

    let forward = join_documents(
        &[base.clone(), side_a.clone(), side_b.clone()],
        "id",
        false,
        None,
    )
    .unwrap();
    let reversed =
        join_documents(&[base, side_b, side_a], "id", false, None).unwrap();
    assert_eq!(forward, reversed);
}

#[test]
fn join_filter_on_empty_requires_every_ancillary() {
    let documents = vec![
        ("base".to_string(), json!([{"id": 1}, {"id": 2}])),
        ("a".to_string(), json!([{"id": 1, "a": 1}, {"id": 2, "a": 2}])),
        ("b".to_string(), json!([{"id": 2, "b": 2}])),
    ];
    // id=1 has no row in backend b, so it drops entirely.
    let joined = join_documents(&documents, "id", true, None).unwrap();
    assert_eq!(joined, json!([{"id": 2, "a": 2, "b": 2}]));
}

#[test]
fn join_flat_merge_excludes_duplicate_join_key() {
    let documents = vec![
        ("base".to_string(), json!([{"id": "1", "name": "one"}])),
        ("side".to_string(), json!([{"id": "1", "extra": "a"}])),
    ];
    let joined = join_documents(&documents, "id", false, None).unwrap();
    // the ancillary's own id copy is not duplicated into the row
    assert_eq!(joined, json!([{"id": "1", "name": "one", "extra": "a"}]));
}

#[test]
fn join_reads_items_and_data_wrappers() {
    let documents = vec![
        ("base".to_string(), json!({"items": [{"id": 1}]})),
        ("side".to_string(), json!({"data": [{"id": 1, "v": "x"}]})),
    ];
    let joined = join_documents(&documents, "id", false, None).unwrap();
    assert_eq!(joined, json!([{"id": 1, "v": "x"}]));
}

#[test]
fn join_numeric_and_string_keys_do_not_collide() {
    let documents = vec![
        ("base".to_string(), json!([{"id": 1}, {"id": "1"}])),
        ("side".to_string(), json!([{"id": "1", "v": "string"}])),
    ];
    let joined = join_documents(&documents, "id", true, None).unwrap();
    // only the string-keyed row matches the string-keyed ancillary
    assert_eq!(joined, json!([{"id": "1", "v": "string"}]));
}
