// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn endpoints(n: usize) -> Vec<EndpointMapping> {
    (0..n)
        .map(|i| EndpointMapping {
            session_id: format!("s{i}"),
            message_id: format!("m{i}"),
            mode: None,
            battle_target: None,
            model_type: None,
        })
        .collect()
}

#[test]
fn round_robin_cycles_in_order() {
    let rr = RoundRobinIndex::new();
    let eps = endpoints(3);
    let picks: Vec<&str> =
        (0..6).map(|_| rr.pick("m1", &eps).session_id.as_str()).collect();
    assert_eq!(picks, vec!["s0", "s1", "s2", "s0", "s1", "s2"]);
    // Six dispatches over three endpoints land the index back at 0 (S5).
    assert_eq!(rr.current("m1"), 0);
}

#[test]
fn round_robin_is_independent_per_model() {
    let rr = RoundRobinIndex::new();
    let eps = endpoints(2);
    let _ = rr.pick("m1", &eps);
    let _ = rr.pick("m1", &eps);
    let first = rr.pick("m2", &eps);
    assert_eq!(first.session_id, "s0");
}

#[test]
fn round_robin_matches_ceiling_formula_for_arbitrary_m() {
    // Invariant 5: endpoint i chosen exactly ceil((m - i) / n) times for i in [0, n),
    // starting from index 0.
    let n = 4;
    let m = 10usize;
    let rr = RoundRobinIndex::new();
    let eps = endpoints(n);
    let mut counts = vec![0usize; n];
    for _ in 0..m {
        let picked = rr.pick("m", &eps);
        let idx = eps.iter().position(|e| e.session_id == picked.session_id).unwrap();
        counts[idx] += 1;
    }
    for i in 0..n {
        let expected = (m - i + n - 1) / n;
        assert_eq!(counts[i], expected, "endpoint {i}");
    }
}

#[test]
fn resolve_model_type_falls_back_to_text() {
    let endpoint_map = ModelEndpointMap::default();
    let map = ModelMap::default();
    assert_eq!(resolve_model_type(&endpoint_map, &map, "unknown"), ModelType::Text);
}

#[test]
fn resolve_model_type_uses_model_map_entry() {
    let endpoint_map = ModelEndpointMap::default();
    let mut map = ModelMap::default();
    map.0.insert("img1".into(), ModelEntry { id: Some("img1".into()), model_type: ModelType::Image });
    assert_eq!(resolve_model_type(&endpoint_map, &map, "img1"), ModelType::Image);
}

#[test]
fn resolve_model_type_prefers_endpoint_map_over_model_map() {
    let mut endpoint_map = ModelEndpointMap::default();
    endpoint_map.0.insert(
        "img1".into(),
        EndpointBinding::Single(EndpointMapping {
            session_id: "s".into(),
            message_id: "m".into(),
            mode: None,
            battle_target: None,
            model_type: Some(ModelType::Image),
        }),
    );
    let mut map = ModelMap::default();
    map.0.insert("img1".into(), ModelEntry { id: Some("img1".into()), model_type: ModelType::Text });

    assert_eq!(resolve_model_type(&endpoint_map, &map, "img1"), ModelType::Image);
}

#[test]
fn resolve_model_type_checks_first_entry_of_list_binding() {
    let mut endpoint_map = ModelEndpointMap::default();
    endpoint_map.0.insert(
        "img1".into(),
        EndpointBinding::List(vec![EndpointMapping {
            session_id: "s".into(),
            message_id: "m".into(),
            mode: None,
            battle_target: None,
            model_type: Some(ModelType::Image),
        }]),
    );
    let map = ModelMap::default();

    assert_eq!(resolve_model_type(&endpoint_map, &map, "img1"), ModelType::Image);
}

#[test]
fn endpoint_binding_deserializes_single_and_list() {
    let single: EndpointBinding =
        serde_json::from_str(r#"{"sessionId":"s","messageId":"m"}"#).unwrap();
    assert!(matches!(single, EndpointBinding::Single(_)));

    let list: EndpointBinding = serde_json::from_str(
        r#"[{"sessionId":"s1","messageId":"m1"},{"sessionId":"s2","messageId":"m2"}]"#,
    )
    .unwrap();
    match list {
        EndpointBinding::List(v) => assert_eq!(v.len(), 2),
        _ => panic!("expected list"),
    }
}
