use serde::Deserialize;
use serde_json::{json, Value};
use sqlbridge::rows::{decode_row, encode_row, RowAccumulator, RowError};
use sqlbridge::worker::protocol::FlatRow;

fn flat(value: Value) -> FlatRow {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

fn entities(acc: &RowAccumulator) -> Vec<Value> {
    acc.compile(|| json!({})).collect()
}

fn product_default() -> Value {
    json!({
        "id": -1,
        "name": "",
        "description": "",
        "store": {"id": -1, "address": "", "company": ""}
    })
}

#[test]
fn test_duplicate_join_rows_merge_into_one_entity() {
    let row = flat(json!({"id": 1, "Name": "A", "Store_Id": 10, "Store_Company": "X"}));

    let mut acc = RowAccumulator::new();
    acc.merge(&row).unwrap();
    acc.merge(&row).unwrap();

    assert_eq!(acc.len(), 1);
    assert_eq!(
        entities(&acc),
        vec![json!({"id": 1, "name": "A", "store": {"id": 10, "company": "X"}})]
    );
}

#[test]
fn test_left_join_without_match_takes_default() {
    let mut acc = RowAccumulator::new();
    acc.merge(&flat(json!({"id": 2, "Name": "B", "Store_Id": null})))
        .unwrap();

    let compiled: Vec<Value> = acc.compile(product_default).collect();
    assert_eq!(
        compiled,
        vec![json!({
            "id": 2,
            "name": "B",
            "store": {"id": -1, "address": "", "company": ""},
            "description": ""
        })]
    );
}

#[test]
fn test_partially_matched_nested_object_keeps_values() {
    let mut acc = RowAccumulator::new();
    acc.merge(&flat(json!({
        "Id": 3,
        "Name": "C",
        "Store_Id": 7,
        "Store_Company": null
    })))
    .unwrap();

    let compiled: Vec<Value> = acc.compile(product_default).collect();
    assert_eq!(compiled[0]["store"], json!({"id": 7, "company": "", "address": ""}));
}

#[test]
fn test_merge_is_idempotent() {
    let rows = [
        flat(json!({"Id": 1, "Name": "A", "Store_Id": 10})),
        flat(json!({"Id": 2, "Name": "B"})),
    ];

    let mut once = RowAccumulator::new();
    let mut twice = RowAccumulator::new();
    for row in &rows {
        once.merge(row).unwrap();
        twice.merge(row).unwrap();
        twice.merge(row).unwrap();
    }

    assert_eq!(entities(&once), entities(&twice));
}

#[test]
fn test_merge_commutes_for_consistent_rows() {
    // Fan-out rows of one product: each carries the parent plus one part.
    let a = flat(json!({"Id": 1, "Name": "A", "Store_Id": 10}));
    let b = flat(json!({"Id": 1, "Name": "A", "Store_Company": "X"}));
    let c = flat(json!({"Id": 1, "Description": "chair", "Store_Address": "Main St"}));

    let orders = [[&a, &b, &c], [&c, &b, &a], [&b, &a, &c], [&c, &a, &b]];
    let results: Vec<Vec<Value>> = orders
        .iter()
        .map(|order| {
            let acc = RowAccumulator::from_rows(order.iter().copied()).unwrap();
            entities(&acc)
                .into_iter()
                .map(|entity| sort_keys(&entity))
                .collect()
        })
        .collect();

    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
    assert_eq!(
        results[0][0],
        sort_keys(&json!({
            "id": 1,
            "name": "A",
            "description": "chair",
            "store": {"id": 10, "company": "X", "address": "Main St"}
        }))
    );
}

#[test]
fn test_merge_is_associative() {
    let a = flat(json!({"Id": 1, "Store_Id": 10}));
    let b = flat(json!({"Id": 1, "Store_Company": "X"}));
    let c = flat(json!({"Id": 1, "Name": "A"}));

    // (a + b) + c, built row by row
    let left = RowAccumulator::from_rows([&a, &b, &c]).unwrap();

    // a + (b + c), merging the pre-merged record of b and c
    let inner = RowAccumulator::from_rows([&b, &c]).unwrap();
    let bc = inner.get(&json!(1)).unwrap().clone();
    let mut right = RowAccumulator::from_rows([&a]).unwrap();
    right.merge_record(bc);

    assert_eq!(
        entities(&left).iter().map(sort_keys).collect::<Vec<_>>(),
        entities(&right).iter().map(sort_keys).collect::<Vec<_>>()
    );
}

#[test]
fn test_compile_preserves_first_insertion_order() {
    let mut acc = RowAccumulator::new();
    acc.merge(&flat(json!({"Id": 3, "Name": "C"}))).unwrap();
    acc.merge(&flat(json!({"Id": 1, "Name": "A"}))).unwrap();
    acc.merge(&flat(json!({"Id": 2}))).unwrap();
    // Completing earlier entities later does not move them.
    acc.merge(&flat(json!({"Id": 1, "Description": "late"}))).unwrap();
    acc.merge(&flat(json!({"Id": 3, "Store_Id": 9}))).unwrap();
    acc.merge(&flat(json!({"Id": 2, "Name": "B"}))).unwrap();

    let ids: Vec<Value> = entities(&acc).into_iter().map(|e| e["id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(1), json!(2)]);
}

#[test]
fn test_numeric_ids_are_canonical() {
    let mut acc = RowAccumulator::new();
    acc.merge(&flat(json!({"Id": 5, "Name": "int"}))).unwrap();
    acc.merge(&flat(json!({"Id": 5.0, "Description": "float"}))).unwrap();
    acc.merge(&flat(json!({"Id": "5", "Name": "text"}))).unwrap();

    assert_eq!(acc.len(), 2);
    assert_eq!(acc.get(&json!(5)).unwrap()["description"], json!("float"));
    assert_eq!(acc.get(&json!("5")).unwrap()["name"], json!("text"));
}

#[test]
fn test_decode_round_trips_encoded_records() {
    let records = [
        json!({"id": 1, "name": "A"}),
        json!({"id": 1, "name": "A", "store": {"id": 10, "company": "X"}}),
        json!({
            "id": 7,
            "store": {"id": 2, "owner": {"name": "Kim", "address": {"city": "Oslo"}}},
            "price": 9.5,
            "tags": null
        }),
    ];

    for record in records {
        let Value::Object(map) = &record else {
            unreachable!()
        };
        let decoded = decode_row(&encode_row(map)).unwrap();
        assert_eq!(Value::Object(decoded), record);
    }
}

#[test]
fn test_compile_into_typed_records() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Store {
        id: i64,
        company: String,
        address: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Product {
        id: i64,
        name: String,
        description: String,
        store: Store,
    }

    let mut acc = RowAccumulator::new();
    acc.merge(&flat(json!({
        "Id": 1,
        "Name": "Chair",
        "Description": "oak",
        "Store_Id": 10,
        "Store_Company": "X",
        "Store_Address": "Main St"
    })))
    .unwrap();
    acc.merge(&flat(json!({"Id": 2, "Name": "Desk", "Description": null, "Store_Id": null})))
        .unwrap();

    let products: Vec<Product> = acc.compile_into(product_default).unwrap();
    assert_eq!(products.len(), 2);
    assert_eq!(products[0].store.company, "X");
    assert_eq!(products[1].description, "");
    assert_eq!(products[1].store.id, -1);
}

#[test]
fn test_compile_into_type_mismatch() {
    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Strict {
        id: i64,
        name: String,
    }

    let mut acc = RowAccumulator::new();
    acc.merge(&flat(json!({"Id": 1}))).unwrap();

    let err = acc.compile_into::<Strict, _>(|| json!({})).unwrap_err();
    assert!(matches!(err, RowError::Deserialize(_)));
}

/// Rebuild an object with sorted keys so comparisons ignore insertion order.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), sort_keys(&map[k])))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}
