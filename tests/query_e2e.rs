use std::sync::Arc;

use serde_json::{json, Value};

use docql::{
    Database, DatabaseConfig, InMemoryStores, IndexSpec, Parameters, Query, QueryLanguage,
    ResultSet,
};

fn seeded() -> (Database, InMemoryStores) {
    let stores = InMemoryStores::new();
    let docs = &stores.documents;
    docs.put("_default", "p1", json!({"type": "person", "name": "Ada", "age": 36, "tags": ["math", "code"]}))
        .unwrap();
    docs.put("_default", "p2", json!({"type": "person", "name": "Brendan", "age": null}))
        .unwrap();
    docs.put("_default", "p3", json!({"type": "person", "name": "Alan", "age": 41, "address": {"city": "London"}}))
        .unwrap();
    docs.put("_default", "c1", json!({"type": "city", "name": "London"})).unwrap();
    let db = Database::new(
        stores.documents.clone(),
        stores.indexes.clone(),
        DatabaseConfig::default(),
    );
    (db, stores)
}

fn rows(mut rs: ResultSet) -> Vec<Value> {
    let mut out = Vec::new();
    while rs.advance() {
        out.push(rs.row_as_json().unwrap());
    }
    out
}

fn run(query: &Query) -> Vec<Value> {
    rows(query.execute().unwrap())
}

fn n1ql(db: &Database, text: &str) -> Query {
    db.create_query(QueryLanguage::N1ql, text).unwrap()
}

#[test]
fn json_where_on_empty_database_yields_no_rows() {
    let (db, _) = Database::in_memory();
    let query = db
        .create_query(QueryLanguage::Json, r#"{"WHERE": ["=", [".", "type"], "task"]}"#)
        .unwrap();
    let mut rs = query.execute().unwrap();
    assert!(!rs.advance());
    assert_eq!(rs.value_at(0), None);
    assert_eq!(rs.column_count(), 1);
}

#[test]
fn every_row_has_the_query_column_schema() {
    let (db, _) = seeded();
    let query = n1ql(&db, "SELECT meta().id, name, age, address.city FROM _");
    let mut rs = query.execute().unwrap();
    assert_eq!(rs.column_count(), query.column_count());
    let names: Vec<&str> = (0..query.column_count())
        .filter_map(|i| query.column_name(i))
        .collect();
    assert_eq!(names, vec!["_id", "name", "age", "city"]);

    let mut count = 0;
    while rs.advance() {
        count += 1;
        assert_eq!(rs.column_names().len(), 4);
        assert!(rs.value_at(0).is_some());
        assert_eq!(rs.value_at(4), None);
    }
    assert_eq!(count, 4);
}

#[test]
fn json_and_n1ql_agree() {
    let (db, _) = seeded();
    let json_query = db
        .create_query(
            QueryLanguage::Json,
            r#"{"WHAT": [[".name"]], "WHERE": ["AND", ["=", [".type"], "person"], [">", [".age"], 30]], "ORDER_BY": [["DESC", [".age"]]]}"#,
        )
        .unwrap();
    let n1ql_query = n1ql(
        &db,
        "SELECT name FROM _ WHERE type = 'person' AND age > 30 ORDER BY age DESC",
    );
    let expected = vec![json!({"name": "Alan"}), json!({"name": "Ada"})];
    assert_eq!(run(&json_query), expected);
    assert_eq!(run(&n1ql_query), expected);
}

#[test]
fn missing_and_null_semantics() {
    let (db, _) = seeded();

    // Comparisons against null or a missing property never match.
    let query = n1ql(&db, "SELECT meta().id FROM _ WHERE age < 100");
    assert_eq!(run(&query), vec![json!({"_id": "p1"}), json!({"_id": "p3"})]);

    let query = n1ql(&db, "SELECT meta().id FROM _ WHERE age IS NULL");
    assert_eq!(run(&query), vec![json!({"_id": "p2"})]);

    let query = n1ql(&db, "SELECT meta().id FROM _ WHERE age IS MISSING");
    assert_eq!(run(&query), vec![json!({"_id": "c1"})]);

    let query = n1ql(&db, "SELECT meta().id FROM _ WHERE age IS VALUED");
    assert_eq!(run(&query), vec![json!({"_id": "p1"}), json!({"_id": "p3"})]);

    // MISSING columns are reported as None and left out of row objects.
    let query = n1ql(&db, "SELECT meta().id, address.city FROM _ WHERE type = 'person'");
    let mut rs = query.execute().unwrap();
    assert!(rs.advance());
    assert_eq!(rs.value_for("city"), None);
    assert_eq!(rs.row_as_json(), Some(json!({"_id": "p1"})));
}

#[test]
fn like_and_nested_paths() {
    let (db, _) = seeded();
    let query = n1ql(&db, "SELECT name FROM _ WHERE name LIKE 'A%'");
    assert_eq!(run(&query), vec![json!({"name": "Ada"}), json!({"name": "Alan"})]);

    let query = n1ql(&db, "SELECT name FROM _ WHERE name NOT LIKE '_da'");
    assert_eq!(run(&query).len(), 3);

    let query = n1ql(&db, "SELECT tags[1] AS second FROM _ WHERE meta().id = 'p1'");
    assert_eq!(run(&query), vec![json!({"second": "code"})]);
}

#[test]
fn order_by_collation_and_default_id_order() {
    let (db, _) = seeded();
    let query = n1ql(&db, "SELECT meta().id FROM _ ORDER BY age");
    // MISSING < null < numbers.
    assert_eq!(
        run(&query),
        vec![json!({"_id": "c1"}), json!({"_id": "p2"}), json!({"_id": "p1"}), json!({"_id": "p3"})]
    );

    let query = n1ql(&db, "SELECT meta().id FROM _");
    assert_eq!(
        run(&query),
        vec![json!({"_id": "c1"}), json!({"_id": "p1"}), json!({"_id": "p2"}), json!({"_id": "p3"})]
    );
}

#[test]
fn parameters_bind_and_extra_bindings_are_ignored() {
    let (db, _) = seeded();
    let query = n1ql(
        &db,
        "SELECT name FROM _ WHERE type = $type ORDER BY name LIMIT $lim OFFSET $off",
    );
    let mut params = Parameters::new();
    params.insert("type".to_string(), json!("person"));
    params.insert("lim".to_string(), json!(2));
    params.insert("off".to_string(), json!(1));
    params.insert("unused".to_string(), json!("ignored"));
    query.set_parameters(params);
    assert_eq!(run(&query), vec![json!({"name": "Alan"}), json!({"name": "Brendan"})]);

    // Unbound parameters are MISSING: no rows match, and no limit applies.
    query.set_parameters(Parameters::new());
    assert!(run(&query).is_empty());
}

#[test]
fn negative_limit_is_an_execution_error() {
    let (db, _) = seeded();
    let query = n1ql(&db, "SELECT name FROM _ LIMIT $lim");
    query.set_parameters_json(r#"{"lim": -3}"#).unwrap();
    assert!(query.execute().unwrap_err().is_execution());
}

#[test]
fn other_collections_and_star() {
    let (db, stores) = seeded();
    stores.documents.create_collection("cities").unwrap();
    stores
        .documents
        .put("cities", "lon", json!({"name": "London", "pop": 9}))
        .unwrap();

    let query = n1ql(&db, "SELECT * FROM cities");
    assert_eq!(query.column_name(0), Some("cities"));
    assert_eq!(run(&query), vec![json!({"cities": {"name": "London", "pop": 9}})]);

    let query = n1ql(&db, "SELECT c.name FROM cities AS c");
    assert_eq!(run(&query), vec![json!({"name": "London"})]);

    let query = db
        .create_query(QueryLanguage::Json, r#"{"WHAT": [["._sequence"]], "FROM": [{"COLLECTION": "cities"}]}"#)
        .unwrap();
    let rows = run(&query);
    assert_eq!(rows.len(), 1);
    assert!(rows[0]["_sequence"].is_u64());
}

#[test]
fn distinct_removes_duplicate_rows() {
    let (db, _) = seeded();
    let query = n1ql(&db, "SELECT DISTINCT type FROM _");
    assert_eq!(run(&query), vec![json!({"type": "city"}), json!({"type": "person"})]);
}

#[test]
fn execution_sees_the_snapshot_at_start() {
    let (db, stores) = seeded();
    let query = n1ql(&db, "SELECT meta().id FROM _ WHERE type = 'city'");
    let rs = query.execute().unwrap();
    stores
        .documents
        .put("_default", "c2", json!({"type": "city", "name": "Paris"}))
        .unwrap();
    assert_eq!(rows(rs).len(), 1);
    assert_eq!(run(&query).len(), 2);
}

#[test]
fn compile_errors_carry_offsets() {
    let (db, _) = seeded();
    let err = db
        .create_query(QueryLanguage::N1ql, "SELECT name FROM _ WHERE = 1")
        .unwrap_err();
    assert!(err.is_compile());
    assert_eq!(err.error_offset(), Some(25));

    let err = db
        .create_query(QueryLanguage::Json, r#"{"WHERE": ["NOPE", 1]}"#)
        .unwrap_err();
    assert!(err.is_compile());
}

#[test]
fn explain_names_the_chosen_index() {
    let (db, _) = seeded();
    let query = n1ql(&db, "SELECT name FROM _ WHERE type = 'person'");
    let before = run(&query);
    assert!(query.explain().unwrap().contains("SCAN _default"));

    db.create_index("byType", IndexSpec::value(r#"[[".type"]]"#)).unwrap();
    let plan = query.explain().unwrap();
    assert!(plan.contains("USING INDEX byType"), "{plan}");
    assert_eq!(run(&query), before);
}

#[test]
fn custom_store_handles_work_through_the_trait_object() {
    let stores = InMemoryStores::new();
    let db = Database::new(
        Arc::clone(&stores.documents) as Arc<dyn docql::DocumentStore>,
        stores.indexes.clone(),
        DatabaseConfig::default(),
    );
    stores.documents.put("_default", "x", json!({"v": 1})).unwrap();
    let query = n1ql(&db, "SELECT v FROM _");
    assert_eq!(run(&query), vec![json!({"v": 1})]);
    assert_eq!(db.document_store().snapshot("_default").unwrap().len(), 1);
}
