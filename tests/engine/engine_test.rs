use serde_json::json;
use sqlbridge::engine::{serve, Engine, EngineError, SqliteEngine, Worker};
use sqlbridge::worker::protocol::{Command, FlatRow, Params, Response};

fn open_engine() -> SqliteEngine {
    let mut engine = SqliteEngine::new().unwrap();
    engine.open(None).unwrap();
    engine
        .execute(
            "CREATE TABLE Stores(Id INTEGER PRIMARY KEY, Company TEXT NOT NULL);
             CREATE TABLE Products(
                 Id INTEGER PRIMARY KEY,
                 Name TEXT NOT NULL,
                 StoreId INTEGER NOT NULL REFERENCES Stores(Id)
             );",
            None,
        )
        .unwrap();
    engine
}

#[test]
fn test_each_streams_in_order() {
    let mut engine = open_engine();
    engine
        .execute(
            "INSERT INTO Stores(Id, Company) VALUES (1, 'X'), (2, 'Y')",
            None,
        )
        .unwrap();

    let mut rows: Vec<FlatRow> = Vec::new();
    engine
        .each("SELECT Id, Company FROM Stores ORDER BY Id", None, &mut |row| {
            rows.push(row)
        })
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["Company"], json!("X"));
    let columns: Vec<&String> = rows[1].keys().collect();
    assert_eq!(columns, vec!["Id", "Company"]);
}

#[test]
fn test_multiple_statements_multiple_tables() {
    let mut engine = open_engine();
    let results = engine
        .execute(
            "INSERT INTO Stores(Id, Company) VALUES (1, 'X');
             SELECT Company FROM Stores;
             SELECT COUNT(*) AS Count FROM Products;",
            None,
        )
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].columns, vec!["Company"]);
    assert_eq!(results[1].values, vec![vec![json!(0)]]);
}

#[test]
fn test_constraint_violation_message() {
    let mut engine = open_engine();
    engine
        .execute("INSERT INTO Stores(Id, Company) VALUES (1, 'X')", None)
        .unwrap();

    let err = engine
        .execute("INSERT INTO Stores(Id, Company) VALUES (1, 'Y')", None)
        .unwrap_err();
    assert!(err.to_string().contains("UNIQUE constraint failed"));
}

#[test]
fn test_foreign_keys_follow_pragma() {
    let mut engine = open_engine();

    // Off by default.
    engine
        .execute("INSERT INTO Products(Name, StoreId) VALUES ('Chair', 42)", None)
        .unwrap();

    let err = engine
        .execute(
            "PRAGMA foreign_keys = ON; INSERT INTO Products(Name, StoreId) VALUES ('Desk', 43)",
            None,
        )
        .unwrap_err();
    assert!(err.to_string().contains("FOREIGN KEY constraint failed"));
}

#[test]
fn test_export_and_reimport() {
    let mut engine = open_engine();
    engine
        .execute(
            "INSERT INTO Stores(Id, Company) VALUES ($id, $company)",
            Some(&Params::named([("id", json!(7)), ("company", json!("Acme"))])),
        )
        .unwrap();

    let image = engine.export().unwrap();
    assert!(image.starts_with(b"SQLite format 3\0"));
    engine.close().unwrap();

    let mut restored = SqliteEngine::new().unwrap();
    restored.open(Some(&image)).unwrap();
    let results = restored
        .execute("SELECT Company FROM Stores WHERE Id = 7", None)
        .unwrap();
    assert_eq!(results[0].values, vec![vec![json!("Acme")]]);
}

#[test]
fn test_reopen_replaces_database() {
    let mut engine = open_engine();
    engine.open(None).unwrap();

    let results = engine
        .execute("SELECT name FROM sqlite_master WHERE type = 'table'", None)
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_corrupt_image_rejected() {
    let mut engine = SqliteEngine::new().unwrap();
    let err = engine.open(Some(&[0x42; 4096])).unwrap_err();
    assert!(matches!(err, EngineError::Sqlite(_)));

    // Still not open afterwards.
    assert!(matches!(
        engine.execute("SELECT 1", None),
        Err(EngineError::NotOpen)
    ));
}

#[test]
fn test_blob_and_real_values() {
    let mut engine = SqliteEngine::new().unwrap();
    engine.open(None).unwrap();

    let results = engine
        .execute("SELECT x'0102' AS Bytes, 1.5 AS Real, NULL AS Nothing", None)
        .unwrap();
    assert_eq!(results[0].values[0], vec![json!([1, 2]), json!(1.5), json!(null)]);
}

#[test]
fn test_worker_over_real_engine() {
    let mut worker = Worker::new(SqliteEngine::new().unwrap());
    let mut out = Vec::new();

    worker.handle(Command::open(None), &mut |r| out.push(r));
    let each = Command::each("SELECT 1 AS One UNION ALL SELECT 2", None);
    let id = each.id.clone();
    worker.handle(each, &mut |r| out.push(r));

    assert!(out[0].ready == Some(true));
    assert_eq!(out.len(), 4);
    assert_eq!(out[3], Response::done(id));
}

#[test]
fn test_serve_real_engine_over_ndjson() {
    let input = concat!(
        r#"{"id":"o","action":"open"}"#,
        "\n",
        r#"{"id":"e","action":"exec","sql":"SELECT $n AS N","params":{"n":5}}"#,
        "\n",
        r#"{"id":"x","action":"export"}"#,
        "\n",
        r#"{"id":"c","action":"close"}"#,
        "\n",
    );

    let mut output = Vec::new();
    serve(SqliteEngine::new().unwrap(), input.as_bytes(), &mut output).unwrap();

    let responses: Vec<Response> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0], Response::ready("o"));
    assert_eq!(responses[1].results.as_ref().unwrap()[0].values[0][0], json!(5));
    assert!(responses[2].buffer.as_ref().unwrap().starts_with(b"SQLite format 3\0"));
    assert_eq!(responses[3], Response::ack("c"));
}
