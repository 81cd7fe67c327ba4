use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meridian_common::config::EngineConfig;
use meridian_common::datum::{DataType, Datum};
use meridian_common::error::Result;
use meridian_common::key::{Key, KeyRange, KeySet};
use meridian_common::types::Timestamp;
use meridian_common::StatusCode;
use meridian_storage::catalog::{ColumnDef, IndexColumn, IndexSchema, KeyPart, TableSchema};

use crate::engine::Engine;
use crate::read_only::TimestampBound;
use crate::read_write::Mutation;
use crate::reads::ReadArg;

fn col(name: &str, data_type: DataType, nullable: bool) -> ColumnDef {
    ColumnDef {
        name: name.into(),
        data_type,
        nullable,
    }
}

fn users_columns() -> Vec<ColumnDef> {
    vec![
        col("ID", DataType::Int64, false),
        col("Name", DataType::Text, true),
        col("Age", DataType::Int64, true),
    ]
}

fn users_table_bare() -> TableSchema {
    TableSchema::new("Users", users_columns(), vec![KeyPart::asc(0)])
}

fn users_table() -> TableSchema {
    users_table_bare()
        .with_index(IndexSchema::new(
            "UsersByName",
            vec![IndexColumn::asc("Name")],
        ))
        .with_index(IndexSchema::new(
            "UsersByNameDescending",
            vec![IndexColumn::desc("Name")],
        ))
        .with_index(
            IndexSchema::new(
                "UsersByNameNullFiltered",
                vec![IndexColumn::asc("Name"), IndexColumn::asc("Age")],
            )
            .null_filtered(),
        )
        .with_index(
            IndexSchema::new(
                "UsersByNameAgeUnique",
                vec![IndexColumn::asc("Name"), IndexColumn::asc("Age")],
            )
            .unique(),
        )
        .with_index(
            IndexSchema::new("UsersByNameUniqueFiltered", vec![IndexColumn::asc("Name")])
                .unique()
                .null_filtered(),
        )
}

fn setup() -> Engine {
    let engine = Engine::new(EngineConfig::default());
    engine.apply_schema(vec![users_table()]).unwrap();
    engine
}

fn apply_one(engine: &Engine, mutation: Mutation) -> Result<Timestamp> {
    let txn = engine.begin_read_write()?;
    if let Err(e) = txn.buffer_write(mutation) {
        txn.rollback().ok();
        return Err(e);
    }
    txn.commit()
}

fn insert(engine: &Engine, columns: &[&str], values: Vec<Datum>) -> Result<Timestamp> {
    apply_one(engine, Mutation::insert("Users", columns, vec![values]))
}

fn update(engine: &Engine, columns: &[&str], values: Vec<Datum>) -> Result<Timestamp> {
    apply_one(engine, Mutation::update("Users", columns, vec![values]))
}

fn delete_ids(engine: &Engine, ids: &[i64]) -> Result<Timestamp> {
    let keys = ids.iter().map(|&id| Key::new(vec![Datum::Int64(id)]));
    apply_one(engine, Mutation::delete("Users", KeySet::points(keys)))
}

fn user(id: i64, name: Option<&str>, age: Option<i64>) -> Vec<Datum> {
    vec![
        Datum::Int64(id),
        name.map(|n| Datum::Text(n.into())).unwrap_or(Datum::Null),
        age.map(Datum::Int64).unwrap_or(Datum::Null),
    ]
}

fn arg(columns: &[&str]) -> ReadArg {
    ReadArg::new(
        "Users",
        columns.iter().map(|c| c.to_string()).collect(),
        KeySet::all(),
    )
}

fn read_all(engine: &Engine, columns: &[&str]) -> Vec<Vec<Datum>> {
    let ro = engine.begin_read_only(TimestampBound::Strong).unwrap();
    ro.read(&arg(columns)).unwrap().collect_rows().unwrap()
}

fn read_all_with_index(engine: &Engine, index: &str, columns: &[&str]) -> Vec<Vec<Datum>> {
    let ro = engine.begin_read_only(TimestampBound::Strong).unwrap();
    ro.read(&arg(columns).with_index(index))
        .unwrap()
        .collect_rows()
        .unwrap()
}

fn name_id(name: Option<&str>, id: i64) -> Vec<Datum> {
    vec![
        name.map(|n| Datum::Text(n.into())).unwrap_or(Datum::Null),
        Datum::Int64(id),
    ]
}

fn name_age_id(name: Option<&str>, age: Option<i64>, id: i64) -> Vec<Datum> {
    vec![
        name.map(|n| Datum::Text(n.into())).unwrap_or(Datum::Null),
        age.map(Datum::Int64).unwrap_or(Datum::Null),
        Datum::Int64(id),
    ]
}

// ── Index ordering ──────────────────────────────────────────────────────

#[test]
fn test_descending_index_returns_rows_in_descending_order() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("John"), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, Some("Peter"), Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(4, Some("Matthew"), Some(33))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(5, None, Some(18))).unwrap();

    assert_eq!(
        read_all_with_index(&engine, "UsersByNameDescending", &["Name", "ID"]),
        vec![
            name_id(Some("Peter"), 2),
            name_id(Some("Matthew"), 4),
            name_id(Some("John"), 1),
            name_id(Some("Adam"), 0),
            name_id(None, 5),
        ]
    );
}

#[test]
fn test_ascending_index_returns_nulls_first() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("John"), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, Some("Peter"), Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(4, Some("Matthew"), Some(33))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(5, None, Some(18))).unwrap();

    assert_eq!(
        read_all_with_index(&engine, "UsersByName", &["Name", "ID"]),
        vec![
            name_id(None, 5),
            name_id(Some("Adam"), 0),
            name_id(Some("John"), 1),
            name_id(Some("Matthew"), 4),
            name_id(Some("Peter"), 2),
        ]
    );
}

// ── Index maintenance ───────────────────────────────────────────────────

#[test]
fn test_index_entries_are_updated() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("John"), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, Some("Peter"), Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(4, Some("Matthew"), Some(33))).unwrap();
    update(&engine, &["ID", "Name", "Age"], user(2, Some("Samantha"), Some(24))).unwrap();
    update(&engine, &["ID", "Name", "Age"], user(4, Some("Alice"), Some(21))).unwrap();

    assert_eq!(
        read_all_with_index(&engine, "UsersByName", &["Name", "ID"]),
        vec![
            name_id(Some("Adam"), 0),
            name_id(Some("Alice"), 4),
            name_id(Some("John"), 1),
            name_id(Some("Samantha"), 2),
        ]
    );
}

#[test]
fn test_index_entries_are_deleted() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("John"), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, Some("Peter"), Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(4, Some("Matthew"), Some(33))).unwrap();

    delete_ids(&engine, &[0, 2]).unwrap();
    assert_eq!(
        read_all_with_index(&engine, "UsersByName", &["Name", "ID"]),
        vec![name_id(Some("John"), 1), name_id(Some("Matthew"), 4)]
    );

    delete_ids(&engine, &[1, 4]).unwrap();
    assert!(read_all_with_index(&engine, "UsersByName", &["Name", "ID"]).is_empty());
}

#[test]
fn test_empty_index_returns_zero_rows() {
    let engine = setup();
    assert!(read_all(&engine, &["ID", "Name", "Age"]).is_empty());
    assert!(read_all_with_index(&engine, "UsersByName", &["Name", "ID"]).is_empty());
}

#[test]
fn test_null_filtered_index_omits_null_entries() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some(""), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, None, Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(3, Some("John"), Some(28))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(4, Some("Matthew"), None)).unwrap();

    // The empty string is a value, not NULL, so it is retained.
    assert_eq!(
        read_all_with_index(&engine, "UsersByNameNullFiltered", &["Name", "Age", "ID"]),
        vec![
            name_age_id(Some(""), Some(22), 1),
            name_age_id(Some("Adam"), Some(20), 0),
            name_age_id(Some("John"), Some(28), 3),
        ]
    );
}

// ── Uniqueness ──────────────────────────────────────────────────────────

#[test]
fn test_unique_index_rejects_duplicates_including_nulls() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some(""), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, None, Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(3, Some("John"), Some(28))).unwrap();

    let err = insert(&engine, &["ID", "Name", "Age"], user(4, Some("Adam"), Some(20))).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
    let err = insert(&engine, &["ID", "Name", "Age"], user(5, Some(""), Some(20))).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
    // NULL equals NULL for uniqueness.
    let err = insert(&engine, &["ID", "Name", "Age"], user(6, None, Some(41))).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);

    insert(&engine, &["ID", "Name", "Age"], user(7, Some("Matthew"), None)).unwrap();

    assert_eq!(
        read_all_with_index(&engine, "UsersByNameAgeUnique", &["Name", "Age", "ID"]),
        vec![
            name_age_id(None, Some(41), 2),
            name_age_id(Some(""), Some(22), 1),
            name_age_id(Some("Adam"), Some(20), 0),
            name_age_id(Some("John"), Some(28), 3),
            name_age_id(Some("Matthew"), None, 7),
        ]
    );
}

#[test]
fn test_unique_null_filtered_index_skips_filtered_duplicates() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some(""), Some(22))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, None, Some(41))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(3, Some("John"), Some(28))).unwrap();

    let err = insert(&engine, &["ID", "Name", "Age"], user(4, Some("Adam"), Some(20))).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
    let err = insert(&engine, &["ID", "Name", "Age"], user(5, Some(""), Some(22))).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
    // A second NULL name is filtered out of the unique index entirely, so it
    // cannot conflict (Age 43 also avoids the non-filtered unique index).
    insert(&engine, &["ID", "Name", "Age"], user(6, None, Some(43))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(7, Some("Matthew"), None)).unwrap();

    assert_eq!(
        read_all_with_index(&engine, "UsersByNameUniqueFiltered", &["Name", "ID"]),
        vec![
            name_id(Some(""), 1),
            name_id(Some("Adam"), 0),
            name_id(Some("John"), 3),
            name_id(Some("Matthew"), 7),
        ]
    );
}

#[test]
fn test_implicit_nulls_collide_across_transactions() {
    let engine = setup();
    // Unspecified Name and Age default to NULL, projecting (NULL, NULL, _)
    // into the unique index.
    insert(&engine, &["ID"], vec![Datum::Int64(0)]).unwrap();
    let err = insert(&engine, &["ID"], vec![Datum::Int64(1)]).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
}

#[test]
fn test_implicit_nulls_collide_within_one_transaction() {
    let engine = setup();
    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::insert_or_update(
        "Users",
        &["ID"],
        vec![vec![Datum::Int64(0)]],
    ))
    .unwrap();
    txn.buffer_write(Mutation::insert("Users", &["ID"], vec![vec![Datum::Int64(1)]]))
        .unwrap();
    let err = txn.commit().unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
}

// ── Write kinds ─────────────────────────────────────────────────────────

#[test]
fn test_insert_existing_key_fails() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    let err = insert(&engine, &["ID", "Name", "Age"], user(1, Some("Bob"), Some(30))).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
}

#[test]
fn test_update_missing_key_fails() {
    let engine = setup();
    let err = update(&engine, &["ID", "Name"], vec![Datum::Int64(9), Datum::Text("X".into())])
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
}

#[test]
fn test_insert_or_update_preserves_unspecified_columns() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    apply_one(
        &engine,
        Mutation::insert_or_update(
            "Users",
            &["ID", "Name"],
            vec![vec![Datum::Int64(1), Datum::Text("Alice".into())]],
        ),
    )
    .unwrap();
    assert_eq!(
        read_all(&engine, &["ID", "Name", "Age"]),
        vec![user(1, Some("Alice"), Some(20))]
    );
}

#[test]
fn test_replace_resets_unspecified_columns_to_null() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    apply_one(
        &engine,
        Mutation::replace(
            "Users",
            &["ID", "Name"],
            vec![vec![Datum::Int64(1), Datum::Text("Alice".into())]],
        ),
    )
    .unwrap();
    assert_eq!(
        read_all(&engine, &["ID", "Name", "Age"]),
        vec![user(1, Some("Alice"), None)]
    );
}

#[test]
fn test_delete_missing_keys_is_not_an_error() {
    let engine = setup();
    delete_ids(&engine, &[42, 43]).unwrap();
}

#[test]
fn test_not_null_constraint_enforced_at_commit() {
    let engine = setup();
    let err = insert(
        &engine,
        &["ID", "Name"],
        vec![Datum::Null, Datum::Text("X".into())],
    )
    .unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[test]
fn test_unknown_table_and_column_are_rejected() {
    let engine = setup();
    let err = apply_one(
        &engine,
        Mutation::insert("Ghosts", &["ID"], vec![vec![Datum::Int64(1)]]),
    )
    .unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);

    let err = insert(&engine, &["ID", "Nickname"], vec![Datum::Int64(1), Datum::Null]).unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);

    let err = insert(&engine, &["ID", "Name"], vec![Datum::Int64(1), Datum::Int64(2)]).unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}

// ── Round trips ─────────────────────────────────────────────────────────

#[test]
fn test_insert_then_read_round_trip() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    assert_eq!(
        read_all(&engine, &["ID", "Name", "Age"]),
        vec![user(1, Some("Adam"), Some(20))]
    );
}

#[test]
fn test_insert_delete_read_is_empty() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    delete_ids(&engine, &[1]).unwrap();
    assert!(read_all(&engine, &["ID", "Name", "Age"]).is_empty());
}

#[test]
fn test_update_is_idempotent() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    update(&engine, &["ID", "Name", "Age"], user(1, Some("Alice"), Some(21))).unwrap();
    update(&engine, &["ID", "Name", "Age"], user(1, Some("Alice"), Some(21))).unwrap();
    assert_eq!(
        read_all(&engine, &["ID", "Name", "Age"]),
        vec![user(1, Some("Alice"), Some(21))]
    );
}

#[test]
fn test_point_and_range_reads() {
    let engine = setup();
    for id in 0..5 {
        let name = format!("u{}", id);
        insert(&engine, &["ID", "Name", "Age"], user(id, Some(&name), Some(id))).unwrap();
    }
    let ro = engine.begin_read_only(TimestampBound::Strong).unwrap();
    let point = ReadArg::new(
        "Users",
        vec!["ID".into()],
        KeySet::point(Key::new(vec![Datum::Int64(3)])),
    );
    assert_eq!(
        ro.read(&point).unwrap().collect_rows().unwrap(),
        vec![vec![Datum::Int64(3)]]
    );
    let range = ReadArg::new(
        "Users",
        vec!["ID".into()],
        KeySet::range(KeyRange::closed_open(
            Key::new(vec![Datum::Int64(1)]),
            Key::new(vec![Datum::Int64(4)]),
        )),
    );
    assert_eq!(
        ro.read(&range).unwrap().collect_rows().unwrap(),
        vec![
            vec![Datum::Int64(1)],
            vec![Datum::Int64(2)],
            vec![Datum::Int64(3)]
        ]
    );
}

// ── Read-write transaction reads ────────────────────────────────────────

#[test]
fn test_read_your_own_writes() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();

    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::insert(
        "Users",
        &["ID", "Name", "Age"],
        vec![user(2, Some("Bob"), Some(30))],
    ))
    .unwrap();
    txn.buffer_write(Mutation::delete(
        "Users",
        KeySet::point(Key::new(vec![Datum::Int64(1)])),
    ))
    .unwrap();

    let rows = txn.read(&arg(&["ID", "Name"])).unwrap().collect_rows().unwrap();
    assert_eq!(rows, vec![vec![Datum::Int64(2), Datum::Text("Bob".into())]]);
    txn.rollback().unwrap();

    // The buffer was never visible outside the transaction.
    assert_eq!(
        read_all(&engine, &["ID", "Name", "Age"]),
        vec![user(1, Some("Adam"), Some(20))]
    );
}

#[test]
fn test_rw_index_read_sees_buffered_writes() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();

    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::update(
        "Users",
        &["ID", "Name"],
        vec![vec![Datum::Int64(1), Datum::Text("Zoe".into())]],
    ))
    .unwrap();
    let rows = txn
        .read(&arg(&["Name", "ID"]).with_index("UsersByName"))
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, vec![name_id(Some("Zoe"), 1)]);
    txn.rollback().unwrap();
}

#[test]
fn test_delete_then_insert_same_key_in_one_transaction() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();

    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::delete(
        "Users",
        KeySet::point(Key::new(vec![Datum::Int64(1)])),
    ))
    .unwrap();
    txn.buffer_write(Mutation::insert(
        "Users",
        &["ID", "Name", "Age"],
        vec![user(1, Some("Reborn"), Some(1))],
    ))
    .unwrap();
    txn.commit().unwrap();

    assert_eq!(
        read_all(&engine, &["ID", "Name", "Age"]),
        vec![user(1, Some("Reborn"), Some(1))]
    );
    assert_eq!(
        read_all_with_index(&engine, "UsersByName", &["Name", "ID"]),
        vec![name_id(Some("Reborn"), 1)]
    );
}

// ── Snapshots and timestamp bounds ──────────────────────────────────────

#[test]
fn test_snapshot_monotonicity() {
    let engine = setup();
    let t1 = insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    let t2 = insert(&engine, &["ID", "Name", "Age"], user(2, Some("Bob"), Some(30))).unwrap();

    let ro1 = engine
        .begin_read_only(TimestampBound::ExactTimestamp(t1))
        .unwrap();
    let rows1 = ro1.read(&arg(&["ID"])).unwrap().collect_rows().unwrap();
    assert_eq!(rows1, vec![vec![Datum::Int64(1)]]);

    let ro2 = engine
        .begin_read_only(TimestampBound::ExactTimestamp(t2))
        .unwrap();
    let rows2 = ro2.read(&arg(&["ID"])).unwrap().collect_rows().unwrap();
    assert_eq!(rows2, vec![vec![Datum::Int64(1)], vec![Datum::Int64(2)]]);

    // The earlier snapshot still reads the earlier state.
    let rows1_again = ro1.read(&arg(&["ID"])).unwrap().collect_rows().unwrap();
    assert_eq!(rows1_again, rows1);
}

#[test]
fn test_read_before_first_write_sees_nothing() {
    let engine = setup();
    let t1 = insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();
    let ro = engine
        .begin_read_only(TimestampBound::ExactTimestamp(t1.prev()))
        .unwrap();
    assert!(ro.read(&arg(&["ID"])).unwrap().collect_rows().unwrap().is_empty());
}

#[test]
fn test_bounded_staleness_floor_is_last_commit() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();

    // Even with a huge staleness allowance, the floor is raised to the last
    // commit, so everything committed is visible.
    let ro = engine
        .begin_read_only(TimestampBound::MaxStaleness(Duration::from_secs(3600)))
        .unwrap();
    assert_eq!(
        ro.read(&arg(&["ID"])).unwrap().collect_rows().unwrap(),
        vec![vec![Datum::Int64(1)]]
    );

    let ro = engine
        .begin_read_only(TimestampBound::MinTimestamp(Timestamp(0)))
        .unwrap();
    assert_eq!(
        ro.read(&arg(&["ID"])).unwrap().collect_rows().unwrap(),
        vec![vec![Datum::Int64(1)]]
    );
}

#[test]
fn test_read_timestamp_before_schema_fails() {
    let engine = setup();
    let err = engine
        .begin_read_only(TimestampBound::ExactTimestamp(Timestamp(1)))
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[test]
fn test_gc_horizon_rejects_stale_reads() {
    let config = EngineConfig {
        version_gc_horizon_secs: 0,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);
    engine.apply_schema(vec![users_table()]).unwrap();
    let ro = engine.begin_read_only(TimestampBound::Strong).unwrap();
    let err = ro.read(&arg(&["ID"])).unwrap_err();
    assert_eq!(err.code(), StatusCode::OutOfRange);
}

#[test]
fn test_gc_sweep_reclaims_old_versions() {
    let config = EngineConfig {
        version_gc_horizon_secs: 0,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);
    engine.apply_schema(vec![users_table_bare()]).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("a"), None)).unwrap();
    update(&engine, &["ID", "Name"], vec![Datum::Int64(1), Datum::Text("b".into())]).unwrap();
    update(&engine, &["ID", "Name"], vec![Datum::Int64(1), Datum::Text("c".into())]).unwrap();

    let result = engine.gc_sweep();
    assert_eq!(result.reclaimed_versions, 2);
    assert_eq!(engine.gc_stats().total_sweeps, 1);
}

// ── Transaction lifecycle ───────────────────────────────────────────────

#[test]
fn test_rollback_discards_buffer_and_is_idempotent() {
    let engine = setup();
    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::insert(
        "Users",
        &["ID", "Name", "Age"],
        vec![user(1, Some("Adam"), Some(20))],
    ))
    .unwrap();
    txn.rollback().unwrap();
    txn.rollback().unwrap();
    assert!(read_all(&engine, &["ID"]).is_empty());

    let err = txn.commit().unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[test]
fn test_commit_is_idempotent() {
    let engine = setup();
    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::insert(
        "Users",
        &["ID", "Name", "Age"],
        vec![user(1, Some("Adam"), Some(20))],
    ))
    .unwrap();
    let ts = txn.commit().unwrap();
    assert_eq!(txn.commit().unwrap(), ts);
}

#[test]
fn test_cancelled_transaction_rejects_operations() {
    let engine = setup();
    let txn = engine.begin_read_write().unwrap();
    txn.cancel();
    let err = txn.read(&arg(&["ID"])).unwrap_err();
    assert_eq!(err.code(), StatusCode::Cancelled);
    let err = txn.commit().unwrap_err();
    assert_eq!(err.code(), StatusCode::Cancelled);
}

#[test]
fn test_cancelled_cursor_fails_mid_iteration() {
    let engine = setup();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("a"), None)).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(2, Some("b"), None)).unwrap();

    let ro = engine.begin_read_only(TimestampBound::Strong).unwrap();
    let mut cursor = ro.read(&arg(&["ID"])).unwrap();
    assert!(cursor.next().unwrap().is_ok());
    ro.cancel();
    let err = cursor.next().unwrap().unwrap_err();
    assert_eq!(err.code(), StatusCode::Cancelled);
}

#[test]
fn test_engine_shutdown_rejects_new_transactions() {
    let engine = setup();
    engine.shutdown();
    let err = engine.begin_read_write().unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
    let err = engine.begin_read_only(TimestampBound::Strong).unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[test]
fn test_stats_counters() {
    let engine = setup();
    insert(&engine, &["ID"], vec![Datum::Int64(0)]).unwrap();
    let _ = insert(&engine, &["ID"], vec![Datum::Int64(1)]); // unique violation
    let stats = engine.stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.constraint_violations, 1);
}

// ── Schema changes ──────────────────────────────────────────────────────

#[test]
fn test_new_index_is_backfilled_from_existing_rows() {
    let engine = Engine::new(EngineConfig::default());
    engine.apply_schema(vec![users_table_bare()]).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("John"), Some(22))).unwrap();

    engine
        .apply_schema(vec![users_table_bare().with_index(IndexSchema::new(
            "UsersByName",
            vec![IndexColumn::asc("Name")],
        ))])
        .unwrap();

    assert_eq!(
        read_all_with_index(&engine, "UsersByName", &["Name", "ID"]),
        vec![name_id(Some("Adam"), 0), name_id(Some("John"), 1)]
    );
}

#[test]
fn test_backfill_unique_violation_fails_schema_change() {
    let engine = Engine::new(EngineConfig::default());
    engine.apply_schema(vec![users_table_bare()]).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), Some(20))).unwrap();
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("Adam"), Some(20))).unwrap();

    let err = engine
        .apply_schema(vec![users_table_bare().with_index(
            IndexSchema::new(
                "UsersByNameAge",
                vec![IndexColumn::asc("Name"), IndexColumn::asc("Age")],
            )
            .unique(),
        )])
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);

    // The failed version is not installed.
    let ro = engine.begin_read_only(TimestampBound::Strong).unwrap();
    let err = ro
        .read(&arg(&["Name", "ID"]).with_index("UsersByNameAge"))
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
}

#[test]
fn test_schema_resolved_at_read_timestamp() {
    let engine = Engine::new(EngineConfig::default());
    engine.apply_schema(vec![users_table_bare()]).unwrap();
    let before = insert(&engine, &["ID", "Name", "Age"], user(0, Some("Adam"), None)).unwrap();
    engine
        .apply_schema(vec![users_table_bare().with_index(IndexSchema::new(
            "UsersByName",
            vec![IndexColumn::asc("Name")],
        ))])
        .unwrap();

    // A snapshot before the schema change cannot see the index.
    let ro = engine
        .begin_read_only(TimestampBound::ExactTimestamp(before))
        .unwrap();
    let err = ro
        .read(&arg(&["Name", "ID"]).with_index("UsersByName"))
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
}

#[test]
fn test_schema_change_aborts_concurrent_transaction() {
    let engine = Engine::new(EngineConfig::default());
    engine.apply_schema(vec![users_table_bare()]).unwrap();

    let txn = engine.begin_read_write().unwrap();
    txn.buffer_write(Mutation::insert(
        "Users",
        &["ID", "Name", "Age"],
        vec![user(0, Some("Adam"), None)],
    ))
    .unwrap();

    engine
        .apply_schema(vec![users_table_bare().with_index(IndexSchema::new(
            "UsersByName",
            vec![IndexColumn::asc("Name")],
        ))])
        .unwrap();

    let err = txn.commit().unwrap_err();
    assert_eq!(err.code(), StatusCode::Aborted);
    assert!(err.is_retryable());
}

// ── Concurrency ─────────────────────────────────────────────────────────

#[test]
fn test_concurrent_inserts_all_commit_with_distinct_timestamps() {
    let engine = Arc::new(setup());
    let mut workers = Vec::new();
    for id in 0..8i64 {
        let engine = Arc::clone(&engine);
        workers.push(thread::spawn(move || {
            let name = format!("user{}", id);
            let txn = engine.begin_read_write().unwrap();
            txn.buffer_write(Mutation::insert(
                "Users",
                &["ID", "Name", "Age"],
                vec![user(id, Some(&name), Some(id))],
            ))
            .unwrap();
            txn.commit()
        }));
    }
    let mut stamps: Vec<Timestamp> = workers
        .into_iter()
        .map(|w| w.join().unwrap().unwrap())
        .collect();
    stamps.sort();
    stamps.dedup();
    assert_eq!(stamps.len(), 8);
    assert_eq!(read_all(&engine, &["ID"]).len(), 8);
}

#[test]
fn test_conflicting_writers_never_deadlock() {
    let engine = Arc::new(setup());
    insert(&engine, &["ID", "Name", "Age"], user(1, Some("init"), Some(0))).unwrap();

    let mut workers = Vec::new();
    for n in 0..4i64 {
        let engine = Arc::clone(&engine);
        workers.push(thread::spawn(move || {
            let txn = engine.begin_read_write()?;
            // Read-modify-write on the same row from every thread: the read
            // takes a shared lock that commit must upgrade.
            let rows = txn.read(&arg(&["Age"]))?.collect_rows()?;
            assert!(!rows.is_empty());
            txn.buffer_write(Mutation::update(
                "Users",
                &["ID", "Age"],
                vec![vec![Datum::Int64(1), Datum::Int64(100 + n)]],
            ))?;
            txn.commit()
        }));
    }
    let results: Vec<Result<Timestamp>> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();
    // Wound-wait guarantees progress: at least one writer commits, and
    // every failure is a retryable abort.
    assert!(results.iter().any(|r| r.is_ok()));
    for r in &results {
        if let Err(e) = r {
            assert_eq!(e.code(), StatusCode::Aborted);
        }
    }
    assert_eq!(read_all(&engine, &["ID"]).len(), 1);
}

#[test]
fn test_projected_entries_match_live_rows() {
    let engine = setup();
    for id in 0..20i64 {
        let name = if id % 5 == 0 {
            None
        } else {
            Some(format!("user{:02}", id))
        };
        insert(
            &engine,
            &["ID", "Name", "Age"],
            user(id, name.as_deref(), Some(id)),
        )
        .unwrap();
    }
    delete_ids(&engine, &[3, 7, 11]).unwrap();

    // The index holds exactly the projection of the live base rows, in
    // index-key order.
    let base = read_all(&engine, &["Name", "ID"]);
    assert_eq!(base.len(), 17);
    let mut expected = base;
    expected.sort_by(|a, b| Key::new(a.clone()).cmp(&Key::new(b.clone())));
    assert_eq!(
        read_all_with_index(&engine, "UsersByName", &["Name", "ID"]),
        expected
    );
}
