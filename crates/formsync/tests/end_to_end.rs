//! End-to-end scenarios through the public engine API.
//!
//! Each test materializes a form, pushes field list edits through
//! `sync_fields` or `update_form_table_columns`, drains the queue and checks
//! the resulting table, history and backups.

mod common;

use chrono::{Duration, Utc};
use common::{add, columns, delete, memory_engine, rename, seed_row};
use formsync::prelude::*;

// =============================================================================
// Field list edits
// =============================================================================

fn survey_form() -> FormSchema {
    FormSchema::new("form-survey", "Survey")
        .field(FieldInput::new("Name", FieldType::ShortAnswer).with_id("f-name"))
        .field(FieldInput::new("Score", FieldType::Number).with_id("f-score"))
}

#[tokio::test]
async fn test_field_list_edit_reaches_table() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    let table = engine.tables().create_form_table(&survey_form()).await.unwrap();
    assert_eq!(table.table_name, "survey");
    assert_eq!(
        columns(&pool, "survey").await,
        vec!["id", "name", "score", "created_at", "updated_at"]
    );

    seed_row(&pool, "form-survey", "survey", "s1", &[("name", "Ann"), ("score", "42")]).await;
    seed_row(&pool, "form-survey", "survey", "s2", &[("name", "Bob"), ("score", "7")]).await;

    // Score removed, Name renamed, Visit added.
    let new = vec![
        FieldInput::from(&table.fields[0]).with_column("full_name"),
        FieldInput::new("Visit", FieldType::Date),
    ];
    let target = TableTarget::Form("form-survey".into());
    let jobs = engine
        .tables()
        .sync_fields(&target, &table.fields, &new)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 3);
    assert_eq!(engine.queue().run_until_idle().await.unwrap(), 3);

    assert_eq!(
        columns(&pool, "survey").await,
        vec!["id", "full_name", "created_at", "updated_at", "visit"]
    );
    let names: Vec<(String,)> = sqlx::query_as("SELECT full_name FROM survey ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(names, vec![("Ann".to_string(),), ("Bob".to_string(),)]);

    let history = engine.history().for_form("form-survey").await.unwrap();
    let kinds: Vec<MigrationType> = history.iter().map(|m| m.migration_type).collect();
    assert_eq!(
        kinds,
        vec![
            MigrationType::RenameField,
            MigrationType::DeleteField,
            MigrationType::AddField
        ]
    );
    assert!(history.iter().all(|m| m.status == MigrationStatus::Success));
    assert_eq!(history[2].column_name.as_deref(), Some("visit"));

    let backups = engine
        .backups()
        .active_for_form("form-survey", Utc::now())
        .await
        .unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].column_name, "score");
    assert_eq!(backups[0].row_count, 2);
    assert_eq!(Some(backups[0].id), history[1].backup_id);

    let counts = engine.queue().status("form-survey").await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.waiting + counts.active + counts.failed, 0);
}

#[tokio::test]
async fn test_rolled_back_delete_brings_values_back() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    let table = engine.tables().create_form_table(&survey_form()).await.unwrap();
    seed_row(&pool, "form-survey", "survey", "s1", &[("name", "Ann"), ("score", "42")]).await;
    seed_row(&pool, "form-survey", "survey", "s2", &[("name", "Bob")]).await;

    let target = TableTarget::Form("form-survey".into());
    let keep = vec![FieldInput::from(&table.fields[0])];
    engine
        .tables()
        .sync_fields(&target, &table.fields, &keep)
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();
    assert!(!columns(&pool, "survey").await.contains(&"score".to_string()));

    let deleted = engine.history().for_form("form-survey").await.unwrap()[0].clone();
    let job_id = engine.queue().rollback_job(deleted.id).await.unwrap();
    engine.queue().run_until_idle().await.unwrap();
    assert_eq!(
        engine.queue().job(job_id).await.unwrap().status,
        JobStatus::Completed
    );

    let scores: Vec<(Option<i64>,)> = sqlx::query_as("SELECT score FROM survey ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(scores, vec![(Some(42),), (None,)]);
    let record = engine.history().get(deleted.id).await.unwrap();
    assert_eq!(record.status, MigrationStatus::RolledBack);
    assert!(record.rolled_back_at.is_some());
}

// =============================================================================
// Type changes
// =============================================================================

#[tokio::test]
async fn test_failed_cast_leaves_table_untouched() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    let form = FormSchema::new("form-stock", "Inventory")
        .field(FieldInput::new("Code", FieldType::ShortAnswer).with_id("f-code"))
        .field(FieldInput::new("Qty", FieldType::ShortAnswer).with_id("f-qty"));
    let table = engine.tables().create_form_table(&form).await.unwrap();
    seed_row(&pool, "form-stock", "inventory", "s1", &[("code", "A1"), ("qty", "5")]).await;
    seed_row(&pool, "form-stock", "inventory", "s2", &[("code", "B2"), ("qty", "lots")]).await;

    let target = TableTarget::Form("form-stock".into());
    let retyped = vec![
        FieldInput::from(&table.fields[0]),
        FieldInput {
            field_type: FieldType::Number,
            ..FieldInput::from(&table.fields[1])
        },
    ];
    let jobs = engine
        .tables()
        .sync_fields(&target, &table.fields, &retyped)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    // A later change on the same table is not blocked by the failure.
    let later = engine
        .tables()
        .update_form_table_columns(&target, vec![add("f-note", "note", FieldType::Paragraph)])
        .await
        .unwrap();
    assert_eq!(engine.queue().run_until_idle().await.unwrap(), 2);

    let failed = engine.queue().job(jobs[0]).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.is_some());
    assert_eq!(
        engine.queue().job(later[0]).await.unwrap().status,
        JobStatus::Completed
    );

    let record = engine
        .history()
        .get(failed.migration_id.unwrap())
        .await
        .unwrap();
    assert_eq!(record.status, MigrationStatus::Failed);
    assert!(record.error.is_some());

    assert_eq!(
        columns(&pool, "inventory").await,
        vec!["id", "code", "qty", "created_at", "updated_at", "note"]
    );
    let qty: Vec<(String, String)> =
        sqlx::query_as("SELECT qty, typeof(qty) FROM inventory ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(
        qty,
        vec![
            ("5".to_string(), "text".to_string()),
            ("lots".to_string(), "text".to_string())
        ]
    );
    assert!(engine
        .backups()
        .active_for_form("form-stock", Utc::now())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_successful_cast_converts_values() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    let form = FormSchema::new("form-stock", "Inventory")
        .field(FieldInput::new("Qty", FieldType::ShortAnswer).with_id("f-qty"));
    let table = engine.tables().create_form_table(&form).await.unwrap();
    seed_row(&pool, "form-stock", "inventory", "s1", &[("qty", "5")]).await;
    seed_row(&pool, "form-stock", "inventory", "s2", &[("qty", "")]).await;

    let target = TableTarget::Form("form-stock".into());
    let retyped = vec![FieldInput {
        field_type: FieldType::Number,
        ..FieldInput::from(&table.fields[0])
    }];
    engine
        .tables()
        .sync_fields(&target, &table.fields, &retyped)
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();

    assert_eq!(
        columns(&pool, "inventory").await,
        vec!["id", "created_at", "updated_at", "qty"]
    );
    let qty: Vec<(Option<i64>,)> = sqlx::query_as("SELECT qty FROM inventory ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(qty, vec![(Some(5),), (None,)]);

    let history = engine.history().for_form("form-stock").await.unwrap();
    assert_eq!(history[0].migration_type, MigrationType::ChangeType);
    assert_eq!(history[0].status, MigrationStatus::Success);
    assert_eq!(history[0].old_data_type, Some(FieldType::ShortAnswer));
    assert_eq!(history[0].new_data_type, Some(FieldType::Number));
    assert!(history[0].backup_id.is_some());
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_add_then_delete_rolls_back_to_original_columns() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    let form = FormSchema::new("form-visits", "Visits")
        .field(FieldInput::new("Name", FieldType::ShortAnswer).with_id("f-name"));
    engine.tables().create_form_table(&form).await.unwrap();
    seed_row(&pool, "form-visits", "visits", "s1", &[("name", "Ann")]).await;
    let before = columns(&pool, "visits").await;

    let target = TableTarget::Form("form-visits".into());
    engine
        .tables()
        .update_form_table_columns(&target, vec![add("f-day", "day", FieldType::ShortAnswer)])
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();
    sqlx::query("UPDATE visits SET day = 'monday'")
        .execute(&pool)
        .await
        .unwrap();
    engine
        .tables()
        .update_form_table_columns(&target, vec![delete("f-day", "day", FieldType::ShortAnswer)])
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();

    let history = engine.history().for_form("form-visits").await.unwrap();
    let (added, deleted) = (&history[0], &history[1]);
    assert_eq!(added.migration_type, MigrationType::AddField);
    assert_eq!(deleted.migration_type, MigrationType::DeleteField);

    // Most recent first.
    engine.queue().rollback_job(deleted.id).await.unwrap();
    engine.queue().rollback_job(added.id).await.unwrap();
    assert_eq!(engine.queue().run_until_idle().await.unwrap(), 2);

    assert_eq!(columns(&pool, "visits").await, before);
    let added = engine.history().get(added.id).await.unwrap();
    assert_eq!(added.status, MigrationStatus::RolledBack);
    // Dropping the added column kept its data.
    let rollback_backup = engine
        .backups()
        .get(added.rollback_backup_id.unwrap())
        .await
        .unwrap();
    assert_eq!(rollback_backup.column_name, "day");
    assert_eq!(rollback_backup.row_count, 1);
}

#[tokio::test]
async fn test_only_successful_migrations_roll_back() {
    let engine = memory_engine().await;
    let form = FormSchema::new("form-visits", "Visits")
        .field(FieldInput::new("Name", FieldType::ShortAnswer).with_id("f-name"));
    engine.tables().create_form_table(&form).await.unwrap();

    let target = TableTarget::Form("form-visits".into());
    engine
        .tables()
        .update_form_table_columns(
            &target,
            vec![
                rename("f-gone", "missing", "still_missing"),
                rename("f-name", "name", "full_name"),
            ],
        )
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();
    let history = engine.history().for_form("form-visits").await.unwrap();
    assert_eq!(history[0].status, MigrationStatus::Failed);
    assert_eq!(history[1].status, MigrationStatus::Success);

    let refused = engine.queue().rollback_job(history[0].id).await.unwrap();
    let first = engine.queue().rollback_job(history[1].id).await.unwrap();
    let replayed = engine.queue().rollback_job(history[1].id).await.unwrap();
    engine.queue().run_until_idle().await.unwrap();

    assert_eq!(
        engine.queue().job(refused).await.unwrap().status,
        JobStatus::Failed
    );
    assert_eq!(
        engine.queue().job(first).await.unwrap().status,
        JobStatus::Completed
    );
    // A second rollback of the same migration is a no-op.
    assert_eq!(
        engine.queue().job(replayed).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        columns(engine.pool(), "visits").await,
        vec!["id", "name", "created_at", "updated_at"]
    );
}

// =============================================================================
// Sub-forms
// =============================================================================

#[tokio::test]
async fn test_sub_form_changes_target_sub_form_table() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    engine.tables().create_form_table(&survey_form()).await.unwrap();

    let sub_form = SubFormSchema {
        id: "sf-items".into(),
        form_id: "form-survey".into(),
        title: "Items".into(),
        table_name: None,
        fields: vec![FieldInput::new("Label", FieldType::ShortAnswer).with_id("f-label")],
    };
    let table = engine
        .tables()
        .create_sub_form_table("form-survey", &sub_form)
        .await
        .unwrap();
    assert_eq!(table.table_name, "survey_items");

    let target = TableTarget::SubForm {
        form_id: "form-survey".into(),
        sub_form_id: "sf-items".into(),
    };
    let new = vec![
        FieldInput::from(&table.fields[0]),
        FieldInput::new("Price", FieldType::Number),
    ];
    engine
        .tables()
        .sync_fields(&target, &table.fields, &new)
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();

    assert_eq!(
        columns(&pool, "survey_items").await,
        vec!["id", "parent_id", "label", "created_at", "updated_at", "price"]
    );
    assert_eq!(
        columns(&pool, "survey").await,
        vec!["id", "name", "score", "created_at", "updated_at"]
    );
    let subs = engine.tables().list_sub_forms("form-survey").await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].table_name.as_deref(), Some("survey_items"));
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn test_sweep_honors_hold_and_restore() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    engine.tables().create_form_table(&survey_form()).await.unwrap();
    seed_row(&pool, "form-survey", "survey", "s1", &[("name", "Ann"), ("score", "1")]).await;

    let target = TableTarget::Form("form-survey".into());
    engine
        .tables()
        .update_form_table_columns(
            &target,
            vec![
                delete("f-name", "name", FieldType::ShortAnswer),
                delete("f-score", "score", FieldType::Number),
            ],
        )
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();

    let backups = engine
        .backups()
        .active_for_form("form-survey", Utc::now())
        .await
        .unwrap();
    assert_eq!(backups.len(), 2);
    let (held, restoring) = (backups[0].id, backups[1].id);

    // Nothing has expired yet.
    assert_eq!(engine.sweep_backups().await.unwrap(), 0);

    engine.backups().set_legal_hold(held, true).await.unwrap();
    sqlx::query("UPDATE data_backups SET restoring = 1 WHERE id = ?")
        .bind(restoring)
        .execute(&pool)
        .await
        .unwrap();
    let later = Utc::now() + Duration::days(91);
    assert_eq!(engine.backups().sweep_expired(later).await.unwrap(), 0);

    sqlx::query("UPDATE data_backups SET restoring = 0 WHERE id = ?")
        .bind(restoring)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(engine.backups().sweep_expired(later).await.unwrap(), 1);
    assert!(engine.backups().get(held).await.unwrap().legal_hold);
    assert!(engine.backups().get(restoring).await.is_err());

    engine.backups().set_legal_hold(held, false).await.unwrap();
    assert_eq!(engine.backups().sweep_expired(later).await.unwrap(), 1);
}

#[tokio::test]
async fn test_restore_job_recreates_dropped_column() {
    let engine = memory_engine().await;
    let pool = engine.pool().clone();
    engine.tables().create_form_table(&survey_form()).await.unwrap();
    seed_row(&pool, "form-survey", "survey", "s1", &[("name", "Ann"), ("score", "3")]).await;

    let target = TableTarget::Form("form-survey".into());
    engine
        .tables()
        .update_form_table_columns(&target, vec![delete("f-name", "name", FieldType::ShortAnswer)])
        .await
        .unwrap();
    engine.queue().run_until_idle().await.unwrap();
    let backup_id = engine.history().for_form("form-survey").await.unwrap()[0]
        .backup_id
        .unwrap();

    let job_id = engine.queue().restore_job(backup_id).await.unwrap();
    engine.queue().run_until_idle().await.unwrap();
    assert_eq!(
        engine.queue().job(job_id).await.unwrap().status,
        JobStatus::Completed
    );

    let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM survey")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(names, vec![("Ann".to_string(),)]);
    let backup = engine.backups().get(backup_id).await.unwrap();
    assert!(backup.restored_at.is_some());
    assert!(!backup.restoring);
}
