#![allow(dead_code)]

use std::path::Path;

use formsync::prelude::*;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Engine on a single-connection in-memory database.
pub async fn memory_engine() -> Engine {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    Engine::with_namer(pool, Config::default(), IdentifierNamer::default())
        .await
        .unwrap()
}

/// Engine on a database file, opened the way the CLI opens it.
pub async fn file_engine(path: &Path, mut config: Config) -> Engine {
    config.database.url = format!("sqlite://{}", path.display());
    Engine::open(config).await.unwrap()
}

pub async fn columns(pool: &SqlitePool, table: &str) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(pool)
        .await
        .unwrap()
}

/// Inserts a submission and its mirrored row.
pub async fn seed_row(pool: &SqlitePool, form_id: &str, table: &str, id: &str, values: &[(&str, &str)]) {
    sqlx::query("INSERT INTO submissions (id, form_id) VALUES (?, ?)")
        .bind(id)
        .bind(form_id)
        .execute(pool)
        .await
        .unwrap();

    let names: Vec<&str> = std::iter::once("id")
        .chain(values.iter().map(|(column, _)| *column))
        .collect();
    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        names.join(", ")
    );
    let mut query = sqlx::query(&sql).bind(id);
    for (_, value) in values {
        query = query.bind(*value);
    }
    query.execute(pool).await.unwrap();
}

pub fn add(field_id: &str, column: &str, field_type: FieldType) -> Change {
    Change::AddField {
        field_id: Some(field_id.to_string()),
        title: column.to_string(),
        column_name: Some(column.to_string()),
        field_type,
    }
}

pub fn delete(field_id: &str, column: &str, field_type: FieldType) -> Change {
    Change::DeleteField {
        field_id: field_id.to_string(),
        column_name: column.to_string(),
        field_type,
    }
}

pub fn rename(field_id: &str, from: &str, to: &str) -> Change {
    Change::RenameField {
        field_id: field_id.to_string(),
        old_column: from.to_string(),
        new_column: to.to_string(),
    }
}
