//! Queue behaviour against a database file shared by several connections.

mod common;

use std::time::Duration;

use common::{add, columns, delete, file_engine, rename};
use formsync::config::QueueConfig;
use formsync::prelude::*;
use tokio_util::sync::CancellationToken;

fn fast_queue(workers: usize) -> Config {
    Config {
        queue: QueueConfig {
            worker_concurrency: workers,
            max_attempts: 20,
            backoff_base_ms: 5,
            backoff_max_ms: 50,
            poll_interval_ms: 20,
        },
        ..Config::default()
    }
}

fn single_field(id: &str, title: &str) -> FormSchema {
    FormSchema::new(id, title)
        .field(FieldInput::new("Name", FieldType::ShortAnswer).with_id("f-name"))
}

fn plan() -> Vec<Change> {
    vec![
        add("f-x1", "x1", FieldType::ShortAnswer),
        add("f-x2", "x2", FieldType::Number),
        add("f-x3", "x3", FieldType::Paragraph),
        rename("f-x1", "x1", "y1"),
        delete("f-x2", "x2", FieldType::Number),
    ]
}

async fn wait_for_idle(engine: &Engine, forms: &[&str]) {
    let idle = async {
        loop {
            let counts =
                futures::future::join_all(forms.iter().map(|form| engine.queue().status(form)))
                    .await;
            let busy: u64 = counts
                .into_iter()
                .map(|c| {
                    let c = c.unwrap();
                    c.waiting + c.active
                })
                .sum();
            if busy == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), idle)
        .await
        .expect("queue did not drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_serialize_each_table() {
    let dir = tempfile::tempdir().unwrap();
    let engine = file_engine(&dir.path().join("formsync.sqlite3"), fast_queue(3)).await;
    let forms = [("form-alpha", "Alpha"), ("form-beta", "Beta")];
    for (id, title) in forms {
        let table = engine
            .tables()
            .create_form_table(&single_field(id, title))
            .await
            .unwrap();
        assert!(table.created);
    }

    let shutdown = CancellationToken::new();
    let workers = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    for (id, _) in forms {
        let target = TableTarget::Form(id.to_string());
        let jobs = engine
            .tables()
            .update_form_table_columns(&target, plan())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 5);
    }
    wait_for_idle(&engine, &["form-alpha", "form-beta"]).await;
    shutdown.cancel();
    workers.await.unwrap().unwrap();

    for (id, _) in forms {
        let table = engine.tables().form(id).await.unwrap().table_name.unwrap();
        assert_eq!(
            columns(engine.pool(), &table).await,
            vec!["id", "name", "created_at", "updated_at", "y1", "x3"]
        );

        let jobs = engine.queue().jobs_for_form(id).await.unwrap();
        assert_eq!(jobs.len(), 5);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
        for pair in jobs.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            assert!(earlier.id < later.id);
            assert!(
                later.started_at.unwrap() >= earlier.finished_at.unwrap(),
                "job {} started before job {} finished",
                later.id,
                earlier.id
            );
        }

        let history = engine.history().for_form(id).await.unwrap();
        assert_eq!(history.len(), 5);
        assert!(history.iter().all(|m| m.status == MigrationStatus::Success));
    }
}

#[tokio::test]
async fn test_jobs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("formsync.sqlite3");

    let first = file_engine(&path, fast_queue(1)).await;
    first
        .tables()
        .create_form_table(&single_field("form-alpha", "Alpha"))
        .await
        .unwrap();
    let target = TableTarget::Form("form-alpha".into());
    let jobs = first
        .tables()
        .update_form_table_columns(
            &target,
            vec![
                add("f-x1", "x1", FieldType::ShortAnswer),
                add("f-x2", "x2", FieldType::ShortAnswer),
            ],
        )
        .await
        .unwrap();

    // Claimed but never finished, as if the process died mid-job.
    let claimed = first.queue().claim().await.unwrap().unwrap();
    assert_eq!(claimed.id, jobs[0]);
    assert!(first.queue().claim().await.unwrap().is_none());
    first.pool().close().await;
    drop(first);

    let second = file_engine(&path, fast_queue(1)).await;
    let counts = second.queue().status("form-alpha").await.unwrap();
    assert_eq!((counts.active, counts.waiting), (1, 1));

    assert_eq!(second.queue().recover().await.unwrap(), 1);
    assert_eq!(second.queue().run_until_idle().await.unwrap(), 2);

    let replayed = second.queue().job(jobs[0]).await.unwrap();
    assert_eq!(replayed.status, JobStatus::Completed);
    assert_eq!(replayed.attempts, 2);
    assert_eq!(
        columns(second.pool(), "alpha").await,
        vec!["id", "name", "created_at", "updated_at", "x1", "x2"]
    );
}

#[tokio::test]
async fn test_cancel_waiting_leaves_other_forms() {
    let dir = tempfile::tempdir().unwrap();
    let engine = file_engine(&dir.path().join("formsync.sqlite3"), fast_queue(1)).await;
    for (id, title) in [("form-alpha", "Alpha"), ("form-beta", "Beta")] {
        engine
            .tables()
            .create_form_table(&single_field(id, title))
            .await
            .unwrap();
        engine
            .tables()
            .update_form_table_columns(&TableTarget::Form(id.into()), plan())
            .await
            .unwrap();
    }

    assert_eq!(engine.queue().cancel_waiting("form-alpha").await.unwrap(), 5);
    assert_eq!(engine.queue().run_until_idle().await.unwrap(), 5);

    let alpha = engine.queue().status("form-alpha").await.unwrap();
    assert_eq!((alpha.failed, alpha.completed), (5, 0));
    let beta = engine.queue().status("form-beta").await.unwrap();
    assert_eq!((beta.failed, beta.completed), (0, 5));
    assert_eq!(
        columns(engine.pool(), "alpha").await,
        vec!["id", "name", "created_at", "updated_at"]
    );
}
