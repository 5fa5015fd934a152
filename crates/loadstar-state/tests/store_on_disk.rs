//! File-backed store behavior across reopen.

use chrono::Utc;
use loadstar_state::{ExecutionStore, SqliteExecutionStore};
use loadstar_types::state::{
    CheckpointState, ContentDigest, ExecStatus, ExecutionId, ExecutionQuery, ExecutionRecord,
    StreamId, TaskSnapshot,
};
use proptest::prelude::*;

fn record(exec: &str, digest: &str) -> ExecutionRecord {
    ExecutionRecord {
        exec_id: ExecutionId::new(exec),
        stream_id: StreamId::new("stream-1"),
        stream_name: "public.orders".into(),
        task_digest: ContentDigest::new(digest),
        replication_digest: None,
        status: ExecStatus::Running,
        error: None,
        start_time: Some(Utc::now()),
        end_time: None,
        rows: 0,
        bytes: 0,
        output: String::new(),
        pid: std::process::id(),
        version: "test".into(),
        project_id: None,
        file_path: None,
    }
}

#[test]
fn creates_parent_directories_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("loadstar.db");

    {
        let store = SqliteExecutionStore::open(&path).unwrap();
        store.insert_execution(&record("e1", "d1")).unwrap();
        store
            .set_checkpoint(
                &StreamId::new("stream-1"),
                &CheckpointState {
                    update_key: "updated_at".into(),
                    value: "2024-03-01T00:00:00Z".into(),
                    updated_at: Utc::now(),
                },
            )
            .unwrap();
    }

    let reopened = SqliteExecutionStore::open(&path).unwrap();
    let rows = reopened.list_executions(&ExecutionQuery::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.status, ExecStatus::Running);
    let cp = reopened
        .get_checkpoint(&StreamId::new("stream-1"))
        .unwrap()
        .unwrap();
    assert_eq!(cp.value, "2024-03-01T00:00:00Z");
}

#[test]
fn two_runs_of_one_config_share_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteExecutionStore::open(&dir.path().join("s.db")).unwrap();
    let snapshot = TaskSnapshot {
        digest: ContentDigest::new("same"),
        project_id: None,
        mode: "append".into(),
        config: serde_json::json!({"source": {"conn": "postgres://"}}),
    };

    for exec in ["e1", "e2"] {
        store.insert_task_snapshot(&snapshot).unwrap();
        store.insert_execution(&record(exec, "same")).unwrap();
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.task_snapshots, 1);
    assert_eq!(stats.executions, 2);
}

proptest! {
    #[test]
    fn snapshot_rows_equal_distinct_digests(digests in proptest::collection::vec("[a-f]{1,3}", 1..20)) {
        let store = SqliteExecutionStore::in_memory().unwrap();
        for digest in &digests {
            store.insert_task_snapshot(&TaskSnapshot {
                digest: ContentDigest::new(digest.clone()),
                project_id: None,
                mode: "append".into(),
                config: serde_json::Value::Null,
            }).unwrap();
        }
        let distinct: std::collections::BTreeSet<_> = digests.iter().collect();
        prop_assert_eq!(store.stats().unwrap().task_snapshots, distinct.len() as u64);
    }
}
