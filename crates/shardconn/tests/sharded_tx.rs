use std::sync::Arc;
use std::time::Duration;

use shardconn::driver::Driver;
use shardconn::driver::recording::{OpLog, RecordingDriver};
use shardconn::{
    BoxError,
    Raw,
    ShardError,
    ShardKey,
    ShardedConnections,
    UnknownKeyPolicy,
    run_transaction,
    run_transaction_with_cancel,
};
use tokio_util::sync::CancellationToken;

struct Cluster {
    set: ShardedConnections,
    drivers: Vec<RecordingDriver>,
    log: OpLog,
}

fn cluster(nodes: usize) -> Cluster {
    logutil::init_test();
    let log = OpLog::new();
    let drivers: Vec<_> = (0..nodes)
        .map(|i| RecordingDriver::new(format!("s{i}"), log.clone()))
        .collect();
    let set = ShardedConnections::from_drivers(
        drivers
            .iter()
            .map(|d| Arc::new(d.clone()) as Arc<dyn Driver>)
            .collect(),
        UnknownKeyPolicy::FirstShard,
    )
    .unwrap();
    Cluster { set, drivers, log }
}

fn pairs(ops: &[(&str, &str)]) -> Vec<(String, String)> {
    ops.iter()
        .map(|(t, o)| (t.to_string(), o.to_string()))
        .collect()
}

const INSERT: &str = "INSERT INTO users VALUES ($1)";

#[tokio::test]
async fn begin_failure_rolls_back_in_reverse() {
    let c = cluster(5);
    c.drivers[3].fail_on("BEGIN");

    let err = run_transaction(&c.set, [0, 1, 2, 3, 4], |_scope| {
        Box::pin(async move { Ok::<_, BoxError>(()) })
    })
    .await
    .unwrap_err();

    let begin = err.begin.as_ref().unwrap();
    assert_eq!(ShardKey::from(3), begin.key);
    assert_eq!(Some(3), begin.shard);
    assert!(err.callback.is_none());
    assert!(err.commits.is_empty());
    assert_eq!(
        vec![&ShardKey::from(2), &1.into(), &0.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );

    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s2", "BEGIN"),
            ("s3", "BEGIN"),
            ("s2", "ROLLBACK"),
            ("s1", "ROLLBACK"),
            ("s0", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
    assert!(c.log.ops_for("s4").is_empty());
}

#[tokio::test]
async fn two_shard_success() {
    let c = cluster(2);

    let inserted = run_transaction(&c.set, [10, 11], |scope| {
        Box::pin(async move {
            let mut inserted = 0;
            inserted += scope.conn(10)?.exec(&Raw::new(INSERT).bind(10)).await?;
            inserted += scope.conn(11)?.exec(&Raw::new(INSERT).bind(11)).await?;
            Ok::<_, BoxError>(inserted)
        })
    })
    .await
    .unwrap();

    assert_eq!(2, inserted);
    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s0", INSERT),
            ("s1", INSERT),
            ("s0", "COMMIT"),
            ("s1", "COMMIT"),
        ]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn failing_second_insert_rolls_back_both() {
    let c = cluster(2);
    c.drivers[1].fail_on("INSERT");

    let err = run_transaction(&c.set, [10, 11], |scope| {
        Box::pin(async move {
            scope.conn(10)?.exec(&Raw::new(INSERT).bind(10)).await?;
            scope.conn(11)?.exec(&Raw::new(INSERT).bind(11)).await?;
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap_err();

    let cause = err.callback.as_ref().unwrap().to_string();
    assert!(cause.contains("failed to execute"), "{cause}");
    assert!(cause.contains("[11]"), "{cause}");

    assert_eq!(2, err.rollbacks.len());
    assert_eq!(0, err.rollback_errors().count());
    assert_eq!(
        vec![&ShardKey::from(10), &11.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert!(err.commits.is_empty());

    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s0", INSERT),
            ("s1", INSERT),
            ("s0", "ROLLBACK"),
            ("s1", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn partial_commit_is_reported() {
    let c = cluster(2);
    c.drivers[1].fail_on("COMMIT");

    let err = run_transaction(&c.set, [0, 1], |scope| {
        Box::pin(async move {
            scope.conn(0)?.exec("UPDATE t SET n = n + 1").await?;
            scope.conn(1)?.exec("UPDATE t SET n = n + 1").await?;
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap_err();

    assert!(err.begin.is_none());
    assert!(err.callback.is_none());
    assert!(!err.cancelled);
    assert!(err.rollbacks.is_empty());
    assert_eq!(
        vec![&ShardKey::from(0)],
        err.committed_keys().collect::<Vec<_>>()
    );
    let failed: Vec<_> = err.commit_errors().map(|(key, _)| key.clone()).collect();
    assert_eq!(vec![ShardKey::from(1)], failed);
    assert!(err.to_string().starts_with("commit failed for 1 of 2 keys"));

    // Shard 0 stays committed.
    assert_eq!(
        vec!["BEGIN", "UPDATE t SET n = n + 1", "COMMIT"],
        c.log.ops_for("s0")
    );
    assert!(!c.log.ops_for("s1").iter().any(|op| op == "ROLLBACK"));
}

#[tokio::test]
async fn cancelled_before_begin() {
    let c = cluster(2);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run_transaction_with_cancel(&c.set, [0, 1], &cancel, |_scope| {
        Box::pin(async move { Ok::<_, BoxError>(()) })
    })
    .await
    .unwrap_err();

    assert!(err.cancelled);
    assert!(err.rollbacks.is_empty());
    assert!(c.log.ops().is_empty());
    assert_eq!("transaction cancelled", err.to_string());
}

#[tokio::test]
async fn cancelled_during_body_rolls_back_begun_keys() {
    let c = cluster(2);
    let cancel = CancellationToken::new();
    let body_cancel = cancel.clone();

    let err = run_transaction_with_cancel(&c.set, [0, 1], &cancel, move |scope| {
        Box::pin(async move {
            scope.conn(0)?.exec("DELETE FROM t").await?;
            body_cancel.cancel();
            std::future::pending::<()>().await;
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap_err();

    assert!(err.cancelled);
    assert!(err.callback.is_none());
    assert_eq!(
        vec![&ShardKey::from(0), &1.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s0", "DELETE FROM t"),
            ("s0", "ROLLBACK"),
            ("s1", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn undeclared_key_is_rejected() {
    let c = cluster(2);

    let err = run_transaction(&c.set, [0], |scope| {
        Box::pin(async move {
            scope.conn(99)?.exec("DELETE FROM t").await?;
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap_err();

    let cause = err.callback.as_ref().unwrap();
    match cause.downcast_ref::<ShardError>() {
        Some(ShardError::UndeclaredKey(key)) => assert_eq!(&ShardKey::from(99), key),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        pairs(&[("s0", "BEGIN"), ("s0", "ROLLBACK")]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn duplicate_keys_share_a_connection() {
    let c = cluster(2);

    let keys = run_transaction(&c.set, [1, 1, 3], |scope| {
        Box::pin(async move {
            let keys: Vec<ShardKey> = scope.keys().cloned().collect();

            let conn = scope.conn(1)?;
            conn.begin().await?;
            conn.exec("UPDATE t SET n = 0").await?;
            conn.commit().await?;

            // Still inside the outer transaction.
            assert_eq!(1, scope.conn(1)?.depth());
            Ok::<_, BoxError>(keys)
        })
    })
    .await
    .unwrap();

    assert_eq!(vec![ShardKey::from(1), 3.into()], keys);
    // Keys 1 and 3 both live on shard 1 but each gets its own transaction.
    assert_eq!(
        vec![
            "BEGIN",
            "BEGIN",
            "SAVEPOINT trans_2",
            "UPDATE t SET n = 0",
            "RELEASE SAVEPOINT trans_2",
            "COMMIT",
            "COMMIT",
        ],
        c.log.ops_for("s1")
    );
    assert!(c.log.ops_for("s0").is_empty());
}

#[tokio::test]
async fn unroutable_key_fails_before_begin() {
    let log = OpLog::new();
    let set = ShardedConnections::from_drivers(
        vec![Arc::new(RecordingDriver::new("s0", log.clone())) as Arc<dyn Driver>],
        UnknownKeyPolicy::Reject,
    )
    .unwrap();

    let keys = [ShardKey::from(1), ShardKey::from(0.5_f64)];
    let err = run_transaction(&set, keys, |_scope| {
        Box::pin(async move { Ok::<_, BoxError>(()) })
    })
    .await
    .unwrap_err();

    let begin = err.begin.as_ref().unwrap();
    assert_eq!(None, begin.shard);
    assert!(matches!(begin.error, ShardError::Route(_)));
    assert!(log.ops().is_empty());
}

#[tokio::test]
async fn begin_failure_on_third_of_five() {
    let c = cluster(5);
    c.drivers[2].fail_on("BEGIN");

    let err = run_transaction(&c.set, [0, 1, 2, 3, 4], |_scope| {
        Box::pin(async move { Ok::<_, BoxError>(()) })
    })
    .await
    .unwrap_err();

    assert_eq!(ShardKey::from(2), err.begin.as_ref().unwrap().key);
    assert_eq!(
        vec![&ShardKey::from(1), &0.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s2", "BEGIN"),
            ("s1", "ROLLBACK"),
            ("s0", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
    assert!(c.log.ops_for("s3").is_empty());
    assert!(c.log.ops_for("s4").is_empty());
}

#[tokio::test]
async fn keys_one_and_two_route_by_modulo() {
    let c = cluster(2);
    assert_eq!(1, c.set.shard_of(&1.into()).unwrap());
    assert_eq!(0, c.set.shard_of(&2.into()).unwrap());

    run_transaction(&c.set, [1, 2], |scope| {
        Box::pin(async move {
            scope.conn(1)?.exec(&Raw::new(INSERT).bind(1)).await?;
            scope.conn(2)?.exec(&Raw::new(INSERT).bind(2)).await?;
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap();

    assert_eq!(
        pairs(&[
            ("s1", "BEGIN"),
            ("s0", "BEGIN"),
            ("s1", INSERT),
            ("s0", INSERT),
            ("s1", "COMMIT"),
            ("s0", "COMMIT"),
        ]),
        c.log.pairs()
    );

    // Second insert fails: both keys roll back in touched order.
    c.log.clear();
    c.drivers[0].fail_on("INSERT");
    let err = run_transaction(&c.set, [1, 2], |scope| {
        Box::pin(async move {
            scope.conn(1)?.exec(&Raw::new(INSERT).bind(1)).await?;
            scope.conn(2)?.exec(&Raw::new(INSERT).bind(2)).await?;
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap_err();

    assert!(err.callback.is_some());
    assert_eq!(
        vec![&ShardKey::from(1), &2.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert_eq!(
        pairs(&[
            ("s1", "BEGIN"),
            ("s0", "BEGIN"),
            ("s1", INSERT),
            ("s0", INSERT),
            ("s1", "ROLLBACK"),
            ("s0", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn failed_rollback_after_body_error_keeps_cause() {
    let c = cluster(2);
    c.drivers[0].fail_on("ROLLBACK");

    let err = run_transaction(&c.set, [0, 1], |_scope| {
        Box::pin(async move { Err::<(), BoxError>("boom".into()) })
    })
    .await
    .unwrap_err();

    assert_eq!("boom", err.callback.as_ref().unwrap().to_string());
    let outcomes: Vec<_> = err
        .rollbacks
        .iter()
        .map(|o| (o.key.clone(), o.result.is_ok()))
        .collect();
    assert_eq!(vec![(ShardKey::from(0), false), (1.into(), true)], outcomes);
    assert_eq!(1, err.rollback_errors().count());

    let msg = err.to_string();
    assert!(
        msg.starts_with("transaction failed: boom; rollback: key 0 (shard 0) failed"),
        "{msg}"
    );
    assert!(msg.ends_with("key 1 (shard 1) ok"), "{msg}");
}

#[tokio::test]
async fn failed_rollback_after_begin_error_keeps_cause() {
    let c = cluster(3);
    c.drivers[2].fail_on("BEGIN");
    c.drivers[0].fail_on("ROLLBACK");

    let err = run_transaction(&c.set, [0, 1, 2], |_scope| {
        Box::pin(async move { Ok::<_, BoxError>(()) })
    })
    .await
    .unwrap_err();

    let begin = err.begin.as_ref().unwrap();
    assert_eq!(ShardKey::from(2), begin.key);
    let outcomes: Vec<_> = err
        .rollbacks
        .iter()
        .map(|o| (o.key.clone(), o.result.is_ok()))
        .collect();
    assert_eq!(vec![(ShardKey::from(1), true), (0.into(), false)], outcomes);
    assert!(err.to_string().starts_with("begin failed for key 2"));
}

#[tokio::test]
async fn cancel_during_stalled_begin_rolls_back_prefix() {
    let c = cluster(3);
    c.drivers[2].stall_on("BEGIN");
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        run_transaction_with_cancel(&c.set, [0, 1, 2], &cancel, |_scope| {
            Box::pin(async move { Ok::<_, BoxError>(()) })
        }),
    )
    .await
    .expect("cancellation should interrupt a stalled begin")
    .unwrap_err();

    assert!(err.cancelled);
    assert!(err.begin.is_none());
    assert_eq!(
        vec![&ShardKey::from(1), &0.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s2", "BEGIN"),
            ("s1", "ROLLBACK"),
            ("s0", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn cancel_during_stalled_commit_keeps_committed_keys() {
    let c = cluster(3);
    c.drivers[1].stall_on("COMMIT");
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        run_transaction_with_cancel(&c.set, [0, 1, 2], &cancel, |_scope| {
            Box::pin(async move { Ok::<_, BoxError>(()) })
        }),
    )
    .await
    .expect("cancellation should interrupt a stalled commit")
    .unwrap_err();

    assert!(err.cancelled);
    assert_eq!(
        vec![&ShardKey::from(0)],
        err.committed_keys().collect::<Vec<_>>()
    );
    assert_eq!(1, err.commits.len());
    assert_eq!(
        vec![&ShardKey::from(1), &2.into()],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert_eq!(
        pairs(&[
            ("s0", "BEGIN"),
            ("s1", "BEGIN"),
            ("s2", "BEGIN"),
            ("s0", "COMMIT"),
            ("s1", "COMMIT"),
            ("s1", "ROLLBACK"),
            ("s2", "ROLLBACK"),
        ]),
        c.log.pairs()
    );
}

#[tokio::test]
async fn body_may_finish_outer_level() {
    let c = cluster(2);

    run_transaction(&c.set, [0, 1], |scope| {
        Box::pin(async move {
            let conn = scope.conn(0)?;
            conn.exec("DELETE FROM t").await?;
            conn.commit().await?;
            assert_eq!(0, conn.depth());
            Ok::<_, BoxError>(())
        })
    })
    .await
    .unwrap();

    assert_eq!(vec!["BEGIN", "DELETE FROM t", "COMMIT"], c.log.ops_for("s0"));
    assert_eq!(vec!["BEGIN", "COMMIT"], c.log.ops_for("s1"));

    // A later body failure leaves the finished key alone.
    c.log.clear();
    let err = run_transaction(&c.set, [0, 1], |scope| {
        Box::pin(async move {
            scope.conn(0)?.rollback().await?;
            Err::<(), BoxError>("boom".into())
        })
    })
    .await
    .unwrap_err();

    assert_eq!(
        vec![&ShardKey::from(1)],
        err.rolled_back_keys().collect::<Vec<_>>()
    );
    assert_eq!(0, err.rollback_errors().count());
    assert_eq!(vec!["BEGIN", "ROLLBACK"], c.log.ops_for("s0"));
}
