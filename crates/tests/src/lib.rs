//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 合约快照测试
//! - 内存后端 e2e 测试（source -> dispatch loop -> sink -> commit）
//! - 多 worker 提交无空洞校验

#[cfg(test)]
mod contract_tests {
    #[test]
    fn test_contracts_compile() {
        // 验证 contracts crate 可编译
        let _ = contracts::ConfigVersion::V1;
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use contracts::{
        Batch, LogSource, Message, OffsetRegistry, Sink, SinkConfig, SinkType, SourceError,
        TopicPartition,
    };
    use dispatcher::sinks::{KvFault, MemoryDocumentStore, MemoryKvStore};
    use dispatcher::{
        DeadLetter, DispatchLoop, LoopConfig, OffsetTracker, PoolState, RetryPolicy, SinkFactory,
        StopReason, WorkerPool,
    };
    use ingestion::{load_json_lines, MemoryLogSource, SourceOptions};
    use tokio_util::sync::CancellationToken;

    fn options(max_batch_size: usize) -> SourceOptions {
        SourceOptions {
            max_batch_size,
            poll_timeout: Duration::from_millis(20),
        }
    }

    fn sink_config(sink_type: SinkType, params: &[(&str, &str)]) -> SinkConfig {
        SinkConfig {
            name: "e2e".to_string(),
            sink_type,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn msg(partition: i32, offset: i64, value: &str) -> Message {
        Message::new("", value.to_string(), "events", partition, offset)
    }

    fn fast_retry(max_attempts: Option<u32>) -> LoopConfig {
        LoopConfig {
            retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(5)),
            ..LoopConfig::default()
        }
    }

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    /// KV list batch with one failed command: only that message is re-sunk,
    /// and the single commit covers the highest offset.
    #[tokio::test]
    async fn test_kv_partial_failure_single_retry_then_commit() {
        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let sink = factory
            .create(&sink_config(
                SinkType::Kv,
                &[("key_template", "user:{id}"), ("value_field", "event")],
            ))
            .unwrap();

        store.inject_fault(KvFault::FailCommands(vec![1]));
        let source = MemoryLogSource::bounded(
            vec![
                msg(0, 0, r#"{"id":"a","event":"login"}"#),
                msg(0, 1, r#"{"id":"a","event":"logout"}"#),
            ],
            options(10),
        );
        let commits = source.commits().clone();

        let outcome = DispatchLoop::new(fast_retry(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.stop_reason, StopReason::SourceExhausted);
        assert_eq!(outcome.report.retries, 1);
        assert_eq!(outcome.report.succeeded, 2);
        assert_eq!(store.exec_calls(), 2);

        let mut events = store.lrange("user:a");
        events.sort();
        assert_eq!(events, vec!["login".to_string(), "logout".to_string()]);

        assert_eq!(commits.calls(), 1);
        assert_eq!(commits.committed(&tp(0)), Some(1));
        assert_eq!(store.close_calls(), 1);
    }

    /// No reply and an empty reply both count as an unavailable backend
    #[tokio::test]
    async fn test_kv_missing_reply_retries_whole_batch() {
        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let sink = factory
            .create(&sink_config(SinkType::Kv, &[("key_template", "user:{id}")]))
            .unwrap();

        store.inject_fault(KvFault::NoReply);
        store.inject_fault(KvFault::EmptyReply);
        let source = MemoryLogSource::bounded(
            vec![msg(0, 0, r#"{"id":"a"}"#), msg(0, 1, r#"{"id":"b"}"#)],
            options(10),
        );
        let commits = source.commits().clone();

        let outcome = DispatchLoop::new(fast_retry(Some(5)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(store.exec_calls(), 3);
        assert_eq!(outcome.sink_stats.unavailable, 2);
        assert_eq!(outcome.report.retries, 4);
        assert_eq!(store.lrange("user:a").len(), 1);
        assert_eq!(store.lrange("user:b").len(), 1);
        assert_eq!(commits.committed(&tp(0)), Some(1));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_execute() {
        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let mut sink = factory
            .create(&sink_config(SinkType::Kv, &[("key_template", "user:{id}")]))
            .unwrap();

        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(store.close_calls(), 1);

        sink.prepare(&[msg(0, 0, r#"{"id":"a"}"#)]).unwrap();
        let err = sink.execute().await.unwrap_err();
        assert!(err.to_string().contains("is closed"), "got: {err}");
        assert_eq!(store.exec_calls(), 0);
    }

    #[tokio::test]
    async fn test_pool_stop_returns_within_grace() {
        let mut pool: WorkerPool<&'static str> = WorkerPool::new(2, Duration::from_millis(100));
        pool.start(|ctx| async move {
            if ctx.id == 0 {
                ctx.cancel.cancelled().await;
                "cooperative"
            } else {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "stubborn"
            }
        })
        .unwrap();

        let started = Instant::now();
        let report = pool.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(!report.is_clean());
        assert_eq!(report.abandoned, vec![1]);
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].id, 0);
        assert!(matches!(report.finished[0].result, Ok("cooperative")));
    }

    #[tokio::test]
    async fn test_document_update_only_never_creates() {
        let documents = MemoryDocumentStore::new();
        let existing = serde_json::json!({"id": "1", "name": "old", "plan": "free"});
        documents.insert("users", "1", existing.as_object().unwrap().clone());

        let factory = SinkFactory::with_stores(MemoryKvStore::new(), documents.clone());
        let sink = factory
            .create(&sink_config(
                SinkType::Document,
                &[
                    ("primary_key", "id"),
                    ("collection", "users"),
                    ("mode", "update_only"),
                ],
            ))
            .unwrap();

        let source = MemoryLogSource::bounded(
            vec![
                msg(0, 0, r#"{"id":"1","name":"new"}"#),
                msg(0, 1, r#"{"id":"2","name":"ghost"}"#),
            ],
            options(10),
        );
        let commits = source.commits().clone();

        let outcome = DispatchLoop::new(fast_retry(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(documents.count("users"), 1);
        let updated = documents.get("users", "1").unwrap();
        assert_eq!(updated["name"], "new");
        assert_eq!(updated["plan"], "free");
        assert!(documents.get("users", "2").is_none());

        assert_eq!(outcome.report.resolved(), 2);
        assert_eq!(commits.committed(&tp(0)), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_ttl_expires_written_keys() {
        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let sink = factory
            .create(&sink_config(
                SinkType::Kv,
                &[
                    ("key_template", "session:{id}"),
                    ("ttl_type", "duration"),
                    ("ttl_value", "30"),
                ],
            ))
            .unwrap();

        let source = MemoryLogSource::bounded(vec![msg(0, 0, r#"{"id":"a"}"#)], options(10));
        DispatchLoop::new(fast_retry(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        let ttl = store.ttl("session:a").unwrap();
        assert!(ttl <= Duration::from_secs(30) && ttl > Duration::from_secs(29));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!store.exists("session:a"));
    }

    /// Checks at every commit that the committed prefix is really in the store
    struct AuditedSource {
        inner: MemoryLogSource,
        store: MemoryKvStore,
        violations: Arc<AtomicUsize>,
        /// Stall after fetching a batch that holds offset 0
        stall_on_head: Option<Duration>,
    }

    impl AuditedSource {
        fn new(inner: MemoryLogSource, store: MemoryKvStore, violations: Arc<AtomicUsize>) -> Self {
            Self {
                inner,
                store,
                violations,
                stall_on_head: None,
            }
        }
    }

    impl LogSource for AuditedSource {
        async fn poll(&mut self) -> Result<Option<Batch>, SourceError> {
            let polled = self.inner.poll().await?;
            if let (Some(stall), Some(batch)) = (self.stall_on_head, &polled) {
                if batch.iter().any(|m| m.offset == 0) {
                    tokio::time::sleep(stall).await;
                }
            }
            Ok(polled)
        }

        async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<(), SourceError> {
            for (tp, committed) in offsets {
                let written: BTreeSet<i64> = self
                    .store
                    .lrange(&format!("events:{}", tp.partition))
                    .iter()
                    .filter_map(|v| v.parse().ok())
                    .collect();
                if (0..=*committed).any(|offset| !written.contains(&offset)) {
                    self.violations.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.inner.commit(offsets).await
        }
    }

    #[tokio::test]
    async fn test_parallel_workers_commit_without_gaps() {
        const PER_PARTITION: i64 = 30;

        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let config = sink_config(
            SinkType::Kv,
            &[("key_template", "events:{p}"), ("value_field", "n")],
        );

        for fault in [
            KvFault::FailCommands(vec![0, 3]),
            KvFault::NoReply,
            KvFault::FailCommands(vec![1]),
            KvFault::Transport("connection reset".to_string()),
            KvFault::FailCommands(vec![2, 4]),
        ] {
            store.inject_fault(fault);
        }

        let messages: Vec<Message> = (0..PER_PARTITION)
            .flat_map(|n| (0..2).map(move |p| msg(p, n, &format!(r#"{{"p":{p},"n":{n}}}"#))))
            .collect();
        let tracker = Arc::new(OffsetTracker::new());
        let source = MemoryLogSource::bounded(messages, options(7))
            .with_registry(Arc::clone(&tracker) as Arc<dyn OffsetRegistry>);
        let commits = source.commits().clone();
        let violations = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(4, Duration::from_secs(1));
        pool.start(|ctx| {
            let sink = factory.create(&config).unwrap();
            let audited = AuditedSource::new(source.clone(), store.clone(), Arc::clone(&violations));
            let loop_config = LoopConfig {
                worker_id: ctx.id,
                ..fast_retry(None)
            };
            DispatchLoop::new(loop_config, audited, sink, Arc::clone(&tracker)).run(ctx.cancel)
        })
        .unwrap();

        let exits = tokio::time::timeout(Duration::from_secs(10), pool.await_completion())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exits.len(), 4);
        for exit in &exits {
            let outcome = exit.result.as_ref().unwrap();
            assert_eq!(outcome.stop_reason, StopReason::SourceExhausted);
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.total_pending(), 0);
        for partition in 0..2 {
            assert_eq!(commits.committed(&tp(partition)), Some(PER_PARTITION - 1));
            let written: BTreeSet<i64> = store
                .lrange(&format!("events:{partition}"))
                .iter()
                .filter_map(|v| v.parse().ok())
                .collect();
            assert_eq!(written, (0..PER_PARTITION).collect::<BTreeSet<_>>());
        }
    }

    #[tokio::test]
    async fn test_slow_worker_holds_back_sibling_commits() {
        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let config = sink_config(
            SinkType::Kv,
            &[("key_template", "events:{p}"), ("value_field", "n")],
        );

        let messages: Vec<Message> = (0..4)
            .map(|n| msg(0, n, &format!(r#"{{"p":0,"n":{n}}}"#)))
            .collect();
        let tracker = Arc::new(OffsetTracker::new());
        let source = MemoryLogSource::bounded(messages, options(2))
            .with_registry(Arc::clone(&tracker) as Arc<dyn OffsetRegistry>);
        let commits = source.commits().clone();
        let violations = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(2, Duration::from_secs(1));
        pool.start(|ctx| {
            let sink = factory.create(&config).unwrap();
            let mut audited =
                AuditedSource::new(source.clone(), store.clone(), Arc::clone(&violations));
            // Whoever fetches the head sits on it while the sibling finishes
            audited.stall_on_head = Some(Duration::from_millis(100));
            let loop_config = LoopConfig {
                worker_id: ctx.id,
                ..fast_retry(Some(3))
            };
            DispatchLoop::new(loop_config, audited, sink, Arc::clone(&tracker)).run(ctx.cancel)
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), pool.await_completion())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.stale_tracks(), 0);
        assert_eq!(tracker.total_pending(), 0);
        assert_eq!(commits.committed(&tp(0)), Some(3));
    }

    fn files_under(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                files.extend(files_under(&path));
            } else {
                files.push(path);
            }
        }
        files
    }

    /// Config file -> JSON-lines input -> filter -> KV sink -> blob dead letter
    #[tokio::test]
    async fn test_configured_pipeline_dead_letters_exhausted_message() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = dir.path().join("dlq");
        let input = dir.path().join("input.jsonl");
        std::fs::write(
            &input,
            concat!(
                r#"{"key": "user:a", "value": {"id": "a"}}"#,
                "\n",
                r#"{"key": "admin:x", "value": {"id": "x"}}"#,
                "\n",
                r#"{"key": "user:b", "value": {"id": "b"}}"#,
                "\n",
            ),
        )
        .unwrap();

        let toml = format!(
            r#"
[source]
input = "{input}"
max_batch_size = 10

[retry]
max_attempts = 2
backoff = "fixed"
initial_delay_ms = 1
max_delay_ms = 1
on_exhausted = "dead_letter"

[dead_letter]
sink_type = "blob"
params = {{ base_path = "${{SINKPIPE_E2E_UNSET_DLQ:-{dlq}}}" }}

[filter]
key_prefix = "user:"

[sink]
name = "users"
sink_type = "kv"
params = {{ key_template = "user:{{id}}" }}
"#,
            input = input.display(),
            dlq = dlq.display(),
        );
        let blueprint =
            config_loader::ConfigLoader::load_from_str(&toml, config_loader::ConfigFormat::Toml)
                .unwrap();

        let store = MemoryKvStore::new();
        let factory = SinkFactory::with_stores(store.clone(), MemoryDocumentStore::new());
        let sink = factory.create(&blueprint.sink).unwrap();
        let dead_letter =
            DeadLetter::from_config(&blueprint.sink.name, blueprint.dead_letter.as_ref().unwrap())
                .unwrap();
        let filter = contracts::FilterRule::from_config(blueprint.filter.as_ref().unwrap());

        let messages =
            load_json_lines(blueprint.source.input.as_ref().unwrap(), &blueprint.source.default_topic)
                .unwrap();
        let source = MemoryLogSource::bounded(messages, SourceOptions::from_config(&blueprint.source));
        let commits = source.commits().clone();

        // user:a fails on both attempts
        store.inject_fault(KvFault::FailCommands(vec![0]));
        store.inject_fault(KvFault::FailCommands(vec![0]));

        let outcome = DispatchLoop::new(
            LoopConfig::from_blueprint(0, &blueprint),
            source,
            sink,
            Arc::new(OffsetTracker::new()),
        )
        .with_filter(Arc::new(filter))
        .with_dead_letter(dead_letter)
        .run(CancellationToken::new())
        .await;

        assert_eq!(outcome.report.filtered, 1);
        assert_eq!(outcome.report.succeeded, 1);
        assert_eq!(outcome.report.dead_lettered, 1);
        assert_eq!(store.exec_calls(), 2);
        assert_eq!(store.lrange("user:b").len(), 1);
        assert!(store.lrange("user:a").is_empty());
        assert_eq!(commits.committed(&tp(0)), Some(2));

        let written: Vec<_> = files_under(&dlq)
            .into_iter()
            .filter(|p| std::fs::metadata(p).map(|m| m.len() > 0).unwrap_or(false))
            .collect();
        assert!(!written.is_empty());
    }

    #[test]
    fn test_factory_rejects_bad_params() {
        let factory = SinkFactory::new();
        let bad: Vec<(SinkType, HashMap<&str, &str>)> = vec![
            (SinkType::Kv, HashMap::from([("key_template", "user:{")])),
            (
                SinkType::Kv,
                HashMap::from([("key_template", "k"), ("ttl_type", "duration")]),
            ),
            (
                SinkType::Document,
                HashMap::from([("primary_key", "id"), ("mode", "replace")]),
            ),
        ];
        for (sink_type, params) in bad {
            let params: Vec<(&str, &str)> = params.into_iter().collect();
            assert!(factory.create(&sink_config(sink_type, &params)).is_err());
        }
    }
}
