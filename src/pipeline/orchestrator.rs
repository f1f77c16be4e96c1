use crate::chunking::{ChatFragment, ChunkFailure, ConversationChunker};
use crate::config::PipelineConfig;
use crate::conversation::export::RejectedExport;
use crate::conversation::{Conversation, clean_title};
use crate::error::ValidationError;
use crate::memory::{GraphPersister, PersistOutcome, UpsertDisposition};
use crate::pipeline::PipelineRegistry;
use crate::pipeline::progress::{ProgressEvent, ProgressSink};
use crate::pipeline::report::{
    CancellationPoint, FailedFragment, ProviderCalls, RunCounts, RunReport, RunState, RunTimings,
    ShardCounts,
};
use crate::synthesis::{
    EmbeddingClient, FailureKind, ResultSource, SummaryClient, SynthesisOutcome,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 管道编排器
///
/// 每次 [`run`](PipelineOrchestrator::run) 都是独立的：独立的 run_id、独立的运行缓存，
/// 跨运行的幂等完全依赖图存储的合并语义。
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    registry: PipelineRegistry,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig, registry: PipelineRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// 不可取消的运行
    pub async fn run_to_completion(&self, conversations: &[Conversation]) -> RunReport {
        self.run(conversations, CancellationToken::new()).await
    }

    /// 处理一批对话
    ///
    /// 取消信号到达后不再派发新片段，在途的外部调用允许完成；报告记录取消时的位置。
    pub async fn run(
        &self,
        conversations: &[Conversation],
        cancel: CancellationToken,
    ) -> RunReport {
        self.run_with_rejections(conversations, &[], cancel).await
    }

    /// 同 [`run`](PipelineOrchestrator::run)，并把加载阶段已拒绝的对话计入报告
    pub async fn run_with_rejections(
        &self,
        conversations: &[Conversation],
        rejected: &[RejectedExport],
        cancel: CancellationToken,
    ) -> RunReport {
        let mut run = RunLedger::new(&self.config.agent_name);
        let total = conversations.len() + rejected.len();
        info!(
            run_id = %run.run_id,
            conversations = conversations.len(),
            rejected = rejected.len(),
            max_tokens = self.config.max_tokens_per_fragment,
            workers = self.config.worker_pool_size,
            "🚀 开始合成运行"
        );

        // ── 分片 ──
        run.transition(RunState::Chunking);
        let chunk_started = Instant::now();
        run.counts.conversations = total;
        for entry in rejected {
            warn!(
                run_id = %run.run_id,
                conversation = %entry.conversation_id,
                error = %entry.error,
                "导出阶段已拒绝的对话"
            );
            run.record_rejection(&entry.conversation_id, &entry.title, &entry.error);
        }
        let fragments = self.chunk_all(conversations, &mut run).await;
        run.timings.chunking_ms = chunk_started.elapsed().as_millis() as u64;

        if total > 0 && run.counts.conversations_rejected == total {
            run.transition(RunState::Failed);
            return run.finish();
        }

        // ── 合成与写入 ──
        run.transition(RunState::Synthesizing);
        let synth_started = Instant::now();
        self.dispatch(fragments, &cancel, &mut run).await;
        run.timings.synthesis_ms = synth_started.elapsed().as_millis() as u64;

        let terminal = if run.cancellation.is_some() {
            RunState::Cancelled
        } else if run.failed_fragments.is_empty() && run.counts.fragments_skipped == 0 {
            RunState::Completed
        } else {
            RunState::CompletedWithErrors
        };
        run.transition(terminal);
        run.finish()
    }

    async fn chunk_all(
        &self,
        conversations: &[Conversation],
        run: &mut RunLedger,
    ) -> Vec<ChatFragment> {
        let chunker = ConversationChunker::new(self.registry.token_counter.clone());
        let mut fragments = Vec::new();

        for conversation in conversations {
            match chunker.chunk(conversation, self.config.max_tokens_per_fragment) {
                Ok(chunking) => {
                    run.counts.fragments += chunking.fragments.len() + chunking.failures.len();
                    for failure in chunking.failures {
                        self.registry
                            .progress
                            .notify(ProgressEvent::failed(
                                failure.conversation_id.clone(),
                                failure.fragment_index,
                                failure.fragment_name.clone(),
                                failure.error.to_string(),
                            ))
                            .await;
                        run.record_chunk_failure(failure);
                    }
                    fragments.extend(chunking.fragments);
                }
                Err(e) => {
                    warn!(
                        run_id = %run.run_id,
                        conversation = %conversation.id,
                        error = %e,
                        "对话未通过校验，跳过"
                    );
                    run.record_rejection(&conversation.id, &conversation.title, &e);
                }
            }
        }
        debug!(run_id = %run.run_id, fragments = fragments.len(), "分片阶段结束");
        fragments
    }

    fn fragment_worker(&self) -> FragmentWorker {
        let retry = self.config.retry_policy();
        let mut summaries = SummaryClient::new(self.registry.summarizer.clone(), retry)
            .with_options(self.config.summarize.clone());
        let mut embeddings = EmbeddingClient::new(self.registry.embedder.clone(), retry);
        if self.config.consult_store {
            summaries = summaries.with_store(self.registry.store.clone());
            embeddings = embeddings.with_store(self.registry.store.clone());
        }
        FragmentWorker {
            summaries,
            embeddings,
            persister: GraphPersister::new(self.registry.store.clone(), retry),
            progress: self.registry.progress.clone(),
            agent: self.config.agent_name.clone(),
        }
    }

    /// 固定大小的 worker 池：共享一个有界任务队列，结果经 channel 回传
    async fn dispatch(
        &self,
        fragments: Vec<ChatFragment>,
        cancel: &CancellationToken,
        run: &mut RunLedger,
    ) {
        let total = fragments.len();
        if total == 0 {
            return;
        }

        let pool_size = self.config.worker_pool_size.max(1).min(total);
        let worker = Arc::new(self.fragment_worker());
        let (job_tx, job_rx) = mpsc::channel::<ChatFragment>(pool_size);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<WorkerMessage>();

        let mut workers = JoinSet::new();
        for worker_id in 0..pool_size {
            let worker = worker.clone();
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some(fragment) = next else {
                        break;
                    };
                    // 取消后队列里剩下的片段不再处理
                    let message = if cancel.is_cancelled() {
                        WorkerMessage::Skipped(fragment.name())
                    } else {
                        WorkerMessage::Done(worker.process(fragment).await)
                    };
                    if results.send(message).is_err() {
                        break;
                    }
                }
                debug!(worker_id, "worker 退出");
            });
        }
        drop(result_tx);

        let mut fed: Vec<String> = Vec::with_capacity(total);
        for fragment in fragments {
            if cancel.is_cancelled() {
                break;
            }
            let name = fragment.name();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = job_tx.send(fragment) => {
                    if sent.is_err() {
                        error!(run_id = %run.run_id, "任务队列已关闭");
                        break;
                    }
                }
            }
            fed.push(name);
        }
        drop(job_tx);

        if !cancel.is_cancelled() {
            run.transition(RunState::Persisting);
        }

        let mut skipped: HashSet<String> = HashSet::new();
        while let Some(message) = result_rx.recv().await {
            match message {
                WorkerMessage::Done(record) => run.absorb(record),
                WorkerMessage::Skipped(name) => {
                    skipped.insert(name);
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(run_id = %run.run_id, error = %e, "worker 异常退出");
            }
        }

        let processed = run.counts.fragments_dispatched;
        let remaining = total - processed;
        run.counts.fragments_skipped = remaining;
        if cancel.is_cancelled() && remaining > 0 {
            let last_dispatched = fed.iter().rev().find(|n| !skipped.contains(*n)).cloned();
            warn!(
                run_id = %run.run_id,
                dispatched = processed,
                remaining,
                last = last_dispatched.as_deref().unwrap_or("-"),
                "⏹️ 运行被取消"
            );
            run.cancellation = Some(CancellationPoint {
                state: RunState::Synthesizing,
                dispatched: processed,
                remaining,
                last_dispatched,
            });
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

enum WorkerMessage {
    Done(FragmentRecord),
    Skipped(String),
}

#[derive(Debug, Default)]
struct CallTally {
    summarizer: u32,
    embedder: u32,
    store_writes: u32,
    summary_reused: bool,
    embedding_reused: bool,
}

/// 单个片段的处理记录
struct FragmentRecord {
    conversation_id: String,
    fragment_index: usize,
    fragment_name: String,
    tally: CallTally,
    result: Result<UpsertDisposition, (FailureKind, String)>,
}

/// 每个 worker 共享的处理逻辑：摘要 → 向量 → 写入
struct FragmentWorker {
    summaries: SummaryClient,
    embeddings: EmbeddingClient,
    persister: GraphPersister,
    progress: Arc<dyn ProgressSink>,
    agent: String,
}

impl FragmentWorker {
    async fn process(&self, fragment: ChatFragment) -> FragmentRecord {
        let mut tally = CallTally::default();
        let fragment_name = fragment.name();
        let result = self.stages(&fragment, &fragment_name, &mut tally).await;

        let event = match &result {
            Ok(_) => ProgressEvent::completed(
                fragment.source_conversation_id.clone(),
                fragment.fragment_index,
                fragment_name.clone(),
            ),
            Err((_, detail)) => ProgressEvent::failed(
                fragment.source_conversation_id.clone(),
                fragment.fragment_index,
                fragment_name.clone(),
                detail.clone(),
            ),
        };
        self.progress.notify(event).await;

        FragmentRecord {
            conversation_id: fragment.source_conversation_id,
            fragment_index: fragment.fragment_index,
            fragment_name,
            tally,
            result,
        }
    }

    async fn stages(
        &self,
        fragment: &ChatFragment,
        name: &str,
        tally: &mut CallTally,
    ) -> Result<UpsertDisposition, (FailureKind, String)> {
        let summary = match self.summaries.summarize(fragment).await {
            SynthesisOutcome::Success {
                value,
                source,
                attempts,
            } => {
                tally.summarizer += attempts;
                tally.summary_reused = source != ResultSource::Fresh;
                value
            }
            SynthesisOutcome::Failure {
                kind,
                detail,
                attempts,
            } => {
                tally.summarizer += attempts;
                return Err((kind, format!("summarize: {detail}")));
            }
        };

        let embedding = match self.embeddings.embed(&summary, name).await {
            SynthesisOutcome::Success {
                value,
                source,
                attempts,
            } => {
                tally.embedder += attempts;
                tally.embedding_reused = source != ResultSource::Fresh;
                value
            }
            SynthesisOutcome::Failure {
                kind,
                detail,
                attempts,
            } => {
                tally.embedder += attempts;
                return Err((kind, format!("embed: {detail}")));
            }
        };

        match self
            .persister
            .persist(fragment, &self.agent, summary, embedding)
            .await
        {
            PersistOutcome::Stored { upserted, attempts } => {
                tally.store_writes += attempts;
                Ok(upserted.disposition)
            }
            PersistOutcome::Failed { error, attempts } => {
                tally.store_writes += attempts;
                Err((FailureKind::Persistence, format!("persist: {error}")))
            }
        }
    }
}

// ── 报告累积 ──────────────────────────────────────────────────────────────────

struct RunLedger {
    run_id: String,
    agent: String,
    state: RunState,
    started_at: DateTime<Utc>,
    started: Instant,
    counts: RunCounts,
    provider_calls: ProviderCalls,
    shards: ShardCounts,
    timings: RunTimings,
    failed_fragments: Vec<FailedFragment>,
    cancellation: Option<CancellationPoint>,
}

impl RunLedger {
    fn new(agent: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            state: RunState::Pending,
            started_at: Utc::now(),
            started: Instant::now(),
            counts: RunCounts::default(),
            provider_calls: ProviderCalls::default(),
            shards: ShardCounts::default(),
            timings: RunTimings::default(),
            failed_fragments: Vec::new(),
            cancellation: None,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "状态切换");
        self.state = next;
    }

    fn record_rejection(&mut self, conversation_id: &str, title: &str, error: &ValidationError) {
        self.counts.conversations_rejected += 1;
        let name = if title.trim().is_empty() {
            conversation_id.to_string()
        } else {
            clean_title(title)
        };
        self.failed_fragments.push(FailedFragment {
            conversation_id: conversation_id.to_string(),
            fragment_index: 0,
            fragment_name: name,
            kind: FailureKind::Validation,
            detail: error.to_string(),
        });
    }

    fn record_chunk_failure(&mut self, failure: ChunkFailure) {
        self.counts.fragments_failed += 1;
        self.failed_fragments.push(FailedFragment {
            conversation_id: failure.conversation_id,
            fragment_index: failure.fragment_index,
            fragment_name: failure.fragment_name,
            kind: FailureKind::Chunking,
            detail: failure.error.to_string(),
        });
    }

    fn absorb(&mut self, record: FragmentRecord) {
        self.counts.fragments_dispatched += 1;
        self.provider_calls.summarizer += record.tally.summarizer;
        self.provider_calls.embedder += record.tally.embedder;
        self.provider_calls.store_writes += record.tally.store_writes;
        if record.tally.summary_reused {
            self.shards.summary_reuses += 1;
        }
        if record.tally.embedding_reused {
            self.shards.embedding_reuses += 1;
        }

        match record.result {
            Ok(UpsertDisposition::Created) => {
                self.counts.fragments_succeeded += 1;
                self.shards.created += 1;
            }
            Ok(UpsertDisposition::Merged { new_link }) => {
                self.counts.fragments_succeeded += 1;
                self.shards.merged += 1;
                if new_link {
                    self.shards.links_added += 1;
                }
            }
            Err((kind, detail)) => {
                self.counts.fragments_failed += 1;
                self.failed_fragments.push(FailedFragment {
                    conversation_id: record.conversation_id,
                    fragment_index: record.fragment_index,
                    fragment_name: record.fragment_name,
                    kind,
                    detail,
                });
            }
        }
    }

    fn finish(mut self) -> RunReport {
        self.timings.total_ms = self.started.elapsed().as_millis() as u64;
        self.failed_fragments.sort_by(|a, b| {
            a.conversation_id
                .cmp(&b.conversation_id)
                .then(a.fragment_index.cmp(&b.fragment_index))
        });

        let report = RunReport {
            run_id: self.run_id,
            agent: self.agent,
            state: self.state,
            started_at: self.started_at,
            finished_at: Utc::now(),
            counts: self.counts,
            provider_calls: self.provider_calls,
            shards: self.shards,
            timings: self.timings,
            failed_fragments: self.failed_fragments,
            cancellation: self.cancellation,
        };
        info!(
            run_id = %report.run_id,
            state = %report.state,
            succeeded = report.counts.fragments_succeeded,
            failed = report.counts.fragments_failed,
            created = report.shards.created,
            merged = report.shards.merged,
            total_ms = report.timings.total_ms,
            "🏁 运行结束"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::token::{TokenCounter, WordTokenCounter};
    use crate::conversation::{Message, Role};
    use crate::error::ProviderError;
    use crate::memory::{GraphStore, InMemoryGraphStore};
    use crate::pipeline::progress::FragmentStatus;
    use crate::testing::{FlakyGraphStore, MockEmbedder, MockSummarizer, RecordingProgress};
    use std::time::Duration;

    fn words(marker: &str, n: usize) -> String {
        let mut text = marker.to_string();
        for _ in 1..n {
            text.push_str(" w");
        }
        text
    }

    /// 每条消息 30 个词，预算 50 时每条消息单独成片
    fn five_part_conversation(id: &str, title: &str) -> Conversation {
        let mut convo = Conversation::new(id, title);
        for (i, marker) in ["one", "two", "three", "four", "five"].iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            convo.push(role, words(marker, 30));
        }
        convo
    }

    fn shared_exchange(id: &str, title: &str) -> Conversation {
        Conversation::new(id, title).with_messages(vec![
            Message::user("How do I share state between tasks?", 0),
            Message::assistant("Wrap it in an Arc and a Mutex.", 1),
            Message::user("Thanks, that works.", 2),
        ])
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .max_tokens_per_fragment(50)
            .worker_pool_size(4)
            .retry_max_attempts(3)
            .retry_backoff_base_ms(1)
    }

    fn orchestrator(
        config: PipelineConfig,
        summarizer: Arc<MockSummarizer>,
        store: Arc<dyn GraphStore>,
        progress: Arc<RecordingProgress>,
    ) -> PipelineOrchestrator {
        let registry = PipelineRegistry::new(summarizer, Arc::new(MockEmbedder::new(8)), store)
            .with_progress(progress)
            .with_token_counter(Arc::new(WordTokenCounter::default()));
        PipelineOrchestrator::new(config, registry)
    }

    #[tokio::test]
    async fn test_small_conversation_single_fragment() {
        let store = Arc::new(InMemoryGraphStore::new());
        let progress = Arc::new(RecordingProgress::new());
        let summarizer = Arc::new(MockSummarizer::new());
        let o = orchestrator(
            config().max_tokens_per_fragment(100),
            summarizer.clone(),
            store.clone(),
            progress.clone(),
        );

        let report = o.run_to_completion(&[shared_exchange("c1", "Shared state")]).await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.counts.fragments, 1);
        assert_eq!(report.counts.fragments_succeeded, 1);
        assert_eq!(report.shards.created, 1);
        assert!(!report.failed_overall());
        assert_eq!(summarizer.call_count(), 1);

        let shards = store.list().await.unwrap();
        assert_eq!(shards[0].links[0].fragment_name, "Shared_state_01");
        assert_eq!(shards[0].links[0].agent, "kairix");
        assert_eq!(progress.events().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_exchange_persisted_once() {
        let store = Arc::new(InMemoryGraphStore::new());
        let summarizer = Arc::new(MockSummarizer::new().with_delay(Duration::from_millis(10)));
        let o = orchestrator(
            config().max_tokens_per_fragment(100),
            summarizer.clone(),
            store.clone(),
            Arc::new(RecordingProgress::new()),
        );

        let report = o
            .run_to_completion(&[shared_exchange("a", "First"), shared_exchange("b", "Second")])
            .await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.counts.fragments_succeeded, 2);
        assert_eq!(report.shards.created, 1);
        assert_eq!(report.shards.merged, 1);
        assert_eq!(report.provider_calls.summarizer, 1);
        assert_eq!(summarizer.call_count(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.shards, 1);
        assert_eq!(stats.summaries_created, 1);
        assert_eq!(stats.embeddings_created, 1);
        assert_eq!(stats.links, 2);

        let shard = &store.list().await.unwrap()[0];
        let owners: Vec<&str> = shard
            .ordered_links()
            .iter()
            .map(|l| l.conversation_id.as_str())
            .collect();
        assert_eq!(owners, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_transient_errors_then_success_counts_calls() {
        let summarizer = Arc::new(
            MockSummarizer::new()
                .with_transient_error("429")
                .with_transient_error("503")
                .with_response("finally"),
        );
        let o = orchestrator(
            config().max_tokens_per_fragment(100).worker_pool_size(1),
            summarizer.clone(),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );

        let report = o.run_to_completion(&[shared_exchange("c1", "Retry")]).await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.provider_calls.summarizer, 3);
        assert_eq!(summarizer.call_count(), 3);
    }

    #[tokio::test]
    async fn test_always_failing_summarizer_fails_fragment_only() {
        let summarizer = Arc::new(MockSummarizer::new().fail_when_contains(
            "two",
            ProviderError::transient("mock-summarizer", "timeout"),
        ));
        let progress = Arc::new(RecordingProgress::new());
        let o = orchestrator(
            config(),
            summarizer.clone(),
            Arc::new(InMemoryGraphStore::new()),
            progress.clone(),
        );

        let report = o
            .run_to_completion(&[five_part_conversation("c1", "Partial")])
            .await;

        assert_eq!(report.state, RunState::CompletedWithErrors);
        assert_eq!(report.counts.fragments, 5);
        assert_eq!(report.counts.fragments_succeeded, 4);
        assert_eq!(report.failed_names(), vec!["Partial_02"]);
        assert_eq!(report.failed_fragments[0].kind, FailureKind::RetriesExhausted);
        assert!(!report.failed_overall());
        // 失败片段：1 次 + 3 次重试；其余 4 个片段各 1 次
        assert_eq!(report.provider_calls.summarizer, 4 + 4);
        assert_eq!(progress.count(FragmentStatus::Failed), 1);
        assert_eq!(progress.count(FragmentStatus::Completed), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_of_fragment_two_is_isolated() {
        let summarizer = Arc::new(
            MockSummarizer::new()
                .fail_when_contains("two", ProviderError::fatal("mock-summarizer", "rejected")),
        );
        let store = Arc::new(InMemoryGraphStore::new());
        let o = orchestrator(
            config(),
            summarizer.clone(),
            store.clone(),
            Arc::new(RecordingProgress::new()),
        );

        let report = o
            .run_to_completion(&[five_part_conversation("c1", "Isolated")])
            .await;

        assert_eq!(report.failed_names(), vec!["Isolated_02"]);
        assert_eq!(report.failed_fragments[0].kind, FailureKind::ProviderFatal);
        assert_eq!(report.failed_fragments[0].fragment_index, 2);
        assert_eq!(summarizer.call_count(), 5);

        let mut indices: Vec<usize> = store
            .list()
            .await
            .unwrap()
            .iter()
            .flat_map(|s| s.links.iter().map(|l| l.fragment_index))
            .collect();
        indices.sort();
        assert_eq!(indices, vec![1, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_nothing_succeeding_is_failed_overall() {
        let summarizer = Arc::new(
            MockSummarizer::new().always_fail(ProviderError::fatal("mock-summarizer", "down")),
        );
        let o = orchestrator(
            config(),
            summarizer,
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );

        let report = o
            .run_to_completion(&[five_part_conversation("c1", "Down")])
            .await;
        assert_eq!(report.state, RunState::CompletedWithErrors);
        assert_eq!(report.counts.fragments_failed, 5);
        assert!(report.failed_overall());
    }

    #[tokio::test]
    async fn test_second_run_only_merges() {
        let store = Arc::new(InMemoryGraphStore::new());
        let summarizer = Arc::new(MockSummarizer::new());
        let o = orchestrator(
            config(),
            summarizer.clone(),
            store.clone(),
            Arc::new(RecordingProgress::new()),
        );
        let input = [
            five_part_conversation("c1", "Idempotent"),
            shared_exchange("c2", "Exchange"),
        ];

        let first = o.run_to_completion(&input).await;
        let after_first = store.stats().await.unwrap();
        let calls_after_first = summarizer.call_count();
        let mut hashes_first: Vec<String> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|s| s.content_hash.to_string())
            .collect();
        hashes_first.sort();

        let second = o.run_to_completion(&input).await;
        let after_second = store.stats().await.unwrap();
        let mut hashes_second: Vec<String> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|s| s.content_hash.to_string())
            .collect();
        hashes_second.sort();

        assert_eq!(first.state, RunState::Completed);
        assert_eq!(second.state, RunState::Completed);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(second.shards.created, 0);
        assert_eq!(second.shards.merged, first.counts.fragments_succeeded);
        assert_eq!(second.shards.links_added, 0);
        assert_eq!(hashes_first, hashes_second);
        assert_eq!(after_second.summaries_created, after_first.summaries_created);
        assert_eq!(after_second.embeddings_created, after_first.embeddings_created);
        assert_eq!(after_second.links, after_first.links);
        // 已持久化的结果直接复用，不再调用外部服务
        assert_eq!(summarizer.call_count(), calls_after_first);
        assert_eq!(second.provider_calls.summarizer, 0);
    }

    #[tokio::test]
    async fn test_second_run_without_store_lookup_still_merges() {
        let store = Arc::new(InMemoryGraphStore::new());
        let summarizer = Arc::new(MockSummarizer::new());
        let o = orchestrator(
            config().consult_store(false),
            summarizer.clone(),
            store.clone(),
            Arc::new(RecordingProgress::new()),
        );
        let input = [five_part_conversation("c1", "No lookup")];

        o.run_to_completion(&input).await;
        let second = o.run_to_completion(&input).await;

        assert_eq!(second.shards.created, 0);
        assert_eq!(second.shards.merged, 5);
        assert_eq!(summarizer.call_count(), 10);
        assert_eq!(store.stats().await.unwrap().summaries_created, 5);
    }

    #[tokio::test]
    async fn test_all_conversations_invalid_fails_run() {
        let bad = Conversation::new("bad", "Bad order")
            .with_messages(vec![Message::user("b", 2), Message::assistant("a", 1)]);
        let o = orchestrator(
            config(),
            Arc::new(MockSummarizer::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );

        let report = o.run_to_completion(&[bad]).await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failed_overall());
        assert_eq!(report.counts.conversations_rejected, 1);
        assert_eq!(report.failed_fragments[0].kind, FailureKind::Validation);
        assert_eq!(report.failed_fragments[0].fragment_name, "Bad_order");
    }

    #[tokio::test]
    async fn test_invalid_conversation_does_not_stop_others() {
        let bad = Conversation::new("bad", "Bad").with_messages(vec![
            Message::user("b", 2),
            Message::assistant("a", 1),
        ]);
        let o = orchestrator(
            config().max_tokens_per_fragment(100),
            Arc::new(MockSummarizer::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );

        let report = o
            .run_to_completion(&[bad, shared_exchange("good", "Good")])
            .await;
        assert_eq!(report.state, RunState::CompletedWithErrors);
        assert_eq!(report.counts.fragments_succeeded, 1);
        assert!(!report.failed_overall());
    }

    fn roleless_export(id: &str, title: &str) -> RejectedExport {
        RejectedExport {
            conversation_id: id.to_string(),
            title: title.to_string(),
            error: ValidationError::MissingRole { sequence: 0 },
        }
    }

    #[tokio::test]
    async fn test_export_rejections_alone_fail_the_run() {
        let summarizer = Arc::new(MockSummarizer::new());
        let o = orchestrator(
            config(),
            summarizer.clone(),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );

        let report = o
            .run_with_rejections(
                &[],
                &[roleless_export("export::Broken", "Broken author")],
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failed_overall());
        assert_eq!(report.counts.conversations, 1);
        assert_eq!(report.counts.conversations_rejected, 1);
        assert_eq!(report.failed_fragments.len(), 1);
        let failed = &report.failed_fragments[0];
        assert_eq!(failed.conversation_id, "export::Broken");
        assert_eq!(failed.fragment_name, "Broken_author");
        assert_eq!(failed.kind, FailureKind::Validation);
        assert_eq!(summarizer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_export_rejection_alongside_valid_conversation() {
        let o = orchestrator(
            config().max_tokens_per_fragment(100),
            Arc::new(MockSummarizer::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );

        let report = o
            .run_with_rejections(
                &[shared_exchange("good", "Good")],
                &[roleless_export("export::Broken", "Broken author")],
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.state, RunState::CompletedWithErrors);
        assert!(!report.failed_overall());
        assert_eq!(report.counts.conversations, 2);
        assert_eq!(report.counts.conversations_rejected, 1);
        assert_eq!(report.counts.fragments_succeeded, 1);
        assert!(
            report
                .failed_fragments
                .iter()
                .any(|f| f.conversation_id == "export::Broken" && f.kind == FailureKind::Validation)
        );
    }

    #[tokio::test]
    async fn test_unsplittable_message_recorded_as_chunking_failure() {
        struct Heavy;
        impl TokenCounter for Heavy {
            fn count(&self, text: &str) -> usize {
                if text.contains('!') { 1_000 } else { 1 }
            }
        }

        let mut convo = Conversation::new("c1", "Heavy");
        convo.push(Role::User, "fine");
        convo.push(Role::Assistant, "!!!");
        let progress = Arc::new(RecordingProgress::new());
        let registry = PipelineRegistry::new(
            Arc::new(MockSummarizer::new()),
            Arc::new(MockEmbedder::new(4)),
            Arc::new(InMemoryGraphStore::new()),
        )
        .with_progress(progress.clone())
        .with_token_counter(Arc::new(Heavy));
        let o = PipelineOrchestrator::new(config().max_tokens_per_fragment(10), registry);

        let report = o.run_to_completion(&[convo]).await;
        assert_eq!(report.state, RunState::CompletedWithErrors);
        assert_eq!(report.counts.fragments, 2);
        assert_eq!(report.failed_names(), vec!["Heavy_02"]);
        assert_eq!(report.failed_fragments[0].kind, FailureKind::Chunking);
        assert_eq!(progress.count(FragmentStatus::Failed), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_fragment() {
        let store = Arc::new(FlakyGraphStore::new(InMemoryGraphStore::new()).always_fail());
        let o = orchestrator(
            config().max_tokens_per_fragment(100).retry_max_attempts(1),
            Arc::new(MockSummarizer::new()),
            store.clone(),
            Arc::new(RecordingProgress::new()),
        );

        let report = o.run_to_completion(&[shared_exchange("c1", "Store down")]).await;
        assert_eq!(report.failed_fragments[0].kind, FailureKind::Persistence);
        assert_eq!(report.provider_calls.store_writes, 2);
        assert_eq!(store.upsert_calls(), 2);
        assert!(report.failed_overall());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_dispatches_nothing() {
        let summarizer = Arc::new(MockSummarizer::new());
        let o = orchestrator(
            config(),
            summarizer.clone(),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = o
            .run(&[five_part_conversation("c1", "Cancelled")], cancel)
            .await;
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.counts.fragments_dispatched, 0);
        assert_eq!(report.counts.fragments_skipped, 5);
        let point = report.cancellation.unwrap();
        assert_eq!(point.remaining, 5);
        assert_eq!(point.last_dispatched, None);
        assert_eq!(summarizer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_dispatch() {
        let cancel = CancellationToken::new();
        let progress = Arc::new(RecordingProgress::new().cancel_after(1, cancel.clone()));
        let summarizer = Arc::new(MockSummarizer::new());
        let o = orchestrator(
            config().worker_pool_size(1),
            summarizer.clone(),
            Arc::new(InMemoryGraphStore::new()),
            progress.clone(),
        );

        let report = o
            .run(&[five_part_conversation("c1", "Midway")], cancel)
            .await;

        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.counts.fragments_succeeded, 1);
        assert_eq!(summarizer.call_count(), 1);
        let point = report.cancellation.unwrap();
        assert_eq!(point.dispatched, 1);
        assert_eq!(point.remaining, 4);
        assert_eq!(point.last_dispatched.as_deref(), Some("Midway_01"));
        assert_eq!(progress.events().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_completes() {
        let o = orchestrator(
            config(),
            Arc::new(MockSummarizer::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(RecordingProgress::new()),
        );
        let report = o.run_to_completion(&[]).await;
        assert_eq!(report.state, RunState::Completed);
        assert!(!report.failed_overall());

        let report = o
            .run_to_completion(&[Conversation::new("c1", "Empty")])
            .await;
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.counts.fragments, 0);
    }
}
