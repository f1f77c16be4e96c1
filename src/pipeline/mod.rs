//! 管道编排
//!
//! [`PipelineOrchestrator`] 对每条对话调用一次分片器，把片段交给固定大小的 worker 池，
//! 每个 worker 依次执行 摘要 → 向量 → 写入，结果经 channel 汇总成 [`RunReport`]。
//!
//! 所有外部依赖都放在 [`PipelineRegistry`] 里，在构造时注入；
//! 同一进程内可以用不同的配置与依赖并行跑多次。
//!
//! ```rust
//! use kairix_synth::prelude::*;
//! use kairix_synth::testing::{MockEmbedder, MockSummarizer};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = PipelineRegistry::new(
//!     Arc::new(MockSummarizer::new()),
//!     Arc::new(MockEmbedder::new(8)),
//!     Arc::new(InMemoryGraphStore::new()),
//! );
//! let orchestrator = PipelineOrchestrator::new(PipelineConfig::default(), registry);
//!
//! let mut convo = Conversation::new("c1", "Rust ownership");
//! convo.push(Role::User, "Who owns this value?");
//! convo.push(Role::Assistant, "Exactly one binding at a time.");
//!
//! let report = orchestrator.run_to_completion(&[convo]).await;
//! assert_eq!(report.state, RunState::Completed);
//! # }
//! ```

pub mod orchestrator;
pub mod progress;
pub mod report;

use crate::chunking::token::{CharEstimateCounter, TokenCounter};
use crate::llm::{Embedder, Summarizer};
use crate::memory::GraphStore;
use std::sync::Arc;

pub use orchestrator::PipelineOrchestrator;
pub use progress::{ChannelProgress, FragmentStatus, ProgressEvent, ProgressSink, TracingProgress};
pub use report::{
    CancellationPoint, FailedFragment, ProviderCalls, RunCounts, RunReport, RunState, RunTimings,
    ShardCounts,
};

/// 一次运行用到的全部外部依赖
#[derive(Clone)]
pub struct PipelineRegistry {
    pub(crate) summarizer: Arc<dyn Summarizer>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) progress: Arc<dyn ProgressSink>,
    pub(crate) token_counter: Arc<dyn TokenCounter>,
}

impl PipelineRegistry {
    /// 进度默认写日志，token 默认按字符估算
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            summarizer,
            embedder,
            store,
            progress: Arc::new(TracingProgress),
            token_counter: Arc::new(CharEstimateCounter::default()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }
}
