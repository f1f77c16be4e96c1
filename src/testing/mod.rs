//! 测试基础设施
//!
//! 提供在不依赖真实摘要 / 向量服务和真实存储的情况下测试管道各组件的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockSummarizer`] | 替代真实摘要服务，可编排成功 / 瞬时错误 / 致命错误序列 |
//! | [`MockEmbedder`] | 替代真实向量服务，按输入生成确定性向量 |
//! | [`FlakyGraphStore`] | 包装任意图存储，让写入按脚本失败 |
//! | [`RecordingProgress`] | 记录进度事件，可在第 N 个事件后触发取消 |
//!
//! # 设计原则
//!
//! - **零网络请求**：所有 Mock 都完全在内存中运行
//! - **可脚本化**：通过 `with_response()` / `with_transient_error()` 精确控制返回值
//! - **可观测**：通过 `call_count()` / `all_calls()` 检查调用情况
//! - **线程安全**：内部使用 `Mutex`，可安全地在多个 worker 间共享
//!
//! # 使用示例
//!
//! ```rust
//! use kairix_synth::prelude::*;
//! use kairix_synth::testing::{MockEmbedder, MockSummarizer};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let summarizer = Arc::new(
//!     MockSummarizer::new()
//!         .with_transient_error("rate limited")
//!         .with_response("一段摘要"),
//! );
//! let registry = PipelineRegistry::new(
//!     summarizer.clone(),
//!     Arc::new(MockEmbedder::new(8)),
//!     Arc::new(InMemoryGraphStore::new()),
//! );
//! let config = PipelineConfig::default().retry_backoff_base_ms(1);
//! let orchestrator = PipelineOrchestrator::new(config, registry);
//!
//! let mut convo = Conversation::new("c1", "Retry demo");
//! convo.push(Role::User, "hello");
//!
//! let report = orchestrator.run_to_completion(&[convo]).await;
//! assert_eq!(report.provider_calls.summarizer, 2);
//! assert_eq!(summarizer.call_count(), 2);
//! # }
//! ```

mod mock_llm;
mod mock_progress;
mod mock_store;

pub use mock_llm::{MockEmbedder, MockSummarizer};
pub use mock_progress::RecordingProgress;
pub use mock_store::FlakyGraphStore;
