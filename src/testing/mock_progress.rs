use crate::pipeline::{FragmentStatus, ProgressEvent, ProgressSink};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// 记录所有进度事件；可在收到第 N 个事件后触发取消
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// 收到 `n` 个事件后取消 `token`
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, status: FragmentStatus) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.status == status)
            .count()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn notify(&self, event: ProgressEvent) {
        let seen = {
            let mut events = self.events.lock().unwrap();
            events.push(event);
            events.len()
        };
        if let Some((n, token)) = &self.cancel_after
            && seen >= *n
        {
            token.cancel();
        }
    }
}
