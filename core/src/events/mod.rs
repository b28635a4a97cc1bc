//! 状态变更广播
//!
//! 每次成功落盘后，向所有订阅者推送完整的新文档。

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::model::{BackendState, Task};

/// 默认广播缓冲容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// 后端事件
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// 全局状态已保存
    State(Box<BackendState>),
    /// 某个任务已保存
    Task { task_id: String, state: Box<Task> },
}

impl BackendEvent {
    /// SSE 事件名
    pub fn name(&self) -> &'static str {
        match self {
            BackendEvent::State(_) => "state",
            BackendEvent::Task { .. } => "task",
        }
    }

    /// SSE 数据体
    pub fn payload(&self) -> Value {
        match self {
            BackendEvent::State(state) => serde_json::to_value(state).unwrap_or(Value::Null),
            BackendEvent::Task { task_id, state } => json!({
                "taskId": task_id,
                "state": serde_json::to_value(state).unwrap_or(Value::Null),
            }),
        }
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackendEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.tx.subscribe()
    }

    /// 发布事件；没有订阅者时静默丢弃
    pub fn publish(&self, event: BackendEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_task(&self, task_id: &str, task: &Task) {
        self.publish(BackendEvent::Task {
            task_id: task_id.to_string(),
            state: Box::new(task.clone()),
        });
    }

    pub fn publish_state(&self, state: &BackendState) {
        self.publish(BackendEvent::State(Box::new(state.clone())));
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_event_payload() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish_task("t1", &Task::default());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "task");
        let payload = event.payload();
        assert_eq!(payload["taskId"], "t1");
        assert_eq!(payload["state"]["concurrency"], 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish_state(&BackendState::default());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
