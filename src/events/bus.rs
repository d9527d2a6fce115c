//! 事件总线
//!
//! 基于 tokio broadcast 的有界扇出：发布永不阻塞，
//! 订阅方消费过慢时丢弃最旧的事件（`Lagged`）

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

use super::{InstallEvent, ProgressEvent};

/// 进度事件总线
pub type ProgressBus = EventBus<ProgressEvent>;
/// 安装事件总线
pub type InstallBus = EventBus<InstallEvent>;

/// 有界广播总线
#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件（即发即忘）
    ///
    /// 没有订阅者时事件直接丢弃
    pub fn publish(&self, event: T) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventSubscriber<T> {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件订阅者
#[derive(Debug)]
pub struct EventSubscriber<T: Clone> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> EventSubscriber<T> {
    /// 接收下一个事件
    ///
    /// 落后时跳过被覆盖的事件继续接收；总线关闭后返回 None
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    trace!("事件订阅者落后，丢弃了 {} 条事件", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞地取出当前缓冲中的所有事件
    pub fn drain(&mut self) -> Vec<T> {
        use broadcast::error::TryRecvError;

        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_fail() {
        let bus: EventBus<u32> = EventBus::new(4);
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out() {
        let bus: EventBus<u32> = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(7);

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus: EventBus<u32> = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.publish(i);
        }

        // 只保留最新的两条
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_closed_bus_returns_none() {
        let bus: EventBus<u32> = EventBus::new(2);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }
}
