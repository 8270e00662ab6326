//! 송신 버퍼
//!
//! 한 번에 하나의 쓰기만 진행된다. 쓰는 중에 들어온 데이터는 대기 큐에 쌓이고,
//! 쓰기가 끝나면 진행 큐로 옮겨진다.
//!
//! 장치 op 컨텍스트의 `&mut` 접근이 곧 잠금이다.

use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, Bytes};
use tracing::warn;

/// 송신 큐
pub type SendQueue = VecDeque<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// 진행 중인 쓰기 없음
    Empty,
    /// 쓰기 진행 중
    Sending,
}

/// 송신 버퍼
#[derive(Debug)]
pub struct SendBuffer {
    status: SendStatus,
    sending: SendQueue,
    queue: SendQueue,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            status: SendStatus::Empty,
            sending: SendQueue::new(),
            queue: SendQueue::new(),
        }
    }

    pub fn status(&self) -> SendStatus {
        self.status
    }

    pub fn is_empty(&self) -> bool {
        self.status == SendStatus::Empty
    }

    /// `Empty → Sending` 전환. 바로 써야 할 진행 큐를 반환한다.
    ///
    /// 이미 쓰는 중이면 `None`: 호출측은 `queue_for_push()`에 넣어야 한다.
    pub fn to_sending(&mut self) -> Option<&mut SendQueue> {
        if self.status == SendStatus::Sending {
            return None;
        }
        self.status = SendStatus::Sending;
        Some(&mut self.sending)
    }

    /// 쓰는 중에 추가할 대기 큐
    pub fn queue_for_push(&mut self) -> &mut SendQueue {
        debug_assert_eq!(self.status, SendStatus::Sending);
        &mut self.queue
    }

    /// `bytes_sent` 만큼 소비 후 남은 데이터가 있으면 진행 큐, 없으면 `Empty`로 돌아가고 `None`
    pub fn continue_send(&mut self, bytes_sent: usize) -> Option<&mut SendQueue> {
        debug_assert_eq!(self.status, SendStatus::Sending);
        consume(&mut self.sending, bytes_sent);
        self.check_send_queue()
    }

    fn check_send_queue(&mut self) -> Option<&mut SendQueue> {
        self.sending.append(&mut self.queue);
        if self.sending.is_empty() {
            self.status = SendStatus::Empty;
            return None;
        }
        Some(&mut self.sending)
    }

    /// 다음에 쓸 조각
    pub fn front_chunk(&self) -> Option<Bytes> {
        self.sending.front().cloned()
    }

    /// 진행/대기 중인 바이트 수
    pub fn queued_bytes(&self) -> usize {
        self.sending
            .iter()
            .chain(self.queue.iter())
            .map(Bytes::len)
            .sum()
    }

    /// 모든 데이터를 버리고 `Empty`로. 버린 바이트 수 반환
    pub fn force_clear(&mut self, err: &dyn fmt::Display) -> usize {
        let dropped = self.queued_bytes();
        self.sending.clear();
        self.queue.clear();
        self.status = SendStatus::Empty;
        if dropped > 0 {
            warn!("송신 버퍼 강제 비움: {} bytes, 원인={}", dropped, err);
        }
        dropped
    }
}

fn consume(queue: &mut SendQueue, mut n: usize) {
    while n > 0 {
        let Some(front) = queue.front_mut() else {
            break;
        };
        if front.len() <= n {
            n -= front.len();
            queue.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_sending_once() {
        let mut sb = SendBuffer::new();
        sb.to_sending().unwrap().push_back(Bytes::from_static(b"abc"));
        assert!(sb.to_sending().is_none());
        assert!(sb.to_sending().is_none());

        sb.queue_for_push().push_back(Bytes::from_static(b"de"));
        assert_eq!(sb.queued_bytes(), 5);

        assert!(sb.continue_send(3).is_some());
        assert_eq!(sb.front_chunk().unwrap(), Bytes::from_static(b"de"));
        assert!(sb.continue_send(2).is_none());
        assert!(sb.is_empty());

        // Empty 로 돌아온 뒤에는 다시 한 번 얻을 수 있다
        assert!(sb.to_sending().is_some());
        assert!(sb.to_sending().is_none());
    }

    #[test]
    fn test_partial_write() {
        let mut sb = SendBuffer::new();
        let q = sb.to_sending().unwrap();
        q.push_back(Bytes::from_static(b"hello"));
        q.push_back(Bytes::from_static(b"world"));

        sb.continue_send(7);
        assert_eq!(sb.front_chunk().unwrap(), Bytes::from_static(b"rld"));
        assert_eq!(sb.queued_bytes(), 3);
        assert_eq!(sb.status(), SendStatus::Sending);
    }

    #[test]
    fn test_force_clear() {
        let mut sb = SendBuffer::new();
        sb.to_sending().unwrap().push_back(Bytes::from_static(b"1234"));
        sb.queue_for_push().push_back(Bytes::from_static(b"56"));

        assert_eq!(sb.force_clear(&"link broken"), 6);
        assert!(sb.is_empty());
        assert_eq!(sb.queued_bytes(), 0);
        assert!(sb.front_chunk().is_none());
    }
}
