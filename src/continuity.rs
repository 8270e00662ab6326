//! 시퀀스 연속성 피더
//!
//! 시퀀스 번호가 붙은 패킷을 순서대로 한 번씩만 핸들러에 전달한다.
//! - 지난 시퀀스/중복: 버림
//! - 앞선 시퀀스: 잠시 보관하고 누락 패킷을 기다림
//! - 대기 시간 초과: 누락분을 손실로 세고 건너뜀
//!
//! 여러 스트림(주/보조 회선)이 하나의 피더를 공유할 수 있다.
//! 핸들러는 내부 잠금을 잡은 채 호출되므로 한 번에 하나만 실행된다.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::FeederConfig;
use crate::stats::ContinuityStats;
use crate::timer::{CancellableTimer, TimerGen};

/// 전달 정보. 핸들러가 다음 기대 시퀀스를 바꿀 수 있다.
#[derive(Debug)]
pub struct Delivery {
    seq: u64,
    expected: u64,
    next_seq: u64,
}

impl Delivery {
    /// 전달되는 패킷의 시퀀스
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 전달 직전의 기대 시퀀스 (0: 첫 패킷)
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// 기대 시퀀스와의 차이 (강제 진행 시 건너뛴 수)
    pub fn gap(&self) -> u64 {
        if self.expected == 0 {
            0
        } else {
            self.seq.saturating_sub(self.expected)
        }
    }

    /// 패킷 하나가 여러 시퀀스를 차지하는 경우 등
    pub fn set_next_seq(&mut self, next_seq: u64) {
        self.next_seq = next_seq;
    }
}

/// 패킷 처리 핸들러
pub trait ContinuityHandler: Send + 'static {
    /// 순서대로 정리된 패킷
    fn on_received(&mut self, pk: &[u8], delivery: &mut Delivery);

    /// 중복이나 이미 지난 시퀀스로 버려진 패킷
    fn on_dropped(&mut self, _pk: &[u8], _seq: u64) {}
}

/// 잠금으로 보호되는 피더 상태
pub struct PkPendings<H> {
    next_seq: u64,
    received: u64,
    dropped: u64,
    lost: u64,
    pendings: BTreeMap<u64, Bytes>,
    handler: H,
}

impl<H: ContinuityHandler> PkPendings<H> {
    fn new(handler: H) -> Self {
        Self {
            next_seq: 0,
            received: 0,
            dropped: 0,
            lost: 0,
            pendings: BTreeMap::new(),
            handler,
        }
    }

    fn deliver(&mut self, pk: &[u8], seq: u64, expected: u64) {
        let mut delivery = Delivery {
            seq,
            expected,
            next_seq: seq.saturating_add(1),
        };
        self.handler.on_received(pk, &mut delivery);
        self.received += 1;
        self.next_seq = self.next_seq.max(delivery.next_seq);
    }

    fn drop_packet(&mut self, pk: &[u8], seq: u64) {
        self.dropped += 1;
        self.handler.on_dropped(pk, seq);
    }

    /// 이어지는 보관 패킷 전달
    fn drain_contiguous(&mut self) {
        while let Some(entry) = self.pendings.first_entry() {
            let seq = *entry.key();
            if seq > self.next_seq {
                break;
            }
            let pk = entry.remove();
            if seq < self.next_seq {
                self.drop_packet(&pk, seq);
            } else {
                self.deliver(&pk, seq, seq);
            }
        }
    }

    /// 누락 시퀀스를 포기하고 가장 앞선 보관 패킷부터 전달
    fn force_advance(&mut self) {
        let Some((seq, pk)) = self.pendings.pop_first() else {
            return;
        };
        let expected = self.next_seq;
        if seq < expected {
            self.drop_packet(&pk, seq);
        } else {
            let gap = seq - expected;
            self.lost += gap;
            warn!(
                "시퀀스 누락: expected={}, seq={}, lost={} (누적 {})",
                expected, seq, gap, self.lost
            );
            self.next_seq = seq;
            self.deliver(&pk, seq, expected);
        }
        self.drain_contiguous();
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn stats(&self) -> ContinuityStats {
        ContinuityStats {
            received: self.received,
            dropped: self.dropped,
            lost: self.lost,
            pending: self.pendings.len(),
            next_seq: self.next_seq,
        }
    }
}

/// `ContinuityFeeder::lock()` 반환값. 잠금이 풀리기 전까지만 상태에 접근할 수 있다.
pub struct PendingsGuard<'a, H>(MutexGuard<'a, PkPendings<H>>);

impl<H> Deref for PendingsGuard<'_, H> {
    type Target = PkPendings<H>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<H> DerefMut for PendingsGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

struct FeederInner<H> {
    pendings: Mutex<PkPendings<H>>,
    wait_interval: Mutex<Duration>,
    timer: CancellableTimer,
}

impl<H: ContinuityHandler> FeederInner<H> {
    fn arm_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = *self.wait_interval.lock();
        self.timer
            .run_after(interval, move |gen| Self::on_timer(&weak, gen));
    }

    fn on_timer(weak: &Weak<Self>, gen: TimerGen) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut pks = inner.pendings.lock();
        // 잠금을 기다리는 사이 멈추거나 다시 설정된 타이머
        if !inner.timer.is_current(gen) {
            return;
        }
        pks.force_advance();
        if !pks.pendings.is_empty() {
            inner.arm_timer();
        }
    }
}

/// 시퀀스 연속성 피더
pub struct ContinuityFeeder<H: ContinuityHandler> {
    inner: Arc<FeederInner<H>>,
}

impl<H: ContinuityHandler> ContinuityFeeder<H> {
    /// 기본 대기 시간으로 생성
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, FeederConfig::default())
    }

    pub fn with_config(handler: H, config: FeederConfig) -> Self {
        Self {
            inner: Arc::new(FeederInner {
                pendings: Mutex::new(PkPendings::new(handler)),
                wait_interval: Mutex::new(config.wait_interval),
                timer: CancellableTimer::new(),
            }),
        }
    }

    /// 시퀀스 `seq` 패킷 투입
    pub fn feed_packet(&self, pk: &[u8], seq: u64) {
        let mut pks = self.inner.pendings.lock();
        if seq < pks.next_seq {
            pks.drop_packet(pk, seq);
            return;
        }
        if seq == pks.next_seq || pks.next_seq == 0 {
            let expected = pks.next_seq;
            pks.deliver(pk, seq, expected);
            pks.drain_contiguous();
            if pks.pendings.is_empty() {
                self.inner.timer.stop();
            }
            return;
        }
        if let Entry::Vacant(slot) = pks.pendings.entry(seq) {
            slot.insert(Bytes::copy_from_slice(pk));
            debug!("순서 어긋난 패킷 보관: next={}, seq={}", pks.next_seq, seq);
            if !self.inner.timer.is_pending() {
                self.inner.arm_timer();
            }
        }
    }

    /// 상태 초기화 (일일 리셋 등). 대기 타이머도 멈춘다.
    pub fn clear(&self) {
        let mut pks = self.inner.pendings.lock();
        pks.next_seq = 0;
        pks.received = 0;
        pks.dropped = 0;
        pks.lost = 0;
        pks.pendings.clear();
        self.inner.timer.stop();
    }

    pub fn wait_interval(&self) -> Duration {
        *self.inner.wait_interval.lock()
    }

    /// 다음 대기부터 적용
    pub fn set_wait_interval(&self, interval: Duration) {
        *self.inner.wait_interval.lock() = interval;
    }

    /// 상태 잠금
    pub fn lock(&self) -> PendingsGuard<'_, H> {
        PendingsGuard(self.inner.pendings.lock())
    }

    pub fn stats(&self) -> ContinuityStats {
        self.inner.pendings.lock().stats()
    }
}

impl<H: ContinuityHandler> Drop for ContinuityFeeder<H> {
    fn drop(&mut self) {
        self.inner.timer.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        seqs: Vec<u64>,
        gaps: Vec<u64>,
        dropped: Vec<u64>,
    }

    impl ContinuityHandler for Recorder {
        fn on_received(&mut self, _pk: &[u8], delivery: &mut Delivery) {
            self.seqs.push(delivery.seq());
            if delivery.gap() > 0 {
                self.gaps.push(delivery.gap());
            }
        }

        fn on_dropped(&mut self, _pk: &[u8], seq: u64) {
            self.dropped.push(seq);
        }
    }

    fn feeder(wait_ms: u64) -> ContinuityFeeder<Recorder> {
        ContinuityFeeder::with_config(
            Recorder::default(),
            FeederConfig {
                wait_interval: Duration::from_millis(wait_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_in_order_and_duplicates() {
        let feeder = feeder(5);
        for seq in [1, 2, 2, 3, 1] {
            feeder.feed_packet(b"pk", seq);
        }

        let pks = feeder.lock();
        assert_eq!(pks.handler().seqs, vec![1, 2, 3]);
        assert_eq!(pks.handler().dropped, vec![2, 1]);
        assert_eq!(pks.stats().dropped, 2);
        assert_eq!(pks.next_seq(), 4);
    }

    #[tokio::test]
    async fn test_reorder_filled_without_loss() {
        let feeder = feeder(50);
        for seq in [1, 3, 4, 2] {
            feeder.feed_packet(b"pk", seq);
        }

        let stats = feeder.stats();
        assert_eq!(feeder.lock().handler().seqs, vec![1, 2, 3, 4]);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_gap_forced_after_wait() {
        let feeder = feeder(5);
        for seq in [1, 2, 4, 5] {
            feeder.feed_packet(b"pk", seq);
        }
        assert_eq!(feeder.lock().handler().seqs, vec![1, 2]);
        assert_eq!(feeder.stats().pending, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let pks = feeder.lock();
        assert_eq!(pks.handler().seqs, vec![1, 2, 4, 5]);
        assert_eq!(pks.handler().gaps, vec![1]);
        assert_eq!(pks.stats().lost, 1);
        assert_eq!(pks.stats().pending, 0);
        assert_eq!(pks.next_seq(), 6);
    }

    #[tokio::test]
    async fn test_multiple_gaps_rearm() {
        let feeder = feeder(5);
        for seq in [1, 3, 6] {
            feeder.feed_packet(b"pk", seq);
        }

        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = feeder.stats();
        assert_eq!(feeder.lock().handler().seqs, vec![1, 3, 6]);
        assert_eq!(stats.lost, 3);
        assert_eq!(stats.next_seq, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_superseded_timer_fire_does_not_advance() {
        let feeder = feeder(10);
        feeder.feed_packet(b"pk", 1);
        feeder.feed_packet(b"pk", 3);

        {
            // 발화한 타이머가 잠금을 기다리는 동안 타이머를 멈추고 긴 대기로 다시 설정
            let _pks = feeder.lock();
            thread::sleep(Duration::from_millis(60));
            feeder.inner.timer.stop();
            feeder.set_wait_interval(Duration::from_secs(10));
            feeder.inner.arm_timer();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stats = feeder.stats();
        assert_eq!(feeder.lock().handler().seqs, vec![1]);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.lost, 0);
        feeder.clear();
    }

    #[tokio::test]
    async fn test_last_seq_does_not_overflow() {
        let feeder = feeder(5);
        feeder.feed_packet(b"pk", u64::MAX - 1);
        feeder.feed_packet(b"pk", u64::MAX);

        let pks = feeder.lock();
        assert_eq!(pks.handler().seqs, vec![u64::MAX - 1, u64::MAX]);
        assert_eq!(pks.next_seq(), u64::MAX);
    }

    #[tokio::test]
    async fn test_handler_sets_next_seq() {
        struct Batch(Vec<u64>);
        impl ContinuityHandler for Batch {
            fn on_received(&mut self, pk: &[u8], delivery: &mut Delivery) {
                self.0.push(delivery.seq());
                // 첫 바이트 = 패킷에 담긴 시퀀스 개수
                delivery.set_next_seq(delivery.seq() + pk[0] as u64);
            }
        }

        let feeder = ContinuityFeeder::new(Batch(Vec::new()));
        feeder.feed_packet(&[3], 10);
        feeder.feed_packet(&[1], 12);
        feeder.feed_packet(&[1], 13);

        let pks = feeder.lock();
        assert_eq!(pks.handler().0, vec![10, 13]);
        assert_eq!(pks.stats().dropped, 1);
        assert_eq!(pks.next_seq(), 14);
    }

    #[tokio::test]
    async fn test_clear_resets() {
        let feeder = feeder(5);
        feeder.feed_packet(b"pk", 1);
        feeder.feed_packet(b"pk", 5);
        feeder.clear();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(feeder.stats(), ContinuityStats::default());
        feeder.feed_packet(b"pk", 1);
        assert_eq!(feeder.lock().handler().seqs, vec![1, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_redundant_feeds_from_threads() {
        let feeder = Arc::new(feeder(5));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let feeder = feeder.clone();
                thread::spawn(move || {
                    for seq in 1..=1000u64 {
                        feeder.feed_packet(&seq.to_be_bytes(), seq);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let pks = feeder.lock();
        let seqs = &pks.handler().seqs;
        assert_eq!(seqs.len(), 1000);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(pks.stats().dropped, 1000);
        assert_eq!(pks.stats().lost, 0);
    }
}
