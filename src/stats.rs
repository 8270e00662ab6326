//! 수신/송신 통계
//!
//! 각 구성요소의 카운터 스냅샷. 값 복사본이므로 잠금 없이 출력할 수 있다.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 패킷 프레이머 카운터
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// 정상 패킷 수
    pub received: u64,

    /// 체크섬 오류 패킷 수
    pub chk_sum_err: u64,

    /// 리더 불일치/길이 오류로 버린 바이트 수
    pub dropped_bytes: u64,
}

impl FramerStats {
    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Packets: {} | ChkSumErr: {} | DroppedBytes: {}",
            self.received, self.chk_sum_err, self.dropped_bytes,
        )
    }
}

/// 시퀀스 연속성 카운터
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuityStats {
    /// 핸들러에 전달된 패킷 수
    pub received: u64,

    /// 중복/지난 시퀀스로 버린 패킷 수
    pub dropped: u64,

    /// 끝내 도착하지 않은 시퀀스 수
    pub lost: u64,

    /// 대기 중인 순서 어긋난 패킷 수
    pub pending: usize,

    /// 다음 기대 시퀀스 (0: 아직 기준 없음)
    pub next_seq: u64,
}

impl ContinuityStats {
    /// 손실률 계산
    pub fn loss_rate(&self) -> f64 {
        let total = self.received + self.lost;
        if total == 0 {
            return 0.0;
        }
        self.lost as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "NextSeq: {} | Received: {} | Dropped: {} | Lost: {} ({:.3}%) | Pending: {}",
            self.next_seq,
            self.received,
            self.dropped,
            self.lost,
            self.loss_rate() * 100.0,
            self.pending,
        )
    }
}

/// 링크(소켓) 통계
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// 연결 시각
    pub start_time: Instant,

    /// 총 수신 바이트
    pub rx_bytes: u64,

    /// 총 송신 바이트
    pub tx_bytes: u64,

    /// 최근 수신 기록 (시각, 크기)
    arrivals: VecDeque<(Instant, usize)>,

    /// 윈도우 크기
    window_size: usize,
}

impl LinkStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            start_time: Instant::now(),
            rx_bytes: 0,
            tx_bytes: 0,
            arrivals: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// 수신 기록
    pub fn record_rx(&mut self, size: usize) {
        if self.arrivals.len() >= self.window_size {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back((Instant::now(), size));
        self.rx_bytes += size as u64;
    }

    /// 송신 기록
    pub fn record_tx(&mut self, size: usize) {
        self.tx_bytes += size as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 최근 윈도우 수신 처리율 (bytes/sec)
    pub fn recent_rx_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.arrivals.front(), self.arrivals.back()) else {
            return 0.0;
        };
        let duration = last.0.duration_since(first.0);
        if self.arrivals.len() < 2 || duration.is_zero() {
            return 0.0;
        }
        // 첫 기록은 구간 시작점
        let total: usize = self.arrivals.iter().skip(1).map(|a| a.1).sum();
        total as f64 / duration.as_secs_f64()
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Up: {:.2}s | Rx: {} | Tx: {} | RxRate: {:.2} KB/s",
            self.elapsed().as_secs_f64(),
            self.rx_bytes,
            self.tx_bytes,
            self.recent_rx_rate() / 1_000.0,
        )
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuity_loss_rate() {
        let stats = ContinuityStats {
            received: 99,
            lost: 1,
            ..Default::default()
        };
        assert!((stats.loss_rate() - 0.01).abs() < 1e-9);
        assert!(stats.summary().contains("Lost: 1"));
        assert_eq!(ContinuityStats::default().loss_rate(), 0.0);
    }

    #[test]
    fn test_link_stats_window() {
        let mut stats = LinkStats::new(2);
        stats.record_rx(10);
        stats.record_rx(20);
        stats.record_rx(30);
        stats.record_tx(5);

        assert_eq!(stats.rx_bytes, 60);
        assert_eq!(stats.tx_bytes, 5);
        assert_eq!(stats.arrivals.len(), 2);
    }
}
