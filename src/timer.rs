//! 재사용 가능한 단일 타이머 슬롯
//!
//! - 장치: 재연결/재시도, 연결 타임아웃, 세션 주기 콜백
//! - 연속성 피더: 누락 패킷 대기
//!
//! 슬롯마다 세대(generation) 번호를 둔다. 다시 설정하거나 멈추면 세대가 바뀌고,
//! 이전 세대의 발화는 버려진다.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// 타이머 세대 번호
pub type TimerGen = u64;

#[derive(Default)]
struct TimerSlot {
    generation: TimerGen,
    armed: bool,
    disposed: bool,
    task: Option<JoinHandle<()>>,
}

/// 취소 가능한 타이머
pub struct CancellableTimer {
    runtime: Option<Handle>,
    slot: Arc<Mutex<TimerSlot>>,
}

impl Default for CancellableTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellableTimer {
    /// 현재 tokio 런타임이 있으면 그 런타임에 묶인다.
    /// 없으면 `run_after()` 호출 시점의 런타임을 사용한다.
    pub fn new() -> Self {
        Self {
            runtime: Handle::try_current().ok(),
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    /// `delay` 후 `f(gen)` 실행. 이미 설정된 타이머는 취소된다.
    ///
    /// 런타임이 없거나 dispose 된 경우 `None`
    pub fn run_after<F>(&self, delay: Duration, f: F) -> Option<TimerGen>
    where
        F: FnOnce(TimerGen) + Send + 'static,
    {
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(h) => h,
            None => {
                warn!("타이머 설정 실패: tokio 런타임 없음");
                return None;
            }
        };

        let mut slot = self.slot.lock();
        if slot.disposed {
            return None;
        }
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.generation += 1;
        slot.armed = true;
        let gen = slot.generation;

        let slot_ref = Arc::clone(&self.slot);
        slot.task = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = slot_ref.lock();
                if slot.generation != gen || slot.disposed {
                    return;
                }
                slot.armed = false;
            }
            f(gen);
        }));
        Some(gen)
    }

    /// 대기 중인 타이머 취소 (기다리지 않음)
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.armed = false;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }

    /// 영구 정지. 이후 `run_after()`는 무시된다.
    pub fn dispose(&self) {
        self.stop();
        self.slot.lock().disposed = true;
    }

    /// 아직 발화하지 않은 타이머가 있는지
    pub fn is_pending(&self) -> bool {
        self.slot.lock().armed
    }

    /// `gen` 이 현재 세대인지 (멈추거나 다시 설정되지 않았는지)
    pub fn is_current(&self, gen: TimerGen) -> bool {
        let slot = self.slot.lock();
        slot.generation == gen && !slot.disposed
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        if let Some(task) = self.slot.lock().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_timer_fires_once() {
        let timer = CancellableTimer::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        let gen = timer
            .run_after(Duration::from_millis(5), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
        assert!(timer.is_current(gen));
    }

    #[tokio::test]
    async fn test_timer_rearm_and_stop() {
        let timer = CancellableTimer::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        let first = timer
            .run_after(Duration::from_millis(20), move |_| {
                h.fetch_add(100, Ordering::SeqCst);
            })
            .unwrap();
        let h = hits.clone();
        timer.run_after(Duration::from_millis(5), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!timer.is_current(first));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        timer.run_after(Duration::from_millis(5), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();
        timer.dispose();
        assert!(timer.run_after(Duration::from_millis(1), |_| {}).is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
