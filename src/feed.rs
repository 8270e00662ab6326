//! 시세 수신 세션
//!
//! 수신 바이트 → `PacketFramer` → `ContinuityFeeder` → 핸들러
//!
//! 주/보조 회선처럼 같은 시퀀스를 나르는 여러 장치가 하나의 피더를 공유하면
//! 먼저 도착한 패킷만 전달되고 나머지는 중복으로 버려진다.
//!
//! 데모 패킷 body: `seq (u64 BE) | bincode(QuoteRecord)`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::continuity::{ContinuityFeeder, ContinuityHandler, Delivery};
use crate::device::{DeviceCtl, CELL_SPLIT, ROW_SPLIT};
use crate::framer::{PacketFramer, PacketLayout, StdLayout};
use crate::session::{RecvMode, Session};
use crate::stats::FramerStats;
use crate::{Error, Result};

/// body 앞의 시퀀스 번호 크기
pub const SEQ_SIZE: usize = 8;

/// 패킷에서 시퀀스 번호를 꺼내는 함수
pub type SeqOf = fn(&[u8]) -> Option<u64>;

/// `StdLayout` 패킷의 body 앞 8바이트 시퀀스
pub fn std_seq_of(pk: &[u8]) -> Option<u64> {
    let body = StdLayout::body(pk);
    let seq: [u8; SEQ_SIZE] = body.get(..SEQ_SIZE)?.try_into().ok()?;
    Some(u64::from_be_bytes(seq))
}

/// 데모 시세 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: String,
    /// 가격 (틱 단위 정수)
    pub price: i64,
    pub qty: u32,
    /// 체결 시각 (epoch 마이크로초)
    pub time_us: u64,
}

/// 시퀀스 + 레코드를 패킷으로
pub fn encode_quote_packet(seq: u64, quote: &QuoteRecord) -> Result<Bytes> {
    let payload = bincode::serialize(quote)?;
    let mut body = BytesMut::with_capacity(SEQ_SIZE + payload.len());
    body.put_u64(seq);
    body.put_slice(&payload);
    StdLayout::encode(&body)
}

/// 패킷에서 시퀀스 + 레코드
pub fn decode_quote_packet(pk: &[u8]) -> Result<(u64, QuoteRecord)> {
    let seq = std_seq_of(pk).ok_or_else(|| Error::Unknown("packet too short".into()))?;
    let quote = bincode::deserialize(&StdLayout::body(pk)[SEQ_SIZE..])?;
    Ok((seq, quote))
}

/// 프레이머 + 피더 세션
pub struct FeedSession<L: PacketLayout, H: ContinuityHandler> {
    name: String,
    framer: Mutex<PacketFramer<L>>,
    feeder: Arc<ContinuityFeeder<H>>,
    seq_of: SeqOf,
    no_seq: AtomicU64,
}

impl<L, H> FeedSession<L, H>
where
    L: PacketLayout + Send + 'static,
    H: ContinuityHandler,
{
    pub fn new(name: impl Into<String>, feeder: Arc<ContinuityFeeder<H>>, seq_of: SeqOf) -> Self {
        Self {
            name: name.into(),
            framer: Mutex::new(PacketFramer::new()),
            feeder,
            seq_of,
            no_seq: AtomicU64::new(0),
        }
    }

    pub fn feeder(&self) -> &Arc<ContinuityFeeder<H>> {
        &self.feeder
    }

    pub fn framer_stats(&self) -> FramerStats {
        self.framer.lock().stats()
    }

    /// 시퀀스를 꺼내지 못한 패킷 수
    pub fn no_seq_count(&self) -> u64 {
        self.no_seq.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} | NoSeq: {} | {}",
            self.name,
            self.framer_stats().summary(),
            self.no_seq_count(),
            self.feeder.stats().summary(),
        )
    }
}

impl<L, H> Session for FeedSession<L, H>
where
    L: PacketLayout + Send + 'static,
    H: ContinuityHandler,
{
    fn on_device_link_ready(&self, dev: &mut dyn DeviceCtl) -> RecvMode {
        info!("[{}] 수신 시작: {}", self.name, dev.device_id());
        RecvMode::Recv
    }

    fn on_device_recv(&self, _dev: &mut dyn DeviceCtl, rxbuf: &mut BytesMut) {
        let mut framer = self.framer.lock();
        framer.feed_buffer(rxbuf, |pk| {
            match (self.seq_of)(pk) {
                Some(seq) => self.feeder.feed_packet(pk, seq),
                None => {
                    self.no_seq.fetch_add(1, Ordering::Relaxed);
                }
            }
            true
        });
    }

    fn session_command(&self, _dev: &mut dyn DeviceCtl, cmdln: &str) -> String {
        match cmdln.trim() {
            "?" => format!(
                "stats{c}Framer/continuity statistics{r}clear{c}Reset continuity (daily)",
                c = CELL_SPLIT,
                r = ROW_SPLIT
            ),
            "stats" => self.summary(),
            "clear" => {
                self.feeder.clear();
                debug!("[{}] 연속성 초기화", self.name);
                String::new()
            }
            _ => "unknown session command".to_string(),
        }
    }
}

/// 데모 레코드 핸들러: 디코딩 후 콜백
pub struct QuoteHandler<F> {
    on_quote: F,
    decode_errors: u64,
}

impl<F> QuoteHandler<F>
where
    F: FnMut(u64, QuoteRecord) + Send + 'static,
{
    pub fn new(on_quote: F) -> Self {
        Self {
            on_quote,
            decode_errors: 0,
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }
}

impl<F> ContinuityHandler for QuoteHandler<F>
where
    F: FnMut(u64, QuoteRecord) + Send + 'static,
{
    fn on_received(&mut self, pk: &[u8], delivery: &mut Delivery) {
        if delivery.gap() > 0 {
            info!(
                "시퀀스 건너뜀: {} -> {} ({}개 누락)",
                delivery.expected(),
                delivery.seq(),
                delivery.gap()
            );
        }
        match decode_quote_packet(pk) {
            Ok((seq, quote)) => (self.on_quote)(seq, quote),
            Err(e) => {
                self.decode_errors += 1;
                debug!("레코드 디코딩 실패: seq={}, {}", delivery.seq(), e);
            }
        }
    }
}
