//! 패킷 프레이머
//!
//! 바이트 스트림에서 패킷을 잘라낸다.
//!
//! ```text
//! +--------+------------------+-----------+--------+------+------+
//! | leader | header (길이 포함) |   body    | chksum | 0x0D | 0x0A |
//! +--------+------------------+-----------+--------+------+------+
//! ```
//!
//! 체크섬: leader 다음 바이트부터 체크섬 바이트까지 XOR 하면 0

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::stats::FramerStats;
use crate::{Error, Result};

/// 패킷 트레일러
pub const TRAILER: [u8; 2] = [0x0D, 0x0A];

/// 패킷 헤더 형식
pub trait PacketLayout {
    /// 패킷 시작 바이트
    const LEADER: u8;

    /// 길이를 알아내는 데 필요한 헤더 크기 (leader 포함)
    const HEAD_SIZE: usize;

    /// 이 크기 이상의 길이는 잘못된 헤더로 본다
    const MAX_PACKET_SIZE: usize;

    /// 헤더에서 패킷 전체 길이 (leader ~ trailer)
    fn packet_size(head: &[u8]) -> usize;
}

/// XOR 체크섬
pub fn check_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// 기본 헤더 형식: leader `0x1B` + 2바이트 big-endian 전체 길이
#[derive(Debug, Clone, Copy, Default)]
pub struct StdLayout;

impl PacketLayout for StdLayout {
    const LEADER: u8 = 0x1B;
    const HEAD_SIZE: usize = 3;
    const MAX_PACKET_SIZE: usize = 8 * 1024;

    fn packet_size(head: &[u8]) -> usize {
        u16::from_be_bytes([head[1], head[2]]) as usize
    }
}

impl StdLayout {
    /// 패킷 헤더 + 체크섬 + 트레일러를 붙인다
    pub fn encode(body: &[u8]) -> Result<Bytes> {
        let size = Self::HEAD_SIZE + body.len() + 1 + TRAILER.len();
        if size >= Self::MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge {
                size,
                max: Self::MAX_PACKET_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(Self::LEADER);
        buf.put_u16(size as u16);
        buf.put_slice(body);
        let chk = check_sum(&buf[1..]);
        buf.put_u8(chk);
        buf.put_slice(&TRAILER);
        Ok(buf.freeze())
    }

    /// 패킷의 body 부분
    pub fn body(pk: &[u8]) -> &[u8] {
        let end = pk.len().saturating_sub(1 + TRAILER.len());
        pk.get(Self::HEAD_SIZE..end).unwrap_or(&[])
    }
}

/// 패킷 프레이머
///
/// 스트림(TCP) 모드는 남은 바이트를 다음 수신까지 보관하고,
/// 데이터그램 모드는 버린다.
pub struct PacketFramer<L: PacketLayout> {
    is_dgram: bool,
    received: u64,
    chk_sum_err: u64,
    dropped_bytes: u64,
    _layout: PhantomData<L>,
}

impl<L: PacketLayout> PacketFramer<L> {
    /// 스트림 모드 프레이머
    pub fn new() -> Self {
        Self {
            is_dgram: false,
            received: 0,
            chk_sum_err: 0,
            dropped_bytes: 0,
            _layout: PhantomData,
        }
    }

    /// 데이터그램 모드 프레이머
    pub fn new_dgram() -> Self {
        Self {
            is_dgram: true,
            ..Self::new()
        }
    }

    pub fn is_dgram(&self) -> bool {
        self.is_dgram
    }

    /// 버퍼에서 완성된 패킷을 모두 꺼내 `on_packet`에 전달
    ///
    /// `on_packet`이 false 를 반환하면 해당 패킷은 소비된 채 중단하고 false 반환
    pub fn feed_buffer<F>(&mut self, rxbuf: &mut BytesMut, mut on_packet: F) -> bool
    where
        F: FnMut(&[u8]) -> bool,
    {
        while rxbuf.len() >= L::HEAD_SIZE {
            if rxbuf[0] == L::LEADER {
                let pksz = L::packet_size(&rxbuf[..L::HEAD_SIZE]);
                if L::HEAD_SIZE + TRAILER.len() <= pksz && pksz < L::MAX_PACKET_SIZE {
                    if rxbuf.len() < pksz {
                        break;
                    }
                    if rxbuf[pksz - 2..pksz] == TRAILER {
                        if check_sum(&rxbuf[1..pksz - 2]) == 0 {
                            self.received += 1;
                            let keep_going = on_packet(&rxbuf[..pksz]);
                            rxbuf.advance(pksz);
                            if !keep_going {
                                return false;
                            }
                        } else {
                            self.chk_sum_err += 1;
                            rxbuf.advance(pksz);
                        }
                        continue;
                    }
                }
                // 잘못된 길이/트레일러: leader 하나 버리고 다시 찾는다
                rxbuf.advance(1);
                self.dropped_bytes += 1;
            }

            let skip = rxbuf
                .iter()
                .position(|&b| b == L::LEADER)
                .unwrap_or(rxbuf.len());
            rxbuf.advance(skip);
            self.dropped_bytes += skip as u64;
        }

        if self.is_dgram && !rxbuf.is_empty() {
            self.dropped_bytes += rxbuf.len() as u64;
            rxbuf.clear();
        }
        true
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> FramerStats {
        FramerStats {
            received: self.received,
            chk_sum_err: self.chk_sum_err,
            dropped_bytes: self.dropped_bytes,
        }
    }
}

impl<L: PacketLayout> Default for PacketFramer<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut PacketFramer<StdLayout>, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        framer.feed_buffer(buf, |pk| {
            out.push(StdLayout::body(pk).to_vec());
            true
        });
        out
    }

    #[test]
    fn test_good_and_corrupted_packet() {
        let mut framer = PacketFramer::<StdLayout>::new();
        let good = StdLayout::encode(b"hello").unwrap();
        let mut bad = BytesMut::from(&StdLayout::encode(b"world").unwrap()[..]);
        bad[4] ^= 0xFF;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&good);
        buf.extend_from_slice(&bad);

        let out = collect(&mut framer, &mut buf);
        assert_eq!(out, vec![b"hello".to_vec()]);
        assert!(buf.is_empty());

        let stats = framer.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.chk_sum_err, 1);
        assert_eq!(stats.dropped_bytes, 0);
    }

    #[test]
    fn test_partial_packet_waits() {
        let mut framer = PacketFramer::<StdLayout>::new();
        let pk = StdLayout::encode(b"partial").unwrap();

        let mut buf = BytesMut::from(&pk[..5]);
        assert!(collect(&mut framer, &mut buf).is_empty());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&pk[5..]);
        assert_eq!(collect(&mut framer, &mut buf), vec![b"partial".to_vec()]);
        assert_eq!(framer.stats().dropped_bytes, 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut framer = PacketFramer::<StdLayout>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"xyz");
        // leader 뒤 길이가 너무 작은 가짜 헤더
        buf.extend_from_slice(&[StdLayout::LEADER, 0x00, 0x01]);
        buf.extend_from_slice(&StdLayout::encode(b"ok").unwrap());

        assert_eq!(collect(&mut framer, &mut buf), vec![b"ok".to_vec()]);
        assert_eq!(framer.stats().dropped_bytes, 6);
        assert_eq!(framer.stats().received, 1);
    }

    #[test]
    fn test_early_stop() {
        let mut framer = PacketFramer::<StdLayout>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&StdLayout::encode(b"a").unwrap());
        buf.extend_from_slice(&StdLayout::encode(b"b").unwrap());

        let mut count = 0;
        assert!(!framer.feed_buffer(&mut buf, |_| {
            count += 1;
            false
        }));
        assert_eq!(count, 1);
        assert_eq!(buf.len(), StdLayout::encode(b"b").unwrap().len());
    }

    #[test]
    fn test_dgram_discards_leftover() {
        let mut framer = PacketFramer::<StdLayout>::new_dgram();
        let pk = StdLayout::encode(b"dgram").unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&pk);
        buf.extend_from_slice(&pk[..4]);

        assert_eq!(collect(&mut framer, &mut buf), vec![b"dgram".to_vec()]);
        assert!(buf.is_empty());
        assert_eq!(framer.stats().dropped_bytes, 4);
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let max_body = StdLayout::MAX_PACKET_SIZE - StdLayout::HEAD_SIZE - 1 - TRAILER.len() - 1;
        let pk = StdLayout::encode(&vec![0x41; max_body]).unwrap();
        assert_eq!(pk.len(), StdLayout::MAX_PACKET_SIZE - 1);

        let mut framer = PacketFramer::<StdLayout>::new();
        let mut buf = BytesMut::from(&pk[..]);
        assert_eq!(collect(&mut framer, &mut buf).len(), 1);

        assert!(matches!(
            StdLayout::encode(&vec![0x41; max_body + 1]),
            Err(Error::PacketTooLarge { .. })
        ));
    }
}
