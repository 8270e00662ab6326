//! 수신 경로 성능: 프레이머 → 연속성 피더
//!
//! 정상 경로(연속 시퀀스)와 회선 두 개 병합(중복 절반), 순서 바뀜을 비교한다.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use mdlink::continuity::{ContinuityFeeder, ContinuityHandler, Delivery};
use mdlink::feed::{encode_quote_packet, std_seq_of, QuoteRecord};
use mdlink::framer::{PacketFramer, StdLayout};

struct CountHandler(u64);

impl ContinuityHandler for CountHandler {
    fn on_received(&mut self, pk: &[u8], _delivery: &mut Delivery) {
        self.0 += pk.len() as u64;
    }
}

fn quote_stream(seqs: impl Iterator<Item = u64>) -> BytesMut {
    let mut buf = BytesMut::new();
    for seq in seqs {
        let quote = QuoteRecord {
            symbol: format!("S{:04}", seq % 50),
            price: 10_000 + seq as i64,
            qty: 10,
            time_us: seq,
        };
        match encode_quote_packet(seq, &quote) {
            Ok(pk) => buf.extend_from_slice(&pk),
            Err(e) => panic!("encode failed: {e}"),
        }
    }
    buf
}

fn feed_stream(feeder: &ContinuityFeeder<CountHandler>, stream: &BytesMut) {
    let mut framer = PacketFramer::<StdLayout>::new();
    let mut rxbuf = stream.clone();
    framer.feed_buffer(&mut rxbuf, |pk| {
        if let Some(seq) = std_seq_of(pk) {
            feeder.feed_packet(pk, seq);
        }
        true
    });
}

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");

    for count in [100u64, 1_000, 10_000] {
        let stream = quote_stream(1..=count);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut framer = PacketFramer::<StdLayout>::new();
                let mut rxbuf = stream.clone();
                let mut n = 0u64;
                framer.feed_buffer(&mut rxbuf, |pk| {
                    n += black_box(pk).len() as u64;
                    true
                });
                black_box(n)
            });
        });
    }

    group.finish();
}

fn bench_feed_path(c: &mut Criterion) {
    // 순서 바뀜은 대기 타이머를 건다
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => panic!("runtime: {e}"),
    };
    let _guard = rt.enter();

    let count = 10_000u64;
    let contiguous = quote_stream(1..=count);
    let mut merged = quote_stream(1..=count);
    merged.extend_from_slice(&quote_stream((1..=count).filter(|s| s % 2 == 0)));
    let swapped = quote_stream((1..=count).map(|s| if s % 2 == 1 { s + 1 } else { s - 1 }));

    let mut group = c.benchmark_group("feed_path");
    group.throughput(Throughput::Elements(count));

    for (name, stream) in [
        ("contiguous", &contiguous),
        ("merged_duplicates", &merged),
        ("pair_swapped", &swapped),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let feeder = ContinuityFeeder::new(CountHandler(0));
                feed_stream(&feeder, stream);
                black_box(feeder.stats().received)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_framer, bench_feed_path);
criterion_main!(benches);
