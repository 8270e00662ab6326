//! mdlink 시세 송출 서버
//!
//! 접속한 클라이언트마다 시퀀스 번호가 붙은 데모 시세 패킷을 일정 간격으로 보낸다.
//! 손실/순서 바뀜을 흉내 낼 수 있어 피더 동작 확인에 쓴다.
//!
//! 사용법:
//!   cargo run --release --bin mdlink-server -- [OPTIONS]
//!
//! 예시:
//!   # 주 회선
//!   cargo run --release --bin mdlink-server -- --bind 0.0.0.0:9000
//!
//!   # 보조 회선: 2% 손실 + 1% 순서 바뀜
//!   cargo run --release --bin mdlink-server -- -b 0.0.0.0:9001 --loss 0.02 --reorder 0.01

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mdlink::feed::encode_quote_packet;
use mdlink::{
    DeviceCtl, Manager, NullSession, QuoteRecord, RecvMode, Session, StatusBoard, TcpServer,
    TcpServerDevice,
};

type BoxError = Box<dyn std::error::Error>;

/// 서버 설정
struct ServerArgs {
    bind_addr: SocketAddr,
    /// 틱당 패킷 수
    rate: u32,
    interval: Duration,
    loss: f64,
    reorder: f64,
    status_every: Duration,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            rate: 100,
            interval: Duration::from_millis(10),
            loss: 0.0,
            reorder: 0.0,
            status_every: Duration::from_secs(5),
        }
    }
}

fn next_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, BoxError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{name}: 값이 필요합니다").into())
}

fn parse_args() -> Result<ServerArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerArgs::default();

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--bind" | "-b" => config.bind_addr = next_value(&args, &mut i, arg)?.parse()?,
            "--rate" | "-r" => config.rate = next_value(&args, &mut i, arg)?.parse()?,
            "--interval" | "-i" => {
                config.interval = Duration::from_millis(next_value(&args, &mut i, arg)?.parse()?)
            }
            "--loss" => config.loss = next_value(&args, &mut i, arg)?.parse()?,
            "--reorder" => config.reorder = next_value(&args, &mut i, arg)?.parse()?,
            "--status" => {
                config.status_every = Duration::from_secs(next_value(&args, &mut i, arg)?.parse()?)
            }
            "--help" | "-h" => {
                println!(
                    r#"mdlink-server - 데모 시세 송출 서버

사용법:
  cargo run --release --bin mdlink-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       리슨 주소 (기본: 0.0.0.0:9000)
  -r, --rate <N>          틱당 패킷 수 (기본: 100)
  -i, --interval <MS>     틱 간격 밀리초 (기본: 10)
  --loss <RATIO>          패킷 누락 비율 0.0~1.0 (기본: 0)
  --reorder <RATIO>       순서 바뀜 비율 0.0~1.0 (기본: 0)
  --status <SECS>         상태 출력 간격 (기본: 5)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 로 지정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => warn!("알 수 없는 옵션: {}", arg),
        }
        i += 1;
    }

    if !(0.0..=1.0).contains(&config.loss) || !(0.0..=1.0).contains(&config.reorder) {
        return Err("--loss / --reorder 는 0.0~1.0".into());
    }
    if config.status_every.is_zero() {
        return Err("--status 는 1 이상".into());
    }
    Ok(config)
}

/// 받아들인 연결 하나에 시세를 보내는 세션
struct Publisher {
    rate: u32,
    interval: Duration,
    loss: f64,
    reorder: f64,
    state: Mutex<PublishState>,
}

#[derive(Default)]
struct PublishState {
    next_seq: u64,
    /// 순서를 바꾸려고 다음 패킷 뒤로 미룬 패킷
    held: Option<Bytes>,
    skipped: u64,
}

impl Publisher {
    fn quote(seq: u64) -> QuoteRecord {
        let time_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        QuoteRecord {
            symbol: format!("S{:04}", seq % 50),
            price: 10_000 + (seq % 300) as i64,
            qty: (seq % 17) as u32 + 1,
            time_us,
        }
    }

    fn publish_tick(&self, dev: &mut dyn DeviceCtl) -> mdlink::Result<()> {
        let mut rng = rand::thread_rng();
        let mut st = self.state.lock();

        for _ in 0..self.rate {
            st.next_seq += 1;
            let seq = st.next_seq;
            if self.loss > 0.0 && rng.gen_bool(self.loss) {
                st.skipped += 1;
                continue;
            }

            let pk = encode_quote_packet(seq, &Self::quote(seq))?;
            if self.reorder > 0.0 && st.held.is_none() && rng.gen_bool(self.reorder) {
                st.held = Some(pk);
                continue;
            }
            dev.send_buffered(pk)?;
            if let Some(held) = st.held.take() {
                dev.send_buffered(held)?;
            }
        }
        Ok(())
    }
}

impl Session for Publisher {
    fn on_device_link_ready(&self, dev: &mut dyn DeviceCtl) -> RecvMode {
        info!("송출 시작: {}", dev.device_id());
        dev.run_timer_after(self.interval);
        RecvMode::NoRecvEvent
    }

    fn on_device_common_timer(&self, dev: &mut dyn DeviceCtl) {
        match self.publish_tick(dev) {
            Ok(()) => dev.run_timer_after(self.interval),
            Err(e) => debug!("송출 중단: {}: {}", dev.device_id(), e),
        }
    }

    fn session_command(&self, _dev: &mut dyn DeviceCtl, cmdln: &str) -> String {
        match cmdln.trim() {
            "stats" => {
                let st = self.state.lock();
                format!("NextSeq: {} | Skipped: {}", st.next_seq, st.skipped)
            }
            _ => "unknown session command".to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;

    info!("mdlink-server starting...");
    info!("Bind address: {}", args.bind_addr);
    info!(
        "Rate: {} pk / {:?} | Loss: {:.1}% | Reorder: {:.1}%",
        args.rate,
        args.interval,
        args.loss * 100.0,
        args.reorder * 100.0
    );

    let board = Arc::new(StatusBoard::new());
    let (rate, interval, loss, reorder) = (args.rate, args.interval, args.loss, args.reorder);
    let server = TcpServerDevice::new(
        TcpServer::new(move |peer: SocketAddr| {
            debug!("접속: {}", peer);
            Arc::new(Publisher {
                rate,
                interval,
                loss,
                reorder,
                state: Mutex::new(PublishState::default()),
            }) as Arc<dyn Session>
        }),
        NullSession::arc(),
        Some(board.clone() as Arc<dyn Manager>),
    );
    server.async_open(args.bind_addr.to_string());

    let mut ticker = tokio::time::interval(args.status_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!("accepted total: {}\n{}", board.accepted_total(), board.summary());
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    info!("종료 중...");
    server.async_dispose("Server shutdown.");
    // 장치 정리 로그가 나올 시간을 준다
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
