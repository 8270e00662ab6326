//! mdlink 시세 수신기
//!
//! 주 회선과 (선택) 보조 회선으로 같은 시세를 받아 하나의 연속성 피더로 합친다.
//!
//! 사용법:
//!   cargo run --release --bin mdlink-feed -- [OPTIONS]
//!
//! 예시:
//!   # 회선 두 개, 순서 복원 대기 20ms
//!   cargo run --release --bin mdlink-feed -- -c 127.0.0.1:9000 -s 127.0.0.1:9001 --wait 20
//!
//!   # 도메인 이름 + 여러 주소로 장애 조치
//!   cargo run --release --bin mdlink-feed -- -c "10.0.0.1:9000,10.0.0.2:9000|dn=feed.local:9000"

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mdlink::{
    std_seq_of, ContinuityFeeder, DeviceOptions, FeedSession, FeederConfig, Manager, QuoteHandler,
    SocketClient, SocketClientDevice, StatusBoard, StdLayout,
};

type BoxError = Box<dyn std::error::Error>;

/// 수신기 설정
struct FeedArgs {
    primary: String,
    secondary: Option<String>,
    feeder: FeederConfig,
    stats_every: Duration,
}

impl Default for FeedArgs {
    fn default() -> Self {
        Self {
            primary: "127.0.0.1:9000".to_string(),
            secondary: None,
            feeder: FeederConfig::default(),
            stats_every: Duration::from_secs(5),
        }
    }
}

fn next_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, BoxError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{name}: 값이 필요합니다").into())
}

fn parse_args() -> Result<FeedArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = FeedArgs::default();

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--connect" | "-c" => config.primary = next_value(&args, &mut i, arg)?.to_string(),
            "--secondary" | "-s" => {
                config.secondary = Some(next_value(&args, &mut i, arg)?.to_string())
            }
            "--wait" | "-w" => {
                config
                    .feeder
                    .on_tag_value("WaitInterval", next_value(&args, &mut i, arg)?)?;
            }
            "--stats" => {
                config.stats_every = Duration::from_secs(next_value(&args, &mut i, arg)?.parse()?)
            }
            "--help" | "-h" => {
                println!(
                    r#"mdlink-feed - 시세 수신기 (주/보조 회선 병합)

사용법:
  cargo run --release --bin mdlink-feed -- [OPTIONS]

옵션:
  -c, --connect <CFG>     주 회선 설정 (기본: 127.0.0.1:9000)
  -s, --secondary <CFG>   보조 회선 설정
  -w, --wait <MS>         순서 복원 대기 밀리초 (기본: 5)
  --stats <SECS>          통계 출력 간격 (기본: 5)
  -h, --help              이 도움말 출력

회선 설정:
  addr[,addr...]|dn=host:port[,...]|Bind=ip:port|ConnectTimeout=ms
  |LinkErrorRetryInterval=ms|LinkBrokenReopenInterval=ms|ClosedReopenInterval=ms

로그 레벨은 RUST_LOG 로 지정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => warn!("알 수 없는 옵션: {}", arg),
        }
        i += 1;
    }

    if config.stats_every.is_zero() {
        return Err("--stats 는 1 이상".into());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;

    info!("mdlink-feed starting...");
    info!("Primary: {}", args.primary);
    if let Some(secondary) = &args.secondary {
        info!("Secondary: {}", secondary);
    }
    info!("Wait interval: {:?}", args.feeder.wait_interval);

    let quotes = Arc::new(AtomicU64::new(0));
    let handler = {
        let quotes = quotes.clone();
        QuoteHandler::new(move |seq, quote| {
            quotes.fetch_add(1, Ordering::Relaxed);
            debug!("#{} {} {} x {}", seq, quote.symbol, quote.price, quote.qty);
        })
    };
    let feeder = Arc::new(ContinuityFeeder::with_config(handler, args.feeder.clone()));
    let board = Arc::new(StatusBoard::new());

    let mut lines = vec![("primary", args.primary.clone())];
    if let Some(secondary) = &args.secondary {
        lines.push(("secondary", secondary.clone()));
    }

    let mut sessions = Vec::new();
    let mut devices = Vec::new();
    for (name, cfg) in lines {
        let session = Arc::new(FeedSession::<StdLayout, _>::new(
            name,
            feeder.clone(),
            std_seq_of,
        ));
        let dev = SocketClientDevice::with_options(
            SocketClient::new(),
            session.clone(),
            Some(board.clone() as Arc<dyn Manager>),
            DeviceOptions::market_data(),
        );
        dev.async_open(cfg);
        sessions.push(session);
        devices.push(dev);
    }

    let mut ticker = tokio::time::interval(args.stats_every);
    ticker.tick().await;
    let mut last_quotes = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let total = quotes.load(Ordering::Relaxed);
                let rate = (total - last_quotes) as f64 / args.stats_every.as_secs_f64();
                last_quotes = total;
                info!("Quotes: {} ({:.0}/s) | {}", total, rate, feeder.stats().summary());
                for session in &sessions {
                    info!("  {}", session.summary());
                }
                for status in board.snapshot() {
                    info!("  {}", status.line());
                }
                info!("Decode errors: {}", feeder.lock().handler().decode_errors());
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    info!("종료 중...");
    for dev in &devices {
        dev.async_dispose("Feed shutdown.");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("최종: {}", feeder.stats().summary());
    Ok(())
}
