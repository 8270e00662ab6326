//! # mdlink
//!
//! 시세(market data) 수신용 장치 런타임
//!
//! ## 핵심 특징
//! - **장치 상태 머신**: 모든 장치 조작은 장치별 작업 큐에서 하나씩 실행
//! - **자동 재연결**: 실패/단절/종료 후 옵션에 따른 재시도 타이머
//! - **장애 조치**: 여러 주소/도메인을 차례로 시도하는 TCP 클라이언트
//! - **서버**: 받아들인 연결을 순번으로 관리하는 TCP 서버
//! - **패킷 프레이머**: leader + 길이 + XOR 체크섬 + CRLF 형식
//! - **연속성 피더**: 여러 회선의 시퀀스를 합쳐 중복 제거 + 순서 복원
//!
//! ## 사용 예
//!
//! ```no_run
//! use std::sync::Arc;
//! use mdlink::{ContinuityFeeder, FeedSession, QuoteHandler, SocketClient, SocketClientDevice, StdLayout};
//!
//! # async fn run() {
//! let feeder = Arc::new(ContinuityFeeder::new(QuoteHandler::new(|seq, q| {
//!     println!("{seq}: {q:?}");
//! })));
//! let session = Arc::new(FeedSession::<StdLayout, _>::new("primary", feeder, mdlink::std_seq_of));
//! let dev = SocketClientDevice::new(SocketClient::new(), session, None);
//! dev.async_open("127.0.0.1:9000|dn=feed.example.com:9000");
//! # }
//! ```

pub mod config;
pub mod continuity;
pub mod device;
pub mod error;
pub mod feed;
pub mod framer;
pub mod link;
pub mod manager;
pub mod send_buffer;
pub mod server;
pub mod session;
pub mod socket_client;
pub mod state;
pub mod stats;
pub mod timer;

pub use config::{DeviceOptions, FeederConfig, ServerConfig, SocketClientConfig};
pub use continuity::{ContinuityFeeder, ContinuityHandler, Delivery};
pub use device::{Device, DeviceCore, DeviceCtl, DeviceHandle, DeviceKind};
pub use error::{Error, Result};
pub use feed::{std_seq_of, FeedSession, QuoteHandler, QuoteRecord};
pub use framer::{PacketFramer, PacketLayout, StdLayout};
pub use link::SocketLink;
pub use manager::{DeviceStatus, StatusBoard};
pub use send_buffer::SendBuffer;
pub use server::{AcceptedClient, DeviceListener, TcpServer, TcpServerDevice};
pub use session::{Manager, NullSession, RecvMode, Session, SessionFactory};
pub use socket_client::{SocketClient, SocketClientDevice};
pub use state::State;
pub use stats::{ContinuityStats, FramerStats, LinkStats};
pub use timer::CancellableTimer;

/// 기본 순서 복원 대기 시간 (밀리초)
pub const DEFAULT_WAIT_INTERVAL_MS: u64 = 5;

/// 소켓 한 번 읽기 버퍼 크기
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;
