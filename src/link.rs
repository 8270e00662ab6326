//! TCP 링크
//!
//! 연결된 소켓 하나. 읽기 태스크는 수신 이벤트를 콜백으로 넘기고,
//! 쓰기 절반은 장치가 직접 사용한다.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::stats::LinkStats;
use crate::RECV_BUFFER_SIZE;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// 링크 식별자. 지난 링크의 I/O 완료를 걸러내는 데 쓴다.
pub type LinkId = u64;

/// 읽기 태스크 이벤트
#[derive(Debug)]
pub enum RecvEvent {
    Data(Bytes),
    /// 연결 종료 (원인)
    Closed(String),
}

/// 연결된 TCP 소켓
pub struct SocketLink {
    id: LinkId,
    remote: SocketAddr,
    local: SocketAddr,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    recv_task: Option<JoinHandle<()>>,
    stats: LinkStats,
}

impl SocketLink {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            local,
            reader: Some(reader),
            writer: Some(writer),
            recv_task: None,
            stats: LinkStats::default(),
        })
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// 연결 식별 문자열: `R=remote|L=local`
    pub fn connection_uid(&self) -> String {
        format!("R={}|L={}", self.remote, self.local)
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut LinkStats {
        &mut self.stats
    }

    /// 쓰기 절반 빌려가기. 쓰기가 끝나면 `put_writer()`로 돌려준다.
    pub fn take_writer(&mut self) -> Option<OwnedWriteHalf> {
        self.writer.take()
    }

    pub fn put_writer(&mut self, writer: OwnedWriteHalf) {
        self.writer = Some(writer);
    }

    /// 읽기 태스크 시작. `on_event`가 false 를 반환하면 중단한다.
    pub fn start_recv<F>(&mut self, on_event: F)
    where
        F: Fn(RecvEvent) -> bool + Send + 'static,
    {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let id = self.id;
        self.recv_task = Some(tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
            loop {
                buf.reserve(RECV_BUFFER_SIZE);
                match reader.read_buf(&mut buf).await {
                    Ok(0) => {
                        on_event(RecvEvent::Closed("Remote closed.".to_string()));
                        break;
                    }
                    Ok(_) => {
                        if !on_event(RecvEvent::Data(buf.split().freeze())) {
                            break;
                        }
                    }
                    Err(e) => {
                        on_event(RecvEvent::Closed(format!("Recv error: {}", e)));
                        break;
                    }
                }
            }
            debug!("링크 {} 읽기 종료", id);
        }));
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}
