//! TCP 서버 장치와 받아들인 연결 관리
//!
//! - `TcpServer`: 리슨 소켓. 받아들인 연결마다 `AcceptedClient` 장치를 만든다
//! - `DeviceListener`: 받아들인 장치 목록 (일련번호 순)
//! - `AcceptedClient`: 받아들인 연결 하나. LinkReady 를 떠나면 목록에서 스스로 빠진다

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DeviceOptions, ServerConfig};
use crate::device::{Device, DeviceCore, DeviceCtl, DeviceKind, CELL_SPLIT, ROW_SPLIT};
use crate::link::SocketLink;
use crate::session::{Manager, Session, SessionFactory};
use crate::state::{State, StateChangedArgs};

/// 받아들인 연결의 일련번호 (리스너 안에서 증가만 하며 재사용하지 않는다)
pub type AcceptedClientSeq = u64;

/// 받아들인 연결 장치
pub type AcceptedClientDevice = Device<AcceptedClient>;

/// TCP 서버 장치
pub type TcpServerDevice = Device<TcpServer>;

#[derive(Default)]
struct AcceptedClients {
    last_seq: AcceptedClientSeq,
    devs: Vec<(AcceptedClientSeq, AcceptedClientDevice)>,
}

impl AcceptedClients {
    fn position(&self, seq: AcceptedClientSeq) -> std::result::Result<usize, usize> {
        self.devs.binary_search_by_key(&seq, |(s, _)| *s)
    }
}

/// 받아들인 장치 목록
#[derive(Default)]
pub struct DeviceListener {
    accepted: Mutex<AcceptedClients>,
    is_disposing: AtomicBool,
}

impl DeviceListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_disposing(&self) -> bool {
        self.is_disposing.load(Ordering::Acquire)
    }

    /// 받아들인 연결 등록 후 장치를 연다. 해제 중이면 `None`
    pub fn add_accepted_client(
        self: &Arc<Self>,
        server: &mut dyn DeviceCtl,
        session: Arc<dyn Session>,
        manager: Option<Arc<dyn Manager>>,
        options: DeviceOptions,
        link: SocketLink,
    ) -> Option<AcceptedClientDevice> {
        let uid = link.connection_uid();
        let dev = {
            let mut accepted = self.accepted.lock();
            if self.is_disposing() {
                return None;
            }
            accepted.last_seq += 1;
            let seq = accepted.last_seq;
            let kind = AcceptedClient {
                seq,
                listener: Arc::downgrade(self),
                pending_link: Some(link),
            };
            let dev = Device::with_options(kind, session, manager.clone(), options);
            accepted.devs.push((seq, dev.clone()));
            info!("[{}] 연결 수락: seq={}, {}", server.device_id(), seq, uid);
            dev
        };
        if let Some(mgr) = manager {
            mgr.on_device_accepted(server, &dev);
        }
        dev.async_open(uid);
        Some(dev)
    }

    /// 목록에서 제거. 없는 seq 나 해제 중이면 무시
    pub fn remove_accepted_client(&self, seq: AcceptedClientSeq) {
        if self.is_disposing() {
            return;
        }
        let removed = {
            let mut accepted = self.accepted.lock();
            match accepted.position(seq) {
                Ok(idx) => Some(accepted.devs.remove(idx)),
                Err(_) => None,
            }
        };
        if removed.is_some() {
            debug!("받아들인 연결 제거: seq={}", seq);
        }
    }

    /// 모든 받아들인 장치 해제. 두 번째 호출부터는 무시
    pub fn dispose(&self, cause: &str) {
        if self.is_disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        let devs = std::mem::take(&mut self.accepted.lock().devs);
        for (_, dev) in devs {
            dev.async_dispose(cause);
        }
    }

    pub fn get_accepted_client(&self, seq: AcceptedClientSeq) -> Option<AcceptedClientDevice> {
        let accepted = self.accepted.lock();
        accepted
            .position(seq)
            .ok()
            .map(|idx| accepted.devs[idx].1.clone())
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().devs.len()
    }

    /// (seq, 상태 스냅샷) 목록
    pub fn accepted_list(&self) -> Vec<(AcceptedClientSeq, State)> {
        self.accepted
            .lock()
            .devs
            .iter()
            .map(|(seq, dev)| (*seq, dev.state()))
            .collect()
    }

    /// `seq [cause]` 형식 파라미터로 닫기
    pub fn close_accepted_client(&self, param: &str, linger: bool) -> String {
        let (seq, cause) = match param.split_once(char::is_whitespace) {
            Some((seq, cause)) => (seq, cause.trim()),
            None => (param, ""),
        };
        let Ok(seq) = seq.parse::<AcceptedClientSeq>() else {
            return format!("Bad accepted client seq: {}", seq);
        };
        let Some(dev) = self.get_accepted_client(seq) else {
            return format!("Accepted client not found: {}", seq);
        };
        let cause = if cause.is_empty() {
            "Server.aclose".to_string()
        } else {
            cause.to_string()
        };
        if linger {
            dev.async_linger_close(cause);
        } else {
            dev.async_close(cause);
        }
        String::new()
    }
}

/// 받아들인 연결
pub struct AcceptedClient {
    seq: AcceptedClientSeq,
    listener: Weak<DeviceListener>,
    pending_link: Option<SocketLink>,
}

impl AcceptedClient {
    pub fn seq(&self) -> AcceptedClientSeq {
        self.seq
    }
}

impl DeviceKind for AcceptedClient {
    const KIND_NAME: &'static str = "AcceptedClient";

    fn op_open(core: &mut DeviceCore<Self>, cfg: String) {
        if core.state() >= State::LinkReady {
            return;
        }
        match core.kind_mut().pending_link.take() {
            Some(link) => {
                core.attach_link(link);
                core.set_device_id(cfg);
                core.set_link_ready("");
            }
            None => {
                core.set_state(State::LinkError, "No connection.");
            }
        }
    }

    /// 받아들인 연결은 다시 열 수 없다
    fn op_reopen(_core: &mut DeviceCore<Self>) {}

    fn op_close(core: &mut DeviceCore<Self>, cause: String) {
        core.set_state(State::Closed, &cause);
    }

    fn on_state_changed(core: &mut DeviceCore<Self>, e: &StateChangedArgs) {
        core.on_link_state_changed(e);
        if e.before <= State::LinkReady && e.after > State::LinkReady {
            let seq = core.kind().seq;
            if let Some(listener) = core.kind().listener.upgrade() {
                listener.remove_accepted_client(seq);
            }
        }
    }

    fn append_info(core: &DeviceCore<Self>, out: &mut String) {
        out.push_str(&format!("seq={}", core.kind().seq));
        if let Some(link) = core.link() {
            out.push('|');
            out.push_str(&link.stats().summary());
        }
    }
}

/// TCP 서버 종류 상태
pub struct TcpServer {
    session_factory: Arc<dyn SessionFactory>,
    accepted_options: DeviceOptions,
    config: Option<ServerConfig>,
    listener: Option<Arc<DeviceListener>>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    listen_id: u64,
}

impl TcpServer {
    pub fn new(session_factory: impl SessionFactory) -> Self {
        Self {
            session_factory: Arc::new(session_factory),
            accepted_options: DeviceOptions::no_retry(),
            config: None,
            listener: None,
            local_addr: None,
            accept_task: None,
            listen_id: 0,
        }
    }

    /// 받아들인 장치에 적용할 옵션
    pub fn with_accepted_options(mut self, options: DeviceOptions) -> Self {
        self.accepted_options = options;
        self
    }

    pub fn listener(&self) -> Option<&Arc<DeviceListener>> {
        self.listener.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn stop_listen(core: &mut DeviceCore<Self>, cause: &str) {
        let kind = core.kind_mut();
        if let Some(task) = kind.accept_task.take() {
            task.abort();
        }
        kind.listen_id += 1;
        if let Some(listener) = kind.listener.take() {
            listener.dispose(cause);
        }
    }

    fn reopen_impl(core: &mut DeviceCore<Self>) {
        let Some(cfg) = core.kind().config.clone() else {
            core.set_state(State::ConfigError, "Config error: no bind address.");
            return;
        };
        core.set_state(State::Opening, &format!("Listen: {}", cfg.bind_addr));
        let tcp = match listen(&cfg) {
            Ok(tcp) => tcp,
            Err(e) => {
                core.set_broken_state(format!("Listen error: {}", e));
                return;
            }
        };
        let local = tcp.local_addr().unwrap_or(cfg.bind_addr);

        let kind = core.kind_mut();
        kind.listen_id += 1;
        let listen_id = kind.listen_id;
        kind.local_addr = Some(local);
        kind.listener = Some(DeviceListener::new());

        let poster = core.poster();
        let task = tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, peer)) => {
                        let posted = poster
                            .post(move |core| Self::on_accepted(core, listen_id, stream, peer));
                        if !posted {
                            break;
                        }
                    }
                    Err(e) => {
                        let cause = format!("Accept error: {}", e);
                        poster.post(move |core| Self::on_accept_error(core, listen_id, cause));
                        break;
                    }
                }
            }
        });
        core.kind_mut().accept_task = Some(task);
        core.set_device_id(format!("L={}", local));
        core.set_state(State::Listening, &format!("Listening: {}", local));
    }

    fn on_accepted(
        core: &mut DeviceCore<Self>,
        listen_id: u64,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        if core.kind().listen_id != listen_id || core.state() != State::Listening {
            return;
        }
        let Some(listener) = core.kind().listener.clone() else {
            return;
        };
        let link = match SocketLink::new(stream) {
            Ok(link) => link,
            Err(e) => {
                warn!("받아들인 소켓 설정 실패: {}: {}", peer, e);
                return;
            }
        };
        let factory = Arc::clone(&core.kind().session_factory);
        let session = factory.make_session(core, peer);
        let manager = core.manager().cloned();
        let options = core.kind().accepted_options.clone();
        listener.add_accepted_client(core, session, manager, options, link);
    }

    fn on_accept_error(core: &mut DeviceCore<Self>, listen_id: u64, cause: String) {
        if core.kind().listen_id == listen_id {
            core.set_broken_state(cause);
        }
    }
}

fn listen(cfg: &ServerConfig) -> io::Result<TcpListener> {
    let socket = if cfg.bind_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(cfg.bind_addr)?;
    socket.listen(cfg.backlog)
}

impl DeviceKind for TcpServer {
    const KIND_NAME: &'static str = "TcpServer";
    const SUPPORTS_SEND: bool = false;

    fn op_open(core: &mut DeviceCore<Self>, cfg: String) {
        Self::stop_listen(core, "Server reopen.");
        let mut options = core.options().clone();
        match ServerConfig::parse(&cfg, &mut options) {
            Ok(parsed) => {
                *core.options_mut() = options;
                core.kind_mut().config = Some(parsed);
                Self::reopen_impl(core);
            }
            Err(e) => {
                core.kind_mut().config = None;
                core.set_state(State::ConfigError, &format!("Config error: {}", e));
            }
        }
    }

    fn op_reopen(core: &mut DeviceCore<Self>) {
        Self::stop_listen(core, "Server reopen.");
        Self::reopen_impl(core);
    }

    fn op_close(core: &mut DeviceCore<Self>, cause: String) {
        Self::stop_listen(core, &cause);
        core.set_state(State::Closed, &cause);
    }

    fn op_dispose(core: &mut DeviceCore<Self>, cause: String) {
        Self::stop_listen(core, &cause);
    }

    fn on_state_changed(core: &mut DeviceCore<Self>, e: &StateChangedArgs) {
        if e.before == State::Listening {
            Self::stop_listen(core, &e.info);
        }
    }

    fn append_info(core: &DeviceCore<Self>, out: &mut String) {
        let kind = core.kind();
        match kind.local_addr {
            Some(addr) => out.push_str(&format!("local={}", addr)),
            None => out.push_str("local=none"),
        }
        let count = kind.listener.as_ref().map_or(0, |l| l.accepted_count());
        out.push_str(&format!("|accepted={}", count));
    }

    fn on_command(core: &mut DeviceCore<Self>, cmd: &str, param: &str) -> Option<String> {
        let listener = core.kind().listener.clone();
        let res = match (cmd, listener) {
            ("accepted" | "aclose" | "alclose", None) => "Server is not listening.".to_string(),
            ("accepted", Some(listener)) => {
                let mut out = String::new();
                for (seq, st) in listener.accepted_list() {
                    out.push_str(&format!("{}{}{}{}", seq, CELL_SPLIT, st, ROW_SPLIT));
                }
                out
            }
            ("aclose", Some(listener)) => listener.close_accepted_client(param, false),
            ("alclose", Some(listener)) => listener.close_accepted_client(param, true),
            _ => return None,
        };
        Some(res)
    }

    fn help_rows() -> &'static str {
        "accepted\x01List accepted clients\n\
aclose\x01Close accepted client\x01seq [Cause]\n\
alclose\x01Linger close accepted client\x01seq [Cause]"
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(listener) = self.listener.take() {
            listener.dispose("Server destructing.");
        }
    }
}
