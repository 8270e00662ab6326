//! TCP 클라이언트 장치
//!
//! - 여러 원격 주소를 순서대로 시도 (앞 주소 실패 시 다음 주소)
//! - `dn=host:port` 도메인 이름은 DNS 조회 후 후보에 추가
//! - 주소 하나당 연결 타임아웃 (DNS 조회에도 적용)
//! - 모든 후보 실패 시 실패 원인을 모아 LinkError (한 번이라도 연결됐었다면 LinkBroken)

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SocketClientConfig;
use crate::device::{Device, DeviceCore, DeviceKind};
use crate::link::SocketLink;
use crate::state::{State, StateChangedArgs};
use crate::Error;

/// TCP 클라이언트 장치
pub type SocketClientDevice = Device<SocketClient>;

/// TCP 클라이언트 종류 상태
#[derive(Default)]
pub struct SocketClient {
    config: Option<SocketClientConfig>,
    addr_list: Vec<SocketAddr>,
    next_addr_index: usize,
    remote_addr: Option<SocketAddr>,
    failures: Vec<String>,
    /// DNS 요청 번호. 줄어들지 않는다.
    dn_req_id: u64,
    dn_pending: bool,
    dn_task: Option<JoinHandle<()>>,
    connect_id: u64,
    connect_task: Option<JoinHandle<()>>,
    ever_linked: bool,
}

impl SocketClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&SocketClientConfig> {
        self.config.as_ref()
    }

    /// 현재 (또는 마지막으로) 시도한 원격 주소
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// 이번 시도의 후보 주소
    pub fn candidates(&self) -> &[SocketAddr] {
        &self.addr_list
    }

    fn cancel_tasks(&mut self) {
        if let Some(task) = self.dn_task.take() {
            task.abort();
        }
        self.dn_pending = false;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.connect_id += 1;
    }

    fn clear_linking(core: &mut DeviceCore<Self>) {
        let kind = core.kind_mut();
        kind.cancel_tasks();
        kind.remote_addr = None;
        kind.next_addr_index = 0;
        kind.addr_list.clear();
        kind.failures.clear();
        core.timer().stop();
    }

    fn start_connect_timer(core: &mut DeviceCore<Self>) {
        let timeout = core
            .kind()
            .config
            .as_ref()
            .map(|c| c.connect_timeout)
            .unwrap_or(SocketClientConfig::DEFAULT_CONNECT_TIMEOUT);
        core.run_timer_after(timeout);
    }

    fn reopen_impl(core: &mut DeviceCore<Self>) {
        let Some(cfg) = core.kind().config.clone() else {
            core.set_state(State::ConfigError, "Config error: no remote address.");
            return;
        };
        core.kind_mut().addr_list.extend(cfg.remote_addrs.iter().copied());

        if !cfg.domain_names.is_empty() {
            core.set_state(
                State::Linking,
                &format!("DN querying: {}", cfg.domain_names.join(",")),
            );
            Self::start_connect_timer(core);

            let kind = core.kind_mut();
            kind.dn_req_id += 1;
            kind.dn_pending = true;
            let req_id = kind.dn_req_id;
            let poster = core.poster();
            let names = cfg.domain_names;
            let task = tokio::spawn(async move {
                let mut addrs = Vec::new();
                let mut errs = Vec::new();
                for name in &names {
                    match tokio::net::lookup_host(name.as_str()).await {
                        Ok(found) => addrs.extend(found),
                        Err(e) => errs.push(format!("{}:{}", name, e)),
                    }
                }
                poster.post(move |core| Self::on_dn_query_done(core, req_id, addrs, errs));
            });
            core.kind_mut().dn_task = Some(task);
            return;
        }

        Self::connect_to_next(core, String::new());
    }

    fn on_dn_query_done(
        core: &mut DeviceCore<Self>,
        req_id: u64,
        addrs: Vec<SocketAddr>,
        errs: Vec<String>,
    ) {
        let kind = core.kind_mut();
        if !kind.dn_pending || kind.dn_req_id != req_id {
            return;
        }
        kind.dn_pending = false;
        kind.dn_task = None;
        kind.addr_list.extend(addrs);
        kind.failures.extend(errs.iter().cloned());
        debug!("DNS 조회 완료: 후보 {}개", kind.addr_list.len());
        Self::connect_to_next(core, errs.join("|"));
    }

    /// 다음 후보로 연결 시도. 후보가 없으면 실패 상태로 전환
    fn connect_to_next(core: &mut DeviceCore<Self>, last_error: String) {
        let kind = core.kind_mut();
        if kind.next_addr_index >= kind.addr_list.len() {
            kind.next_addr_index = 0;
            let msg = if kind.addr_list.is_empty() && kind.failures.is_empty() {
                "No hosts.".to_string()
            } else if kind.failures.is_empty() {
                "All hosts cannot connect.".to_string()
            } else {
                format!("All hosts cannot connect.|{}", kind.failures.join("|"))
            };
            let st = if kind.ever_linked {
                State::LinkBroken
            } else {
                State::LinkError
            };
            core.set_state(st, &msg);
            return;
        }

        let addr = kind.addr_list[kind.next_addr_index];
        kind.next_addr_index += 1;
        let mut msg = format!("Connecting to: {}", addr);
        if !last_error.is_empty() {
            match kind.remote_addr {
                Some(prev) if kind.next_addr_index > 1 => {
                    msg.push_str(&format!("|prev={}|err=", prev));
                }
                _ => msg.push_str("|prev.err="),
            }
            msg.push_str(&last_error);
        }
        kind.remote_addr = Some(addr);
        if let Some(task) = kind.connect_task.take() {
            task.abort();
        }
        kind.connect_id += 1;
        let connect_id = kind.connect_id;
        let bind_addr = kind.config.as_ref().and_then(|c| c.bind_addr);

        core.set_device_id(addr.to_string());
        core.set_state(State::Linking, &msg);
        Self::start_connect_timer(core);

        info!("연결 시도: {}", addr);
        let poster = core.poster();
        let task = tokio::spawn(async move {
            let res = connect_socket(addr, bind_addr).await;
            poster.post(move |core| Self::on_connect_done(core, connect_id, addr, res));
        });
        core.kind_mut().connect_task = Some(task);
    }

    fn on_connect_done(
        core: &mut DeviceCore<Self>,
        connect_id: u64,
        addr: SocketAddr,
        res: io::Result<TcpStream>,
    ) {
        if core.kind().connect_id != connect_id || core.state() != State::Linking {
            return;
        }
        core.kind_mut().connect_task = None;

        let reason = match res.and_then(SocketLink::new) {
            Ok(link) => {
                let uid = link.connection_uid();
                let kind = core.kind_mut();
                kind.ever_linked = true;
                kind.failures.clear();
                core.attach_link(link);
                core.set_device_id(uid);
                core.set_link_ready("");
                return;
            }
            Err(e) => e.to_string(),
        };
        core.kind_mut().failures.push(format!("{}:{}", addr, reason));
        Self::connect_to_next(core, reason);
    }
}

async fn connect_socket(addr: SocketAddr, bind_addr: Option<SocketAddr>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(bind_addr) = bind_addr {
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
    }
    socket.connect(addr).await
}

impl DeviceKind for SocketClient {
    const KIND_NAME: &'static str = "TcpClient";

    fn op_open(core: &mut DeviceCore<Self>, cfg: String) {
        Self::clear_linking(core);
        let mut options = core.options().clone();
        match SocketClientConfig::parse(&cfg, &mut options) {
            Ok(parsed) => {
                *core.options_mut() = options;
                let kind = core.kind_mut();
                kind.config = Some(parsed);
                kind.ever_linked = false;
                Self::reopen_impl(core);
            }
            Err(Error::NoRemoteAddress) => {
                core.kind_mut().config = None;
                core.set_state(State::ConfigError, "Config error: no remote address.");
            }
            Err(e) => {
                core.kind_mut().config = None;
                core.set_state(State::ConfigError, &format!("Config error: {}", e));
            }
        }
    }

    fn op_reopen(core: &mut DeviceCore<Self>) {
        Self::clear_linking(core);
        Self::reopen_impl(core);
    }

    fn op_close(core: &mut DeviceCore<Self>, cause: String) {
        Self::clear_linking(core);
        core.set_state(State::Closed, &cause);
        core.set_device_id("");
    }

    fn on_state_changed(core: &mut DeviceCore<Self>, e: &StateChangedArgs) {
        if e.before.allows_continue_send() {
            core.on_link_state_changed(e);
        } else if e.before == State::Linking && e.after != State::LinkReady {
            Self::clear_linking(core);
        }
    }

    fn on_common_timer(core: &mut DeviceCore<Self>) {
        if core.kind().dn_pending {
            core.kind_mut().cancel_tasks();
            core.set_broken_state("DN query timeout.".to_string());
        } else if core.state() == State::Linking {
            let kind = core.kind_mut();
            if let Some(task) = kind.connect_task.take() {
                task.abort();
            }
            kind.connect_id += 1;
            if let Some(addr) = kind.remote_addr {
                kind.failures.push(format!("{}:Connect timeout.", addr));
            }
            Self::connect_to_next(core, "Connect timeout.".to_string());
        }
    }

    fn append_info(core: &DeviceCore<Self>, out: &mut String) {
        let kind = core.kind();
        match kind.remote_addr {
            Some(addr) => out.push_str(&format!("remote={}", addr)),
            None => out.push_str("remote=none"),
        }
        out.push_str(&format!(
            "|next={}/{}",
            kind.next_addr_index,
            kind.addr_list.len()
        ));
        if let Some(link) = core.link() {
            out.push('|');
            out.push_str(&link.stats().summary());
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}
