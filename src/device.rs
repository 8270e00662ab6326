//! 장치 (Device)
//!
//! 연결 하나의 수명 관리:
//! - 상태 머신 (`State`), 상태 변경 통지 (Session → Manager)
//! - 직렬 op 큐: 장치 하나당 tokio 태스크 하나가 op 를 순서대로 실행
//! - 재연결/재시도 타이머
//! - 송신 버퍼, 수신 데이터 전달
//!
//! 장치 종류별 동작은 `DeviceKind` 구현이 담당한다.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::{split_tag_values, DeviceOptions};
use crate::link::{LinkId, RecvEvent, SocketLink};
use crate::send_buffer::SendBuffer;
use crate::session::{Manager, RecvMode, Session};
use crate::state::{State, StateChangedArgs, StateUpdatedArgs};
use crate::timer::{CancellableTimer, TimerGen};
use crate::{Error, Result};

/// 도움말 셀 구분자
pub const CELL_SPLIT: char = '\x01';
/// 도움말 행 구분자
pub const ROW_SPLIT: char = '\n';

const DEVICE_HELP: &str = "open\x01Open device\x01[ConfigString] or Reopen if no ConfigString.\n\
close\x01Close device\x01[Cause]\n\
lclose\x01Linger close device\x01[Cause]\n\
dispose\x01Dispose device\x01[Cause]\n\
info\x01Device info\n\
set\x01Set device property\x01Tag=Value[|Tag=Value...]";

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// op 큐에 들어가는 작업
pub type OpTask<K> = Box<dyn FnOnce(&mut DeviceCore<K>) + Send>;

/// 장치 종류별 동작
///
/// 모든 함수는 op 컨텍스트에서 실행된다.
pub trait DeviceKind: Send + Sized + 'static {
    /// 로그/info 에 쓰이는 종류 이름
    const KIND_NAME: &'static str;

    /// `send_buffered()` 지원 여부
    const SUPPORTS_SEND: bool = true;

    /// 새 설정으로 열기
    fn op_open(core: &mut DeviceCore<Self>, cfg: String);

    /// 이전 설정으로 다시 열기
    fn op_reopen(core: &mut DeviceCore<Self>);

    fn op_close(core: &mut DeviceCore<Self>, cause: String);

    fn op_dispose(_core: &mut DeviceCore<Self>, _cause: String) {}

    /// 통지 전에 호출된다
    fn on_state_changed(_core: &mut DeviceCore<Self>, _e: &StateChangedArgs) {}

    /// 일시 상태(Linking 등)에서 타이머 발화
    fn on_common_timer(_core: &mut DeviceCore<Self>) {}

    /// `info` 명령의 `info=` 뒤에 붙는 내용
    fn append_info(_core: &DeviceCore<Self>, _out: &mut String) {}

    /// 종류별 명령. 모르는 명령이면 `None`
    fn on_command(_core: &mut DeviceCore<Self>, _cmd: &str, _param: &str) -> Option<String> {
        None
    }

    /// 종류별 명령 도움말 행
    fn help_rows() -> &'static str {
        ""
    }
}

/// 세션/관리자 콜백에 넘겨지는 장치 접근자
pub trait DeviceCtl: Send {
    fn serial(&self) -> u64;
    fn kind_name(&self) -> &'static str;
    fn state(&self) -> State;
    fn device_id(&self) -> &str;
    fn options(&self) -> &DeviceOptions;

    /// op 컨텍스트 안에서 바로 송신 (큐를 거치지 않음)
    fn send_buffered(&mut self, data: Bytes) -> Result<()>;
    fn is_send_buffer_empty(&self) -> bool;

    /// 공용 타이머 설정. Initialized / LinkReady 에서는 세션 타이머로 전달된다.
    fn run_timer_after(&mut self, delay: Duration);

    fn async_close(&self, cause: String);
    fn async_linger_close(&self, cause: String);
}

/// 종류를 모르는 장치 핸들
pub trait DeviceHandle: Send + Sync {
    fn serial(&self) -> u64;
    fn kind_name(&self) -> &'static str;
    /// 상태 스냅샷 (다른 스레드에서 읽은 값이므로 곧 바뀔 수 있다)
    fn state(&self) -> State;
    fn async_open(&self, cfg: String) -> bool;
    fn async_close(&self, cause: String) -> bool;
    fn async_linger_close(&self, cause: String) -> bool;
    fn async_dispose(&self, cause: String) -> bool;
    fn async_send(&self, data: Bytes) -> bool;
    /// 명령 실행 후 결과를 기다린다. 장치 자신의 op 컨텍스트에서 호출하면 안 된다.
    fn wait_command(&self, cmdln: &str) -> String;
}

#[derive(Debug, Clone, Copy)]
enum TimerAct {
    Ignore,
    Reopen,
    ToDerived,
    ToSession,
}

fn timer_act(st: State) -> TimerAct {
    match st {
        State::Initialized | State::LinkReady => TimerAct::ToSession,
        State::Opening
        | State::WaitingLinkIn
        | State::Linking
        | State::Lingering
        | State::Listening
        | State::Closing => TimerAct::ToDerived,
        State::LinkError | State::LinkBroken | State::ListenBroken | State::Closed => {
            TimerAct::Reopen
        }
        _ => TimerAct::Ignore,
    }
}

struct DeviceShared {
    serial: u64,
    state: AtomicU8,
}

/// op 큐 약한 참조. I/O 태스크와 타이머가 장치를 붙잡지 않도록 한다.
pub struct OpPoster<K: DeviceKind>(mpsc::WeakUnboundedSender<OpTask<K>>);

impl<K: DeviceKind> Clone for OpPoster<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K: DeviceKind> OpPoster<K> {
    /// 장치가 이미 해제되었으면 false
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut DeviceCore<K>) + Send + 'static,
    {
        match self.0.upgrade() {
            Some(tx) => tx.send(Box::new(f)).is_ok(),
            None => false,
        }
    }
}

/// op 컨텍스트가 소유하는 장치 상태
pub struct DeviceCore<K: DeviceKind> {
    kind: K,
    state: State,
    device_id: String,
    options: DeviceOptions,
    send_buffer: SendBuffer,
    timer: CancellableTimer,
    session: Arc<dyn Session>,
    manager: Option<Arc<dyn Manager>>,
    link: Option<SocketLink>,
    rxbuf: BytesMut,
    recv_mode: RecvMode,
    linger_cause: String,
    /// Lingering 동안 핸들이 모두 사라져도 송신을 마칠 수 있도록 잡아둔다
    linger_hold: Option<mpsc::UnboundedSender<OpTask<K>>>,
    poster: OpPoster<K>,
    shared: Arc<DeviceShared>,
}

impl<K: DeviceKind> DeviceCore<K> {
    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut K {
        &mut self.kind
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn set_device_id(&mut self, id: impl Into<String>) {
        self.device_id = id.into();
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut DeviceOptions {
        &mut self.options
    }

    pub fn timer(&self) -> &CancellableTimer {
        &self.timer
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn manager(&self) -> Option<&Arc<dyn Manager>> {
        self.manager.as_ref()
    }

    pub fn link(&self) -> Option<&SocketLink> {
        self.link.as_ref()
    }

    pub fn send_buffer(&self) -> &SendBuffer {
        &self.send_buffer
    }

    pub fn poster(&self) -> OpPoster<K> {
        self.poster.clone()
    }

    fn store_state(&mut self, st: State) {
        self.state = st;
        self.shared.state.store(st as u8, Ordering::Release);
        if st != State::Lingering {
            self.linger_hold = None;
        }
    }

    fn initialize(&mut self) {
        self.store_state(State::Initialized);
        debug!("[{}#{}] 초기화", K::KIND_NAME, self.serial());
        let session = Arc::clone(&self.session);
        session.on_device_initialized(self);
        if let Some(mgr) = self.manager.clone() {
            mgr.on_device_initialized(self);
        }
    }

    fn destruct(&mut self) {
        self.store_state(State::Destructing);
        debug!("[{}#{}] 해제", K::KIND_NAME, self.serial());
        self.timer.dispose();
        self.link = None;
        self.send_buffer.force_clear(&"Device destructing.");
        let session = Arc::clone(&self.session);
        session.on_device_destructing(self);
        if let Some(mgr) = self.manager.clone() {
            mgr.on_device_destructing(self);
        }
    }

    /// 상태 변경. 실제로 바뀌었으면 true
    ///
    /// - 같은 상태: 타이머 정책 재확인 후 `StateUpdated` 통지
    /// - `Disposing` 이후 이전 상태로는 갈 수 없음
    pub fn set_state(&mut self, after: State, info: &str) -> bool {
        let before = self.state;
        if before == after {
            if after < State::Disposing {
                self.check_start_timer(after);
                let e = StateUpdatedArgs {
                    state: after,
                    info: info.to_string(),
                    device_id: self.device_id.clone(),
                };
                let session = Arc::clone(&self.session);
                session.on_device_state_updated(self, &e);
                if let Some(mgr) = self.manager.clone() {
                    mgr.on_device_state_updated(self, &e);
                }
            }
            return false;
        }
        if before >= State::Disposing && after < before {
            return false;
        }

        self.store_state(after);
        info!(
            "[{}#{}] {} -> {}: {}",
            K::KIND_NAME,
            self.serial(),
            before,
            after,
            info
        );
        let e = StateChangedArgs {
            before,
            after,
            info: info.to_string(),
            device_id: self.device_id.clone(),
        };
        K::on_state_changed(self, &e);
        if !self.check_start_timer(after) {
            self.timer.stop();
        }
        let session = Arc::clone(&self.session);
        session.on_device_state_changed(self, &e);
        if let Some(mgr) = self.manager.clone() {
            mgr.on_device_state_changed(self, &e);
        }
        true
    }

    /// 상태별 재시도 간격이 있으면 타이머 설정
    fn check_start_timer(&mut self, st: State) -> bool {
        let ms = match st {
            State::LinkError => self.options.link_error_retry_interval_ms,
            State::LinkBroken | State::ListenBroken => self.options.link_broken_reopen_interval_ms,
            State::Closed => self.options.closed_reopen_interval_ms,
            _ => return false,
        };
        if ms == 0 {
            return false;
        }
        self.run_timer_after(Duration::from_millis(ms));
        true
    }

    /// 공용 타이머 설정 (이전 설정은 취소)
    pub fn run_timer_after(&mut self, delay: Duration) {
        let poster = self.poster();
        self.timer.run_after(delay, move |gen| {
            poster.post(move |core| core.on_common_timer(gen));
        });
    }

    fn on_common_timer(&mut self, gen: TimerGen) {
        if !self.timer.is_current(gen) {
            return;
        }
        match timer_act(self.state) {
            TimerAct::Reopen => {
                debug!("[{}#{}] 타이머 재오픈: st={}", K::KIND_NAME, self.serial(), self.state);
                self.open(String::new());
            }
            TimerAct::ToDerived => K::on_common_timer(self),
            TimerAct::ToSession => {
                let session = Arc::clone(&self.session);
                session.on_device_common_timer(self);
            }
            TimerAct::Ignore => {}
        }
    }

    /// 열기. 설정이 비어 있으면 이전 설정으로 다시 연다.
    pub fn open(&mut self, cfg: String) {
        if self.state >= State::Disposing {
            return;
        }
        let mut cfg = cfg;
        let session = Arc::clone(&self.session);
        if !session.on_device_before_open(self, &mut cfg) {
            return;
        }
        if self.state <= State::Initialized || !cfg.is_empty() {
            K::op_open(self, cfg);
            return;
        }
        match self.state {
            State::Listening | State::LinkReady | State::WaitingLinkIn | State::ConfigError => {}
            _ => K::op_reopen(self),
        }
    }

    pub fn close(&mut self, cause: String) {
        if self.state < State::Closing {
            K::op_close(self, cause);
        }
    }

    /// 송신 버퍼가 빈 뒤에 닫기
    pub fn linger_close(&mut self, cause: String) {
        if self.state == State::LinkReady {
            // 상태 통지 중에 마지막 핸들이 사라질 수 있으므로 먼저 잡는다
            self.linger_hold = self.poster.0.upgrade();
            self.linger_cause = cause.clone();
            self.set_state(State::Lingering, &cause);
            self.check_linger_close();
        } else if self.state < State::Lingering {
            self.close(cause);
        }
    }

    pub fn check_linger_close(&mut self) {
        if self.state == State::Lingering && self.send_buffer.is_empty() {
            let cause = std::mem::take(&mut self.linger_cause);
            K::op_close(self, cause);
        }
    }

    pub fn dispose(&mut self, cause: String) {
        self.close(cause.clone());
        if self.set_state(State::Disposing, &cause) {
            K::op_dispose(self, cause);
        }
    }

    /// 링크 장애 보고: 현재 상태에 맞는 장애 상태로 전환
    pub fn set_broken_state(&mut self, cause: String) {
        match self.state {
            State::Opening | State::WaitingLinkIn | State::Linking => {
                self.set_state(State::LinkError, &cause);
            }
            State::LinkReady => {
                self.set_state(State::LinkBroken, &cause);
            }
            State::Listening => {
                self.set_state(State::ListenBroken, &cause);
            }
            State::Lingering => K::op_close(self, cause),
            _ => {}
        }
    }

    /// LinkReady 로 전환 후 수신 시작
    pub fn set_link_ready(&mut self, info: &str) {
        if !self.set_state(State::LinkReady, info) {
            return;
        }
        let session = Arc::clone(&self.session);
        self.recv_mode = session.on_device_link_ready(self);
        if self.state == State::LinkReady {
            self.start_recv();
        }
    }

    /// 연결된 소켓 연결 (이전 링크는 닫힌다)
    pub fn attach_link(&mut self, link: SocketLink) {
        self.rxbuf.clear();
        self.link = Some(link);
    }

    /// 링크 해제 후 송신 버퍼 비우기
    pub fn drop_link(&mut self, cause: &str) {
        if let Some(link) = self.link.take() {
            debug!(
                "[{}#{}] 링크 해제: {} | {}",
                K::KIND_NAME,
                self.serial(),
                link.connection_uid(),
                link.stats().summary()
            );
        }
        self.send_buffer.force_clear(&cause);
        self.rxbuf.clear();
    }

    /// 소켓 종류 공통: LinkReady/Lingering 을 떠나면 링크 해제
    pub fn on_link_state_changed(&mut self, e: &StateChangedArgs) {
        if e.before.allows_continue_send() && e.after != State::Lingering {
            self.drop_link(&e.info);
        }
    }

    fn start_recv(&mut self) {
        let poster = self.poster();
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let link_id = link.id();
        link.start_recv(move |ev| poster.post(move |core| core.on_link_event(link_id, ev)));
    }

    fn on_link_event(&mut self, link_id: LinkId, ev: RecvEvent) {
        let Some(link) = self.link.as_mut().filter(|l| l.id() == link_id) else {
            return;
        };
        match ev {
            RecvEvent::Data(data) => {
                link.stats_mut().record_rx(data.len());
                if self.recv_mode != RecvMode::Recv || !self.state.allows_continue_send() {
                    return;
                }
                self.rxbuf.extend_from_slice(&data);
                let mut rxbuf = std::mem::take(&mut self.rxbuf);
                let session = Arc::clone(&self.session);
                session.on_device_recv(self, &mut rxbuf);
                // 콜백 중에 링크가 바뀌었으면 남은 데이터는 버린다
                if self.link.as_ref().map(SocketLink::id) == Some(link_id) {
                    self.rxbuf = rxbuf;
                }
            }
            RecvEvent::Closed(cause) => self.set_broken_state(cause),
        }
    }

    /// 송신. LinkReady 에서만 가능
    pub fn send_buffered(&mut self, data: Bytes) -> Result<()> {
        if !K::SUPPORTS_SEND {
            return Err(Error::SendNotSupported);
        }
        if self.state != State::LinkReady {
            return Err(Error::NotLinkReady { state: self.state });
        }
        if data.is_empty() {
            return Ok(());
        }
        match self.send_buffer.to_sending() {
            Some(queue) => {
                queue.push_back(data);
                self.start_write();
            }
            None => self.send_buffer.queue_for_push().push_back(data),
        }
        Ok(())
    }

    fn start_write(&mut self) {
        let Some(chunk) = self.send_buffer.front_chunk() else {
            return;
        };
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(mut writer) = link.take_writer() else {
            return;
        };
        let link_id = link.id();
        let poster = self.poster();
        tokio::spawn(async move {
            let res = writer.write(&chunk).await;
            poster.post(move |core| core.on_write_done(link_id, writer, res));
        });
    }

    fn on_write_done(&mut self, link_id: LinkId, writer: OwnedWriteHalf, res: io::Result<usize>) {
        let Some(link) = self.link.as_mut().filter(|l| l.id() == link_id) else {
            return;
        };
        link.put_writer(writer);
        match res {
            Ok(0) => self.set_broken_state("Send error: connection closed.".to_string()),
            Ok(n) => {
                link.stats_mut().record_tx(n);
                if self.send_buffer.continue_send(n).is_some() {
                    self.start_write();
                } else {
                    self.check_linger_close();
                }
            }
            Err(e) => self.set_broken_state(format!("Send error: {}", e)),
        }
    }

    /// `|tm=...|st=...|id={...}|info=...`
    pub fn device_info(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut out = format!(
            "|tm={}.{:06}|st={}|id={{{}}}|info=",
            now.as_secs(),
            now.subsec_micros(),
            self.state,
            self.device_id
        );
        K::append_info(self, &mut out);
        out
    }

    /// `Tag=Value|...` 적용. 성공이면 빈 문자열, 실패하면 `err=...` (첫 오류에서 중단)
    pub fn set_property(&mut self, list: &str) -> String {
        for (tag, value) in split_tag_values(list) {
            let res = match tag {
                None => Err(Error::UnknownTag { tag: value.into() }),
                Some(tag) => match self.options.on_tag_value(tag, value) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Error::UnknownTag { tag: tag.into() }),
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = res {
                return format!("err={}{}", e, ROW_SPLIT);
            }
        }
        String::new()
    }

    fn help_text(&mut self) -> String {
        let mut out = String::from(DEVICE_HELP);
        let rows = K::help_rows();
        if !rows.is_empty() {
            out.push(ROW_SPLIT);
            out.push_str(rows);
        }
        let session = Arc::clone(&self.session);
        let ses_help = session.session_command(self, "?");
        if ses_help.contains(CELL_SPLIT) {
            out.push(ROW_SPLIT);
            out.push_str("-\x01Session commands");
            for row in ses_help.split(ROW_SPLIT).filter(|r| !r.is_empty()) {
                out.push(ROW_SPLIT);
                out.push_str("ses ");
                out.push_str(row);
            }
        }
        out
    }

    /// 텍스트 명령 실행
    pub fn run_command(&mut self, cmdln: &str) -> String {
        let cmdln = cmdln.trim();
        let (cmd, param) = match cmdln.split_once(char::is_whitespace) {
            Some((cmd, param)) => (cmd, param.trim()),
            None => (cmdln, ""),
        };
        match cmd {
            "open" => {
                self.open(param.to_string());
                String::new()
            }
            "close" => {
                self.close(command_cause(cmd, param));
                String::new()
            }
            "lclose" => {
                self.linger_close(command_cause(cmd, param));
                String::new()
            }
            "dispose" => {
                self.dispose(command_cause(cmd, param));
                String::new()
            }
            "info" => self.device_info(),
            "set" => self.set_property(param),
            "ses" => {
                let session = Arc::clone(&self.session);
                session.session_command(self, param)
            }
            "?" => self.help_text(),
            _ => K::on_command(self, cmd, param)
                .unwrap_or_else(|| "unknown device command".to_string()),
        }
    }
}

fn command_cause(cmd: &str, param: &str) -> String {
    if param.is_empty() {
        format!("DeviceCommand.{}", cmd)
    } else {
        format!("DeviceCommand.{}: {}", cmd, param)
    }
}

impl<K: DeviceKind> DeviceCtl for DeviceCore<K> {
    fn serial(&self) -> u64 {
        self.shared.serial
    }

    fn kind_name(&self) -> &'static str {
        K::KIND_NAME
    }

    fn state(&self) -> State {
        self.state
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn options(&self) -> &DeviceOptions {
        &self.options
    }

    fn send_buffered(&mut self, data: Bytes) -> Result<()> {
        DeviceCore::send_buffered(self, data)
    }

    fn is_send_buffer_empty(&self) -> bool {
        self.send_buffer.is_empty()
    }

    fn run_timer_after(&mut self, delay: Duration) {
        DeviceCore::run_timer_after(self, delay)
    }

    fn async_close(&self, cause: String) {
        self.poster.post(move |core| core.close(cause));
    }

    fn async_linger_close(&self, cause: String) {
        self.poster.post(move |core| core.linger_close(cause));
    }
}

async fn run_op_queue<K: DeviceKind>(
    mut core: DeviceCore<K>,
    mut rx: mpsc::UnboundedReceiver<OpTask<K>>,
) {
    core.initialize();
    while let Some(task) = rx.recv().await {
        task(&mut core);
    }
    core.destruct();
}

/// 장치 핸들
///
/// 복제 가능. 마지막 핸들이 사라지면 장치 태스크가 종료되며 `Destructing` 통지가 간다.
pub struct Device<K: DeviceKind> {
    tx: mpsc::UnboundedSender<OpTask<K>>,
    shared: Arc<DeviceShared>,
}

impl<K: DeviceKind> Clone for Device<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: DeviceKind> Device<K> {
    /// 기본 옵션으로 장치 생성. tokio 런타임 안에서 호출해야 한다.
    pub fn new(kind: K, session: Arc<dyn Session>, manager: Option<Arc<dyn Manager>>) -> Self {
        Self::with_options(kind, session, manager, DeviceOptions::default())
    }

    pub fn with_options(
        kind: K,
        session: Arc<dyn Session>,
        manager: Option<Arc<dyn Manager>>,
        options: DeviceOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(DeviceShared {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Initializing as u8),
        });
        let core = DeviceCore {
            kind,
            state: State::Initializing,
            device_id: String::new(),
            options,
            send_buffer: SendBuffer::new(),
            timer: CancellableTimer::new(),
            session,
            manager,
            link: None,
            rxbuf: BytesMut::new(),
            recv_mode: RecvMode::Recv,
            linger_cause: String::new(),
            linger_hold: None,
            poster: OpPoster(tx.downgrade()),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(run_op_queue(core, rx));
        Self { tx, shared }
    }

    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    /// 상태 스냅샷
    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::Acquire)).unwrap_or(State::Destructing)
    }

    /// op 큐에 작업 추가
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut DeviceCore<K>) + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }

    pub fn async_open(&self, cfg: impl Into<String>) -> bool {
        let cfg = cfg.into();
        self.post(move |core| core.open(cfg))
    }

    pub fn async_close(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        self.post(move |core| core.close(cause))
    }

    pub fn async_linger_close(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        self.post(move |core| core.linger_close(cause))
    }

    pub fn async_dispose(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        self.post(move |core| core.dispose(cause))
    }

    /// 송신 요청. 실패(LinkReady 아님 등)는 로그로만 남는다.
    pub fn send_buffered(&self, data: Bytes) -> bool {
        self.post(move |core| {
            if let Err(e) = core.send_buffered(data) {
                debug!("[{}#{}] 송신 실패: {}", K::KIND_NAME, core.serial(), e);
            }
        })
    }

    /// op 컨텍스트에서 `f` 실행 후 결과 대기
    pub async fn query<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DeviceCore<K>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.post(move |core| {
            let _ = tx.send(f(core));
        }) {
            return Err(Error::DeviceGone);
        }
        rx.await.map_err(|_| Error::DeviceGone)
    }

    /// `query()`의 블로킹 버전. 장치 자신의 op 컨텍스트나
    /// tokio 워커 스레드에서 호출하면 안 된다.
    pub fn wait_query<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DeviceCore<K>) -> R + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if !self.post(move |core| {
            let _ = tx.send(f(core));
        }) {
            return Err(Error::DeviceGone);
        }
        rx.recv().map_err(|_| Error::DeviceGone)
    }

    pub async fn device_id(&self) -> Result<String> {
        self.query(|core| core.device_id.clone()).await
    }

    pub fn wait_device_id(&self) -> Result<String> {
        self.wait_query(|core| core.device_id.clone())
    }

    pub async fn device_info(&self) -> Result<String> {
        self.query(|core| core.device_info()).await
    }

    pub async fn set_property(&self, list: impl Into<String>) -> Result<String> {
        let list = list.into();
        self.query(move |core| core.set_property(&list)).await
    }

    pub async fn command(&self, cmdln: impl Into<String>) -> String {
        let cmdln = cmdln.into();
        self.query(move |core| core.run_command(&cmdln))
            .await
            .unwrap_or_else(|e| e.to_string())
    }

    pub fn wait_command(&self, cmdln: impl Into<String>) -> String {
        let cmdln = cmdln.into();
        self.wait_query(move |core| core.run_command(&cmdln))
            .unwrap_or_else(|e| e.to_string())
    }
}

impl<K: DeviceKind> DeviceHandle for Device<K> {
    fn serial(&self) -> u64 {
        Device::serial(self)
    }

    fn kind_name(&self) -> &'static str {
        K::KIND_NAME
    }

    fn state(&self) -> State {
        Device::state(self)
    }

    fn async_open(&self, cfg: String) -> bool {
        Device::async_open(self, cfg)
    }

    fn async_close(&self, cause: String) -> bool {
        Device::async_close(self, cause)
    }

    fn async_linger_close(&self, cause: String) -> bool {
        Device::async_linger_close(self, cause)
    }

    fn async_dispose(&self, cause: String) -> bool {
        Device::async_dispose(self, cause)
    }

    fn async_send(&self, data: Bytes) -> bool {
        Device::send_buffered(self, data)
    }

    fn wait_command(&self, cmdln: &str) -> String {
        Device::wait_command(self, cmdln)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TestKind {
        opens: Vec<String>,
        reopens: u32,
    }

    impl DeviceKind for TestKind {
        const KIND_NAME: &'static str = "Test";

        fn op_open(core: &mut DeviceCore<Self>, cfg: String) {
            core.kind_mut().opens.push(cfg.clone());
            if cfg == "bad" {
                core.set_state(State::ConfigError, "Config error.");
            } else if cfg == "unreachable" {
                core.set_state(State::LinkError, "No route.");
            } else {
                core.set_device_id(cfg);
                core.set_link_ready("");
            }
        }

        fn op_reopen(core: &mut DeviceCore<Self>) {
            core.kind_mut().reopens += 1;
            core.set_link_ready("reopen");
        }

        fn op_close(core: &mut DeviceCore<Self>, cause: String) {
            core.set_state(State::Closed, &cause);
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl Session for Recorder {
        fn on_device_state_changed(&self, _dev: &mut dyn DeviceCtl, e: &StateChangedArgs) {
            self.events.lock().push(format!("ses:{}>{}", e.before, e.after));
        }

        fn on_device_state_updated(&self, _dev: &mut dyn DeviceCtl, e: &StateUpdatedArgs) {
            self.events.lock().push(format!("ses:={}", e.state));
        }

        fn session_command(&self, _dev: &mut dyn DeviceCtl, cmdln: &str) -> String {
            match cmdln {
                "?" => "stats\x01Show stats".to_string(),
                _ => format!("echo {}", cmdln),
            }
        }

        fn on_device_destructing(&self, _dev: &mut dyn DeviceCtl) {
            self.events.lock().push("ses:destructing".to_string());
        }
    }

    impl Manager for Recorder {
        fn on_device_state_changed(&self, _dev: &mut dyn DeviceCtl, e: &StateChangedArgs) {
            self.events.lock().push(format!("mgr:{}>{}", e.before, e.after));
        }

        fn on_device_state_updated(&self, _dev: &mut dyn DeviceCtl, e: &StateUpdatedArgs) {
            self.events.lock().push(format!("mgr:={}", e.state));
        }
    }

    fn make_device(options: DeviceOptions) -> (Device<TestKind>, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let dev = Device::with_options(
            TestKind::default(),
            rec.clone(),
            Some(rec.clone() as Arc<dyn Manager>),
            options,
        );
        (dev, rec)
    }

    #[tokio::test]
    async fn test_state_changed_and_updated() {
        let (dev, rec) = make_device(DeviceOptions::no_retry());
        dev.async_open("dev-a");
        assert_eq!(dev.device_id().await.unwrap(), "dev-a");
        assert_eq!(dev.state(), State::LinkReady);
        assert_eq!(rec.take(), vec!["ses:Initialized>LinkReady", "mgr:Initialized>LinkReady"]);

        let changed = dev
            .query(|core| core.set_state(State::LinkReady, "again"))
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(rec.take(), vec!["ses:=LinkReady", "mgr:=LinkReady"]);
    }

    #[tokio::test]
    async fn test_disposing_is_terminal() {
        let (dev, rec) = make_device(DeviceOptions::no_retry());
        dev.async_open("dev-b");
        dev.async_dispose("bye");

        let changed = dev
            .query(|core| core.set_state(State::LinkReady, "back"))
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(dev.state(), State::Disposing);

        // Disposing 이후 open 무시
        dev.async_open("dev-c");
        let opens = dev.query(|core| core.kind().opens.clone()).await.unwrap();
        assert_eq!(opens, vec!["dev-b".to_string()]);

        let events = rec.take();
        assert!(events.contains(&"ses:LinkReady>Closed".to_string()));
        assert!(events.contains(&"ses:Closed>Disposing".to_string()));
    }

    #[tokio::test]
    async fn test_open_rules() {
        let (dev, _rec) = make_device(DeviceOptions::no_retry());
        dev.async_open("bad");
        assert_eq!(dev.query(|core| core.state()).await.unwrap(), State::ConfigError);

        // ConfigError 에서 빈 설정 open 은 무시
        dev.async_open("");
        dev.async_open("good");
        // LinkReady 에서 빈 설정 open 은 무시
        dev.async_open("");
        let (opens, reopens) = dev
            .query(|core| (core.kind().opens.clone(), core.kind().reopens))
            .await
            .unwrap();
        assert_eq!(opens, vec!["bad".to_string(), "good".to_string()]);
        assert_eq!(reopens, 0);

        dev.async_close("stop");
        dev.async_open("");
        let reopens = dev.query(|core| core.kind().reopens).await.unwrap();
        assert_eq!(reopens, 1);
        assert_eq!(dev.state(), State::LinkReady);
    }

    #[tokio::test]
    async fn test_broken_reopens_by_timer() {
        let options = DeviceOptions {
            link_broken_reopen_interval_ms: 10,
            ..DeviceOptions::no_retry()
        };
        let (dev, _rec) = make_device(options);
        dev.async_open("dev-d");
        dev.post(|core| core.set_broken_state("boom".to_string()));
        assert_eq!(dev.query(|core| core.state()).await.unwrap(), State::LinkBroken);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let reopens = dev.query(|core| core.kind().reopens).await.unwrap();
        assert_eq!(reopens, 1);
        assert_eq!(dev.state(), State::LinkReady);
    }

    #[tokio::test]
    async fn test_link_error_retries_by_timer() {
        let options = DeviceOptions {
            link_error_retry_interval_ms: 10,
            ..DeviceOptions::no_retry()
        };
        let (dev, rec) = make_device(options);
        dev.async_open("unreachable");
        assert_eq!(dev.query(|core| core.state()).await.unwrap(), State::LinkError);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(dev.query(|core| core.kind().reopens).await.unwrap(), 1);
        assert_eq!(dev.state(), State::LinkReady);
        assert!(rec.take().contains(&"ses:LinkError>LinkReady".to_string()));
    }

    #[tokio::test]
    async fn test_stopped_timer_does_not_reopen() {
        let options = DeviceOptions {
            link_broken_reopen_interval_ms: 20,
            ..DeviceOptions::no_retry()
        };
        let (dev, _rec) = make_device(options);
        dev.async_open("dev-e");
        dev.post(|core| core.set_broken_state("boom".to_string()));
        dev.async_close("manual");

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(dev.query(|core| core.kind().reopens).await.unwrap(), 0);
        assert_eq!(dev.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_linger_close_waits_for_send_buffer() {
        let (dev, _rec) = make_device(DeviceOptions::no_retry());
        dev.async_open("dev-f");

        let st = dev
            .query(|core| {
                core.send_buffered(Bytes::from_static(b"pending")).unwrap();
                core.linger_close("bye".to_string());
                core.state()
            })
            .await
            .unwrap();
        assert_eq!(st, State::Lingering);

        // 링크가 없으므로 쓰기 완료를 흉내낸다
        let st = dev
            .query(|core| {
                assert!(core.send_buffered(Bytes::from_static(b"x")).is_err());
                core.send_buffer.continue_send(7);
                core.check_linger_close();
                core.state()
            })
            .await
            .unwrap();
        assert_eq!(st, State::Closed);
    }

    #[tokio::test]
    async fn test_send_refused_unless_link_ready() {
        let (dev, _rec) = make_device(DeviceOptions::no_retry());
        let res = dev
            .query(|core| core.send_buffered(Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert!(matches!(
            res,
            Err(Error::NotLinkReady {
                state: State::Initialized
            })
        ));
    }

    #[tokio::test]
    async fn test_commands() {
        let (dev, _rec) = make_device(DeviceOptions::default());
        dev.async_open("dev-g");

        let help = dev.command("?").await;
        assert!(help.starts_with("open\x01"));
        assert!(help.contains("\nses stats\x01Show stats"));

        let info = dev.command("info").await;
        assert!(info.starts_with("|tm="));
        assert!(info.contains("|st=LinkReady|id={dev-g}|info="));

        assert_eq!(dev.command("set LinkErrorRetryInterval=20|ClosedReopenInterval=1s").await, "");
        let opts = dev.query(|core| core.options().clone()).await.unwrap();
        assert_eq!(opts.link_error_retry_interval_ms, 20);
        assert_eq!(opts.closed_reopen_interval_ms, 1000);
        assert!(dev.command("set Color=red").await.starts_with("err="));

        // 범위를 넘는 값은 거부하고 장치는 계속 동작
        let reply = dev.command("set ClosedReopenInterval=18446744073709552s").await;
        assert!(reply.starts_with("err="));
        let opts = dev.query(|core| core.options().clone()).await.unwrap();
        assert_eq!(opts.closed_reopen_interval_ms, 1000);
        assert!(dev.command("info").await.contains("|st=LinkReady|"));

        assert_eq!(dev.command("ses hello").await, "echo hello");
        assert_eq!(dev.command("bogus").await, "unknown device command");

        assert_eq!(dev.command("close now").await, "");
        assert_eq!(dev.state(), State::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_query_and_destruct() {
        let (dev, rec) = make_device(DeviceOptions::no_retry());
        dev.async_open("dev-h");

        let handle = dev.clone();
        let id = tokio::task::spawn_blocking(move || handle.wait_device_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "dev-h");

        drop(dev);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rec.take().contains(&"ses:destructing".to_string()));
    }
}
