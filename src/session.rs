//! 장치 이벤트 수신자
//!
//! - `Session`: 장치 하나에 붙는 프로토콜 처리 (수신 데이터, 주기 타이머 등)
//! - `Manager`: 여러 장치의 상태를 모아보는 관리자
//! - `SessionFactory`: 서버가 받아들인 연결마다 Session 생성
//!
//! 모든 콜백은 해당 장치의 op 컨텍스트에서 실행된다.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use crate::device::{DeviceCtl, DeviceHandle};
use crate::state::{StateChangedArgs, StateUpdatedArgs};

/// LinkReady 이후 수신 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// 수신 데이터를 `on_device_recv()`로 전달
    Recv,
    /// 읽기는 계속하되 (연결 끊김 감지) 데이터는 버림
    NoRecvEvent,
}

/// 장치 세션
pub trait Session: Send + Sync + 'static {
    fn on_device_initialized(&self, _dev: &mut dyn DeviceCtl) {}

    /// false 반환 시 open 취소. 설정 문자열을 고칠 수 있다.
    fn on_device_before_open(&self, _dev: &mut dyn DeviceCtl, _cfg: &mut String) -> bool {
        true
    }

    fn on_device_state_changed(&self, _dev: &mut dyn DeviceCtl, _e: &StateChangedArgs) {}

    /// 같은 상태로 다시 설정됨 (상태 메시지만 바뀜)
    fn on_device_state_updated(&self, _dev: &mut dyn DeviceCtl, _e: &StateUpdatedArgs) {}

    fn on_device_link_ready(&self, _dev: &mut dyn DeviceCtl) -> RecvMode {
        RecvMode::Recv
    }

    /// 수신 데이터. 처리한 만큼 `rxbuf`에서 소비해야 한다 (남은 데이터는 다음 수신에 이어짐).
    fn on_device_recv(&self, _dev: &mut dyn DeviceCtl, rxbuf: &mut BytesMut) {
        rxbuf.clear();
    }

    /// Initialized / LinkReady 상태에서 `run_timer_after()`로 설정한 타이머
    fn on_device_common_timer(&self, _dev: &mut dyn DeviceCtl) {}

    /// `ses` 명령. `?`는 도움말 (`\x01` 셀, `\n` 행)
    fn session_command(&self, _dev: &mut dyn DeviceCtl, _cmdln: &str) -> String {
        "unknown session command".to_string()
    }

    fn on_device_destructing(&self, _dev: &mut dyn DeviceCtl) {}
}

/// 아무것도 하지 않는 세션
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSession;

impl Session for NullSession {}

impl NullSession {
    pub fn arc() -> Arc<dyn Session> {
        Arc::new(NullSession)
    }
}

/// 장치 관리자
pub trait Manager: Send + Sync + 'static {
    fn on_device_initialized(&self, _dev: &mut dyn DeviceCtl) {}

    fn on_device_state_changed(&self, _dev: &mut dyn DeviceCtl, _e: &StateChangedArgs) {}

    fn on_device_state_updated(&self, _dev: &mut dyn DeviceCtl, _e: &StateUpdatedArgs) {}

    /// 서버가 연결을 받아들임. `server` op 컨텍스트에서 호출된다.
    fn on_device_accepted(&self, _server: &mut dyn DeviceCtl, _client: &dyn DeviceHandle) {}

    fn on_device_destructing(&self, _dev: &mut dyn DeviceCtl) {}
}

/// 받아들인 연결용 Session 생성기
pub trait SessionFactory: Send + Sync + 'static {
    fn make_session(&self, server: &mut dyn DeviceCtl, peer: SocketAddr) -> Arc<dyn Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(SocketAddr) -> Arc<dyn Session> + Send + Sync + 'static,
{
    fn make_session(&self, _server: &mut dyn DeviceCtl, peer: SocketAddr) -> Arc<dyn Session> {
        self(peer)
    }
}
