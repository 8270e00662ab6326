//! 장치 상태판
//!
//! 모든 장치의 마지막 상태 문자열을 모아둔다 (운영 화면/로그 출력용).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::device::{DeviceCtl, DeviceHandle};
use crate::session::Manager;
use crate::state::{State, StateChangedArgs, StateUpdatedArgs};

/// 장치 하나의 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub serial: u64,
    pub kind_name: &'static str,
    pub state: State,
    pub device_id: String,
    /// 마지막 상태 메시지
    pub info: String,
    /// 상태 변경 횟수 (같은 상태 갱신은 제외)
    pub changes: u64,
}

impl DeviceStatus {
    fn new(dev: &dyn DeviceCtl) -> Self {
        Self {
            serial: dev.serial(),
            kind_name: dev.kind_name(),
            state: dev.state(),
            device_id: dev.device_id().to_string(),
            info: String::new(),
            changes: 0,
        }
    }

    /// `[kind#serial] state id info`
    pub fn line(&self) -> String {
        format!(
            "[{}#{}] {} {{{}}} {}",
            self.kind_name, self.serial, self.state, self.device_id, self.info
        )
    }
}

/// `Manager` 구현: 장치 상태 모음
#[derive(Default)]
pub struct StatusBoard {
    devices: DashMap<u64, DeviceStatus>,
    accepted: AtomicU64,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, serial: u64) -> Option<DeviceStatus> {
        self.devices.get(&serial).map(|s| s.value().clone())
    }

    /// serial 순 스냅샷
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        let mut list: Vec<_> = self.devices.iter().map(|s| s.value().clone()).collect();
        list.sort_by_key(|s| s.serial);
        list
    }

    /// 서버들이 받아들인 연결 수 (누적)
    pub fn accepted_total(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        for status in self.snapshot() {
            out.push_str(&status.line());
            out.push('\n');
        }
        out
    }

    fn update(&self, dev: &dyn DeviceCtl, state: State, info: &str, changed: bool) {
        let mut entry = self
            .devices
            .entry(dev.serial())
            .or_insert_with(|| DeviceStatus::new(dev));
        entry.state = state;
        entry.device_id = dev.device_id().to_string();
        entry.info = info.to_string();
        if changed {
            entry.changes += 1;
        }
    }
}

impl Manager for StatusBoard {
    fn on_device_initialized(&self, dev: &mut dyn DeviceCtl) {
        self.devices.insert(dev.serial(), DeviceStatus::new(dev));
    }

    fn on_device_state_changed(&self, dev: &mut dyn DeviceCtl, e: &StateChangedArgs) {
        self.update(dev, e.after, &e.info, true);
    }

    fn on_device_state_updated(&self, dev: &mut dyn DeviceCtl, e: &StateUpdatedArgs) {
        self.update(dev, e.state, &e.info, false);
    }

    fn on_device_accepted(&self, _server: &mut dyn DeviceCtl, _client: &dyn DeviceHandle) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn on_device_destructing(&self, dev: &mut dyn DeviceCtl) {
        self.devices.remove(&dev.serial());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceOptions;
    use crate::server::{TcpServer, TcpServerDevice};
    use crate::session::{NullSession, Session};
    use crate::socket_client::{SocketClient, SocketClientDevice};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_board_tracks_devices() {
        let board = Arc::new(StatusBoard::new());
        let mgr: Arc<dyn Manager> = board.clone();

        let server = TcpServerDevice::new(
            TcpServer::new(|_peer: SocketAddr| NullSession::arc()),
            NullSession::arc(),
            Some(mgr.clone()),
        );
        server.async_open("127.0.0.1:0");
        let addr = server
            .query(|core| core.kind().local_addr())
            .await
            .unwrap()
            .unwrap();

        let status = board.get(server.serial()).unwrap();
        assert_eq!(status.state, State::Listening);
        assert!(status.info.starts_with("Listening: "));

        let client = SocketClientDevice::with_options(
            SocketClient::new(),
            Arc::new(NullSession) as Arc<dyn Session>,
            Some(mgr),
            DeviceOptions::no_retry(),
        );
        client.async_open(addr.to_string());

        for _ in 0..200 {
            if board.accepted_total() == 1 && board.snapshot().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(board.accepted_total(), 1);
        let kinds: Vec<_> = board.snapshot().iter().map(|s| s.kind_name).collect();
        assert_eq!(kinds, vec!["TcpServer", "TcpClient", "AcceptedClient"]);
        assert!(board.summary().contains("TcpClient"));

        drop(client);
        for _ in 0..200 {
            if board.snapshot().iter().all(|s| s.kind_name != "TcpClient") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(board.get(server.serial()).is_some());
        assert!(board.snapshot().iter().all(|s| s.kind_name != "TcpClient"));
    }
}
