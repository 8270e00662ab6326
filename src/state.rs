//! 장치 상태 정의
//!
//! 상태 값은 순서를 가진다. `Disposing` 이상이 되면 되돌아갈 수 없다.

use std::fmt;

/// 장치 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    Initializing = 0,
    Initialized,
    /// 여는 중 (설정 확인 등)
    Opening,
    /// 상대의 접속을 기다리는 중
    WaitingLinkIn,
    /// 연결 시도 중 (DNS 조회 포함)
    Linking,
    LinkReady,
    /// 송신 버퍼가 비기를 기다린 후 닫는다
    Lingering,
    Listening,
    /// 설정 오류: 새 설정으로 다시 열기 전까지 유지
    ConfigError,
    LinkError,
    LinkBroken,
    ListenBroken,
    Closing,
    Closed,
    Disposing,
    Destructing,
}

impl State {
    const ALL: [State; 16] = [
        State::Initializing,
        State::Initialized,
        State::Opening,
        State::WaitingLinkIn,
        State::Linking,
        State::LinkReady,
        State::Lingering,
        State::Listening,
        State::ConfigError,
        State::LinkError,
        State::LinkBroken,
        State::ListenBroken,
        State::Closing,
        State::Closed,
        State::Disposing,
        State::Destructing,
    ];

    /// `repr(u8)` 값에서 복원 (상태 미러용)
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Initializing => "Initializing",
            State::Initialized => "Initialized",
            State::Opening => "Opening",
            State::WaitingLinkIn => "WaitingLinkIn",
            State::Linking => "Linking",
            State::LinkReady => "LinkReady",
            State::Lingering => "Lingering",
            State::Listening => "Listening",
            State::ConfigError => "ConfigError",
            State::LinkError => "LinkError",
            State::LinkBroken => "LinkBroken",
            State::ListenBroken => "ListenBroken",
            State::Closing => "Closing",
            State::Closed => "Closed",
            State::Disposing => "Disposing",
            State::Destructing => "Destructing",
        }
    }

    /// 이미 보낸 데이터를 계속 내보낼 수 있는 상태
    pub fn allows_continue_send(&self) -> bool {
        matches!(self, State::LinkReady | State::Lingering)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 상태가 바뀌었을 때 Session / Manager에 전달되는 정보
#[derive(Debug, Clone)]
pub struct StateChangedArgs {
    pub before: State,
    pub after: State,
    /// 상태 메시지 (원인, 진단 문자열)
    pub info: String,
    pub device_id: String,
}

/// 같은 상태로 다시 설정되었을 때 전달되는 정보 (상태 문자열 갱신용)
#[derive(Debug, Clone)]
pub struct StateUpdatedArgs {
    pub state: State,
    pub info: String,
    pub device_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(State::Initializing < State::Initialized);
        assert!(State::LinkReady < State::Lingering);
        assert!(State::Closed < State::Disposing);
        assert!(State::Disposing < State::Destructing);
    }

    #[test]
    fn test_state_u8_roundtrip() {
        for st in State::ALL {
            assert_eq!(State::from_u8(st as u8), Some(st));
        }
        assert_eq!(State::from_u8(200), None);
    }
}
