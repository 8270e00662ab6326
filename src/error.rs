//! 에러 타입 정의
//!
//! 링크 장애, 체크섬 오류, 시퀀스 누락은 에러가 아니라 상태/카운터로 전달된다.
//! 여기의 에러는 설정 파싱, 송신 요청, 질의 같은 호출측 실수에만 쓰인다.

use thiserror::Error;

use crate::state::State;

/// mdlink 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("알 수 없는 설정 태그: {tag}")]
    UnknownTag { tag: String },

    #[error("유효하지 않은 설정 값: {tag}={value}")]
    InvalidValue { tag: String, value: String },

    #[error("패킷 크기 초과: {size} >= {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("원격 주소 없음")]
    NoRemoteAddress,

    #[error("LinkReady 상태가 아님: st={state}")]
    NotLinkReady { state: State },

    #[error("송신을 지원하지 않는 장치")]
    SendNotSupported,

    #[error("장치가 이미 해제됨")]
    DeviceGone,

    #[error("알 수 없는 에러: {0}")]
    Unknown(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
