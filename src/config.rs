//! 장치/피더 설정
//!
//! 설정 문자열 형식: `항목|Tag=Value|Tag=Value...`
//! - `=` 없는 항목은 장치 종류별 의미 (원격 주소, 바인드 주소 등)
//! - 태그를 모르는 경우 `Error::UnknownTag`

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_WAIT_INTERVAL_MS};

/// `Tag=Value|...` 문자열을 (태그, 값) 목록으로 분리
///
/// 태그가 없는 항목은 `(None, item)`으로 반환된다. 빈 항목은 건너뛴다.
pub fn split_tag_values(cfg: &str) -> impl Iterator<Item = (Option<&str>, &str)> {
    cfg.split('|').map(str::trim).filter(|s| !s.is_empty()).map(|item| {
        match item.split_once('=') {
            Some((tag, value)) => (Some(tag.trim()), value.trim()),
            None => (None, item),
        }
    })
}

/// 밀리초 값 파싱: `500`, `500ms`, `3s`
pub fn parse_millis(tag: &str, value: &str) -> Result<u64> {
    let invalid = || Error::InvalidValue {
        tag: tag.to_string(),
        value: value.to_string(),
    };
    let v = value.trim();
    if let Some(ms) = v.strip_suffix("ms") {
        ms.trim().parse().map_err(|_| invalid())
    } else if let Some(s) = v.strip_suffix('s') {
        s.trim()
            .parse::<u64>()
            .ok()
            .and_then(|s| s.checked_mul(1000))
            .ok_or_else(invalid)
    } else {
        v.parse().map_err(|_| invalid())
    }
}

/// 장치 공통 옵션
///
/// 재시도 간격은 밀리초, 0이면 자동 재시도 안 함
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOptions {
    /// LinkError 후 재시도 간격
    pub link_error_retry_interval_ms: u64,

    /// LinkBroken / ListenBroken 후 재오픈 간격
    pub link_broken_reopen_interval_ms: u64,

    /// Closed 후 재오픈 간격
    pub closed_reopen_interval_ms: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            link_error_retry_interval_ms: 15_000, // 15초
            link_broken_reopen_interval_ms: 3_000, // 3초
            closed_reopen_interval_ms: 0,         // 재오픈 안 함
        }
    }
}

impl DeviceOptions {
    /// 새 옵션 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 자동 재시도를 모두 끈 옵션 (수동 운영용)
    pub fn no_retry() -> Self {
        Self {
            link_error_retry_interval_ms: 0,
            link_broken_reopen_interval_ms: 0,
            closed_reopen_interval_ms: 0,
        }
    }

    /// 시세 수신용: 끊기면 빠르게 다시 붙는다
    pub fn market_data() -> Self {
        Self {
            link_error_retry_interval_ms: 1_000,
            link_broken_reopen_interval_ms: 500,
            closed_reopen_interval_ms: 0,
        }
    }

    /// 태그 하나 적용. 모르는 태그면 `Ok(false)`
    pub fn on_tag_value(&mut self, tag: &str, value: &str) -> Result<bool> {
        let slot = match tag {
            "LinkErrorRetryInterval" => &mut self.link_error_retry_interval_ms,
            "LinkBrokenReopenInterval" => &mut self.link_broken_reopen_interval_ms,
            "ClosedReopenInterval" => &mut self.closed_reopen_interval_ms,
            _ => return Ok(false),
        };
        *slot = parse_millis(tag, value)?;
        Ok(true)
    }

    /// 옵션 요약 (info 명령용)
    pub fn summary(&self) -> String {
        format!(
            "LinkErrorRetryInterval={}|LinkBrokenReopenInterval={}|ClosedReopenInterval={}",
            self.link_error_retry_interval_ms,
            self.link_broken_reopen_interval_ms,
            self.closed_reopen_interval_ms,
        )
    }
}

/// 연속성 피더 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeederConfig {
    /// 시퀀스가 끊겼을 때 누락 패킷을 기다리는 시간
    pub wait_interval: Duration,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_millis(DEFAULT_WAIT_INTERVAL_MS),
        }
    }
}

impl FeederConfig {
    /// `WaitInterval=ms` 적용
    pub fn on_tag_value(&mut self, tag: &str, value: &str) -> Result<bool> {
        if tag != "WaitInterval" {
            return Ok(false);
        }
        self.wait_interval = Duration::from_millis(parse_millis(tag, value)?);
        Ok(true)
    }
}

/// 소켓 클라이언트 설정
///
/// `addr[,addr...]|dn=host:port[,host:port...]|Bind=ip:port|ConnectTimeout=ms`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketClientConfig {
    /// 고정 원격 주소 (순서대로 시도)
    pub remote_addrs: Vec<SocketAddr>,

    /// DNS 조회할 `host:port` 목록
    pub domain_names: Vec<String>,

    /// 로컬 바인드 주소
    pub bind_addr: Option<SocketAddr>,

    /// 주소 하나당 연결 대기 시간 (DNS 조회에도 적용)
    pub connect_timeout: Duration,
}

impl SocketClientConfig {
    /// 기본 연결 타임아웃
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

    /// 설정 문자열 파싱. 장치 옵션 태그는 `options`에 반영된다.
    pub fn parse(cfg: &str, options: &mut DeviceOptions) -> Result<Self> {
        let mut res = Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            ..Self::default()
        };

        for (tag, value) in split_tag_values(cfg) {
            match tag {
                None => {
                    for addr in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        res.add_remote(addr)?;
                    }
                }
                Some("dn") => {
                    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        res.add_domain_name(name)?;
                    }
                }
                Some("Bind") => {
                    let addr = value.parse().map_err(|_| Error::InvalidValue {
                        tag: "Bind".into(),
                        value: value.into(),
                    })?;
                    res.bind_addr = Some(addr);
                }
                Some("ConnectTimeout") => {
                    res.connect_timeout =
                        Duration::from_millis(parse_millis("ConnectTimeout", value)?);
                }
                Some(tag) => {
                    if !options.on_tag_value(tag, value)? {
                        return Err(Error::UnknownTag { tag: tag.into() });
                    }
                }
            }
        }

        if res.remote_addrs.is_empty() && res.domain_names.is_empty() {
            return Err(Error::NoRemoteAddress);
        }
        Ok(res)
    }

    /// 소켓 주소가 아니면 `host:port` 도메인 이름으로 취급
    fn add_remote(&mut self, item: &str) -> Result<()> {
        match item.parse::<SocketAddr>() {
            Ok(addr) => {
                self.remote_addrs.push(addr);
                Ok(())
            }
            Err(_) => self.add_domain_name(item),
        }
    }

    fn add_domain_name(&mut self, name: &str) -> Result<()> {
        let valid = name
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(Error::InvalidValue {
                tag: "dn".into(),
                value: name.into(),
            });
        }
        self.domain_names.push(name.to_string());
        Ok(())
    }
}

/// TCP 서버 설정: `bind_addr|Backlog=n`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 리슨 주소
    pub bind_addr: SocketAddr,

    /// listen backlog
    pub backlog: u32,
}

impl ServerConfig {
    /// 설정 문자열 파싱. 장치 옵션 태그는 `options`에 반영된다.
    pub fn parse(cfg: &str, options: &mut DeviceOptions) -> Result<Self> {
        let mut bind_addr = None;
        let mut backlog = 1024;

        for (tag, value) in split_tag_values(cfg) {
            match tag {
                None => {
                    let addr = value.parse().map_err(|_| Error::InvalidValue {
                        tag: "bind".into(),
                        value: value.into(),
                    })?;
                    bind_addr = Some(addr);
                }
                Some("Backlog") => {
                    backlog = value.parse().map_err(|_| Error::InvalidValue {
                        tag: "Backlog".into(),
                        value: value.into(),
                    })?;
                }
                Some(tag) => {
                    if !options.on_tag_value(tag, value)? {
                        return Err(Error::UnknownTag { tag: tag.into() });
                    }
                }
            }
        }

        Ok(Self {
            bind_addr: bind_addr.ok_or(Error::NoRemoteAddress)?,
            backlog,
        })
    }
}
