//! Canal 설정
//!
//! 환경 변수 또는 `with_*` 빌더로 구성하고, `validate()`에서 정규식과 server id를 검사합니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::offset::{ReplicationPosition, MIN_BINLOG_POSITION};
use regex::Regex;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 서버 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flavor {
    #[default]
    Mysql,
    Mariadb,
}

impl FromStr for Flavor {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(Flavor::Mysql),
            "mariadb" => Ok(Flavor::Mariadb),
            other => Err(CdcError::Config(format!("unknown flavor: {}", other))),
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::Mysql => write!(f, "mysql"),
            Flavor::Mariadb => write!(f, "mariadb"),
        }
    }
}

/// 복제 시작 지점
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Position(ReplicationPosition),
    /// flavor 별 GTID 집합 문자열
    Gtid(String),
}

/// TLS 설정 (`tls` feature 필요)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// 없으면 webpki 루트 인증서 사용
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// 인증서 검증에 쓸 이름 (기본값: 접속 호스트)
    pub server_name: Option<String>,
}

/// Canal 설정
#[derive(Debug, Clone)]
pub struct CanalConfig {
    pub connection: ConnectionConfig,
    pub flavor: Flavor,
    pub tls: Option<TlsConfig>,
    pub semi_sync: bool,
    pub raw_mode: bool,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub start: Option<StartPoint>,
    pub reconnect_backoff: Duration,
    pub heartbeat_period: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub event_buffer: usize,
    pub verify_checksum: bool,
    pub save_interval: Duration,
    /// REGISTER_SLAVE 로 알리는 호스트 이름과 포트
    pub report_host: String,
    pub report_port: u16,
    pub position_file: Option<PathBuf>,
}

impl Default for CanalConfig {
    fn default() -> Self {
        CanalConfig {
            connection: ConnectionConfig::default(),
            flavor: Flavor::Mysql,
            tls: None,
            semi_sync: false,
            raw_mode: false,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            start: None,
            reconnect_backoff: Duration::from_secs(1),
            heartbeat_period: None,
            read_timeout: None,
            event_buffer: crate::stream::DEFAULT_CAPACITY,
            verify_checksum: false,
            save_interval: Duration::from_secs(1),
            report_host: String::new(),
            report_port: 0,
            position_file: None,
        }
    }
}

impl CanalConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        CanalConfig {
            connection,
            ..Default::default()
        }
    }

    /// 환경 변수에서 설정 읽기
    pub fn from_env() -> Result<Self> {
        let mut connection = ConnectionConfig::default();
        if let Ok(host) = env::var("DB_HOST") {
            connection.hostname = host;
        }
        if let Some(port) = env_parse::<u16>("DB_PORT")? {
            connection.port = port;
        }
        if let Ok(user) = env::var("DB_USER") {
            connection.username = user;
        }
        if let Ok(password) = env::var("DB_PASSWORD") {
            connection.password = password;
        }
        connection.database = env::var("DB_NAME").ok().filter(|s| !s.is_empty());
        if let Some(server_id) = env_parse::<u32>("CANAL_SERVER_ID")? {
            connection.server_id = server_id;
        }

        let mut config = CanalConfig::new(connection);
        if let Ok(flavor) = env::var("CANAL_FLAVOR") {
            config.flavor = flavor.parse()?;
        }
        config.include_tables = env_list("CANAL_INCLUDE_TABLES");
        config.exclude_tables = env_list("CANAL_EXCLUDE_TABLES");
        config.semi_sync = env_parse::<bool>("CANAL_SEMI_SYNC")?.unwrap_or(false);
        config.raw_mode = env_parse::<bool>("CANAL_RAW_MODE")?.unwrap_or(false);
        config.position_file = env::var("CANAL_POSITION_FILE").ok().map(PathBuf::from);
        // REGISTER_SLAVE 로 알리는 주소, 기본값은 이 호스트 이름
        config.report_host = env::var("CANAL_REPORT_HOST")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_default();
        if let Some(port) = env_parse::<u16>("CANAL_REPORT_PORT")? {
            config.report_port = port;
        }

        if let Ok(gtid) = env::var("CANAL_START_GTID") {
            config.start = Some(StartPoint::Gtid(gtid));
        } else if let Ok(file) = env::var("CANAL_START_FILE") {
            let offset = env_parse::<u64>("CANAL_START_POS")?.unwrap_or(MIN_BINLOG_POSITION);
            config.start = Some(StartPoint::Position(ReplicationPosition::new(file, offset)));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_semi_sync(mut self, enabled: bool) -> Self {
        self.semi_sync = enabled;
        self
    }

    pub fn with_raw_mode(mut self, enabled: bool) -> Self {
        self.raw_mode = enabled;
        self
    }

    pub fn with_include_tables<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_tables = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_tables<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_tables = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_start_position(mut self, position: ReplicationPosition) -> Self {
        self.start = Some(StartPoint::Position(position));
        self
    }

    pub fn with_start_gtid(mut self, gtid_set: impl Into<String>) -> Self {
        self.start = Some(StartPoint::Gtid(gtid_set.into()));
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = Some(period);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_verify_checksum(mut self, enabled: bool) -> Self {
        self.verify_checksum = enabled;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_report_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.report_host = host.into();
        self.report_port = port;
        self
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.connection.server_id == 0 {
            return Err(CdcError::Config("server_id must not be 0".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(CdcError::Config("event_buffer must be positive".to_string()));
        }
        compile_patterns(&self.include_tables)?;
        compile_patterns(&self.exclude_tables)?;
        if let Some(StartPoint::Position(pos)) = &self.start {
            if pos.offset < MIN_BINLOG_POSITION && !pos.file.is_empty() {
                return Err(CdcError::Config(format!(
                    "start position must be at least {}: {}",
                    MIN_BINLOG_POSITION, pos
                )));
            }
        }
        Ok(())
    }
}

/// 테이블 필터 정규식 컴파일 (전체 일치로 고정)
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{})$", p))
                .map_err(|e| CdcError::Config(format!("invalid table regex {:?}: {}", p, e)))
        })
        .collect()
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CdcError::Config(format!("invalid {}: {}", key, e))),
        _ => Ok(None),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
