//! CDC 관련 에러 타입
//!
//! 에러 값마다 `ErrorKind`를 하나씩 매핑해서, 호출자는 타입이 아닌 종류로 분기합니다.

use std::io;
use thiserror::Error;

/// 에러 종류 (제어 흐름 판단용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 이미 덤프가 진행 중
    AlreadyRunning,
    /// 닫힌 세션/스트림에 대한 요청
    AlreadyClosed,
    /// 스트림이 오염됨, 재시작하면 복구 가능
    Temporary,
    /// 서버 설정이 호환되지 않음
    NotSupported,
    /// 필터에 의해 제외된 테이블
    NotAllowed,
    /// 테이블 스키마가 사라짐
    NotFound,
    /// 핸들러가 복제 루프 중단을 요청
    Interrupted,
    /// 복구 불가능한 디코딩/프로토콜 위반
    Fatal,
    /// 취소 신호
    Cancelled,
    /// 네트워크 계층 에러 (재시도 대상)
    Transport,
    Other,
}

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("table_id={0}에 대한 TABLE_MAP 이벤트가 없습니다")]
    MissingTableMap(u64),

    #[error("체크섬 불일치: expected={expected:#010x}, actual={actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("서버 에러 {code} ({state}): {message}")]
    ServerError {
        code: u16,
        state: String,
        message: String,
    },

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("이미 binlog 덤프가 실행 중입니다")]
    AlreadyRunning,

    #[error("이미 닫혔습니다")]
    AlreadyClosed,

    #[error("스트림을 다시 시작해야 합니다: {0}")]
    Temporary(String),

    #[error("지원하지 않는 설정: {0}")]
    NotSupported(String),

    #[error("허용되지 않은 테이블: {0}")]
    NotAllowed(String),

    #[error("테이블을 찾을 수 없습니다: {0}")]
    NotFound(String),

    #[error("핸들러가 중단을 요청했습니다: {0}")]
    Interrupted(String),

    #[error("취소되었습니다")]
    Cancelled,

    #[error("핸들러 {handler} 실패: {source}")]
    Handler {
        handler: String,
        #[source]
        source: Box<CdcError>,
    },

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CdcError::ConnectionError(_) | CdcError::IoError(_) | CdcError::Timeout => {
                ErrorKind::Transport
            }
            CdcError::BinlogParseError(_)
            | CdcError::MissingTableMap(_)
            | CdcError::ChecksumMismatch { .. }
            | CdcError::ProtocolError(_)
            | CdcError::ServerError { .. } => ErrorKind::Fatal,
            CdcError::AlreadyRunning => ErrorKind::AlreadyRunning,
            CdcError::AlreadyClosed => ErrorKind::AlreadyClosed,
            CdcError::Temporary(_) => ErrorKind::Temporary,
            CdcError::NotSupported(_) => ErrorKind::NotSupported,
            CdcError::NotAllowed(_) => ErrorKind::NotAllowed,
            CdcError::NotFound(_) => ErrorKind::NotFound,
            CdcError::Interrupted(_) => ErrorKind::Interrupted,
            CdcError::Cancelled => ErrorKind::Cancelled,
            CdcError::Handler { source, .. } => source.kind(),
            CdcError::GtidError(_)
            | CdcError::QueryError(_)
            | CdcError::Config(_)
            | CdcError::SerializationError(_)
            | CdcError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// 핸들러에서 복제 루프를 멈추고 싶을 때 반환하는 에러
    pub fn interrupted(reason: impl Into<String>) -> Self {
        CdcError::Interrupted(reason.into())
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_transport() {
        let err: CdcError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_handler_wrapper_keeps_source_kind() {
        let err = CdcError::Handler {
            handler: "audit".to_string(),
            source: Box::new(CdcError::interrupted("stop")),
        };
        assert!(err.is(ErrorKind::Interrupted));
        assert!(err.to_string().contains("audit"));
    }

    #[test]
    fn test_server_error_is_fatal() {
        let err = CdcError::ServerError {
            code: 1236,
            state: "HY000".to_string(),
            message: "Could not find first log file name".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
