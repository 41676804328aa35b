//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치 → `"mysql-bin.000003;4097"`

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// binlog 파일은 4 바이트 매직 헤더 뒤에서 시작
pub const MIN_BINLOG_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
///
/// 필드 순서대로 비교하므로 파일명이 먼저, 같은 파일이면 오프셋으로 정렬됩니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicationPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub offset: u64,
}

impl ReplicationPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        ReplicationPosition {
            file: file.into(),
            offset,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.file.rsplit('.').next().and_then(|s| s.parse().ok())
    }

    /// 덤프 명령에 사용할 위치 (4 미만은 4로 보정)
    pub fn dump_offset(&self) -> u64 {
        self.offset.max(MIN_BINLOG_POSITION)
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.file, self.offset)
    }
}

impl FromStr for ReplicationPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (file, offset) = s
            .rsplit_once(';')
            .ok_or_else(|| CdcError::Config(format!("Invalid position string: {}", s)))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|_| CdcError::Config(format!("Invalid position offset: {}", s)))?;
        Ok(ReplicationPosition::new(file, offset))
    }
}

/// 위치 저장소 (외부 설정값 저장 계층)
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// 마지막으로 저장된 위치 문자열
    async fn load(&self) -> Result<Option<String>>;

    async fn save(&self, value: &str) -> Result<()>;
}

/// 메모리 위치 저장소
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    value: Mutex<Option<String>>,
    writes: Mutex<u64>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        MemoryPositionStore {
            value: Mutex::new(Some(value.into())),
            writes: Mutex::new(0),
        }
    }

    pub fn value(&self) -> Option<String> {
        self.value.lock().clone()
    }

    /// 지금까지 save가 호출된 횟수
    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.value.lock().clone())
    }

    async fn save(&self, value: &str) -> Result<()> {
        *self.value.lock() = Some(value.to_string());
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// 파일 위치 저장소
///
/// 임시 파일에 쓴 뒤 rename 하므로 중간에 죽어도 이전 값이 남습니다.
#[derive(Debug, Clone)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FilePositionStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let value = content.trim();
                Ok(if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CdcError::Other(format!(
                "Failed to read position file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, value: &str) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| CdcError::Other(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            CdcError::Other(format!("Failed to rename {}: {}", tmp.display(), e))
        })?;
        Ok(())
    }
}
