//! Binlog 원본 백업
//!
//! 복제 스트림에서 받은 이벤트 바이트를 그대로 파일에 씁니다.
//! Rotate 이벤트마다 새 파일을 열고 맨 앞에 binlog 매직 헤더를 기록합니다.

use crate::binlog::{verify_magic, BINLOG_MAGIC};
use crate::error::{CdcError, Result};
use crate::events::{BinlogEvent, EventPayload};
use crate::offset::MIN_BINLOG_POSITION;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// 파일 단위 백업 작성기
#[derive(Debug)]
pub struct BackupWriter {
    dir: PathBuf,
    current: Option<(String, File)>,
    bytes_written: u64,
}

impl BackupWriter {
    /// 백업 디렉터리 생성
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(BackupWriter {
            dir,
            current: None,
            bytes_written: 0,
        })
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// 이벤트 하나 기록
    ///
    /// 가짜 Rotate (timestamp 0) 는 파일 전환에만 쓰고 기록하지 않습니다.
    pub async fn write_event(&mut self, event: &BinlogEvent, raw: &[u8]) -> Result<()> {
        if let EventPayload::Rotate(rotate) = &event.payload {
            if event.header.timestamp == 0 || event.header.log_pos == 0 {
                self.open(&rotate.next_binlog, rotate.position).await?;
                return Ok(());
            }
        }

        let (name, file) = self.current.as_mut().ok_or_else(|| {
            CdcError::ProtocolError("binlog event received before any rotate".to_string())
        })?;
        file.write_all(raw).await?;
        self.bytes_written += raw.len() as u64;
        if let EventPayload::Rotate(rotate) = &event.payload {
            debug!("{} rotated to {}", name, rotate.next_binlog);
            file.flush().await?;
        }
        Ok(())
    }

    /// 파일 열기
    ///
    /// 파일 시작부터 받으면 새로 만들고, 중간부터 이어받으면 기존 파일의 매직을 확인 후 이어 씁니다.
    async fn open(&mut self, binlog: &str, position: u64) -> Result<()> {
        if self.current_file() == Some(binlog) {
            return Ok(());
        }
        self.finish().await?;

        let path = self.path_for(binlog)?;
        let file = if position <= MIN_BINLOG_POSITION {
            let mut file = File::create(&path).await?;
            file.write_all(&BINLOG_MAGIC).await?;
            self.bytes_written += BINLOG_MAGIC.len() as u64;
            file
        } else {
            let mut header = [0u8; 4];
            let mut existing = File::open(&path).await.map_err(|e| {
                CdcError::IoError(format!("Cannot resume backup {}: {}", path.display(), e))
            })?;
            existing.read_exact(&mut header).await?;
            verify_magic(&header)?;
            OpenOptions::new().append(true).open(&path).await?
        };

        info!("Writing binlog backup {}", path.display());
        self.current = Some((binlog.to_string(), file));
        Ok(())
    }

    /// 디렉터리 밖으로 나가지 않도록 파일명만 사용
    fn path_for(&self, binlog: &str) -> Result<PathBuf> {
        let name = Path::new(binlog)
            .file_name()
            .ok_or_else(|| CdcError::ProtocolError(format!("Invalid binlog name: {}", binlog)))?;
        Ok(self.dir.join(name))
    }

    /// 현재 파일을 디스크에 반영하고 닫음
    pub async fn finish(&mut self) -> Result<()> {
        if let Some((_, mut file)) = self.current.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::fixtures;
    use crate::binlog::EventDecoder;

    async fn feed(writer: &mut BackupWriter, decoder: &mut EventDecoder, raw: Vec<u8>) {
        let event = decoder.decode(&raw).unwrap();
        writer.write_event(&event, &raw).await.unwrap();
    }

    #[tokio::test]
    async fn test_backup_writes_magic_and_events_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BackupWriter::new(dir.path()).await.unwrap();
        let mut decoder = EventDecoder::new().with_raw_mode(true);

        let fde = fixtures::format_description(false);
        let query = fixtures::query(300, "test", "CREATE TABLE t (id INT)");
        feed(&mut writer, &mut decoder, fixtures::rotate(4, "bin.000001")).await;
        feed(&mut writer, &mut decoder, fde.clone()).await;
        feed(&mut writer, &mut decoder, query.clone()).await;
        feed(&mut writer, &mut decoder, fixtures::rotate(4, "bin.000002")).await;
        writer.finish().await.unwrap();

        let first = std::fs::read(dir.path().join("bin.000001")).unwrap();
        assert_eq!(&first[..4], &BINLOG_MAGIC);
        assert_eq!(first.len(), 4 + fde.len() + query.len());

        let second = std::fs::read(dir.path().join("bin.000002")).unwrap();
        assert_eq!(second, BINLOG_MAGIC.to_vec());
    }

    #[tokio::test]
    async fn test_event_before_rotate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BackupWriter::new(dir.path()).await.unwrap();
        let mut decoder = EventDecoder::new();
        let raw = fixtures::format_description(false);
        let event = decoder.decode(&raw).unwrap();
        assert!(writer.write_event(&event, &raw).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_requires_existing_magic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bin.000003"), b"junk").unwrap();
        let mut writer = BackupWriter::new(dir.path()).await.unwrap();
        let mut decoder = EventDecoder::new();
        let raw = fixtures::rotate(1024, "bin.000003");
        let event = decoder.decode(&raw).unwrap();
        assert!(writer.write_event(&event, &raw).await.is_err());
    }
}
