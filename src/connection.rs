//! MySQL 데이터베이스 연결 관리
//!
//! 복제 스트림은 `protocol`의 전용 연결을 쓰고, 스키마/서버 설정 조회는
//! `mysql_async` 커넥션 풀을 통해 수행합니다.

use crate::error::{CdcError, Result};
use crate::offset::ReplicationPosition;
use crate::schema::{ColumnDef, MetadataSource, TableSchema};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, Row};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// MySQL 연결 설정
#[derive(Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 슬레이브로 등록할 때 쓰는 server id (서버 내에서 유일해야 함)
    pub server_id: u32,
    pub timeout: Duration,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("server_id", &self.server_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// `mysql_async` 기반 메타데이터 조회
pub struct MySqlMetadata {
    pool: Pool,
}

impl MySqlMetadata {
    pub fn new(config: &ConnectionConfig) -> Self {
        MySqlMetadata {
            pool: Pool::new(config.build_opts()),
        }
    }

    async fn conn(&self) -> Result<mysql_async::Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))
    }

    /// 글로벌 변수 조회
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let result: Option<(String, String)> = conn
            .exec_first("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.map(|(_, v)| v))
    }

    async fn binlog_status(&self, query: &str) -> Result<Option<ReplicationPosition>> {
        let mut conn = self.conn().await?;
        let row: Option<Row> = conn
            .query_first(query)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query binlog status: {}", e)))?;

        Ok(row.and_then(|row| {
            let file = row.get_opt::<String, usize>(0)?.ok()?;
            let position = row.get_opt::<u64, usize>(1)?.ok()?;
            Some(ReplicationPosition::new(file, position))
        }))
    }

    /// 풀 정리
    pub async fn close(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to close pool: {}", e)))
    }
}

#[async_trait]
impl MetadataSource for MySqlMetadata {
    async fn load_table(&self, schema: &str, table: &str) -> Result<TableSchema> {
        let mut conn = self.conn().await?;

        let columns: Vec<(String, String, String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, EXTRA \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        if columns.is_empty() {
            return Err(CdcError::NotFound(format!("{}.{}", schema, table)));
        }

        let table_type: Option<String> = conn
            .exec_first(
                "SELECT TABLE_TYPE FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (schema, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table type: {}", e)))?;

        debug!("Loaded {} columns for {}.{}", columns.len(), schema, table);

        Ok(TableSchema {
            schema: schema.to_string(),
            name: table.to_string(),
            columns: columns
                .into_iter()
                .map(|(name, column_type, is_nullable, column_key, extra)| ColumnDef {
                    name,
                    column_type,
                    nullable: is_nullable == "YES",
                    is_primary: column_key == "PRI",
                    extra,
                })
                .collect(),
            is_view: table_type.as_deref() == Some("VIEW"),
        })
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    async fn binlog_format(&self) -> Result<Option<String>> {
        self.get_variable("binlog_format").await
    }

    async fn binlog_row_image(&self) -> Result<Option<String>> {
        self.get_variable("binlog_row_image").await
    }

    /// MySQL 8.4 부터 SHOW MASTER STATUS 가 없어졌으므로 실패하면 새 구문으로 재시도
    async fn master_position(&self) -> Result<Option<ReplicationPosition>> {
        match self.binlog_status("SHOW MASTER STATUS").await {
            Ok(position) => Ok(position),
            Err(e) => {
                warn!("SHOW MASTER STATUS failed ({}), trying SHOW BINARY LOG STATUS", e);
                self.binlog_status("SHOW BINARY LOG STATUS").await
            }
        }
    }
}
