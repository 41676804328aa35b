//! 테이블 스키마 캐시
//!
//! 테이블별 컬럼 정보를 처음 참조할 때 한 번만 조회하고, DDL 쿼리 이벤트를 보면 무효화합니다.
//! 같은 테이블에 대한 동시 조회는 하나의 메타데이터 쿼리로 합쳐집니다.

use crate::error::Result;
use crate::offset::ReplicationPosition;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::debug;

/// 컬럼 정의
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// INFORMATION_SCHEMA.COLUMNS.COLUMN_TYPE (e.g. "int(10) unsigned")
    pub column_type: String,
    pub nullable: bool,
    pub is_primary: bool,
    pub extra: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            column_type: column_type.into(),
            nullable: true,
            is_primary: false,
            extra: String::new(),
        }
    }

    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }
}

/// 테이블 스키마
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub is_view: bool,
}

impl TableSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        TableSchema {
            schema: schema.into(),
            name: name.into(),
            columns,
            is_view: false,
        }
    }

    /// "schema.table"
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_keys(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary)
            .map(|(i, _)| i)
            .collect()
    }
}

pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// 스키마 메타데이터 조회 계층
///
/// 서버 설정 조회 메서드는 선택 사항이며 기본 구현은 `None`을 돌려줍니다.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// 테이블이 없으면 `CdcError::NotFound`
    async fn load_table(&self, schema: &str, table: &str) -> Result<TableSchema>;

    async fn binlog_format(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn binlog_row_image(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// 서버의 현재 binlog 위치
    async fn master_position(&self) -> Result<Option<ReplicationPosition>> {
        Ok(None)
    }
}

type Slot = Arc<OnceCell<Arc<TableSchema>>>;

/// 테이블 스키마 캐시
pub struct SchemaCache {
    source: Arc<dyn MetadataSource>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl SchemaCache {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        SchemaCache {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 스키마 조회 (없으면 한 번만 로드)
    ///
    /// 로드가 실패하면 슬롯이 비어 있는 채로 남아 다음 호출에서 다시 시도합니다.
    pub async fn get(&self, schema: &str, table: &str) -> Result<Arc<TableSchema>> {
        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry(qualified_name(schema, table))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let loaded = slot
            .get_or_try_init(|| async {
                debug!("Loading table schema {}.{}", schema, table);
                self.source.load_table(schema, table).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(loaded))
    }

    /// 캐시 항목 제거, 제거된 항목이 있었으면 true
    pub fn invalidate(&self, schema: &str, table: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .remove(&qualified_name(schema, table))
            .is_some();
        if removed {
            debug!("Invalidated table schema {}.{}", schema, table);
        }
        removed
    }

    /// DDL 쿼리면 해당 테이블을 무효화하고 (schema, table) 반환
    ///
    /// 쿼리에 스키마가 없으면 이벤트의 기본 스키마를 사용합니다.
    pub fn apply_ddl(&self, default_schema: &str, query: &str) -> Option<(String, String)> {
        let (schema, table) = extract_table(query)?;
        let schema = if schema.is_empty() {
            default_schema.to_string()
        } else {
            schema
        };
        self.invalidate(&schema, &table);
        Some((schema, table))
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const QUALIFIED: &str = r"(?:`?(?P<db>[^`\s.]+)`?\.)?`?(?P<table>[^`\s.,;(]+)`?";

fn ddl_matchers() -> &'static [Regex] {
    static MATCHERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        [
            r"CREATE\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?",
            r"ALTER\s+(?:ONLINE\s+)?(?:IGNORE\s+)?TABLE\s+",
            r"RENAME\s+TABLE\s+",
            r"DROP\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+EXISTS\s+)?",
            r"TRUNCATE\s+(?:TABLE\s+)?",
        ]
        .iter()
        .filter_map(|prefix| Regex::new(&format!(r"(?i)^\s*{}{}", prefix, QUALIFIED)).ok())
        .collect()
    })
}

/// DDL 쿼리에서 (schema, table) 추출
///
/// CREATE, ALTER, RENAME, DROP, TRUNCATE 순서로 검사해 처음 맞는 패턴을 사용합니다.
/// 스키마가 없으면 빈 문자열.
pub fn extract_table(query: &str) -> Option<(String, String)> {
    ddl_matchers().iter().find_map(|re| {
        let caps = re.captures(query)?;
        let table = caps.name("table")?.as_str().to_string();
        let schema = caps
            .name("db")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Some((schema, table))
    })
}
