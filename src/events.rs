//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::gtid::MariadbGtid;
use crate::schema::TableSchema;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    StartEventV3,
    /// 쿼리 이벤트 (DDL, BEGIN, statement 포맷 DML)
    QueryEvent,
    StopEvent,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent,
    IntvarEvent,
    /// 포맷 설명 이벤트 (체크섬 알고리즘 포함)
    FormatDescriptionEvent,
    /// 트랜잭션 커밋
    XidEvent,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent,
    WriteRowsEventV1,
    UpdateRowsEventV1,
    DeleteRowsEventV1,
    HeartbeatEvent,
    RowsQueryEvent,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEventV2,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEventV2,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEventV2,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent,
    AnonymousGtidEvent,
    PreviousGtidsEvent,
    TransactionPayloadEvent,
    MariadbAnnotateRowsEvent,
    MariadbBinlogCheckpointEvent,
    MariadbGtidEvent,
    MariadbGtidListEvent,
    /// 알 수 없는 이벤트 (원래 타입 코드 보존)
    Unknown(u8),
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::StartEventV3,
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            5 => EventType::IntvarEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            40 => EventType::TransactionPayloadEvent,
            160 => EventType::MariadbAnnotateRowsEvent,
            161 => EventType::MariadbBinlogCheckpointEvent,
            162 => EventType::MariadbGtidEvent,
            163 => EventType::MariadbGtidListEvent,
            other => EventType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            EventType::StartEventV3 => 1,
            EventType::QueryEvent => 2,
            EventType::StopEvent => 3,
            EventType::RotateEvent => 4,
            EventType::IntvarEvent => 5,
            EventType::FormatDescriptionEvent => 15,
            EventType::XidEvent => 16,
            EventType::TableMapEvent => 19,
            EventType::WriteRowsEventV1 => 23,
            EventType::UpdateRowsEventV1 => 24,
            EventType::DeleteRowsEventV1 => 25,
            EventType::HeartbeatEvent => 27,
            EventType::RowsQueryEvent => 29,
            EventType::WriteRowsEventV2 => 30,
            EventType::UpdateRowsEventV2 => 31,
            EventType::DeleteRowsEventV2 => 32,
            EventType::GtidEvent => 33,
            EventType::AnonymousGtidEvent => 34,
            EventType::PreviousGtidsEvent => 35,
            EventType::TransactionPayloadEvent => 40,
            EventType::MariadbAnnotateRowsEvent => 160,
            EventType::MariadbBinlogCheckpointEvent => 161,
            EventType::MariadbGtidEvent => 162,
            EventType::MariadbGtidListEvent => 163,
            EventType::Unknown(code) => *code,
        }
    }

    /// rows 이벤트라면 (액션, 버전) 반환
    pub fn rows_action(&self) -> Option<(RowsAction, u8)> {
        match self {
            EventType::WriteRowsEventV1 => Some((RowsAction::Insert, 1)),
            EventType::UpdateRowsEventV1 => Some((RowsAction::Update, 1)),
            EventType::DeleteRowsEventV1 => Some((RowsAction::Delete, 1)),
            EventType::WriteRowsEventV2 => Some((RowsAction::Insert, 2)),
            EventType::UpdateRowsEventV2 => Some((RowsAction::Update, 2)),
            EventType::DeleteRowsEventV2 => Some((RowsAction::Delete, 2)),
            _ => None,
        }
    }
}

/// Binlog 이벤트 헤더 (19 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더 + 페이로드 + 체크섬)
    pub event_size: u32,
    /// 다음 이벤트 위치 (가짜 이벤트는 0)
    pub log_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;
}

/// MySQL 컬럼 타입 (TABLE_MAP에 기록되는 타입 코드)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Option<Self> {
        let ty = match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        };
        Some(ty)
    }
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// TIMESTAMP (UTC epoch 기반)
    Timestamp(DateTime<Utc>),
    /// DATETIME, "0000-00-00 00:00:00" 같은 값이 있어 문자열로 유지
    DateTime(String),
    Date(String),
    Time(String),
    Year(u16),
    Decimal(String),
    /// ENUM 인덱스 (1부터 시작)
    Enum(u16),
    /// SET 비트마스크
    Set(u64),
    Bit(Vec<u8>),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int8(v) => Some(*v as i64),
            CellValue::Int16(v) => Some(*v as i64),
            CellValue::Int32(v) => Some(*v as i64),
            CellValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s)
            | CellValue::DateTime(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::Decimal(s) => Some(s.clone()),
            CellValue::Timestamp(dt) => Some(dt.to_rfc3339()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Year(y) => Some(y.to_string()),
            CellValue::Null => Some("NULL".to_string()),
            other => other.as_i64().map(|i| i.to_string()),
        }
    }

    /// JSON 출력용 변환
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            CellValue::Null => Value::Null,
            CellValue::Json(v) => v.clone(),
            CellValue::Enum(v) => Value::from(*v),
            CellValue::Set(v) => Value::from(*v),
            CellValue::Bytes(b) | CellValue::Bit(b) => {
                Value::String(String::from_utf8_lossy(b).into_owned())
            }
            other => match other.as_i64() {
                Some(i) => Value::from(i),
                None => other.as_string().map(Value::String).unwrap_or(Value::Null),
            },
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int64(v)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        CellValue::Int32(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::String(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::String(v)
    }
}

/// 한 행의 값들 (TABLE_MAP 컬럼 순서, 이미지에 없는 컬럼은 Null)
pub type Row = Vec<CellValue>;

/// 행 변경 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowsAction {
    Insert,
    Update,
    Delete,
}

impl RowsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowsAction::Insert => "insert",
            RowsAction::Update => "update",
            RowsAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RowsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 포맷 설명 이벤트 (15)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub post_header_lengths: Vec<u8>,
    /// 0 = NONE, 1 = CRC32
    pub checksum_alg: u8,
}

impl FormatDescriptionEvent {
    pub fn has_checksum(&self) -> bool {
        self.checksum_alg == 1
    }
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapEvent {
    /// 테이블 ID
    pub table_id: u64,
    pub flags: u16,
    /// 데이터베이스명
    pub schema: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들 (원본 타입 코드)
    pub column_types: Vec<u8>,
    /// 타입별로 해석된 컬럼 메타데이터
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsEvent {
    pub action: RowsAction,
    /// 1 또는 2
    pub version: u8,
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    /// 이 이벤트를 해석하는 데 쓴 테이블 맵
    pub table: Arc<TableMapEvent>,
    /// UPDATE는 [before, after, before, after, ...] 순서
    pub rows: Vec<Row>,
}

impl RowsEvent {
    /// UPDATE 행을 (before, after) 쌍으로 묶음
    pub fn pairs(&self) -> impl Iterator<Item = (&Row, &Row)> {
        self.rows.chunks_exact(2).map(|pair| (&pair[0], &pair[1]))
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEvent {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    /// 데이터베이스명
    pub schema: String,
    /// 쿼리 문자열
    pub query: String,
}

impl QueryEvent {
    pub fn is_begin(&self) -> bool {
        self.query.trim().eq_ignore_ascii_case("BEGIN")
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEvent {
    /// 새 파일의 시작 위치
    pub position: u64,
    /// 새 바이너리 로그 파일명
    pub next_binlog: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidEvent {
    pub xid: u64,
}

/// GTID 이벤트 데이터 (MySQL)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEvent {
    pub flags: u8,
    pub sid: Uuid,
    pub gno: u64,
}

impl fmt::Display for GtidEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sid, self.gno)
    }
}

/// MariaDB GTID 이벤트 데이터 (162)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidEvent {
    pub gtid: MariadbGtid,
    pub flags: u8,
}

/// 이벤트 페이로드
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Rotate(RotateEvent),
    FormatDescription(FormatDescriptionEvent),
    TableMap(Arc<TableMapEvent>),
    Rows(RowsEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    Gtid(GtidEvent),
    MariadbGtid(MariadbGtidEvent),
    /// 해석하지 않는 이벤트 (페이로드 원본)
    Unknown(Bytes),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, PartialEq)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub payload: EventPayload,
}

impl BinlogEvent {
    /// 트랜잭션 경계 이벤트 여부 (재시작해도 안전한 지점)
    pub fn is_transaction_boundary(&self) -> bool {
        match &self.payload {
            EventPayload::Xid(_) | EventPayload::Rotate(_) => true,
            EventPayload::Query(q) => !q.is_begin(),
            _ => false,
        }
    }
}

/// 핸들러에 전달되는 행 변경 묶음
#[derive(Debug, Clone)]
pub struct RowChangeEvent {
    pub action: RowsAction,
    pub table: Arc<TableSchema>,
    pub rows: Vec<Row>,
    /// 이벤트 헤더 (타임스탬프, 위치)
    pub header: EventHeader,
}
