//! MySQL / MariaDB Binlog 기반 CDC (Change Data Capture) 클라이언트
//!
//! 복제 슬레이브로 접속해 바이너리 로그를 받아 행 단위 변경 이벤트로 해석하고,
//! 등록된 핸들러에 분배합니다. 트리거 설치 없이 동작합니다.
//!
//! 주요 기능:
//! - Binlog 복제 프로토콜 (위치 / GTID 덤프, 세미싱크, 재연결)
//! - 이벤트 디코딩 (행 이미지, JSON, 체크섬)
//! - 테이블 스키마 캐시와 DDL 감지
//! - 테이블 필터 및 핸들러 분배
//! - 처리 위치 저장과 재시작

pub mod auth;
pub mod backup;
pub mod binlog;
pub mod binlog_client;
pub mod canal;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gtid;
pub mod handler;
pub mod json_binary;
pub mod offset;
pub mod protocol;
pub mod schema;
pub mod stream;

pub use binlog_client::{BinlogClient, ClientConfig, SessionState};
pub use canal::Canal;
pub use config::{CanalConfig, Flavor, StartPoint, TlsConfig};
pub use connection::{ConnectionConfig, MySqlMetadata};
pub use error::{CdcError, ErrorKind, Result};
pub use events::{BinlogEvent, CellValue, EventType, Row, RowChangeEvent, RowsAction};
pub use gtid::{FlavorGtidSet, GtidSet, MariadbGtidSet};
pub use handler::{HandlerRegistry, RowsEventHandler};
pub use offset::{FilePositionStore, MemoryPositionStore, PositionStore, ReplicationPosition};
pub use schema::{ColumnDef, MetadataSource, SchemaCache, TableSchema};
pub use stream::EventStream;
