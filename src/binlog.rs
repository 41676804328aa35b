//! MySQL Binlog 이벤트 디코딩
//!
//! Binlog 파일의 바이너리 형식을 파싱합니다.
//! 헤더: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e)
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, 체크섬이 켜진 경우)

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::gtid::MariadbGtid;
use crate::json_binary::decode_json;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII
const CHECKSUM_SIZE: usize = 4;
/// FDE 고정 영역: binlog_version(2) + server_version(50) + create_timestamp(4) + header_length(1)
const FDE_FIXED_SIZE: usize = 57;

/// Binlog 파일 헤더 검증
pub fn verify_magic(data: &[u8]) -> Result<()> {
    if data.len() < 4 {
        return Err(CdcError::BinlogParseError(
            "Invalid binlog: too short".to_string(),
        ));
    }

    if data[0..4] == BINLOG_MAGIC[..] {
        Ok(())
    } else {
        Err(CdcError::BinlogParseError(
            "Invalid binlog magic number".to_string(),
        ))
    }
}

/// 이벤트 헤더 파싱
pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
    if data.len() < EventHeader::SIZE {
        return Err(CdcError::BinlogParseError(format!(
            "Invalid event header: {} bytes",
            data.len()
        )));
    }

    read_header(&mut Cursor::new(data))
        .map_err(|e| CdcError::BinlogParseError(format!("event header: {}", e)))
}

fn read_header(cursor: &mut Cursor<&[u8]>) -> io::Result<EventHeader> {
    Ok(EventHeader {
        timestamp: cursor.read_u32::<LittleEndian>()?,
        event_type: EventType::from_u8(cursor.read_u8()?),
        server_id: cursor.read_u32::<LittleEndian>()?,
        event_size: cursor.read_u32::<LittleEndian>()?,
        log_pos: cursor.read_u32::<LittleEndian>()?,
        flags: cursor.read_u16::<LittleEndian>()?,
    })
}

/// Binlog 이벤트 디코더
///
/// 세션 단위로 하나씩 사용합니다. FORMAT_DESCRIPTION 이벤트로 체크섬 여부를,
/// TABLE_MAP 이벤트로 뒤따르는 rows 이벤트의 컬럼 레이아웃을 기억합니다.
#[derive(Debug, Default)]
pub struct EventDecoder {
    format: Option<FormatDescriptionEvent>,
    /// 현재 스트림의 이벤트에 CRC32 trailer가 붙어 있는지
    checksum: bool,
    tables: HashMap<u64, Arc<TableMapEvent>>,
    raw_mode: bool,
    verify_checksum: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 헤더/ROTATE/FORMAT_DESCRIPTION만 해석하고 나머지는 원본 바이트로 전달
    pub fn with_raw_mode(mut self, raw_mode: bool) -> Self {
        self.raw_mode = raw_mode;
        self
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn format(&self) -> Option<&FormatDescriptionEvent> {
        self.format.as_ref()
    }

    pub fn table(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    /// 이벤트 하나 디코딩 (헤더 + 페이로드 + 선택적 CRC32)
    pub fn decode(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let header = parse_header(data)?;
        let is_fde = header.event_type == EventType::FormatDescriptionEvent;

        let has_checksum = if is_fde {
            fde_has_trailer(data)
        } else {
            self.checksum
        };

        let payload_end = if has_checksum {
            if data.len() < EventHeader::SIZE + CHECKSUM_SIZE {
                return Err(CdcError::BinlogParseError(format!(
                    "{:?} event too short for checksum: {} bytes",
                    header.event_type,
                    data.len()
                )));
            }
            let end = data.len() - CHECKSUM_SIZE;
            if self.verify_checksum {
                let mut trailer = &data[end..];
                let expected = trailer.read_u32::<LittleEndian>()?;
                let actual = crc32fast::hash(&data[..end]);
                if expected != actual {
                    return Err(CdcError::ChecksumMismatch { expected, actual });
                }
            }
            end
        } else {
            data.len()
        };
        let payload = &data[EventHeader::SIZE..payload_end];

        trace!(
            "Decoding {:?} event, {} bytes payload (checksum={})",
            header.event_type,
            payload.len(),
            has_checksum
        );

        let event_type = header.event_type;
        let payload = match event_type {
            EventType::FormatDescriptionEvent => {
                let fde = decode_format_description(payload)
                    .map_err(|e| decode_error(event_type, e))?;
                debug!(
                    "FDE: binlog_version={}, server={}, checksum_alg={}",
                    fde.binlog_version, fde.server_version, fde.checksum_alg
                );
                self.checksum = has_checksum;
                self.format = Some(fde.clone());
                // 새 FDE 이후의 table_id는 이전 것과 무관
                self.tables.clear();
                EventPayload::FormatDescription(fde)
            }
            EventType::RotateEvent => EventPayload::Rotate(
                decode_rotate(payload).map_err(|e| decode_error(event_type, e))?,
            ),
            _ if self.raw_mode => EventPayload::Unknown(Bytes::copy_from_slice(payload)),
            EventType::TableMapEvent => {
                let table =
                    Arc::new(decode_table_map(payload).map_err(|e| decode_error(event_type, e))?);
                self.tables.insert(table.table_id, table.clone());
                EventPayload::TableMap(table)
            }
            EventType::QueryEvent => {
                EventPayload::Query(decode_query(payload).map_err(|e| decode_error(event_type, e))?)
            }
            EventType::XidEvent => {
                let xid = (&payload[..])
                    .read_u64::<LittleEndian>()
                    .map_err(|e| decode_error(event_type, e))?;
                EventPayload::Xid(XidEvent { xid })
            }
            EventType::GtidEvent | EventType::AnonymousGtidEvent => {
                EventPayload::Gtid(decode_gtid(payload).map_err(|e| decode_error(event_type, e))?)
            }
            EventType::MariadbGtidEvent => EventPayload::MariadbGtid(
                decode_mariadb_gtid(payload, header.server_id)
                    .map_err(|e| decode_error(event_type, e))?,
            ),
            other => match other.rows_action() {
                Some((action, version)) => {
                    EventPayload::Rows(self.decode_rows(payload, action, version)?)
                }
                None => EventPayload::Unknown(Bytes::copy_from_slice(payload)),
            },
        };

        Ok(BinlogEvent { header, payload })
    }

    fn decode_rows(&self, data: &[u8], action: RowsAction, version: u8) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(data);
        let table_id = cursor
            .read_u48::<LittleEndian>()
            .map_err(|e| CdcError::BinlogParseError(format!("{} rows event: {}", action, e)))?;
        let table = self
            .tables
            .get(&table_id)
            .cloned()
            .ok_or(CdcError::MissingTableMap(table_id))?;

        let (flags, column_count, rows) =
            decode_rows_body(&mut cursor, &table, action, version).map_err(|e| {
                CdcError::BinlogParseError(format!(
                    "{} rows event for {}: {}",
                    action,
                    table.qualified_name(),
                    e
                ))
            })?;

        Ok(RowsEvent {
            action,
            version,
            table_id,
            flags,
            column_count,
            table,
            rows,
        })
    }
}

fn decode_error(event_type: EventType, err: io::Error) -> CdcError {
    CdcError::BinlogParseError(format!("{:?}: {}", event_type, err))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// FDE 뒤에 CRC32가 붙어 있는지 (실제 CRC 값이 맞는지로 판단)
fn fde_has_trailer(data: &[u8]) -> bool {
    if data.len() < EventHeader::SIZE + FDE_FIXED_SIZE + 1 + CHECKSUM_SIZE {
        return false;
    }
    let end = data.len() - CHECKSUM_SIZE;
    let mut trailer = &data[end..];
    match trailer.read_u32::<LittleEndian>() {
        Ok(stored) => stored == crc32fast::hash(&data[..end]),
        Err(_) => false,
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("need {} bytes, {} left", len, remaining),
        ));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}

/// 패킹된 정수 (length-encoded integer)
pub(crate) fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => cursor.read_u64::<LittleEndian>(),
        _ => Err(invalid_data(format!("invalid packed integer prefix {:#x}", byte))),
    }
}

fn decode_format_description(data: &[u8]) -> io::Result<FormatDescriptionEvent> {
    if data.len() < FDE_FIXED_SIZE {
        return Err(invalid_data("format description too short"));
    }
    let mut cursor = Cursor::new(data);
    let binlog_version = cursor.read_u16::<LittleEndian>()?;
    let version_bytes = read_bytes(&mut cursor, 50)?;
    let server_version = String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = cursor.read_u32::<LittleEndian>()?;
    let header_length = cursor.read_u8()?;

    // 체크섬을 아는 서버(5.6.1+)는 post-header 배열 뒤에 checksum_alg 1 byte를 둠
    let rest = &data[FDE_FIXED_SIZE..];
    let (post_header_lengths, checksum_alg) = if version_has_checksum(&server_version) {
        match rest.split_last() {
            Some((alg, lengths)) => (lengths.to_vec(), *alg),
            None => (Vec::new(), 0),
        }
    } else {
        (rest.to_vec(), 0)
    };

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        post_header_lengths,
        checksum_alg,
    })
}

/// "8.0.35-log", "10.6.12-MariaDB" 같은 버전 문자열에서 체크섬 지원 여부 판단
fn version_has_checksum(version: &str) -> bool {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    if version.contains("MariaDB") {
        return (major, minor) >= (5, 3);
    }
    (major, minor, patch) >= (5, 6, 1)
}

fn decode_rotate(data: &[u8]) -> io::Result<RotateEvent> {
    let mut cursor = Cursor::new(data);
    let position = cursor.read_u64::<LittleEndian>()?;
    let next_binlog = String::from_utf8_lossy(&data[8..])
        .trim_end_matches('\0')
        .to_string();
    Ok(RotateEvent {
        position,
        next_binlog,
    })
}

fn decode_query(data: &[u8]) -> io::Result<QueryEvent> {
    let mut cursor = Cursor::new(data);
    let thread_id = cursor.read_u32::<LittleEndian>()?;
    let exec_time = cursor.read_u32::<LittleEndian>()?;
    let schema_len = cursor.read_u8()? as usize;
    let error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as usize;

    // Status variables skip
    read_bytes(&mut cursor, status_len)?;
    let schema = String::from_utf8_lossy(&read_bytes(&mut cursor, schema_len)?).to_string();
    cursor.read_u8()?; // null terminator

    let query = String::from_utf8_lossy(&data[cursor.position() as usize..]).to_string();

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        query,
    })
}

fn decode_gtid(data: &[u8]) -> io::Result<GtidEvent> {
    let mut cursor = Cursor::new(data);
    let flags = cursor.read_u8()?;
    let mut sid = [0u8; 16];
    cursor.read_exact(&mut sid)?;
    let gno = cursor.read_u64::<LittleEndian>()?;
    Ok(GtidEvent {
        flags,
        sid: Uuid::from_bytes(sid),
        gno,
    })
}

fn decode_mariadb_gtid(data: &[u8], server_id: u32) -> io::Result<MariadbGtidEvent> {
    let mut cursor = Cursor::new(data);
    let sequence = cursor.read_u64::<LittleEndian>()?;
    let domain_id = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u8()?;
    Ok(MariadbGtidEvent {
        gtid: MariadbGtid {
            domain_id,
            server_id,
            sequence,
        },
        flags,
    })
}

/// 테이블 맵 이벤트 파싱 (19)
fn decode_table_map(data: &[u8]) -> io::Result<TableMapEvent> {
    let mut cursor = Cursor::new(data);

    let table_id = cursor.read_u48::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    // 데이터베이스명 (길이 + 이름 + NUL)
    let schema_len = cursor.read_u8()? as usize;
    let schema = String::from_utf8_lossy(&read_bytes(&mut cursor, schema_len)?).to_string();
    cursor.read_u8()?;

    // 테이블명 (길이 + 이름 + NUL)
    let table_len = cursor.read_u8()? as usize;
    let table = String::from_utf8_lossy(&read_bytes(&mut cursor, table_len)?).to_string();
    cursor.read_u8()?;

    let column_count = read_packed_int(&mut cursor)? as usize;
    let column_types = read_bytes(&mut cursor, column_count)?;

    let meta_len = read_packed_int(&mut cursor)? as usize;
    let meta = read_bytes(&mut cursor, meta_len)?;
    let column_meta = decode_column_meta(&column_types, &meta)?;

    let null_bitmap = read_bytes(&mut cursor, column_count.div_ceil(8))?;
    // 이후의 optional metadata (MySQL 8 binlog_row_metadata=FULL)는 사용하지 않음

    Ok(TableMapEvent {
        table_id,
        flags,
        schema,
        table,
        column_types,
        column_meta,
        null_bitmap,
    })
}

fn decode_column_meta(column_types: &[u8], meta: &[u8]) -> io::Result<Vec<u16>> {
    let mut cursor = Cursor::new(meta);
    let mut result = Vec::with_capacity(column_types.len());

    for &code in column_types {
        let value = match ColumnType::from_u8(code) {
            Some(
                ColumnType::Float
                | ColumnType::Double
                | ColumnType::Blob
                | ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Json
                | ColumnType::Geometry
                | ColumnType::Time2
                | ColumnType::DateTime2
                | ColumnType::Timestamp2,
            ) => cursor.read_u8()? as u16,
            Some(ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit) => {
                cursor.read_u16::<LittleEndian>()?
            }
            // (real_type, length), (precision, scale) 순서의 2 bytes
            Some(
                ColumnType::String
                | ColumnType::Enum
                | ColumnType::Set
                | ColumnType::NewDecimal,
            ) => cursor.read_u16::<BigEndian>()?,
            _ => 0,
        };
        result.push(value);
    }

    Ok(result)
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|b| b & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

fn decode_rows_body(
    cursor: &mut Cursor<&[u8]>,
    table: &TableMapEvent,
    action: RowsAction,
    version: u8,
) -> io::Result<(u16, usize, Vec<Row>)> {
    let flags = cursor.read_u16::<LittleEndian>()?;
    if version == 2 {
        // extra data 길이는 자기 자신 2 bytes 포함
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        read_bytes(cursor, extra_len.saturating_sub(2))?;
    }

    let column_count = read_packed_int(cursor)? as usize;
    if column_count > table.column_count() {
        return Err(invalid_data(format!(
            "rows event has {} columns, table map has {}",
            column_count,
            table.column_count()
        )));
    }

    let bitmap_len = column_count.div_ceil(8);
    let present = read_bytes(cursor, bitmap_len)?;
    let present_after = if action == RowsAction::Update {
        read_bytes(cursor, bitmap_len)?
    } else {
        present.clone()
    };

    let mut rows = Vec::new();
    while remaining(cursor) > 0 {
        rows.push(decode_row(cursor, table, column_count, &present)?);
        if action == RowsAction::Update {
            rows.push(decode_row(cursor, table, column_count, &present_after)?);
        }
    }

    Ok((flags, column_count, rows))
}

/// 행 이미지 하나 디코딩
///
/// null 비트맵은 이미지에 포함된 컬럼 수만큼만 비트를 가집니다.
fn decode_row(
    cursor: &mut Cursor<&[u8]>,
    table: &TableMapEvent,
    column_count: usize,
    present: &[u8],
) -> io::Result<Row> {
    let null_bitmap = read_bytes(cursor, count_set_bits(present).div_ceil(8))?;
    let mut row = Vec::with_capacity(column_count);
    let mut null_idx = 0;

    for col in 0..column_count {
        if !is_bit_set(present, col) {
            row.push(CellValue::Null);
            continue;
        }
        let is_null = is_bit_set(&null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            row.push(CellValue::Null);
            continue;
        }
        let code = table.column_types[col];
        let meta = table.column_meta.get(col).copied().unwrap_or(0);
        row.push(decode_value(cursor, code, meta)?);
    }

    Ok(row)
}

fn read_length(cursor: &mut Cursor<&[u8]>, size: u16) -> io::Result<usize> {
    Ok(match size {
        1 => cursor.read_u8()? as usize,
        2 => cursor.read_u16::<LittleEndian>()? as usize,
        3 => cursor.read_u24::<LittleEndian>()? as usize,
        4 => cursor.read_u32::<LittleEndian>()? as usize,
        other => return Err(invalid_data(format!("invalid length size {}", other))),
    })
}

fn decode_value(cursor: &mut Cursor<&[u8]>, code: u8, meta: u16) -> io::Result<CellValue> {
    let column_type = ColumnType::from_u8(code)
        .ok_or_else(|| invalid_data(format!("unknown column type {}", code)))?;

    let value = match column_type {
        ColumnType::Tiny => CellValue::Int8(cursor.read_i8()?),
        ColumnType::Short => CellValue::Int16(cursor.read_i16::<LittleEndian>()?),
        ColumnType::Int24 => CellValue::Int32(cursor.read_i24::<LittleEndian>()?),
        ColumnType::Long => CellValue::Int32(cursor.read_i32::<LittleEndian>()?),
        ColumnType::LongLong => CellValue::Int64(cursor.read_i64::<LittleEndian>()?),
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Year => match cursor.read_u8()? {
            0 => CellValue::Year(0),
            y => CellValue::Year(1900 + y as u16),
        },
        ColumnType::Date => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0f,
                packed & 0x1f
            ))
        }
        ColumnType::Time => {
            let packed = cursor.read_i24::<LittleEndian>()?;
            let sign = if packed < 0 { "-" } else { "" };
            let v = packed.unsigned_abs();
            CellValue::Time(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                v / 10000,
                (v / 100) % 100,
                v % 100
            ))
        }
        ColumnType::DateTime => {
            let v = cursor.read_u64::<LittleEndian>()?;
            CellValue::DateTime(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                v / 10_000_000_000,
                (v / 100_000_000) % 100,
                (v / 1_000_000) % 100,
                (v / 10_000) % 100,
                (v / 100) % 100,
                v % 100
            ))
        }
        ColumnType::Timestamp => timestamp_value(cursor.read_u32::<LittleEndian>()?, 0, 0),
        ColumnType::Timestamp2 => {
            let secs = cursor.read_u32::<BigEndian>()?;
            let micros = read_fraction(cursor, meta as u8)?;
            timestamp_value(secs, micros, meta as u8)
        }
        ColumnType::DateTime2 => decode_datetime2(cursor, meta as u8)?,
        ColumnType::Time2 => decode_time2(cursor, meta as u8)?,
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            CellValue::String(String::from_utf8_lossy(&read_bytes(cursor, len)?).into_owned())
        }
        ColumnType::String => decode_string_column(cursor, meta)?,
        ColumnType::Enum => CellValue::Enum(read_enum(cursor, meta & 0xff)?),
        ColumnType::Set => CellValue::Set(read_set(cursor, meta & 0xff)?),
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let len = read_length(cursor, meta)?;
            CellValue::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::Json => {
            let len = read_length(cursor, meta)?;
            CellValue::Json(decode_json(&read_bytes(cursor, len)?))
        }
        ColumnType::NewDecimal => {
            CellValue::Decimal(decode_decimal(cursor, (meta >> 8) as usize, (meta & 0xff) as usize)?)
        }
        ColumnType::Bit => {
            let nbits = (meta >> 8) as usize * 8 + (meta & 0xff) as usize;
            CellValue::Bit(read_bytes(cursor, nbits.div_ceil(8))?)
        }
        ColumnType::Decimal | ColumnType::NewDate | ColumnType::Null => {
            return Err(invalid_data(format!(
                "unsupported column type {:?} in row image",
                column_type
            )))
        }
    };
    Ok(value)
}

/// CHAR 컬럼: 메타데이터 상위 바이트에 실제 타입(ENUM/SET/STRING)이 들어 있음
fn decode_string_column(cursor: &mut Cursor<&[u8]>, meta: u16) -> io::Result<CellValue> {
    let (real_type, length) = if meta >= 256 {
        let b0 = (meta >> 8) as u8;
        let b1 = (meta & 0xff) as u16;
        if b0 & 0x30 != 0x30 {
            // 255 바이트를 넘는 CHAR는 길이 상위 비트가 타입 바이트에 섞여 있음
            (b0 | 0x30, b1 | ((((b0 & 0x30) ^ 0x30) as u16) << 4))
        } else {
            (b0, b1)
        }
    } else {
        (ColumnType::String as u8, meta)
    };

    match ColumnType::from_u8(real_type) {
        Some(ColumnType::Enum) => Ok(CellValue::Enum(read_enum(cursor, length)?)),
        Some(ColumnType::Set) => Ok(CellValue::Set(read_set(cursor, length)?)),
        _ => {
            let len = if length < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            Ok(CellValue::String(
                String::from_utf8_lossy(&read_bytes(cursor, len)?).into_owned(),
            ))
        }
    }
}

fn read_enum(cursor: &mut Cursor<&[u8]>, size: u16) -> io::Result<u16> {
    match size {
        1 => Ok(cursor.read_u8()? as u16),
        2 => cursor.read_u16::<LittleEndian>(),
        other => Err(invalid_data(format!("invalid enum size {}", other))),
    }
}

fn read_set(cursor: &mut Cursor<&[u8]>, size: u16) -> io::Result<u64> {
    if size > 8 {
        return Err(invalid_data(format!("invalid set size {}", size)));
    }
    let bytes = read_bytes(cursor, size as usize)?;
    Ok(bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (i * 8))))
}

/// 소수 초 부분을 마이크로초로 변환 (fsp 2자리당 1 byte, big-endian)
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u8) -> io::Result<u32> {
    let micros = match fsp {
        1 | 2 => cursor.read_u8()? as u32 * 10_000,
        3 | 4 => cursor.read_u16::<BigEndian>()? as u32 * 100,
        5 | 6 => cursor.read_u24::<BigEndian>()?,
        _ => 0,
    };
    if micros >= 1_000_000 {
        return Err(invalid_data(format!("fractional seconds out of range: {}", micros)));
    }
    Ok(micros)
}

fn format_fraction(micros: u32, fsp: u8) -> String {
    if fsp == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", &digits[..(fsp.min(6) as usize)])
}

fn timestamp_value(secs: u32, micros: u32, fsp: u8) -> CellValue {
    if secs == 0 {
        return CellValue::DateTime(format!("0000-00-00 00:00:00{}", format_fraction(0, fsp)));
    }
    match DateTime::<Utc>::from_timestamp(secs as i64, micros * 1000) {
        Some(ts) => CellValue::Timestamp(ts),
        None => CellValue::Int64(secs as i64),
    }
}

/// DATETIME2: 5 bytes big-endian (부호 비트 오프셋 포함) + 소수 초
fn decode_datetime2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> io::Result<CellValue> {
    const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;
    let packed = cursor.read_uint::<BigEndian>(5)? as i64 - DATETIMEF_INT_OFS;
    let micros = read_fraction(cursor, fsp)?;
    let packed = packed.abs();

    let ymd = packed >> 17;
    let ym = ymd >> 5;
    let hms = packed % (1 << 17);

    Ok(CellValue::DateTime(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        format_fraction(micros, fsp)
    )))
}

/// TIME2: 3 bytes big-endian 정수부 + 소수 초, 음수는 보수 표현
fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> io::Result<CellValue> {
    const TIMEF_INT_OFS: i64 = 0x80_0000;
    const TIMEF_OFS: i64 = 0x8000_0000_0000;

    let tmp: i64 = match fsp {
        1 | 2 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac > 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac > 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.read_uint::<BigEndian>(6)? as i64 - TIMEF_OFS,
        _ => (cursor.read_u24::<BigEndian>()? as i64 - TIMEF_INT_OFS) << 24,
    };

    let sign = if tmp < 0 { "-" } else { "" };
    let tmp = tmp.abs();
    let hms = tmp >> 24;
    let micros = (tmp % (1 << 24)) as u32;

    Ok(CellValue::Time(format!(
        "{}{:02}:{:02}:{:02}{}",
        sign,
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        format_fraction(micros, fsp)
    )))
}

/// NEWDECIMAL: 9자리씩 4 bytes, 남는 자리는 압축, 부호 비트 반전 저장
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> io::Result<String> {
    const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
    if scale > precision {
        return Err(invalid_data(format!(
            "invalid decimal precision={} scale={}",
            precision, scale
        )));
    }

    let int_digits = precision - scale;
    let int_words = int_digits / 9;
    let int_leftover = DIG_TO_BYTES[int_digits % 9];
    let frac_words = scale / 9;
    let frac_leftover_digits = scale % 9;
    let frac_leftover = DIG_TO_BYTES[frac_leftover_digits];

    let size = int_leftover + int_words * 4 + frac_words * 4 + frac_leftover;
    let mut bytes = read_bytes(cursor, size)?;
    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let mut reader = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();
    if int_leftover > 0 {
        let v = reader.read_uint::<BigEndian>(int_leftover)?;
        if v > 0 {
            int_part.push_str(&v.to_string());
        }
    }
    for _ in 0..int_words {
        let v = reader.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            if v > 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", v));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            result.push_str(&format!("{:09}", reader.read_u32::<BigEndian>()?));
        }
        if frac_leftover > 0 {
            let v = reader.read_uint::<BigEndian>(frac_leftover)?;
            result.push_str(&format!("{:0width$}", v, width = frac_leftover_digits));
        }
    }

    Ok(result)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(verify_magic(&invalid).is_err());
    }

    #[test]
    fn test_header_too_short_is_fatal() {
        let err = EventDecoder::new().decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn test_decode_table_map_and_insert() {
        let mut decoder = EventDecoder::new();
        decoder.decode(&format_description(false)).unwrap();

        let event = decoder.decode(&users_table_map(200)).unwrap();
        match &event.payload {
            EventPayload::TableMap(tm) => {
                assert_eq!(tm.qualified_name(), "test.users");
                assert_eq!(tm.column_meta, vec![0, 100]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(decoder.format().is_some());
        assert_eq!(
            decoder.table(USERS_TABLE_ID).map(|tm| tm.qualified_name()),
            Some("test.users".to_string())
        );

        let event = decoder.decode(&users_rows(30, 260, &[(1, "a"), (2, "bb")])).unwrap();
        assert_eq!(event.header.log_pos, 260);
        match event.payload {
            EventPayload::Rows(rows) => {
                assert_eq!(rows.action, RowsAction::Insert);
                assert_eq!(
                    rows.rows,
                    vec![
                        vec![CellValue::Int32(1), CellValue::from("a")],
                        vec![CellValue::Int32(2), CellValue::from("bb")],
                    ]
                );
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_update_rows_alternate_before_after() {
        let mut decoder = EventDecoder::new();
        decoder.decode(&users_table_map(200)).unwrap();
        let event = decoder.decode(&users_rows(31, 300, &[(1, "a"), (1, "b")])).unwrap();
        match event.payload {
            EventPayload::Rows(rows) => {
                let pairs: Vec<_> = rows.pairs().collect();
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].0[1], CellValue::from("a"));
                assert_eq!(pairs[0].1[1], CellValue::from("b"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rows_without_table_map() {
        let mut decoder = EventDecoder::new();
        let err = decoder.decode(&users_rows(30, 260, &[(1, "a")])).unwrap_err();
        assert!(matches!(err, CdcError::MissingTableMap(USERS_TABLE_ID)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn test_checksum_stripped_after_fde() {
        let mut decoder = EventDecoder::new().with_checksum_verification(true);
        let event = decoder.decode(&format_description(true)).unwrap();
        match event.payload {
            EventPayload::FormatDescription(fde) => {
                assert!(fde.has_checksum());
                assert_eq!(fde.server_version, "8.0.36-log");
                assert_eq!(fde.post_header_lengths.len(), 40);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let event = decoder.decode(&with_checksum(xid(400, 77))).unwrap();
        assert_eq!(event.payload, EventPayload::Xid(XidEvent { xid: 77 }));

        let mut corrupted = with_checksum(xid(400, 77));
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let err = decoder.decode(&corrupted).unwrap_err();
        assert!(matches!(err, CdcError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_fde_without_trailer_keeps_alg_byte() {
        // checksum NONE을 협상하면 trailer 없이 오지만 alg 바이트는 남아 있을 수 있음
        let mut decoder = EventDecoder::new();
        decoder.decode(&format_description(false)).unwrap();
        let event = decoder.decode(&xid(400, 5)).unwrap();
        assert_eq!(event.payload, EventPayload::Xid(XidEvent { xid: 5 }));
    }

    #[test]
    fn test_fake_rotate_and_query() {
        let mut decoder = EventDecoder::new();
        let event = decoder.decode(&rotate(4, "mysql-bin.000002")).unwrap();
        assert_eq!(event.header.timestamp, 0);
        assert_eq!(event.header.log_pos, 0);
        assert_eq!(
            event.payload,
            EventPayload::Rotate(RotateEvent {
                position: 4,
                next_binlog: "mysql-bin.000002".to_string()
            })
        );

        let event = decoder
            .decode(&query(500, "test", "ALTER TABLE users ADD x INT"))
            .unwrap();
        match event.payload {
            EventPayload::Query(q) => {
                assert_eq!(q.schema, "test");
                assert_eq!(q.query, "ALTER TABLE users ADD x INT");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_is_not_an_error() {
        let mut decoder = EventDecoder::new();
        let decoded = decoder.decode(&event(200, 10, &[1, 2, 3])).unwrap();
        assert_eq!(decoded.header.event_type, EventType::Unknown(200));
        assert_eq!(decoded.payload, EventPayload::Unknown(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn test_raw_mode_skips_payloads() {
        let mut decoder = EventDecoder::new().with_raw_mode(true);
        let event = decoder.decode(&users_rows(30, 260, &[(1, "a")])).unwrap();
        assert!(matches!(event.payload, EventPayload::Unknown(_)));
        let event = decoder.decode(&rotate(4, "bin.2")).unwrap();
        assert!(matches!(event.payload, EventPayload::Rotate(_)));
    }

    #[test]
    fn test_gtid_events() {
        let mut decoder = EventDecoder::new();
        let mut payload = vec![1u8];
        payload.extend_from_slice(&[0x11; 16]);
        payload.extend_from_slice(&9u64.to_le_bytes());
        let decoded = decoder.decode(&event(33, 10, &payload)).unwrap();
        match decoded.payload {
            EventPayload::Gtid(g) => assert_eq!(g.gno, 9),
            other => panic!("unexpected payload {:?}", other),
        }

        let mut payload = 100u64.to_le_bytes().to_vec();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(0);
        let decoded = decoder.decode(&event(162, 10, &payload)).unwrap();
        match decoded.payload {
            EventPayload::MariadbGtid(g) => assert_eq!(g.gtid.to_string(), "0-1-100"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_decimal() {
        // DECIMAL(10,2) 1234.56 => int 8자리(4 bytes), frac 2자리(1 byte)
        let mut bytes = 1234u32.to_be_bytes().to_vec();
        bytes.push(56);
        bytes[0] ^= 0x80;
        let mut cursor = Cursor::new(bytes.as_slice());
        assert_eq!(decode_decimal(&mut cursor, 10, 2).unwrap(), "1234.56");

        let mut neg: Vec<u8> = 1234u32.to_be_bytes().iter().chain(&[56u8]).map(|b| !b).collect();
        neg[0] ^= 0x80;
        let mut cursor = Cursor::new(neg.as_slice());
        assert_eq!(decode_decimal(&mut cursor, 10, 2).unwrap(), "-1234.56");
    }

    #[test]
    fn test_decode_datetime2_and_time2() {
        // 2024-03-15 10:20:30
        let ym: i64 = 2024 * 13 + 3;
        let packed = ((ym << 5 | 15) << 17) | (10 << 12) | (20 << 6) | 30;
        let raw = ((packed + 0x80_0000_0000) as u64).to_be_bytes();
        let mut cursor = Cursor::new(&raw[3..]);
        assert_eq!(
            decode_datetime2(&mut cursor, 0).unwrap(),
            CellValue::DateTime("2024-03-15 10:20:30".to_string())
        );

        let hms: i64 = (1 << 12) | (2 << 6) | 3;
        let raw = ((hms + 0x80_0000) as u32).to_be_bytes();
        let mut cursor = Cursor::new(&raw[1..]);
        assert_eq!(
            decode_time2(&mut cursor, 0).unwrap(),
            CellValue::Time("01:02:03".to_string())
        );
    }

    #[test]
    fn test_timestamp2_fraction() {
        let mut raw = 1_700_000_000u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&123_456u32.to_be_bytes()[1..]);
        let value = decode_value(&mut Cursor::new(raw.as_slice()), ColumnType::Timestamp2 as u8, 6);
        match value.unwrap() {
            CellValue::Timestamp(ts) => {
                assert_eq!(ts.timestamp(), 1_700_000_000);
                assert_eq!(ts.timestamp_subsec_micros(), 123_456);
            }
            other => panic!("unexpected value {:?}", other),
        }

        // 손상된 행 이미지: 소수 초가 백만 이상
        let mut raw = 1_700_000_000u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&[0xff, 0xff, 0xff]);
        let err = decode_value(&mut Cursor::new(raw.as_slice()), ColumnType::Timestamp2 as u8, 6)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_version_has_checksum() {
        assert!(version_has_checksum("8.0.35-0ubuntu0.22.04.1-log"));
        assert!(version_has_checksum("5.6.1"));
        assert!(!version_has_checksum("5.5.62-log"));
        assert!(version_has_checksum("10.6.12-MariaDB-log"));
    }
}
