//! MySQL 바이너리 JSON 디코딩
//!
//! binlog의 JSON 컬럼은 텍스트가 아니라 MySQL 내부 바이너리 포맷으로 기록됩니다.
//! 타입 바이트 하나 + 값 (객체/배열은 키/값 오프셋 테이블을 가짐)

use serde_json::{Map, Value};
use std::io;

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

/// JSON 컬럼 값 디코딩
///
/// 바이너리 해석에 실패하면 텍스트 JSON으로, 그것도 안 되면 문자열로 돌려줍니다.
pub fn decode_json(data: &[u8]) -> Value {
    if data.is_empty() {
        return Value::Null;
    }
    match parse_typed(data[0], &data[1..]) {
        Ok(value) => value,
        Err(_) => serde_json::from_slice(data)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(data).into_owned())),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("json binary: {}", msg))
}

fn slice(data: &[u8], start: usize, len: usize) -> io::Result<&[u8]> {
    data.get(start..start + len).ok_or_else(|| invalid("truncated"))
}

fn read_u16(data: &[u8], at: usize) -> io::Result<u16> {
    let b = slice(data, at, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> io::Result<u32> {
    let b = slice(data, at, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], at: usize) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice(data, at, 8)?);
    Ok(u64::from_le_bytes(buf))
}

fn read_offset(data: &[u8], at: usize, large: bool) -> io::Result<usize> {
    if large {
        Ok(read_u32(data, at)? as usize)
    } else {
        Ok(read_u16(data, at)? as usize)
    }
}

fn parse_typed(type_byte: u8, data: &[u8]) -> io::Result<Value> {
    match type_byte {
        SMALL_OBJECT => parse_container(data, false, true),
        LARGE_OBJECT => parse_container(data, true, true),
        SMALL_ARRAY => parse_container(data, false, false),
        LARGE_ARRAY => parse_container(data, true, false),
        LITERAL => Ok(literal(*data.first().ok_or_else(|| invalid("literal"))? as u16)),
        INT16 => Ok(Value::from(read_u16(data, 0)? as i16)),
        UINT16 => Ok(Value::from(read_u16(data, 0)?)),
        INT32 => Ok(Value::from(read_u32(data, 0)? as i32)),
        UINT32 => Ok(Value::from(read_u32(data, 0)?)),
        INT64 => Ok(Value::from(read_u64(data, 0)? as i64)),
        UINT64 => Ok(Value::from(read_u64(data, 0)?)),
        DOUBLE => Ok(Value::from(f64::from_bits(read_u64(data, 0)?))),
        STRING => {
            let (len, used) = read_variable_length(data)?;
            let bytes = slice(data, used, len)?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => {
            // 컬럼 타입(1) + 가변 길이 + 원본 바이트
            let rest = data.get(1..).ok_or_else(|| invalid("opaque"))?;
            let (len, used) = read_variable_length(rest)?;
            let bytes = slice(rest, used, len)?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        other => Err(invalid(&format!("unknown type 0x{:02x}", other))),
    }
}

fn literal(code: u16) -> Value {
    match code {
        0x01 => Value::Bool(true),
        0x02 => Value::Bool(false),
        _ => Value::Null,
    }
}

/// 객체/배열 공통: element_count, size, (키 엔트리들), 값 엔트리들
fn parse_container(data: &[u8], large: bool, is_object: bool) -> io::Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let header_size = offset_size * 2;
    let key_entry_size = offset_size + 2;
    let value_entry_size = offset_size + 1;
    let value_entries_start = if is_object {
        header_size + count * key_entry_size
    } else {
        header_size
    };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let entry = value_entries_start + i * value_entry_size;
        let type_byte = *data.get(entry).ok_or_else(|| invalid("value entry"))?;
        values.push(resolve_value(data, type_byte, entry + 1, large)?);
    }

    if !is_object {
        return Ok(Value::Array(values));
    }

    let mut map = Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let entry = header_size + i * key_entry_size;
        let key_offset = read_offset(data, entry, large)?;
        let key_len = read_u16(data, entry + offset_size)? as usize;
        let key = slice(data, key_offset, key_len)?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(Value::Object(map))
}

/// 작은 스칼라는 값 엔트리에 인라인, 나머지는 오프셋으로 참조
fn resolve_value(data: &[u8], type_byte: u8, at: usize, large: bool) -> io::Result<Value> {
    match type_byte {
        LITERAL => return Ok(literal(read_u16(data, at)?)),
        INT16 => return Ok(Value::from(read_u16(data, at)? as i16)),
        UINT16 => return Ok(Value::from(read_u16(data, at)?)),
        INT32 if large => return Ok(Value::from(read_u32(data, at)? as i32)),
        UINT32 if large => return Ok(Value::from(read_u32(data, at)?)),
        _ => {}
    }
    let offset = read_offset(data, at, large)?;
    let value = data.get(offset..).ok_or_else(|| invalid("value offset"))?;
    parse_typed(type_byte, value)
}

/// 7비트씩 끊어 쓰는 가변 길이 정수 (최대 5 bytes)
fn read_variable_length(data: &[u8]) -> io::Result<(usize, usize)> {
    let mut length = 0usize;
    for i in 0..5 {
        let b = *data.get(i).ok_or_else(|| invalid("variable length"))? as usize;
        length |= (b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(invalid("variable length overflow"))
}
