//! GTID (Global Transaction ID) 관리
//!
//! MySQL GTID 형식: `UUID:1-100:200-300`, 여러 서버는 `,`로 구분
//! MariaDB GTID 형식: `domain-server-sequence`, 도메인별 하나씩 `,`로 구분

use crate::config::Flavor;
use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    fn parse(s: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid interval: {}", s));
        match s.split_once('-') {
            Some((start, end)) => GtidRange::new(
                start.trim().parse().map_err(|_| invalid())?,
                end.trim().parse().map_err(|_| invalid())?,
            ),
            None => {
                let seq = s.trim().parse().map_err(|_| invalid())?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// UUID별 GTID 범위들 (정렬 + 병합 상태 유지)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidGtidSet {
    pub sid: Uuid,
    pub ranges: Vec<GtidRange>,
}

impl UuidGtidSet {
    pub fn new(sid: Uuid) -> Self {
        UuidGtidSet {
            sid,
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.normalize();
    }

    pub fn add_gtid(&mut self, gno: u64) -> Result<()> {
        self.add_range(GtidRange::new(gno, gno)?);
        Ok(())
    }

    pub fn contains(&self, gno: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(gno))
    }

    fn normalize(&mut self) {
        self.ranges.sort();
        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                // 연접하거나 겹치는 범위 병합
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }
}

impl fmt::Display for UuidGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

/// 전체 MySQL GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<Uuid, UuidGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let gtid_str = gtid_str.trim();
        if gtid_str.is_empty() || gtid_str == "NULL" {
            return Ok(gtid_set);
        }

        for part in gtid_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut fields = part.split(':');
            let sid = fields.next().unwrap_or_default();
            let sid = Uuid::parse_str(sid.trim())
                .map_err(|e| CdcError::GtidError(format!("Invalid UUID {}: {}", sid, e)))?;

            let entry = gtid_set
                .sets
                .entry(sid)
                .or_insert_with(|| UuidGtidSet::new(sid));
            let mut has_range = false;
            for interval in fields {
                entry.add_range(GtidRange::parse(interval)?);
                has_range = true;
            }
            if !has_range {
                return Err(CdcError::GtidError(format!("Missing interval: {}", part)));
            }
        }

        Ok(gtid_set)
    }

    pub fn add_gtid(&mut self, sid: Uuid, gno: u64) -> Result<()> {
        self.sets
            .entry(sid)
            .or_insert_with(|| UuidGtidSet::new(sid))
            .add_gtid(gno)
    }

    pub fn contains(&self, sid: &Uuid, gno: u64) -> bool {
        self.sets
            .get(sid)
            .map(|set| set.contains(gno))
            .unwrap_or(false)
    }

    /// 다른 집합을 합침
    pub fn merge(&mut self, other: &GtidSet) {
        for (sid, other_set) in &other.sets {
            let entry = self
                .sets
                .entry(*sid)
                .or_insert_with(|| UuidGtidSet::new(*sid));
            for range in &other_set.ranges {
                entry.add_range(*range);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }

    /// COM_BINLOG_DUMP_GTID 에 실리는 바이너리 인코딩
    ///
    /// `n_sids(8) [sid(16) n_intervals(8) [start(8) end_exclusive(8)]...]...`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let sets: Vec<&UuidGtidSet> = self.sets.values().filter(|s| !s.ranges.is_empty()).collect();
        // Vec<u8> 쓰기는 실패하지 않음
        let _ = buf.write_u64::<LittleEndian>(sets.len() as u64);
        for set in sets {
            buf.extend_from_slice(set.sid.as_bytes());
            let _ = buf.write_u64::<LittleEndian>(set.ranges.len() as u64);
            for range in &set.ranges {
                let _ = buf.write_u64::<LittleEndian>(range.start);
                let _ = buf.write_u64::<LittleEndian>(range.end + 1);
            }
        }
        buf
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|s| !s.ranges.is_empty())
            .map(|s| s.to_string())
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// MariaDB GTID (domain-server-sequence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl MariadbGtid {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid MariaDB GTID: {}", s));
        let mut parts = s.trim().splitn(3, '-');
        let domain_id = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let server_id = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let sequence = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        Ok(MariadbGtid {
            domain_id,
            server_id,
            sequence,
        })
    }
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

/// MariaDB GTID 집합 (도메인별 마지막 GTID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidSet {
    pub domains: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = MariadbGtidSet::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            set.update(MariadbGtid::parse(part)?);
        }
        Ok(set)
    }

    pub fn update(&mut self, gtid: MariadbGtid) {
        self.domains.insert(gtid.domain_id, gtid);
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.domains.values().map(|g| g.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// flavor별 GTID 집합
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlavorGtidSet {
    Mysql(GtidSet),
    Mariadb(MariadbGtidSet),
}

impl FlavorGtidSet {
    pub fn parse(flavor: Flavor, s: &str) -> Result<Self> {
        match flavor {
            Flavor::Mysql => Ok(FlavorGtidSet::Mysql(GtidSet::parse(s)?)),
            Flavor::Mariadb => Ok(FlavorGtidSet::Mariadb(MariadbGtidSet::parse(s)?)),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            FlavorGtidSet::Mysql(_) => Flavor::Mysql,
            FlavorGtidSet::Mariadb(_) => Flavor::Mariadb,
        }
    }
}

impl fmt::Display for FlavorGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlavorGtidSet::Mysql(set) => set.fmt(f),
            FlavorGtidSet::Mariadb(set) => set.fmt(f),
        }
    }
}
