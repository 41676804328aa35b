//! MySQL Binlog 클라이언트
//!
//! 복제 슬레이브로 등록한 뒤 binlog 덤프를 요청하고, 받은 이벤트를 디코딩해서
//! `EventStream`으로 넘깁니다.
//!
//! 세션 상태: Idle → Registering → DumpRequested → Streaming → (Retrying | Closing) → Closed
//!
//! 읽기 중 네트워크 에러가 나면 마지막 트랜잭션 경계 위치에서 다시 등록/덤프를 수행합니다.
//! 아직 재시작 지점이 없으면 스트림을 에러로 종료합니다.

use crate::auth::{self, Credentials};
use crate::backup::BackupWriter;
use crate::binlog::EventDecoder;
use crate::config::{CanalConfig, Flavor, TlsConfig};
use crate::connection::ConnectionConfig;
use crate::error::{CdcError, ErrorKind, Result};
use crate::events::{BinlogEvent, EventPayload, EventType};
use crate::gtid::{FlavorGtidSet, GtidSet, MariadbGtid};
use crate::offset::ReplicationPosition;
use crate::protocol::{command, parse_err_packet, PacketChannel, EOF_HEADER, ERR_HEADER, OK_HEADER};
use crate::stream::{event_stream, EventSender, EventStream};
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 세미싱크 패킷 표시 바이트
const SEMI_SYNC_INDICATOR: u8 = 0xef;

/// COM_BINLOG_DUMP_GTID flag
const BINLOG_THROUGH_GTID: u16 = 0x04;

/// MariaDB GTID 복제 능력 (MARIA_SLAVE_CAPABILITY_GTID)
const MARIADB_SLAVE_CAPABILITY_GTID: u8 = 4;

/// 복제 클라이언트 설정
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub flavor: Flavor,
    pub tls: Option<TlsConfig>,
    pub semi_sync: bool,
    pub raw_mode: bool,
    pub verify_checksum: bool,
    pub heartbeat_period: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub reconnect_backoff: Duration,
    pub event_buffer: usize,
    pub report_host: String,
    pub report_port: u16,
}

impl From<&CanalConfig> for ClientConfig {
    fn from(config: &CanalConfig) -> Self {
        ClientConfig {
            connection: config.connection.clone(),
            flavor: config.flavor,
            tls: config.tls.clone(),
            semi_sync: config.semi_sync,
            raw_mode: config.raw_mode,
            verify_checksum: config.verify_checksum,
            heartbeat_period: config.heartbeat_period,
            read_timeout: config.read_timeout,
            reconnect_backoff: config.reconnect_backoff,
            event_buffer: config.event_buffer,
            report_host: config.report_host.clone(),
            report_port: config.report_port,
        }
    }
}

impl ClientConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        ClientConfig::from(&CanalConfig::new(connection))
    }
}

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Registering,
    DumpRequested,
    Streaming,
    Retrying,
    Closing,
    Closed,
}

/// 덤프 시작 지점
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpTarget {
    Position(ReplicationPosition),
    Gtid(FlavorGtidSet),
}

impl fmt::Display for DumpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpTarget::Position(pos) => write!(f, "{}", pos),
            DumpTarget::Gtid(set) => write!(f, "gtid {}", set),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingGtid {
    Mysql(Uuid, u64),
    Mariadb(MariadbGtid),
}

/// 읽은 위치와 GTID 진행 상황
#[derive(Debug, Default)]
struct Progress {
    /// 가장 최근 이벤트 위치
    last: Option<ReplicationPosition>,
    /// 마지막 트랜잭션 경계 위치 (재시작 지점)
    resume: Option<ReplicationPosition>,
    /// GTID 모드일 때 실행 완료된 집합
    gtid: Option<FlavorGtidSet>,
    pending: Option<PendingGtid>,
}

impl Progress {
    fn for_target(target: &DumpTarget) -> Self {
        Progress {
            gtid: match target {
                DumpTarget::Gtid(set) => Some(set.clone()),
                DumpTarget::Position(_) => None,
            },
            ..Default::default()
        }
    }

    fn observe(&mut self, event: &BinlogEvent) {
        match &event.payload {
            EventPayload::Rotate(rotate) => {
                let pos = ReplicationPosition::new(rotate.next_binlog.clone(), rotate.position);
                self.last = Some(pos.clone());
                self.resume = Some(pos);
                return;
            }
            EventPayload::Gtid(gtid) => self.pending = Some(PendingGtid::Mysql(gtid.sid, gtid.gno)),
            EventPayload::MariadbGtid(gtid) => self.pending = Some(PendingGtid::Mariadb(gtid.gtid)),
            _ => {}
        }

        if event.header.log_pos > 0 && event.header.event_type != EventType::HeartbeatEvent {
            if let Some(last) = self.last.as_mut() {
                last.offset = event.header.log_pos as u64;
            }
        }

        if event.is_transaction_boundary() {
            self.resume = self.last.clone();
            if let Some(pending) = self.pending.take() {
                self.commit_gtid(pending);
            }
        }
    }

    fn commit_gtid(&mut self, pending: PendingGtid) {
        match (pending, self.gtid.as_mut()) {
            (PendingGtid::Mysql(sid, gno), Some(FlavorGtidSet::Mysql(set))) => {
                if let Err(e) = set.add_gtid(sid, gno) {
                    warn!("Ignoring invalid GTID {}:{}: {}", sid, gno, e);
                }
            }
            (PendingGtid::Mariadb(gtid), Some(FlavorGtidSet::Mariadb(set))) => set.update(gtid),
            _ => {}
        }
    }

    fn resume_target(&self) -> Option<DumpTarget> {
        match &self.gtid {
            Some(set) => Some(DumpTarget::Gtid(set.clone())),
            None => self.resume.clone().map(DumpTarget::Position),
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<SessionState>,
    progress: Mutex<Progress>,
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Closing | SessionState::Closed)
            && next != SessionState::Closed
        {
            return;
        }
        debug!("Replication session {:?} -> {:?}", *state, next);
        *state = next;
    }
}

struct Context {
    config: ClientConfig,
    shared: Shared,
    cancel: CancellationToken,
}

/// Binlog 클라이언트
pub struct BinlogClient {
    ctx: Arc<Context>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BinlogClient {
    /// 새 Binlog 클라이언트 생성
    pub fn new(config: ClientConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// 외부 취소 신호를 공유하는 클라이언트
    pub fn with_cancellation(config: ClientConfig, cancel: CancellationToken) -> Self {
        BinlogClient {
            ctx: Arc::new(Context {
                config,
                shared: Shared::default(),
                cancel,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.ctx.shared.state.lock()
    }

    /// 가장 최근에 받은 이벤트의 위치
    pub fn last_position(&self) -> Option<ReplicationPosition> {
        self.ctx.shared.progress.lock().last.clone()
    }

    /// GTID 모드에서 지금까지 실행된 집합
    pub fn gtid_set(&self) -> Option<FlavorGtidSet> {
        self.ctx.shared.progress.lock().gtid.clone()
    }

    /// 위치 기반 덤프 시작
    pub async fn start_sync(&self, position: ReplicationPosition) -> Result<EventStream> {
        self.start(DumpTarget::Position(position)).await
    }

    /// GTID 기반 덤프 시작
    pub async fn start_sync_gtid(&self, gtid_set: FlavorGtidSet) -> Result<EventStream> {
        if gtid_set.flavor() != self.ctx.config.flavor {
            return Err(CdcError::Config(format!(
                "GTID set flavor {} does not match server flavor {}",
                gtid_set.flavor(),
                self.ctx.config.flavor
            )));
        }
        self.start(DumpTarget::Gtid(gtid_set)).await
    }

    async fn start(&self, target: DumpTarget) -> Result<EventStream> {
        self.begin()?;
        *self.ctx.shared.progress.lock() = Progress::for_target(&target);

        let session = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(CdcError::Cancelled),
            res = Session::open(&self.ctx, &target) => res,
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                self.ctx.shared.set_state(SessionState::Idle);
                return Err(e);
            }
        };

        let (sender, stream) = event_stream(self.ctx.config.event_buffer);
        let ctx = Arc::clone(&self.ctx);
        let handle = tokio::spawn(read_loop(ctx, session, sender));
        *self.task.lock() = Some(handle);
        Ok(stream)
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.ctx.shared.state.lock();
        match *state {
            SessionState::Idle => {
                *state = SessionState::Registering;
                Ok(())
            }
            SessionState::Closing | SessionState::Closed => Err(CdcError::AlreadyClosed),
            _ => Err(CdcError::AlreadyRunning),
        }
    }

    /// binlog 원본을 디렉터리에 백업 (취소될 때까지)
    pub async fn backup(&self, position: ReplicationPosition, dir: impl Into<PathBuf>) -> Result<()> {
        self.begin()?;
        let result = self.run_backup(position, dir.into()).await;
        self.ctx.shared.set_state(SessionState::Idle);
        result
    }

    async fn run_backup(&self, position: ReplicationPosition, dir: PathBuf) -> Result<()> {
        let mut writer = BackupWriter::new(dir).await?;
        let target = DumpTarget::Position(position);
        let mut session = tokio::select! {
            _ = self.ctx.cancel.cancelled() => return Ok(()),
            res = Session::open(&self.ctx, &target) => res?,
        };
        session.decoder = EventDecoder::new().with_raw_mode(true);
        self.ctx.shared.set_state(SessionState::Streaming);

        let result: Result<()> = async {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = self.ctx.cancel.cancelled() => return Ok(()),
                    frame = session.read_frame(&self.ctx.config) => frame?,
                };
                let Some(frame) = frame else { continue };
                let event = session.decoder.decode(frame.bytes())?;
                writer.write_event(&event, frame.bytes()).await?;
                if frame.need_ack {
                    if let Some(file) = writer.current_file() {
                        let pos = ReplicationPosition::new(file, event.header.log_pos as u64);
                        session.send_semi_sync_ack(&pos).await?;
                    }
                }
            }
        }
        .await;

        writer.finish().await?;
        session.channel.close().await;
        result
    }

    /// 세션 종료 (여러 번 호출해도 안전)
    ///
    /// 읽기 루프가 끝날 때까지 기다린 뒤 반환합니다.
    pub async fn close(&self) {
        {
            let mut state = self.ctx.shared.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closing;
        }
        info!("Closing binlog client");
        self.ctx.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Binlog read loop ended abnormally: {}", e);
            }
        }
        self.ctx.shared.set_state(SessionState::Closed);
    }
}

/// 백그라운드 읽기 루프
async fn read_loop(ctx: Arc<Context>, mut session: Session, mut sender: EventSender) {
    loop {
        let result = session.stream(&ctx, &sender).await;
        session.channel.close().await;

        match result {
            Ok(()) => break,
            Err(err) if err.is(ErrorKind::Transport) => {
                let target = ctx.shared.progress.lock().resume_target();
                if target.is_none() {
                    error!("Binlog stream failed before any resumable position: {}", err);
                    sender.fail(err);
                    break;
                }
                warn!("Binlog stream interrupted: {}", err);
                match reconnect(&ctx, &mut sender).await {
                    Some(next) => session = next,
                    None => break,
                }
            }
            Err(err) => {
                error!("Binlog stream failed: {}", err);
                sender.fail(err);
                break;
            }
        }
    }
    ctx.shared.set_state(SessionState::Idle);
    info!("Binlog read loop stopped");
}

/// 성공하거나 닫힐 때까지 재연결
async fn reconnect(ctx: &Context, sender: &mut EventSender) -> Option<Session> {
    loop {
        ctx.shared.set_state(SessionState::Retrying);
        let target = ctx.shared.progress.lock().resume_target()?;
        info!(
            "Retrying binlog dump from {} in {:?}",
            target, ctx.config.reconnect_backoff
        );

        tokio::select! {
            _ = ctx.cancel.cancelled() => return None,
            _ = sender.closed() => return None,
            _ = tokio::time::sleep(ctx.config.reconnect_backoff) => {}
        }

        let opened = tokio::select! {
            _ = ctx.cancel.cancelled() => return None,
            res = Session::open(ctx, &target) => res,
        };
        match opened {
            Ok(session) => return Some(session),
            Err(e) if e.is(ErrorKind::Transport) => warn!("Reconnect failed: {}", e),
            Err(e) => {
                error!("Reconnect failed permanently: {}", e);
                sender.fail(e);
                return None;
            }
        }
    }
}

/// 한 패킷에서 꺼낸 이벤트 바이트
struct Frame {
    packet: Vec<u8>,
    start: usize,
    need_ack: bool,
}

impl Frame {
    fn bytes(&self) -> &[u8] {
        &self.packet[self.start..]
    }
}

/// 이벤트 패킷 해석: Ok(None)은 EOF 패킷, Some((이벤트 시작, ack 필요 여부))
fn split_frame(packet: &[u8], semi_sync: bool) -> Result<Option<(usize, bool)>> {
    match packet.first().copied() {
        Some(OK_HEADER) => {
            let (start, need_ack) = if semi_sync && packet.get(1) == Some(&SEMI_SYNC_INDICATOR) {
                (3, packet.get(2) == Some(&0x01))
            } else {
                (1, false)
            };
            if packet.len() <= start {
                return Err(CdcError::ProtocolError(
                    "Empty binlog event packet".to_string(),
                ));
            }
            Ok(Some((start, need_ack)))
        }
        Some(ERR_HEADER) => Err(parse_err_packet(packet)),
        Some(EOF_HEADER) if packet.len() < 9 => Ok(None),
        Some(other) => Err(CdcError::ProtocolError(format!(
            "Unexpected binlog packet header 0x{:02x}",
            other
        ))),
        None => Err(CdcError::ProtocolError("Empty packet".to_string())),
    }
}

/// 등록과 덤프가 끝난 복제 연결 하나
struct Session {
    channel: PacketChannel,
    decoder: EventDecoder,
    semi_sync: bool,
}

impl Session {
    async fn open(ctx: &Context, target: &DumpTarget) -> Result<Self> {
        let config = &ctx.config;
        let conn = &config.connection;
        ctx.shared.set_state(SessionState::Registering);

        info!("Connecting to {}:{}", conn.hostname, conn.port);
        let channel = PacketChannel::connect(&conn.hostname, conn.port, conn.timeout).await?;
        let credentials = Credentials {
            user: &conn.username,
            password: &conn.password,
            database: None,
        };
        let (mut channel, greeting) =
            auth::authenticate(channel, &conn.hostname, &credentials, config.tls.as_ref()).await?;
        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        // 체크섬 설정
        let checksum = channel
            .query("SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'")
            .await?;
        if let Some(alg) = checksum.get(0, "Value").filter(|v| !v.is_empty()) {
            channel
                .execute("SET @master_binlog_checksum='NONE'")
                .await?;
            debug!("Binlog checksum {} disabled for this session", alg);
        }

        if config.flavor == Flavor::Mariadb {
            channel
                .execute(&format!(
                    "SET @mariadb_slave_capability={}",
                    MARIADB_SLAVE_CAPABILITY_GTID
                ))
                .await?;
        }

        if let Some(period) = config.heartbeat_period {
            channel
                .execute(&format!(
                    "SET @master_heartbeat_period={}",
                    period.as_nanos()
                ))
                .await?;
        }

        let semi_sync = config.semi_sync && enable_semi_sync(&mut channel).await?;

        let register = register_slave_command(config)?;
        channel
            .write_command(command::COM_REGISTER_SLAVE, &register)
            .await?;
        channel.read_ok().await?;
        info!("Registered as replica with server_id={}", conn.server_id);
        ctx.shared.set_state(SessionState::DumpRequested);

        match target {
            DumpTarget::Position(pos) => {
                let body = dump_command(conn.server_id, pos)?;
                channel.write_command(command::COM_BINLOG_DUMP, &body).await?;
            }
            DumpTarget::Gtid(FlavorGtidSet::Mysql(set)) => {
                let body = gtid_dump_command(conn.server_id, set)?;
                channel
                    .write_command(command::COM_BINLOG_DUMP_GTID, &body)
                    .await?;
            }
            DumpTarget::Gtid(FlavorGtidSet::Mariadb(set)) => {
                channel
                    .execute(&format!("SET @slave_connect_state='{}'", set))
                    .await?;
                channel.execute("SET @slave_gtid_strict_mode=0").await?;
                channel.execute("SET @slave_gtid_ignore_duplicates=0").await?;
                let body = dump_command(conn.server_id, &ReplicationPosition::new("", 4))?;
                channel.write_command(command::COM_BINLOG_DUMP, &body).await?;
            }
        }
        info!("Binlog dump requested from {}", target);

        Ok(Session {
            channel,
            decoder: EventDecoder::new()
                .with_raw_mode(config.raw_mode)
                .with_checksum_verification(config.verify_checksum),
            semi_sync,
        })
    }

    async fn read_frame(&mut self, config: &ClientConfig) -> Result<Option<Frame>> {
        let packet = match config.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.channel.read_packet())
                .await
                .map_err(|_| CdcError::Timeout)??,
            None => self.channel.read_packet().await?,
        };
        Ok(split_frame(&packet, self.semi_sync)?.map(|(start, need_ack)| Frame {
            packet,
            start,
            need_ack,
        }))
    }

    /// 취소, 소비자 종료, 에러까지 이벤트 전달
    async fn stream(&mut self, ctx: &Context, sender: &EventSender) -> Result<()> {
        ctx.shared.set_state(SessionState::Streaming);
        loop {
            let frame = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = sender.closed() => return Ok(()),
                frame = self.read_frame(&ctx.config) => frame?,
            };
            let Some(frame) = frame else {
                debug!("EOF packet in binlog stream, continuing");
                continue;
            };

            let event = self.decoder.decode(frame.bytes())?;
            let position = {
                let mut progress = ctx.shared.progress.lock();
                progress.observe(&event);
                progress.last.clone()
            };
            if frame.need_ack {
                if let Some(position) = &position {
                    self.send_semi_sync_ack(position).await?;
                }
            }

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(()),
                sent = sender.send(event) => if sent.is_err() {
                    return Ok(());
                },
            }
        }
    }

    /// 세미싱크 ACK: 0xef + position(8) + filename
    async fn send_semi_sync_ack(&mut self, position: &ReplicationPosition) -> Result<()> {
        let mut body = Vec::with_capacity(8 + position.file.len());
        body.write_u64::<LittleEndian>(position.offset)?;
        body.write_all(position.file.as_bytes())?;
        self.channel.write_command(SEMI_SYNC_INDICATOR, &body).await
    }
}

/// 서버가 세미싱크를 지원하면 켜고 true, 아니면 경고 후 false
async fn enable_semi_sync(channel: &mut PacketChannel) -> Result<bool> {
    let vars = channel
        .query(
            "SHOW VARIABLES WHERE Variable_name IN \
             ('rpl_semi_sync_master_enabled', 'rpl_semi_sync_source_enabled')",
        )
        .await?;
    let enabled = (0..vars.rows.len())
        .any(|i| vars.get(i, "Value").map(|v| v.eq_ignore_ascii_case("ON")) == Some(true));
    if !enabled {
        warn!("Semi-sync replication is not enabled on the server, using async replication");
        return Ok(false);
    }
    channel
        .execute("SET @rpl_semi_sync_slave = 1, @rpl_semi_sync_replica = 1")
        .await?;
    info!("Semi-sync replication enabled");
    Ok(true)
}

fn write_short_string(buffer: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = &value.as_bytes()[..value.len().min(255)];
    buffer.write_u8(bytes.len() as u8)?;
    buffer.write_all(bytes)?;
    Ok(())
}

/// COM_REGISTER_SLAVE 본문
fn register_slave_command(config: &ClientConfig) -> Result<Vec<u8>> {
    let conn = &config.connection;
    let mut buffer = Vec::new();
    buffer.write_u32::<LittleEndian>(conn.server_id)?;
    write_short_string(&mut buffer, &config.report_host)?;
    write_short_string(&mut buffer, &conn.username)?;
    write_short_string(&mut buffer, &conn.password)?;
    buffer.write_u16::<LittleEndian>(config.report_port)?;
    // replication rank, master id
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u32::<LittleEndian>(0)?;
    Ok(buffer)
}

/// COM_BINLOG_DUMP 본문
fn dump_command(server_id: u32, position: &ReplicationPosition) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    // Binlog position (4 bytes, 4 미만은 4로 보정)
    buffer.write_u32::<LittleEndian>(position.dump_offset() as u32)?;

    // Flags (2 bytes) - 0이면 새 이벤트를 계속 기다림
    buffer.write_u16::<LittleEndian>(0)?;

    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(position.file.as_bytes())?;

    debug!(
        "Created COM_BINLOG_DUMP command: server_id={}, position={}",
        server_id, position
    );
    Ok(buffer)
}

/// COM_BINLOG_DUMP_GTID 본문
fn gtid_dump_command(server_id: u32, gtid_set: &GtidSet) -> Result<Vec<u8>> {
    let data = gtid_set.encode();
    let mut buffer = Vec::with_capacity(22 + data.len());
    buffer.write_u16::<LittleEndian>(BINLOG_THROUGH_GTID)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    // 파일명 없음
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u64::<LittleEndian>(4)?;
    buffer.write_u32::<LittleEndian>(data.len() as u32)?;
    buffer.write_all(&data)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::fixtures;
    use crate::protocol::fake;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    /// OK 헤더를 붙인 이벤트 패킷
    fn frame(event: Vec<u8>) -> Vec<u8> {
        let mut packet = vec![OK_HEADER];
        packet.extend(event);
        packet
    }

    type Recorder = mpsc::UnboundedSender<(u8, Vec<u8>)>;

    async fn serve(
        mut socket: TcpStream,
        packets: Vec<Vec<u8>>,
        keep_open: bool,
        semi_sync: bool,
        dumps: &Recorder,
        commands: &Recorder,
    ) {
        fake::write_packet(&mut socket, 0, &fake::greeting()).await;
        fake::read_packet(&mut socket).await;
        fake::write_packet(&mut socket, 2, &fake::ok()).await;

        while let Some((_, body)) = fake::read_packet(&mut socket).await {
            let _ = commands.send((body[0], body[1..].to_vec()));
            match body[0] {
                command::COM_QUERY if body[1..].starts_with(b"SHOW") => {
                    let sql = String::from_utf8_lossy(&body[1..]);
                    let rows = if semi_sync && sql.contains("rpl_semi_sync") {
                        vec![vec![Some("rpl_semi_sync_master_enabled"), Some("ON")]]
                    } else {
                        Vec::new()
                    };
                    fake::write_result_set(&mut socket, &["Variable_name", "Value"], &rows).await;
                }
                // ACK 에는 응답하지 않음
                SEMI_SYNC_INDICATOR => {}
                command::COM_BINLOG_DUMP | command::COM_BINLOG_DUMP_GTID => {
                    let _ = dumps.send((body[0], body[1..].to_vec()));
                    for (i, packet) in packets.iter().enumerate() {
                        fake::write_packet(&mut socket, (i + 1) as u8, packet).await;
                    }
                    if !keep_open {
                        return;
                    }
                }
                command::COM_QUIT => return,
                _ => fake::write_packet(&mut socket, 1, &fake::ok()).await,
            }
        }
    }

    /// 연결마다 순서대로 패킷 목록을 보내는 가짜 서버, 마지막 연결은 유지
    async fn fake_server(
        sessions: Vec<Vec<Vec<u8>>>,
    ) -> (u16, mpsc::UnboundedReceiver<(u8, Vec<u8>)>) {
        let (port, dumps, _) = recording_server(sessions, false).await;
        (port, dumps)
    }

    /// `fake_server` + 받은 명령 전체 기록, `semi_sync`면 플러그인이 켜진 서버
    async fn recording_server(
        sessions: Vec<Vec<Vec<u8>>>,
        semi_sync: bool,
    ) -> (
        u16,
        mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
        mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dump_tx, dump_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let count = sessions.len();
            for (i, packets) in sessions.into_iter().enumerate() {
                let Ok((socket, _)) = listener.accept().await else { return };
                serve(socket, packets, i + 1 == count, semi_sync, &dump_tx, &command_tx).await;
            }
        });
        (port, dump_rx, command_rx)
    }

    /// 덤프 명령까지 받은 명령들
    async fn commands_until_dump(
        commands: &mut mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
    ) -> Vec<(u8, String)> {
        let mut seen = Vec::new();
        while let Some((cmd, body)) = commands.recv().await {
            let done = matches!(cmd, command::COM_BINLOG_DUMP | command::COM_BINLOG_DUMP_GTID);
            seen.push((cmd, String::from_utf8_lossy(&body).into_owned()));
            if done {
                break;
            }
        }
        seen
    }

    fn queries(seen: &[(u8, String)]) -> Vec<&str> {
        seen.iter()
            .filter(|(cmd, _)| *cmd == command::COM_QUERY)
            .map(|(_, sql)| sql.as_str())
            .collect()
    }

    /// 세미싱크 헤더 (0xef + ack 플래그) 를 붙인 이벤트 패킷
    fn semi_sync_frame(event: Vec<u8>, need_ack: bool) -> Vec<u8> {
        let mut packet = vec![OK_HEADER, SEMI_SYNC_INDICATOR, u8::from(need_ack)];
        packet.extend(event);
        packet
    }

    fn client_config(port: u16) -> ClientConfig {
        let connection = ConnectionConfig::new("127.0.0.1", "repl")
            .with_password("secret")
            .with_port(port)
            .with_server_id(1001);
        let mut config = ClientConfig::new(connection);
        config.reconnect_backoff = Duration::from_millis(10);
        config
    }

    fn dump_position(body: &[u8]) -> ReplicationPosition {
        let pos = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let file = String::from_utf8_lossy(&body[10..]).into_owned();
        ReplicationPosition::new(file, pos as u64)
    }

    #[test]
    fn test_create_binlog_dump_command() {
        let cmd = dump_command(1, &ReplicationPosition::new("mysql-bin.000001", 0)).unwrap();
        // position (4) + flags (2) + server_id (4) + filename
        assert_eq!(cmd.len(), 10 + "mysql-bin.000001".len());
        assert_eq!(dump_position(&cmd), ReplicationPosition::new("mysql-bin.000001", 4));
    }

    #[test]
    fn test_register_slave_layout() {
        let mut config = client_config(3306);
        config.report_host = "replica-1".to_string();
        config.report_port = 3307;
        let cmd = register_slave_command(&config).unwrap();
        assert_eq!(&cmd[..4], &1001u32.to_le_bytes());
        assert_eq!(cmd[4] as usize, "replica-1".len());
        assert_eq!(&cmd[5..14], b"replica-1");
        // host + user + password + port + rank + master id
        assert_eq!(cmd.len(), 4 + 10 + 5 + 7 + 2 + 4 + 4);
    }

    #[test]
    fn test_gtid_dump_layout() {
        let set = GtidSet::parse(&format!("{}:1-5", SID)).unwrap();
        let cmd = gtid_dump_command(7, &set).unwrap();
        assert_eq!(&cmd[..2], &BINLOG_THROUGH_GTID.to_le_bytes());
        assert_eq!(&cmd[2..6], &7u32.to_le_bytes());
        let data_len = u32::from_le_bytes([cmd[18], cmd[19], cmd[20], cmd[21]]) as usize;
        assert_eq!(&cmd[22..], set.encode().as_slice());
        assert_eq!(data_len, cmd.len() - 22);
    }

    #[test]
    fn test_split_frame() {
        assert_eq!(split_frame(&[0x00, 1, 2], false).unwrap(), Some((1, false)));
        assert_eq!(
            split_frame(&[0x00, 0xef, 0x01, 9], true).unwrap(),
            Some((3, true))
        );
        assert_eq!(split_frame(&[0xfe, 0, 0, 2, 0], false).unwrap(), None);
        let mut err = vec![0xff];
        err.extend_from_slice(&1236u16.to_le_bytes());
        err.extend_from_slice(b"#HY000gone");
        assert_eq!(
            split_frame(&err, false).unwrap_err().kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_progress_resumes_only_at_boundaries() {
        let mut decoder = EventDecoder::new();
        let mut progress = Progress::default();
        for raw in [
            fixtures::rotate(4, "bin.000001"),
            fixtures::format_description(false),
            fixtures::query(200, "test", "BEGIN"),
            fixtures::users_table_map(260),
        ] {
            progress.observe(&decoder.decode(&raw).unwrap());
        }
        assert_eq!(progress.last, Some(ReplicationPosition::new("bin.000001", 260)));
        assert_eq!(progress.resume, Some(ReplicationPosition::new("bin.000001", 4)));

        progress.observe(&decoder.decode(&fixtures::xid(330, 9)).unwrap());
        assert_eq!(
            progress.resume_target(),
            Some(DumpTarget::Position(ReplicationPosition::new("bin.000001", 330)))
        );
    }

    #[test]
    fn test_progress_merges_gtid_on_commit() {
        let start = FlavorGtidSet::parse(Flavor::Mysql, &format!("{}:1-5", SID)).unwrap();
        let mut progress = Progress::for_target(&DumpTarget::Gtid(start));
        let sid = Uuid::parse_str(SID).unwrap();

        progress.pending = Some(PendingGtid::Mysql(sid, 6));
        progress.observe(&EventDecoder::new().decode(&fixtures::xid(500, 1)).unwrap());

        match progress.resume_target() {
            Some(DumpTarget::Gtid(set)) => assert_eq!(set.to_string(), format!("{}:1-6", SID)),
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_events_and_close() {
        let events = vec![
            frame(fixtures::rotate(4, "bin.000001")),
            frame(fixtures::format_description(false)),
            frame(fixtures::query(300, "test", "CREATE TABLE t (id INT)")),
        ];
        let (port, mut dumps) = fake_server(vec![events]).await;
        let client = BinlogClient::new(client_config(port));
        let cancel = CancellationToken::new();

        let mut stream = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap();
        let (cmd, body) = dumps.recv().await.unwrap();
        assert_eq!(cmd, command::COM_BINLOG_DUMP);
        assert_eq!(dump_position(&body), ReplicationPosition::new("bin.000001", 4));

        for _ in 0..3 {
            assert_ok!(stream.pull(&cancel).await);
        }
        assert_eq!(client.state(), SessionState::Streaming);
        assert_eq!(
            client.last_position(),
            Some(ReplicationPosition::new("bin.000001", 300))
        );

        let err = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        client.close().await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        let err = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_retry_resumes_from_last_position() {
        let first = vec![
            frame(fixtures::rotate(4, "bin.000001")),
            frame(fixtures::format_description(false)),
            frame(fixtures::query(300, "test", "CREATE TABLE t (id INT)")),
            frame(fixtures::users_table_map(400)),
        ];
        let second = vec![frame(fixtures::rotate(300, "bin.000001"))];
        let (port, mut dumps) = fake_server(vec![first, second]).await;
        let client = BinlogClient::new(client_config(port));
        let cancel = CancellationToken::new();

        let mut stream = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap();
        for _ in 0..5 {
            assert_ok!(stream.pull(&cancel).await);
        }

        let (_, initial) = dumps.recv().await.unwrap();
        assert_eq!(dump_position(&initial), ReplicationPosition::new("bin.000001", 4));
        let (_, resumed) = dumps.recv().await.unwrap();
        assert_eq!(dump_position(&resumed), ReplicationPosition::new("bin.000001", 300));

        client.close().await;
    }

    #[tokio::test]
    async fn test_transport_error_without_position_fails_stream() {
        let (port, _dumps) = fake_server(vec![Vec::new(), Vec::new()]).await;
        let client = BinlogClient::new(client_config(port));
        let cancel = CancellationToken::new();

        let mut stream = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap();
        let err = stream.pull(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        let err = stream.pull(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Temporary);
        client.close().await;
    }

    #[tokio::test]
    async fn test_server_error_terminates_stream() {
        let mut err = vec![ERR_HEADER];
        err.extend_from_slice(&1236u16.to_le_bytes());
        err.extend_from_slice(b"#HY000Could not find first log file name in binary log index file");
        let events = vec![frame(fixtures::rotate(4, "bin.000009")), err];
        let (port, _dumps) = fake_server(vec![events]).await;
        let client = BinlogClient::new(client_config(port));
        let cancel = CancellationToken::new();

        let mut stream = client
            .start_sync(ReplicationPosition::new("bin.000009", 4))
            .await
            .unwrap();
        // 에러 슬롯이 남은 이벤트보다 먼저 전달될 수 있음
        let err = loop {
            if let Err(err) = stream.pull(&cancel).await {
                break err;
            }
        };
        assert!(matches!(err, CdcError::ServerError { code: 1236, .. }));
        assert!(stream.is_poisoned());
        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned_from_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = BinlogClient::new(client_config(port));
        let err = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_semi_sync_acknowledges_flagged_events() {
        let events = vec![
            semi_sync_frame(fixtures::rotate(4, "bin.000001"), false),
            semi_sync_frame(fixtures::query(200, "test", "BEGIN"), false),
            semi_sync_frame(fixtures::xid(330, 9), true),
        ];
        let (port, _dumps, mut commands) = recording_server(vec![events], true).await;
        let mut config = client_config(port);
        config.semi_sync = true;
        let client = BinlogClient::new(config);
        let cancel = CancellationToken::new();

        let mut stream = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap();
        let seen = commands_until_dump(&mut commands).await;
        assert!(queries(&seen)
            .iter()
            .any(|sql| sql.starts_with("SET @rpl_semi_sync_slave = 1")));

        for _ in 0..3 {
            assert_ok!(stream.pull(&cancel).await);
        }
        let (cmd, ack) = commands.recv().await.unwrap();
        assert_eq!(cmd, SEMI_SYNC_INDICATOR);
        assert_eq!(&ack[..8], &330u64.to_le_bytes());
        assert_eq!(&ack[8..], b"bin.000001");

        client.close().await;
    }

    #[tokio::test]
    async fn test_semi_sync_falls_back_when_server_disables_it() {
        let events = vec![
            frame(fixtures::rotate(4, "bin.000001")),
            frame(fixtures::xid(330, 9)),
        ];
        let (port, _dumps, mut commands) = recording_server(vec![events], false).await;
        let mut config = client_config(port);
        config.semi_sync = true;
        let client = BinlogClient::new(config);
        let cancel = CancellationToken::new();

        let mut stream = client
            .start_sync(ReplicationPosition::new("bin.000001", 4))
            .await
            .unwrap();
        let seen = commands_until_dump(&mut commands).await;
        assert!(queries(&seen)
            .iter()
            .all(|sql| !sql.starts_with("SET @rpl_semi_sync")));

        // 세미싱크 헤더 없는 패킷을 그대로 디코딩
        for _ in 0..2 {
            assert_ok!(stream.pull(&cancel).await);
        }
        assert_eq!(
            client.last_position(),
            Some(ReplicationPosition::new("bin.000001", 330))
        );
        client.close().await;
        while let Ok((cmd, _)) = commands.try_recv() {
            assert_ne!(cmd, SEMI_SYNC_INDICATOR);
        }
    }

    #[tokio::test]
    async fn test_mariadb_gtid_dump_sets_connect_state() {
        let events = vec![frame(fixtures::rotate(4, "mariadb-bin.000001"))];
        let (port, mut dumps, mut commands) = recording_server(vec![events], false).await;
        let mut config = client_config(port);
        config.flavor = Flavor::Mariadb;
        let client = BinlogClient::new(config);
        let cancel = CancellationToken::new();

        let set = FlavorGtidSet::parse(Flavor::Mariadb, "0-1-100").unwrap();
        let mut stream = client.start_sync_gtid(set).await.unwrap();

        let seen = commands_until_dump(&mut commands).await;
        let sql = queries(&seen);
        let capability = sql
            .iter()
            .position(|q| *q == "SET @mariadb_slave_capability=4")
            .unwrap();
        let connect_state = sql
            .iter()
            .position(|q| *q == "SET @slave_connect_state='0-1-100'")
            .unwrap();
        assert!(capability < connect_state);
        assert_eq!(seen.last().map(|(cmd, _)| *cmd), Some(command::COM_BINLOG_DUMP));

        // MariaDB 는 GTID 덤프도 COM_BINLOG_DUMP, 위치는 무시됨
        let (cmd, body) = dumps.recv().await.unwrap();
        assert_eq!(cmd, command::COM_BINLOG_DUMP);
        assert_eq!(dump_position(&body), ReplicationPosition::new("", 4));

        assert_ok!(stream.pull(&cancel).await);
        assert_eq!(client.gtid_set().map(|s| s.to_string()), Some("0-1-100".to_string()));
        client.close().await;
    }

    #[tokio::test]
    async fn test_backup_writes_binlog_files() {
        let events = vec![
            frame(fixtures::rotate(4, "bin.000001")),
            frame(fixtures::format_description(false)),
            frame(fixtures::xid(147, 3)),
        ];
        let (port, _dumps) = fake_server(vec![events]).await;
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(BinlogClient::new(client_config(port)));

        let runner = {
            let client = Arc::clone(&client);
            let path = dir.path().to_path_buf();
            tokio::spawn(async move {
                client
                    .backup(ReplicationPosition::new("bin.000001", 4), path)
                    .await
            })
        };

        let file = dir.path().join("bin.000001");
        let expected = 4 + fixtures::format_description(false).len() + fixtures::xid(147, 3).len();
        for _ in 0..200 {
            if std::fs::metadata(&file).ok().map(|m| m.len() as usize) == Some(expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.close().await;
        assert_ok!(runner.await.unwrap());
        assert_eq!(std::fs::read(&file).unwrap().len(), expected);
    }
}
