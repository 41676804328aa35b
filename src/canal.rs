//! Canal: 복제 스트림 → 스키마 해석 → 핸들러 분배
//!
//! 이벤트 처리 규칙
//! - Rotate: 핸들러 flush 후 위치를 새 파일로 이동
//! - Rows: 테이블 필터 확인 후 스키마를 찾아 핸들러에 분배
//!   (스키마가 사라진 테이블은 건너뛰고 위치를 올리지 않음)
//! - Query: DDL이면 스키마 캐시 무효화
//! - TableMap / FormatDescription: 위치를 올리지 않음
//!
//! 위치 저장은 트랜잭션 경계에서만, `save_interval`에 한 번으로 제한합니다.

use crate::binlog_client::{BinlogClient, ClientConfig, DumpTarget};
use crate::config::{compile_patterns, CanalConfig, StartPoint};
use crate::error::{CdcError, ErrorKind, Result};
use crate::events::{BinlogEvent, EventHeader, EventPayload, RowChangeEvent, RowsEvent};
use crate::gtid::FlavorGtidSet;
use crate::handler::{HandlerRegistry, RowsEventHandler};
use crate::offset::{PositionStore, ReplicationPosition, MIN_BINLOG_POSITION};
use crate::schema::{qualified_name, MetadataSource, SchemaCache};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type CloseHook = Box<dyn FnOnce() + Send>;

/// 처리 위치 추적
#[derive(Debug, Default)]
struct Tracker {
    /// 마지막으로 처리한 이벤트 위치
    position: ReplicationPosition,
    /// 마지막 트랜잭션 경계 위치 (재시작 지점)
    boundary: Option<ReplicationPosition>,
    /// 아직 저장하지 않은 트랜잭션 경계 위치
    unsaved: Option<ReplicationPosition>,
    last_save: Option<Instant>,
}

/// CDC 오케스트레이터
pub struct Canal {
    config: CanalConfig,
    /// `start`마다 새로 만드는 복제 클라이언트
    client: RwLock<Arc<BinlogClient>>,
    /// 이전 `start`가 끝난 GTID 집합
    resume_gtid: Mutex<Option<FlavorGtidSet>>,
    metadata: Arc<dyn MetadataSource>,
    schemas: SchemaCache,
    handlers: HandlerRegistry,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    /// 테이블 이름별 필터 결과
    allowed: RwLock<HashMap<String, bool>>,
    tracker: RwLock<Tracker>,
    store: Option<Arc<dyn PositionStore>>,
    cancel: CancellationToken,
    running: watch::Sender<bool>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

impl Canal {
    pub fn new(config: CanalConfig, metadata: Arc<dyn MetadataSource>) -> Result<Self> {
        config.validate()?;
        let include = compile_patterns(&config.include_tables)?;
        let exclude = compile_patterns(&config.exclude_tables)?;
        let cancel = CancellationToken::new();
        let client = Arc::new(BinlogClient::with_cancellation(
            ClientConfig::from(&config),
            cancel.child_token(),
        ));
        let (running, _) = watch::channel(false);

        Ok(Canal {
            config,
            client: RwLock::new(client),
            resume_gtid: Mutex::new(None),
            schemas: SchemaCache::new(Arc::clone(&metadata)),
            metadata,
            handlers: HandlerRegistry::new(),
            include,
            exclude,
            allowed: RwLock::new(HashMap::new()),
            tracker: RwLock::new(Tracker::default()),
            store: None,
            cancel,
            running,
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    /// 위치 저장소 지정
    pub fn with_position_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// `close()` 마지막에 한 번 호출될 훅
    pub fn with_on_close(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.on_close.lock() = Some(Box::new(hook));
        self
    }

    /// 핸들러 등록 (`tables`가 비어 있으면 필터를 통과한 모든 테이블)
    ///
    /// 이름을 지정해 등록하면 include/exclude 필터와 관계없이 호출됩니다.
    pub fn register_handler<I, S>(&self, tables: I, handlers: Vec<Arc<dyn RowsEventHandler>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handlers.register(tables, handlers);
    }

    /// 마지막으로 처리한 이벤트 위치
    pub fn current_position(&self) -> ReplicationPosition {
        self.tracker.read().position.clone()
    }

    /// GTID 모드에서 실행된 GTID 집합
    pub fn current_gtid_set(&self) -> Option<String> {
        self.client.read().gtid_set().map(|set| set.to_string())
    }

    /// "schema.table" 이름이 include/exclude 필터를 통과하는지 (결과는 캐시)
    pub fn is_table_allowed(&self, name: &str) -> bool {
        if self.include.is_empty() && self.exclude.is_empty() {
            return true;
        }
        if let Some(allowed) = self.allowed.read().get(name) {
            return *allowed;
        }

        let allowed = (self.include.is_empty() || self.include.iter().any(|re| re.is_match(name)))
            && !self.exclude.iter().any(|re| re.is_match(name));
        self.allowed.write().insert(name.to_string(), allowed);
        allowed
    }

    /// 복제 시작 (취소되거나 닫히거나 핸들러가 중단을 요청할 때까지 반환하지 않음)
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CdcError::AlreadyClosed);
        }
        if self.running.send_replace(true) {
            return Err(CdcError::AlreadyRunning);
        }

        // 이전 실행의 클라이언트는 닫혀 있으므로 매번 새로 만듦
        let client = Arc::new(BinlogClient::with_cancellation(
            ClientConfig::from(&self.config),
            self.cancel.child_token(),
        ));
        *self.client.write() = Arc::clone(&client);

        let result = self.sync(&client, cancel).await;
        client.close().await;
        if let Some(set) = client.gtid_set() {
            *self.resume_gtid.lock() = Some(set);
        }
        self.running.send_replace(false);

        match &result {
            Ok(()) => info!("Canal stopped"),
            Err(e) => warn!("Canal stopped with error: {}", e),
        }
        result
    }

    async fn sync(&self, client: &BinlogClient, cancel: &CancellationToken) -> Result<()> {
        self.check_server().await?;
        let target = self.resolve_start().await?;
        info!("Starting canal from {}", target);

        let stream = match target {
            DumpTarget::Position(position) => {
                self.tracker.write().position = position.clone();
                client.start_sync(position).await?
            }
            DumpTarget::Gtid(set) => client.start_sync_gtid(set).await?,
        };

        // 호출자의 취소 신호와 close() 를 하나로 묶음
        let scope = self.cancel.child_token();
        let link = {
            let caller = cancel.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => scope.cancel(),
                    _ = scope.cancelled() => {}
                }
            })
        };

        let result = self.run(stream, &scope).await;
        scope.cancel();
        let _ = link.await;
        result
    }

    /// 복제 형식 확인: ROW 가 아니면 행 이벤트를 받을 수 없음
    async fn check_server(&self) -> Result<()> {
        if let Some(format) = self.metadata.binlog_format().await? {
            if !format.eq_ignore_ascii_case("ROW") {
                return Err(CdcError::NotSupported(format!(
                    "binlog_format must be ROW, server uses {}",
                    format
                )));
            }
        }
        if let Some(image) = self.metadata.binlog_row_image().await? {
            if !image.eq_ignore_ascii_case("FULL") {
                warn!(
                    "binlog_row_image is {}, missing columns will be delivered as NULL",
                    image
                );
            }
        }
        Ok(())
    }

    /// 시작 지점: 이전 실행의 경계 → 설정 → 저장된 위치 → 서버 현재 위치 → 첫 binlog
    async fn resolve_start(&self) -> Result<DumpTarget> {
        let resume_gtid = self.resume_gtid.lock().clone();
        if let Some(set) = resume_gtid {
            info!("Restarting from GTID set {}", set);
            return Ok(DumpTarget::Gtid(set));
        }
        let boundary = self.tracker.read().boundary.clone();
        if let Some(position) = boundary {
            info!("Restarting from last boundary {}", position);
            return Ok(DumpTarget::Position(position));
        }

        match &self.config.start {
            Some(StartPoint::Gtid(gtid)) => {
                return Ok(DumpTarget::Gtid(FlavorGtidSet::parse(self.config.flavor, gtid)?));
            }
            Some(StartPoint::Position(position)) => {
                return Ok(DumpTarget::Position(position.clone()));
            }
            None => {}
        }

        if let Some(store) = &self.store {
            if let Some(saved) = store.load().await? {
                let position: ReplicationPosition = saved.parse()?;
                info!("Resuming from saved position {}", position);
                return Ok(DumpTarget::Position(position));
            }
        }

        if let Some(position) = self.metadata.master_position().await? {
            return Ok(DumpTarget::Position(position));
        }

        Ok(DumpTarget::Position(ReplicationPosition::new(
            "",
            MIN_BINLOG_POSITION,
        )))
    }

    /// 메인 루프
    pub(crate) async fn run(
        &self,
        mut stream: crate::stream::EventStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = loop {
            let flush_at = self.save_deadline();
            let pulled = tokio::select! {
                pulled = stream.pull(cancel) => pulled,
                _ = async {
                    match flush_at {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending().await,
                    }
                } => {
                    // 기한이 지났으므로 save_interval 검사 없이 저장
                    self.save_position(true).await;
                    continue;
                }
            };
            let event = match pulled {
                Ok(event) => event,
                Err(e) if e.is(ErrorKind::Cancelled) || e.is(ErrorKind::AlreadyClosed) => {
                    break Ok(())
                }
                Err(e) => break Err(e),
            };
            if let Err(e) = self.handle_event(cancel, event).await {
                break Err(e);
            }
        };
        stream.close();
        result
    }

    async fn handle_event(&self, cancel: &CancellationToken, event: BinlogEvent) -> Result<()> {
        let boundary = event.is_transaction_boundary();
        let BinlogEvent { header, payload } = event;

        match payload {
            EventPayload::Rotate(rotate) => {
                let next = ReplicationPosition::new(rotate.next_binlog, rotate.position);
                let current = self.current_position();
                if next <= current {
                    return Ok(());
                }
                if next.file != current.file {
                    self.handlers.flush(cancel).await?;
                    info!("Binlog rotated to {}", next);
                }
                let mut tracker = self.tracker.write();
                tracker.position = next;
                tracker.boundary = Some(tracker.position.clone());
                tracker.unsaved = tracker.boundary.clone();
            }
            EventPayload::TableMap(_) | EventPayload::FormatDescription(_) => return Ok(()),
            EventPayload::Unknown(_) => {
                debug!("Skipping {:?} event", header.event_type);
                return Ok(());
            }
            payload => {
                if self.already_processed(&header) {
                    debug!("Skipping already processed event at {}", header.log_pos);
                    return Ok(());
                }
                match payload {
                    EventPayload::Rows(rows) => match self.handle_rows(cancel, &header, rows).await {
                        Ok(()) => {}
                        Err(e) if e.is(ErrorKind::NotFound) => {
                            debug!("Table vanished, rows skipped: {}", e);
                            return Ok(());
                        }
                        Err(e) if e.is(ErrorKind::NotAllowed) => {
                            debug!("Table filtered out: {}", e);
                        }
                        Err(e) => return Err(e),
                    },
                    EventPayload::Query(query) => {
                        if let Some((schema, table)) =
                            self.schemas.apply_ddl(&query.schema, &query.query)
                        {
                            info!("Schema change detected on {}.{}", schema, table);
                        }
                    }
                    _ => {}
                }
                self.advance(&header, boundary);
            }
        }

        self.save_position(false).await;
        Ok(())
    }

    /// 재연결 후 다시 받은 이벤트인지
    fn already_processed(&self, header: &EventHeader) -> bool {
        header.log_pos > 0 && u64::from(header.log_pos) <= self.tracker.read().position.offset
    }

    fn advance(&self, header: &EventHeader, boundary: bool) {
        let mut tracker = self.tracker.write();
        if header.log_pos > 0 {
            tracker.position.offset = u64::from(header.log_pos);
        }
        if boundary {
            tracker.boundary = Some(tracker.position.clone());
            tracker.unsaved = tracker.boundary.clone();
        }
    }

    async fn handle_rows(
        &self,
        cancel: &CancellationToken,
        header: &EventHeader,
        rows: RowsEvent,
    ) -> Result<()> {
        let (schema, table) = (&rows.table.schema, &rows.table.table);
        let name = qualified_name(schema, table);
        let allowed = self.is_table_allowed(&name);
        if !allowed && !self.handlers.has_explicit(schema, table) {
            return Err(CdcError::NotAllowed(name));
        }

        let definition = self.schemas.get(schema, table).await?;
        if definition.columns.len() != rows.column_count {
            warn!(
                "{} has {} columns but the rows event carries {}",
                name,
                definition.columns.len(),
                rows.column_count
            );
        }

        let change = RowChangeEvent {
            action: rows.action,
            table: definition,
            rows: rows.rows,
            header: header.clone(),
        };
        self.handlers.dispatch(cancel, &change, allowed).await
    }

    /// 미뤄 둔 경계 위치를 저장할 시각
    ///
    /// save_interval 안에 들어온 경계는 버리지 않고 구간이 끝날 때 마지막 것만 저장합니다.
    fn save_deadline(&self) -> Option<Instant> {
        self.store.as_ref()?;
        let tracker = self.tracker.read();
        tracker.unsaved.as_ref()?;
        tracker.last_save.map(|at| at + self.config.save_interval)
    }

    /// 경계 위치 저장 (`force`가 아니면 save_interval 안에 한 번만)
    async fn save_position(&self, force: bool) -> Option<CdcError> {
        let store = self.store.as_ref()?;
        let position = {
            let mut tracker = self.tracker.write();
            let recent = tracker
                .last_save
                .is_some_and(|at| at.elapsed() < self.config.save_interval);
            if recent && !force {
                return None;
            }
            let position = tracker.unsaved.take()?;
            tracker.last_save = Some(Instant::now());
            position
        };

        let value = position.to_string();
        match store.save(&value).await {
            Ok(()) => {
                debug!("Saved position {}", value);
                None
            }
            Err(e) => {
                warn!("Failed to save position {}: {}", value, e);
                // 그 사이 더 새 경계가 없으면 다음 기회에 다시 저장
                self.tracker.write().unsaved.get_or_insert(position);
                Some(e)
            }
        }
    }

    /// 종료 (여러 번 호출해도 안전)
    ///
    /// 메인 루프와 복제 읽기 루프가 끝날 때까지 기다린 뒤 마지막 위치를 저장합니다.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing canal");
        self.cancel.cancel();
        let client = Arc::clone(&self.client.read());
        client.close().await;

        let mut running = self.running.subscribe();
        if running.wait_for(|running| !*running).await.is_err() {
            debug!("Canal state channel closed");
        }

        let saved = self.save_position(true).await;
        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        saved.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{fixtures, EventDecoder};
    use crate::connection::ConnectionConfig;
    use crate::events::{CellValue, RowsAction};
    use crate::handler::tests::RecordingHandler;
    use crate::offset::MemoryPositionStore;
    use crate::schema::{ColumnDef, TableSchema};
    use crate::stream::{event_stream, EventStream};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct StaticSource {
        vanished: bool,
        format: Option<String>,
        master: Option<ReplicationPosition>,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl MetadataSource for StaticSource {
        async fn load_table(&self, schema: &str, table: &str) -> Result<TableSchema> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.vanished {
                return Err(CdcError::NotFound(qualified_name(schema, table)));
            }
            Ok(TableSchema::new(
                schema,
                table,
                vec![ColumnDef::new("id", "int"), ColumnDef::new("name", "varchar(100)")],
            ))
        }

        async fn binlog_format(&self) -> Result<Option<String>> {
            Ok(self.format.clone())
        }

        async fn master_position(&self) -> Result<Option<ReplicationPosition>> {
            Ok(self.master.clone())
        }
    }

    fn config() -> CanalConfig {
        CanalConfig::new(ConnectionConfig::new("127.0.0.1", "repl"))
            .with_save_interval(Duration::from_secs(3600))
    }

    fn canal(config: CanalConfig, source: StaticSource) -> Canal {
        Canal::new(config, Arc::new(source)).unwrap()
    }

    /// 원본 이벤트를 디코딩해서 채운 스트림 (생산자는 바로 닫힘)
    async fn feed(events: Vec<Vec<u8>>) -> EventStream {
        let (tx, stream) = event_stream(events.len() + 1);
        let mut decoder = EventDecoder::new();
        for raw in events {
            tx.send(decoder.decode(&raw).unwrap()).await.unwrap();
        }
        stream
    }

    fn insert_users(log_pos: u32) -> Vec<Vec<u8>> {
        vec![
            fixtures::users_table_map(log_pos - 60),
            fixtures::users_rows(30, log_pos, &[(1, "a")]),
        ]
    }

    #[tokio::test]
    async fn test_rows_then_rotate_end_to_end() {
        let canal = canal(config(), StaticSource::default());
        let handler = RecordingHandler::new("recorder");
        canal.register_handler(Vec::<String>::new(), vec![handler.clone()]);

        let mut events = vec![fixtures::format_description(false)];
        events.extend(insert_users(260));
        events.push(fixtures::rotate(4, "bin.2"));

        let cancel = CancellationToken::new();
        canal.run(feed(events).await, &cancel).await.unwrap();

        let calls = handler.calls.lock().clone();
        assert_eq!(
            calls,
            vec![(
                RowsAction::Insert,
                "users".to_string(),
                vec![vec![CellValue::from(1), CellValue::from("a")]]
            )]
        );
        assert_eq!(*handler.completes.lock(), 1);
        assert_eq!(canal.current_position().file, "bin.2");
    }

    #[tokio::test]
    async fn test_explicit_registration_overrides_filter() {
        let canal = canal(
            config().with_exclude_tables(["test\\.users"]),
            StaticSource::default(),
        );
        let specific = RecordingHandler::new("specific");
        let all = RecordingHandler::new("all");
        canal.register_handler(["users"], vec![specific.clone()]);
        canal.register_handler(Vec::<String>::new(), vec![all.clone()]);

        let cancel = CancellationToken::new();
        canal.run(feed(insert_users(260)).await, &cancel).await.unwrap();

        assert!(!canal.is_table_allowed("test.users"));
        assert_eq!(specific.call_count(), 1);
        assert_eq!(all.call_count(), 0);
    }

    #[tokio::test]
    async fn test_filtered_table_is_skipped_but_position_moves() {
        let source = StaticSource::default();
        let canal = canal(config().with_include_tables(["shop\\..*"]), source);
        let all = RecordingHandler::new("all");
        canal.register_handler(Vec::<String>::new(), vec![all.clone()]);

        let cancel = CancellationToken::new();
        canal.run(feed(insert_users(260)).await, &cancel).await.unwrap();

        assert_eq!(all.call_count(), 0);
        assert_eq!(canal.current_position().offset, 260);
    }

    #[tokio::test]
    async fn test_vanished_table_does_not_advance_position() {
        let source = StaticSource {
            vanished: true,
            ..Default::default()
        };
        let canal = canal(config(), source);
        let all = RecordingHandler::new("all");
        canal.register_handler(Vec::<String>::new(), vec![all.clone()]);

        let cancel = CancellationToken::new();
        let mut events = vec![fixtures::rotate(4, "bin.000001")];
        events.extend(insert_users(260));
        canal.run(feed(events).await, &cancel).await.unwrap();

        assert_eq!(all.call_count(), 0);
        assert_eq!(
            canal.current_position(),
            ReplicationPosition::new("bin.000001", 4)
        );
    }

    #[tokio::test]
    async fn test_interrupted_handler_stops_loop() {
        let canal = canal(config(), StaticSource::default());
        let stopper = RecordingHandler::failing("stopper", || CdcError::interrupted("stop"));
        canal.register_handler(["users"], vec![stopper.clone()]);

        let mut events = insert_users(260);
        events.push(fixtures::users_rows(30, 320, &[(2, "b")]));
        let cancel = CancellationToken::new();
        let err = canal.run(feed(events).await, &cancel).await.unwrap_err();

        assert!(err.is(ErrorKind::Interrupted));
        assert_eq!(stopper.call_count(), 1);
    }

    #[tokio::test]
    async fn test_plain_handler_error_keeps_loop_running() {
        let canal = canal(config(), StaticSource::default());
        let broken = RecordingHandler::failing("broken", || CdcError::Other("oops".into()));
        canal.register_handler(["users"], vec![broken.clone()]);

        let mut events = insert_users(260);
        events.push(fixtures::users_rows(30, 320, &[(2, "b")]));
        let cancel = CancellationToken::new();
        canal.run(feed(events).await, &cancel).await.unwrap();

        assert_eq!(broken.call_count(), 2);
        assert_eq!(canal.current_position().offset, 320);
    }

    #[tokio::test]
    async fn test_ddl_invalidates_schema_cache() {
        let source = Arc::new(StaticSource::default());
        let canal = Canal::new(config(), source.clone()).unwrap();
        canal.register_handler(Vec::<String>::new(), vec![RecordingHandler::new("all")]);

        let mut events = insert_users(260);
        events.push(fixtures::query(300, "test", "ALTER TABLE users ADD COLUMN age INT"));
        events.extend(insert_users(400));
        let cancel = CancellationToken::new();
        canal.run(feed(events).await, &cancel).await.unwrap();

        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_redelivered_events_are_skipped() {
        let canal = canal(config(), StaticSource::default());
        let handler = RecordingHandler::new("all");
        canal.register_handler(Vec::<String>::new(), vec![handler.clone()]);

        let mut events = vec![fixtures::rotate(4, "bin.000001")];
        events.extend(insert_users(260));
        events.push(fixtures::xid(290, 1));
        // 재연결 후 같은 구간을 다시 받음
        events.push(fixtures::rotate(4, "bin.000001"));
        events.extend(insert_users(260));
        let cancel = CancellationToken::new();
        canal.run(feed(events).await, &cancel).await.unwrap();

        assert_eq!(handler.call_count(), 1);
        assert_eq!(
            canal.current_position(),
            ReplicationPosition::new("bin.000001", 290)
        );
    }

    #[tokio::test]
    async fn test_position_saves_are_throttled() {
        let store = Arc::new(MemoryPositionStore::new());
        let canal = canal(config(), StaticSource::default()).with_position_store(store.clone());

        let events = vec![
            fixtures::rotate(4, "bin.000001"),
            fixtures::query(200, "test", "BEGIN"),
            fixtures::xid(300, 1),
            fixtures::xid(400, 2),
        ];
        let cancel = CancellationToken::new();
        canal.run(feed(events).await, &cancel).await.unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.value().as_deref(), Some("bin.000001;4"));

        canal.close().await.unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.value().as_deref(), Some("bin.000001;400"));
    }

    #[tokio::test]
    async fn test_throttled_save_flushes_last_boundary() {
        let store = Arc::new(MemoryPositionStore::new());
        let canal = canal(
            config().with_save_interval(Duration::from_millis(20)),
            StaticSource::default(),
        )
        .with_position_store(store.clone());

        // 생산자를 열어 둔 채로 조용한 스트림을 흉내냄
        let (tx, stream) = event_stream(8);
        let mut decoder = EventDecoder::new();
        for raw in [
            fixtures::rotate(4, "bin.000001"),
            fixtures::xid(300, 1),
            fixtures::xid(400, 2),
        ] {
            tx.send(decoder.decode(&raw).unwrap()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let (result, _) = tokio::join!(canal.run(stream, &cancel), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        result.unwrap();

        assert_eq!(store.value().as_deref(), Some("bin.000001;400"));
        assert_eq!(store.write_count(), 2);
        drop(tx);
    }

    #[tokio::test]
    async fn test_table_filter_is_memoized() {
        let canal = canal(
            config()
                .with_include_tables(["test\\..*"])
                .with_exclude_tables(["test\\.secret"]),
            StaticSource::default(),
        );
        assert!(canal.is_table_allowed("test.users"));
        assert!(!canal.is_table_allowed("test.secret"));
        assert!(!canal.is_table_allowed("prod.users"));
        assert!(canal.is_table_allowed("test.users"));
        assert_eq!(canal.allowed.read().len(), 3);

        let open = canal_without_filters();
        assert!(open.is_table_allowed("anything.at_all"));
        assert!(open.allowed.read().is_empty());
    }

    fn canal_without_filters() -> Canal {
        canal(config(), StaticSource::default())
    }

    #[tokio::test]
    async fn test_start_point_resolution() {
        let fresh = canal_without_filters();
        assert_eq!(
            fresh.resolve_start().await.unwrap(),
            DumpTarget::Position(ReplicationPosition::new("", 4))
        );

        let source = StaticSource {
            master: Some(ReplicationPosition::new("bin.000003", 900)),
            ..Default::default()
        };
        let store = Arc::new(MemoryPositionStore::with_value("bin.000002;1234"));
        let with_store = canal(config(), source).with_position_store(store);
        assert_eq!(
            with_store.resolve_start().await.unwrap(),
            DumpTarget::Position(ReplicationPosition::new("bin.000002", 1234))
        );

        let configured = canal(
            config().with_start_position(ReplicationPosition::new("bin.000009", 4)),
            StaticSource::default(),
        );
        assert_eq!(
            configured.resolve_start().await.unwrap(),
            DumpTarget::Position(ReplicationPosition::new("bin.000009", 4))
        );
    }

    #[tokio::test]
    async fn test_start_can_be_retried_after_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config();
        config.connection.port = port;
        let canal = canal(config, StaticSource::default());

        let cancel = CancellationToken::new();
        let first = canal.start(&cancel).await.unwrap_err();
        assert_eq!(first.kind(), ErrorKind::Transport);
        let second = canal.start(&cancel).await.unwrap_err();
        assert_eq!(second.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_last_boundary() {
        let canal = canal(
            config().with_start_position(ReplicationPosition::new("bin.000001", 4)),
            StaticSource::default(),
        );
        let mut events = vec![fixtures::rotate(4, "bin.000002")];
        events.extend(insert_users(260));
        events.push(fixtures::xid(290, 1));
        events.extend(insert_users(400));
        let cancel = CancellationToken::new();
        canal.run(feed(events).await, &cancel).await.unwrap();

        assert_eq!(canal.current_position().offset, 400);
        assert_eq!(
            canal.resolve_start().await.unwrap(),
            DumpTarget::Position(ReplicationPosition::new("bin.000002", 290))
        );
    }

    #[tokio::test]
    async fn test_statement_format_is_rejected() {
        let source = StaticSource {
            format: Some("STATEMENT".to_string()),
            ..Default::default()
        };
        let canal = canal(config(), source);
        let err = canal.start(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let counter = hook_calls.clone();
        let canal = canal_without_filters().with_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        canal.close().await.unwrap();
        canal.close().await.unwrap();
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        let err = canal.start(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
    }
}
