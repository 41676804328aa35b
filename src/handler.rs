//! 행 변경 핸들러 등록과 분배
//!
//! 테이블 이름별 핸들러 목록과 "모든 테이블" 목록을 관리하고, 이벤트 하나를
//! 해당하는 모든 핸들러에 동시에 전달합니다.
//!
//! 실패 정책:
//! - `Interrupted` 종류의 에러는 감싸서 반환 (가장 먼저 도착한 것)
//! - 그 외 에러는 로그만 남기고 무시

use crate::error::{CdcError, ErrorKind, Result};
use crate::events::{Row, RowChangeEvent, RowsAction};
use crate::schema::{qualified_name, TableSchema};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 행 변경 이벤트 핸들러
#[async_trait]
pub trait RowsEventHandler: Send + Sync {
    /// UPDATE 의 `rows` 는 [before, after, ...] 순서
    async fn handle(
        &self,
        cancel: &CancellationToken,
        action: RowsAction,
        table: &TableSchema,
        rows: &[Row],
    ) -> Result<()>;

    /// binlog 파일이 바뀌기 직전에 호출
    async fn complete(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// 로그용 이름
    fn name(&self) -> String;
}

#[derive(Default)]
struct Registry {
    by_table: HashMap<String, Vec<Arc<dyn RowsEventHandler>>>,
    all: Vec<Arc<dyn RowsEventHandler>>,
}

/// 핸들러 레지스트리 + 분배기
#[derive(Default)]
pub struct HandlerRegistry {
    inner: RwLock<Registry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 핸들러 등록
    ///
    /// `tables`가 비어 있으면 모든 테이블용. 테이블 이름은 "table" 또는 "schema.table".
    pub fn register<I, S>(&self, tables: I, handlers: Vec<Arc<dyn RowsEventHandler>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables: Vec<String> = tables.into_iter().map(Into::into).collect();
        let mut inner = self.inner.write();
        if tables.is_empty() {
            inner.all.extend(handlers);
            return;
        }
        for table in tables {
            inner
                .by_table
                .entry(table)
                .or_default()
                .extend(handlers.iter().cloned());
        }
    }

    /// 이 테이블 이름으로 직접 등록된 핸들러가 있는지 (필터보다 우선)
    pub fn has_explicit(&self, schema: &str, table: &str) -> bool {
        let inner = self.inner.read();
        inner.by_table.contains_key(table)
            || inner.by_table.contains_key(&qualified_name(schema, table))
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.all.is_empty() && inner.by_table.is_empty()
    }

    /// 대상 핸들러 스냅샷 (락을 쥔 채로 await 하지 않기 위해 복사)
    fn matching(&self, table: &TableSchema, include_all: bool) -> Vec<Arc<dyn RowsEventHandler>> {
        let inner = self.inner.read();
        let mut handlers: Vec<Arc<dyn RowsEventHandler>> = Vec::new();
        for key in [table.name.clone(), table.qualified_name()] {
            if let Some(list) = inner.by_table.get(&key) {
                for handler in list {
                    push_unique(&mut handlers, handler);
                }
            }
        }
        if include_all {
            for handler in &inner.all {
                push_unique(&mut handlers, handler);
            }
        }
        handlers
    }

    /// 이벤트 분배
    ///
    /// `include_all`이 false면 직접 등록된 핸들러에만 전달 (필터에서 제외된 테이블).
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        event: &RowChangeEvent,
        include_all: bool,
    ) -> Result<()> {
        let handlers = self.matching(&event.table, include_all);
        if handlers.is_empty() {
            return Ok(());
        }

        let scope = cancel.child_token();
        let mut tasks: FuturesUnordered<_> = handlers
            .iter()
            .map(|handler| {
                let scope = &scope;
                async move {
                    let result = handler
                        .handle(scope, event.action, &event.table, &event.rows)
                        .await;
                    (handler, result)
                }
            })
            .collect();

        collect_results(&scope, &mut tasks, "handle").await
    }

    /// 모든 핸들러의 `complete` 호출 (Rotate 직전)
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        let handlers = {
            let inner = self.inner.read();
            let mut handlers: Vec<Arc<dyn RowsEventHandler>> = Vec::new();
            for handler in inner.by_table.values().flatten().chain(inner.all.iter()) {
                push_unique(&mut handlers, handler);
            }
            handlers
        };
        if handlers.is_empty() {
            return Ok(());
        }

        let scope = cancel.child_token();
        let mut tasks: FuturesUnordered<_> = handlers
            .iter()
            .map(|handler| {
                let scope = &scope;
                async move { (handler, handler.complete(scope).await) }
            })
            .collect();

        collect_results(&scope, &mut tasks, "complete").await
    }
}

fn push_unique(list: &mut Vec<Arc<dyn RowsEventHandler>>, handler: &Arc<dyn RowsEventHandler>) {
    if !list.iter().any(|h| Arc::ptr_eq(h, handler)) {
        list.push(Arc::clone(handler));
    }
}

/// 모든 핸들러가 끝날 때까지 기다리고 첫 번째 `Interrupted`를 반환
///
/// 중단 요청이 오면 나머지 핸들러에 취소 신호를 보냅니다.
async fn collect_results<'a, F>(
    scope: &CancellationToken,
    tasks: &mut FuturesUnordered<F>,
    op: &str,
) -> Result<()>
where
    F: std::future::Future<Output = (&'a Arc<dyn RowsEventHandler>, Result<()>)>,
{
    let mut interrupted: Option<CdcError> = None;
    while let Some((handler, result)) = tasks.next().await {
        let Err(err) = result else { continue };
        if err.is(ErrorKind::Interrupted) {
            if interrupted.is_none() {
                scope.cancel();
                interrupted = Some(CdcError::Handler {
                    handler: handler.name(),
                    source: Box::new(err),
                });
            }
        } else {
            warn!("Handler {} {} failed: {}", handler.name(), op, err);
        }
    }
    interrupted.map_or(Ok(()), Err)
}
