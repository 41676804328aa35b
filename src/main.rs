/// MySQL Canal 실행 예제
///
/// 환경 변수로 설정을 읽고, 모든 테이블의 행 변경을 JSON 한 줄씩 출력합니다.
/// Ctrl-C 를 받으면 마지막 위치를 저장하고 종료합니다.
use async_trait::async_trait;
use rust_mysql_canal::{
    Canal, CanalConfig, FilePositionStore, MySqlMetadata, Result, Row, RowsAction,
    RowsEventHandler, TableSchema,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 행 변경을 표준 출력에 JSON 으로 기록하는 핸들러
struct JsonLogHandler;

fn row_object(table: &TableSchema, row: &Row) -> Value {
    let values: Map<String, Value> = table
        .columns
        .iter()
        .zip(row)
        .map(|(column, value)| (column.name.clone(), value.to_json()))
        .collect();
    Value::Object(values)
}

/// UPDATE 는 before/after 쌍으로 묶어서 출력
fn change_lines(action: RowsAction, table: &TableSchema, rows: &[Row]) -> Vec<Value> {
    let name = table.qualified_name();
    match action {
        RowsAction::Update => rows
            .chunks_exact(2)
            .map(|pair| {
                json!({
                    "action": action.as_str(),
                    "table": name,
                    "before": row_object(table, &pair[0]),
                    "after": row_object(table, &pair[1]),
                })
            })
            .collect(),
        _ => rows
            .iter()
            .map(|row| {
                json!({
                    "action": action.as_str(),
                    "table": name,
                    "row": row_object(table, row),
                })
            })
            .collect(),
    }
}

#[async_trait]
impl RowsEventHandler for JsonLogHandler {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        action: RowsAction,
        table: &TableSchema,
        rows: &[Row],
    ) -> Result<()> {
        for line in change_lines(action, table, rows) {
            println!("{}", serde_json::to_string(&line)?);
        }
        Ok(())
    }

    fn name(&self) -> String {
        "json-log".to_string()
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = CanalConfig::from_env()?;
    info!("Starting MySQL Canal");
    info!(
        "Connecting to {}:{} as server_id {}",
        config.connection.hostname, config.connection.port, config.connection.server_id
    );

    let metadata = Arc::new(MySqlMetadata::new(&config.connection));
    let mut canal = Canal::new(config.clone(), metadata)?;
    if let Some(path) = &config.position_file {
        info!("Persisting positions to {}", path.display());
        canal = canal.with_position_store(Arc::new(FilePositionStore::new(path)));
    }
    canal.register_handler(Vec::<String>::new(), vec![Arc::new(JsonLogHandler)]);

    let canal = Arc::new(canal);
    let cancel = CancellationToken::new();
    let mut runner = {
        let canal = Arc::clone(&canal);
        let cancel = cancel.clone();
        tokio::spawn(async move { canal.start(&cancel).await })
    };

    let result = tokio::select! {
        res = &mut runner => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            cancel.cancel();
            runner.await?
        }
    };
    canal.close().await?;

    info!("Last position: {}", canal.current_position());
    if let Err(e) = result {
        error!("Canal failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
