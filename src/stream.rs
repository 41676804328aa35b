//! 복제 읽기 루프와 소비자를 잇는 이벤트 스트림
//!
//! 유한 크기 큐 + 한 번만 설정되는 에러 슬롯. 에러가 한 번 전달되면 스트림은
//! 오염 상태가 되고 이후의 pull은 모두 `Temporary`를 반환합니다.

use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CAPACITY: usize = 10_240;

/// 스트림 생성 (생산자, 소비자)
pub fn event_stream(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (err_tx, err_rx) = oneshot::channel();
    (
        EventSender {
            events: tx,
            error: Some(err_tx),
        },
        EventStream {
            events: rx,
            error: Some(err_rx),
            poisoned: false,
            closed: false,
        },
    )
}

/// 생산자 쪽 (복제 읽기 루프가 소유)
#[derive(Debug)]
pub struct EventSender {
    events: mpsc::Sender<BinlogEvent>,
    error: Option<oneshot::Sender<CdcError>>,
}

impl EventSender {
    /// 큐가 가득 차면 대기, 소비자가 닫혔으면 `AlreadyClosed`
    pub async fn send(&self, event: BinlogEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| CdcError::AlreadyClosed)
    }

    /// 에러 슬롯 설정 (첫 번째 호출만 유효)
    pub fn fail(&mut self, err: CdcError) {
        if let Some(tx) = self.error.take() {
            let _ = tx.send(err);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// 소비자가 스트림을 닫을 때까지 대기
    pub async fn closed(&self) {
        self.events.closed().await
    }
}

/// 소비자 쪽
#[derive(Debug)]
pub struct EventStream {
    events: mpsc::Receiver<BinlogEvent>,
    error: Option<oneshot::Receiver<CdcError>>,
    poisoned: bool,
    closed: bool,
}

impl EventStream {
    /// 다음 이벤트를 기다림
    ///
    /// 취소 신호 > 에러 슬롯 > 이벤트 순으로 확인합니다.
    pub async fn pull(&mut self, cancel: &CancellationToken) -> Result<BinlogEvent> {
        loop {
            if self.closed {
                return Err(CdcError::AlreadyClosed);
            }
            if self.poisoned {
                return Err(CdcError::Temporary(
                    "event stream failed, restart replication".to_string(),
                ));
            }

            let error = &mut self.error;
            let events = &mut self.events;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CdcError::Cancelled),
                res = async {
                    match error.as_mut() {
                        Some(rx) => rx.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.error = None;
                    if let Ok(err) = res {
                        self.poisoned = true;
                        return Err(err);
                    }
                    // 생산자가 에러 없이 종료, 남은 이벤트는 계속 전달
                }
                event = events.recv() => match event {
                    Some(event) => return Ok(event),
                    None => {
                        if self.error.is_none() {
                            self.closed = true;
                            return Err(CdcError::AlreadyClosed);
                        }
                        // 에러 슬롯 결과를 마저 확인
                        continue;
                    }
                },
            }
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// 스트림 닫기 (여러 번 호출해도 안전)
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        self.error = None;
    }
}
