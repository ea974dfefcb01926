//! 정체 전송 감시
//!
//! 주기적으로 수신 중인 전송을 훑어 누락 청크를 요청하고, 오래 멈춘 전송을
//! 만료시킨다. 전송 크기에 비례하는 타임아웃을 사용한다.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::receiver::Receiver;
use crate::Config;

/// 청크 수에 따른 만료 타임아웃
///
/// `max(transfer_timeout, min(청크 수 * (청크 간격 + 오버헤드) * 배율, 상한))`
pub fn adaptive_timeout(total_chunks: usize, config: &Config) -> Duration {
    let per_chunk = Duration::from_millis(config.chunk_delay_ms + config.chunk_overhead_ms);
    let expected = per_chunk.mul_f64(total_chunks as f64 * config.timeout_multiplier);

    expected
        .min(Duration::from_millis(config.max_transfer_timeout_ms))
        .max(Duration::from_millis(config.transfer_timeout_ms))
}

/// 정체 감시 태스크
pub struct StallMonitor;

impl StallMonitor {
    /// 감시 태스크 시작. 첫 검사는 한 주기 뒤
    pub fn spawn(receiver: Arc<Receiver>) -> MonitorHandle {
        let period = receiver.config().stall_check_interval();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("정체 감시 시작 (주기 {:.0}s)", period.as_secs_f64());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = receiver.check_stalled().await;
                        if !report.requests.is_empty() || !report.expired.is_empty() {
                            debug!(
                                "정체 검사: 요청 {}건, 만료 {}건",
                                report.requests.len(),
                                report.expired.len()
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("정체 감시 종료");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// 실행 중인 감시 태스크 핸들
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// 종료 신호를 보내고 태스크가 끝날 때까지 대기
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
