//! 连接监管：到主执行端的连接生命周期
//!
//! 状态机：Disconnected →(connect)→ Connected →(心跳失败)→ Reconnecting → Connected | Disconnected。
//! 所有状态转换都在同一把锁下进行，任务执行期间也持有这把锁，心跳触发的重连不会与任务调用交错。
//! 心跳是后台 spawn 的任务，由 CancellationToken 取消，`close` 会等它退出后才返回。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionSection;
use crate::core::RelayError;
use crate::executor::{PrimaryExecutor, TaskOutput};
use crate::story::Fragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// 连接监管的运行参数
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_retries: u32,
    /// 每次网络调用（探活、执行）的超时
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    /// 第 n 次重试前等待 `2^n × backoff_base`
    pub backoff_base: Duration,
    pub max_backoff: Option<Duration>,
}

impl SupervisorSettings {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.backoff_base.saturating_mul(factor);
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl From<&ConnectionSection> for SupervisorSettings {
    fn from(cfg: &ConnectionSection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            timeout: cfg.timeout(),
            heartbeat_interval: cfg.heartbeat_interval(),
            backoff_base: cfg.backoff_base(),
            max_backoff: cfg.max_backoff(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&ConnectionSection::default())
    }
}

#[derive(Debug)]
struct Link {
    state: ConnectionState,
    endpoint: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
}

struct Shared {
    executor: Arc<dyn PrimaryExecutor>,
    settings: SupervisorSettings,
    link: Mutex<Link>,
    drops: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    async fn probe(&self, endpoint: &str) -> Result<(), RelayError> {
        match tokio::time::timeout(self.settings.timeout, self.executor.health(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(self.settings.timeout)),
        }
    }

    fn mark_dropped(&self, link: &mut Link, reason: &RelayError) {
        link.state = ConnectionState::Disconnected;
        let drops = self.drops.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!("Connection dropped ({}), total drops: {}", reason, drops);
    }

    /// 在已持有锁的情况下重连；耗尽重试后停在 Disconnected
    async fn reconnect(&self, link: &mut Link) -> bool {
        let Some(endpoint) = link.endpoint.clone() else {
            link.state = ConnectionState::Disconnected;
            tracing::warn!("Cannot reconnect: no endpoint has been configured");
            return false;
        };

        tracing::info!("Attempting to reconnect to {}", endpoint);
        link.state = ConnectionState::Reconnecting;
        let max_retries = self.settings.max_retries;

        for attempt in 0..max_retries {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.probe(&endpoint).await {
                Ok(()) => {
                    link.state = ConnectionState::Connected;
                    link.last_heartbeat = Some(Utc::now());
                    tracing::info!("Reconnected on attempt {}", attempt + 1);
                    return true;
                }
                Err(e) => {
                    tracing::warn!("Reconnection attempt {} failed: {}", attempt + 1, e);
                }
            }
            if attempt + 1 < max_retries {
                let delay = self.settings.backoff(attempt);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        link.state = ConnectionState::Disconnected;
        tracing::error!(
            "Failed to reconnect to {} after {} attempts",
            endpoint,
            max_retries
        );
        false
    }
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval 的第一次 tick 立即完成
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut link = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            guard = shared.link.lock() => guard,
        };
        if shared.shutdown.is_cancelled() {
            break;
        }
        if link.state != ConnectionState::Connected {
            continue;
        }
        let Some(endpoint) = link.endpoint.clone() else {
            continue;
        };

        match shared.probe(&endpoint).await {
            Ok(()) => {
                link.last_heartbeat = Some(Utc::now());
                tracing::debug!("Heartbeat ok for {}", endpoint);
            }
            Err(e) => {
                tracing::warn!("Heartbeat failed: {}", e);
                shared.mark_dropped(&mut link, &e);
                shared.reconnect(&mut link).await;
            }
        }
    }
    tracing::debug!("Heartbeat loop stopped");
}

/// 单个主执行端的连接监管
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(executor: Arc<dyn PrimaryExecutor>, settings: SupervisorSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor,
                settings,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    last_heartbeat: None,
                }),
                drops: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            heartbeat: StdMutex::new(None),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// 探活成功后进入 Connected 并启动心跳；失败时停在 Disconnected，但记住 endpoint 供之后重连
    pub async fn connect(&self, endpoint: &str) -> bool {
        if self.shared.shutdown.is_cancelled() {
            tracing::warn!("Connection supervisor is closed, refusing to connect");
            return false;
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            tracing::error!("Endpoint is missing an http:// or https:// scheme: {}", endpoint);
            return false;
        }

        let mut link = self.shared.link.lock().await;
        link.state = ConnectionState::Connecting;
        link.endpoint = Some(endpoint.to_string());

        match self.shared.probe(endpoint).await {
            Ok(()) => {
                link.state = ConnectionState::Connected;
                link.last_heartbeat = Some(Utc::now());
                self.ensure_heartbeat();
                tracing::info!("Connected to primary executor at {}", endpoint);
                true
            }
            Err(e) => {
                link.state = ConnectionState::Disconnected;
                tracing::error!("Failed to connect to {}: {}", endpoint, e);
                false
            }
        }
    }

    pub async fn ping(&self) -> Result<(), RelayError> {
        let mut link = self.shared.link.lock().await;
        let endpoint = link
            .endpoint
            .clone()
            .ok_or_else(|| RelayError::Connection("not connected to any endpoint".to_string()))?;
        self.shared.probe(&endpoint).await?;
        link.last_heartbeat = Some(Utc::now());
        Ok(())
    }

    /// 在主执行端上执行一个片段；未连接时先立即重连
    pub async fn execute_task(&self, fragment: &Fragment) -> Result<TaskOutput, RelayError> {
        let mut link = self.shared.link.lock().await;
        if self.shared.shutdown.is_cancelled() {
            return Err(RelayError::Connection("connection supervisor is closed".to_string()));
        }

        if link.state != ConnectionState::Connected {
            tracing::info!("Not connected, reconnecting before executing {}", fragment.id);
            if !self.shared.reconnect(&mut link).await {
                return Err(RelayError::Connection(
                    "primary executor is unreachable".to_string(),
                ));
            }
            self.ensure_heartbeat();
        }

        let Some(endpoint) = link.endpoint.clone() else {
            return Err(RelayError::Connection("not connected to any endpoint".to_string()));
        };
        let timeout = self.shared.settings.timeout;
        let outcome =
            match tokio::time::timeout(timeout, self.shared.executor.execute(&endpoint, fragment))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(RelayError::Timeout(timeout)),
            };

        if let Err(e @ (RelayError::Connection(_) | RelayError::Timeout(_))) = &outcome {
            self.shared.mark_dropped(&mut link, e);
        }
        outcome
    }

    /// 取消心跳并等待其退出，释放执行端；返回后不再发生任何状态转换
    pub async fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Heartbeat task ended abnormally: {}", e);
            }
        }

        self.shared.link.lock().await.state = ConnectionState::Disconnected;
        self.shared.executor.close().await;
        tracing::info!("Connection supervisor closed");
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.link.lock().await.state
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.shared.link.lock().await.endpoint.clone()
    }

    pub async fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.shared.link.lock().await.last_heartbeat
    }

    pub fn connection_drops(&self) -> u64 {
        self.shared.drops.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    fn ensure_heartbeat(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        let running = slot.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            *slot = Some(tokio::spawn(heartbeat_loop(Arc::clone(&self.shared))));
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
