//! Reconnection controller with adaptive backoff.
//!
//! Each failed health check counts against `lost_limit`. Crossing it triggers
//! a connect request and raises the limit, so a persistent outage backs off
//! instead of hammering the access-control service. Healthy checks lower the
//! limit again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::health::{CheckReport, HealthListener};

/// Body text meaning the account already has too many live connections.
pub const OVER_LIMIT_MARKER: &str = "当前连接数超过预定值";
/// Body text meaning the account has used up today's client quota.
pub const DAILY_LIMIT_MARKER: &str = "今天不能再使用客户端";

pub const MIN_LOST_LIMIT: u32 = 1;
pub const MAX_LOST_LIMIT: u32 = 256;

/// How often the day-rollover task wakes up.
pub const ROLLOVER_EVERY: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct Credential {
    pub name: String,
    pub secret: String,
    /// Set when the service refused this account for the rest of the day.
    pub daily_limit_reached: bool,
}

impl Credential {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
            daily_limit_reached: false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("daily_limit_reached", &self.daily_limit_reached)
            .finish_non_exhaustive()
    }
}

/// Transport-level failure talking to the access-control service.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("access request failed: {0}")]
    Request(String),

    #[error("access service answered with HTTP {0}")]
    Status(u16),
}

/// The external service that opens and closes our uplink.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Ask for a connection. Returns the decoded response body.
    async fn connect(&self, credential: &Credential) -> Result<String, AccessError>;

    /// Drop every connection held by the account.
    async fn disconnect_all(&self, credential: &Credential) -> Result<(), AccessError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("no credential available; every account hit its daily limit")]
    NoCredential,

    #[error("account {0} is over its connection limit")]
    OverLimit(String),

    #[error("account {0} reached its daily limit")]
    DailyLimit(String),

    #[error(transparent)]
    Access(#[from] AccessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Test mode: nothing was sent.
    Skipped,
}

#[derive(Debug)]
pub struct ReconnectState {
    pub status: bool,
    pub lost_count: u32,
    pub lost_limit: u32,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_response_text: String,
    pub day: NaiveDate,
    pub credentials: Vec<Credential>,
}

impl ReconnectState {
    pub fn new(credentials: Vec<Credential>, today: NaiveDate) -> Self {
        Self {
            status: true,
            lost_count: 0,
            lost_limit: MIN_LOST_LIMIT,
            last_connect_time: None,
            last_check_time: None,
            last_response_text: String::new(),
            day: today,
            credentials,
        }
    }

    /// Count one failed check. Returns true when a reconnect is due; the
    /// limit has already been raised by then.
    pub fn record_loss(&mut self) -> bool {
        self.status = false;
        self.lost_count += 1;
        if self.lost_count <= self.lost_limit {
            return false;
        }
        self.lost_count = 0;
        self.lost_limit = grow_limit(self.lost_limit);
        true
    }

    /// Count one healthy check.
    pub fn record_recovery(&mut self) {
        self.status = true;
        self.lost_count = 0;
        self.lost_limit = shrink_limit(self.lost_limit);
    }

    /// Clear daily flags when the date moved. Returns true if it did.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.day {
            return false;
        }
        self.day = today;
        for c in &mut self.credentials {
            c.daily_limit_reached = false;
        }
        true
    }

    fn usable_credential(&self) -> Option<usize> {
        self.credentials.iter().position(|c| !c.daily_limit_reached)
    }
}

/// Geometric growth while small, square-root growth once large.
pub fn grow_limit(limit: u32) -> u32 {
    let grown = if limit > 64 {
        (256.0 * limit as f64).sqrt().floor() as u32
    } else {
        limit * 2
    };
    grown.clamp(MIN_LOST_LIMIT, MAX_LOST_LIMIT)
}

/// Roughly halve, always strictly below the current limit unless at the floor.
pub fn shrink_limit(limit: u32) -> u32 {
    (limit / 2 + 1)
        .min(limit.saturating_sub(1))
        .clamp(MIN_LOST_LIMIT, MAX_LOST_LIMIT)
}

enum Reply {
    Accepted,
    OverLimit,
    DailyLimit,
}

fn interpret(body: &str) -> Reply {
    if body.contains(OVER_LIMIT_MARKER) {
        Reply::OverLimit
    } else if body.contains(DAILY_LIMIT_MARKER) {
        Reply::DailyLimit
    } else {
        Reply::Accepted
    }
}

/// Serializable view of the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectStatus {
    pub status: bool,
    pub lost_count: u32,
    pub lost_limit: u32,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_response_text: String,
    pub test_mode: bool,
    pub credentials: Vec<CredentialStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub name: String,
    pub daily_limit_reached: bool,
}

pub struct ReconnectController {
    access: Arc<dyn AccessControl>,
    test_mode: bool,
    state: Mutex<ReconnectState>,
}

impl ReconnectController {
    pub fn new(access: Arc<dyn AccessControl>, credentials: Vec<Credential>, test_mode: bool) -> Self {
        Self {
            access,
            test_mode,
            state: Mutex::new(ReconnectState::new(credentials, Utc::now().date_naive())),
        }
    }

    /// A failed check. Reconnects once the loss count passes the limit.
    /// Returns the outcome when a connect was attempted.
    pub async fn link_down(&self) -> Option<Result<ConnectOutcome, ReconnectError>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.last_check_time = Some(now);
        if state.roll_over(now.date_naive()) {
            tracing::info!("new day, daily limits cleared");
        }

        if !state.record_loss() {
            tracing::debug!(
                lost_count = state.lost_count,
                lost_limit = state.lost_limit,
                "link down"
            );
            return None;
        }

        tracing::warn!(lost_limit = state.lost_limit, "link down past limit, reconnecting");
        let outcome = self.attempt(&mut state, now).await;
        if let Err(e) = &outcome {
            tracing::warn!(error = %e, "reconnect failed");
        }
        Some(outcome)
    }

    /// A healthy check.
    pub async fn link_up(&self) {
        let mut state = self.state.lock().await;
        state.last_check_time = Some(Utc::now());
        state.record_recovery();
        tracing::trace!(lost_limit = state.lost_limit, "link up");
    }

    /// Connect right away, regardless of the backoff counters.
    pub async fn connect(&self) -> Result<ConnectOutcome, ReconnectError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.roll_over(now.date_naive());
        self.attempt(&mut state, now).await
    }

    /// Reset daily flags if `today` differs from the remembered date.
    pub async fn rollover(&self, today: NaiveDate) -> bool {
        self.state.lock().await.roll_over(today)
    }

    pub async fn status(&self) -> ReconnectStatus {
        let state = self.state.lock().await;
        ReconnectStatus {
            status: state.status,
            lost_count: state.lost_count,
            lost_limit: state.lost_limit,
            last_connect_time: state.last_connect_time,
            last_check_time: state.last_check_time,
            last_response_text: state.last_response_text.clone(),
            test_mode: self.test_mode,
            credentials: state
                .credentials
                .iter()
                .map(|c| CredentialStatus {
                    name: c.name.clone(),
                    daily_limit_reached: c.daily_limit_reached,
                })
                .collect(),
        }
    }

    async fn attempt(
        &self,
        state: &mut ReconnectState,
        now: DateTime<Utc>,
    ) -> Result<ConnectOutcome, ReconnectError> {
        let Some(idx) = state.usable_credential() else {
            return Err(ReconnectError::NoCredential);
        };

        if self.test_mode {
            tracing::info!(account = %state.credentials[idx].name, "test mode, connect skipped");
            state.last_connect_time = Some(now);
            return Ok(ConnectOutcome::Skipped);
        }

        let credential = state.credentials[idx].clone();
        let body = self.access.connect(&credential).await?;
        state.last_response_text = body.clone();

        match interpret(&body) {
            Reply::OverLimit => {
                if let Err(e) = self.access.disconnect_all(&credential).await {
                    tracing::warn!(error = %e, account = %credential.name, "disconnect failed");
                }
                Err(ReconnectError::OverLimit(credential.name))
            }
            Reply::DailyLimit => {
                state.credentials[idx].daily_limit_reached = true;
                Err(ReconnectError::DailyLimit(credential.name))
            }
            Reply::Accepted => {
                state.last_connect_time = Some(now);
                tracing::info!(account = %credential.name, "connected");
                Ok(ConnectOutcome::Connected)
            }
        }
    }

    /// Hourly task that clears daily flags after midnight (UTC).
    pub async fn rollover_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(ROLLOVER_EVERY);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    if self.rollover(Utc::now().date_naive()).await {
                        tracing::info!("new day, daily limits cleared");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl HealthListener for ReconnectController {
    async fn on_check(&self, report: &CheckReport) {
        if report.failure {
            self.link_down().await;
        } else {
            self.link_up().await;
        }
    }
}
