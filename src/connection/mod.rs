//! Client-side reconnect and session-recovery engine.
//!
//! Owns the broker URL list and the reconnect policy, drives the
//! exponential back-off, and re-instates tracked sessions on the new
//! transport after a failover.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::endpoint::{Connector, SessionBinding, Transport};

pub mod error;
mod options;

pub use options::{ConnectionOptions, ConnectionSettings, OptionValue};

use error::{ConnectionError, NewSessionError};
use options::merge_url;

/// Engine lifecycle. `Failed` means the retry budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Open,
    Reconnecting,
    Failed,
}

/// A tracked client session: its original name survives failover and is
/// used to re-create the transport-level session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    name: String,
    transactional: bool,
    binding: Option<SessionBinding>,
}

impl ClientSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }
}

struct Inner {
    options: ConnectionOptions,
    urls: Vec<String>,
    sessions: HashMap<String, ClientSession>,
    transport: Option<Box<dyn Transport>>,
    state: ReconnectState,
    retries: i64,
    connector: Box<dyn Connector>,
}

pub struct ReconnectEngine {
    inner: Mutex<Inner>,
    /// Serializes concurrent `open` calls.
    gate: Semaphore,
}

impl std::fmt::Debug for ReconnectEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectEngine").finish_non_exhaustive()
    }
}

impl ReconnectEngine {
    /// Build from the caller's URL plus an option map. The supplied URL is
    /// always the first entry of the URL list.
    pub fn new<I, N>(
        url: impl Into<String>,
        option_pairs: I,
        connector: Box<dyn Connector>,
    ) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = (N, OptionValue)>,
        N: AsRef<str>,
    {
        let options = ConnectionOptions::parse(option_pairs)?;
        let url = url.into();
        let mut urls = options.reconnect_urls.clone();
        urls.retain(|u| *u != url);
        urls.insert(0, url.clone());
        tracing::debug!(%url, "created connection");
        Ok(Self {
            inner: Mutex::new(Inner {
                options,
                urls,
                sessions: HashMap::new(),
                transport: None,
                state: ReconnectState::Reconnecting,
                retries: 0,
                connector,
            }),
            gate: Semaphore::new(1),
        })
    }

    pub async fn state(&self) -> ReconnectState {
        self.inner.lock().await.state
    }

    pub async fn urls(&self) -> Vec<String> {
        self.inner.lock().await.urls.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.inner
            .lock()
            .await
            .transport
            .as_ref()
            .map(|t| t.is_open())
            .unwrap_or(false)
    }

    pub async fn authenticated_username(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .transport
            .as_ref()
            .map(|t| t.authenticated_username())
    }

    /// Connect, retrying per the reconnect policy. Single-entry: a second
    /// caller parks on the gate and returns as soon as the first succeeds.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        let started = Instant::now();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ConnectionError::TransportFailure("connection gate closed".into()))?;
        if self.is_open().await {
            return Ok(());
        }
        self.connect(started).await
    }

    /// Reconnect after a transport failure; an error when reconnect is
    /// disabled.
    pub async fn reopen(&self) -> Result<(), ConnectionError> {
        if !self.inner.lock().await.options.reconnect {
            return Err(ConnectionError::TransportFailure(
                "failed to connect (reconnect disabled)".into(),
            ));
        }
        self.open().await
    }

    async fn connect(&self, started: Instant) -> Result<(), ConnectionError> {
        let (reconnect, limit, timeout, min_interval, max_interval) = {
            let inner = self.inner.lock().await;
            (
                inner.options.reconnect,
                inner.options.limit,
                inner.options.timeout,
                inner.options.min_interval,
                inner.options.max_interval,
            )
        };

        let mut interval = min_interval;
        loop {
            if self.try_connect().await? {
                let mut inner = self.inner.lock().await;
                inner.retries = 0;
                inner.state = ReconnectState::Open;
                return Ok(());
            }
            if !reconnect {
                return Err(self
                    .fail("failed to connect (reconnect disabled)")
                    .await);
            }
            if limit >= 0 {
                let mut inner = self.inner.lock().await;
                let used = inner.retries;
                inner.retries += 1;
                if used >= limit {
                    drop(inner);
                    return Err(self.fail("failed to connect within reconnect limit").await);
                }
            }
            if expired(started, timeout) {
                return Err(self
                    .fail("failed to connect within reconnect timeout")
                    .await);
            }
            self.inner.lock().await.state = ReconnectState::Reconnecting;
            tokio::time::sleep(Duration::from_secs(interval)).await;
            interval = (interval * 2).min(max_interval);
        }
    }

    async fn fail(&self, text: &str) -> ConnectionError {
        self.inner.lock().await.state = ReconnectState::Failed;
        ConnectionError::TransportFailure(text.into())
    }

    /// One pass over the URL list. True when a transport was established
    /// and every tracked session was re-instated on it.
    async fn try_connect(&self) -> Result<bool, ConnectionError> {
        let mut inner = self.inner.lock().await;
        let urls = inner.urls.clone();
        for url in urls {
            let mut settings = inner.options.settings.clone();
            // credentials embedded in the URL win for this attempt
            if let Ok(parsed) = Url::parse(&url) {
                if !parsed.username().is_empty() {
                    settings.username = parsed.username().to_string();
                }
                if let Some(password) = parsed.password() {
                    settings.password = password.to_string();
                }
            }
            tracing::info!(%url, "trying to connect");
            match inner.connector.connect(&url, &settings).await {
                Ok(transport) => {
                    tracing::info!(%url, "connected");
                    for host in transport.known_hosts() {
                        merge_url(&host, &mut inner.urls);
                    }
                    tracing::debug!(urls = ?inner.urls, "added known-hosts to reconnect-urls");
                    inner.transport = Some(transport);
                    return reset_sessions(&mut inner).await;
                }
                Err(err) => {
                    tracing::info!(%url, error = %err, "failed to connect");
                }
            }
        }
        Ok(false)
    }

    /// Create a session on the current transport, reconnecting through
    /// transport failures. An empty name mints a fresh uuid.
    pub async fn new_session(
        &self,
        transactional: bool,
        name: &str,
    ) -> Result<ClientSession, ConnectionError> {
        let name = if name.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };
        loop {
            let attempt = {
                let mut inner = self.inner.lock().await;
                match inner.transport.as_mut() {
                    Some(transport) => transport.new_session(&name).await,
                    None => Err(NewSessionError::Transport("not connected".into())),
                }
            };
            match attempt {
                Ok(binding) => {
                    let session = ClientSession {
                        name: name.clone(),
                        transactional,
                        binding: Some(binding),
                    };
                    self.inner
                        .lock()
                        .await
                        .sessions
                        .insert(name.clone(), session.clone());
                    return Ok(session);
                }
                Err(NewSessionError::Transport(_)) => self.reopen().await?,
                Err(NewSessionError::Session(e)) => return Err(ConnectionError::Session(e)),
                Err(NewSessionError::ResourceLimitExceeded(e)) => {
                    return Err(ConnectionError::TargetCapacityExceeded(e))
                }
            }
        }
    }

    pub async fn get_session(&self, name: &str) -> Result<ClientSession, ConnectionError> {
        self.inner
            .lock()
            .await
            .sessions
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::Session(format!("no such session: {name}")))
    }

    /// Forget a session that the application closed.
    pub async fn session_closed(&self, name: &str) {
        self.inner.lock().await.sessions.remove(name);
    }

    /// Close all tracked sessions, then drop the transport.
    pub async fn close(&self) {
        self.inner.lock().await.sessions.clear();
        self.detach().await;
    }

    /// Drop the transport without touching tracked sessions.
    pub async fn detach(&self) {
        let transport = {
            let mut inner = self.inner.lock().await;
            inner.state = ReconnectState::Reconnecting;
            inner.transport.take()
        };
        if let Some(mut transport) = transport {
            transport.close().await;
        }
    }

    /// Broker push-back: detach and reconnect when policy allows.
    pub async fn backoff(&self) -> Result<bool, ConnectionError> {
        if self.inner.lock().await.options.reconnect_on_limit_exceeded {
            self.detach().await;
            self.open().await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn expired(started: Instant, timeout: i64) -> bool {
    if timeout == 0 {
        return true;
    }
    if timeout < 0 {
        return false;
    }
    started.elapsed() > Duration::from_secs(timeout as u64)
}

/// Re-create every tracked session on the fresh transport.
async fn reset_sessions(inner: &mut Inner) -> Result<bool, ConnectionError> {
    let Inner {
        transport,
        sessions,
        options,
        ..
    } = inner;
    let Some(mut t) = transport.take() else {
        return Ok(false);
    };
    for (name, session) in sessions.iter_mut() {
        match t.new_session(name).await {
            Ok(binding) => session.binding = Some(binding),
            Err(NewSessionError::Transport(e)) => {
                tracing::debug!(error = %e, "connection failed while re-initialising sessions");
                *transport = Some(t);
                return Ok(false);
            }
            Err(NewSessionError::ResourceLimitExceeded(e)) => {
                if options.reconnect_on_limit_exceeded {
                    tracing::debug!(error = %e, "detaching and reconnecting");
                    t.close().await;
                    return Ok(false);
                }
                *transport = Some(t);
                return Err(ConnectionError::TargetCapacityExceeded(e));
            }
            Err(NewSessionError::Session(e)) => {
                *transport = Some(t);
                return Err(ConnectionError::Session(e));
            }
        }
    }
    *transport = Some(t);
    Ok(true)
}
