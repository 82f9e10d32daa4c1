//! WebSocket driver for an [`EditorSession`].
//!
//! `CollabClient` owns one background task that connects to the sync
//! service, moves frames between the socket and the session, runs the
//! awareness and auto-versioning timers, and reconnects with exponential
//! backoff. All session state stays in the `EditorSession`; the task only
//! holds its lock for the duration of one synchronous call.
//!
//! Teardown is deterministic: `close()` sends the awareness leave, closes
//! the socket and waits for the task; dropping the client aborts it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::session::ConnectionStatus;
use crate::config::CollabConfig;
use crate::editor::EditorSession;
use crate::error::{CollabError, Result};
use crate::identity::UserIdentity;

/// Awareness timer period.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// How often the auto-versioning policy is checked.
const AUTO_VERSION_CHECK: Duration = Duration::from_secs(1);

/// How long `close()` waits for the task to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What the driver reports to the client handle.
#[derive(Debug, Clone, Default)]
struct DriverState {
    status: Option<ConnectionStatus>,
    auth_error: Option<String>,
    connect_error: Option<String>,
    finished: bool,
}

enum Ended {
    Shutdown,
    Dropped,
}

pub struct CollabClient {
    editor: Arc<EditorSession>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<DriverState>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CollabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabClient")
            .field("editor", &self.editor)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl CollabClient {
    /// Spawn the driver on the current tokio runtime and return at once.
    pub fn start(editor: Arc<EditorSession>) -> Self {
        let url = editor.config().websocket_url();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(DriverState::default());

        let wake = Arc::new(Notify::new());
        let waker = Arc::clone(&wake);
        if let Err(e) = editor.set_outbound_waker(Some(Arc::new(move || waker.notify_one()))) {
            log::warn!("[Sync] could not install outbound waker: {}", e);
        }

        let task = tokio::spawn(run(
            Arc::clone(&editor),
            url,
            shutdown_rx,
            state_tx,
            wake,
        ));

        Self {
            editor,
            shutdown: shutdown_tx,
            state: state_rx,
            task: Some(task),
        }
    }

    /// Start and wait for the first successful sync.
    ///
    /// Fails with [`CollabError::Authorization`] when the service rejects
    /// the token and with [`CollabError::Connection`] when the first
    /// attempt cannot reach it. The client is shut down in both cases.
    pub async fn connect(editor: Arc<EditorSession>) -> Result<Self> {
        let client = Self::start(editor);
        let mut state = client.state.clone();
        let outcome = loop {
            let current = state.borrow_and_update().clone();
            if let Some(reason) = current.auth_error {
                break Err(CollabError::Authorization(reason));
            }
            if let Some(reason) = current.connect_error {
                break Err(CollabError::Connection(reason));
            }
            if current.status == Some(ConnectionStatus::Synced) {
                break Ok(());
            }
            if current.finished || state.changed().await.is_err() {
                break Err(CollabError::Connection("sync driver stopped".to_string()));
            }
        };
        match outcome {
            Ok(()) => Ok(client),
            Err(e) => {
                client.close().await?;
                Err(e)
            }
        }
    }

    pub fn editor(&self) -> &Arc<EditorSession> {
        &self.editor
    }

    /// Latest status reported by the driver.
    pub fn status(&self) -> ConnectionStatus {
        self.state
            .borrow()
            .status
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Leave the document and stop the driver.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("[Sync] driver task failed: {}", e),
                Err(_) => log::warn!("[Sync] driver did not stop in time"),
            }
        }
        self.editor.set_outbound_waker(None)?;
        Ok(())
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = self.editor.set_outbound_waker(None);
            let _ = self.editor.with_session(|s| s.on_close());
        }
    }
}

fn publish(editor: &EditorSession, state: &watch::Sender<DriverState>) {
    let status = editor.status().ok();
    state.send_modify(|s| s.status = status);
}

async fn run(
    editor: Arc<EditorSession>,
    url: String,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<DriverState>,
    wake: Arc<Notify>,
) {
    let initial = Duration::from_millis(editor.config().reconnect_initial_delay_ms.max(1));
    let max = Duration::from_millis(editor.config().reconnect_max_delay_ms.max(1));
    let mut delay = initial;
    let mut first_attempt = true;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let _ = editor.with_session(|s| s.begin_connect());
        publish(&editor, &state);

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                log::info!("[Sync] connected to {}", url);
                delay = initial;
                first_attempt = false;
                let ended = drive(&editor, ws, &mut shutdown, &state, &wake).await;
                let _ = editor.with_session(|s| s.on_close());
                publish(&editor, &state);
                if matches!(ended, Ended::Shutdown) {
                    break;
                }
            }
            Err(e) => {
                log::warn!("[Sync] connection to {} failed: {}", url, e);
                let _ = editor.with_session(|s| s.on_close());
                publish(&editor, &state);
                if first_attempt {
                    state.send_modify(|s| s.connect_error = Some(e.to_string()));
                }
                first_attempt = false;
            }
        }

        let auth_error = editor
            .with_session(|s| s.authorization_error().map(str::to_string))
            .ok()
            .flatten();
        if let Some(reason) = auth_error {
            log::warn!("[Sync] not retrying: {}", reason);
            state.send_modify(|s| s.auth_error = Some(reason));
            break;
        }

        log::debug!("[Sync] reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        delay = (delay * 2).min(max);
    }

    state.send_modify(|s| s.finished = true);
    log::debug!("[Sync] driver stopped");
}

/// Serve one open socket until it drops or shutdown is requested.
async fn drive<S>(
    editor: &EditorSession,
    ws: S,
    shutdown: &mut watch::Receiver<bool>,
    state: &watch::Sender<DriverState>,
    wake: &Notify,
) -> Ended
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws.split();
    let _ = editor.with_session(|s| s.on_open());
    if flush(editor, &mut write).await.is_err() {
        return Ended::Dropped;
    }

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut auto_version = tokio::time::interval(AUTO_VERSION_CHECK);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    match editor.with_session(|s| s.handle_frame(&data, now_ms())) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::warn!("[Sync] dropping frame: {}", e),
                        Err(e) => {
                            log::error!("[Sync] session unavailable: {}", e);
                            return Ended::Dropped;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("[Sync] connection closed by service");
                    return Ended::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[Sync] read error: {}", e);
                    return Ended::Dropped;
                }
            },
            _ = tick.tick() => {
                let _ = editor.tick(now_ms());
            }
            _ = auto_version.tick() => {
                match editor.auto_version_tick(now_ms()).await {
                    Ok(Some(info)) => log::info!("[Sync] auto-saved version {}", info.version),
                    Ok(None) => {}
                    Err(e) => log::warn!("[Sync] auto-versioning failed: {}", e),
                }
            }
            _ = wake.notified() => {}
            _ = shutdown.changed() => {
                let _ = editor.close();
                let _ = flush(editor, &mut write).await;
                let _ = write.close().await;
                return Ended::Shutdown;
            }
        }

        publish(editor, state);
        if flush(editor, &mut write).await.is_err() {
            return Ended::Dropped;
        }
        if editor.status().is_ok_and(|s| s == ConnectionStatus::Disconnected) {
            let _ = write.close().await;
            return Ended::Dropped;
        }
    }
}

/// Write every queued frame.
async fn flush<W>(editor: &EditorSession, write: &mut W) -> Result<()>
where
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frames = editor.with_session(|s| s.drain_outbound())?;
    for frame in frames {
        write
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| CollabError::Connection(e.to_string()))?;
    }
    Ok(())
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Obtain a bearer token for `identity` from the configured endpoint.
pub async fn fetch_token(config: &CollabConfig, identity: &UserIdentity) -> Result<String> {
    let response = reqwest::Client::new()
        .post(config.token_url())
        .json(&serde_json::json!({
            "userId": identity.user_id,
            "email": identity.email,
        }))
        .send()
        .await
        .map_err(|e| CollabError::Connection(format!("token endpoint unreachable: {}", e)))?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        return Err(CollabError::Authorization(body));
    }
    if !status.is_success() {
        return Err(CollabError::Http(format!("token request failed: {}", status)));
    }
    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| CollabError::Http(format!("invalid token response: {}", e)))?;
    Ok(body.token)
}
