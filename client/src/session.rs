//! Session driver: owns the WebSocket transport and the [`RoundController`].
//!
//! A session runs as a single task. Inbound frames, user commands, keepalive
//! pings, the stale-state check, and the betting countdown are multiplexed with
//! `tokio::select!`, so the controller is only ever touched from one place.

use crate::{
    api::{BalanceRefresher, HistorySource},
    backoff::Backoff,
    controller::{ConnectionStatus, Followup, RoundController, Snapshot},
    notify::{LogNotifier, Notifier},
    Config, Error, Result,
};
use aviator_types::{Activity, Inbound, RoundSummary, CLOSE_NORMAL};
use futures_util::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ACTIVITY_CAPACITY: usize = 256;
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// External services the session reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub wallet: Option<Arc<dyn BalanceRefresher>>,
    pub history: Option<Arc<dyn HistorySource>>,
}

impl Collaborators {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            wallet: None,
            history: None,
        }
    }

    pub fn with_wallet(mut self, wallet: Arc<dyn BalanceRefresher>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySource>) -> Self {
        self.history = Some(history);
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(Arc::new(LogNotifier))
    }
}

enum Command {
    PlaceBet {
        amount: f64,
        auto_cashout: Option<f64>,
        bet_number: u8,
        reply: oneshot::Sender<Result<()>>,
    },
    CashOut {
        bet_id: u64,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// How a connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// Server closed with code 1000.
    Clean,
    Dropped,
    Shutdown,
}

pub struct Session;

impl Session {
    /// Spawn the session task. Must be called within a tokio runtime.
    ///
    /// Without a token the session reports [`ConnectionStatus::Disconnected`]
    /// and never dials.
    pub fn start(config: Config, collaborators: Collaborators) -> Result<SessionHandle> {
        let endpoint = config
            .token()
            .map(|token| config.ws_endpoint(token))
            .transpose()?;

        let (activity, _) = broadcast::channel(ACTIVITY_CAPACITY);
        let controller = RoundController::new(
            config.limits.clone(),
            collaborators.notifier.clone(),
            activity.clone(),
        );
        let (state_tx, state_rx) = watch::channel(controller.snapshot());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = oneshot::channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            backoff: Backoff::new(config.reconnect.clone()),
            config,
            endpoint,
            controller,
            commands,
            shutdown,
            state: state_tx,
            wallet: collaborators.wallet,
            history: collaborators.history,
            history_tx,
            history_rx,
            tasks: JoinSet::new(),
        };
        let task = tokio::spawn(driver.run());

        Ok(SessionHandle {
            commands: commands_tx,
            state: state_rx,
            activity,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Handle to a running session. Dropping it aborts the session task; use
/// [`SessionHandle::shutdown`] to close the transport cleanly.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Snapshot>,
    activity: broadcast::Sender<Activity>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Submit a bet. Resolves once the command is queued or refused locally;
    /// the server's verdict arrives later through the published state.
    pub async fn place_bet(
        &self,
        amount: f64,
        auto_cashout: Option<f64>,
        bet_number: u8,
    ) -> Result<()> {
        let (reply, verdict) = oneshot::channel();
        self.commands
            .send(Command::PlaceBet {
                amount,
                auto_cashout,
                bet_number,
                reply,
            })
            .map_err(|_| Error::SessionClosed)?;
        verdict.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn cash_out(&self, bet_id: u64) -> Result<()> {
        let (reply, verdict) = oneshot::channel();
        self.commands
            .send(Command::CashOut { bet_id, reply })
            .map_err(|_| Error::SessionClosed)?;
        verdict.await.map_err(|_| Error::SessionClosed)?
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.clone()
    }

    pub fn activity(&self) -> broadcast::Receiver<Activity> {
        self.activity.subscribe()
    }

    /// Close the transport with code 1000 and cancel any pending reconnect.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            match timeout(SHUTDOWN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "session task failed"),
                Err(_) => {
                    warn!("session did not stop in time; aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Driver {
    config: Config,
    endpoint: Option<Url>,
    controller: RoundController,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: oneshot::Receiver<()>,
    state: watch::Sender<Snapshot>,
    wallet: Option<Arc<dyn BalanceRefresher>>,
    history: Option<Arc<dyn HistorySource>>,
    history_tx: mpsc::UnboundedSender<Vec<RoundSummary>>,
    history_rx: mpsc::UnboundedReceiver<Vec<RoundSummary>>,
    /// Balance and history fetches; aborted when the driver stops.
    tasks: JoinSet<()>,
}

impl Driver {
    async fn run(mut self) {
        self.fetch_history();
        self.refresh_balance();

        let Some(endpoint) = self.endpoint.clone() else {
            warn!("no auth token configured, not connecting");
            self.controller.set_status(ConnectionStatus::Disconnected);
            self.publish();
            self.wait(None).await;
            return;
        };
        let host = endpoint.host_str().unwrap_or_default().to_string();

        loop {
            let socket = match self.dial(&endpoint).await {
                None => break,
                Some(Ok(socket)) => socket,
                Some(Err(err)) => {
                    warn!(%host, %err, "connect failed");
                    if !self.retry().await {
                        break;
                    }
                    continue;
                }
            };

            info!(%host, "connected");
            match self.drive(socket).await {
                Exit::Shutdown => break,
                Exit::Clean => {
                    info!(%host, "server closed session");
                    self.controller.set_status(ConnectionStatus::Disconnected);
                    self.publish();
                    self.wait(None).await;
                    break;
                }
                Exit::Dropped => {
                    if !self.retry().await {
                        break;
                    }
                }
            }
        }
        debug!("session stopped");
    }

    /// Schedule the next reconnect. Returns `false` if the session should stop.
    async fn retry(&mut self) -> bool {
        self.controller.detach();
        match self.backoff.next_delay() {
            Some((attempt, delay)) => {
                let delay_ms = delay.as_millis() as u64;
                warn!(attempt, delay_ms, "reconnecting");
                self.controller
                    .set_status(ConnectionStatus::Reconnecting { attempt, delay_ms });
                self.publish();
                self.wait(Some(delay)).await
            }
            None => {
                warn!(attempts = self.backoff.attempts(), "giving up on reconnect");
                self.controller.lost_connection();
                self.publish();
                self.wait(None).await;
                false
            }
        }
    }

    /// Serve commands until `delay` elapses (`None` waits for shutdown).
    /// Returns `false` on shutdown.
    async fn wait(&mut self, delay: Option<Duration>) -> bool {
        let timer = sleep(delay.unwrap_or_default());
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer, if delay.is_some() => return true,
                _ = &mut self.shutdown => return false,
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => return false,
                },
                Some(rounds) = self.history_rx.recv() => self.apply_history(rounds),
            }
        }
    }

    /// Open the socket. Returns `None` on shutdown.
    async fn dial(&mut self, endpoint: &Url) -> Option<Result<Socket>> {
        let connect = connect_async(endpoint.as_str());
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return Some(result.map(|(socket, _)| socket).map_err(Error::from));
                }
                _ = &mut self.shutdown => return None,
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => return None,
                },
                Some(rounds) = self.history_rx.recv() => self.apply_history(rounds),
            }
        }
    }

    async fn drive(&mut self, socket: Socket) -> Exit {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut queued) = mpsc::unbounded_channel();

        self.backoff.reset();
        self.controller.attach(outbound);
        if let Err(err) = self.controller.request_state() {
            warn!(%err, "failed to request state");
        }
        self.publish();

        let now = Instant::now();
        let ping_every = self.config.ping_interval();
        let mut ping = interval_at(now + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = interval_at(now + self.config.sync_check(), self.config.sync_check());
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut countdown = interval_at(now + COUNTDOWN_TICK, COUNTDOWN_TICK);
        let stale_after = self.config.stale_after();
        let mut last_seen = now;

        let exit = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        self.on_text(&text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|frame| u16::from(frame.code));
                        info!(?code, "close frame received");
                        // Flush the queued close reply
                        if let Err(err) = sink.close().await {
                            debug!(%err, "close handshake incomplete");
                        }
                        break if code == Some(CLOSE_NORMAL) {
                            Exit::Clean
                        } else {
                            Exit::Dropped
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "websocket error");
                        break Exit::Dropped;
                    }
                    None => {
                        warn!("websocket ended without close frame");
                        break Exit::Dropped;
                    }
                },
                Some(command) = queued.recv() => {
                    let json = match command.to_json() {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(%err, "failed to encode command");
                            continue;
                        }
                    };
                    debug!(%json, "sending");
                    if let Err(err) = sink.send(Message::Text(json)).await {
                        warn!(%err, "send failed");
                        break Exit::Dropped;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => break Exit::Shutdown,
                },
                _ = &mut self.shutdown => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutdown".into(),
                    };
                    if let Err(err) = sink.send(Message::Close(Some(close))).await {
                        debug!(%err, "close frame not sent");
                    }
                    break Exit::Shutdown;
                }
                _ = ping.tick() => {
                    if let Err(err) = self.controller.send_ping() {
                        debug!(%err, "ping not queued");
                    }
                }
                _ = sync.tick() => {
                    if last_seen.elapsed() >= stale_after {
                        let silent_ms = last_seen.elapsed().as_millis() as u64;
                        info!(silent_ms, "state stale, resyncing");
                        if let Err(err) = self.controller.request_state() {
                            debug!(%err, "resync not queued");
                        }
                    }
                }
                _ = countdown.tick() => {
                    if self.controller.tick() {
                        self.publish();
                    }
                }
                Some(rounds) = self.history_rx.recv() => self.apply_history(rounds),
            }
        };

        self.controller.detach();
        exit
    }

    fn on_text(&mut self, text: &str) {
        let message = match Inbound::decode(text) {
            Ok(message) => message,
            Err(err) => {
                let err = Error::Protocol(err.to_string());
                warn!(kind = ?Inbound::peek_type(text), %err, "dropping malformed message");
                return;
            }
        };
        if message == Inbound::Unknown {
            debug!(kind = ?Inbound::peek_type(text), "unknown message type");
        } else {
            debug!(kind = message.kind(), "received");
        }

        let followup = self.controller.handle(message);
        self.publish();
        if followup == Followup::RefreshBalance {
            self.refresh_balance();
        }
    }

    fn execute(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::PlaceBet {
                amount,
                auto_cashout,
                bet_number,
                reply,
            } => (
                self.controller.place_bet(amount, auto_cashout, bet_number),
                reply,
            ),
            Command::CashOut { bet_id, reply } => (self.controller.cash_out(bet_id), reply),
        };
        // Caller may have stopped waiting
        let _ = reply.send(result);
    }

    fn apply_history(&mut self, rounds: Vec<RoundSummary>) {
        if self
            .controller
            .seed_history(rounds.iter().map(|round| round.crash_multiplier))
        {
            debug!(rounds = rounds.len(), "history seeded");
            self.publish();
        }
    }

    fn spawn(&mut self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        while self.tasks.try_join_next().is_some() {}
        self.tasks.spawn(task);
    }

    fn refresh_balance(&mut self) {
        let Some(wallet) = self.wallet.clone() else {
            return;
        };
        self.spawn(async move {
            if let Err(err) = wallet.refresh_balance().await {
                warn!(%err, "balance refresh failed");
            }
        });
    }

    fn fetch_history(&mut self) {
        let Some(source) = self.history.clone() else {
            return;
        };
        let results = self.history_tx.clone();
        self.spawn(async move {
            match source.recent_rounds().await {
                Ok(rounds) => {
                    let _ = results.send(rounds);
                }
                Err(err) => warn!(%err, "history fetch failed"),
            }
        });
    }

    fn publish(&self) {
        self.state.send_replace(self.controller.snapshot());
    }
}
