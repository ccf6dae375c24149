use crate::api::UsageFetcher;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::events::{SystemEvent, WakeAction};
use crate::history::HistoryStore;
use crate::network::NetworkEvent;
use crate::retry::RetryState;
use crate::state::{AppState, UsageSnapshot, UsageUpdate};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One complete fetch cycle, run off the coordination loop
pub trait UsageSource: Send + Sync + 'static {
    /// Obtain credentials, fetch and classify. Never fails; errors are carried in the snapshot.
    fn run_cycle(&self) -> impl Future<Output = UsageSnapshot> + Send;

    /// Forget cached credentials so the next cycle re-reads the secret store
    fn invalidate_credentials(&self);
}

impl UsageSource for UsageFetcher {
    fn run_cycle(&self) -> impl Future<Output = UsageSnapshot> + Send {
        self.fetch_current()
    }

    fn invalidate_credentials(&self) {
        self.credentials().invalidate();
    }
}

/// What caused a cycle to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Periodic,
    Manual,
    Retry,
    NetworkRestore,
    Wake,
}

/// Messages accepted by the coordination loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    RefreshNow,
    Network(NetworkEvent),
    System(SystemEvent),
}

/// Cloneable sender side of the engine. Every method returns false once the
/// engine has stopped.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn refresh_now(&self) -> bool {
        self.tx.send(EngineCommand::RefreshNow).is_ok()
    }

    pub fn network_changed(&self, event: NetworkEvent) -> bool {
        self.tx.send(EngineCommand::Network(event)).is_ok()
    }

    pub fn system_event(&self, event: SystemEvent) -> bool {
        self.tx.send(EngineCommand::System(event)).is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    pub poll_interval: Duration,
    pub network_settle: Duration,
    pub wake_delay: Duration,
    pub watchdog_interval: Duration,
    /// Place periodic ticks on wall-clock multiples of `poll_interval`
    pub align_to_wall_clock: bool,
}

impl From<&Config> for EngineTiming {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            network_settle: config.network_settle_delay(),
            wake_delay: config.wake_delay(),
            watchdog_interval: config.watchdog_interval(),
            align_to_wall_clock: true,
        }
    }
}

/// Time until the next wall-clock multiple of `period` (a full period when exactly on one)
pub fn delay_to_next_boundary(now: SystemTime, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1);
    let since_epoch_ms = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let remaining = period_ms - since_epoch_ms % period_ms;
    Duration::from_millis(remaining as u64)
}

/// A cycle to start once a settle or reconnect delay has passed
#[derive(Debug, Clone, Copy)]
struct DelayedCycle {
    deadline: Instant,
    trigger: Trigger,
    reset_failures: bool,
}

/// Coordination loop. Owns retry bookkeeping, last-known-good state and the
/// history; fetches run in a spawned task and rejoin here before any state changes.
pub struct SyncEngine<S: UsageSource> {
    source: Arc<S>,
    timing: EngineTiming,

    retry: RetryState,
    state: AppState,
    history: HistoryStore,
    network_available: bool,

    commands: mpsc::UnboundedReceiver<EngineCommand>,
    updates: watch::Sender<UsageUpdate>,

    in_flight: Option<JoinHandle<UsageSnapshot>>,
    delayed: Option<DelayedCycle>,

    ticker: Option<JoinHandle<()>>,
    tick_tx: mpsc::UnboundedSender<()>,
    tick_rx: mpsc::UnboundedReceiver<()>,
    last_tick: Instant,
}

impl<S: UsageSource> SyncEngine<S> {
    pub fn new(
        source: Arc<S>,
        timing: EngineTiming,
        history: HistoryStore,
    ) -> (Self, EngineHandle, watch::Receiver<UsageUpdate>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let initial = UsageUpdate {
            history: history.points().to_vec(),
            network_available: true,
            ..Default::default()
        };
        let (updates, update_rx) = watch::channel(initial);

        let engine = Self {
            source,
            timing,
            retry: RetryState::new(),
            state: AppState::new(),
            history,
            network_available: true,
            commands,
            updates,
            in_flight: None,
            delayed: None,
            ticker: None,
            tick_tx,
            tick_rx,
            last_tick: Instant::now(),
        };

        (engine, EngineHandle { tx: command_tx }, update_rx)
    }

    pub async fn run(mut self, cancel_token: CancellationToken) {
        info!(
            poll_interval_secs = self.timing.poll_interval.as_secs(),
            history_points = self.history.points().len(),
            "Sync engine started"
        );

        self.spawn_ticker();
        self.start_cycle(Trigger::Startup);

        let watchdog_period = self.timing.watchdog_interval;
        let mut watchdog = interval_at(Instant::now() + watchdog_period, watchdog_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_deadline = self.retry.pending_retry();
            let delayed_deadline = self.delayed.map(|d| d.deadline);

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Shutdown signal received, stopping sync engine");
                    break;
                }
                result = join_cycle(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.finish_cycle(result).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }
                Some(()) = self.tick_rx.recv() => {
                    self.last_tick = Instant::now();
                    self.start_cycle(Trigger::Periodic);
                }
                _ = sleep_until_deadline(retry_deadline) => {
                    if !self.start_cycle(Trigger::Retry) {
                        self.retry.cancel_pending();
                    }
                }
                _ = sleep_until_deadline(delayed_deadline) => {
                    self.run_delayed_cycle();
                }
                _ = watchdog.tick() => {
                    self.check_ticker();
                }
            }
        }

        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if self.in_flight.is_some() {
            debug!("Leaving in-flight fetch to finish on its own");
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::RefreshNow => {
                if self.retry.in_flight() {
                    debug!("Manual refresh ignored, cycle already in flight");
                    return;
                }
                info!("Manual refresh requested");
                self.retry.reset();
                self.start_cycle(Trigger::Manual);
            }
            EngineCommand::Network(event) => self.handle_network(event),
            EngineCommand::System(event) => self.handle_system(event),
        }
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        let available = event.is_available();
        if available == self.network_available {
            return;
        }
        self.network_available = available;

        if available {
            info!(
                settle_ms = self.timing.network_settle.as_millis() as u64,
                "Network restored, refreshing after settle delay"
            );
            self.schedule_delayed(self.timing.network_settle, Trigger::NetworkRestore, true);
        } else {
            info!("Network lost");
        }
        self.publish();
    }

    fn handle_system(&mut self, event: SystemEvent) {
        match event.recommended_action() {
            WakeAction::CancelRetry => {
                info!(?event, "System going to sleep, cancelling scheduled retry");
                self.retry.cancel_pending();
                self.publish();
            }
            WakeAction::RefreshAfterDelay => {
                info!(
                    ?event,
                    delay_ms = self.timing.wake_delay.as_millis() as u64,
                    "System woke, refreshing after delay"
                );
                self.source.invalidate_credentials();
                self.schedule_delayed(self.timing.wake_delay, Trigger::Wake, false);
            }
        }
    }

    /// Overlapping requests merge into one: the later deadline wins and a
    /// failure reset is kept if either asked for it.
    fn schedule_delayed(&mut self, delay: Duration, trigger: Trigger, reset_failures: bool) {
        let deadline = Instant::now() + delay;
        self.delayed = Some(match self.delayed {
            Some(pending) => DelayedCycle {
                deadline: pending.deadline.max(deadline),
                trigger: if reset_failures { trigger } else { pending.trigger },
                reset_failures: pending.reset_failures || reset_failures,
            },
            None => DelayedCycle {
                deadline,
                trigger,
                reset_failures,
            },
        });
    }

    fn run_delayed_cycle(&mut self) {
        let Some(delayed) = self.delayed.take() else {
            return;
        };

        if delayed.reset_failures {
            self.retry.reset();
            self.source.invalidate_credentials();
        }
        self.start_cycle(delayed.trigger);
        self.publish();
    }

    /// Single-flight entry point. Returns false when the trigger was dropped.
    fn start_cycle(&mut self, trigger: Trigger) -> bool {
        if !self.retry.try_begin_cycle() {
            debug!(?trigger, "Cycle already in flight, trigger dropped");
            return false;
        }

        debug!(?trigger, "Starting fetch cycle");
        let source = Arc::clone(&self.source);
        self.in_flight = Some(tokio::spawn(async move { source.run_cycle().await }));
        self.publish();
        true
    }

    async fn finish_cycle(&mut self, result: Result<UsageSnapshot, JoinError>) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Fetch cycle task failed");
                UsageSnapshot::failed(ErrorKind::Unknown, "Request failed", "")
            }
        };

        if snapshot.is_success() {
            self.retry.record_success();

            info!(
                session_pct = snapshot.session_pct,
                weekly_pct = snapshot.weekly_pct,
                plan = %snapshot.plan_label,
                "Usage data fetched"
            );

            if let Err(e) = self.history.record(snapshot.session_pct).await {
                warn!(error = %e, path = %self.history.path().display(), "Failed to persist usage history");
            }
            self.state.update_success(snapshot, Utc::now());
        } else {
            let kind = snapshot.error_kind;
            let retry_delay = self
                .retry
                .record_failure(kind, self.network_available, Instant::now());

            match retry_delay {
                Some(delay) => warn!(
                    error = snapshot.error.as_deref().unwrap_or_default(),
                    error_kind = %kind,
                    error_category = kind.category(),
                    is_transient = kind.is_transient(),
                    consecutive_failures = self.retry.consecutive_failures(),
                    retry_delay_secs = delay.as_secs(),
                    "Fetch failed, retry scheduled"
                ),
                None => warn!(
                    error = snapshot.error.as_deref().unwrap_or_default(),
                    error_kind = %kind,
                    error_category = kind.category(),
                    network_available = self.network_available,
                    consecutive_failures = self.retry.consecutive_failures(),
                    "Fetch failed, waiting for user action or network restore"
                ),
            }

            self.state.update_error(snapshot);
        }

        self.publish();
    }

    fn spawn_ticker(&mut self) {
        if let Some(old) = self.ticker.take() {
            old.abort();
        }

        let period = self.timing.poll_interval;
        let first_delay = if self.timing.align_to_wall_clock {
            delay_to_next_boundary(SystemTime::now(), period)
        } else {
            period
        };
        let tx = self.tick_tx.clone();

        self.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + first_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if tx.send(()).is_err() {
                    break;
                }
            }
        }));
        self.last_tick = Instant::now();
    }

    /// Re-arm the periodic trigger when its task died or stopped ticking
    fn check_ticker(&mut self) {
        let finished = self.ticker.as_ref().is_none_or(|t| t.is_finished());
        let overdue = self.last_tick.elapsed() > self.timing.poll_interval * 2;

        if finished || overdue {
            warn!(finished, overdue, "Periodic trigger not running, re-arming");
            self.spawn_ticker();
        }
    }

    fn publish(&self) {
        let update = UsageUpdate {
            current: self.state.current.clone(),
            last_known_good: self.state.last_known_good.clone(),
            history: self.history.points().to_vec(),
            consecutive_failures: self.retry.consecutive_failures(),
            retry_scheduled: self.retry.pending_retry().is_some(),
            network_available: self.network_available,
            in_flight: self.retry.in_flight(),
        };

        self.updates.send_if_modified(|previous| {
            if *previous == update {
                return false;
            }
            *previous = update;
            true
        });
    }
}

async fn join_cycle(handle: &mut Option<JoinHandle<UsageSnapshot>>) -> Result<UsageSnapshot, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
