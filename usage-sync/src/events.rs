use std::time::{Duration, Instant, SystemTime};

/// Power state changes that affect when the next cycle should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    /// System entering sleep/suspend state
    SystemSleep,

    /// System waking from sleep/suspend
    SystemWake,
}

/// Action to take in response to a system event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeAction {
    /// Drop any armed retry; it would fire right after resume with a dead network
    CancelRetry,

    /// Re-read credentials and fetch once the network had time to reconnect
    RefreshAfterDelay,
}

impl SystemEvent {
    pub fn recommended_action(&self) -> WakeAction {
        match self {
            SystemEvent::SystemSleep => WakeAction::CancelRetry,
            SystemEvent::SystemWake => WakeAction::RefreshAfterDelay,
        }
    }
}

/// How far the wall clock may run ahead of the monotonic clock before a
/// suspend is assumed
pub const CLOCK_JUMP_THRESHOLD: Duration = Duration::from_secs(30);
const CLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// The monotonic clock stops during suspend while the wall clock keeps going,
/// so a wall-clock step well beyond the monotonic step means the machine slept.
pub fn is_clock_jump(wall_elapsed: Duration, monotonic_elapsed: Duration) -> bool {
    wall_elapsed.saturating_sub(monotonic_elapsed) > CLOCK_JUMP_THRESHOLD
}

/// Tracks the previous clock readings for [`is_clock_jump`]
#[derive(Debug, Clone, Copy)]
pub struct ClockJumpDetector {
    wall: SystemTime,
    monotonic: Instant,
}

impl ClockJumpDetector {
    pub fn new() -> Self {
        Self {
            wall: SystemTime::now(),
            monotonic: Instant::now(),
        }
    }

    /// Returns true when a jump happened since the previous check
    pub fn check(&mut self) -> bool {
        self.check_at(SystemTime::now(), Instant::now())
    }

    pub fn check_at(&mut self, wall: SystemTime, monotonic: Instant) -> bool {
        // A wall clock set backwards is not a wake
        let wall_elapsed = wall.duration_since(self.wall).unwrap_or_default();
        let monotonic_elapsed = monotonic.saturating_duration_since(self.monotonic);

        self.wall = wall;
        self.monotonic = monotonic;

        is_clock_jump(wall_elapsed, monotonic_elapsed)
    }
}

impl Default for ClockJumpDetector {
    fn default() -> Self {
        Self::new()
    }
}

pub mod clock {
    use super::{CLOCK_CHECK_INTERVAL, ClockJumpDetector, SystemEvent};
    use tokio::sync::mpsc;
    use tracing::debug;

    /// Wake detection without OS notifications. Never reports sleep.
    pub async fn run_clock_jump_listener(tx: mpsc::UnboundedSender<SystemEvent>) {
        let mut detector = ClockJumpDetector::new();
        let mut ticks = tokio::time::interval(CLOCK_CHECK_INTERVAL);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Clock jump wake detector started");

        loop {
            ticks.tick().await;
            if detector.check() {
                debug!("Wall clock jumped ahead, assuming system woke from sleep");
                if tx.send(SystemEvent::SystemWake).is_err() {
                    break;
                }
            }
        }

        debug!("Clock jump wake detector stopped");
    }
}

#[cfg(target_os = "linux")]
pub mod platform {
    use super::SystemEvent;
    use super::clock::run_clock_jump_listener;
    use tokio::sync::mpsc;
    use tracing::{debug, warn};

    /// Start listening for Linux power management events using D-Bus.
    /// Falls back to clock jump detection when logind is unreachable.
    pub fn start_power_listener() -> mpsc::UnboundedReceiver<SystemEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            match watch_logind(&tx).await {
                Ok(()) => debug!("Linux power event listener stopped"),
                Err(e) => {
                    warn!(error = %e, "logind unavailable, falling back to clock jump detection");
                    run_clock_jump_listener(tx).await;
                }
            }
        });

        rx
    }

    async fn watch_logind(tx: &mpsc::UnboundedSender<SystemEvent>) -> zbus::Result<()> {
        use futures_util::stream::StreamExt;
        use zbus::{Connection, proxy};

        #[proxy(
            interface = "org.freedesktop.login1.Manager",
            default_service = "org.freedesktop.login1",
            default_path = "/org/freedesktop/login1"
        )]
        trait Login1Manager {
            #[zbus(signal)]
            fn prepare_for_sleep(&self, start: bool) -> zbus::Result<()>;
        }

        let connection = Connection::system().await?;
        let proxy = Login1ManagerProxy::new(&connection).await?;
        let mut stream = proxy.receive_prepare_for_sleep().await?;

        debug!("Linux power event listener started");

        while let Some(signal) = stream.next().await {
            let Ok(args) = signal.args() else {
                continue;
            };

            let event = if args.start {
                debug!("Linux power event: System preparing for sleep");
                SystemEvent::SystemSleep
            } else {
                debug!("Linux power event: System resuming from sleep");
                SystemEvent::SystemWake
            };

            if tx.send(event).is_err() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub mod platform {
    use super::SystemEvent;
    use super::clock::run_clock_jump_listener;
    use tokio::sync::mpsc;

    /// Wake detection by wall-clock jumps
    pub fn start_power_listener() -> mpsc::UnboundedReceiver<SystemEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_clock_jump_listener(tx));
        rx
    }
}
