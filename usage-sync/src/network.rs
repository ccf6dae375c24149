use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connectivity transition forwarded to the coordination loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Unavailable,
}

impl NetworkEvent {
    pub fn from_available(available: bool) -> Self {
        if available {
            NetworkEvent::Available
        } else {
            NetworkEvent::Unavailable
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, NetworkEvent::Available)
    }
}

/// Collapses raw observations into transitions. The network is assumed up until
/// an observation says otherwise.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    available: bool,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self { available: true }
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, available: bool) -> Option<NetworkEvent> {
        if available == self.available {
            return None;
        }
        self.available = available;
        Some(NetworkEvent::from_available(available))
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}

pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// `host:port` to probe for reachability, taken from the usage endpoint
pub fn probe_address(url: &str) -> Option<String> {
    let url = reqwest::Url::parse(url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Reachability is a TCP connect within a short timeout
pub async fn probe(address: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

async fn run_probe_loop(address: String, tx: mpsc::UnboundedSender<NetworkEvent>) {
    let mut monitor = NetworkMonitor::new();
    let mut ticks = tokio::time::interval(PROBE_INTERVAL);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(address = %address, "Network reachability probe started");

    loop {
        ticks.tick().await;
        if let Some(event) = monitor.observe(probe(&address).await) {
            info!(?event, "Network availability changed");
            if tx.send(event).is_err() {
                break;
            }
        }
    }

    debug!("Network reachability probe stopped");
}

/// Start watching connectivity. Only transitions are sent.
#[cfg(not(target_os = "linux"))]
pub fn start_network_listener(probe_address: String) -> mpsc::UnboundedReceiver<NetworkEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_probe_loop(probe_address, tx));
    rx
}

/// Start watching connectivity. Only transitions are sent.
///
/// Follows NetworkManager's global state over D-Bus and falls back to the
/// reachability probe when the system bus or NetworkManager is missing.
#[cfg(target_os = "linux")]
pub fn start_network_listener(probe_address: String) -> mpsc::UnboundedReceiver<NetworkEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        match linux::watch_network_manager(&tx).await {
            Ok(()) => debug!("NetworkManager listener stopped"),
            Err(e) => {
                warn!(error = %e, "NetworkManager unavailable, falling back to reachability probe");
                run_probe_loop(probe_address, tx).await;
            }
        }
    });

    rx
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{NetworkEvent, NetworkMonitor};
    use futures_util::stream::StreamExt;
    use tokio::sync::mpsc;
    use tracing::{debug, info};
    use zbus::{Connection, proxy};

    /// NM_STATE_CONNECTED_GLOBAL
    pub const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

    #[proxy(
        interface = "org.freedesktop.NetworkManager",
        default_service = "org.freedesktop.NetworkManager",
        default_path = "/org/freedesktop/NetworkManager"
    )]
    trait NetworkManager {
        #[zbus(property)]
        fn state(&self) -> zbus::Result<u32>;
    }

    pub async fn watch_network_manager(tx: &mpsc::UnboundedSender<NetworkEvent>) -> zbus::Result<()> {
        let connection = Connection::system().await?;
        let proxy = NetworkManagerProxy::new(&connection).await?;

        let mut monitor = NetworkMonitor::new();
        let initial = proxy.state().await?;
        debug!(state = initial, "NetworkManager listener started");

        if let Some(event) = monitor.observe(initial == NM_STATE_CONNECTED_GLOBAL) {
            info!(?event, "Network availability changed");
            if tx.send(event).is_err() {
                return Ok(());
            }
        }

        let mut changes = proxy.receive_state_changed().await;
        while let Some(change) = changes.next().await {
            let Ok(state) = change.get().await else {
                continue;
            };
            debug!(state, "NetworkManager state changed");

            if let Some(event) = monitor.observe(state == NM_STATE_CONNECTED_GLOBAL) {
                info!(?event, "Network availability changed");
                if tx.send(event).is_err() {
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    #[test]
    fn test_monitor_forwards_only_transitions() {
        let mut monitor = NetworkMonitor::new();
        assert!(monitor.observe(true) == None);
        assert!(monitor.observe(false) == Some(NetworkEvent::Unavailable));
        assert!(monitor.observe(false) == None);
        assert!(monitor.observe(true) == Some(NetworkEvent::Available));
        assert!(monitor.is_available());
    }

    #[test]
    fn test_probe_address_from_url() {
        assert!(
            probe_address("https://api.anthropic.com/api/oauth/usage").as_deref() == Some("api.anthropic.com:443")
        );
        assert!(
            probe_address("http://127.0.0.1:8080/api/oauth/usage").as_deref() == Some("127.0.0.1:8080")
        );
        assert!(probe_address("not a url") == None);
    }

    #[tokio::test]
    async fn test_probe_unreachable_port() {
        assert!(!probe("127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(probe(&address).await);
    }
}
