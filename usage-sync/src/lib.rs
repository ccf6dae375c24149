pub mod api;
pub mod app;
pub mod config;
pub mod credentials;
pub mod display;
pub mod error;
pub mod events;
pub mod history;
pub mod keychain;
pub mod network;
pub mod polling;
pub mod retry;
pub mod state;

pub use api::{UsageFetcher, build_http_client, parse_timestamp, parse_usage_body, parse_util};
pub use app::run;
pub use config::Config;
pub use credentials::{CredentialProvider, Credentials, parse_credentials, plan_label};
pub use error::{CredentialError, ErrorKind, HistoryError, RefreshError, StoreError};
pub use history::{HistoryStore, Trend, UsagePoint, compute_trend};
pub use keychain::{KeyringStore, MemoryStore, SecretStore};
pub use polling::{EngineHandle, EngineTiming, SyncEngine, UsageSource};
pub use state::{AppState, LastKnownGood, UsageSnapshot, UsageUpdate};
