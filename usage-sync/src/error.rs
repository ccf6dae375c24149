use serde::{Deserialize, Serialize};

/// Classification of the outcome of one usage fetch.
///
/// Every `UsageSnapshot` carries one of these; `None` means the snapshot is live data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorKind {
    #[default]
    None,
    NoToken,
    NetworkOffline,
    NetworkTimeout,
    HttpError(u16),
    ParseError,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::None => write!(f, "none"),
            ErrorKind::NoToken => write!(f, "no token"),
            ErrorKind::NetworkOffline => write!(f, "network offline"),
            ErrorKind::NetworkTimeout => write!(f, "network timeout"),
            ErrorKind::HttpError(code) => write!(f, "HTTP {}", code),
            ErrorKind::ParseError => write!(f, "parse error"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

impl ErrorKind {
    pub fn is_error(&self) -> bool {
        !matches!(self, ErrorKind::None)
    }

    /// Returns true if the error is expected to clear up without user action
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::NetworkOffline | ErrorKind::NetworkTimeout | ErrorKind::Unknown => true,
            ErrorKind::HttpError(code) => *code == 429 || (500..=599).contains(code),
            ErrorKind::None | ErrorKind::NoToken | ErrorKind::ParseError => false,
        }
    }

    /// Errors that need the user (or a system event) before another attempt makes sense.
    /// The scheduler never arms a timed retry for these.
    pub fn blocks_auto_retry(&self) -> bool {
        matches!(self, ErrorKind::NoToken | ErrorKind::HttpError(401))
    }

    /// Get a user-friendly error category for display
    pub fn category(&self) -> &'static str {
        match self {
            ErrorKind::None => "OK",
            ErrorKind::NoToken => "No Credentials",
            ErrorKind::NetworkOffline => "Offline",
            ErrorKind::NetworkTimeout => "Timed Out",
            ErrorKind::HttpError(401) => "Authentication Error",
            ErrorKind::HttpError(429) => "Rate Limited",
            ErrorKind::HttpError(code) if (500..=599).contains(code) => "Server Error",
            ErrorKind::HttpError(_) => "Request Rejected",
            ErrorKind::ParseError => "Parse Error",
            ErrorKind::Unknown => "Unknown Error",
        }
    }

    /// What the user has to do to get out of a fatal state
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            ErrorKind::NoToken => Some("Keychain access needed - relaunch & click Allow"),
            ErrorKind::HttpError(401) => Some("Session expired - run `claude` and log in again"),
            _ => None,
        }
    }
}

/// Failure to obtain credentials from the secret store
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialError {
    NoCredentials,
    AccessDenied(String),
    Malformed(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialError::NoCredentials => write!(f, "No credentials in secret store"),
            CredentialError::AccessDenied(msg) => write!(f, "Secret store access denied: {}", msg),
            CredentialError::Malformed(msg) => write!(f, "Malformed credentials: {}", msg),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Failure of a refresh-token exchange. None of these mutate the secret store.
#[derive(Debug)]
pub enum RefreshError {
    MissingRefreshToken,
    Network(String),
    Status(u16),
    Parse(String),
    Store(StoreError),
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::MissingRefreshToken => write!(f, "No refresh token available"),
            RefreshError::Network(msg) => write!(f, "Refresh request failed: {}", msg),
            RefreshError::Status(code) => write!(f, "Refresh rejected with HTTP {}", code),
            RefreshError::Parse(msg) => write!(f, "Refresh response unreadable: {}", msg),
            RefreshError::Store(e) => write!(f, "Could not write refreshed token: {}", e),
        }
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RefreshError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RefreshError {
    fn from(e: StoreError) -> Self {
        RefreshError::Store(e)
    }
}

/// Secret store failure
#[derive(Debug)]
pub enum StoreError {
    NotFound,
    AccessDenied(String),
    Platform(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "Entry not found"),
            StoreError::AccessDenied(msg) => write!(f, "Access denied: {}", msg),
            StoreError::Platform(msg) => write!(f, "Platform error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<keyring::Error> for StoreError {
    fn from(e: keyring::Error) -> Self {
        match e {
            keyring::Error::NoEntry => StoreError::NotFound,
            keyring::Error::NoStorageAccess(inner) => StoreError::AccessDenied(inner.to_string()),
            other => StoreError::Platform(other.to_string()),
        }
    }
}

impl From<StoreError> for CredentialError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => CredentialError::NoCredentials,
            StoreError::AccessDenied(msg) => CredentialError::AccessDenied(msg),
            StoreError::Platform(msg) => CredentialError::AccessDenied(msg),
        }
    }
}

/// History persistence failure
#[derive(Debug)]
pub enum HistoryError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::Io(e) => write!(f, "History I/O error: {}", e),
            HistoryError::Json(e) => write!(f, "History JSON error: {}", e),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<std::io::Error> for HistoryError {
    fn from(e: std::io::Error) -> Self {
        HistoryError::Io(e)
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(e: serde_json::Error) -> Self {
        HistoryError::Json(e)
    }
}
