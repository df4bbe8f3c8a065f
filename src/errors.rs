use thiserror::Error;

/// Failures from invoking the external control tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("control tool `{0}` not found in PATH")]
    Missing(String),

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error while waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` did not finish within {limit} seconds")]
    Timeout { command: String, limit: u64 },

    #[error("`{command}` exited with status {status}: {detail}")]
    Failed {
        command: String,
        status: i32,
        detail: String,
    },
}

/// Fatal problems detected before the interactive loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("no wireless interface found (and none was given with --interface)")]
    NoWirelessInterface,

    #[error("`{0}` is not a wireless interface")]
    NotWireless(String),
}

/// A scan invocation failed; the caller decides whether to rescan.
#[derive(Debug, Error)]
#[error("scan on {interface} failed: {source}")]
pub struct ScanError {
    pub interface: String,
    #[source]
    pub source: ToolError,
}

/// Every applicable connection strategy was exhausted.
#[derive(Debug, Error)]
#[error("could not connect to \"{ssid}\": {reason}")]
pub struct ConnectFailed {
    pub ssid: String,
    pub reason: String,
}

/// Rejected menu input; reported and the prompt redisplays.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("no entry numbered {0} on screen")]
    OutOfRange(usize),

    #[error("unrecognized command: {0:?}")]
    Unrecognized(String),
}
