use std::path::PathBuf;
use std::time::Duration;

pub use session_core::SessionConfig;
use session_core::prompt::Credentials;

use crate::cli::Args;

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub locator: String,
    pub output: Option<PathBuf>,
    pub track: Option<usize>,
    pub seek: Option<f64>,
    pub credentials: Option<Credentials>,
    pub session: SessionConfig,
}

#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub locator: Option<String>,
    pub credentials: Option<Credentials>,
    pub session: SessionConfig,
}

/// Session tuning from command-line flags; everything else keeps its default.
pub fn session_config(args: &Args) -> SessionConfig {
    SessionConfig {
        queue_capacity: args.queue_capacity.max(1),
        queue_headroom: args.queue_headroom,
        login_poll: Duration::from_millis(args.login_poll_ms.max(1)),
        take_poll: Duration::from_millis(args.take_poll_ms.max(1)),
        ..SessionConfig::default()
    }
}

/// Credentials given on the command line, if both parts are present.
pub fn credentials(args: &Args) -> Option<Credentials> {
    match (&args.username, &args.password) {
        (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
        _ => None,
    }
}
