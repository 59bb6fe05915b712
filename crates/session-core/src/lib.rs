pub mod config;
pub mod error;
pub mod input;
pub mod prompt;
pub mod pump;
pub mod queue;
pub mod remote;
pub mod session;
pub mod sim;
pub mod sync;

pub use config::SessionConfig;
pub use error::{Error, RemoteError, RemoteErrorKind, Result};
pub use input::RemoteInput;
pub use queue::{AudioFrames, AudioSegment, BoundedAudioQueue};
pub use session::{EventSink, OwnerId, SessionCoordinator};
pub use sync::{CancelToken, CancellableLock, WaitableEvent};
