//! Speech capture collaborator contract.
//!
//! The platform speech-to-text capability (continuous, interim-enabled
//! recognition) lives outside this crate; the coordinator only consumes the
//! event stream defined here.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Error code for the common "nothing was said" condition. Not a real
/// error; it is swallowed without logging.
pub const BENIGN_NO_SPEECH: &str = "no-speech";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// Unstabilized fragment, for display only; never used for matching
    Interim(String),
    /// Finalized fragment, appended to the transcript window
    Final(String),
    /// The engine stopped; the coordinator restarts it while enabled
    Ended,
    Error(String),
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Begin a recognition session; events arrive on the returned channel
    /// until the session ends.
    async fn start(&self) -> Result<mpsc::Receiver<SpeechEvent>>;

    /// Stop recognition. Must be idempotent.
    async fn stop(&self);
}
