//! Control flow (re-)actions to `Commands`.
//!
//! These actions indicate to the communications partner how to react regarding
//! the last command.

mod bidirectional;
mod quit;
mod to_mta_only;

use enum_dispatch::enum_dispatch;

pub use self::bidirectional::{Abort, Continue};
pub use self::quit::{Quit, QuitNc};
pub use self::to_mta_only::{Accept, Discard, Progress, Reject, Replycode, Skip, Tempfail};

/// All control-flow actions combined
///
/// See the contained variants for more.
#[allow(missing_docs)]
#[enum_dispatch]
#[derive(Debug, Clone)]
pub enum Action {
    Continue,
    Abort,

    Accept,
    Discard,
    Reject,
    Tempfail,
    Skip,
    Replycode,
    Progress,

    Quit,
    QuitNc,
}

impl Action {
    /// Whether this decision terminates processing of the current message
    /// and the caller should short-circuit rather than proceed to the next
    /// phase.
    ///
    /// True for `Accept`, `Reject`, `Discard`, `Tempfail` and `Replycode`.
    /// `Progress` is a keep-alive and never terminal; `Skip` only shortcuts
    /// the current streaming stage, it does not end the message.
    #[must_use]
    pub fn stop_processing(&self) -> bool {
        matches!(
            self,
            Self::Accept(_) | Self::Reject(_) | Self::Discard(_) | Self::Tempfail(_) | Self::Replycode(_)
        )
    }
}
