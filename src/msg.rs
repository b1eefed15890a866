use crate::model::check::CheckResult;
use crate::plugin::installer::TaskReport;
use crate::plugin::session::SessionOutcome;

/// Completion events that drive the run loop.
#[derive(Debug)]
pub enum Msg {
    /// One version check finished (successfully or not).
    Checked(CheckResult),
    /// A download task reached a terminal state.
    TaskFinished(TaskReport),
    /// The premium batch is done and its session released.
    SessionFinished(SessionOutcome),
}
