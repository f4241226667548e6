use super::{CallEvent, TsxId};
use crate::app::CallbackKind;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Names of the timers a server transaction may hold.
///
/// Timers B, E and K of RFC 3261 belong to client transactions and are never
/// armed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerName {
    /// Re-send the automatic `100 Trying` while no other response went out
    Timer100,

    /// INVITE proceeding took too long, abort with `408`
    TimerC,

    /// Non-INVITE transaction timeout (RFC timer F), abort with `408`
    NoInvite,

    /// The request's Expires header ran out, abort with `487`
    Expire,

    /// Wait for the ACK to a negative INVITE final response
    TimerH,

    /// Linger after the ACK arrived to absorb stray retransmissions
    TimerI,

    /// Linger after a non-INVITE final response to absorb retransmissions
    TimerJ,

    /// Deadline of an outstanding application callback
    App(CallbackKind),
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerName::Timer100 => f.write_str("timer_100"),
            TimerName::TimerC => f.write_str("timer_c"),
            TimerName::NoInvite => f.write_str("noinvite"),
            TimerName::Expire => f.write_str("expire"),
            TimerName::TimerH => f.write_str("timer_h"),
            TimerName::TimerI => f.write_str("timer_i"),
            TimerName::TimerJ => f.write_str("timer_j"),
            TimerName::App(kind) => write!(f, "app_{}", kind.name()),
        }
    }
}

/// The timers currently armed for one transaction.
///
/// Arming is idempotent per name, re-arming aborts the prior timer task.
/// Fire events are posted into the call actor and must be acknowledged with
/// [`Timers::fired`] so cancellations that raced the event queue win.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    armed: HashMap<TimerName, AbortHandle>,
}

impl Timers {
    pub(crate) fn arm(
        &mut self,
        name: TimerName,
        after: Duration,
        tsx: TsxId,
        events: &mpsc::UnboundedSender<CallEvent>,
    ) {
        self.cancel(name);

        let events = events.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(CallEvent::Timer { tsx, name });
        });

        self.armed.insert(name, task.abort_handle());
    }

    pub(crate) fn cancel(&mut self, name: TimerName) {
        if let Some(handle) = self.armed.remove(&name) {
            handle.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Acknowledge a fire event. `false` means the timer was cancelled or
    /// re-armed after the event was queued and the event must be dropped.
    pub(crate) fn fired(&mut self, name: TimerName) -> bool {
        self.armed.remove(&name).is_some()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
