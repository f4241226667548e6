//! Per-call actor owning every transaction of one Call-ID.
//!
//! All state of a call's transactions is mutated on a single task; events
//! (requests, timer fires, application replies, fork replies) are serialized
//! through its channel in arrival order. Different calls run in parallel.

use crate::IncomingRequest;
use crate::app::{BridgeReply, CallbackKind};
use crate::endpoint::Endpoint;
use crate::reply::SipReply;
use bytesstr::BytesStr;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::Instrument;

mod timer;
mod tsx;
mod uas;

pub use tsx::{TsxId, TsxState};

use timer::TimerName;
use tsx::UasTsx;

pub mod consts {
    use std::time::Duration;

    pub const T1: Duration = Duration::from_millis(500);
    pub const T4: Duration = Duration::from_secs(5);
}

/// Event entering a call actor
#[derive(Debug)]
pub(crate) enum CallEvent {
    Request(IncomingRequest),
    AppReply {
        tsx: TsxId,
        kind: CallbackKind,
        issued_in: TsxState,
        reply: BridgeReply,
    },
    Timer {
        tsx: TsxId,
        name: TimerName,
    },
    ForkReply {
        tsx: TsxId,
        reply: SipReply,
    },
}

/// Entry in the endpoint's call registry
#[derive(Debug)]
pub(crate) struct CallHandle {
    pub events: mpsc::UnboundedSender<CallEvent>,
}

pub(crate) struct Call {
    endpoint: Endpoint,
    call_id: BytesStr,
    /// Unique per-call token, used to derive the local tags of its
    /// transactions
    uid: BytesStr,
    events: mpsc::UnboundedSender<CallEvent>,

    transactions: Vec<UasTsx>,
    next_tsx_id: u64,
    msg_log: VecDeque<u64>,
}

/// Spawn the actor task for a new call and return its registry entry
pub(crate) fn spawn(endpoint: Endpoint, call_id: BytesStr) -> CallHandle {
    let (events, receiver) = mpsc::unbounded_channel();

    let uid = random_token();
    let span = tracing::info_span!("call", id = %call_id, uid = %uid);

    let call = Call {
        endpoint,
        call_id,
        uid,
        events: events.clone(),
        transactions: Vec::new(),
        next_tsx_id: 1,
        msg_log: VecDeque::new(),
    };

    tokio::spawn(call.run(receiver).instrument(span));

    CallHandle { events }
}

impl Call {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<CallEvent>) {
        'main: loop {
            let Some(event) = receiver.recv().await else {
                break;
            };

            self.handle_event(event).await;

            while self.transactions.is_empty() {
                // Deregister while holding the registry lock. The endpoint
                // sends under the same lock, so no event can slip in between
                // the emptiness check and the removal.
                let next = {
                    let mut calls = self.endpoint.calls().lock();

                    match receiver.try_recv() {
                        Ok(event) => event,
                        Err(_) => {
                            calls.remove(&self.call_id);
                            break 'main;
                        }
                    }
                };

                self.handle_event(next).await;
            }
        }

        log::debug!("call actor stopped");
    }

    async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Request(request) => self.uas_request(request).await,
            CallEvent::AppReply {
                tsx,
                kind,
                issued_in,
                reply,
            } => self.app_reply(tsx, kind, issued_in, reply).await,
            CallEvent::Timer { tsx, name } => self.timer_fired(tsx, name).await,
            CallEvent::ForkReply { tsx, reply } => self.fork_reply(tsx, reply).await,
        }
    }

    fn alloc_tsx_id(&mut self) -> TsxId {
        let id = TsxId(self.next_tsx_id);
        self.next_tsx_id += 1;
        id
    }

    fn find(&self, tsx: TsxId) -> Option<usize> {
        self.transactions.iter().position(|t| t.id == tsx)
    }

    /// Duplicate-delivery suppression over the bounded message-id log
    fn seen(&mut self, msg_id: u64) -> bool {
        if self.msg_log.contains(&msg_id) {
            return true;
        }

        if self.msg_log.len() >= self.endpoint.config().msg_log_bound {
            self.msg_log.pop_front();
        }

        self.msg_log.push_back(msg_id);

        false
    }
}

fn random_token() -> BytesStr {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    rand::rng()
        .sample_iter(Alphanumeric)
        .take(10)
        .map(char::from)
        .collect::<String>()
        .into()
}
