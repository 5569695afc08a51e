use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use tracing::error;

use crate::config::MSG_QUEUE_LEN;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BigState {
    #[default]
    Disabled,
    Syncing,
    Synced,
    Shutdown,
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BigEvent {
    Reset,
    CreateSync,
    TerminateSync,
    BigInfoReceived,
    PduTerminate,
    SyncTimeout,
    MicFailed,
    TerminatedSync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BigAction {
    /// Reserve the baseband and mark the controller busy.
    Start,
    /// Build contexts and the first operation, then report the sync as established.
    BigSync,
    /// Host terminate or reset: remove the operation.
    Shutdown,
    /// Peer terminated the BIG.
    Term,
    /// Sync timeout expired.
    SyncLost,
    MicFailed,
    /// Operation is gone: free the context and report the outcome.
    Cleanup,
}

/// Message posted to the dispatch context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigMsg {
    pub big_handle: u8,
    pub event: BigEvent,
}

pub type BigMsgChannel = Channel<CriticalSectionRawMutex, BigMsg, MSG_QUEUE_LEN>;

/// Posts without blocking, from any context. Returns `false` if the queue was full.
pub fn post(msgs: &BigMsgChannel, big_handle: u8, event: BigEvent) -> bool {
    if msgs.try_send(BigMsg { big_handle, event }).is_err() {
        error!(big_handle, ?event, "BIG message queue full, dropped");
        return false;
    }
    true
}

/// BIG lifecycle. The returned state always applies; a `None` action means nothing runs.
pub fn transition(state: BigState, event: BigEvent) -> (BigState, Option<BigAction>) {
    use BigAction as A;
    use BigEvent as E;
    use BigState as S;

    match (state, event) {
        (S::Disabled, E::CreateSync) => (S::Syncing, Some(A::Start)),

        (S::Syncing, E::BigInfoReceived) => (S::Synced, Some(A::BigSync)),
        (S::Syncing | S::Synced, E::TerminateSync) => (S::Shutdown, Some(A::Shutdown)),
        (S::Syncing | S::Synced, E::Reset) => (S::Reset, Some(A::Shutdown)),

        (S::Synced, E::PduTerminate) => (S::Shutdown, Some(A::Term)),
        (S::Synced, E::SyncTimeout) => (S::Shutdown, Some(A::SyncLost)),
        (S::Synced, E::MicFailed) => (S::Shutdown, Some(A::MicFailed)),

        (S::Shutdown, E::Reset) => (S::Reset, None),
        (S::Shutdown, E::TerminatedSync) => (S::Disabled, Some(A::Cleanup)),
        (S::Reset, E::TerminatedSync) => (S::Reset, Some(A::Cleanup)),

        (s, _) => (s, None),
    }
}
