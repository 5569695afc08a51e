use core::cell::RefCell;

use embassy_sync::blocking_mutex::CriticalSectionMutex;
use heapless::Vec;
use tracing::{debug, info, warn};

use crate::config::{
    sync_timeout_duration, BigSyncConfig, BIG_HANDLE_MAX, BIS_INDEX_MAX, MAX_BIG, MAX_BIS_PER_BIG, MSE_MAX,
    SYNC_HANDLE_MAX, SYNC_TIMEOUT_MAX, SYNC_TIMEOUT_MIN,
};
use crate::sdk::ble_app::big_builder::{build_big, schedule_first, sync_established, window_widening_usec};
use crate::sdk::ble_app::big_irq;
use crate::sdk::ble_app::big_sdu::Sdu;
use crate::sdk::ble_app::big_sm::{post, transition, BigAction, BigEvent, BigMsg, BigMsgChannel, BigState};
use crate::sdk::ble_app::ble_ll_status::Status;
use crate::sdk::ble_app::rf_drv::{Baseband, BigInfoReport, Platform, RxStatus, Scheduler, SyncEstablished, SyncTimer};
use crate::state::{ContextRepo, DataPath, IsoTestState, IsoTestStats, TermCause};

/// Parameters of HCI LE BIG Create Sync.
#[derive(Clone, Copy, Debug)]
pub struct CreateSyncParams<'a> {
    pub big_handle: u8,
    pub sync_handle: u16,
    /// Maximum subevents to listen to per BIS event, 0 for no limit.
    pub mse: u8,
    /// Sync timeout in 10 ms units.
    pub sync_timeout: u16,
    pub bis: &'a [u8],
    pub encrypt: bool,
    pub broadcast_code: [u8; 16],
}

impl CreateSyncParams<'_> {
    /// Range checks only; returns the requested BIS numbers as a bit set.
    fn validate(&self) -> Result<u32, Status> {
        if self.big_handle > BIG_HANDLE_MAX
            || self.sync_handle > SYNC_HANDLE_MAX
            || self.mse > MSE_MAX
            || !(SYNC_TIMEOUT_MIN..=SYNC_TIMEOUT_MAX).contains(&self.sync_timeout)
            || self.bis.is_empty()
            || self.bis.len() > BIS_INDEX_MAX as usize
            || self.bis.iter().any(|n| *n == 0 || *n > BIS_INDEX_MAX)
        {
            return Err(Status::InvalidParams);
        }

        let mut seen = 0u32;
        for n in self.bis {
            if seen & (1u32 << n) != 0 {
                return Err(Status::InvalidParams);
            }
            seen |= 1u32 << n;
        }
        Ok(seen)
    }
}

/// BIS numbers ascending, so the grid walk stays chronological.
fn sorted_bis(seen: u32) -> Result<Vec<u8, MAX_BIS_PER_BIG>, Status> {
    let mut sorted = Vec::new();
    for n in (1..=BIS_INDEX_MAX).filter(|n| seen & (1u32 << n) != 0) {
        sorted.push(n).map_err(|_| Status::MemCapExceeded)?;
    }
    Ok(sorted)
}

struct Engine<P> {
    cfg: BigSyncConfig,
    repo: ContextRepo,
    platform: P,
}

impl<P: Platform> Engine<P> {
    fn handle(&mut self, msgs: &BigMsgChannel, big_handle: u8, event: BigEvent) {
        let Some(big) = self.repo.big_mut(big_handle) else {
            debug!(big_handle, ?event, "event for unknown BIG dropped");
            return;
        };

        let prev = big.state;
        let (next, action) = transition(prev, event);
        big.state = next;

        if next != prev {
            info!(big_handle, ?prev, ?next, ?event, "BIG state change");
        }
        if let Some(action) = action {
            self.run(msgs, big_handle, prev, event, action);
        }
    }

    fn run(&mut self, msgs: &BigMsgChannel, big_handle: u8, prev: BigState, event: BigEvent, action: BigAction) {
        match action {
            BigAction::Start => {
                Baseband::start(&mut self.platform, big_handle);
                self.repo.busy_inc();
            }
            BigAction::BigSync => self.big_sync(big_handle),
            BigAction::Shutdown => self.shutdown(msgs, big_handle, prev, event),
            BigAction::Term => self.term(big_handle),
            BigAction::SyncLost => self.lose(msgs, big_handle, Status::ConnTimeout),
            BigAction::MicFailed => self.lose(msgs, big_handle, Status::MicFailure),
            BigAction::Cleanup => self.cleanup(big_handle),
        }
    }

    fn big_sync(&mut self, big_handle: u8) {
        let result = build_big(&mut self.repo, &self.platform, &self.cfg, big_handle).and_then(|()| {
            let big = self.repo.big_mut(big_handle).ok_or(Status::UnknownAdvId)?;
            schedule_first(big, &mut self.platform, self.cfg.local_sca_ppm)
        });

        match result {
            Ok(()) => {
                let handles = self.repo.bis_handles(big_handle);
                let Some(big) = self.repo.big(big_handle) else {
                    return;
                };

                SyncTimer::start(&mut self.platform, big_handle, sync_timeout_duration(big.sync_timeout));
                let evt = sync_established(big, handles);
                info!(big_handle, latency = evt.transport_latency_usec, bis = ?evt.bis_handles, "BIG sync established");
                self.platform.sync_established(&evt);
            }
            Err(status) => {
                warn!(big_handle, ?status, "BIG sync failed");
                self.platform.sync_established(&SyncEstablished::failed(big_handle, status));
                self.release(big_handle);
            }
        }
    }

    /// Removes the pending operation. Posts `TerminatedSync` unless an executing
    /// operation will post it from its end of event.
    fn remove_op(&mut self, msgs: &BigMsgChannel, big_handle: u8) {
        let Some(big) = self.repo.big(big_handle) else {
            return;
        };
        let scheduled = big.op_scheduled;

        if Scheduler::remove(&mut self.platform, big_handle) || !scheduled {
            if let Some(big) = self.repo.big_mut(big_handle) {
                big.op_scheduled = false;
            }
            post(msgs, big_handle, BigEvent::TerminatedSync);
        } else {
            debug!(big_handle, "BIG event in flight, waiting for its end");
        }
    }

    fn shutdown(&mut self, msgs: &BigMsgChannel, big_handle: u8, prev: BigState, event: BigEvent) {
        let cause = if event == BigEvent::Reset { TermCause::Reset } else { TermCause::Host };
        if let Some(big) = self.repo.big_mut(big_handle) {
            big.term_cause = cause;
        }
        SyncTimer::stop(&mut self.platform, big_handle);

        if prev == BigState::Syncing {
            self.platform
                .sync_established(&SyncEstablished::failed(big_handle, Status::LocalHostTerminated));
            post(msgs, big_handle, BigEvent::TerminatedSync);
            return;
        }

        self.remove_op(msgs, big_handle);
    }

    fn lose(&mut self, msgs: &BigMsgChannel, big_handle: u8, reason: Status) {
        warn!(big_handle, ?reason, "BIG sync lost");
        if let Some(big) = self.repo.big_mut(big_handle) {
            big.term_cause = TermCause::Lost(reason);
        }
        SyncTimer::stop(&mut self.platform, big_handle);
        self.remove_op(msgs, big_handle);
    }

    fn term(&mut self, big_handle: u8) {
        let reason = self.repo.big(big_handle).map(|b| b.pending_ctrl.term_reason).unwrap_or_default();

        SyncTimer::stop(&mut self.platform, big_handle);
        self.release(big_handle);
        self.platform.sync_lost(big_handle, reason);
    }

    fn cleanup(&mut self, big_handle: u8) {
        let cause = self.repo.big(big_handle).map(|b| b.term_cause).unwrap_or_default();

        SyncTimer::stop(&mut self.platform, big_handle);
        self.release(big_handle);

        match cause {
            TermCause::Host => self.platform.terminate_complete(big_handle, Status::Success),
            TermCause::Lost(reason) => self.platform.sync_lost(big_handle, reason.code()),
            TermCause::Reset | TermCause::None => {}
        }
    }

    fn release(&mut self, big_handle: u8) {
        Baseband::stop(&mut self.platform, big_handle);
        self.repo.free_big(big_handle);
        self.repo.busy_dec();
    }
}

/// BIG synchronization engine.
///
/// Host commands, timer expiries and BIG Info reports come in through `&self` methods and
/// are handled in the dispatch context ([`BigSync::dispatch`] / [`BigSync::run_once`]). The
/// radio driver calls [`BigSync::begin_op`], [`BigSync::rx_complete`] and [`BigSync::end_op`]
/// from its interrupt.
pub struct BigSync<P: Platform> {
    engine: CriticalSectionMutex<RefCell<Engine<P>>>,
    msgs: BigMsgChannel,
}

impl<P: Platform> BigSync<P> {
    pub fn new(cfg: BigSyncConfig, platform: P) -> Self {
        let cfg = cfg.clamped();
        Self {
            engine: CriticalSectionMutex::new(RefCell::new(Engine { cfg, repo: ContextRepo::new(&cfg), platform })),
            msgs: BigMsgChannel::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Engine<P>) -> R) -> R {
        self.engine.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn post(&self, big_handle: u8, event: BigEvent) {
        post(&self.msgs, big_handle, event);
    }

    pub fn create_sync(&self, params: &CreateSyncParams<'_>) -> Result<(), Status> {
        let seen = params.validate()?;
        let count = seen.count_ones() as usize;
        let big_handle = params.big_handle;

        self.with(|e| {
            if e.repo.big(big_handle).is_some() {
                return Err(Status::CmdDisallowed);
            }
            if !e.platform.is_synced(params.sync_handle) {
                return Err(Status::UnknownAdvId);
            }
            let report = e.platform.big_info(params.sync_handle).ok_or(Status::CmdDisallowed)?;

            if seen.checked_shr(report.info.num_bis as u32 + 1).unwrap_or(0) != 0 {
                return Err(Status::UnsupportedFeature);
            }
            if count > MAX_BIS_PER_BIG || count > e.repo.free_bis_count() {
                return Err(Status::MemCapExceeded);
            }
            if report.info.encrypted() != params.encrypt {
                return Err(Status::EncryptionModeNotAcceptable);
            }

            let bis = sorted_bis(seen)?;
            let big = e.repo.alloc_big(big_handle, params.sync_handle)?;
            big.mse = params.mse;
            big.sync_timeout = params.sync_timeout;
            big.req_bis = bis;
            big.encrypt = params.encrypt;
            big.broadcast_code = params.broadcast_code;

            info!(big_handle, sync_handle = params.sync_handle, bis = ?big.req_bis, "BIG create sync");
            e.handle(&self.msgs, big_handle, BigEvent::CreateSync);
            Ok(())
        })
    }

    /// Asynchronous: the outcome is reported through `terminate_complete` (or, while the
    /// BIG is still syncing, also a failed `sync_established`).
    pub fn terminate_sync(&self, big_handle: u8) -> Result<(), Status> {
        let state = self.with(|e| e.repo.big(big_handle).map(|b| b.state));

        match state {
            None => {
                self.with(|e| e.platform.terminate_complete(big_handle, Status::UnknownAdvId));
                Err(Status::UnknownAdvId)
            }
            Some(BigState::Shutdown | BigState::Reset) => Err(Status::CmdDisallowed),
            Some(_) => {
                self.post(big_handle, BigEvent::TerminateSync);
                Ok(())
            }
        }
    }

    /// BIG Info received on a periodic advertising train.
    pub fn on_big_info(&self, report: &BigInfoReport) {
        let waiting: Vec<u8, MAX_BIG> = self.with(|e| {
            e.repo
                .syncing_on(report.sync_handle)
                .map(|big| {
                    big.big_info = Some(*report);
                    big.handle
                })
                .collect()
        });

        for h in waiting {
            self.post(h, BigEvent::BigInfoReceived);
        }
    }

    /// Sync timeout timer expiry.
    pub fn on_sync_timeout(&self, big_handle: u8) {
        self.post(big_handle, BigEvent::SyncTimeout);
    }

    /// HCI reset: shuts down every BIG. Only a BIG still syncing is reported, as a failed `sync_established`.
    pub fn reset(&self) {
        for h in self.with(|e| e.repo.big_handles()) {
            self.post(h, BigEvent::Reset);
        }
    }

    pub fn reset_defaults(&self) -> Result<(), Status> {
        self.with(|e| e.repo.reset_defaults())
    }

    /// Handles every queued message.
    pub fn dispatch(&self) {
        while let Ok(msg) = self.msgs.try_receive() {
            self.handle_msg(msg);
        }
    }

    /// Waits for the next message and handles it.
    pub async fn run_once(&self) {
        let msg = self.msgs.receive().await;
        self.handle_msg(msg);
    }

    fn handle_msg(&self, msg: BigMsg) {
        self.with(|e| e.handle(&self.msgs, msg.big_handle, msg.event));
    }

    pub fn begin_op(&self, big_handle: u8) -> bool {
        self.with(|e| big_irq::begin_op(&mut e.repo, &mut e.platform, &e.cfg, big_handle))
    }

    pub fn rx_complete(&self, big_handle: u8, status: RxStatus, pdu: &[u8], rx_time_usec: u32) -> bool {
        self.with(|e| big_irq::rx_complete(&mut e.repo, &mut e.platform, &e.cfg, big_handle, status, pdu, rx_time_usec))
    }

    pub fn end_op(&self, big_handle: u8) {
        self.with(|e| big_irq::end_op(&mut e.repo, &mut e.platform, &e.cfg, &self.msgs, big_handle))
    }

    pub fn setup_data_path(&self, bis_handle: u16, path: DataPath) -> Result<(), Status> {
        if path == DataPath::Disabled {
            return Err(Status::InvalidParams);
        }

        self.with(|e| {
            let bis = e.repo.bis_by_handle(bis_handle).ok_or(Status::UnknownConnId)?;
            if bis.data_path != DataPath::Disabled || bis.test.enabled {
                return Err(Status::CmdDisallowed);
            }
            bis.data_path = path;
            debug!(bis_handle, ?path, "data path set up");
            Ok(())
        })
    }

    pub fn remove_data_path(&self, bis_handle: u16) -> Result<(), Status> {
        self.with(|e| {
            let bis = e.repo.bis_by_handle(bis_handle).ok_or(Status::UnknownConnId)?;
            bis.data_path = DataPath::Disabled;
            bis.sdu_queue.clear();
            Ok(())
        })
    }

    pub fn iso_test_rx_enable(&self, bis_handle: u16) -> Result<(), Status> {
        self.with(|e| {
            let bis = e.repo.bis_by_handle(bis_handle).ok_or(Status::UnknownConnId)?;
            if bis.data_path != DataPath::Disabled || bis.test.enabled {
                return Err(Status::CmdDisallowed);
            }
            bis.test = IsoTestState { enabled: true, ..Default::default() };
            Ok(())
        })
    }

    pub fn iso_read_test_counters(&self, bis_handle: u16) -> Result<IsoTestStats, Status> {
        self.with(|e| {
            let bis = e.repo.bis_by_handle(bis_handle).ok_or(Status::UnknownConnId)?;
            if !bis.test.enabled {
                return Err(Status::CmdDisallowed);
            }
            Ok(bis.test.stats)
        })
    }

    /// Leaves test mode, returning the final counters.
    pub fn iso_test_end(&self, bis_handle: u16) -> Result<IsoTestStats, Status> {
        self.with(|e| {
            let bis = e.repo.bis_by_handle(bis_handle).ok_or(Status::UnknownConnId)?;
            if !bis.test.enabled {
                return Err(Status::CmdDisallowed);
            }
            let stats = bis.test.stats;
            bis.test = IsoTestState::default();
            Ok(stats)
        })
    }

    /// Next SDU queued for the host on `bis_handle`.
    pub fn read_sdu(&self, bis_handle: u16) -> Option<Sdu> {
        self.with(|e| e.repo.bis_by_handle(bis_handle)?.sdu_queue.pop_front())
    }

    /// Disabled for handles without a context.
    pub fn big_state(&self, big_handle: u8) -> BigState {
        self.with(|e| e.repo.big(big_handle).map(|b| b.state).unwrap_or_default())
    }

    pub fn bis_handles(&self, big_handle: u8) -> Vec<u16, MAX_BIS_PER_BIG> {
        self.with(|e| e.repo.bis_handles(big_handle))
    }

    pub fn event_counter(&self, big_handle: u8) -> Option<u64> {
        self.with(|e| e.repo.big(big_handle).map(|b| b.event_counter))
    }

    /// Receive window widening for the next event, without the one-time initial margin.
    pub fn window_widening_usec(&self, big_handle: u8) -> Option<u32> {
        self.with(|e| {
            let sca = e.cfg.local_sca_ppm;
            e.repo
                .big(big_handle)
                .map(|b| window_widening_usec(b.peer_sca_ppm + sca, b.unsynced_usec))
        })
    }

    pub fn with_platform<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        self.with(|e| f(&mut e.platform))
    }
}
