use bitflags::bitflags;
use heapless::{Deque, Vec};

use crate::config::{
    BigSyncConfig, BIS_RX_QUEUE_LEN, HOST_SDU_QUEUE_LEN, MAX_BIG, MAX_BIS, MAX_BIS_PER_BIG,
    MAX_BURST, PDU_BUF_LEN, PDU_POOL_SIZE, PRE_TX_QUEUE_LEN,
};
use crate::sdk::ble_app::big_sdu::{Sdu, UnframedState};
use crate::sdk::ble_app::big_sm::BigState;
use crate::sdk::ble_app::ble_ll_channel_selection::{BisChanState, ChanTable};
use crate::sdk::ble_app::ble_ll_status::Status;
use crate::sdk::ble_app::iso_assembler::IsoAssembler;
use crate::sdk::ble_app::rf_drv::BigInfoReport;
use crate::sdk::mcu::crypto::BisEncCtx;
use crate::sdk::packet_types::{Framing, Phy};
use crate::BIT;

/// Index of a BIS context in the repository arena.
pub type BisId = usize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Packing {
    #[default]
    Sequential,
    Interleaved,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataPath {
    #[default]
    Disabled,
    Host,
    Vendor,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoTestStats {
    pub received: u32,
    pub missed: u32,
    pub failed: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoTestState {
    pub enabled: bool,
    pub stats: IsoTestStats,
    /// Next framed test SDU counter, seeded from the first SDU seen.
    pub expected_counter: Option<u32>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CtrlOpMask: u8 {
        const CHAN_MAP = BIT!(0);
        const TERMINATE = BIT!(1);
    }
}

/// Control procedures waiting for their instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingCtrl {
    pub ops: CtrlOpMask,
    pub chan_map: u64,
    pub chan_map_instant: u16,
    pub term_reason: u8,
    pub term_instant: u16,
}

/// Why a BIG is going away; decides what the host hears at cleanup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TermCause {
    #[default]
    None,
    Host,
    Reset,
    Lost(Status),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorStage {
    #[default]
    Data,
    Ctrl,
    Done,
}

/// Position within the subevent grid of one BIG event.
///
/// Per BIS the grid holds `NSE / BN` groups of `BN` bursts. Groups below IRC are
/// repetitions of this event's payloads (`rep_idx`); the rest are pre-transmissions
/// (`rep_idx == IRC`, `pre_transmit_idx` counting from zero).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubeventCursor {
    pub bis_evt_idx: u8,
    pub burst_idx: u8,
    pub rep_idx: u8,
    pub pre_transmit_idx: u8,
    pub stage: CursorStage,
    pub reacquire: bool,
}

impl SubeventCursor {
    pub fn group(&self) -> u8 {
        self.rep_idx + self.pre_transmit_idx
    }

    /// Subevent number within the BIS event.
    pub fn se(&self, bn: u8) -> u8 {
        self.group() * bn + self.burst_idx
    }

    pub fn is_pre_transmit(&self, irc: u8) -> bool {
        self.rep_idx >= irc
    }

    pub fn set_group(&mut self, group: u8, irc: u8) {
        if group < irc {
            self.rep_idx = group;
            self.pre_transmit_idx = 0;
        } else {
            self.rep_idx = irc;
            self.pre_transmit_idx = group - irc;
        }
    }
}

/// Handle to a buffer in the [`PduPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PduRef(u8);

#[derive(Clone, Copy, Debug)]
struct PduBuf {
    len: usize,
    data: [u8; PDU_BUF_LEN],
}

/// Fixed pool of BIS PDU buffers shared by every BIG.
#[derive(Debug)]
pub struct PduPool {
    bufs: [PduBuf; PDU_POOL_SIZE],
    free: Vec<u8, PDU_POOL_SIZE>,
}

impl PduPool {
    pub fn new() -> Self {
        let mut free = Vec::new();
        for i in (0..PDU_POOL_SIZE).rev() {
            let _ = free.push(i as u8);
        }

        Self { bufs: [PduBuf { len: 0, data: [0; PDU_BUF_LEN] }; PDU_POOL_SIZE], free }
    }

    /// Copies `pdu` into a free buffer. `None` when the pool is exhausted or `pdu` is too long.
    pub fn alloc(&mut self, pdu: &[u8]) -> Option<PduRef> {
        if pdu.len() > PDU_BUF_LEN {
            return None;
        }

        let idx = self.free.pop()?;
        let buf = &mut self.bufs[idx as usize];
        buf.data[..pdu.len()].copy_from_slice(pdu);
        buf.len = pdu.len();

        Some(PduRef(idx))
    }

    pub fn free(&mut self, r: PduRef) {
        if !self.free.contains(&r.0) {
            let _ = self.free.push(r.0);
        }
    }

    pub fn get(&self, r: PduRef) -> &[u8] {
        let buf = &self.bufs[r.0 as usize];
        &buf.data[..buf.len]
    }

    pub fn get_mut(&mut self, r: PduRef) -> &mut [u8] {
        let buf = &mut self.bufs[r.0 as usize];
        &mut buf.data[..buf.len]
    }

    pub fn truncate(&mut self, r: PduRef, len: usize) {
        let buf = &mut self.bufs[r.0 as usize];
        buf.len = buf.len.min(len);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for PduPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload received in a pre-transmission subevent, held for the event it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FuturePdu {
    pub event_counter: u64,
    pub bis_evt_idx: u8,
    pub burst: u8,
    pub pdu: PduRef,
}

/// One drained (BIS, burst) position of a finished BIG event; `pdu` is `None` when nothing
/// was received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxPdu {
    pub pdu: Option<PduRef>,
    pub burst: u8,
    pub event_counter: u64,
}

/// Access parameters of the BIG control subevent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtrlChan {
    pub access_addr: u32,
    pub crc_init: u32,
    pub chan: BisChanState,
    pub enc: BisEncCtx,
}

#[derive(Debug, Default)]
pub struct BigCtx {
    pub handle: u8,
    pub sync_handle: u16,
    pub state: BigState,

    // Host request
    pub mse: u8,
    pub sync_timeout: u16,
    pub req_bis: Vec<u8, MAX_BIS_PER_BIG>,
    pub encrypt: bool,
    pub broadcast_code: [u8; 16],
    pub big_info: Option<BigInfoReport>,

    // From BIG Info
    pub num_bis: u8,
    pub bn: u8,
    pub nse: u8,
    pub irc: u8,
    pub pto: u8,
    pub framing: Framing,
    pub packing: Packing,
    pub phy: Phy,
    pub iso_inter_usec: u32,
    pub sub_inter_usec: u32,
    pub bis_space_usec: u32,
    pub sdu_inter_usec: u32,
    pub max_pdu: u8,
    pub max_sdu: u16,
    pub seed_access_addr: u32,
    pub base_crc_init: u16,
    pub gsk: [u8; 16],
    pub giv: [u8; 8],
    pub ctrl: CtrlChan,
    pub chan_table: ChanTable,

    // Timing
    pub anchor_usec: u32,
    pub rx_sync_time_usec: u32,
    pub event_counter: u64,
    pub peer_sca_ppm: u32,
    pub unsynced_usec: u32,
    pub widening_usec: u32,
    /// One-time margin for the first reception, zero once synchronized.
    pub initial_margin_usec: u32,
    pub op_scheduled: bool,

    // Control procedures
    pub pending_ctrl: PendingCtrl,
    pub last_cssn: Option<u8>,
    pub ctrl_wanted: bool,
    pub ctrl_cssn: u8,
    pub ctrl_pdu: Option<PduRef>,

    pub bis: Vec<Option<BisId>, MAX_BIS_PER_BIG>,

    // Per event, owned by the radio interrupt
    pub cursor: SubeventCursor,
    pub event_ok: bool,
    pub rx_attempts: [u8; MAX_BIS_PER_BIG],
    pub pending: [[Option<PduRef>; MAX_BURST]; MAX_BIS_PER_BIG],
    pub future: Vec<FuturePdu, PRE_TX_QUEUE_LEN>,

    pub term_cause: TermCause,
}

impl BigCtx {
    pub fn new(handle: u8, sync_handle: u16) -> Self {
        Self { handle, sync_handle, ..Default::default() }
    }

    /// Pre-transmission groups per BIS event.
    pub fn num_pre_tx_groups(&self) -> u8 {
        if self.bn == 0 {
            return 0;
        }
        (self.nse / self.bn).saturating_sub(self.irc)
    }

    pub fn num_groups(&self) -> u8 {
        self.irc + self.num_pre_tx_groups()
    }

    /// Payload (packet) counter of `burst` in the event `event_counter`.
    pub fn payload_counter(&self, event_counter: u64, burst: u8) -> u64 {
        event_counter * self.bn as u64 + burst as u64
    }
}

#[derive(Debug, Default)]
pub struct BisCtx {
    pub handle: u16,
    pub big_handle: u8,
    pub bis_num: u8,
    pub access_addr: u32,
    pub crc_init: u32,
    pub chan: BisChanState,
    /// Subevent the channel state currently points at.
    pub hop_se: u8,
    pub enc: BisEncCtx,
    pub unframed: UnframedState,
    pub rx_queue: Deque<RxPdu, BIS_RX_QUEUE_LEN>,
    pub sdu_queue: Deque<Sdu, HOST_SDU_QUEUE_LEN>,
    pub data_path: DataPath,
    pub test: IsoTestState,
}

impl BisCtx {
    /// Whether received PDUs of this BIS go anywhere.
    pub fn enabled(&self) -> bool {
        self.data_path != DataPath::Disabled || self.test.enabled
    }

    /// Channel of subevent `se`, hopping forward from the current subevent.
    pub fn chan_at(&mut self, table: &ChanTable, se: u8) -> u8 {
        while self.hop_se < se {
            self.chan.next_subevent(table);
            self.hop_se += 1;
        }
        self.chan.chan
    }
}

/// Split borrow of one BIG and the shared tables its interrupt handlers touch.
pub struct RepoParts<'a> {
    pub big: &'a mut BigCtx,
    pub bis: &'a mut [Option<BisCtx>; MAX_BIS],
    pub pool: &'a mut PduPool,
    pub framed: &'a mut IsoAssembler,
}

/// Fixed capacity arenas of BIG and BIS contexts.
#[derive(Debug)]
pub struct ContextRepo {
    bigs: [Option<BigCtx>; MAX_BIG],
    bis: [Option<BisCtx>; MAX_BIS],
    pool: PduPool,
    framed: IsoAssembler,
    num_big: usize,
    num_bis: usize,
    bis_handle_base: u16,
    busy: u8,
}

impl ContextRepo {
    pub fn new(cfg: &BigSyncConfig) -> Self {
        let cfg = cfg.clamped();
        Self {
            bigs: core::array::from_fn(|_| None),
            bis: core::array::from_fn(|_| None),
            pool: PduPool::new(),
            framed: IsoAssembler::default(),
            num_big: cfg.num_big,
            num_bis: cfg.num_bis,
            bis_handle_base: cfg.bis_handle_base,
            busy: 0,
        }
    }

    fn big_slot(&self, handle: u8) -> Option<usize> {
        self.bigs.iter().position(|b| matches!(b, Some(big) if big.handle == handle))
    }

    pub fn big(&self, handle: u8) -> Option<&BigCtx> {
        self.big_slot(handle).and_then(|i| self.bigs[i].as_ref())
    }

    pub fn big_mut(&mut self, handle: u8) -> Option<&mut BigCtx> {
        let i = self.big_slot(handle)?;
        self.bigs[i].as_mut()
    }

    /// BIGs still waiting for BIG Info from the given periodic train.
    pub fn syncing_on(&mut self, sync_handle: u16) -> impl Iterator<Item = &mut BigCtx> {
        self.bigs
            .iter_mut()
            .flatten()
            .filter(move |b| b.sync_handle == sync_handle && b.state == BigState::Syncing)
    }

    pub fn big_handles(&self) -> Vec<u8, MAX_BIG> {
        self.bigs.iter().flatten().map(|b| b.handle).collect()
    }

    pub fn parts(&mut self, handle: u8) -> Option<RepoParts<'_>> {
        let i = self.big_slot(handle)?;
        let big = self.bigs[i].as_mut()?;
        Some(RepoParts { big, bis: &mut self.bis, pool: &mut self.pool, framed: &mut self.framed })
    }

    pub fn alloc_big(&mut self, handle: u8, sync_handle: u16) -> Result<&mut BigCtx, Status> {
        if self.big_slot(handle).is_some() {
            return Err(Status::CmdDisallowed);
        }

        let slot = self.bigs[..self.num_big]
            .iter()
            .position(|b| b.is_none())
            .ok_or(Status::ConnLimitExceeded)?;

        Ok(self.bigs[slot].insert(BigCtx::new(handle, sync_handle)))
    }

    /// Frees the BIG, its BIS contexts and every pool buffer they hold.
    pub fn free_big(&mut self, handle: u8) {
        let Some(i) = self.big_slot(handle) else {
            return;
        };
        let Some(mut big) = self.bigs[i].take() else {
            return;
        };

        for r in big.pending.iter_mut().flatten().filter_map(|p| p.take()) {
            self.pool.free(r);
        }
        for f in big.future.iter() {
            self.pool.free(f.pdu);
        }
        if let Some(r) = big.ctrl_pdu.take() {
            self.pool.free(r);
        }

        for id in big.bis.iter().flatten() {
            self.free_bis(*id);
        }
    }

    pub fn free_bis_count(&self) -> usize {
        self.bis[..self.num_bis].iter().filter(|b| b.is_none()).count()
    }

    pub fn alloc_bis(&mut self, big_handle: u8, bis_num: u8) -> Option<BisId> {
        let id = self.bis[..self.num_bis].iter().position(|b| b.is_none())?;
        self.bis[id] = Some(BisCtx {
            handle: self.bis_handle_base + id as u16,
            big_handle,
            bis_num,
            ..Default::default()
        });
        Some(id)
    }

    fn free_bis(&mut self, id: BisId) {
        let Some(mut bis) = self.bis[id].take() else {
            return;
        };

        while let Some(rx) = bis.rx_queue.pop_front() {
            if let Some(r) = rx.pdu {
                self.pool.free(r);
            }
        }
        for r in bis.unframed.frags.iter() {
            self.pool.free(*r);
        }
        self.framed.remove(bis.handle);
    }

    pub fn bis(&self, id: BisId) -> Option<&BisCtx> {
        self.bis.get(id).and_then(|b| b.as_ref())
    }

    pub fn bis_mut(&mut self, id: BisId) -> Option<&mut BisCtx> {
        self.bis.get_mut(id).and_then(|b| b.as_mut())
    }

    pub fn bis_by_handle(&mut self, handle: u16) -> Option<&mut BisCtx> {
        self.bis.iter_mut().flatten().find(|b| b.handle == handle)
    }

    pub fn bis_handles(&self, big_handle: u8) -> Vec<u16, MAX_BIS_PER_BIG> {
        let mut out = Vec::new();
        if let Some(big) = self.big(big_handle) {
            for id in big.bis.iter().flatten() {
                if let Some(bis) = self.bis(*id) {
                    let _ = out.push(bis.handle);
                }
            }
        }
        out
    }

    pub fn pool(&self) -> &PduPool {
        &self.pool
    }

    pub fn busy_inc(&mut self) {
        self.busy = self.busy.saturating_add(1);
    }

    pub fn busy_dec(&mut self) {
        self.busy = self.busy.saturating_sub(1);
    }

    pub fn is_busy(&self) -> bool {
        self.busy != 0
    }

    /// Drops every context. Refused while any BIG sync holds the controller busy.
    pub fn reset_defaults(&mut self) -> Result<(), Status> {
        if self.is_busy() {
            return Err(Status::CmdDisallowed);
        }

        self.bigs = core::array::from_fn(|_| None);
        self.bis = core::array::from_fn(|_| None);
        self.pool = PduPool::new();
        self.framed = IsoAssembler::default();

        Ok(())
    }
}
