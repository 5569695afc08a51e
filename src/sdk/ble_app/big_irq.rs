use tracing::{debug, error, info, trace, warn};

use crate::config::{sync_timeout_duration, BigSyncConfig, MAX_BIS, MAX_BIS_PER_BIG, MAX_SCHEDULE_ATTEMPTS};
use crate::sdk::ble_app::big_builder::{ctrl_offset_usec, event_duration_usec, skip_event, subevent_offset_usec, update_widening};
use crate::sdk::ble_app::big_sdu::deliver_event;
use crate::sdk::ble_app::big_sm::{post, BigEvent, BigMsgChannel, BigState};
use crate::sdk::ble_app::ble_ll_channel_selection::ChanTable;
use crate::sdk::ble_app::rf_drv::{Baseband, Platform, RxSetup, RxStatus, Scheduler, SyncTimer};
use crate::sdk::mcu::crypto::AesBlock;
use crate::sdk::packet_types::{BigCtrlPdu, BisPduHeader, Llid, BIS_PDU_HDR_LEN};
use crate::state::{
    BigCtx, BisCtx, ContextRepo, CtrlOpMask, CursorStage, FuturePdu, Packing, PduPool, RepoParts, RxPdu, SubeventCursor,
};

/// Whether a 16 bit instant is still ahead of (or at) `counter`, modulo 2^16.
pub fn instant_pending(instant: u16, counter: u16) -> bool {
    instant.wrapping_sub(counter) < 0x8000
}

fn bis_of<'a>(big: &BigCtx, bis_tbl: &'a [Option<BisCtx>; MAX_BIS], bis_evt_idx: u8) -> Option<&'a BisCtx> {
    let id = big.bis.get(bis_evt_idx as usize).copied().flatten()?;
    bis_tbl[id].as_ref()
}

// Grid order when each BIS owns a contiguous run: BIS, then group, then burst.
fn step_sequential(cur: &mut SubeventCursor, n_bis: u8, bn: u8, irc: u8, groups: u8) -> bool {
    if cur.burst_idx + 1 < bn {
        cur.burst_idx += 1;
        return true;
    }
    cur.burst_idx = 0;

    if cur.group() + 1 < groups {
        cur.set_group(cur.group() + 1, irc);
        return true;
    }
    cur.set_group(0, irc);

    cur.bis_evt_idx += 1;
    cur.bis_evt_idx < n_bis
}

// Interleaved: subevent number outermost, BIS innermost.
fn step_interleaved(cur: &mut SubeventCursor, n_bis: u8, bn: u8, irc: u8, groups: u8) -> bool {
    if cur.bis_evt_idx + 1 < n_bis {
        cur.bis_evt_idx += 1;
        return true;
    }
    cur.bis_evt_idx = 0;

    if cur.burst_idx + 1 < bn {
        cur.burst_idx += 1;
        return true;
    }
    cur.burst_idx = 0;

    if cur.group() + 1 < groups {
        cur.set_group(cur.group() + 1, irc);
        return true;
    }
    false
}

fn pre_tx_target(big: &BigCtx, cur: &SubeventCursor) -> u64 {
    big.event_counter + big.pto as u64 * (cur.pre_transmit_idx as u64 + 1)
}

fn slot_needed(big: &BigCtx, cfg: &BigSyncConfig, cur: &SubeventCursor) -> bool {
    let idx = cur.bis_evt_idx as usize;
    if big.bis.get(idx).copied().flatten().is_none() {
        return false;
    }
    if big.mse != 0 && big.rx_attempts[idx] >= big.mse {
        return false;
    }
    if cfg.always_rx_duplicates {
        return true;
    }

    if cur.is_pre_transmit(big.irc) {
        let target = pre_tx_target(big, cur);
        !big
            .future
            .iter()
            .any(|f| f.event_counter == target && f.bis_evt_idx == cur.bis_evt_idx && f.burst == cur.burst_idx)
    } else {
        big.pending[idx][cur.burst_idx as usize].is_none()
    }
}

fn enter_ctrl_or_done(big: &mut BigCtx) -> bool {
    if big.ctrl_wanted && big.ctrl_pdu.is_none() {
        big.cursor.stage = CursorStage::Ctrl;
        true
    } else {
        big.cursor.stage = CursorStage::Done;
        false
    }
}

/// Moves the cursor to the next subevent worth receiving. `false` ends the event.
fn advance(big: &mut BigCtx, cfg: &BigSyncConfig) -> bool {
    if big.cursor.stage != CursorStage::Data {
        big.cursor.stage = CursorStage::Done;
        return false;
    }

    let (n_bis, bn, irc, groups) = (big.bis.len() as u8, big.bn, big.irc, big.num_groups());
    loop {
        let more = match big.packing {
            Packing::Sequential => step_sequential(&mut big.cursor, n_bis, bn, irc, groups),
            Packing::Interleaved => step_interleaved(&mut big.cursor, n_bis, bn, irc, groups),
        };
        if !more {
            break;
        }
        if slot_needed(big, cfg, &big.cursor) {
            return true;
        }
        // skipped a slot, the next one needs a fresh window
        big.cursor.reacquire = true;
    }

    enter_ctrl_or_done(big)
}

fn first_slot(big: &mut BigCtx, cfg: &BigSyncConfig) -> bool {
    big.cursor = SubeventCursor { reacquire: true, ..Default::default() };
    if big.bis.is_empty() || big.bn == 0 {
        return enter_ctrl_or_done(big);
    }
    slot_needed(big, cfg, &big.cursor) || advance(big, cfg)
}

fn slot_offset(big: &BigCtx, bis_tbl: &[Option<BisCtx>; MAX_BIS]) -> u32 {
    match big.cursor.stage {
        CursorStage::Ctrl => ctrl_offset_usec(big),
        _ => {
            let bis_num = bis_of(big, bis_tbl, big.cursor.bis_evt_idx).map(|b| b.bis_num).unwrap_or(1);
            subevent_offset_usec(big, bis_num, big.cursor.se(big.bn))
        }
    }
}

fn arm_current<B: Baseband + ?Sized>(big: &mut BigCtx, bis_tbl: &mut [Option<BisCtx>; MAX_BIS], bb: &mut B) {
    let offset = slot_offset(big, bis_tbl);
    let (chan, access_addr, crc_init) = match big.cursor.stage {
        CursorStage::Ctrl => (big.ctrl.chan.chan, big.ctrl.access_addr, big.ctrl.crc_init),
        _ => {
            let id = big.bis.get(big.cursor.bis_evt_idx as usize).copied().flatten();
            let Some(bis) = id.and_then(|id| bis_tbl[id].as_mut()) else {
                return;
            };
            (bis.chan_at(&big.chan_table, big.cursor.se(big.bn)), bis.access_addr, bis.crc_init)
        }
    };

    let setup = RxSetup {
        chan,
        access_addr,
        crc_init,
        due_usec: big.anchor_usec.wrapping_add(offset),
        window_usec: big.widening_usec,
        reacquire: big.cursor.reacquire,
    };
    big.cursor.reacquire = false;

    trace!(
        big_handle = big.handle,
        stage = ?big.cursor.stage,
        bis_evt_idx = big.cursor.bis_evt_idx,
        se = big.cursor.se(big.bn),
        chan,
        due = setup.due_usec,
        "arm rx"
    );
    bb.arm_rx(&setup);
}

/// Moves payloads pre-transmitted in earlier events into this event's slots.
fn claim_pre_transmitted(big: &mut BigCtx, pool: &mut PduPool) {
    let counter = big.event_counter;
    let mut i = 0;
    while i < big.future.len() {
        let f = big.future[i];
        if f.event_counter > counter {
            i += 1;
            continue;
        }

        big.future.swap_remove(i);
        let slot = &mut big.pending[f.bis_evt_idx as usize][f.burst as usize];
        if f.event_counter == counter && slot.is_none() {
            *slot = Some(f.pdu);
        } else {
            pool.free(f.pdu);
        }
    }
}

/// Radio start of a BIG event. Returns `true` if a reception was armed.
pub fn begin_op<B: Baseband + ?Sized>(repo: &mut ContextRepo, bb: &mut B, cfg: &BigSyncConfig, big_handle: u8) -> bool {
    let Some(RepoParts { big, bis, pool, .. }) = repo.parts(big_handle) else {
        return false;
    };

    if big.state != BigState::Synced {
        debug!(big_handle, state = ?big.state, "BIG event started while shutting down");
        bb.set_terminate();
        return false;
    }

    big.event_ok = false;
    big.ctrl_wanted = false;
    big.rx_attempts = [0; MAX_BIS_PER_BIG];

    let counter = big.event_counter as u16;
    for id in big.bis.iter().flatten() {
        if let Some(b) = bis[*id].as_mut() {
            b.chan.event_start(&big.chan_table, counter);
            b.hop_se = 0;
        }
    }
    big.ctrl.chan.event_start(&big.chan_table, counter);

    claim_pre_transmitted(big, pool);

    trace!(big_handle, event_counter = big.event_counter, anchor = big.anchor_usec, "BIG event");

    if first_slot(big, cfg) {
        arm_current(big, bis, bb);
        true
    } else {
        bb.set_terminate();
        false
    }
}

fn resync<T: SyncTimer + ?Sized>(big: &mut BigCtx, offset: u32, rx_time_usec: u32, timer: &mut T) {
    if !big.event_ok {
        big.anchor_usec = rx_time_usec.wrapping_sub(offset);
        big.rx_sync_time_usec = rx_time_usec;
        big.unsynced_usec = 0;
        big.initial_margin_usec = 0;
        big.widening_usec = 0;
        big.event_ok = true;
    }
    timer.start(big.handle, sync_timeout_duration(big.sync_timeout));
}

fn store_pdu(big: &mut BigCtx, pool: &mut PduPool, pdu: &[u8]) {
    let hdr = match BisPduHeader::parse(pdu) {
        Ok(h) => h,
        Err(e) => {
            debug!(big_handle = big.handle, error = %e, "bad BIS PDU header");
            return;
        }
    };
    let len = BIS_PDU_HDR_LEN + hdr.len as usize;
    let Some(pdu) = pdu.get(..len) else {
        debug!(big_handle = big.handle, len, "BIS PDU truncated");
        return;
    };

    let cur = big.cursor;
    match cur.stage {
        CursorStage::Ctrl => {
            if hdr.llid != Llid::BigCtrl {
                debug!(big_handle = big.handle, llid = ?hdr.llid, "non control PDU in control subevent");
                return;
            }
            big.ctrl_wanted = false;
            big.ctrl_pdu = pool.alloc(pdu);
        }
        CursorStage::Data => {
            if hdr.llid == Llid::BigCtrl {
                debug!(big_handle = big.handle, "control PDU in data subevent");
                return;
            }
            if hdr.cstf && big.last_cssn != Some(hdr.cssn) {
                big.ctrl_wanted = true;
                big.ctrl_cssn = hdr.cssn;
            }

            if cur.is_pre_transmit(big.irc) {
                let event_counter = pre_tx_target(big, &cur);
                let dup = big.future.iter().any(|f| {
                    f.event_counter == event_counter && f.bis_evt_idx == cur.bis_evt_idx && f.burst == cur.burst_idx
                });
                if dup {
                    return;
                }

                let Some(r) = pool.alloc(pdu) else {
                    warn!(big_handle = big.handle, "PDU pool exhausted");
                    return;
                };
                let entry = FuturePdu { event_counter, bis_evt_idx: cur.bis_evt_idx, burst: cur.burst_idx, pdu: r };
                if big.future.push(entry).is_err() {
                    pool.free(r);
                }
            } else {
                let slot = &mut big.pending[cur.bis_evt_idx as usize][cur.burst_idx as usize];
                if slot.is_none() {
                    *slot = pool.alloc(pdu);
                    if slot.is_none() {
                        warn!(big_handle = big.handle, "PDU pool exhausted");
                    }
                }
            }
        }
        CursorStage::Done => {}
    }
}

/// Result of one subevent. Returns `true` if another reception was armed; on `false` the
/// driver closes the operation and calls [`end_op`].
#[allow(clippy::too_many_arguments)]
pub fn rx_complete<P: Baseband + SyncTimer + ?Sized>(
    repo: &mut ContextRepo,
    p: &mut P,
    cfg: &BigSyncConfig,
    big_handle: u8,
    status: RxStatus,
    pdu: &[u8],
    rx_time_usec: u32,
) -> bool {
    let Some(RepoParts { big, bis, pool, .. }) = repo.parts(big_handle) else {
        return false;
    };

    let cur = big.cursor;
    if cur.stage == CursorStage::Done {
        return false;
    }
    if cur.stage == CursorStage::Data {
        let i = cur.bis_evt_idx as usize;
        big.rx_attempts[i] = big.rx_attempts[i].saturating_add(1);
    }

    match status {
        RxStatus::Success => {
            let offset = slot_offset(big, bis);
            resync(big, offset, rx_time_usec, p);
            store_pdu(big, pool, pdu);
        }
        RxStatus::CrcFailed => {
            debug!(big_handle, stage = ?cur.stage, se = cur.se(big.bn), "CRC error");
        }
        RxStatus::Timeout => {
            debug!(big_handle, stage = ?cur.stage, se = cur.se(big.bn), "rx timeout");
            big.cursor.reacquire = true;
        }
        RxStatus::Failed | RxStatus::Canceled => {
            warn!(big_handle, ?status, "BIG event aborted");
            big.cursor.stage = CursorStage::Done;
            return false;
        }
    }

    if advance(big, cfg) {
        arm_current(big, bis, p);
        true
    } else {
        false
    }
}

/// Decrypts and applies the received control PDU. `false` on MIC failure.
fn process_ctrl<A: AesBlock + ?Sized>(big: &mut BigCtx, pool: &mut PduPool, aes: &A) -> bool {
    let Some(r) = big.ctrl_pdu.take() else {
        return true;
    };

    let counter = big.event_counter;
    let pkt_ctr = big.payload_counter(counter, 0);
    let buf = pool.get_mut(r);
    let hdr0 = buf[0];
    let plain_len = big.ctrl.enc.decrypt_pdu(aes, pkt_ctr, hdr0, &mut buf[BIS_PDU_HDR_LEN..]);
    let Some(len) = plain_len else {
        pool.free(r);
        return false;
    };

    big.last_cssn = Some(big.ctrl_cssn);
    let next = counter.wrapping_add(1) as u16;
    let pending = &mut big.pending_ctrl;

    match BigCtrlPdu::parse(&pool.get(r)[BIS_PDU_HDR_LEN..BIS_PDU_HDR_LEN + len]) {
        Ok(BigCtrlPdu::ChannelMapInd { chan_map, instant }) => {
            if instant_pending(instant, next) {
                info!(big_handle = big.handle, chan_map, instant, "channel map update");
                pending.ops |= CtrlOpMask::CHAN_MAP;
                pending.chan_map = chan_map;
                pending.chan_map_instant = instant;
            } else {
                warn!(big_handle = big.handle, instant, event_counter = counter, "channel map instant passed, ignored");
            }
        }
        Ok(BigCtrlPdu::TerminateInd { reason, instant }) => {
            info!(big_handle = big.handle, reason, instant, "BIG terminate indication");
            pending.ops |= CtrlOpMask::TERMINATE;
            pending.term_reason = reason;
            pending.term_instant = instant;
        }
        Err(e) => warn!(big_handle = big.handle, error = %e, "BIG control PDU ignored"),
    }

    pool.free(r);
    true
}

enum Next {
    Scheduled,
    Terminate,
    Exhausted,
}

fn reschedule<S: Scheduler + ?Sized>(big: &mut BigCtx, sched: &mut S, cfg: &BigSyncConfig) -> Next {
    for _ in 0..MAX_SCHEDULE_ATTEMPTS {
        skip_event(big);
        let next = big.event_counter as u16;
        let pending = &mut big.pending_ctrl;

        if pending.ops.contains(CtrlOpMask::CHAN_MAP) && pending.chan_map_instant == next {
            pending.ops.remove(CtrlOpMask::CHAN_MAP);
            big.chan_table = ChanTable::new(pending.chan_map);
            info!(big_handle = big.handle, event_counter = big.event_counter, used = big.chan_table.num_used(), "channel map applied");
        }

        let pending = &big.pending_ctrl;
        if pending.ops.contains(CtrlOpMask::TERMINATE)
            && (pending.term_instant == next || !instant_pending(pending.term_instant, next))
        {
            return Next::Terminate;
        }

        update_widening(big, cfg.local_sca_ppm);
        let due = big.anchor_usec.wrapping_sub(big.widening_usec);
        if sched.insert(big.handle, due, event_duration_usec(big)) {
            return Next::Scheduled;
        }
        debug!(big_handle = big.handle, event_counter = big.event_counter, "scheduler conflict, skipping event");
    }

    Next::Exhausted
}

/// Hands every (BIS, burst) position of the finished event to its BIS receive queue.
fn drain_pending(big: &mut BigCtx, bis_tbl: &mut [Option<BisCtx>; MAX_BIS], pool: &mut PduPool) {
    let event_counter = big.event_counter;

    for (idx, slot) in big.bis.iter().enumerate() {
        for burst in 0..big.bn {
            let pdu = big.pending[idx][burst as usize].take();
            let target = slot.and_then(|id| bis_tbl[id].as_mut()).filter(|b| b.enabled());

            match target {
                Some(bis) => {
                    if let Err(rx) = bis.rx_queue.push_back(RxPdu { pdu, burst, event_counter }) {
                        warn!(bis_handle = bis.handle, "BIS receive queue full");
                        if let Some(r) = rx.pdu {
                            pool.free(r);
                        }
                    }
                }
                None => {
                    if let Some(r) = pdu {
                        pool.free(r);
                    }
                }
            }
        }
    }
}

/// Radio end of a BIG event: control procedures, next event and SDU delivery.
pub fn end_op<P: Platform + ?Sized>(
    repo: &mut ContextRepo,
    p: &mut P,
    cfg: &BigSyncConfig,
    msgs: &BigMsgChannel,
    big_handle: u8,
) {
    let Some(RepoParts { big, bis, pool, framed }) = repo.parts(big_handle) else {
        return;
    };
    let completed = big.event_counter;

    drain_pending(big, bis, pool);

    if matches!(big.state, BigState::Shutdown | BigState::Reset) {
        if let Some(r) = big.ctrl_pdu.take() {
            pool.free(r);
        }
        big.op_scheduled = false;
        debug!(big_handle, "last BIG event done");
        post(msgs, big_handle, BigEvent::TerminatedSync);
        return;
    }

    if !process_ctrl(big, pool, &*p) {
        error!(big_handle, event_counter = completed, "BIG control PDU MIC failure");
        big.op_scheduled = false;
        post(msgs, big_handle, BigEvent::MicFailed);
        return;
    }

    match reschedule(big, p, cfg) {
        Next::Scheduled => {}
        Next::Terminate => {
            info!(big_handle, reason = big.pending_ctrl.term_reason, "BIG terminated by broadcaster");
            big.op_scheduled = false;
            post(msgs, big_handle, BigEvent::PduTerminate);
        }
        Next::Exhausted => {
            warn!(big_handle, "no room for the next BIG event");
            big.op_scheduled = false;
        }
    }

    deliver_event(big, bis, pool, framed, p, cfg, msgs);

    if cfg.notify_iso_event_complete {
        p.iso_event_complete(big_handle, completed);
    }
}
