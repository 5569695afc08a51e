use heapless::Vec;
use tracing::{debug, info};

use crate::config::{BigSyncConfig, MAX_BIS_PER_BIG, MAX_SCHEDULE_ATTEMPTS};
use crate::sdk::ble_app::ble_ll_channel_selection::{BisChanState, ChanTable};
use crate::sdk::ble_app::ble_ll_status::Status;
use crate::sdk::ble_app::rf_drv::{BigInfoReport, Scheduler, SyncEstablished};
use crate::sdk::mcu::crypto::{derive_gsk, AesBlock, BisEncCtx};
use crate::sdk::packet_types::{
    big_ctrl_access_addr, bis_access_addr, bis_crc_init, Framing, Phy, BIG_CTRL_BIS_NUM, MIC_LEN,
};
use crate::state::{BigCtx, BisId, ContextRepo, CtrlChan, Packing};

/// Sequential iff a BIS's spacing leaves room for its whole run of subevents.
pub fn select_packing(bis_space_usec: u32, sub_inter_usec: u32) -> Packing {
    if bis_space_usec >= sub_inter_usec {
        Packing::Sequential
    } else {
        Packing::Interleaved
    }
}

/// Receive window widening for the combined clock accuracy, rounded up.
pub fn window_widening_usec(sca_ppm: u32, unsynced_usec: u32) -> u32 {
    ((sca_ppm as u64 * unsynced_usec as u64 + 999_999) / 1_000_000) as u32
}

pub fn update_widening(big: &mut BigCtx, local_sca_ppm: u32) {
    big.widening_usec =
        window_widening_usec(big.peer_sca_ppm + local_sca_ppm, big.unsynced_usec) + big.initial_margin_usec;
}

/// Moves the BIG one ISO interval forward without receiving.
pub fn skip_event(big: &mut BigCtx) {
    big.event_counter += 1;
    big.anchor_usec = big.anchor_usec.wrapping_add(big.iso_inter_usec);
    big.unsynced_usec = big.unsynced_usec.saturating_add(big.iso_inter_usec);
}

/// Start of subevent `se` of BIS `bis_num` relative to the BIG anchor point.
pub fn subevent_offset_usec(big: &BigCtx, bis_num: u8, se: u8) -> u32 {
    bis_num.saturating_sub(1) as u32 * big.bis_space_usec + se as u32 * big.sub_inter_usec
}

/// Start of the BIG control subevent relative to the BIG anchor point.
pub fn ctrl_offset_usec(big: &BigCtx) -> u32 {
    let last = subevent_offset_usec(big, big.num_bis, big.nse.saturating_sub(1));
    match big.packing {
        Packing::Sequential => last + big.sub_inter_usec,
        Packing::Interleaved => last + big.bis_space_usec,
    }
}

/// Air time of a BIS PDU with `payload_len` octets.
pub fn pdu_air_time_usec(phy: Phy, payload_len: usize) -> u32 {
    let len = payload_len as u32;
    match phy {
        // preamble, access address, header, payload, CRC
        Phy::Le1M => (1 + 4 + 2 + len + 3) * 8,
        Phy::Le2M => (2 + 4 + 2 + len + 3) * 4,
        // S=8: preamble, access address, CI and TERM1 are fixed length
        Phy::LeCoded => 80 + 256 + 16 + 24 + (2 + len + 3) * 64 + 24,
    }
}

fn max_pdu_air_time_usec(big: &BigCtx) -> u32 {
    let mic = if big.encrypt { MIC_LEN } else { 0 };
    pdu_air_time_usec(big.phy, big.max_pdu as usize + mic)
}

/// Scheduler reservation covering every subevent including control.
pub fn event_duration_usec(big: &BigCtx) -> u32 {
    ctrl_offset_usec(big) + max_pdu_air_time_usec(big) + 2 * big.widening_usec
}

pub fn transport_latency_usec(big: &BigCtx) -> u32 {
    let sync_delay = subevent_offset_usec(big, big.num_bis, big.nse.saturating_sub(1)) as i64
        + max_pdu_air_time_usec(big) as i64;
    let pt = big.pto as i64 * big.num_pre_tx_groups() as i64;
    let iso = big.iso_inter_usec as i64;
    let sdu = big.sdu_inter_usec as i64;

    let latency = match big.framing {
        Framing::Unframed => sync_delay + (pt + 1) * iso - sdu,
        Framing::Framed => sync_delay + pt * iso + iso + sdu,
    };
    latency.clamp(0, u32::MAX as i64) as u32
}

/// Copies timing and packet parameters from BIG Info and estimates the first anchor.
pub fn populate(big: &mut BigCtx, report: &BigInfoReport, local_sca_ppm: u32) {
    let info = &report.info;

    big.num_bis = info.num_bis;
    big.bn = info.bn;
    big.nse = info.nse;
    big.irc = info.irc;
    big.pto = info.pto;
    big.framing = info.framing;
    big.phy = info.phy;
    big.iso_inter_usec = info.iso_interval_usec();
    big.sub_inter_usec = info.sub_interval_usec;
    big.bis_space_usec = info.bis_spacing_usec;
    big.sdu_inter_usec = info.sdu_interval_usec;
    big.max_pdu = info.max_pdu;
    big.max_sdu = info.max_sdu;
    big.seed_access_addr = info.seed_access_addr;
    big.base_crc_init = info.base_crc_init;
    big.packing = select_packing(info.bis_spacing_usec, info.sub_interval_usec);

    big.event_counter = info.bis_payload_count / info.bn.max(1) as u64;
    big.anchor_usec = report.ref_time_usec.wrapping_add(info.offset_usec());
    big.unsynced_usec = info.offset_usec();
    big.initial_margin_usec = info.offset_unit_usec();
    big.peer_sca_ppm = report.peer_sca_ppm;
    big.chan_table = ChanTable::new(info.chan_map);

    update_widening(big, local_sca_ppm);
}

/// Turns the stored BIG Info into BIS contexts, key material and the control channel.
pub fn build_big<A: AesBlock + ?Sized>(
    repo: &mut ContextRepo,
    aes: &A,
    cfg: &BigSyncConfig,
    big_handle: u8,
) -> Result<(), Status> {
    let big = repo.big_mut(big_handle).ok_or(Status::UnknownAdvId)?;
    let report = big.big_info.ok_or(Status::CmdDisallowed)?;
    let info = report.info;

    if info.encrypted() != big.encrypt {
        return Err(Status::EncryptionModeNotAcceptable);
    }
    if big.req_bis.iter().any(|n| *n > info.num_bis) {
        return Err(Status::UnsupportedFeature);
    }

    populate(big, &report, cfg.local_sca_ppm);

    if let (true, Some(enc)) = (big.encrypt, info.enc) {
        big.gsk = derive_gsk(aes, &big.broadcast_code, &enc.gskd);
        big.giv = enc.giv;
    }

    let req = big.req_bis.clone();
    let (encrypt, gsk, giv, seed, base_crc) = (big.encrypt, big.gsk, big.giv, big.seed_access_addr, big.base_crc_init);

    let mut ids: Vec<Option<BisId>, MAX_BIS_PER_BIG> = Vec::new();
    for n in req.iter().copied() {
        let id = repo.alloc_bis(big_handle, n);
        if let Some(bis) = id.and_then(|id| repo.bis_mut(id)) {
            bis.access_addr = bis_access_addr(seed, n);
            bis.crc_init = bis_crc_init(base_crc, n);
            bis.chan = BisChanState::new(bis.access_addr);
            if encrypt {
                bis.enc = BisEncCtx::new(&gsk, &giv, bis.access_addr);
            }
        } else {
            debug!(big_handle, bis_num = n, "no BIS context left, stream filtered");
        }
        let _ = ids.push(id);
    }

    let big = repo.big_mut(big_handle).ok_or(Status::UnknownAdvId)?;
    big.bis = ids;

    let ctrl_aa = big_ctrl_access_addr(seed);
    big.ctrl = CtrlChan {
        access_addr: ctrl_aa,
        crc_init: bis_crc_init(base_crc, BIG_CTRL_BIS_NUM),
        chan: BisChanState::new(ctrl_aa),
        enc: if encrypt { BisEncCtx::new(&gsk, &giv, ctrl_aa) } else { BisEncCtx::default() },
    };

    if big.bis.iter().all(|b| b.is_none()) {
        return Err(Status::MemCapExceeded);
    }

    info!(
        big_handle,
        event_counter = big.event_counter,
        num_bis = big.num_bis,
        packing = ?big.packing,
        encrypt,
        "BIG contexts built"
    );

    Ok(())
}

/// Inserts the first BIG event, skipping events while the scheduler reports a conflict.
pub fn schedule_first<S: Scheduler + ?Sized>(big: &mut BigCtx, sched: &mut S, local_sca_ppm: u32) -> Result<(), Status> {
    for _ in 0..MAX_SCHEDULE_ATTEMPTS {
        update_widening(big, local_sca_ppm);
        let due = big.anchor_usec.wrapping_sub(big.widening_usec);

        if sched.insert(big.handle, due, event_duration_usec(big)) {
            big.op_scheduled = true;
            debug!(big_handle = big.handle, event_counter = big.event_counter, due, "first BIG event scheduled");
            return Ok(());
        }

        debug!(big_handle = big.handle, event_counter = big.event_counter, "scheduler conflict, skipping event");
        skip_event(big);
    }

    Err(Status::ConnFailedToEstablish)
}

pub fn sync_established(big: &BigCtx, bis_handles: Vec<u16, MAX_BIS_PER_BIG>) -> SyncEstablished {
    SyncEstablished {
        status: Status::Success,
        big_handle: big.handle,
        transport_latency_usec: transport_latency_usec(big),
        nse: big.nse,
        bn: big.bn,
        pto: big.pto,
        irc: big.irc,
        max_pdu: big.max_pdu,
        iso_interval: (big.iso_inter_usec / crate::config::ISO_INTERVAL_UNIT_USEC) as u16,
        bis_handles,
    }
}
