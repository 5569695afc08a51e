use heapless::Vec;
use tracing::{error, trace, warn};

use crate::config::{BigSyncConfig, MAX_BIS, MAX_BIS_PER_BIG, MAX_SDU_FRAGMENTS, MAX_SDU_LEN};
use crate::sdk::ble_app::big_sm::{post, BigEvent, BigMsgChannel};
use crate::sdk::ble_app::iso_assembler::{FramedEvent, IsoAssembler};
use crate::sdk::ble_app::rf_drv::HostSink;
use crate::sdk::mcu::crypto::AesBlock;
use crate::sdk::packet_types::{BisPduHeader, Framing, Llid, BIS_PDU_HDR_LEN};
use crate::state::{BigCtx, BisCtx, DataPath, IsoTestState, PduPool, PduRef};

/// HCI packet boundary of an unframed fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbFlag {
    Complete,
    First,
    Continuation,
    Last,
}

pub fn pb_flag(last_llid: Option<Llid>, llid: Llid) -> PbFlag {
    let mid_sdu = last_llid == Some(Llid::UnframedCont);
    match (mid_sdu, llid) {
        (false, Llid::UnframedEnd) => PbFlag::Complete,
        (false, _) => PbFlag::First,
        (true, Llid::UnframedEnd) => PbFlag::Last,
        (true, _) => PbFlag::Continuation,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SduStatus {
    #[default]
    Valid,
    Lost,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sdu {
    /// Payload counter of the PDU that completed (or would have completed) the SDU.
    pub pkt_counter: u64,
    pub status: SduStatus,
    /// Framed SDUs only: offset from the BIG anchor point.
    pub time_offset: Option<u32>,
    pub data: Vec<u8, MAX_SDU_LEN>,
}

/// Unframed reassembly state of one BIS.
#[derive(Debug, Default)]
pub struct UnframedState {
    pub last_llid: Option<Llid>,
    /// Dropping fragments of an SDU already reported lost.
    pub discarding: bool,
    /// Index (payload counter / PDUs per SDU) of the last SDU delivered or reported lost.
    /// Misses in the rest of its slots are padding.
    pub done_sdu: Option<u64>,
    pub frags: Vec<PduRef, MAX_SDU_FRAGMENTS>,
}

impl UnframedState {
    fn release(&mut self, pool: &mut PduPool) {
        for r in self.frags.iter() {
            pool.free(*r);
        }
        self.frags.clear();
    }
}

/// PDUs making up one unframed SDU.
pub fn pdus_per_sdu(big: &BigCtx) -> u64 {
    if big.iso_inter_usec == 0 {
        return 1;
    }
    (big.bn as u64 * big.sdu_inter_usec as u64 / big.iso_inter_usec as u64).max(1)
}

/// Drains the receive queues of every BIS of `big`: decrypts, reassembles SDUs and
/// routes them to their data path. Host SDUs are announced with one `iso_rx` call.
pub fn deliver_event<P>(
    big: &BigCtx,
    bis_tbl: &mut [Option<BisCtx>; MAX_BIS],
    pool: &mut PduPool,
    framed: &mut IsoAssembler,
    p: &mut P,
    cfg: &BigSyncConfig,
    msgs: &BigMsgChannel,
) where
    P: HostSink + AesBlock + ?Sized,
{
    let mut handles: Vec<u16, MAX_BIS_PER_BIG> = Vec::new();
    let mut counts: Vec<u16, MAX_BIS_PER_BIG> = Vec::new();
    let mut mic_failed = false;

    for id in big.bis.iter().flatten() {
        let Some(bis) = bis_tbl[*id].as_mut() else {
            continue;
        };

        let mut queued = 0u16;
        let mut aborted = false;
        while let Some(rx) = bis.rx_queue.pop_front() {
            let pkt_ctr = big.payload_counter(rx.event_counter, rx.burst);

            let Some(r) = rx.pdu else {
                if !aborted {
                    queued += on_missing(big, bis, pool, framed, p, cfg, pkt_ctr);
                }
                continue;
            };

            if aborted {
                pool.free(r);
                continue;
            }

            if !decrypt(bis, pool, &*p, r, pkt_ctr) {
                error!(big_handle = big.handle, bis_handle = bis.handle, pkt_ctr, "BIS PDU MIC failure");
                pool.free(r);
                aborted = true;
                mic_failed = true;
                continue;
            }

            queued += match big.framing {
                Framing::Unframed => unframed_pdu(big, bis, pool, p, cfg, r, pkt_ctr),
                Framing::Framed => framed_pdu(bis, pool, framed, p, cfg, r, pkt_ctr),
            };
        }

        if queued > 0 && handles.push(bis.handle).is_ok() {
            let _ = counts.push(queued);
        }
    }

    if mic_failed {
        post(msgs, big.handle, BigEvent::MicFailed);
    }
    if !handles.is_empty() {
        p.iso_rx(&handles, &counts);
    }
}

fn decrypt<A: AesBlock + ?Sized>(bis: &BisCtx, pool: &mut PduPool, aes: &A, r: PduRef, pkt_ctr: u64) -> bool {
    let buf = pool.get_mut(r);
    // Empty PDUs carry no MIC
    if buf.len() <= BIS_PDU_HDR_LEN {
        return true;
    }

    let hdr0 = buf[0];
    let plain_len = bis.enc.decrypt_pdu(aes, pkt_ctr, hdr0, &mut buf[BIS_PDU_HDR_LEN..]);
    match plain_len {
        Some(len) => {
            pool.truncate(r, BIS_PDU_HDR_LEN + len);
            true
        }
        None => false,
    }
}

fn route<H: HostSink + ?Sized>(bis: &mut BisCtx, host: &mut H, sdu: Sdu) -> u16 {
    match bis.data_path {
        DataPath::Host => match bis.sdu_queue.push_back(sdu) {
            Ok(()) => 1,
            Err(_) => {
                warn!(bis_handle = bis.handle, "host SDU queue full, dropped");
                0
            }
        },
        DataPath::Vendor => {
            host.codec_sdu(bis.handle, &sdu);
            0
        }
        DataPath::Disabled => 0,
    }
}

fn lost<H: HostSink + ?Sized>(bis: &mut BisCtx, host: &mut H, cfg: &BigSyncConfig, pkt_ctr: u64) -> u16 {
    trace!(bis_handle = bis.handle, pkt_ctr, "SDU lost");
    if !cfg.notify_sdu_lost {
        return 0;
    }
    route(bis, host, Sdu { pkt_counter: pkt_ctr, status: SduStatus::Lost, ..Default::default() })
}

fn build_sdu(pool: &PduPool, frags: &[PduRef], pkt_ctr: u64) -> Option<Sdu> {
    let mut sdu = Sdu { pkt_counter: pkt_ctr, ..Default::default() };
    for r in frags {
        sdu.data.extend_from_slice(&pool.get(*r)[BIS_PDU_HDR_LEN..]).ok()?;
    }
    Some(sdu)
}

fn on_missing<H: HostSink + ?Sized>(
    big: &BigCtx,
    bis: &mut BisCtx,
    pool: &mut PduPool,
    framed: &mut IsoAssembler,
    host: &mut H,
    cfg: &BigSyncConfig,
    pkt_ctr: u64,
) -> u16 {
    if bis.test.enabled {
        bis.test.stats.missed += 1;
        return 0;
    }

    match big.framing {
        Framing::Unframed => {
            let n = pdus_per_sdu(big);
            let st = &mut bis.unframed;
            if st.discarding && pkt_ctr % n != 0 {
                return 0;
            }
            if st.done_sdu == Some(pkt_ctr / n) && st.last_llid != Some(Llid::UnframedCont) {
                return 0;
            }

            st.release(pool);
            // Skip what is left of this SDU unless the miss was its last PDU
            st.discarding = n > 1 && (pkt_ctr + 1) % n != 0;
            st.last_llid = Some(Llid::UnframedEnd);
            st.done_sdu = Some(pkt_ctr / n);
            lost(bis, host, cfg, pkt_ctr)
        }
        Framing::Framed => {
            let mut queued = 0;
            let handle = bis.handle;
            framed.mark_missing(handle, |e| queued += framed_event(bis, host, cfg, e, pkt_ctr));
            queued
        }
    }
}

fn unframed_pdu<H: HostSink + ?Sized>(
    big: &BigCtx,
    bis: &mut BisCtx,
    pool: &mut PduPool,
    host: &mut H,
    cfg: &BigSyncConfig,
    r: PduRef,
    pkt_ctr: u64,
) -> u16 {
    let Ok(hdr) = BisPduHeader::parse(pool.get(r)) else {
        pool.free(r);
        return 0;
    };
    if !matches!(hdr.llid, Llid::UnframedEnd | Llid::UnframedCont) {
        warn!(bis_handle = bis.handle, llid = ?hdr.llid, "unexpected LLID on unframed BIS");
        pool.free(r);
        return 0;
    }

    let n = pdus_per_sdu(big);
    let st = &mut bis.unframed;
    if st.discarding {
        if pkt_ctr % n == 0 {
            st.discarding = false;
            st.last_llid = Some(Llid::UnframedEnd);
        } else {
            if hdr.llid == Llid::UnframedEnd {
                st.discarding = false;
                st.last_llid = Some(Llid::UnframedEnd);
            }
            pool.free(r);
            return 0;
        }
    }

    let at_boundary = st.last_llid != Some(Llid::UnframedCont);
    let payload_len = pool.get(r).len() - BIS_PDU_HDR_LEN;
    if at_boundary && payload_len == 0 {
        // padding
        pool.free(r);
        return 0;
    }

    if bis.test.enabled {
        if at_boundary {
            test_unframed(&mut bis.test, &pool.get(r)[BIS_PDU_HDR_LEN..], pkt_ctr);
        }
        st.last_llid = Some(hdr.llid);
        pool.free(r);
        return 0;
    }

    match pb_flag(st.last_llid, hdr.llid) {
        PbFlag::Complete => {
            st.last_llid = Some(Llid::UnframedEnd);
            st.done_sdu = Some(pkt_ctr / n);
            let sdu = build_sdu(pool, &[r], pkt_ctr);
            pool.free(r);
            match sdu {
                Some(sdu) => route(bis, host, sdu),
                None => lost(bis, host, cfg, pkt_ctr),
            }
        }
        PbFlag::First | PbFlag::Continuation => {
            st.last_llid = Some(Llid::UnframedCont);
            if st.frags.push(r).is_err() {
                warn!(bis_handle = bis.handle, "too many SDU fragments");
                st.release(pool);
                pool.free(r);
                st.discarding = true;
                st.done_sdu = Some(pkt_ctr / n);
                return lost(bis, host, cfg, pkt_ctr);
            }
            0
        }
        PbFlag::Last => {
            st.last_llid = Some(Llid::UnframedEnd);
            st.done_sdu = Some(pkt_ctr / n);
            let sdu = match st.frags.push(r) {
                Ok(()) => build_sdu(pool, &st.frags, pkt_ctr),
                Err(r) => {
                    pool.free(r);
                    None
                }
            };
            st.release(pool);
            match sdu {
                Some(sdu) => route(bis, host, sdu),
                None => lost(bis, host, cfg, pkt_ctr),
            }
        }
    }
}

fn framed_pdu<H: HostSink + ?Sized>(
    bis: &mut BisCtx,
    pool: &mut PduPool,
    framed: &mut IsoAssembler,
    host: &mut H,
    cfg: &BigSyncConfig,
    r: PduRef,
    pkt_ctr: u64,
) -> u16 {
    let mut queued = 0;
    let buf = pool.get(r);

    match BisPduHeader::parse(buf) {
        Ok(hdr) if hdr.llid == Llid::Framed => {
            let handle = bis.handle;
            framed.push_pdu(handle, &buf[BIS_PDU_HDR_LEN..], |e| {
                queued += framed_event(bis, host, cfg, e, pkt_ctr)
            });
        }
        Ok(hdr) => warn!(bis_handle = bis.handle, llid = ?hdr.llid, "unexpected LLID on framed BIS"),
        Err(_) => {}
    }

    pool.free(r);
    queued
}

fn framed_event<H: HostSink + ?Sized>(
    bis: &mut BisCtx,
    host: &mut H,
    cfg: &BigSyncConfig,
    event: FramedEvent<'_>,
    pkt_ctr: u64,
) -> u16 {
    match event {
        FramedEvent::Sdu { data, time_offset } => {
            if bis.test.enabled {
                test_framed(&mut bis.test, Some(data));
                return 0;
            }

            let mut sdu = Sdu { pkt_counter: pkt_ctr, time_offset: Some(time_offset), ..Default::default() };
            if sdu.data.extend_from_slice(data).is_err() {
                return lost(bis, host, cfg, pkt_ctr);
            }
            route(bis, host, sdu)
        }
        FramedEvent::Lost => {
            if bis.test.enabled {
                test_framed(&mut bis.test, None);
                return 0;
            }
            lost(bis, host, cfg, pkt_ctr)
        }
    }
}

fn test_counter(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Unframed test SDUs carry their payload counter.
fn test_unframed(test: &mut IsoTestState, payload: &[u8], pkt_ctr: u64) {
    if test_counter(payload) == Some(pkt_ctr as u32) {
        test.stats.received += 1;
    } else {
        test.stats.failed += 1;
    }
}

/// Framed test SDUs carry a counter that increments per SDU, starting anywhere.
fn test_framed(test: &mut IsoTestState, data: Option<&[u8]>) {
    let Some(data) = data else {
        test.stats.missed += 1;
        return;
    };
    let Some(value) = test_counter(data) else {
        test.stats.failed += 1;
        return;
    };

    if value == test.expected_counter.unwrap_or(value) {
        test.stats.received += 1;
    } else {
        test.stats.failed += 1;
    }
    test.expected_counter = Some(value.wrapping_add(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::ble_app::big_sm::BigMsg;
    use crate::sdk::ble_app::rf_drv::tests::FakePlatform;
    use crate::sdk::mcu::crypto::tests::SoftAes;
    use crate::sdk::mcu::crypto::BisEncCtx;
    use crate::state::{ContextRepo, RepoParts, RxPdu};
    use crate::config::PDU_POOL_SIZE;

    const HANDLE: u16 = 0x0100;

    fn setup(framing: Framing, bn: u8, data_path: DataPath) -> ContextRepo {
        let mut repo = ContextRepo::new(&BigSyncConfig::default());
        {
            let big = repo.alloc_big(1, 0).unwrap();
            big.bn = bn;
            big.framing = framing;
            big.iso_inter_usec = 10_000;
            big.sdu_inter_usec = 10_000;
        }
        let id = repo.alloc_bis(1, 1).unwrap();
        repo.big_mut(1).unwrap().bis.push(Some(id)).unwrap();
        repo.bis_mut(id).unwrap().data_path = data_path;
        repo
    }

    fn push(repo: &mut ContextRepo, pdu: Option<&[u8]>, event_counter: u64, burst: u8) {
        let RepoParts { pool, bis, .. } = repo.parts(1).unwrap();
        let pdu = pdu.map(|p| pool.alloc(p).unwrap());
        bis[0].as_mut().unwrap().rx_queue.push_back(RxPdu { pdu, burst, event_counter }).unwrap();
    }

    fn deliver(repo: &mut ContextRepo, p: &mut FakePlatform, msgs: &BigMsgChannel) {
        let cfg = BigSyncConfig::default();
        let RepoParts { big, bis, pool, framed } = repo.parts(1).unwrap();
        deliver_event(big, bis, pool, framed, p, &cfg, msgs);
    }

    fn host_sdus(repo: &mut ContextRepo) -> std::vec::Vec<Sdu> {
        let bis = repo.bis_by_handle(HANDLE).unwrap();
        let mut out = std::vec::Vec::new();
        while let Some(sdu) = bis.sdu_queue.pop_front() {
            out.push(sdu);
        }
        out
    }

    #[test]
    fn test_pb_flag() {
        assert_eq!(pb_flag(None, Llid::UnframedEnd), PbFlag::Complete);
        assert_eq!(pb_flag(Some(Llid::UnframedEnd), Llid::UnframedCont), PbFlag::First);
        assert_eq!(pb_flag(Some(Llid::UnframedCont), Llid::UnframedCont), PbFlag::Continuation);
        assert_eq!(pb_flag(Some(Llid::UnframedCont), Llid::UnframedEnd), PbFlag::Last);
    }

    #[test]
    fn test_unframed_reassembles_across_pdus() {
        // Arrange
        let mut repo = setup(Framing::Unframed, 3, DataPath::Host);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        // Act
        push(&mut repo, Some(&[0x01, 2, 0xA, 0xB]), 0, 0);
        push(&mut repo, Some(&[0x01, 1, 0xC]), 0, 1);
        push(&mut repo, Some(&[0x00, 1, 0xD]), 0, 2);
        deliver(&mut repo, &mut p, &msgs);

        // Assert
        let sdus = host_sdus(&mut repo);
        assert_eq!(sdus.len(), 1);
        assert_eq!(sdus[0].data.as_slice(), &[0xA, 0xB, 0xC, 0xD]);
        assert_eq!(sdus[0].pkt_counter, 2);
        assert_eq!(p.iso_rx, vec![(vec![HANDLE], vec![1])]);
        assert_eq!(repo.pool().available(), PDU_POOL_SIZE);
    }

    #[test]
    fn test_missing_end_gives_one_lost() {
        let mut repo = setup(Framing::Unframed, 3, DataPath::Host);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, Some(&[0x01, 1, 1]), 0, 0);
        push(&mut repo, Some(&[0x01, 1, 2]), 0, 1);
        push(&mut repo, None, 0, 2);
        push(&mut repo, Some(&[0x01, 1, 4]), 1, 0);
        push(&mut repo, Some(&[0x01, 1, 5]), 1, 1);
        push(&mut repo, Some(&[0x00, 1, 6]), 1, 2);
        deliver(&mut repo, &mut p, &msgs);

        let sdus = host_sdus(&mut repo);
        assert_eq!(sdus.len(), 2);
        assert_eq!(sdus[0].status, SduStatus::Lost);
        assert_eq!(sdus[0].pkt_counter, 2);
        assert!(sdus[0].data.is_empty());
        assert_eq!(sdus[1].status, SduStatus::Valid);
        assert_eq!(sdus[1].data.as_slice(), &[4, 5, 6]);
        assert_eq!(repo.pool().available(), PDU_POOL_SIZE);
    }

    #[test]
    fn test_missing_padding_after_complete_sdu_is_silent() {
        // Arrange
        let mut repo = setup(Framing::Unframed, 3, DataPath::Host);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, Some(&[0x00, 1, 0xAA]), 0, 0);
        push(&mut repo, Some(&[0x00, 0]), 0, 1);
        push(&mut repo, None, 0, 2);

        // Act
        deliver(&mut repo, &mut p, &msgs);

        // Assert
        let sdus = host_sdus(&mut repo);
        let status: std::vec::Vec<_> = sdus.iter().map(|s| s.status).collect();
        assert_eq!(status, vec![SduStatus::Valid]);
        assert_eq!(sdus[0].data.as_slice(), &[0xAA]);
        assert_eq!(p.iso_rx, vec![(vec![HANDLE], vec![1])]);
        assert_eq!(repo.pool().available(), PDU_POOL_SIZE);
    }

    #[test]
    fn test_missing_start_discards_rest_of_sdu() {
        let mut repo = setup(Framing::Unframed, 3, DataPath::Host);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, None, 0, 0);
        push(&mut repo, None, 0, 1);
        push(&mut repo, Some(&[0x00, 1, 3]), 0, 2);
        push(&mut repo, Some(&[0x00, 1, 7]), 1, 0);
        push(&mut repo, Some(&[0x00, 0]), 1, 1);
        push(&mut repo, Some(&[0x00, 0]), 1, 2);
        deliver(&mut repo, &mut p, &msgs);

        let sdus = host_sdus(&mut repo);
        let status: std::vec::Vec<_> = sdus.iter().map(|s| s.status).collect();
        assert_eq!(status, vec![SduStatus::Lost, SduStatus::Valid]);
        assert_eq!(sdus[1].data.as_slice(), &[7]);
        assert_eq!(p.iso_rx, vec![(vec![HANDLE], vec![2])]);
    }

    #[test]
    fn test_every_miss_is_lost_with_one_pdu_per_sdu() {
        let mut repo = setup(Framing::Unframed, 1, DataPath::Host);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, None, 0, 0);
        push(&mut repo, None, 1, 0);
        push(&mut repo, Some(&[0x00, 1, 9]), 2, 0);
        deliver(&mut repo, &mut p, &msgs);

        let status: std::vec::Vec<_> = host_sdus(&mut repo).iter().map(|s| s.status).collect();
        assert_eq!(status, vec![SduStatus::Lost, SduStatus::Lost, SduStatus::Valid]);
    }

    #[test]
    fn test_framed_vendor_path() {
        let mut repo = setup(Framing::Framed, 1, DataPath::Vendor);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, Some(&[0x02, 7, 0x02, 5, 0x20, 0, 0, 0x11, 0x22]), 4, 0);
        deliver(&mut repo, &mut p, &msgs);

        assert_eq!(p.codec.len(), 1);
        let (handle, sdu) = &p.codec[0];
        assert_eq!(*handle, HANDLE);
        assert_eq!(sdu.data.as_slice(), &[0x11, 0x22]);
        assert_eq!(sdu.time_offset, Some(0x20));
        assert_eq!(sdu.pkt_counter, 4);
        assert!(p.iso_rx.is_empty());
    }

    #[test]
    fn test_encrypted_pdu_decrypted() {
        let mut repo = setup(Framing::Unframed, 1, DataPath::Host);
        let enc = BisEncCtx::new(&[3; 16], &[4; 8], 0x1234_5678);
        repo.bis_by_handle(HANDLE).unwrap().enc = enc;
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        let mut pdu = [0x00, 7, 0x55, 0x66, 0x77, 0, 0, 0, 0];
        enc.encrypt_pdu(&SoftAes, 5, pdu[0], &mut pdu[2..]).unwrap();
        push(&mut repo, Some(&pdu), 5, 0);
        deliver(&mut repo, &mut p, &msgs);

        assert_eq!(host_sdus(&mut repo)[0].data.as_slice(), &[0x55, 0x66, 0x77]);
        assert!(msgs.try_receive().is_err());
    }

    #[test]
    fn test_mic_failure_posts_once_and_aborts() {
        // Arrange
        let mut repo = setup(Framing::Unframed, 1, DataPath::Host);
        repo.bis_by_handle(HANDLE).unwrap().enc = BisEncCtx::new(&[3; 16], &[4; 8], 0x1234_5678);
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        // Act
        push(&mut repo, Some(&[0x00, 5, 1, 2, 3, 4, 5]), 0, 0);
        push(&mut repo, Some(&[0x00, 5, 1, 2, 3, 4, 5]), 1, 0);
        push(&mut repo, None, 2, 0);
        deliver(&mut repo, &mut p, &msgs);

        // Assert
        assert_eq!(msgs.try_receive().ok(), Some(BigMsg { big_handle: 1, event: BigEvent::MicFailed }));
        assert!(msgs.try_receive().is_err());
        assert!(host_sdus(&mut repo).is_empty());
        assert_eq!(repo.pool().available(), PDU_POOL_SIZE);
    }

    #[test]
    fn test_unframed_test_mode_counters() {
        let mut repo = setup(Framing::Unframed, 1, DataPath::Disabled);
        repo.bis_by_handle(HANDLE).unwrap().test.enabled = true;
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, Some(&[0x00, 4, 7, 0, 0, 0]), 7, 0);
        push(&mut repo, Some(&[0x00, 4, 9, 0, 0, 0]), 8, 0);
        push(&mut repo, None, 9, 0);
        deliver(&mut repo, &mut p, &msgs);

        let stats = repo.bis_by_handle(HANDLE).unwrap().test.stats;
        assert_eq!((stats.received, stats.missed, stats.failed), (1, 1, 1));
        assert!(p.iso_rx.is_empty());
    }

    #[test]
    fn test_framed_test_mode_seeds_counter() {
        let mut repo = setup(Framing::Framed, 1, DataPath::Disabled);
        repo.bis_by_handle(HANDLE).unwrap().test.enabled = true;
        let mut p = FakePlatform::default();
        let msgs = BigMsgChannel::new();

        push(&mut repo, Some(&[0x02, 9, 0x02, 7, 0, 0, 0, 40, 0, 0, 0]), 0, 0);
        push(&mut repo, Some(&[0x02, 9, 0x02, 7, 0, 0, 0, 41, 0, 0, 0]), 1, 0);
        push(&mut repo, Some(&[0x02, 9, 0x02, 7, 0, 0, 0, 45, 0, 0, 0]), 2, 0);
        deliver(&mut repo, &mut p, &msgs);

        let test = repo.bis_by_handle(HANDLE).unwrap().test;
        assert_eq!((test.stats.received, test.stats.failed), (2, 1));
        assert_eq!(test.expected_counter, Some(46));
    }
}
