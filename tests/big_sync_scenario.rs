use big_sync::{
    AesBlock, Baseband, BigInfo, BigInfoReport, BigState, BigSync, BigSyncConfig, CreateSyncParams, DataPath, Framing,
    HostSink, PeriodicSync, Phy, RxSetup, RxStatus, Scheduler, Sdu, SduStatus, Status, SyncEstablished, SyncTimer,
};
use embassy_time::Duration;

const BIS_HANDLE: u16 = 0x0100;

/// Controller stand-in: accepts every operation and records what the host would see.
#[derive(Default)]
struct Sim {
    report: Option<BigInfoReport>,
    pending_op: Option<u32>,
    armed: Vec<RxSetup>,
    timer_running: bool,
    established: Vec<SyncEstablished>,
    lost: Vec<(u8, u8)>,
    term_complete: Vec<(u8, Status)>,
    event_complete: Vec<u64>,
    iso_rx: Vec<u16>,
}

impl Scheduler for Sim {
    fn insert(&mut self, _big_handle: u8, due_usec: u32, _duration_usec: u32) -> bool {
        self.pending_op = Some(due_usec);
        true
    }

    fn remove(&mut self, _big_handle: u8) -> bool {
        self.pending_op.take().is_some()
    }
}

impl Baseband for Sim {
    fn start(&mut self, _big_handle: u8) {}

    fn stop(&mut self, _big_handle: u8) {}

    fn arm_rx(&mut self, setup: &RxSetup) {
        self.armed.push(*setup);
    }

    fn set_terminate(&mut self) {}
}

impl SyncTimer for Sim {
    fn start(&mut self, _big_handle: u8, _timeout: Duration) {
        self.timer_running = true;
    }

    fn stop(&mut self, _big_handle: u8) {
        self.timer_running = false;
    }
}

impl HostSink for Sim {
    fn sync_established(&mut self, evt: &SyncEstablished) {
        self.established.push(evt.clone());
    }

    fn sync_lost(&mut self, big_handle: u8, reason: u8) {
        self.lost.push((big_handle, reason));
    }

    fn terminate_complete(&mut self, big_handle: u8, status: Status) {
        self.term_complete.push((big_handle, status));
    }

    fn iso_event_complete(&mut self, _big_handle: u8, event_counter: u64) {
        self.event_complete.push(event_counter);
    }

    fn iso_rx(&mut self, _bis_handles: &[u16], counts: &[u16]) {
        self.iso_rx.extend_from_slice(counts);
    }

    fn codec_sdu(&mut self, _bis_handle: u16, _sdu: &Sdu) {}
}

impl PeriodicSync for Sim {
    fn is_synced(&self, sync_handle: u16) -> bool {
        sync_handle == 0
    }

    fn big_info(&self, sync_handle: u16) -> Option<BigInfoReport> {
        self.report.filter(|r| r.sync_handle == sync_handle)
    }
}

impl AesBlock for Sim {
    fn aes128_encrypt(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        for (b, k) in block.iter_mut().zip(key) {
            *b = b.rotate_left(3) ^ k;
        }
    }
}

fn report() -> BigInfoReport {
    BigInfoReport {
        sync_handle: 0,
        info: BigInfo {
            big_offset: 200,
            big_offset_coarse: false,
            iso_interval: 10,
            num_bis: 1,
            nse: 1,
            bn: 1,
            sub_interval_usec: 500,
            pto: 0,
            bis_spacing_usec: 1000,
            irc: 1,
            max_pdu: 20,
            seed_access_addr: 0x8E89_BED6,
            sdu_interval_usec: 12_500,
            max_sdu: 20,
            base_crc_init: 0x5A5A,
            chan_map: 0x1F_FFFF_FFFF,
            phy: Phy::Le1M,
            bis_payload_count: 0,
            framing: Framing::Unframed,
            enc: None,
        },
        ref_time_usec: 500_000,
        peer_sca_ppm: 50,
    }
}

fn engine() -> BigSync<Sim> {
    let cfg = BigSyncConfig { notify_iso_event_complete: true, ..BigSyncConfig::default() };
    BigSync::new(cfg, Sim { report: Some(report()), ..Default::default() })
}

fn create(sync: &BigSync<Sim>) -> Result<(), Status> {
    sync.create_sync(&CreateSyncParams {
        big_handle: 1,
        sync_handle: 0,
        mse: 0,
        sync_timeout: 100,
        bis: &[1],
        encrypt: false,
        broadcast_code: [0; 16],
    })
}

/// Drives one BIG event the way the radio interrupt would.
fn run_event(sync: &BigSync<Sim>, status: RxStatus, pdu: &[u8]) {
    if sync.begin_op(1) {
        loop {
            let setup = sync.with_platform(|p| p.armed.last().copied()).unwrap();
            if !sync.rx_complete(1, status, pdu, setup.due_usec) {
                break;
            }
        }
    }
    sync.end_op(1);
    sync.dispatch();
}

#[test]
fn test_sync_receive_and_terminate() {
    let sync = engine();

    // Arrange
    assert_eq!(create(&sync), Ok(()));
    assert_eq!(sync.big_state(1), BigState::Syncing);
    assert!(sync.with_platform(|p| p.established.is_empty()));

    sync.on_big_info(&report());
    sync.dispatch();

    assert_eq!(sync.big_state(1), BigState::Synced);
    sync.with_platform(|p| {
        assert_eq!(p.established.len(), 1);
        assert_eq!(p.established[0].status, Status::Success);
        assert_eq!(p.established[0].bis_handles.as_slice(), &[BIS_HANDLE]);
        assert_eq!((p.established[0].nse, p.established[0].bn, p.established[0].irc), (1, 1, 1));
        assert!(p.timer_running);
    });
    assert_eq!(sync.setup_data_path(BIS_HANDLE, DataPath::Host), Ok(()));

    // Act
    for i in 0..5u8 {
        run_event(&sync, RxStatus::Success, &[0x00, 3, i, 0xBE, 0xEF]);
    }

    // Assert
    sync.with_platform(|p| {
        assert_eq!(p.event_complete, vec![0, 1, 2, 3, 4]);
        assert_eq!(p.iso_rx, vec![1; 5]);
        // one receive per event: nse 1, no control subevent announced
        assert_eq!(p.armed.len(), 5);
        assert!(p.armed.windows(2).all(|w| w[1].due_usec.wrapping_sub(w[0].due_usec) == 12_500));
    });
    for i in 0..5u8 {
        let sdu = sync.read_sdu(BIS_HANDLE).unwrap();
        assert_eq!(sdu.status, SduStatus::Valid);
        assert_eq!(sdu.pkt_counter, i as u64);
        assert_eq!(sdu.data.as_slice(), &[i, 0xBE, 0xEF]);
    }
    assert!(sync.read_sdu(BIS_HANDLE).is_none());

    assert_eq!(sync.terminate_sync(1), Ok(()));
    sync.dispatch();

    assert_eq!(sync.big_state(1), BigState::Disabled);
    sync.with_platform(|p| {
        assert_eq!(p.term_complete, vec![(1, Status::Success)]);
        assert!(p.lost.is_empty());
        assert!(!p.timer_running);
    });
    assert!(!sync.begin_op(1));
    assert_eq!(sync.reset_defaults(), Ok(()));
}

#[test]
fn test_missed_events_widen_then_time_out() {
    let sync = engine();
    create(&sync).unwrap();
    sync.on_big_info(&report());
    sync.dispatch();
    sync.setup_data_path(BIS_HANDLE, DataPath::Host).unwrap();

    run_event(&sync, RxStatus::Success, &[0x00, 1, 0x01]);
    let synced_widening = sync.window_widening_usec(1).unwrap();

    for _ in 0..3 {
        run_event(&sync, RxStatus::Timeout, &[]);
    }
    assert!(sync.window_widening_usec(1).unwrap() > synced_widening);
    sync.with_platform(|p| assert!(p.armed.last().unwrap().reacquire));

    // each missed SDU is reported once
    let lost = std::iter::from_fn(|| sync.read_sdu(BIS_HANDLE)).filter(|s| s.status == SduStatus::Lost).count();
    assert_eq!(lost, 3);

    sync.on_sync_timeout(1);
    sync.dispatch();

    assert_eq!(sync.big_state(1), BigState::Disabled);
    sync.with_platform(|p| {
        assert_eq!(p.lost, vec![(1, Status::ConnTimeout.code())]);
        assert!(p.term_complete.is_empty());
    });
}

#[test]
fn test_terminate_unknown_big() {
    let sync = engine();

    assert_eq!(sync.terminate_sync(3), Err(Status::UnknownAdvId));
    assert_eq!(sync.with_platform(|p| p.term_complete.clone()), vec![(3, Status::UnknownAdvId)]);
    assert_eq!(sync.big_state(3), BigState::Disabled);
}

#[test]
fn test_create_sync_without_big_info_leaves_nothing_behind() {
    let sync = BigSync::new(BigSyncConfig::default(), Sim::default());

    assert_eq!(create(&sync), Err(Status::CmdDisallowed));
    assert_eq!(sync.big_state(1), BigState::Disabled);
    assert!(sync.with_platform(|p| p.established.is_empty() && p.term_complete.is_empty()));
}
