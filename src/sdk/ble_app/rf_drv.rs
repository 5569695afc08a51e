use embassy_time::Duration;
use heapless::Vec;

use crate::config::MAX_BIS_PER_BIG;
use crate::sdk::ble_app::big_sdu::Sdu;
use crate::sdk::ble_app::ble_ll_status::Status;
use crate::sdk::mcu::crypto::AesBlock;
use crate::sdk::packet_types::BigInfo;

/// Arbitrates the radio between competing operations. Times are in microseconds on the
/// free running baseband clock and wrap at 2^32.
#[cfg_attr(test, mry::mry)]
pub trait Scheduler {
    /// Inserts the BIG's next operation. Returns `false` on conflict with another operation.
    fn insert(&mut self, big_handle: u8, due_usec: u32, duration_usec: u32) -> bool;
    /// Removes the pending operation. Returns `false` if it is already executing or absent.
    fn remove(&mut self, big_handle: u8) -> bool;
}

/// One receive armed on the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxSetup {
    pub chan: u8,
    pub access_addr: u32,
    pub crc_init: u32,
    pub due_usec: u32,
    /// Extra listening time either side of `due_usec`.
    pub window_usec: u32,
    /// Open a fresh receive window at `due_usec` instead of chaining from the previous one.
    pub reacquire: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxStatus {
    Success,
    CrcFailed,
    Timeout,
    Failed,
    Canceled,
}

pub trait Baseband {
    fn start(&mut self, big_handle: u8);
    fn stop(&mut self, big_handle: u8);
    fn arm_rx(&mut self, setup: &RxSetup);
    /// Ends the executing operation after the current subevent.
    fn set_terminate(&mut self);
}

pub trait SyncTimer {
    /// (Re)starts the BIG sync timeout.
    fn start(&mut self, big_handle: u8, timeout: Duration);
    fn stop(&mut self, big_handle: u8);
}

/// Parameters of the LE BIG Sync Established event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEstablished {
    pub status: Status,
    pub big_handle: u8,
    pub transport_latency_usec: u32,
    pub nse: u8,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u8,
    pub iso_interval: u16,
    pub bis_handles: Vec<u16, MAX_BIS_PER_BIG>,
}

impl SyncEstablished {
    pub fn failed(big_handle: u8, status: Status) -> Self {
        Self {
            status,
            big_handle,
            transport_latency_usec: 0,
            nse: 0,
            bn: 0,
            pto: 0,
            irc: 0,
            max_pdu: 0,
            iso_interval: 0,
            bis_handles: Vec::new(),
        }
    }
}

/// Host-facing events. Every method runs while the engine is borrowed: calling back into
/// `BigSync` from inside one panics, so queue the work and do it after the callback returns.
pub trait HostSink {
    fn sync_established(&mut self, evt: &SyncEstablished);
    /// `reason` is the raw HCI code; a broadcaster's BIG_TERMINATE_IND reason is passed through as received.
    fn sync_lost(&mut self, big_handle: u8, reason: u8);
    fn terminate_complete(&mut self, big_handle: u8, status: Status);
    fn iso_event_complete(&mut self, big_handle: u8, event_counter: u64);
    /// SDUs queued per BIS handle during the last BIG event. Read them with `read_sdu` once
    /// this returns, e.g. from the task that runs `dispatch`.
    fn iso_rx(&mut self, bis_handles: &[u16], counts: &[u16]);
    /// Vendor codec data path, called once per SDU.
    fn codec_sdu(&mut self, bis_handle: u16, sdu: &Sdu);
}

/// BIG Info as reported by the periodic advertising receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigInfoReport {
    pub sync_handle: u16,
    pub info: BigInfo,
    /// Start of the AUX_SYNC_IND that carried the BIG Info.
    pub ref_time_usec: u32,
    pub peer_sca_ppm: u32,
}

pub trait PeriodicSync {
    fn is_synced(&self, sync_handle: u16) -> bool;
    fn big_info(&self, sync_handle: u16) -> Option<BigInfoReport>;
}

/// Everything the engine needs from the controller.
pub trait Platform: Scheduler + Baseband + SyncTimer + HostSink + PeriodicSync + AesBlock {}

impl<T> Platform for T where T: Scheduler + Baseband + SyncTimer + HostSink + PeriodicSync + AesBlock {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sdk::mcu::crypto::tests::SoftAes;

    /// Records every call the engine makes into the controller.
    #[derive(Default)]
    pub(crate) struct FakePlatform {
        pub reject_inserts: u32,
        pub remove_ok: bool,
        pub inserts: std::vec::Vec<(u8, u32, u32)>,
        pub removes: std::vec::Vec<u8>,
        pub started: std::vec::Vec<u8>,
        pub stopped: std::vec::Vec<u8>,
        pub armed: std::vec::Vec<RxSetup>,
        pub terminates: u32,
        pub timer_starts: std::vec::Vec<(u8, Duration)>,
        pub timer_stops: std::vec::Vec<u8>,
        pub established: std::vec::Vec<SyncEstablished>,
        pub lost: std::vec::Vec<(u8, u8)>,
        pub term_complete: std::vec::Vec<(u8, Status)>,
        pub event_complete: std::vec::Vec<(u8, u64)>,
        pub iso_rx: std::vec::Vec<(std::vec::Vec<u16>, std::vec::Vec<u16>)>,
        pub codec: std::vec::Vec<(u16, Sdu)>,
        pub synced: std::vec::Vec<u16>,
        pub report: Option<BigInfoReport>,
    }

    impl Scheduler for FakePlatform {
        fn insert(&mut self, big_handle: u8, due_usec: u32, duration_usec: u32) -> bool {
            if self.reject_inserts > 0 {
                self.reject_inserts -= 1;
                return false;
            }
            self.inserts.push((big_handle, due_usec, duration_usec));
            true
        }

        fn remove(&mut self, big_handle: u8) -> bool {
            self.removes.push(big_handle);
            self.remove_ok
        }
    }

    impl Baseband for FakePlatform {
        fn start(&mut self, big_handle: u8) {
            self.started.push(big_handle);
        }

        fn stop(&mut self, big_handle: u8) {
            self.stopped.push(big_handle);
        }

        fn arm_rx(&mut self, setup: &RxSetup) {
            self.armed.push(*setup);
        }

        fn set_terminate(&mut self) {
            self.terminates += 1;
        }
    }

    impl SyncTimer for FakePlatform {
        fn start(&mut self, big_handle: u8, timeout: Duration) {
            self.timer_starts.push((big_handle, timeout));
        }

        fn stop(&mut self, big_handle: u8) {
            self.timer_stops.push(big_handle);
        }
    }

    impl HostSink for FakePlatform {
        fn sync_established(&mut self, evt: &SyncEstablished) {
            self.established.push(evt.clone());
        }

        fn sync_lost(&mut self, big_handle: u8, reason: u8) {
            self.lost.push((big_handle, reason));
        }

        fn terminate_complete(&mut self, big_handle: u8, status: Status) {
            self.term_complete.push((big_handle, status));
        }

        fn iso_event_complete(&mut self, big_handle: u8, event_counter: u64) {
            self.event_complete.push((big_handle, event_counter));
        }

        fn iso_rx(&mut self, bis_handles: &[u16], counts: &[u16]) {
            self.iso_rx.push((bis_handles.to_vec(), counts.to_vec()));
        }

        fn codec_sdu(&mut self, bis_handle: u16, sdu: &Sdu) {
            self.codec.push((bis_handle, sdu.clone()));
        }
    }

    impl PeriodicSync for FakePlatform {
        fn is_synced(&self, sync_handle: u16) -> bool {
            self.synced.contains(&sync_handle)
        }

        fn big_info(&self, sync_handle: u16) -> Option<BigInfoReport> {
            self.report.filter(|r| r.sync_handle == sync_handle)
        }
    }

    impl AesBlock for FakePlatform {
        fn aes128_encrypt(&self, key: &[u8; 16], block: &mut [u8; 16]) {
            SoftAes.aes128_encrypt(key, block)
        }
    }
}
