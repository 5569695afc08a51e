use embassy_time::Duration;

// Table capacities. Runtime limits in `BigSyncConfig` must not exceed these.
pub const MAX_BIG: usize = 4;
pub const MAX_BIS: usize = 8;
pub const MAX_BIS_PER_BIG: usize = 4;

// BN is a 3 bit field, so at most 7 bursts per BIS event.
pub const MAX_BURST: usize = 7;

// Largest BIS PDU payload the radio can hand us (header excluded, MIC included).
pub const MAX_PDU_LEN: usize = 251;
pub const PDU_BUF_LEN: usize = 2 + MAX_PDU_LEN;
pub const PDU_POOL_SIZE: usize = 32;
// Pre-transmitted payloads held for later events, per BIG.
pub const PRE_TX_QUEUE_LEN: usize = 8;

// Depth of each BIS receive queue, drained once per BIG event by the reassembler.
pub const BIS_RX_QUEUE_LEN: usize = 16;
// Fragments of one unframed SDU held until its End fragment arrives.
pub const MAX_SDU_FRAGMENTS: usize = 8;
pub const MAX_SDU_LEN: usize = 1024;
// SDUs waiting for the host to read them, per BIS.
pub const HOST_SDU_QUEUE_LEN: usize = 8;

pub const MSG_QUEUE_LEN: usize = 16;

// BIG events skipped while looking for a free scheduler slot before giving up.
pub const MAX_SCHEDULE_ATTEMPTS: u32 = 64;

pub const BIG_HANDLE_MAX: u8 = 0xEF;
pub const SYNC_HANDLE_MAX: u16 = 0x0EFF;
pub const BIS_INDEX_MAX: u8 = 0x1F;
pub const MSE_MAX: u8 = 0x1F;
pub const SYNC_TIMEOUT_MIN: u16 = 0x000A;
pub const SYNC_TIMEOUT_MAX: u16 = 0x4000;

pub const ISO_INTERVAL_UNIT_USEC: u32 = 1250;
pub const BIG_OFFSET_UNIT_FINE_USEC: u32 = 30;
pub const BIG_OFFSET_UNIT_COARSE_USEC: u32 = 300;

#[derive(Clone, Copy, Debug)]
pub struct BigSyncConfig {
    pub num_big: usize,
    pub num_bis: usize,
    pub local_sca_ppm: u32,
    pub always_rx_duplicates: bool,
    pub notify_sdu_lost: bool,
    pub notify_iso_event_complete: bool,
    pub bis_handle_base: u16,
}

impl BigSyncConfig {
    pub const fn default() -> Self {
        Self {
            num_big: MAX_BIG,
            num_bis: MAX_BIS,
            local_sca_ppm: 50,
            always_rx_duplicates: false,
            notify_sdu_lost: true,
            notify_iso_event_complete: false,
            bis_handle_base: 0x0100,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.num_big = self.num_big.min(MAX_BIG);
        self.num_bis = self.num_bis.min(MAX_BIS);
        self
    }
}

impl Default for BigSyncConfig {
    fn default() -> Self {
        BigSyncConfig::default()
    }
}

/// Converts an HCI `BIG_Sync_Timeout` (10 ms units) to a timer duration.
pub fn sync_timeout_duration(big_sync_timeout: u16) -> Duration {
    Duration::from_millis(big_sync_timeout as u64 * 10)
}
