//! Link Layer BIG synchronization: a receiver that locks onto a Broadcast Isochronous
//! Group announced over a periodic advertising train, follows its BIS events and delivers
//! the received SDUs to the host or an audio codec.

pub mod sdk;
pub mod config;
pub mod state;
pub mod app;

pub use app::{BigSync, CreateSyncParams};
pub use config::BigSyncConfig;
pub use sdk::ble_app::big_sdu::{Sdu, SduStatus};
pub use sdk::ble_app::big_sm::BigState;
pub use sdk::ble_app::ble_ll_status::Status;
pub use sdk::ble_app::rf_drv::{
    Baseband, BigInfoReport, HostSink, PeriodicSync, Platform, RxSetup, RxStatus, Scheduler, SyncEstablished,
    SyncTimer,
};
pub use sdk::mcu::crypto::AesBlock;
pub use sdk::packet_types::{BigEncInfo, BigInfo, Framing, Phy};
pub use state::{DataPath, IsoTestStats};
