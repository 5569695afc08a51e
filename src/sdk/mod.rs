pub mod common;
pub mod mcu;
pub mod ble_app;
pub mod packet_types;
