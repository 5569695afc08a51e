pub mod ble_ll_status;
pub mod ble_ll_channel_selection;
pub mod rf_drv;
pub mod big_sm;
pub mod big_builder;
pub mod big_irq;
pub mod big_sdu;
pub mod iso_assembler;
