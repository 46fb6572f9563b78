//! Platform glue: Bluetooth transport, result storage, logging.

pub mod bluetooth;
pub mod logging;
pub mod result_sink;
