pub mod api;
pub mod logging;
pub mod merge;
pub mod storage;
pub mod sync;
