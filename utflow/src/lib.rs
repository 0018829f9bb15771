pub mod device;
pub mod inject;
pub mod observer;
pub mod raw;
pub mod table;

pub use table::{ConnectionInfo, FlowState};
