pub mod codec;
pub mod fake;
pub mod liar;
pub mod upstream;

pub use fake::FakeIndexTable;
pub use liar::DnsLiar;
pub use upstream::Upstream;
