//! Example strategies used by the smoke harness and integration tests.

mod ma_cross;

pub use ma_cross::MaCross;
