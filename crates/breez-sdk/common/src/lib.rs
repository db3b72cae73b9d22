pub mod error;
pub mod input;
pub mod invoice;
pub mod lnurl;
pub mod network;
pub mod rest;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
