#[macro_use]
pub mod error;
#[macro_use]
pub mod data;
pub mod link;
pub mod rnd;
pub mod tls;
pub mod unicode;
