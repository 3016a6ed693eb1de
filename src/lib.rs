pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
mod test;
pub mod utils;

pub mod prelude;
