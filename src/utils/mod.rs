pub use activity::*;
pub use cancel_token::*;
pub use core_pinner::*;
pub use health_flag::*;

mod activity;
mod cancel_token;
mod core_pinner;
mod health_flag;
pub mod logger;
pub mod params_io;
