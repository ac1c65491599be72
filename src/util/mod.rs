pub mod debug;
pub mod logging;
