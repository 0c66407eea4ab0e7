pub mod cli;
pub mod logging;
pub mod prompt;
pub mod server;
pub mod utils;
