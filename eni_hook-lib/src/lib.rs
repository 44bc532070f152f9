pub mod address;
pub mod config;
pub mod imds;
pub mod interface;
pub mod logging;
pub mod polling;
pub mod shell_command_ext;
pub mod trigger;
