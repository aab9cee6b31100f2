pub mod cli;
pub mod tracing_init;

#[cfg(target_os = "linux")]
pub mod gate;
#[cfg(target_os = "linux")]
pub mod watch;
