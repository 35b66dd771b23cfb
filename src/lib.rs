pub mod canon;
pub mod clean;
pub mod config;
pub mod db;
pub mod densemap;
pub mod error;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod load;
pub mod progress;
pub mod registry;
pub mod run;
mod signal;
pub mod stale;
pub mod task;
pub mod work;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
