pub mod backoff;
pub mod canvas;
pub mod completion;
pub mod config;
pub mod error;
pub mod fail_log;
pub mod grid;
pub mod inventory;
pub mod job_script;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod mask;
pub mod merge;
pub mod mosaic;
#[cfg(feature = "netcdf")]
pub mod netcdf_codec;
pub mod output_spec;
pub mod resubmit;
pub mod retry_batch;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod synthesis;

pub use error::*;
pub use logging::init_tracing;
