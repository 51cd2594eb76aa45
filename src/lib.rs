//! flvrec: concurrent FLV live-stream recorder with realtime repair and
//! queued transcoding.
//!
//! The crate wires the reusable engine crates (`flv`, `pipeline`, `pool`,
//! `store`, `cloudconvert`) into two services: the recorder supervisor
//! ([`recorder::Service`]) capturing live rooms to disk, and the convert
//! service ([`convert::Service`]) turning finished recordings into the
//! target container through durable queues.

pub mod config;
pub mod convert;
pub mod live;
pub mod processors;
pub mod recorder;
pub mod stream;
pub mod util;

pub use config::Config;
pub use recorder::{RecordStatus, RecorderError, Service as RecorderService, Stats};
