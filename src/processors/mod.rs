//! Pipeline stages used by the capture and finalization paths.

mod convert_enqueue;
mod file_converter;
mod flv_fix;
mod stream_writer;

pub use convert_enqueue::new_convert_enqueue;
pub use file_converter::{new_file_converter, FileConverterOptions};
pub use flv_fix::new_flv_fixer;
pub use stream_writer::new_stream_writer;
