pub mod byte_source;
pub mod frame;
pub mod ingest;
pub mod probe;
pub mod queue;
pub mod video_processor;
