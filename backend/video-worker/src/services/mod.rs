/// Service layer: queue and storage adapters, the transcoding engine and
/// the process-task use case that orchestrates them.
pub mod processor;
pub mod queue;
pub mod storage;
pub mod transcoder;
