//! Download/decode pipeline with retry, de-duplication and cancellation

pub mod fetcher;
pub mod pipeline;
pub mod retry;

pub use fetcher::{open_local, ChunkStream, FetchResponse, Fetcher, HttpFetcher};
pub use pipeline::{AcquiredAudio, AcquisitionPipeline, AcquisitionTicket, ProgressCallback};
pub use retry::{RetryMachine, RetryPolicy, RetryState};
