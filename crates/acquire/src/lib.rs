mod manager;
mod progress;
mod transfer;


pub use manager::AcquisitionManager;
pub use progress::{DownloadState, ProgressReporter};
pub use transfer::{ByteStream, HttpTransfer, Transfer, TransferResponse};
