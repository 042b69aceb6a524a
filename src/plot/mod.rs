pub mod download;
pub mod entity;
pub mod errors;
pub mod state;

pub use entity::{CHUNK_SIZE, Plot};
pub use errors::PlotError;
pub use state::{DownloadState, RemoteState};
