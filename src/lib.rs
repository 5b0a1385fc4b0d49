#![deny(clippy::all)]

pub mod dataset;
pub mod error;
pub mod logging;
pub mod patient_map;
pub mod repository;
pub mod settings;
pub mod upload;
pub mod utils;

pub use error::{Error, ErrorKind};
pub use upload::{FileOutcome, Uploader};
pub use utils::Cid;
