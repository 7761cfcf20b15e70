//! Segmented parallel HTTP downloader.
//!
//! A download is probed with a one-byte range request, split into up to 32
//! contiguous segments fetched concurrently into part files, and merged in
//! index order once every segment is complete.

pub mod cli;
pub mod commands;
pub mod config;
pub mod control;
pub mod downloader;
pub mod error;
pub mod hashing;
pub mod merge;
pub mod probe;
pub mod state;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use downloader::{DownloadControl, Downloader, Outcome};
pub use error::DownloadError;
