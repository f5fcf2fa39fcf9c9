//! Object storage backends.
//!
//! The [`backend::ObjectStore`] trait abstracts over where bytes physically
//! live.  [`aws::S3Store`] proxies to an S3-compatible service;
//! [`memory::MemoryStore`] keeps everything in process.

pub mod aws;
pub mod backend;
pub mod memory;
pub mod parts;
