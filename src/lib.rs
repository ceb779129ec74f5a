//! Report engine for recorded sampling profiles.
//!
//! [`record`] decodes the binary record file, [`symbols`] resolves
//! instruction pointers to images and symbols, [`tree`] folds samples into
//! aggregated entries with call-chain accumulation, and [`report`] ties them
//! together into the printed report.

pub mod record;
pub mod report;
pub mod symbols;
pub mod tree;
