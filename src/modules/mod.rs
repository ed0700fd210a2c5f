//! Ported probing tasks.
//!
//! Each module here is a direct port of one file under
//! `examples/original_source/src/modules/`, registered explicitly in
//! `task::lookup` rather than discovered by directory scan.

pub mod checktest;
pub mod dns;
