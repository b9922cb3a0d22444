//! Filesystem and socket helpers

pub mod path;
pub mod socket;
