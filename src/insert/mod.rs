pub mod format;
pub mod inserter;
