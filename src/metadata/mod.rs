// ABOUTME: Metadata phase of a migration
// ABOUTME: Collects jobs, models and applications on export, re-creates and checks them on import

pub mod canonical;
pub mod collect;
pub mod materialize;
pub mod validate;

pub use collect::MetadataCollector;
pub use materialize::MaterializationResult;
