/// A single cached file.
pub mod open_file;
/// Path and handle bookkeeping for cache entries.
pub mod registry;
/// Background persistence of modified entries.
pub mod uploader;
