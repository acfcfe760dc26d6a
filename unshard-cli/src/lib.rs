pub mod convert;
pub mod fetch;
pub mod logging;
pub mod merge;
pub mod paths;
pub mod scratch;
