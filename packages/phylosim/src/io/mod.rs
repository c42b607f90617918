pub mod compression;
pub mod file;
pub mod fs;
pub mod nwk;
pub mod output;
