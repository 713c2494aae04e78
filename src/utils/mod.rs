pub mod atomic_write;
pub mod data_dir;
pub mod file_log;
pub mod paths;
pub mod sos;
