use std::path::PathBuf;

pub fn gdb_path() -> PathBuf {
    PathBuf::from("arm-none-eabi-gdb")
}

pub fn host() -> String {
    "localhost".to_string()
}

pub fn port() -> u16 {
    3333
}

pub fn timeout_secs() -> u64 {
    5 * 60
}

pub fn work_dir() -> PathBuf {
    std::env::temp_dir()
}
