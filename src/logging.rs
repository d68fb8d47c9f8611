use crate::error::Result;
use env_logger::{Builder, Env, Target};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Writes every record to the run log file and to stderr.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        io::stderr().flush()
    }
}

pub fn log_path(log_folder: &Path, layer_name: &str) -> PathBuf {
    log_folder.join(format!("{}.log", layer_name))
}

/// Initialize env_logger writing to `<log_folder>/<layer_name>.log` and
/// stderr. Returns the log file path.
pub fn init(log_folder: &Path, layer_name: &str, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(log_folder)?;
    let path = log_path(log_folder, layer_name);
    let file = File::create(&path)?;

    let log_level = if verbose { "debug" } else { "info" };
    let mut builder = Builder::from_env(Env::default().default_filter_or(log_level));
    builder.format_timestamp_secs();
    builder.target(Target::Pipe(Box::new(TeeWriter { file })));
    builder.init();

    Ok(path)
}
