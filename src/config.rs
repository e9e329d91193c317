//! Game configuration, read from a `System40.ini`-style file: `key = value`
//! lines, string values double-quoted, possibly shift-JIS encoded. Values
//! are kept as raw bytes; only filesystem lookups go through UTF-8.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub game_name: Option<Vec<u8>>,
    /// AIN file name, from the ini's `CodeName` key.
    pub ain_filename: Option<Vec<u8>>,
    pub game_dir: PathBuf,
    pub save_dir: Option<Vec<u8>>,
}

impl Config {
    /// Configuration for running a bare `.ain` file.
    pub fn default_for(ain_path: &Path) -> Config {
        Config {
            game_name: ain_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned().into_bytes()),
            ain_filename: ain_path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned().into_bytes()),
            game_dir: ain_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            save_dir: None,
        }
    }

    pub fn from_ini(path: &Path) -> Result<Config> {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow!("Failed to read config {}: {e}", path.display()))?;
        let mut config = Config {
            game_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            ..Config::default()
        };
        for line in bytes.split(|&b| b == b'\n') {
            let Some((key, value)) = split_entry(line) else {
                continue;
            };
            match key.as_slice() {
                b"GameName" => config.game_name = Some(value),
                b"CodeName" => config.ain_filename = Some(value),
                b"SaveFolder" => config.save_dir = Some(value),
                _ => {}
            }
        }
        Ok(config)
    }

    /// Path of the AIN file named by the configuration, relative to the
    /// ini's directory.
    pub fn ain_path(&self) -> Result<PathBuf> {
        let name = self
            .ain_filename
            .as_ref()
            .ok_or_else(|| anyhow!("No AIN filename specified in configuration"))?;
        // the filesystem boundary is where bytes become a path
        let name = String::from_utf8_lossy(name);
        Ok(self.game_dir.join(name.as_ref()))
    }
}

fn split_entry(line: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let eq = line.iter().position(|&b| b == b'=')?;
    let key = trim(&line[..eq]).to_vec();
    let mut value = trim(&line[eq + 1..]);
    if value.len() >= 2 && value.first() == Some(&b'"') && value.last() == Some(&b'"') {
        value = &value[1..value.len() - 1];
    }
    if key.is_empty() {
        return None;
    }
    Some((key, value.to_vec()))
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while bytes.first().is_some_and(u8::is_ascii_whitespace) {
        bytes = &bytes[1..];
    }
    while bytes.last().is_some_and(u8::is_ascii_whitespace) {
        bytes = &bytes[..bytes.len() - 1];
    }
    bytes
}
