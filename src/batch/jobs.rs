//! Built-in batch jobs

use super::{BatchJob, FileFilter};
use crate::checksum::md5_file;
use crate::{Error, Result};
use std::io::Write;
use std::path::Path;

/// Separator between file name and checksum in [`ChecksumJob`] output
pub const CHECKSUM_SEPARATOR: &str = "##";

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("'{}' has no file name", path.display())))
}

/// Writes the name of each file, one per line.
#[derive(Debug, Clone, Default)]
pub struct FileListJob {
    filter: FileFilter,
}

impl FileListJob {
    /// List every file
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// List only files passing `filter`
    #[must_use]
    pub fn with_filter(filter: FileFilter) -> Self {
        Self { filter }
    }
}

impl BatchJob for FileListJob {
    fn name(&self) -> &str {
        "FileListJob"
    }

    fn process_file(&mut self, file: &Path, output: &mut dyn Write) -> Result<()> {
        writeln!(output, "{}", file_name(file)?)?;
        Ok(())
    }

    fn accepts(&self, file_name: &str) -> bool {
        self.filter.matches(file_name)
    }

    fn box_clone(&self) -> Box<dyn BatchJob> {
        Box::new(self.clone())
    }
}

/// Writes `name##md5` for each file, one per line.
#[derive(Debug, Clone, Default)]
pub struct ChecksumJob {
    filter: FileFilter,
}

impl ChecksumJob {
    /// Checksum every file
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum only files passing `filter`
    #[must_use]
    pub fn with_filter(filter: FileFilter) -> Self {
        Self { filter }
    }

    /// Format one output line, without the newline
    #[must_use]
    pub fn make_line(file_name: &str, checksum: &str) -> String {
        format!("{file_name}{CHECKSUM_SEPARATOR}{checksum}")
    }

    /// Split an output line into `(file_name, checksum)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` unless the line holds exactly one separator with
    /// text on both sides.
    pub fn parse_line(line: &str) -> Result<(String, String)> {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.split(CHECKSUM_SEPARATOR).collect();
        match parts.as_slice() {
            [name, checksum] if !name.is_empty() && !checksum.is_empty() => {
                Ok(((*name).to_string(), (*checksum).to_string()))
            }
            _ => Err(Error::InvalidInput(format!(
                "not a checksum line: '{line}'"
            ))),
        }
    }
}

impl BatchJob for ChecksumJob {
    fn name(&self) -> &str {
        "ChecksumJob"
    }

    fn process_file(&mut self, file: &Path, output: &mut dyn Write) -> Result<()> {
        let checksum = md5_file(file)?;
        writeln!(output, "{}", Self::make_line(file_name(file)?, &checksum))?;
        Ok(())
    }

    fn accepts(&self, file_name: &str) -> bool {
        self.filter.matches(file_name)
    }

    fn box_clone(&self) -> Box<dyn BatchJob> {
        Box::new(self.clone())
    }
}
