use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};

use super::TabularSource;
use crate::error::{EseError, Result};

/// Spreadsheet file (`.xlsx`, `.xls`, `.ods`) read through calamine.
pub struct XlsxSource {
    path: PathBuf,
    workbook: Sheets<BufReader<File>>,
    ranges: HashMap<String, Range<Data>>,
}

impl XlsxSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(EseError::MissingPath(path.to_owned()));
        }
        let workbook = open_workbook_auto(path).map_err(|e| EseError::Spreadsheet {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        Ok(Self {
            path: path.to_owned(),
            workbook,
            ranges: HashMap::new(),
        })
    }

    fn range(&mut self, sheet: &str) -> Result<&Range<Data>> {
        if !self.ranges.contains_key(sheet) {
            let range =
                self.workbook
                    .worksheet_range(sheet)
                    .map_err(|e| EseError::Spreadsheet {
                        path: self.path.clone(),
                        message: format!("sheet `{sheet}`: {e}"),
                    })?;
            self.ranges.insert(sheet.to_string(), range);
        }
        Ok(&self.ranges[sheet])
    }
}

impl TabularSource for XlsxSource {
    fn sheet_names(&self) -> Vec<String> {
        self.workbook.sheet_names()
    }

    fn row_count(&mut self, sheet: &str) -> Result<usize> {
        Ok(self
            .range(sheet)?
            .end()
            .map(|(row, _)| row as usize + 1)
            .unwrap_or(0))
    }

    fn cell(&mut self, sheet: &str, row: usize, col: usize) -> Result<String> {
        Ok(self
            .range(sheet)?
            .get_value((row as u32, col as u32))
            .map(|value| value.to_string())
            .unwrap_or_default())
    }
}
