//! Test case description spreadsheet.
//!
//! Every data row carries a field name in column B, its value in column C and
//! an optional comment in column E. Field names are matched case-insensitively
//! against a fixed list of [`SpreadsheetField`]s; anything else is ignored.

use std::fmt::Display;

pub mod xlsx;

pub use xlsx::XlsxSource;

use crate::error::{EseError, Result};

const NAME_COLUMN: usize = 1;
const VALUE_COLUMN: usize = 2;
const COMMENT_COLUMN: usize = 4;
const FIRST_DATA_ROW: usize = 1;

macro_rules! spreadsheet_fields {
    ( $( $variant:ident => $name:literal ),* $(,)? ) => {
        /// A canonical test case spreadsheet field.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum SpreadsheetField {
            $( $variant ),*
        }

        impl SpreadsheetField {
            /// Every field, in spreadsheet order.
            pub const ALL: &'static [SpreadsheetField] = &[ $( SpreadsheetField::$variant ),* ];

            /// The field name as written in the spreadsheet.
            pub fn name(&self) -> &'static str {
                match self {
                    $( SpreadsheetField::$variant => $name ),*
                }
            }
        }
    };
}

spreadsheet_fields! {
    TestCaseName => "Test Case Name",
    Date => "Date",
    ContactPersons => "2 Contact Persons (email)",
    CcsPcsName => "CCS or PCS Name",
    Release => "Release",
    PackagePath => "Test Case Package Path",
    TestBench => "Test bench",
    GdsFiles => "GDS file(s)",
    LvsNetlistFiles => "LVS Netlist file(s)",
    ExtractType => "Extract Type For GDS file(s)",
    SimulationOptions => "Simulation options",
    MeasureFiles => "Measure file(s)",
    OtherIncludes => "Other Include(s)",
    MeasureResults => "Measure results",
    ExtractedNetlists => "Extract Netlist(s) - .spf file(s)",
    TargetCcsPcs => "Target CCS/PCS",
    TargetRelease => "Target Release Version",
    ReferenceCcsPcs => "Reference CCS/PCS",
    ReferenceRelease => "Reference Release Version",
    MeasuredVariables => "Measured variables",
    CriteriaComments => "Comments for criteria",
    TargetLvsToolName => "Target LVS Tool Name",
    TargetLvsToolVersion => "Target LVS Tool Version",
    ReferenceLvsToolName => "Reference LVS Tool Name",
    ReferenceLvsToolVersion => "Reference LVS Tool Version",
    TargetLvsDeck => "Target LVS deck",
    ReferenceLvsDeck => "Reference LVS deck",
    TargetLvsOptions => "Target LVS options/sourceme",
    ReferenceLvsOptions => "Reference LVS options/sourceme",
    TargetRcxtVersion => "Target RCXT version",
    ReferenceRcxtVersion => "Reference RCXT version",
    TargetRcxtDeck => "Target RCXT deck",
    ReferenceRcxtDeck => "Reference RCXT deck",
    TargetRcxtStarcmd => "Target RCXT starcmd",
    ReferenceRcxtStarcmd => "Reference RCXT starcmd",
    TargetSimToolName => "Target Simulation Tool Name",
    TargetSimToolVersion => "Target Simulation Tool Version",
    ReferenceSimToolName => "Reference Simulation Tool Name",
    ReferenceSimToolVersion => "Reference Simulation Tool Version",
    OtherComments => "Other Comments",
}

impl SpreadsheetField {
    /// Fields that must be set before a test case can be staged.
    pub const REQUIRED: &'static [SpreadsheetField] = &[
        SpreadsheetField::TestCaseName,
        SpreadsheetField::Date,
        SpreadsheetField::ContactPersons,
        SpreadsheetField::CcsPcsName,
        SpreadsheetField::Release,
        SpreadsheetField::PackagePath,
        SpreadsheetField::TestBench,
        SpreadsheetField::GdsFiles,
        SpreadsheetField::LvsNetlistFiles,
        SpreadsheetField::ExtractType,
        SpreadsheetField::TargetCcsPcs,
        SpreadsheetField::TargetRelease,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|field| field.name().eq_ignore_ascii_case(name))
    }

    #[inline]
    fn index(&self) -> usize {
        *self as usize
    }
}

impl Display for SpreadsheetField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Values of every [`SpreadsheetField`], all unset initially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetFields {
    values: Vec<Option<String>>,
}

impl Default for SpreadsheetFields {
    fn default() -> Self {
        Self {
            values: vec![None; SpreadsheetField::ALL.len()],
        }
    }
}

impl SpreadsheetFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: SpreadsheetField) -> Option<&str> {
        self.values[field.index()].as_deref()
    }

    pub fn set(&mut self, field: SpreadsheetField, value: impl Into<String>) {
        self.values[field.index()] = Some(value.into());
    }

    pub fn is_set(&self, field: SpreadsheetField) -> bool {
        self.values[field.index()].is_some()
    }

    /// Returns the required field's value, or a [`EseError::MissingFields`] error.
    pub fn require(&self, field: SpreadsheetField) -> Result<&str> {
        self.get(field)
            .ok_or_else(|| EseError::MissingFields(vec![field]))
    }

    /// Splits a comma separated field into its trimmed, non-empty items.
    pub fn list(&self, field: SpreadsheetField) -> Vec<String> {
        self.get(field)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn check_required(&self) -> Result<()> {
        let missing: Vec<_> = SpreadsheetField::REQUIRED
            .iter()
            .copied()
            .filter(|field| !self.is_set(*field))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EseError::MissingFields(missing))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpreadsheetField, Option<&str>)> {
        SpreadsheetField::ALL
            .iter()
            .copied()
            .zip(self.values.iter().map(|v| v.as_deref()))
    }

    /// Logs the fields set by the spreadsheet, then warns about the unused ones.
    pub fn log_summary(&self) {
        log::info!("Spreadsheet options set by user:");
        for (field, value) in self.iter() {
            if let Some(value) = value {
                log::info!("\t{:<40}{}", field.name(), value);
            }
        }
        for (field, value) in self.iter() {
            if value.is_none() {
                log::warn!("spreadsheet option `{}` is not used", field.name());
            }
        }
    }
}

/// A tabular resource made of named sheets of string cells.
pub trait TabularSource {
    fn sheet_names(&self) -> Vec<String>;

    /// Number of rows of `sheet`, counted from row 0.
    fn row_count(&mut self, sheet: &str) -> Result<usize>;

    /// Contents of a cell; empty if the cell does not exist.
    fn cell(&mut self, sheet: &str, row: usize, col: usize) -> Result<String>;
}

/// Scans every sheet of `source` for test case fields.
pub fn read_fields(source: &mut impl TabularSource) -> Result<SpreadsheetFields> {
    let mut fields = SpreadsheetFields::new();

    for sheet in source.sheet_names() {
        let rows = source.row_count(&sheet)?;
        for row in FIRST_DATA_ROW..rows {
            let name = source.cell(&sheet, row, NAME_COLUMN)?;
            let Some(field) = SpreadsheetField::from_name(&name) else {
                continue;
            };
            let value = source.cell(&sheet, row, VALUE_COLUMN)?;
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            fields.set(field, value);

            let comment = source.cell(&sheet, row, COMMENT_COLUMN)?;
            if !comment.trim().is_empty() {
                log::warn!(
                    "user comment on spreadsheet option `{}` (sheet `{sheet}`, line {}): {}",
                    field.name(),
                    row + 1,
                    comment.trim()
                );
            }
        }
    }

    Ok(fields)
}
