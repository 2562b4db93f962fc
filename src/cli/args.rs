use clap::Parser;
use std::path::PathBuf;

use crate::plan::Flow;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template(
        "{before-help}{name} {version}\n{author-with-newline}{about-with-newline}\n{usage-heading} {usage}\n\n{all-args}{after-help}"
    )
)]
pub struct Args {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Test case description spreadsheet (.xlsx).
    #[arg(short, long)]
    pub excel_file: Option<PathBuf>,

    /// Target CCS/PCS project name.
    #[arg(long)]
    pub target_project_name: Option<String>,

    /// Target project release.
    #[arg(long)]
    pub target_project_release: Option<String>,

    /// Reference CCS/PCS project name. Reference steps are skipped if unset.
    #[arg(long)]
    pub reference_project_name: Option<String>,

    /// Reference project release.
    #[arg(long)]
    pub reference_project_release: Option<String>,

    /// Existing directory holding the flow environment.
    #[arg(short, long)]
    pub run_directory: Option<PathBuf>,

    /// Staged test case package to extract, instead of every staged test case.
    #[arg(long)]
    pub executed_test_case_package: Option<PathBuf>,

    /// Root directory of the CCS/PCS projects.
    #[arg(long)]
    pub projects_root_directory: Option<PathBuf>,

    /// Restage the test case even if its GDS files are already staged.
    #[arg(short, long)]
    pub force_update_test_case: bool,

    /// Pipeline stages to run.
    #[arg(long, value_enum, default_value_t = Flow::All)]
    pub execute_flow: Flow,

    /// Print debug messages.
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from([
            "ese",
            "--excel-file",
            "tc1.xlsx",
            "--reference-project-name",
            "ProjOld",
            "--execute-flow",
            "update-test-case",
            "-f",
        ]);
        assert_eq!(args.excel_file, Some(PathBuf::from("tc1.xlsx")));
        assert_eq!(args.reference_project_name.as_deref(), Some("ProjOld"));
        assert_eq!(args.execute_flow, Flow::UpdateTestCase);
        assert!(args.force_update_test_case);
        assert!(args.config.is_none());

        let args = Args::parse_from(["ese", "--target-project-name", "ProjA"]);
        assert_eq!(args.execute_flow, Flow::All);
        assert!(!args.force_update_test_case);
    }
}
