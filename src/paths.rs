use std::path::{Path, PathBuf};

use crate::config::{ProjectIdentity, ProjectSide};
use crate::error::Result;
use crate::utils::ensure_dir;

pub const LOGS_DIR: &str = "LOGS";
pub const REPORTS_DIR: &str = "REPORTS";
pub const RESULTS_DIR: &str = "RESULTS";
pub const RUN_DIR: &str = "RUN_DIR";
pub const SCRIPTS_DIR: &str = "SCRIPTS";
pub const TEST_CASES_DIR: &str = "TESTCASES";
pub const DATA_DIR: &str = "DATA";

pub const PEX_SAMPLE_RUN_SCRIPTS_DIR: &str = "PEX_SAMPLE_RUN_SCRIPTS";
pub const ENV_SETUP_DIR: &str = "ENV_SETUP";
pub const SAMPLE_RUNSCRIPT: &str = "sample_runscript.sh";

/// Directories of the flow's working environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvDirs {
    pub root: PathBuf,
    pub logs: PathBuf,
    pub reports: PathBuf,
    pub results: PathBuf,
    pub run: PathBuf,
    pub scripts: PathBuf,
    pub test_cases: PathBuf,
    pub data: PathBuf,
}

impl EnvDirs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_owned();
        Self {
            logs: root.join(LOGS_DIR),
            reports: root.join(REPORTS_DIR),
            results: root.join(RESULTS_DIR),
            run: root.join(RUN_DIR),
            scripts: root.join(SCRIPTS_DIR),
            test_cases: root.join(TEST_CASES_DIR),
            data: root.join(DATA_DIR),
            root,
        }
    }

    /// Creates every environment directory. The root itself must exist.
    pub fn create_all(&self) -> Result<()> {
        for dir in [
            &self.logs,
            &self.reports,
            &self.results,
            &self.run,
            &self.scripts,
            &self.test_cases,
            &self.data,
        ] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

/// Canonical subdirectories of a staged test case.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StagedDir {
    Excel,
    Gds,
    LvsNetlist,
    TestBench,
    MeasureFiles,
    OtherIncludes,
    UserResults,
}

impl StagedDir {
    pub const ALL: [StagedDir; 7] = [
        StagedDir::Excel,
        StagedDir::Gds,
        StagedDir::LvsNetlist,
        StagedDir::TestBench,
        StagedDir::MeasureFiles,
        StagedDir::OtherIncludes,
        StagedDir::UserResults,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            StagedDir::Excel => "EXCEL",
            StagedDir::Gds => "GDS",
            StagedDir::LvsNetlist => "LVS_NETLIST",
            StagedDir::TestBench => "TEST_BENCH",
            StagedDir::MeasureFiles => "MEASURE_FILES",
            StagedDir::OtherIncludes => "OTHER_INCLUDES",
            StagedDir::UserResults => "USER_RESULTS",
        }
    }
}

pub fn staged_test_case_dir(
    test_cases_root: impl AsRef<Path>,
    test_case: &str,
    project_name: &str,
) -> PathBuf {
    test_cases_root.as_ref().join(test_case).join(project_name)
}

pub fn staged_subdir(staged_dir: impl AsRef<Path>, dir: StagedDir) -> PathBuf {
    staged_dir.as_ref().join(dir.dir_name())
}

pub fn gds_config_path(gds: impl AsRef<Path>) -> PathBuf {
    let gds = gds.as_ref();
    let mut name = gds.file_name().unwrap_or_default().to_owned();
    name.push(".config");
    gds.with_file_name(name)
}

fn project_key(base: &Path, project: &ProjectIdentity, metal_stack: &str) -> PathBuf {
    base.join(project.kind.as_deref().unwrap_or("UNKNOWN"))
        .join(&project.name)
        .join(project.release.as_deref().unwrap_or("UNKNOWN"))
        .join(metal_stack)
}

/// Directory in which the sample extraction for one metal stack runs.
pub fn sample_run_dir(env: &EnvDirs, project: &ProjectIdentity, metal_stack: &str) -> PathBuf {
    project_key(&env.run.join(ENV_SETUP_DIR), project, metal_stack)
}

/// Location of the persisted runscript template for one metal stack.
pub fn template_path(env: &EnvDirs, project: &ProjectIdentity, metal_stack: &str) -> PathBuf {
    project_key(
        &env.data.join(PEX_SAMPLE_RUN_SCRIPTS_DIR),
        project,
        metal_stack,
    )
    .join(SAMPLE_RUNSCRIPT)
}

fn job_key(test_case: &str, side: ProjectSide, project_name: &str, gds: &Path) -> PathBuf {
    [test_case, side.as_str(), project_name, &gds_dir_name(gds)]
        .iter()
        .collect()
}

/// Run directory of one extraction job, `RUN_DIR/<test case>/<side>/<project>/<GDS>`.
pub fn job_run_dir(
    env: &EnvDirs,
    test_case: &str,
    side: ProjectSide,
    project_name: &str,
    gds: &Path,
) -> PathBuf {
    env.run.join(job_key(test_case, side, project_name, gds))
}

/// Result directory of one extraction job.
pub fn job_result_dir(
    env: &EnvDirs,
    test_case: &str,
    side: ProjectSide,
    project_name: &str,
    gds: &Path,
) -> PathBuf {
    env.results.join(job_key(test_case, side, project_name, gds))
}

fn gds_dir_name(gds: &Path) -> String {
    gds.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_uppercase()
}

pub fn out_pex_script(run_dir: impl AsRef<Path>, gds: &Path) -> PathBuf {
    let stem = gds.file_stem().unwrap_or_default().to_string_lossy();
    run_dir.as_ref().join(format!("{stem}_PEX.sh"))
}

pub fn out_subckt(run_dir: impl AsRef<Path>, top_cell: &str) -> PathBuf {
    run_dir.as_ref().join(format!("{top_cell}.subckt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gds_paths() {
        let gds = Path::new("/tc/TC1/ProjA/GDS/cellA.gds");
        assert_eq!(
            gds_config_path(gds),
            PathBuf::from("/tc/TC1/ProjA/GDS/cellA.gds.config")
        );
        assert_eq!(
            out_pex_script("/run", gds),
            PathBuf::from("/run/cellA_PEX.sh")
        );

        let env = EnvDirs::new("/ese");
        assert_eq!(
            job_run_dir(&env, "TC1", ProjectSide::Target, "ProjA", gds),
            PathBuf::from("/ese/RUN_DIR/TC1/target/ProjA/CELLA.GDS")
        );
        assert_eq!(
            job_result_dir(&env, "TC1", ProjectSide::Reference, "ProjA", gds),
            PathBuf::from("/ese/RESULTS/TC1/reference/ProjA/CELLA.GDS")
        );
    }
}
