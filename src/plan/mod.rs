use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Serialize;
use tera::Context;

use crate::cli::progress::StepContext;
use crate::config::{EseConfig, PexTool, ProjectIdentity, ProjectSide};
use crate::error::{EseError, Result};
use crate::excel::{SpreadsheetField, SpreadsheetFields};
use crate::extract::{
    discover_test_cases, execute_jobs, generate_jobs, ExtractionJob, JobParams, PEX_SCRIPT_SUFFIX,
};
use crate::paths::{EnvDirs, ENV_SETUP_DIR};
use crate::setup::{generate_environment, resolve_project, EnvironmentParams};
use crate::staging::{stage_test_case, LayoutTool, StageParams};
use crate::utils::{find_files, remove_scratch_dirs, write_file};
use crate::TEMPLATES;

pub const REPORT_FILE: &str = "ese_report.txt";

/// Pipeline stages selected by `--execute-flow`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, ValueEnum)]
pub enum Flow {
    UpdateEnvironment,
    UpdateTestCase,
    Pex,
    Sim,
    Report,
    Clean,
    #[default]
    All,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    ResolveProjects,
    UpdateEnvironment,
    UpdateTestCase,
    RunPex,
    RunSim,
    GenerateReport,
    Clean,
}

impl Flow {
    pub fn tasks(&self) -> HashSet<TaskKey> {
        use TaskKey::*;
        let tasks: &[TaskKey] = match self {
            Flow::UpdateEnvironment => &[ResolveProjects, UpdateEnvironment],
            Flow::UpdateTestCase => &[UpdateTestCase],
            Flow::Pex => &[ResolveProjects, RunPex],
            Flow::Sim => &[ResolveProjects, RunSim],
            Flow::Report => &[GenerateReport],
            Flow::Clean => &[Clean],
            Flow::All => &[
                ResolveProjects,
                UpdateEnvironment,
                UpdateTestCase,
                RunPex,
                RunSim,
                GenerateReport,
                Clean,
            ],
        };
        tasks.iter().copied().collect()
    }
}

/// Project names and releases given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectArgs {
    pub target_name: Option<String>,
    pub target_release: Option<String>,
    pub reference_name: Option<String>,
    pub reference_release: Option<String>,
}

/// Spreadsheet fields describing one project side.
struct SideFields {
    name: SpreadsheetField,
    release: SpreadsheetField,
    lvs_tool: SpreadsheetField,
    lvs_tool_version: SpreadsheetField,
    lvs_deck: SpreadsheetField,
    lvs_options: SpreadsheetField,
    rcxt_version: SpreadsheetField,
    rcxt_deck: SpreadsheetField,
    rcxt_starcmd: SpreadsheetField,
    sim_tool: SpreadsheetField,
    sim_tool_version: SpreadsheetField,
}

const TARGET_FIELDS: SideFields = SideFields {
    name: SpreadsheetField::TargetCcsPcs,
    release: SpreadsheetField::TargetRelease,
    lvs_tool: SpreadsheetField::TargetLvsToolName,
    lvs_tool_version: SpreadsheetField::TargetLvsToolVersion,
    lvs_deck: SpreadsheetField::TargetLvsDeck,
    lvs_options: SpreadsheetField::TargetLvsOptions,
    rcxt_version: SpreadsheetField::TargetRcxtVersion,
    rcxt_deck: SpreadsheetField::TargetRcxtDeck,
    rcxt_starcmd: SpreadsheetField::TargetRcxtStarcmd,
    sim_tool: SpreadsheetField::TargetSimToolName,
    sim_tool_version: SpreadsheetField::TargetSimToolVersion,
};

const REFERENCE_FIELDS: SideFields = SideFields {
    name: SpreadsheetField::ReferenceCcsPcs,
    release: SpreadsheetField::ReferenceRelease,
    lvs_tool: SpreadsheetField::ReferenceLvsToolName,
    lvs_tool_version: SpreadsheetField::ReferenceLvsToolVersion,
    lvs_deck: SpreadsheetField::ReferenceLvsDeck,
    lvs_options: SpreadsheetField::ReferenceLvsOptions,
    rcxt_version: SpreadsheetField::ReferenceRcxtVersion,
    rcxt_deck: SpreadsheetField::ReferenceRcxtDeck,
    rcxt_starcmd: SpreadsheetField::ReferenceRcxtStarcmd,
    sim_tool: SpreadsheetField::ReferenceSimToolName,
    sim_tool_version: SpreadsheetField::ReferenceSimToolVersion,
};

/// Builds the identity of one project side; command line values win over
/// spreadsheet values. Returns `None` if the side names no project.
fn side_identity(
    fields: &SpreadsheetFields,
    side: &SideFields,
    name: Option<&str>,
    release: Option<&str>,
) -> Result<Option<ProjectIdentity>> {
    let Some(name) = name.or_else(|| fields.get(side.name)) else {
        return Ok(None);
    };

    let text = |field: SpreadsheetField| fields.get(field).map(str::to_string);
    let pex_tool = match fields.get(side.lvs_tool) {
        Some(tool) => tool.parse()?,
        None => PexTool::default(),
    };

    Ok(Some(ProjectIdentity {
        name: name.to_string(),
        release: release
            .map(str::to_string)
            .or_else(|| text(side.release)),
        pex_tool,
        pex_tool_version: text(side.lvs_tool_version),
        pex_tool_deck: text(side.lvs_deck),
        pex_tool_options: text(side.lvs_options),
        extract_tool_version: text(side.rcxt_version),
        extract_tool_deck: text(side.rcxt_deck),
        extract_tool_starcmd: text(side.rcxt_starcmd),
        sim_tool_name: text(side.sim_tool),
        sim_tool_version: text(side.sim_tool_version),
        ..Default::default()
    }))
}

/// Mutable state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RunState {
    pub fields: SpreadsheetFields,
    pub target: ProjectIdentity,
    /// Absent when no reference project is configured.
    pub reference: Option<ProjectIdentity>,
    pub jobs: Vec<ExtractionJob>,
}

impl RunState {
    pub fn new(fields: SpreadsheetFields, args: &ProjectArgs) -> Result<Self> {
        let target_name = args
            .target_name
            .as_deref()
            .or_else(|| fields.get(SpreadsheetField::TargetCcsPcs))
            .or_else(|| fields.get(SpreadsheetField::CcsPcsName));
        let target_release = args
            .target_release
            .as_deref()
            .or_else(|| fields.get(SpreadsheetField::TargetRelease))
            .or_else(|| fields.get(SpreadsheetField::Release));
        let target = side_identity(&fields, &TARGET_FIELDS, target_name, target_release)?
        .ok_or_else(|| EseError::InvalidArgument("no target project given".to_string()))?;
        let reference = side_identity(
            &fields,
            &REFERENCE_FIELDS,
            args.reference_name.as_deref(),
            args.reference_release.as_deref(),
        )?;

        Ok(Self {
            fields,
            target,
            reference,
            jobs: Vec::new(),
        })
    }

    /// The configured project sides, target first.
    pub fn sides(&self) -> impl Iterator<Item = (ProjectSide, &ProjectIdentity)> {
        std::iter::once((ProjectSide::Target, &self.target)).chain(
            self.reference
                .iter()
                .map(|reference| (ProjectSide::Reference, reference)),
        )
    }

    pub fn project(&self, side: ProjectSide) -> &ProjectIdentity {
        match (side, self.reference.as_ref()) {
            (ProjectSide::Reference, Some(reference)) => reference,
            _ => &self.target,
        }
    }

    /// Name of the project test cases are staged under.
    pub fn staging_project(&self) -> &str {
        self.fields
            .get(SpreadsheetField::CcsPcsName)
            .unwrap_or(&self.target.name)
    }
}

pub struct ExecutePlanParams<'a> {
    pub config: &'a EseConfig,
    pub env: &'a EnvDirs,
    pub state: &'a mut RunState,
    pub tasks: &'a HashSet<TaskKey>,
    pub layout_tool: &'a dyn LayoutTool,
    pub excel_file: Option<&'a Path>,
    pub executed_package: Option<&'a Path>,
    pub force_update_environment: bool,
    pub force_update_test_case: bool,
    pub ctx: Option<&'a mut StepContext>,
}

macro_rules! try_finish_task {
    ( $ctx:expr, $task:expr ) => {
        if let Some(ctx) = $ctx.as_mut() {
            ctx.finish($task);
        }
    };
}

macro_rules! try_execute_task {
    ( $tasks:expr, $task:expr, $body:expr, $ctx:expr) => {
        if $tasks.contains(&$task) {
            $body;
            try_finish_task!($ctx, $task);
        }
    };
}

#[derive(Serialize)]
struct ReportRow {
    test_case: String,
    side: String,
    project: String,
    gds_file: String,
    script_path: String,
}

#[derive(Serialize)]
struct ReportContext {
    date: String,
    target: String,
    reference: Option<String>,
    jobs: Vec<ReportRow>,
}

/// Lists the extraction scripts found on disk as
/// `RUN_DIR/<test case>/<side>/<project>/<GDS>/*_PEX.sh`.
fn scan_jobs(env: &EnvDirs) -> Result<Vec<ReportRow>> {
    let scripts = find_files(&env.run, true, |path| {
        path.to_string_lossy().ends_with(PEX_SCRIPT_SUFFIX)
    })?;
    Ok(scripts
        .into_iter()
        .filter_map(|script| {
            let rel = script.strip_prefix(&env.run).ok()?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            match parts.as_slice() {
                [test_case, side, project, gds, _] if test_case != ENV_SETUP_DIR => Some(ReportRow {
                    test_case: test_case.clone(),
                    side: side.clone(),
                    project: project.clone(),
                    gds_file: gds.clone(),
                    script_path: script.to_string_lossy().into_owned(),
                }),
                _ => None,
            }
        })
        .collect())
}

/// Writes `REPORTS/ese_report.txt` listing the extraction jobs.
pub fn write_report(env: &EnvDirs, state: &RunState) -> Result<PathBuf> {
    let jobs = if state.jobs.is_empty() {
        scan_jobs(env)?
    } else {
        state
            .jobs
            .iter()
            .map(|job| ReportRow {
                test_case: job.test_case.clone(),
                side: job.side.as_str().to_string(),
                project: state.project(job.side).name.clone(),
                gds_file: job
                    .gds_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                script_path: job.script_path.to_string_lossy().into_owned(),
            })
            .collect()
    };

    let ctx = Context::from_serialize(ReportContext {
        date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        target: state.target.label(),
        reference: state.reference.as_ref().map(ProjectIdentity::label),
        jobs,
    })?;
    let path = env.reports.join(REPORT_FILE);
    write_file(&path, TEMPLATES.render(REPORT_FILE, &ctx)?)?;
    log::info!("Report written to {path:?}");
    Ok(path)
}

fn run_simulations(state: &RunState) {
    for (side, project) in state.sides() {
        let jobs = state.jobs.iter().filter(|job| job.side == side).count();
        match project.sim_tool_name.as_deref() {
            Some(tool) => log::info!(
                "Simulation of {jobs} {side} extraction(s) planned with {tool} {}",
                project.sim_tool_version.as_deref().unwrap_or("(default version)")
            ),
            None => log::warn!("no simulation tool configured for {side} project {}", project.name),
        }
    }
}

pub fn execute_plan(params: ExecutePlanParams) -> Result<()> {
    let ExecutePlanParams {
        config,
        env,
        state,
        tasks,
        layout_tool,
        excel_file,
        executed_package,
        force_update_environment,
        force_update_test_case,
        mut ctx,
    } = params;

    env.create_all()?;

    try_execute_task!(
        tasks,
        TaskKey::ResolveProjects,
        {
            resolve_project(config, &mut state.target)?;
            match state.reference.as_mut() {
                Some(reference) => resolve_project(config, reference)?,
                None => log::info!("No reference project configured"),
            }
        },
        ctx
    );

    try_execute_task!(
        tasks,
        TaskKey::UpdateEnvironment,
        {
            for (side, project) in state.sides() {
                log::info!("Updating {side} environment of {}", project.label());
                generate_environment(&EnvironmentParams {
                    config,
                    env,
                    project,
                    force: force_update_environment,
                })?;
            }
        },
        ctx
    );

    try_execute_task!(
        tasks,
        TaskKey::UpdateTestCase,
        {
            state.fields.log_summary();
            stage_test_case(
                &StageParams {
                    fields: &state.fields,
                    test_cases_root: &env.test_cases,
                    excel_file,
                    force: force_update_test_case,
                },
                layout_tool,
            )?;
        },
        ctx
    );

    try_execute_task!(
        tasks,
        TaskKey::RunPex,
        {
            let test_cases =
                discover_test_cases(&env.test_cases, state.staging_project(), executed_package)?;
            let mut jobs = Vec::new();
            for test_case in test_cases.iter() {
                for (side, project) in state.sides() {
                    jobs.extend(generate_jobs(&JobParams {
                        config,
                        env,
                        test_case,
                        side,
                        project,
                    })?);
                }
            }
            execute_jobs(config, env, &test_cases)?;
            state.jobs = jobs;
        },
        ctx
    );

    try_execute_task!(tasks, TaskKey::RunSim, run_simulations(state), ctx);

    try_execute_task!(
        tasks,
        TaskKey::GenerateReport,
        {
            write_report(env, state)?;
        },
        ctx
    );

    try_execute_task!(
        tasks,
        TaskKey::Clean,
        {
            for root in [&env.test_cases, &env.run] {
                log::info!("Cleaning directory {root:?}");
                remove_scratch_dirs(root)?;
            }
        },
        ctx
    );

    Ok(())
}
