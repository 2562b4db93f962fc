use std::fs::canonicalize;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use crate::cli::args::Args;
use crate::cli::progress::StepContext;
use crate::config::{parse_ese_config, EseConfig};
use crate::error::EseError;
use crate::excel::{read_fields, SpreadsheetFields, XlsxSource};
use crate::paths::EnvDirs;
use crate::plan::{execute_plan, ExecutePlanParams, Flow, ProjectArgs, RunState};
use crate::staging::Icwbev;

pub mod args;
pub mod progress;

pub const BANNER: &str = r"
 _______   ________  _______
|\  ___ \ |\   ____\|\  ___ \
\ \   __/|\ \  \___|\ \   __/|
 \ \  \_|/_\ \_____  \ \  \_|/__
  \ \  \_|\ \|____|\  \ \  \_|\ \
   \ \_______\____\_\  \ \_______\
    \|_______|\_________\|_______|
             \|_________|

ESE v0.1
";

/// Merges the configuration file and the command line.
fn load_config(args: &Args) -> Result<EseConfig> {
    let mut config = match &args.config {
        Some(path) => parse_ese_config(canonicalize(path)?)?,
        None => EseConfig::default(),
    };
    if let Some(run_directory) = &args.run_directory {
        config.environment_path = run_directory.clone();
    }
    if let Some(projects_root) = &args.projects_root_directory {
        config.projects_root = projects_root.clone();
    }
    if !config.environment_path.is_dir() {
        return Err(EseError::MissingPath(config.environment_path).into());
    }
    config.environment_path = canonicalize(&config.environment_path)?;
    Ok(config)
}

pub fn run() -> Result<()> {
    let args = Args::parse();

    if args.excel_file.is_none() && args.target_project_name.is_none() {
        return Err(EseError::InvalidArgument(
            "either --excel-file or --target-project-name must be given".to_string(),
        )
        .into());
    }

    println!("{BANNER}");

    let config = load_config(&args)?;
    let env = EnvDirs::new(&config.environment_path);
    env.create_all()?;

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    crate::logging::init(&env.logs, level)?;
    log::info!("Run directory: {:?}", env.root);
    log::info!("Projects root: {:?}", config.projects_root);

    let excel_file = args.excel_file.as_deref().map(canonicalize).transpose()?;
    let fields = match excel_file.as_deref() {
        Some(path) => {
            log::info!("Reading test case spreadsheet {path:?}");
            read_fields(&mut XlsxSource::open(path)?)?
        }
        None => SpreadsheetFields::new(),
    };

    let project_args = ProjectArgs {
        target_name: args.target_project_name.clone(),
        target_release: args.target_project_release.clone(),
        reference_name: args.reference_project_name.clone(),
        reference_release: args.reference_project_release.clone(),
    };
    let mut state = RunState::new(fields, &project_args)?;
    log::info!("Target project: {}", state.target.label());
    match &state.reference {
        Some(reference) => log::info!("Reference project: {}", reference.label()),
        None => log::info!("Reference project: none"),
    }

    let tasks = args.execute_flow.tasks();
    let layout_tool = Icwbev::new(&config.tools);

    let mut ctx = StepContext::new(&tasks);
    let res = execute_plan(ExecutePlanParams {
        config: &config,
        env: &env,
        state: &mut state,
        tasks: &tasks,
        layout_tool: &layout_tool,
        excel_file: excel_file.as_deref(),
        executed_package: args.executed_test_case_package.as_deref(),
        force_update_environment: args.execute_flow == Flow::UpdateEnvironment,
        force_update_test_case: args.force_update_test_case,
        ctx: Some(&mut ctx),
    });
    ctx.check(res)?;

    println!();
    println!("Summary:");
    println!("\tRun directory: {:?}", env.root);
    println!("\tExtraction jobs: {}", state.jobs.len());
    println!("\tLogs: {:?}", env.logs);

    Ok(())
}
