//! Extraction driver.
//!
//! Instantiates the runscript template of the matching metal stack for every
//! staged GDS file, then runs the generated scripts one after the other.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{EseConfig, ProjectIdentity, ProjectSide};
use crate::error::{EseError, IoResultExt, Result};
use crate::paths::{
    gds_config_path, job_result_dir, job_run_dir, out_pex_script, out_subckt,
    staged_test_case_dir, template_path, EnvDirs, StagedDir,
};
use crate::process::run_script;
use crate::runscript::{module_version_var, var, RunscriptTemplate, TemplateValues};
use crate::staging::{GdsConfig, TestCase};
use crate::utils::{
    create_dirs, find_files, list_files, list_subdirs, make_executable, package_stem,
    symlink_force, write_file,
};

pub const PEX_SCRIPT_SUFFIX: &str = "_PEX.sh";
pub const NETLIST_EXTENSIONS: [&str; 6] = ["cdl", "sp", "spi", "spice", "net", "netlist"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    pub test_case: String,
    pub gds_file: PathBuf,
    pub side: ProjectSide,
    pub script_path: PathBuf,
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy();
            extensions.iter().any(|e| ext.eq_ignore_ascii_case(e))
        })
        .unwrap_or(false)
}

fn is_gds(path: &Path) -> bool {
    has_extension(path, &["gds"])
}

fn is_netlist(path: &Path) -> bool {
    has_extension(path, &NETLIST_EXTENSIONS)
}

/// Finds the staged test cases to extract.
///
/// An explicitly executed package names a single test case. Otherwise every
/// test case staged for `project_name` with at least one GDS file is used.
pub fn discover_test_cases(
    test_cases_root: impl AsRef<Path>,
    project_name: &str,
    executed_package: Option<&Path>,
) -> Result<Vec<TestCase>> {
    let test_cases_root = test_cases_root.as_ref();

    if let Some(package) = executed_package {
        let name = package_stem(package);
        return Ok(vec![TestCase {
            staged_dir: staged_test_case_dir(test_cases_root, &name, project_name),
            package_path: package.to_owned(),
            name,
        }]);
    }

    let mut test_cases = Vec::new();
    for dir in list_subdirs(test_cases_root) {
        let staged_dir = dir.join(project_name);
        let gds_dir = staged_dir.join(StagedDir::Gds.dir_name());
        if !gds_dir.is_dir() || !list_files(&gds_dir)?.iter().any(|f| is_gds(f)) {
            continue;
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        test_cases.push(TestCase {
            name,
            package_path: staged_dir.clone(),
            staged_dir,
        });
    }

    if test_cases.is_empty() {
        return Err(EseError::NoTestCases(test_cases_root.to_owned()));
    }
    Ok(test_cases)
}

/// Picks the metal stack whose template extracts a GDS file.
pub fn job_metal_stack<'a>(
    sidecar: &'a GdsConfig,
    project: &'a ProjectIdentity,
    fallback: &'a str,
) -> &'a str {
    if let Some(metal_stack) = sidecar.metal_stack.as_deref() {
        return metal_stack;
    }
    match project.metal_stacks.as_slice() {
        [metal_stack] => metal_stack,
        _ => fallback,
    }
}

/// Template values coming from the project's tool setup.
pub fn project_overrides(project: &ProjectIdentity) -> TemplateValues {
    let mut values = TemplateValues::new();
    let pex_module = project.pex_tool.as_str().to_lowercase();
    let overrides = [
        (module_version_var(&pex_module), &project.pex_tool_version),
        (module_version_var("starrc"), &project.extract_tool_version),
        (var::PEX_DECK.to_string(), &project.pex_tool_deck),
        (var::PEX_OPTION_FILE.to_string(), &project.pex_tool_options),
        (var::STARRC_DECK.to_string(), &project.extract_tool_deck),
        (var::STARRC_STARCMD.to_string(), &project.extract_tool_starcmd),
    ];
    for (name, value) in overrides {
        if let Some(value) = value {
            values.set(name, value.as_str());
        }
    }
    values
}

/// Extracts the `.subckt <top_cell>` ... `.ends` block of a SPICE netlist.
pub fn extract_subckt(netlist: &str, top_cell: &str) -> Option<String> {
    let mut block: Option<Vec<&str>> = None;
    for line in netlist.lines() {
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or_default().to_ascii_lowercase();
        match block.as_mut() {
            None => {
                if keyword == ".subckt"
                    && words
                        .next()
                        .map(|name| name.eq_ignore_ascii_case(top_cell))
                        .unwrap_or(false)
                {
                    block = Some(vec![line]);
                }
            }
            Some(lines) => {
                lines.push(line);
                if keyword.starts_with(".end") {
                    break;
                }
            }
        }
    }
    block.map(|lines| {
        let mut text = lines.join("\n");
        text.push('\n');
        text
    })
}

fn find_netlist(lvs_dir: &Path, gds: &Path) -> Result<Option<PathBuf>> {
    if !lvs_dir.is_dir() {
        return Ok(None);
    }
    let netlists: Vec<PathBuf> = list_files(lvs_dir)?
        .into_iter()
        .filter(|f| is_netlist(f))
        .collect();
    let stem = gds.file_stem();
    Ok(netlists
        .iter()
        .find(|n| n.file_stem() == stem)
        .or_else(|| netlists.first())
        .cloned())
}

fn link_into(file: &Path, dir: &Path) -> Result<PathBuf> {
    let link = dir.join(file.file_name().unwrap_or_default());
    symlink_force(file, &link)?;
    Ok(link)
}

pub struct JobParams<'a> {
    pub config: &'a EseConfig,
    pub env: &'a EnvDirs,
    pub test_case: &'a TestCase,
    pub side: ProjectSide,
    pub project: &'a ProjectIdentity,
}

/// Generates the extraction script of every GDS file of a staged test case.
pub fn generate_jobs(params: &JobParams) -> Result<Vec<ExtractionJob>> {
    let JobParams {
        config,
        env,
        test_case,
        side,
        project,
    } = *params;

    let gds_dir = test_case.subdir(StagedDir::Gds);
    let lvs_dir = test_case.subdir(StagedDir::LvsNetlist);
    let overrides = project_overrides(project);

    let mut jobs = Vec::new();
    for gds in list_files(&gds_dir)?.into_iter().filter(|f| is_gds(f)) {
        let run_dir = job_run_dir(env, &test_case.name, side, &project.name, &gds);
        let result_dir = job_result_dir(env, &test_case.name, side, &project.name, &gds);
        create_dirs(&run_dir)?;
        create_dirs(&result_dir)?;

        let sidecar_path = gds_config_path(&gds);
        let sidecar = GdsConfig::load(&sidecar_path)?;
        let metal_stack = job_metal_stack(&sidecar, project, &config.fallback_metal_stack);

        let template_file = template_path(env, project, metal_stack);
        if !template_file.is_file() {
            return Err(EseError::MissingTemplate {
                metal_stack: metal_stack.to_string(),
                path: template_file,
            });
        }
        let template = RunscriptTemplate::load(&template_file)?;

        let gds_link = link_into(&gds, &run_dir)?;
        link_into(&sidecar_path, &run_dir)?;
        let netlist = find_netlist(&lvs_dir, &gds)?;
        let netlist_link = match netlist.as_deref() {
            Some(netlist) => Some(link_into(netlist, &run_dir)?),
            None => {
                log::warn!("no LVS netlist found for {gds:?} in {lvs_dir:?}");
                None
            }
        };

        let mut values = overrides.clone();
        values
            .set(var::RUN_DIR, run_dir.to_string_lossy())
            .set(var::TOP_CELL_NAME, sidecar.top_cell.as_str())
            .set(var::GDS_FILE, gds_link.to_string_lossy())
            .set(var::STREAM_FILE, gds_link.to_string_lossy())
            .set(
                var::LVS_NETLIST,
                netlist_link
                    .as_deref()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
            .set(var::OUTPUT_DIR, result_dir.to_string_lossy());

        let script_path = out_pex_script(&run_dir, &gds);
        write_file(&script_path, template.instantiate(&values))?;
        make_executable(&script_path)?;

        if let Some(netlist) = netlist.as_deref() {
            let text = fs::read_to_string(netlist).at(netlist)?;
            match extract_subckt(&text, &sidecar.top_cell) {
                Some(subckt) => write_file(out_subckt(&run_dir, &sidecar.top_cell), subckt)?,
                None => log::warn!(
                    "no subcircuit `{}` in LVS netlist {netlist:?}",
                    sidecar.top_cell
                ),
            }
        }

        log::info!(
            "Generated {side} extraction script {script_path:?} (metal stack {metal_stack})"
        );
        jobs.push(ExtractionJob {
            test_case: test_case.name.clone(),
            gds_file: gds,
            side,
            script_path,
        });
    }
    Ok(jobs)
}

/// Runs every extraction script below the run directories of `test_cases`,
/// waiting for each to exit before starting the next.
pub fn execute_jobs(
    config: &EseConfig,
    env: &EnvDirs,
    test_cases: &[TestCase],
) -> Result<Vec<PathBuf>> {
    let mut executed = Vec::new();
    for test_case in test_cases {
        let run_root = env.run.join(&test_case.name);
        if !run_root.is_dir() {
            log::warn!("no run directory for test case {}", test_case.name);
            continue;
        }
        let scripts = find_files(&run_root, true, |path| {
            path.to_string_lossy().ends_with(PEX_SCRIPT_SUFFIX)
        })?;
        for script in scripts {
            let work_dir = script.parent().unwrap_or(run_root.as_path()).to_owned();
            let prefix = script
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            log::info!("Running extraction script {script:?}");
            run_script(&config.tools.shell, &script, &work_dir, &prefix)?;
            executed.push(script);
        }
    }
    Ok(executed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PexTool;
    use crate::staging::tests::{fields_for, write_package, FakeLayoutTool};
    use crate::staging::{stage_test_case, StageParams};

    pub(crate) const TEST_TEMPLATE: &str = r#"#!/bin/sh
export MODULE_ICV_VERSION="2019.06"
export METAL_STACK=M1
export RUN_DIR=""
export TOP_CELL_NAME=""
export GDS_FILE=""
export LVS_NETLIST=""
export STREAM_FILE=""
export PEX_DECK="/decks/icv.rs"
export OUTPUT_DIR=""
cd ${RUN_DIR}
echo "${TOP_CELL_NAME} $(basename ${GDS_FILE}) $(basename ${LVS_NETLIST})" > ${OUTPUT_DIR}/${TOP_CELL_NAME}.spf
"#;

    pub(crate) fn target_project() -> ProjectIdentity {
        ProjectIdentity::builder()
            .kind("ccs")
            .name("ProjA")
            .release("R1")
            .metal_stacks(vec!["M1".to_string()])
            .pex_tool(PexTool::Icv)
            .pex_tool_version("2021.03")
            .build()
            .unwrap()
    }

    /// Stages the minimal test case and saves a template for metal stack `M1`.
    fn setup(root: &Path) -> (EseConfig, EnvDirs, TestCase) {
        let mut config = EseConfig::default();
        config.tools.shell = PathBuf::from("/bin/sh");
        let env = EnvDirs::new(root.join("ese"));
        fs::create_dir_all(&env.root).unwrap();
        env.create_all().unwrap();

        let package = write_package(root);
        let fields = fields_for(&package);
        let test_case = stage_test_case(
            &StageParams {
                fields: &fields,
                test_cases_root: &env.test_cases,
                excel_file: None,
                force: false,
            },
            &FakeLayoutTool,
        )
        .unwrap()
        .unwrap();

        RunscriptTemplate::parse(TEST_TEMPLATE)
            .save(template_path(&env, &target_project(), "M1"))
            .unwrap();
        (config, env, test_case)
    }

    #[test]
    fn test_extract_subckt() {
        let netlist = "* top\n.SUBCKT inv a y\nm0 y a vss vss nmos\n.ends inv\n\
                       .subckt cellA a b\n+ c\nx0 a b inv\n.ENDS cellA\n.subckt other\n.ends\n";
        assert_eq!(
            extract_subckt(netlist, "CELLA").as_deref(),
            Some(".subckt cellA a b\n+ c\nx0 a b inv\n.ENDS cellA\n")
        );
        assert_eq!(
            extract_subckt(netlist, "inv").as_deref(),
            Some(".SUBCKT inv a y\nm0 y a vss vss nmos\n.ends inv\n")
        );
        assert_eq!(extract_subckt(netlist, "missing"), None);
    }

    #[test]
    fn test_job_metal_stack() {
        let mut sidecar = GdsConfig {
            top_cell: "cellA".to_string(),
            ..Default::default()
        };
        let mut project = target_project();
        assert_eq!(job_metal_stack(&sidecar, &project, "FALLBACK"), "M1");

        project.metal_stacks.push("M2".to_string());
        assert_eq!(job_metal_stack(&sidecar, &project, "FALLBACK"), "FALLBACK");

        sidecar.metal_stack = Some("M2".to_string());
        assert_eq!(job_metal_stack(&sidecar, &project, "FALLBACK"), "M2");
    }

    #[test]
    fn test_project_overrides() {
        let mut project = target_project();
        project.extract_tool_starcmd = Some("/decks/star.cmd".to_string());
        let values = project_overrides(&project);
        assert_eq!(values.get("MODULE_ICV_VERSION"), Some("2021.03"));
        assert_eq!(values.get(var::STARRC_STARCMD), Some("/decks/star.cmd"));
        assert_eq!(values.get(var::PEX_DECK), None);
    }

    #[test]
    fn test_generate_and_execute_jobs() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (config, env, test_case) = setup(dir.path());
        let project = target_project();

        let discovered = discover_test_cases(&env.test_cases, "ProjA", None)?;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, test_case.name);
        assert_eq!(discovered[0].staged_dir, test_case.staged_dir);

        let jobs = generate_jobs(&JobParams {
            config: &config,
            env: &env,
            test_case: &test_case,
            side: ProjectSide::Target,
            project: &project,
        })?;

        let run_dir = env.run.join("TC1/target/ProjA/CELLA.GDS");
        assert_eq!(
            jobs,
            vec![ExtractionJob {
                test_case: "TC1".to_string(),
                gds_file: test_case.subdir(StagedDir::Gds).join("cellA.gds"),
                side: ProjectSide::Target,
                script_path: run_dir.join("cellA_PEX.sh"),
            }]
        );
        for link in ["cellA.gds", "cellA.gds.config", "cellA.cdl"] {
            let link = run_dir.join(link);
            assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        }
        assert_eq!(
            fs::read_to_string(run_dir.join("cellA.subckt")).unwrap(),
            ".subckt cellA a b\n.ends cellA\n"
        );

        let script = fs::read_to_string(&jobs[0].script_path).unwrap();
        assert!(script.contains("export TOP_CELL_NAME=\"cellA\""));
        assert!(script.contains("export MODULE_ICV_VERSION=\"2021.03\""));
        assert!(script.contains("export PEX_DECK=\"/decks/icv.rs\""));
        let gds_link = run_dir.join("cellA.gds");
        assert!(script.contains(&format!("export STREAM_FILE=\"{}\"", gds_link.display())));

        // Scripts inside scratch directories are never run.
        let scratch = env.run.join("TC1/UNTAR");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("stale_PEX.sh"), "exit 1").unwrap();

        let executed = execute_jobs(&config, &env, &discovered)?;
        assert_eq!(executed, vec![jobs[0].script_path.clone()]);
        let result = env.results.join("TC1/target/ProjA/CELLA.GDS/cellA.spf");
        assert_eq!(
            fs::read_to_string(result).unwrap(),
            "cellA cellA.gds cellA.cdl\n"
        );
        Ok(())
    }

    #[test]
    fn test_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let (config, env, test_case) = setup(dir.path());
        let mut project = target_project();
        project.metal_stacks = vec!["M1".to_string(), "M2".to_string()];

        let err = generate_jobs(&JobParams {
            config: &config,
            env: &env,
            test_case: &test_case,
            side: ProjectSide::Target,
            project: &project,
        })
        .unwrap_err();
        assert!(matches!(
            err,
            EseError::MissingTemplate { metal_stack, .. } if metal_stack == config.fallback_metal_stack
        ));
    }

    #[test]
    fn test_discover_test_cases() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("TC2/ProjA/GDS")).unwrap();
        assert!(matches!(
            discover_test_cases(root, "ProjA", None),
            Err(EseError::NoTestCases(_))
        ));

        let explicit = discover_test_cases(root, "ProjA", Some(Path::new("/pkgs/TC7.tar.gz")))
            .unwrap();
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].name, "TC7");
        assert_eq!(explicit[0].staged_dir, root.join("TC7/ProjA"));
    }
}
