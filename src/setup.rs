//! Environment setup.
//!
//! Resolves where a project lives under the projects root, runs one sample
//! extraction per metal stack and turns each captured runscript into a
//! reusable template.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tera::Context;

use crate::config::{EseConfig, PexTool, ProjectIdentity};
use crate::error::{EseError, Result};
use crate::paths::{sample_run_dir, template_path, EnvDirs, SAMPLE_RUNSCRIPT};
use crate::process::run_with_timeout;
use crate::runscript::{convert_capture_file, CaptureContext};
use crate::utils::{create_dirs, file_is_non_empty, find_files, list_subdirs, write_file};
use crate::TEMPLATES;

pub const WRAPPER_SCRIPT: &str = "run_sample_pex.sh";
pub const COMMAND_SCRIPT: &str = "sample_pex.tcl";
pub const SOURCEME: &str = "sourceme.sh";
pub const CONFIG_FILE: &str = "sample_pex.config";

/// Finds the type directory under `projects_root` holding project `name`.
pub fn resolve_project_kind(projects_root: impl AsRef<Path>, name: &str) -> Result<String> {
    let projects_root = projects_root.as_ref();
    list_subdirs(projects_root)
        .into_iter()
        .find(|kind| kind.join(name).is_dir())
        .and_then(|kind| kind.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| EseError::ProjectKindNotFound {
            name: name.to_string(),
            root: projects_root.to_owned(),
        })
}

/// Returns the latest (greatest by name) release of a project.
pub fn resolve_release(projects_root: impl AsRef<Path>, kind: &str, name: &str) -> Result<String> {
    let dir = projects_root.as_ref().join(kind).join(name);
    list_subdirs(&dir)
        .into_iter()
        .filter_map(|release| release.file_name().map(|n| n.to_string_lossy().into_owned()))
        .max()
        .ok_or_else(|| EseError::ReleaseNotFound {
            name: name.to_string(),
            dir,
        })
}

fn project_home(projects_root: &Path, project: &ProjectIdentity) -> PathBuf {
    projects_root
        .join(project.kind.as_deref().unwrap_or_default())
        .join(&project.name)
        .join(project.release.as_deref().unwrap_or_default())
}

/// Lists the metal stacks of a project release.
///
/// A metal stack is a subdirectory of the release's `cad` directory containing
/// the environment descriptor. A project that already lists its metal stacks
/// is returned as-is.
pub fn resolve_metal_stacks(
    projects_root: impl AsRef<Path>,
    project: &ProjectIdentity,
    descriptor: &str,
) -> Result<Vec<String>> {
    if !project.metal_stacks.is_empty() {
        return Ok(project.metal_stacks.clone());
    }

    let cad = project_home(projects_root.as_ref(), project).join("cad");
    let stacks: Vec<String> = list_subdirs(&cad)
        .into_iter()
        .filter(|dir| dir.join(descriptor).is_file())
        .filter_map(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();

    if stacks.is_empty() {
        return Err(EseError::MetalStacksNotFound {
            name: project.name.clone(),
            dir: cad,
        });
    }
    Ok(stacks)
}

/// Fills in the project type, release and metal stacks of `project`.
pub fn resolve_project(config: &EseConfig, project: &mut ProjectIdentity) -> Result<()> {
    let root = &config.projects_root;
    let kind = match project.kind.take() {
        Some(kind) => kind,
        None => resolve_project_kind(root, &project.name)?,
    };
    let release = match project.release.take() {
        Some(release) => release,
        None => {
            let release = resolve_release(root, &kind, &project.name)?;
            log::info!(
                "No release given for project {}, using latest release {release}",
                project.name
            );
            release
        }
    };
    project.kind = Some(kind);
    project.release = Some(release);
    project.metal_stacks = resolve_metal_stacks(root, project, &config.env_descriptor)?;

    log::info!(
        "Project {} ({}) metal stacks: {}",
        project.label(),
        project.kind.as_deref().unwrap_or_default(),
        project.metal_stacks.join(", ")
    );
    Ok(())
}

/// Files of one metal stack's sample extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRun {
    pub metal_stack: String,
    pub dir: PathBuf,
    pub wrapper: PathBuf,
    /// Runscript the sample run leaves behind.
    pub capture: PathBuf,
}

#[derive(Serialize)]
struct SampleRunContext<'a> {
    shell: String,
    ude: &'a str,
    run_dir: String,
    project_home: String,
    project_kind: &'a str,
    project_name: &'a str,
    release: &'a str,
    metal_stack: &'a str,
    pex_tool: &'static str,
    pex_tool_version: Option<&'a str>,
    extract_tool_version: Option<&'a str>,
    sample_library: &'a str,
    sample_cell: &'a str,
    sourceme: &'static str,
    config: &'static str,
    command_script: &'static str,
    capture: &'static str,
}

pub struct EnvironmentParams<'a> {
    pub config: &'a EseConfig,
    pub env: &'a EnvDirs,
    pub project: &'a ProjectIdentity,
    /// Regenerate templates that already exist.
    pub force: bool,
}

/// Renders the wrapper script, command script, sourceme and config file of
/// the sample run for `metal_stack`.
pub fn write_sample_run_files(params: &EnvironmentParams, metal_stack: &str) -> Result<SampleRun> {
    let EnvironmentParams {
        config,
        env,
        project,
        ..
    } = params;

    let dir = sample_run_dir(env, project, metal_stack);
    create_dirs(&dir)?;

    let ctx = SampleRunContext {
        shell: config.tools.shell.to_string_lossy().into_owned(),
        ude: &config.tools.ude,
        run_dir: dir.to_string_lossy().into_owned(),
        project_home: project_home(&config.projects_root, project)
            .to_string_lossy()
            .into_owned(),
        project_kind: project.kind.as_deref().unwrap_or_default(),
        project_name: &project.name,
        release: project.release.as_deref().unwrap_or_default(),
        metal_stack,
        pex_tool: project.pex_tool.as_str(),
        pex_tool_version: project.pex_tool_version.as_deref(),
        extract_tool_version: project.extract_tool_version.as_deref(),
        sample_library: &config.sample_library,
        sample_cell: &config.sample_cell,
        sourceme: SOURCEME,
        config: CONFIG_FILE,
        command_script: COMMAND_SCRIPT,
        capture: SAMPLE_RUNSCRIPT,
    };
    let ctx = Context::from_serialize(ctx)?;

    for name in [WRAPPER_SCRIPT, COMMAND_SCRIPT, SOURCEME, CONFIG_FILE] {
        write_file(dir.join(name), TEMPLATES.render(name, &ctx)?)?;
    }

    Ok(SampleRun {
        metal_stack: metal_stack.to_string(),
        wrapper: dir.join(WRAPPER_SCRIPT),
        capture: dir.join(SAMPLE_RUNSCRIPT),
        dir,
    })
}

/// Runs the sample extraction wrapper, killing it once the configured wait
/// budget has elapsed.
pub fn run_sample_extraction(config: &EseConfig, run: &SampleRun) -> Result<()> {
    log::info!(
        "Running sample extraction for metal stack {} in {:?}",
        run.metal_stack,
        run.dir
    );
    let status = run_with_timeout(
        &config.tools.shell,
        &run.wrapper,
        &run.dir,
        "run_sample_pex",
        config.sample_wait(),
        config.poll_interval(),
    )?;
    if status.success() {
        log::info!(
            "Sample extraction for metal stack {} completed",
            run.metal_stack
        );
    } else {
        log::warn!(
            "Sample extraction for metal stack {} exited with {status}",
            run.metal_stack
        );
    }
    Ok(())
}

/// Checks that a sample run left a non-empty LVS report and a non-empty SPF netlist.
pub fn verify_sample_run(dir: impl AsRef<Path>, tool: PexTool) -> Result<()> {
    let dir = dir.as_ref();
    let has_output = |suffix: &str| -> Result<bool> {
        let found = find_files(dir, false, |path| {
            path.to_string_lossy().ends_with(suffix) && file_is_non_empty(path)
        })?;
        Ok(!found.is_empty())
    };

    for suffix in [tool.lvs_report_suffix(), ".spf"] {
        if !has_output(suffix)? {
            return Err(EseError::SampleRunIncomplete {
                dir: dir.to_owned(),
                missing: format!("*{suffix}"),
            });
        }
    }
    Ok(())
}

/// Generates the runscript template of every metal stack of a resolved project.
///
/// Returns the template paths. Existing templates are kept unless `force` is set.
pub fn generate_environment(params: &EnvironmentParams) -> Result<Vec<PathBuf>> {
    let EnvironmentParams {
        config,
        env,
        project,
        force,
    } = params;

    let mut templates = Vec::with_capacity(project.metal_stacks.len());
    for metal_stack in project.metal_stacks.iter() {
        let template = template_path(env, project, metal_stack);
        if !force && file_is_non_empty(&template) {
            log::info!(
                "Runscript template for {} ({metal_stack}) exists, skipping sample run",
                project.label()
            );
            templates.push(template);
            continue;
        }

        let run = write_sample_run_files(params, metal_stack)?;
        run_sample_extraction(config, &run)?;
        verify_sample_run(&run.dir, project.pex_tool)?;

        let ctx = CaptureContext {
            tool: project.pex_tool,
            run_dir: run.dir.to_string_lossy().into_owned(),
            sample_cell: config.sample_cell.clone(),
        };
        convert_capture_file(&run.capture, &template, &ctx)?;
        templates.push(template);
    }
    Ok(templates)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;

    /// Builds `<root>/<kind>/ProjA/{R1,R2}/cad/{M1,M2,docs}`, where only `M1`
    /// and `M2` hold an environment descriptor.
    pub(crate) fn projects_root(root: &Path) -> PathBuf {
        let projects = root.join("proj");
        for release in ["R1", "R2"] {
            for stack in ["M1", "M2"] {
                let dir = projects.join("ccs/ProjA").join(release).join("cad").join(stack);
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("env.tcl"), "set stack 1").unwrap();
            }
            fs::create_dir_all(projects.join("ccs/ProjA").join(release).join("cad/docs")).unwrap();
        }
        fs::create_dir_all(projects.join("pcs/ProjB/R1")).unwrap();
        projects
    }

    /// Writes a stand-in for `ude` that leaves behind a capture, an LVS report
    /// and an SPF netlist in its working directory.
    pub(crate) fn fake_ude(dir: &Path) -> PathBuf {
        let path = dir.join("fake_ude.sh");
        fs::write(
            &path,
            r#"#!/bin/sh
RUN=$(pwd)
cat > "$RUN/sample_runscript.sh" <<EOS
#!/bin/bash
module load icv/2019.06
export METAL_STACK=$METAL_STACK
icv_stream_out -lib ese_sample_lib -cell ese_sample_cell -gds $RUN/ese_sample_cell.gds
icv_nettran -sp $RUN/ese_sample_cell.cdl -outName $RUN/ese_sample_cell.net
gen_icv -foundry-rule /decks/icv.rs -top ese_sample_cell
gen_starcmd -cf /decks/star.cmd -tcad /decks/nxtgrd -output $RUN/starrc
EOS
echo "LVS clean" > "$RUN/ese_sample_cell.LVS_ERRORS"
echo "*|DSPF" > "$RUN/ese_sample_cell.spf"
"#,
        )
        .unwrap();
        crate::utils::make_executable(&path).unwrap();
        path
    }

    pub(crate) fn test_config(root: &Path) -> EseConfig {
        let mut config = EseConfig {
            environment_path: root.join("ese"),
            projects_root: projects_root(root),
            sample_wait_secs: 20,
            poll_interval_ms: 20,
            ..Default::default()
        };
        config.tools.shell = PathBuf::from("/bin/sh");
        config.tools.ude = fake_ude(root).to_string_lossy().into_owned();
        config
    }

    #[test]
    fn test_resolve_project() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        assert_eq!(resolve_project_kind(&config.projects_root, "ProjB")?, "pcs");
        assert!(matches!(
            resolve_project_kind(&config.projects_root, "ProjC"),
            Err(EseError::ProjectKindNotFound { .. })
        ));

        let mut project = ProjectIdentity::builder().name("ProjA").build().unwrap();
        resolve_project(&config, &mut project)?;
        assert_eq!(project.kind.as_deref(), Some("ccs"));
        assert_eq!(project.release.as_deref(), Some("R2"));
        assert_eq!(project.metal_stacks, vec!["M1", "M2"]);

        let mut listed = ProjectIdentity::builder()
            .name("ProjA")
            .release("R1")
            .metal_stacks(vec!["M9".to_string()])
            .build()
            .unwrap();
        resolve_project(&config, &mut listed)?;
        assert_eq!(listed.metal_stacks, vec!["M9"]);

        let mut empty = ProjectIdentity::builder().name("ProjB").build().unwrap();
        assert!(matches!(
            resolve_project(&config, &mut empty),
            Err(EseError::MetalStacksNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_verify_sample_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lvs")).unwrap();
        fs::write(dir.path().join("lvs/cell.LVS_ERRORS"), "ok").unwrap();
        fs::write(dir.path().join("cell.spf"), "").unwrap();
        let err = verify_sample_run(dir.path(), PexTool::Icv).unwrap_err();
        assert!(matches!(err, EseError::SampleRunIncomplete { missing, .. } if missing == "*.spf"));

        fs::write(dir.path().join("cell.spf"), "*|DSPF").unwrap();
        verify_sample_run(dir.path(), PexTool::Icv).unwrap();
        assert!(verify_sample_run(dir.path(), PexTool::Calibre).is_err());
    }

    #[test]
    fn test_generate_environment() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let env = EnvDirs::new(&config.environment_path);
        fs::create_dir_all(&env.root).unwrap();
        env.create_all()?;

        let mut project = ProjectIdentity::builder()
            .name("ProjA")
            .release("R1")
            .build()
            .unwrap();
        resolve_project(&config, &mut project)?;

        let params = EnvironmentParams {
            config: &config,
            env: &env,
            project: &project,
            force: false,
        };
        let templates = generate_environment(&params)?;
        assert_eq!(
            templates,
            vec![
                env.data.join("PEX_SAMPLE_RUN_SCRIPTS/ccs/ProjA/R1/M1/sample_runscript.sh"),
                env.data.join("PEX_SAMPLE_RUN_SCRIPTS/ccs/ProjA/R1/M2/sample_runscript.sh"),
            ]
        );

        let sample_dir = env.run.join("ENV_SETUP/ccs/ProjA/R1/M2");
        for name in [WRAPPER_SCRIPT, COMMAND_SCRIPT, SOURCEME, CONFIG_FILE] {
            assert!(file_is_non_empty(sample_dir.join(name)), "{name} missing");
        }
        let sourceme = fs::read_to_string(sample_dir.join(SOURCEME)).unwrap();
        assert!(sourceme.contains("export METAL_STACK=\"M2\""));
        let wrapper = fs::read_to_string(sample_dir.join(WRAPPER_SCRIPT)).unwrap();
        assert!(wrapper.lines().any(|l| l.starts_with(&format!("exec {}", config.tools.ude))));

        let template = fs::read_to_string(&templates[1]).unwrap();
        assert!(template.contains("export METAL_STACK=M2\nexport RUN_DIR=\"\"\n"));
        assert!(!template.contains(&sample_dir.to_string_lossy().into_owned()));
        assert!(template.contains("-output ${OUTPUT_DIR}"));
        assert!(template.contains("-outName ${RUN_DIR}/${TOP_CELL_NAME}.net"));
        Ok(())
    }

    #[test]
    fn test_sample_extraction_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.sample_wait_secs = 0;
        let hang = dir.path().join("hang.sh");
        fs::write(&hang, "#!/bin/sh\necho waiting for license\nexec sleep 30\n").unwrap();
        config.tools.ude = hang.to_string_lossy().into_owned();

        let env = EnvDirs::new(dir.path().join("ese"));
        let project = ProjectIdentity::builder()
            .kind("ccs")
            .name("ProjA")
            .release("R1")
            .build()
            .unwrap();
        let params = EnvironmentParams {
            config: &config,
            env: &env,
            project: &project,
            force: true,
        };
        let run = write_sample_run_files(&params, "M1").unwrap();
        crate::utils::make_executable(&hang).unwrap();

        let start = std::time::Instant::now();
        let err = run_sample_extraction(&config, &run).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, EseError::Timeout { .. }));
    }
}
