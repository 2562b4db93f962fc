//! Test case staging.
//!
//! Copies the files a test case spreadsheet names into the canonical
//! `TESTCASES/<test case>/<CCS or PCS>` tree and produces a `.config` sidecar
//! for every staged GDS file.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tera::Context;

use crate::config::ToolsConfig;
use crate::error::{EseError, IoResultExt, Result};
use crate::excel::{SpreadsheetField, SpreadsheetFields};
use crate::paths::{gds_config_path, staged_subdir, staged_test_case_dir, StagedDir};
use crate::process::run_script;
use crate::utils::{
    copy_into, create_dirs, dir_is_non_empty, file_is_non_empty, is_tar_archive, package_stem,
    untar, write_file, UNTAR_DIR,
};
use crate::TEMPLATES;

/// Marks a path resolved inside the extracted package archive.
pub const TAR_TAG: &str = "<TAR>";
/// Marks a path resolved inside the package directory.
pub const PACKAGE_TAG: &str = "<PACKAGE>";

/// Spreadsheet fields listing files to stage, and where they go.
const CATEGORIES: [(SpreadsheetField, StagedDir); 7] = [
    (SpreadsheetField::TestBench, StagedDir::TestBench),
    (SpreadsheetField::GdsFiles, StagedDir::Gds),
    (SpreadsheetField::LvsNetlistFiles, StagedDir::LvsNetlist),
    (SpreadsheetField::MeasureFiles, StagedDir::MeasureFiles),
    (SpreadsheetField::OtherIncludes, StagedDir::OtherIncludes),
    (SpreadsheetField::MeasureResults, StagedDir::UserResults),
    (SpreadsheetField::ExtractedNetlists, StagedDir::UserResults),
];

/// Contents of a `<gds>.config` sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GdsConfig {
    pub top_cell: String,
    pub metal_stack: Option<String>,
    /// `(layer, datatype)` pairs.
    pub layers: Vec<(u32, u32)>,
}

impl GdsConfig {
    pub fn parse(text: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let malformed = |reason: String| EseError::MalformedGdsConfig {
            path: path.to_owned(),
            reason,
        };

        let mut top_cell = None;
        let mut metal_stack = None;
        let mut layers = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let mut words = line.split_whitespace();
            let (Some(key), value) = (words.next(), words.next()) else {
                continue;
            };
            let value = value.ok_or_else(|| malformed(format!("line {}: no value", i + 1)))?;
            match key {
                "TOP_CELL" => top_cell = Some(value.to_string()),
                "METAL_STACK" => metal_stack = Some(value.to_string()),
                "LAYER" => {
                    let layer = value
                        .split_once(':')
                        .and_then(|(l, dt)| Some((l.parse().ok()?, dt.parse().ok()?)))
                        .ok_or_else(|| {
                            malformed(format!("line {}: invalid layer `{value}`", i + 1))
                        })?;
                    layers.push(layer);
                }
                other => log::debug!("{path:?}: ignoring sidecar entry `{other}`"),
            }
        }

        Ok(Self {
            top_cell: top_cell.ok_or_else(|| malformed("no TOP_CELL entry".to_string()))?,
            metal_stack,
            layers,
        })
    }

    /// Reads a sidecar, which must exist and be non-empty.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !file_is_non_empty(path) {
            return Err(EseError::MissingGdsConfig(path.to_owned()));
        }
        Self::parse(&fs::read_to_string(path).at(path)?, path)
    }
}

impl Display for GdsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "TOP_CELL {}", self.top_cell)?;
        if let Some(metal_stack) = &self.metal_stack {
            writeln!(f, "METAL_STACK {metal_stack}")?;
        }
        for (layer, datatype) in self.layers.iter() {
            writeln!(f, "LAYER {layer}:{datatype}")?;
        }
        Ok(())
    }
}

/// Scratch subdirectory of [`UNTAR_DIR`] in which the layout tool runs.
pub const GDS_CONFIG_DIR: &str = "GDS_CONFIG";

/// An external tool able to describe the contents of a GDS file.
pub trait LayoutTool {
    /// Writes the [`GdsConfig`] sidecar of `gds` to `config`.
    ///
    /// Intermediate files go to the existing directory `work_dir`.
    fn write_gds_config(&self, gds: &Path, config: &Path, work_dir: &Path) -> Result<()>;
}

/// The IC Workbench layout viewer, driven by a generated Tcl macro.
pub struct Icwbev {
    shell: PathBuf,
    executable: String,
}

#[derive(Serialize)]
struct IcwbevContext {
    shell: String,
    layout_viewer: String,
    work_dir: String,
    macro_file: String,
    gds_file: String,
    config_file: String,
}

impl Icwbev {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            shell: tools.shell.clone(),
            executable: tools.layout_viewer.clone(),
        }
    }
}

impl LayoutTool for Icwbev {
    fn write_gds_config(&self, gds: &Path, config: &Path, work_dir: &Path) -> Result<()> {
        let stem = gds.file_stem().unwrap_or_default().to_string_lossy();
        let prefix = format!("{stem}_gds_config");
        let macro_file = work_dir.join(format!("{prefix}.tcl"));
        let script = work_dir.join(format!("{prefix}.sh"));

        let ctx = Context::from_serialize(IcwbevContext {
            shell: self.shell.to_string_lossy().into_owned(),
            layout_viewer: self.executable.clone(),
            work_dir: work_dir.to_string_lossy().into_owned(),
            macro_file: macro_file.to_string_lossy().into_owned(),
            gds_file: gds.to_string_lossy().into_owned(),
            config_file: config.to_string_lossy().into_owned(),
        })?;

        write_file(&macro_file, TEMPLATES.render("gds_config.tcl", &ctx)?)?;
        write_file(&script, TEMPLATES.render("gds_config.sh", &ctx)?)?;

        log::info!("Generating GDS config for {gds:?}");
        run_script(&self.shell, &script, work_dir, &prefix)?;
        Ok(())
    }
}

pub struct StageParams<'a> {
    pub fields: &'a SpreadsheetFields,
    pub test_cases_root: &'a Path,
    /// Spreadsheet the fields were read from, kept with the staged test case.
    pub excel_file: Option<&'a Path>,
    /// Re-stage a test case whose GDS files are already staged.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub package_path: PathBuf,
    pub staged_dir: PathBuf,
}

impl TestCase {
    pub fn subdir(&self, dir: StagedDir) -> PathBuf {
        staged_subdir(&self.staged_dir, dir)
    }
}

/// Resolves a spreadsheet path against the package source root.
pub fn resolve_source(source_root: &Path, item: &str) -> PathBuf {
    let item = item.trim();
    let item = item
        .strip_prefix(TAR_TAG)
        .or_else(|| item.strip_prefix(PACKAGE_TAG))
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(item);
    source_root.join(item)
}

fn source_root(package: &Path, staged_dir: &Path) -> Result<PathBuf> {
    if is_tar_archive(package) {
        let scratch = staged_dir.join(UNTAR_DIR);
        if scratch.exists() {
            fs::remove_dir_all(&scratch).at(&scratch)?;
        }
        log::info!("Extracting {package:?} into {scratch:?}");
        untar(package, &scratch)?;

        // Packages usually wrap their contents in a directory named after the archive.
        let nested = scratch.join(package_stem(package));
        Ok(if nested.is_dir() { nested } else { scratch })
    } else {
        Ok(package.to_owned())
    }
}

/// Stages the test case described by `params.fields`.
///
/// Returns `None` if the test case is already staged and `force` is not set.
pub fn stage_test_case(
    params: &StageParams,
    layout_tool: &dyn LayoutTool,
) -> Result<Option<TestCase>> {
    let StageParams {
        fields,
        test_cases_root,
        excel_file,
        force,
    } = *params;

    fields.check_required()?;

    let test_case = TestCase {
        name: fields.require(SpreadsheetField::TestCaseName)?.to_string(),
        package_path: PathBuf::from(fields.require(SpreadsheetField::PackagePath)?),
        staged_dir: staged_test_case_dir(
            test_cases_root,
            fields.require(SpreadsheetField::TestCaseName)?,
            fields.require(SpreadsheetField::CcsPcsName)?,
        ),
    };

    if dir_is_non_empty(test_case.subdir(StagedDir::Gds)) && !force {
        log::info!(
            "Test case {} is already staged in {:?}, skipping",
            test_case.name,
            test_case.staged_dir
        );
        return Ok(None);
    }

    let package = &test_case.package_path;
    if !package.exists() || !(package.is_dir() || is_tar_archive(package)) {
        return Err(EseError::MissingPath(package.to_owned()));
    }

    log::info!(
        "Staging test case {} into {:?}",
        test_case.name,
        test_case.staged_dir
    );
    for dir in StagedDir::ALL {
        create_dirs(test_case.subdir(dir))?;
    }

    let root = source_root(package, &test_case.staged_dir)?;

    let mut gds_files = Vec::new();
    for (field, dir) in CATEGORIES {
        let dest = test_case.subdir(dir);
        for item in fields.list(field) {
            let copied = copy_into(resolve_source(&root, &item), &dest)?;
            log::debug!("staged {copied:?}");
            if field == SpreadsheetField::GdsFiles {
                gds_files.push(copied);
            }
        }
    }

    let work_dir = test_case.staged_dir.join(UNTAR_DIR).join(GDS_CONFIG_DIR);
    if !gds_files.is_empty() {
        create_dirs(&work_dir)?;
    }
    for gds in gds_files.iter() {
        let config = gds_config_path(gds);
        layout_tool.write_gds_config(gds, &config, &work_dir)?;
        GdsConfig::load(&config)?;
    }

    if let Some(excel_file) = excel_file {
        copy_into(excel_file, test_case.subdir(StagedDir::Excel))?;
    }

    Ok(Some(test_case))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use walkdir::WalkDir;

    use super::*;
    use crate::excel::tests::complete_fields;

    /// Writes a sidecar naming the GDS file stem as top cell.
    pub(crate) struct FakeLayoutTool;

    impl LayoutTool for FakeLayoutTool {
        fn write_gds_config(&self, gds: &Path, config: &Path, _work_dir: &Path) -> Result<()> {
            let sidecar = GdsConfig {
                top_cell: gds.file_stem().unwrap().to_string_lossy().into_owned(),
                metal_stack: None,
                layers: vec![(1, 0), (17, 20)],
            };
            write_file(config, sidecar.to_string())
        }
    }

    struct EmptyLayoutTool;

    impl LayoutTool for EmptyLayoutTool {
        fn write_gds_config(&self, _gds: &Path, config: &Path, _work_dir: &Path) -> Result<()> {
            write_file(config, "")
        }
    }

    /// Writes a package directory holding `cellA.gds`, `cellA.cdl` and `tb.sp`.
    pub(crate) fn write_package(dir: &Path) -> PathBuf {
        let package = dir.join("tc1");
        fs::create_dir_all(package.join("tb")).unwrap();
        fs::write(package.join("cellA.gds"), "GDSII cellA").unwrap();
        fs::write(package.join("cellA.cdl"), ".subckt cellA a b\n.ends cellA\n").unwrap();
        fs::write(package.join("tb/tb.sp"), "* testbench").unwrap();
        package
    }

    pub(crate) fn fields_for(package: &Path) -> SpreadsheetFields {
        let mut fields = SpreadsheetFields::new();
        for (field, value) in complete_fields() {
            fields.set(field, value);
        }
        fields.set(
            SpreadsheetField::PackagePath,
            package.to_string_lossy().into_owned(),
        );
        fields.set(SpreadsheetField::TestBench, "<PACKAGE>/tb/tb.sp");
        fields
    }

    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(dir)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let contents = if e.file_type().is_file() {
                    fs::read(e.path()).unwrap()
                } else {
                    Vec::new()
                };
                (e.into_path(), contents)
            })
            .collect()
    }

    #[test]
    fn test_gds_config_format() {
        let text = "TOP_CELL cellA\nMETAL_STACK 13M_3Mx\nLAYER 1:0\n\nLAYER 17:20\n";
        let config = GdsConfig::parse(text, "cellA.gds.config").unwrap();
        assert_eq!(config.top_cell, "cellA");
        assert_eq!(config.metal_stack.as_deref(), Some("13M_3Mx"));
        assert_eq!(config.layers, vec![(1, 0), (17, 20)]);
        assert_eq!(config.to_string(), text.replace("\n\n", "\n"));

        assert!(matches!(
            GdsConfig::parse("LAYER 1:0\n", "x.config"),
            Err(EseError::MalformedGdsConfig { .. })
        ));
        assert!(matches!(
            GdsConfig::parse("TOP_CELL a\nLAYER one\n", "x.config"),
            Err(EseError::MalformedGdsConfig { .. })
        ));
    }

    #[test]
    fn test_resolve_source_strips_tags() {
        let root = Path::new("/pkg");
        assert_eq!(resolve_source(root, "<TAR>/gds/a.gds"), root.join("gds/a.gds"));
        assert_eq!(resolve_source(root, " <PACKAGE>a.cdl"), root.join("a.cdl"));
        assert_eq!(resolve_source(root, "a.sp"), root.join("a.sp"));
    }

    #[test]
    fn test_minimal_run() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let package = write_package(dir.path());
        let excel = dir.path().join("tc1.xlsx");
        fs::write(&excel, "xlsx").unwrap();
        let root = dir.path().join("TESTCASES");
        let fields = fields_for(&package);

        let params = StageParams {
            fields: &fields,
            test_cases_root: &root,
            excel_file: Some(&excel),
            force: false,
        };
        let test_case = stage_test_case(&params, &FakeLayoutTool)?.unwrap();

        let staged = root.join("TC1/ProjA");
        assert_eq!(test_case.staged_dir, staged);
        assert!(staged.join("GDS/cellA.gds").is_file());
        assert!(staged.join("LVS_NETLIST/cellA.cdl").is_file());
        assert!(staged.join("TEST_BENCH/tb.sp").is_file());
        assert!(staged.join("EXCEL/tc1.xlsx").is_file());
        assert!(file_is_non_empty(staged.join("GDS/cellA.gds.config")));
        assert_eq!(fs::read_dir(staged.join("GDS")).unwrap().count(), 2);
        assert!(staged.join("UNTAR/GDS_CONFIG").is_dir());
        for dir in StagedDir::ALL {
            assert!(staged.join(dir.dir_name()).is_dir());
        }
        Ok(())
    }

    #[test]
    fn test_staging_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let package = write_package(dir.path());
        let root = dir.path().join("TESTCASES");
        let fields = fields_for(&package);
        let mut params = StageParams {
            fields: &fields,
            test_cases_root: &root,
            excel_file: None,
            force: false,
        };

        assert!(stage_test_case(&params, &FakeLayoutTool)?.is_some());
        let before = snapshot(&root);

        fs::write(package.join("cellA.gds"), "GDSII cellA v2").unwrap();
        assert!(stage_test_case(&params, &FakeLayoutTool)?.is_none());
        assert_eq!(snapshot(&root), before);

        params.force = true;
        assert!(stage_test_case(&params, &FakeLayoutTool)?.is_some());
        assert_eq!(
            fs::read_to_string(root.join("TC1/ProjA/GDS/cellA.gds")).unwrap(),
            "GDSII cellA v2"
        );
        Ok(())
    }

    #[test]
    fn test_required_field_gate() {
        let dir = tempfile::tempdir().unwrap();
        let package = write_package(dir.path());
        let root = dir.path().join("TESTCASES");
        fs::create_dir(&root).unwrap();

        for missing in SpreadsheetField::REQUIRED {
            let mut fields = SpreadsheetFields::new();
            for (field, value) in fields_for(&package).iter() {
                if let Some(value) = value.filter(|_| field != *missing) {
                    fields.set(field, value);
                }
            }
            let params = StageParams {
                fields: &fields,
                test_cases_root: &root,
                excel_file: None,
                force: false,
            };
            let err = stage_test_case(&params, &FakeLayoutTool).unwrap_err();
            assert!(matches!(err, EseError::MissingFields(ref f) if f == &[*missing]));
            assert!(!dir_is_non_empty(&root), "staging touched the filesystem");
        }
    }

    #[test]
    fn test_archive_package() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let package = write_package(dir.path());
        let archive = dir.path().join("tc1.tar.gz");
        {
            let file = fs::File::create(&archive).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder.append_dir_all("tc1", &package).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        fs::remove_dir_all(&package).unwrap();

        let root = dir.path().join("TESTCASES");
        let mut fields = fields_for(&archive);
        fields.set(SpreadsheetField::GdsFiles, "<TAR>cellA.gds");
        let params = StageParams {
            fields: &fields,
            test_cases_root: &root,
            excel_file: None,
            force: false,
        };
        let test_case = stage_test_case(&params, &FakeLayoutTool)?.unwrap();

        let staged = root.join("TC1/ProjA");
        assert_eq!(test_case.staged_dir, staged);
        assert!(staged.join("UNTAR/tc1/cellA.gds").is_file());
        assert_eq!(
            fs::read_to_string(staged.join("GDS/cellA.gds")).unwrap(),
            "GDSII cellA"
        );
        assert!(staged.join("TEST_BENCH/tb.sp").is_file());
        assert!(file_is_non_empty(staged.join("GDS/cellA.gds.config")));
        Ok(())
    }

    #[test]
    fn test_missing_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let package = write_package(dir.path());
        let root = dir.path().join("TESTCASES");

        let mut fields = fields_for(&package);
        fields.set(SpreadsheetField::LvsNetlistFiles, "cellB.cdl");
        let params = StageParams {
            fields: &fields,
            test_cases_root: &root,
            excel_file: None,
            force: false,
        };
        let err = stage_test_case(&params, &FakeLayoutTool).unwrap_err();
        assert!(matches!(err, EseError::MissingPath(p) if p.ends_with("cellB.cdl")));

        let fields = fields_for(&dir.path().join("nowhere"));
        let params = StageParams {
            fields: &fields,
            force: true,
            ..params
        };
        assert!(matches!(
            stage_test_case(&params, &FakeLayoutTool),
            Err(EseError::MissingPath(_))
        ));

        let fields = fields_for(&package);
        let params = StageParams {
            fields: &fields,
            ..params
        };
        assert!(matches!(
            stage_test_case(&params, &EmptyLayoutTool),
            Err(EseError::MissingGdsConfig(_))
        ));
    }

    #[test]
    fn test_icwbev_writes_sidecar() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let viewer = dir.path().join("icwbev");
        fs::write(
            &viewer,
            "#!/bin/sh\n\
             CONFIG=$(sed -n 's/^set fp \\[open \"\\(.*\\)\" w\\]$/\\1/p' \"$3\")\n\
             printf 'TOP_CELL cellA\\nLAYER 1:0\\n' > \"$CONFIG\"\n",
        )
        .unwrap();
        crate::utils::make_executable(&viewer).unwrap();

        let gds_dir = dir.path().join("GDS");
        fs::create_dir(&gds_dir).unwrap();
        let gds = gds_dir.join("cellA.gds");
        fs::write(&gds, "GDSII").unwrap();

        let tools = ToolsConfig {
            shell: PathBuf::from("/bin/sh"),
            layout_viewer: viewer.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let work_dir = dir.path().join("UNTAR/GDS_CONFIG");
        fs::create_dir_all(&work_dir).unwrap();
        let config = gds_config_path(&gds);
        Icwbev::new(&tools).write_gds_config(&gds, &config, &work_dir)?;

        let sidecar = GdsConfig::load(&config)?;
        assert_eq!(sidecar.top_cell, "cellA");
        assert_eq!(sidecar.layers, vec![(1, 0)]);

        let names = |dir: &Path| -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        };
        assert_eq!(names(&gds_dir), ["cellA.gds", "cellA.gds.config"]);
        assert_eq!(
            names(&work_dir),
            [
                "cellA_gds_config.err",
                "cellA_gds_config.out",
                "cellA_gds_config.sh",
                "cellA_gds_config.tcl",
            ]
        );
        Ok(())
    }
}
