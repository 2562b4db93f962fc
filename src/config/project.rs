use std::fmt::Display;
use std::str::FromStr;

use derive_builder::Builder;

use crate::error::EseError;

/// Parasitic extraction (LVS) tool driving a project's PEX flow.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PexTool {
    #[default]
    Icv,
    Hercules,
    Calibre,
}

impl PexTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            PexTool::Icv => "ICV",
            PexTool::Hercules => "HERCULES",
            PexTool::Calibre => "CALIBRE",
        }
    }

    fn lower(&self) -> &'static str {
        match self {
            PexTool::Icv => "icv",
            PexTool::Hercules => "hercules",
            PexTool::Calibre => "calibre",
        }
    }

    /// Marker of the runscript line generating the extraction control files.
    pub fn generator_marker(&self) -> String {
        format!("gen_{}", self.lower())
    }

    /// Marker of the runscript line exporting the layout to a stream file.
    pub fn stream_out_marker(&self) -> String {
        format!("{}_stream_out", self.lower())
    }

    /// Marker of the runscript line translating the LVS netlist.
    pub fn nettran_marker(&self) -> String {
        format!("{}_nettran", self.lower())
    }

    /// Suffix of the LVS report a successful run leaves behind.
    pub fn lvs_report_suffix(&self) -> &'static str {
        match self {
            PexTool::Icv | PexTool::Hercules => ".LVS_ERRORS",
            PexTool::Calibre => ".lvs.report",
        }
    }
}

impl Display for PexTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PexTool {
    type Err = EseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ICV" => Ok(PexTool::Icv),
            "HERCULES" => Ok(PexTool::Hercules),
            "CALIBRE" => Ok(PexTool::Calibre),
            other => Err(EseError::InvalidArgument(format!(
                "unsupported PEX tool `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProjectSide {
    Target,
    Reference,
}

impl ProjectSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectSide::Target => "target",
            ProjectSide::Reference => "reference",
        }
    }
}

impl Display for ProjectSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A CCS/PCS project configuration and the tool setup used to extract it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct ProjectIdentity {
    /// Project type, i.e. the projects root subdirectory holding the project.
    pub kind: Option<String>,
    pub name: String,
    pub release: Option<String>,
    pub metal_stacks: Vec<String>,
    pub pex_tool: PexTool,
    pub pex_tool_version: Option<String>,
    pub pex_tool_deck: Option<String>,
    /// LVS options file or sourceme.
    pub pex_tool_options: Option<String>,
    pub extract_tool_version: Option<String>,
    pub extract_tool_deck: Option<String>,
    pub extract_tool_starcmd: Option<String>,
    pub sim_tool_name: Option<String>,
    pub sim_tool_version: Option<String>,
}

impl ProjectIdentity {
    #[inline]
    pub fn builder() -> ProjectIdentityBuilder {
        ProjectIdentityBuilder::default()
    }

    /// `name/release` label used in logs.
    pub fn label(&self) -> String {
        match self.release.as_deref() {
            Some(release) => format!("{}/{}", self.name, release),
            None => self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pex_tool_markers() {
        let tool: PexTool = "hercules".parse().unwrap();
        assert_eq!(tool, PexTool::Hercules);
        assert_eq!(tool.generator_marker(), "gen_hercules");
        assert_eq!(PexTool::default().nettran_marker(), "icv_nettran");
        assert!("xrc".parse::<PexTool>().is_err());
    }

    #[test]
    fn test_project_identity_builder() {
        let project = ProjectIdentity::builder()
            .name("ProjA")
            .release("R1")
            .pex_tool(PexTool::Calibre)
            .build()
            .unwrap();
        assert_eq!(project.label(), "ProjA/R1");
        assert_eq!(project.kind, None);
        assert!(project.metal_stacks.is_empty());
    }
}
