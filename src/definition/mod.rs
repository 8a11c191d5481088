pub mod parsing;
pub mod template;

use crate::definition::parsing::{ParseDocument, TemplateRenderError};
use crate::definition::template::TemplateReplace;
use kdl::KdlDocument;
use kiln_utils::ObjectTraversal;
use serde::Serialize;

pub const DEFAULT_DEFINITION: &str = include_str!("../../recipes/n8n.kdl");
pub const DEFAULT_DEFINITION_NAME: &str = "n8n.kdl";

#[derive(Debug, Clone)]
pub struct Document {
    pub project: Project,
}

/// Everything the workflow needs to know about the project it ships.
#[derive(Debug, Clone, ObjectTraversal)]
pub struct Project {
    pub name: String,
    pub repository: String,
    pub directory: String,
    pub build_script: String,
    pub output_dir: String,
    pub essential_files: Vec<String>,
    pub archive: String,
    pub staging_dir: String,
    pub node: NodeSettings,
    pub pnpm: PnpmSettings,
}

impl Project {
    pub fn new(name: impl Into<String>, repository: impl Into<String>) -> Self {
        Project {
            name: name.into(),
            repository: repository.into(),
            directory: "{{name}}".to_string(),
            build_script: "build:deploy".to_string(),
            output_dir: "dist".to_string(),
            essential_files: vec!["package.json".to_string(), "package-lock.json".to_string()],
            archive: "{{name}}_complete.zip".to_string(),
            staging_dir: "compiled".to_string(),
            node: NodeSettings::default(),
            pnpm: PnpmSettings::default(),
        }
    }

    pub fn template_vars(&self) -> ProjectTemplate {
        ProjectTemplate {
            name: self.name.clone(),
            repository: self.repository.clone(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ProjectTemplate {
    pub name: String,
    pub repository: String,
}

#[derive(Debug, Clone, ObjectTraversal)]
pub struct NodeSettings {
    pub index: String,
    pub mirror: String,
    pub fallback: String,
    #[skip]
    pub verification: Verification,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            index: "https://nodejs.org/dist/index.json".to_string(),
            mirror: "https://nodejs.org/dist".to_string(),
            fallback: "v20.18.0".to_string(),
            verification: Verification::default(),
        }
    }
}

#[derive(Debug, Clone, ObjectTraversal)]
pub struct PnpmSettings {
    pub package: String,
}

impl Default for PnpmSettings {
    fn default() -> Self {
        PnpmSettings {
            package: "pnpm@latest".to_string(),
        }
    }
}

#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct Verification {
    pub sha256: Option<[u8; 32]>,
}

/// Parses a definition and renders the templates in its string values.
pub fn load_project(source: &str, filename: &str) -> miette::Result<Project> {
    let kdl_document: KdlDocument = source.parse()?;
    let document = Document::parse_document_strict(&kdl_document, source, Some(filename))?;

    let mut project = document.project;
    let mut replace = TemplateReplace::new(project.template_vars());

    project
        .traverse(&mut replace)
        .map_err(|source| TemplateRenderError {
            file: filename.to_string(),
            source,
        })?;

    Ok(project)
}
