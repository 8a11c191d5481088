use crate::definition::{Document, NodeSettings, PnpmSettings, Project, Verification};
use kdl::{KdlDocument, KdlEntry, KdlNode};
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[error("Failed parsing kiln definition")]
pub struct KilnParserCompoundError {
    #[source_code]
    pub source_code: NamedSource,
    #[related]
    pub(crate) errors: Vec<KilnParseError>,
}

#[derive(Debug, Diagnostic, Error)]
#[error("Failed rendering templates in {file}")]
pub struct TemplateRenderError {
    pub file: String,
    #[source]
    pub source: handlebars::RenderError,
}

#[derive(Debug, Diagnostic, Eq, PartialEq, Error)]
#[error("{kind}")]
pub struct KilnParseError {
    /// Offset in chars of the error.
    #[label("{}", label.unwrap_or("here"))]
    pub span: SourceSpan,

    /// Label text for this span. Defaults to `"here"`.
    pub label: Option<&'static str>,

    /// Suggestion for fixing the parser error.
    #[help]
    pub help: Option<String>,

    /// Specific error kind for this parser error.
    pub kind: &'static str,
}

const EMPTY_NODES: &[KdlNode] = &[];

pub(crate) trait GetNodes {
    fn nodes(&self) -> &[KdlNode];
}

impl GetNodes for KdlNode {
    fn nodes(&self) -> &[KdlNode] {
        self.children().map_or(EMPTY_NODES, |x| x.nodes())
    }
}

fn compound_error(
    source: &str,
    filename: Option<&str>,
    errors: Vec<KilnParseError>,
) -> KilnParserCompoundError {
    KilnParserCompoundError {
        source_code: NamedSource::new(
            filename
                .map(ToString::to_string)
                .unwrap_or_else(|| "[memory.kdl]".to_string()),
            source.to_string(),
        ),
        errors,
    }
}

pub trait ParseDocument {
    /// Fails unless the document parsed without a single error.
    fn parse_document_strict(
        input: &KdlDocument,
        source: &str,
        filename: Option<&str>,
    ) -> miette::Result<Self>
    where
        Self: Sized,
    {
        let (data, errors) = Self::parse_document_with_errors(input);

        match data {
            Some(obj) if errors.is_empty() => Ok(obj),
            _ => Err(compound_error(source, filename, errors).into()),
        }
    }

    fn parse_document_with_errors(input: &KdlDocument) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized;
}

pub trait ParseNode {
    fn parse_node_with_errors(input: &KdlNode) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized;
}

#[macro_export]
macro_rules! parse_string_into {
    ($input:ident, $into:expr, $errors:expr, $name:literal) => {{
        use $crate::definition::parsing::extract_single_string_value;

        match extract_single_string_value(
            $input,
            concat!($name, " missing"),
            concat!($name, " should be a string"),
            concat!("only 1 string expected for ", $name),
            concat!($name, " expected a value, property found instead"),
        ) {
            Ok(n) => $into = n.into(),
            Err(e) => $errors.push(e),
        };
    }};
}

#[macro_export]
macro_rules! parse_string_list_into {
    ($input:ident, $into:expr, $errors:expr, $name:literal) => {{
        use $crate::definition::parsing::extract_string_values;

        match extract_string_values(
            $input,
            concat!($name, " expects only string values"),
            concat!($name, " expected values, property found instead"),
        ) {
            Ok(n) => $into = n,
            Err(e) => $errors.push(e),
        };
    }};
}

fn unknown_node(node: &KdlNode, kind: &'static str, expected: &[&str]) -> KilnParseError {
    KilnParseError {
        span: *node.name().span(),
        label: Some("unknown node"),
        help: Some(format!("expected one of: {}", expected.join(", "))),
        kind,
    }
}

fn redefinition(node: &KdlNode, kind: &'static str) -> KilnParseError {
    KilnParseError {
        span: *node.span(),
        label: Some("second definition here"),
        help: None,
        kind,
    }
}

impl ParseDocument for Document {
    fn parse_document_with_errors(input: &KdlDocument) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized,
    {
        let mut project = None;
        let mut errors = vec![];

        for node in input.nodes() {
            match node.name().value() {
                "project" => {
                    if project.is_some() {
                        errors.push(redefinition(
                            node,
                            "redefinition of project, a definition describes one project",
                        ));
                        continue;
                    }

                    let (proj, err) = Project::parse_node_with_errors(node);
                    errors.extend(err);
                    project = proj;
                }

                _ => errors.push(unknown_node(node, "unknown top level node", &["project"])),
            }
        }

        match project {
            Some(project) => (Some(Document { project }), errors),
            None => {
                if errors.is_empty() {
                    errors.push(KilnParseError {
                        span: *input.span(),
                        label: None,
                        help: Some("add a `project \"<name>\" { ... }` node".to_string()),
                        kind: "definition has no project",
                    });
                }

                (None, errors)
            }
        }
    }
}

const PROJECT_CHILDREN: &[&str] = &[
    "repository",
    "directory",
    "build-script",
    "output-dir",
    "essential-files",
    "archive",
    "staging-dir",
    "node",
    "pnpm",
];

impl ParseNode for Project {
    fn parse_node_with_errors(input: &KdlNode) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized,
    {
        let mut errors: Vec<KilnParseError> = vec![];

        let mut name: Option<String> = None;
        let mut repository: Option<String> = None;
        let mut directory: Option<String> = None;
        let mut build_script: Option<String> = None;
        let mut output_dir: Option<String> = None;
        let mut essential_files: Option<Vec<String>> = None;
        let mut archive: Option<String> = None;
        let mut staging_dir: Option<String> = None;
        let mut node_settings: Option<NodeSettings> = None;
        let mut pnpm_settings: Option<PnpmSettings> = None;

        parse_string_into!(input, name, errors, "name of project");

        for node in input.nodes() {
            match node.name().value() {
                "repository" => parse_string_into!(node, repository, errors, "repository"),
                "directory" => parse_string_into!(node, directory, errors, "directory"),
                "build-script" => parse_string_into!(node, build_script, errors, "build-script"),
                "output-dir" => parse_string_into!(node, output_dir, errors, "output-dir"),
                "archive" => parse_string_into!(node, archive, errors, "archive"),
                "staging-dir" => parse_string_into!(node, staging_dir, errors, "staging-dir"),

                "essential-files" => {
                    let mut files = vec![];
                    parse_string_list_into!(node, files, errors, "essential-files");
                    essential_files = Some(files);
                }

                "node" => {
                    if node_settings.is_some() {
                        errors.push(redefinition(node, "redefinition of node settings"));
                        continue;
                    }

                    let (settings, err) = NodeSettings::parse_node_with_errors(node);
                    errors.extend(err);
                    node_settings = settings;
                }

                "pnpm" => {
                    if pnpm_settings.is_some() {
                        errors.push(redefinition(node, "redefinition of pnpm settings"));
                        continue;
                    }

                    let (settings, err) = PnpmSettings::parse_node_with_errors(node);
                    errors.extend(err);
                    pnpm_settings = settings;
                }

                _ => errors.push(unknown_node(node, "unknown project setting", PROJECT_CHILDREN)),
            }
        }

        let repository = match repository {
            Some(r) => r,
            None => {
                errors.push(KilnParseError {
                    span: *input.span(),
                    label: None,
                    help: Some("add `repository \"<git url>\"` to the project".to_string()),
                    kind: "project requires a repository",
                });
                return (None, errors);
            }
        };

        let name = match name {
            Some(n) => n,
            None => return (None, errors),
        };

        let mut project = Project::new(name, repository);

        if let Some(v) = directory {
            project.directory = v;
        }
        if let Some(v) = build_script {
            project.build_script = v;
        }
        if let Some(v) = output_dir {
            project.output_dir = v;
        }
        if let Some(v) = essential_files {
            project.essential_files = v;
        }
        if let Some(v) = archive {
            project.archive = v;
        }
        if let Some(v) = staging_dir {
            project.staging_dir = v;
        }
        if let Some(v) = node_settings {
            project.node = v;
        }
        if let Some(v) = pnpm_settings {
            project.pnpm = v;
        }

        (Some(project), errors)
    }
}

impl ParseNode for NodeSettings {
    fn parse_node_with_errors(input: &KdlNode) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized,
    {
        let mut errors = vec![];
        let mut settings = NodeSettings::default();

        for node in input.nodes() {
            match node.name().value() {
                "index" => parse_string_into!(node, settings.index, errors, "index"),
                "mirror" => parse_string_into!(node, settings.mirror, errors, "mirror"),
                "fallback" => parse_string_into!(node, settings.fallback, errors, "fallback"),
                "sha256" => {
                    let (verification, err) = Verification::parse_node_with_errors(node);
                    errors.extend(err);

                    if let Some(v) = verification {
                        settings.verification = v;
                    }
                }

                _ => errors.push(unknown_node(
                    node,
                    "unknown node setting",
                    &["index", "mirror", "fallback", "sha256"],
                )),
            }
        }

        (Some(settings), errors)
    }
}

impl ParseNode for PnpmSettings {
    fn parse_node_with_errors(input: &KdlNode) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized,
    {
        let mut errors = vec![];
        let mut settings = PnpmSettings::default();

        for node in input.nodes() {
            match node.name().value() {
                "package" => parse_string_into!(node, settings.package, errors, "package"),
                _ => errors.push(unknown_node(node, "unknown pnpm setting", &["package"])),
            }
        }

        (Some(settings), errors)
    }
}

impl ParseNode for Verification {
    /// Parses a `sha256 "<hex>"` node.
    fn parse_node_with_errors(input: &KdlNode) -> (Option<Self>, Vec<KilnParseError>)
    where
        Self: Sized,
    {
        let mut errors = vec![];
        let mut str_sha: Option<String> = None;
        parse_string_into!(input, str_sha, errors, "sha256");

        let str_sha = match str_sha {
            Some(s) => s,
            None => return (None, errors),
        };

        let span = input
            .entries()
            .first()
            .map_or(*input.span(), |entry| *entry.span());

        match hex::decode(str_sha.trim()) {
            Ok(v) => match <[u8; 32]>::try_from(v.as_slice()) {
                Ok(sha256) => (
                    Some(Verification {
                        sha256: Some(sha256),
                    }),
                    errors,
                ),
                Err(_) => {
                    errors.push(KilnParseError {
                        span,
                        label: None,
                        help: None,
                        kind: "expected 32 byte long hex string for sha256",
                    });
                    (None, errors)
                }
            },
            Err(v) => {
                errors.push(KilnParseError {
                    span,
                    label: None,
                    help: Some(format!("{}", v)),
                    kind: "invalid hex string",
                });
                (None, errors)
            }
        }
    }
}

fn span_of_entries(first: &KdlEntry, last: &KdlEntry) -> SourceSpan {
    let start = first.span().offset();
    let end = last.span().offset() + last.span().len();

    SourceSpan::new(start.into(), (end - start).into())
}

pub(crate) fn extract_single_string_value(
    input: &KdlNode,
    missing_error: &'static str,
    wrong_type_error: &'static str,
    too_many_error: &'static str,
    property_found_error: &'static str,
) -> Result<String, KilnParseError> {
    match input.entries() {
        [] => Err(KilnParseError {
            span: *input.name().span(),
            label: None,
            help: None,
            kind: missing_error,
        }),

        [entry] => {
            if entry.name().is_some() {
                return Err(KilnParseError {
                    span: *entry.span(),
                    label: None,
                    help: None,
                    kind: property_found_error,
                });
            }

            match entry.value().as_string() {
                Some(v) => Ok(v.to_string()),
                None => Err(KilnParseError {
                    span: *entry.span(),
                    label: None,
                    help: None,
                    kind: wrong_type_error,
                }),
            }
        }

        [first, .., last] => Err(KilnParseError {
            span: span_of_entries(first, last),
            label: None,
            help: None,
            kind: too_many_error,
        }),
    }
}

pub(crate) fn extract_string_values(
    input: &KdlNode,
    wrong_type_error: &'static str,
    property_found_error: &'static str,
) -> Result<Vec<String>, KilnParseError> {
    let mut values = vec![];

    for entry in input.entries() {
        if entry.name().is_some() {
            return Err(KilnParseError {
                span: *entry.span(),
                label: None,
                help: None,
                kind: property_found_error,
            });
        }

        match entry.value().as_string() {
            Some(v) => values.push(v.to_string()),
            None => {
                return Err(KilnParseError {
                    span: *entry.span(),
                    label: None,
                    help: None,
                    kind: wrong_type_error,
                })
            }
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Option<Document>, Vec<KilnParseError>) {
        let doc: KdlDocument = source.parse().unwrap();
        Document::parse_document_with_errors(&doc)
    }

    #[test]
    fn project_defaults_are_applied() {
        let (doc, errors) = parse(r#"project "web" { repository "git@example.com:web.git"; }"#);
        assert!(errors.is_empty(), "{:?}", errors);

        let project = doc.unwrap().project;
        assert_eq!(project.name, "web");
        assert_eq!(project.output_dir, "dist");
        assert_eq!(project.staging_dir, "compiled");
        assert_eq!(
            project.essential_files,
            vec!["package.json".to_string(), "package-lock.json".to_string()]
        );
    }

    #[test]
    fn settings_are_overridden() {
        let (doc, errors) = parse(
            r#"
            project "web" {
                repository "https://example.com/web.git"
                build-script "build"
                essential-files "package.json"
                node {
                    index "http://127.0.0.1/index.json"
                    fallback "v18.20.4"
                    sha256 "0000000000000000000000000000000000000000000000000000000000000001"
                }
                pnpm {
                    package "pnpm@9"
                }
            }
            "#,
        );
        assert!(errors.is_empty(), "{:?}", errors);

        let project = doc.unwrap().project;
        assert_eq!(project.build_script, "build");
        assert_eq!(project.essential_files, vec!["package.json".to_string()]);
        assert_eq!(project.node.index, "http://127.0.0.1/index.json");
        assert_eq!(project.node.fallback, "v18.20.4");
        assert_eq!(project.node.mirror, "https://nodejs.org/dist");
        assert_eq!(project.pnpm.package, "pnpm@9");

        let mut expected = [0u8; 32];
        expected[31] = 1;
        assert_eq!(project.node.verification.sha256, Some(expected));
    }

    #[test]
    fn missing_repository_is_reported() {
        let (doc, errors) = parse(r#"project "web""#);

        assert!(doc.is_none());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "project requires a repository");
    }

    #[test]
    fn empty_document_is_reported() {
        let (doc, errors) = parse("");

        assert!(doc.is_none());
        assert_eq!(errors[0].kind, "definition has no project");
    }

    #[test]
    fn bad_sha_is_reported() {
        let (_, errors) = parse(
            r#"project "web" { repository "r"; node { sha256 "abcd"; }; }"#,
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "expected 32 byte long hex string for sha256");

        let (_, errors) = parse(
            r#"project "web" { repository "r"; node { sha256 "zz"; }; }"#,
        );
        assert_eq!(errors[0].kind, "invalid hex string");
    }

    #[test]
    fn second_project_and_unknown_nodes_are_reported() {
        let (_, errors) = parse(
            r#"
            project "a" { repository "r"; }
            project "b" { repository "r"; }
            recipe "c"
            "#,
        );

        let kinds: Vec<_> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                "redefinition of project, a definition describes one project",
                "unknown top level node"
            ]
        );
    }

    #[test]
    fn too_many_values_are_reported() {
        let (_, errors) = parse(r#"project "web" { repository "a" "b"; }"#);

        assert_eq!(errors[0].kind, "only 1 string expected for repository");
    }

    #[test]
    fn strict_parse_fails_on_errors() {
        let source = r#"project "web" { repository "r"; colour "blue"; }"#;
        let doc: KdlDocument = source.parse().unwrap();

        assert!(Document::parse_document_strict(&doc, source, Some("web.kdl")).is_err());
    }
}
