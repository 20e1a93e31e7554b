//! Idempotent patches to persisted XML configuration documents.
//!
//! Documents are parsed into a tree, mutated, and serialized back; elements,
//! attributes and comments the patcher does not know about are carried over.
//! A document that does not exist yet (first start, before the server wrote
//! it) is not an error: the patch is skipped and retried on the next start.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::config::RepositorySpec;
use crate::fs::write_atomic;
use crate::utils::{EntrypointError, Result};

const REPOSITORIES: &str = "PluginRepositories";
const REPOSITORY: &str = "RepositoryInfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Added,
    Updated,
    Unchanged,
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchOutcome::Added => "added",
            PatchOutcome::Updated => "updated",
            PatchOutcome::Unchanged => "unchanged",
        })
    }
}

pub struct ConfigDocument {
    path: PathBuf,
    root: Element,
    dirty: bool,
}

impl ConfigDocument {
    /// Parse `path`. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EntrypointError::io_at(path, e)),
        };
        let root = Element::parse(BufReader::new(file)).map_err(|source| EntrypointError::XmlParse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            root,
            dirty: false,
        }))
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Register a repository unless one with the same URL already exists.
    pub fn ensure_repository(&mut self, repo: &RepositorySpec) -> PatchOutcome {
        if self.root.get_child(REPOSITORIES).is_none() {
            self.root
                .children
                .push(XMLNode::Element(Element::new(REPOSITORIES)));
            self.dirty = true;
        }
        let Some(section) = self.root.get_mut_child(REPOSITORIES) else {
            return PatchOutcome::Unchanged;
        };

        let exists = section
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .filter(|e| e.name == REPOSITORY)
            .any(|e| child_text(e, "Url").as_deref() == Some(repo.url.trim()));
        if exists {
            return PatchOutcome::Unchanged;
        }

        let mut entry = Element::new(REPOSITORY);
        entry.children.push(XMLNode::Element(text_element("Name", &repo.name)));
        entry.children.push(XMLNode::Element(text_element("Url", repo.url.trim())));
        entry
            .children
            .push(XMLNode::Element(text_element("Enabled", if repo.enabled { "true" } else { "false" })));
        section.children.push(XMLNode::Element(entry));
        self.dirty = true;
        PatchOutcome::Added
    }

    /// Make the root-level scalar `flag` hold `value`.
    pub fn ensure_flag(&mut self, flag: &str, value: &str) -> PatchOutcome {
        match self.root.get_mut_child(flag) {
            Some(element) => {
                let current = element.get_text().map(|t| t.trim().to_string()).unwrap_or_default();
                if current == value {
                    return PatchOutcome::Unchanged;
                }
                set_text(element, value);
                self.dirty = true;
                PatchOutcome::Updated
            }
            None => {
                self.root.children.push(XMLNode::Element(text_element(flag, value)));
                self.dirty = true;
                PatchOutcome::Added
            }
        }
    }

    /// Write back atomically if anything changed. Returns whether it wrote.
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let mut buffer = Vec::new();
        self.root.write_with_config(
            &mut buffer,
            EmitterConfig::new().perform_indent(true).indent_string("  "),
        )?;
        buffer.push(b'\n');
        write_atomic(&self.path, &buffer).map_err(|e| EntrypointError::io_at(&self.path, e))?;
        self.dirty = false;
        Ok(true)
    }
}

fn text_element(name: &str, text: &str) -> Element {
    let mut element = Element::new(name);
    element.children.push(XMLNode::Text(text.to_string()));
    element
}

fn set_text(element: &mut Element, text: &str) {
    element
        .children
        .retain(|node| !matches!(node, XMLNode::Text(_) | XMLNode::CData(_)));
    element.children.push(XMLNode::Text(text.to_string()));
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|c| c.get_text())
        .map(|t| t.trim().to_string())
}

/// Summary of one patching pass over a document
#[derive(Debug, Default)]
pub struct PatchSummary {
    /// Document absent; retried next start
    pub skipped: bool,
    pub changes: usize,
    pub written: bool,
}

/// Apply repositories and flags to the server configuration.
pub fn patch_server_config(
    path: &Path,
    repositories: &[RepositorySpec],
    flags: &[(String, String)],
) -> Result<PatchSummary> {
    let Some(mut doc) = ConfigDocument::load(path)? else {
        tracing::info!(
            path = %path.display(),
            "Server configuration not created yet, patches will be applied on next start"
        );
        return Ok(PatchSummary {
            skipped: true,
            ..PatchSummary::default()
        });
    };

    let mut summary = PatchSummary::default();
    for repo in repositories {
        let outcome = doc.ensure_repository(repo);
        if outcome != PatchOutcome::Unchanged {
            tracing::info!(repository = %repo.name, url = %repo.url, "Plugin repository {}", outcome);
            summary.changes += 1;
        }
    }
    for (flag, value) in flags {
        let outcome = doc.ensure_flag(flag, value);
        if outcome != PatchOutcome::Unchanged {
            tracing::info!(flag = %flag, value = %value, "Configuration flag {}", outcome);
            summary.changes += 1;
        }
    }

    summary.written = doc.save()?;
    Ok(summary)
}

/// Ensure scalar values in an arbitrary document (plugin configurations).
pub fn patch_values(path: &Path, values: &[(&str, &str)]) -> Result<PatchSummary> {
    let Some(mut doc) = ConfigDocument::load(path)? else {
        tracing::info!(path = %path.display(), "Document not created yet, skipping");
        return Ok(PatchSummary {
            skipped: true,
            ..PatchSummary::default()
        });
    };

    let mut summary = PatchSummary::default();
    for (name, value) in values {
        if doc.ensure_flag(name, value) != PatchOutcome::Unchanged {
            summary.changes += 1;
        }
    }
    summary.written = doc.save()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SYSTEM_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<ServerConfiguration xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <!-- managed by the server -->
  <LogFileRetentionDays>3</LogFileRetentionDays>
  <PluginRepositories>
    <RepositoryInfo>
      <Name>Jellyfin Stable</Name>
      <Url>https://repo.jellyfin.org/files/plugin/manifest.json</Url>
      <Enabled>true</Enabled>
    </RepositoryInfo>
  </PluginRepositories>
  <EnableLegacyAuthorization>false</EnableLegacyAuthorization>
</ServerConfiguration>
"#;

    fn repo(url: &str) -> RepositorySpec {
        RepositorySpec {
            name: "IAmParadox Plugins".to_string(),
            url: url.to_string(),
            enabled: true,
        }
    }

    fn write_doc(dir: &TempDir, body: &str) -> std::io::Result<PathBuf> {
        let path = dir.path().join("system.xml");
        fs::write(&path, body)?;
        Ok(path)
    }

    fn repositories(doc: &ConfigDocument) -> Vec<String> {
        doc.root()
            .get_child(REPOSITORIES)
            .map(|s| {
                s.children
                    .iter()
                    .filter_map(XMLNode::as_element)
                    .filter_map(|e| child_text(e, "Url"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_ensure_repository_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, SYSTEM_XML)?;
        let mut doc = ConfigDocument::load(&path)?.expect("document");

        let url = "https://www.iamparadox.dev/jellyfin/plugins/manifest.json";
        assert_eq!(doc.ensure_repository(&repo(url)), PatchOutcome::Added);
        assert_eq!(doc.ensure_repository(&repo(url)), PatchOutcome::Unchanged);
        doc.save()?;

        let mut reloaded = ConfigDocument::load(&path)?.expect("document");
        assert_eq!(reloaded.ensure_repository(&repo(url)), PatchOutcome::Unchanged);
        assert!(!reloaded.is_dirty());
        assert_eq!(
            repositories(&reloaded),
            vec!["https://repo.jellyfin.org/files/plugin/manifest.json", url]
        );
        Ok(())
    }

    #[test]
    fn test_repository_matched_by_url_not_name() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, SYSTEM_XML)?;
        let mut doc = ConfigDocument::load(&path)?.expect("document");

        let mut renamed = repo("https://repo.jellyfin.org/files/plugin/manifest.json");
        renamed.name = "Something Else".to_string();
        assert_eq!(doc.ensure_repository(&renamed), PatchOutcome::Unchanged);
        Ok(())
    }

    #[test]
    fn test_missing_repositories_section_created() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, "<ServerConfiguration><IsStartupWizardCompleted>true</IsStartupWizardCompleted></ServerConfiguration>")?;
        let mut doc = ConfigDocument::load(&path)?.expect("document");

        assert_eq!(doc.ensure_repository(&repo("https://example.org/manifest.json")), PatchOutcome::Added);
        assert_eq!(repositories(&doc), vec!["https://example.org/manifest.json"]);
        Ok(())
    }

    #[test]
    fn test_ensure_flag_states() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, SYSTEM_XML)?;
        let mut doc = ConfigDocument::load(&path)?.expect("document");

        assert_eq!(doc.ensure_flag("EnableLegacyAuthorization", "true"), PatchOutcome::Updated);
        assert_eq!(doc.ensure_flag("EnableLegacyAuthorization", "true"), PatchOutcome::Unchanged);
        assert_eq!(doc.ensure_flag("QuickConnectAvailable", "true"), PatchOutcome::Added);
        assert_eq!(doc.ensure_flag("LogFileRetentionDays", "3"), PatchOutcome::Unchanged);
        Ok(())
    }

    #[test]
    fn test_unknown_content_preserved() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, SYSTEM_XML)?;

        patch_server_config(
            &path,
            &[repo("https://example.org/manifest.json")],
            &[("EnableLegacyAuthorization".to_string(), "true".to_string())],
        )?;

        let written = fs::read_to_string(&path)?;
        assert!(written.contains("LogFileRetentionDays"));
        assert!(written.contains("managed by the server"));
        assert!(written.contains("xmlns:xsi"));
        assert!(written.contains("<EnableLegacyAuthorization>true</EnableLegacyAuthorization>"));
        Ok(())
    }

    #[test]
    fn test_missing_document_is_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("system.xml");

        let summary = patch_server_config(&path, &[repo("https://example.org/manifest.json")], &[])?;
        assert!(summary.skipped);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_second_pass_does_not_write() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, SYSTEM_XML)?;
        let repos = [repo("https://example.org/manifest.json")];

        let first = patch_server_config(&path, &repos, &[])?;
        let second = patch_server_config(&path, &repos, &[])?;
        assert!(first.written);
        assert_eq!(second.changes, 0);
        assert!(!second.written);
        Ok(())
    }

    #[test]
    fn test_malformed_document_is_error() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_doc(&dir, "<ServerConfiguration><Unclosed>")?;
        assert!(matches!(ConfigDocument::load(&path), Err(EntrypointError::XmlParse { .. })));
        Ok(())
    }

    #[test]
    fn test_patch_values() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("Jellyfin.Plugin.Meilisearch.xml");
        fs::write(&path, "<PluginConfiguration><Url></Url></PluginConfiguration>")?;

        let summary = patch_values(&path, &[("Url", "http://127.0.0.1:7700"), ("ApiKey", "k")])?;
        assert_eq!(summary.changes, 2);
        let doc = ConfigDocument::load(&path)?.expect("document");
        assert_eq!(child_text(doc.root(), "ApiKey").as_deref(), Some("k"));
        Ok(())
    }
}
