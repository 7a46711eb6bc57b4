//! Rendered manifests and the renderer seam
//!
//! The engine never templates anything itself. A [`ManifestRenderer`] hands it
//! `component name -> manifests`, where every manifest is a named file that
//! may hold several YAML documents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::api::DynamicObject;
use tracing::{debug, info};

use crate::crd::ServiceMeshControlPlane;
use crate::error::{Error, Result};

/// One rendered file of a component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub content: String,
}

/// Rendered output keyed by component name
pub type RenderedManifests = BTreeMap<String, Vec<Manifest>>;

impl Manifest {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Only `.yaml` files are reconciled; notes and helpers are skipped
    pub fn is_yaml(&self) -> bool {
        self.name.ends_with(".yaml")
    }

    /// Raw documents of a multi-document file, in order
    pub fn documents(&self) -> Vec<&str> {
        let mut documents = Vec::new();
        let mut start = 0;
        let mut offset = 0;
        for line in self.content.split_inclusive('\n') {
            let trimmed = line.trim_end();
            if trimmed == "---" || trimmed.starts_with("--- ") {
                documents.push(&self.content[start..offset]);
                start = offset + line.len();
            }
            offset += line.len();
        }
        documents.push(&self.content[start..]);
        documents
    }

    /// Decode every non-empty document into an object
    ///
    /// Each entry is the decode result of one document so that a broken
    /// document does not hide its siblings.
    pub fn objects(&self) -> Vec<Result<DynamicObject>> {
        self.documents()
            .into_iter()
            .enumerate()
            .filter_map(|(index, raw)| decode_document(raw).transpose().map(|r| (index, r)))
            .map(|(index, result)| {
                result.map_err(|e| {
                    Error::ManifestError(format!(
                        "{} (document {}): {}",
                        self.name,
                        index + 1,
                        e
                    ))
                })
            })
            .collect()
    }
}

fn decode_document(raw: &str) -> Result<Option<DynamicObject>> {
    let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    if value.is_null() {
        return Ok(None);
    }
    if !value.is_mapping() {
        return Err(Error::ManifestError(
            "document is not a YAML mapping".to_string(),
        ));
    }
    Ok(Some(serde_yaml::from_value(value)?))
}

/// Produces the manifests for a control plane
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    async fn render(&self, instance: &ServiceMeshControlPlane) -> Result<RenderedManifests>;
}

/// Reads pre-rendered charts from `<root>/<spec.version>/`
///
/// Every directory holding files is a component named by its path relative to
/// the version directory, e.g. `istio/charts/pilot`. Files directly under the
/// version directory are ignored.
pub struct DirectoryRenderer {
    root: PathBuf,
}

impl DirectoryRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_tree(base: &Path) -> Result<RenderedManifests> {
        let mut rendered = RenderedManifests::new();
        let mut pending = vec![base.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&dir).map_err(|e| io_error(&dir, e))? {
                let path = entry.map_err(|e| io_error(&dir, e))?.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.is_file() {
                    files.push(path);
                }
            }
            if dir == base || files.is_empty() {
                continue;
            }

            files.sort();
            let component = component_name(base, &dir);
            let mut manifests = Vec::with_capacity(files.len());
            for file in files {
                let content = std::fs::read_to_string(&file).map_err(|e| io_error(&file, e))?;
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                manifests.push(Manifest::new(name, content));
            }
            debug!("Read {} manifests for component {}", manifests.len(), component);
            rendered.insert(component, manifests);
        }

        Ok(rendered)
    }
}

fn component_name(base: &Path, dir: &Path) -> String {
    dir.strip_prefix(base)
        .unwrap_or(dir)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::RenderError(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl ManifestRenderer for DirectoryRenderer {
    async fn render(&self, instance: &ServiceMeshControlPlane) -> Result<RenderedManifests> {
        let version = instance.spec.version.trim();
        if version.is_empty() || version.contains("..") || version.contains('/') {
            return Err(Error::RenderError(format!(
                "invalid control plane version {:?}",
                instance.spec.version
            )));
        }
        let base = self.root.join(version);
        if !base.is_dir() {
            return Err(Error::RenderError(format!(
                "no charts for version {} under {}",
                version,
                self.root.display()
            )));
        }

        let rendered = tokio::task::spawn_blocking(move || Self::read_tree(&base))
            .await
            .map_err(|e| Error::RenderError(format!("manifest reader panicked: {}", e)))??;
        info!(
            "Rendered {} components for version {}",
            rendered.len(),
            version
        );
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const TWO_DOCS: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: istio-pilot
---
# comment only
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: istio
data:
  mesh: \"---\"
";

    #[test]
    fn test_documents_split_on_separators_only() {
        let manifest = Manifest::new("pilot.yaml", TWO_DOCS);
        assert_eq!(manifest.documents().len(), 3);

        let objects: Vec<_> = manifest
            .objects()
            .into_iter()
            .map(|o| o.unwrap())
            .collect();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("istio-pilot"));
        assert_eq!(objects[1].data["data"]["mesh"], "---");
    }

    #[test]
    fn test_broken_document_does_not_hide_siblings() {
        let manifest = Manifest::new(
            "mixed.yaml",
            "kind: [unclosed\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: ok\n",
        );
        let objects = manifest.objects();
        assert_eq!(objects.len(), 2);
        assert!(matches!(objects[0], Err(Error::ManifestError(_))));
        assert!(objects[1].is_ok());
    }

    #[test]
    fn test_scalar_document_is_rejected() {
        let objects = Manifest::new("x.yaml", "just a string\n").objects();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].is_err());
    }

    #[test]
    fn test_yaml_suffix() {
        assert!(Manifest::new("a.yaml", "").is_yaml());
        assert!(!Manifest::new("NOTES.txt", "").is_yaml());
        assert!(!Manifest::new("a.yml", "").is_yaml());
    }

    fn instance(version: &str) -> ServiceMeshControlPlane {
        ServiceMeshControlPlane::new(
            "basic",
            crate::crd::ServiceMeshControlPlaneSpec {
                version: version.to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_directory_renderer_reads_components() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("v1.0");
        fs::create_dir_all(base.join("istio/charts/pilot")).unwrap();
        fs::create_dir_all(base.join("istio/charts/empty")).unwrap();
        fs::write(base.join("README.md"), "ignored").unwrap();
        fs::write(base.join("istio/crds.yaml"), "a: b\n").unwrap();
        fs::write(base.join("istio/charts/pilot/b.yaml"), "b\n").unwrap();
        fs::write(base.join("istio/charts/pilot/a.yaml"), "a\n").unwrap();

        let rendered = DirectoryRenderer::new(dir.path())
            .render(&instance("v1.0"))
            .await
            .unwrap();

        assert_eq!(
            rendered.keys().cloned().collect::<Vec<_>>(),
            vec!["istio".to_string(), "istio/charts/pilot".to_string()]
        );
        let pilot: Vec<_> = rendered["istio/charts/pilot"]
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(pilot, vec!["a.yaml", "b.yaml"]);
    }

    #[tokio::test]
    async fn test_directory_renderer_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryRenderer::new(dir.path())
            .render(&instance("v9.9"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RenderError(_)));

        assert!(DirectoryRenderer::new(dir.path())
            .render(&instance("../etc"))
            .await
            .is_err());
    }
}
