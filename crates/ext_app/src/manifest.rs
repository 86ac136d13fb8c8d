use crate::engine::WindowParams;
use crate::permissions::StoredPermission;
use crate::AppError;
use ext_storage::InstalledApplication;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

/// File name of the manifest inside an application package
pub const MANIFEST_FILE: &str = "manifest.app.toml";

/// Scheme used for package-relative resources
const APP_SCHEME: &str = "app";

/// Pages probed, in order, when the manifest names no entry point
const DEFAULT_ENTRY_PAGES: &[&str] = &[
    "index.html",
    "index.htm",
    "index.svg",
    "index.xhtml",
    "index.xht",
];

/// Parsed `manifest.app.toml`
#[derive(Debug, Deserialize, Clone)]
pub struct Manifest {
    /// App metadata and entry points
    pub app: ManifestApp,
    /// Window configuration for entry pages (optional)
    pub windows: Option<ManifestWindows>,
    /// Persistent permission decisions keyed by permission name
    #[serde(default)]
    pub permissions: BTreeMap<String, StoredPermission>,
}

/// `[app]` section
#[derive(Debug, Deserialize, Clone)]
pub struct ManifestApp {
    /// Display name of the application
    pub name: String,
    /// Unique identifier (reverse-DNS format, e.g., "com.example.myapp")
    pub identifier: String,
    /// Semantic version (e.g., "1.0.0")
    pub version: String,
    /// Background page driving the app. Enables the suspend handshake.
    pub main_document: Option<String>,
    /// Entry page URL, package-relative or absolute http(s)
    pub start_url: Option<String>,
    /// Entry page inside the package; preferred over `start_url`
    pub local_path: Option<String>,
}

/// `[windows]` section
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ManifestWindows {
    /// Default window width in pixels (default: 800)
    pub width: Option<u32>,
    /// Default window height in pixels (default: 600)
    pub height: Option<u32>,
    /// Whether windows are resizable (default: true)
    pub resizable: Option<bool>,
}

impl Manifest {
    /// Parse and validate manifest text
    pub fn parse(source: &str) -> Result<Self, AppError> {
        let manifest: Manifest = toml::from_str(source)?;

        if manifest.app.name.trim().is_empty() {
            return Err(AppError::invalid_manifest("app.name must not be empty"));
        }
        validate_identifier(&manifest.app.identifier)?;

        Ok(manifest)
    }
}

fn validate_identifier(identifier: &str) -> Result<(), AppError> {
    if identifier.is_empty() {
        return Err(AppError::invalid_manifest(
            "app.identifier must not be empty",
        ));
    }
    let valid = identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid || identifier.starts_with('.') || identifier.ends_with('.') {
        return Err(AppError::invalid_manifest(format!(
            "app.identifier '{}' must be dotted alphanumerics",
            identifier
        )));
    }
    Ok(())
}

/// Immutable description of one application package
#[derive(Debug, Clone)]
pub struct ApplicationData {
    id: String,
    path: PathBuf,
    manifest: Manifest,
    source: String,
}

impl ApplicationData {
    /// Load the manifest from a package directory
    pub fn from_dir(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let manifest_path = path.join(MANIFEST_FILE);
        let source = std::fs::read_to_string(&manifest_path).map_err(|e| {
            AppError::manifest_not_found(format!("{}: {}", manifest_path.display(), e))
        })?;
        Self::from_source(path, source)
    }

    /// Build from manifest text and the package location
    pub fn from_source(path: impl Into<PathBuf>, source: String) -> Result<Self, AppError> {
        let manifest = Manifest::parse(&source)?;
        Ok(Self {
            id: manifest.app.identifier.clone(),
            path: path.into(),
            manifest,
            source,
        })
    }

    /// Rebuild from an installed-application record
    pub fn from_installed(record: &InstalledApplication) -> Result<Self, AppError> {
        let data = Self::from_source(record.path.clone(), record.manifest.clone())?;
        if data.id != record.id {
            return Err(AppError::invalid_manifest(format!(
                "installed id '{}' does not match manifest identifier '{}'",
                record.id, data.id
            )));
        }
        Ok(data)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.app.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.app.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Manifest text as read from disk
    pub fn manifest_source(&self) -> &str {
        &self.source
    }

    pub fn window_params(&self) -> WindowParams {
        let defaults = WindowParams::default();
        let windows = self.manifest.windows.clone().unwrap_or_default();
        WindowParams {
            width: windows.width.unwrap_or(defaults.width),
            height: windows.height.unwrap_or(defaults.height),
            resizable: windows.resizable.unwrap_or(defaults.resizable),
        }
    }

    /// `app://<id>/<relative>` for a file inside the package
    pub fn resource_url(&self, relative: &str) -> Result<Url, AppError> {
        let relative = relative.trim().trim_start_matches('/');
        if relative.is_empty() {
            return Err(AppError::invalid_url("empty resource path"));
        }
        if Path::new(relative)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(AppError::invalid_url(format!(
                "resource path '{}' escapes the package",
                relative
            )));
        }
        let base = Url::parse(&format!("{}://{}/", APP_SCHEME, self.id))?;
        Ok(base.join(relative)?)
    }

    /// The declared main document, if any.
    ///
    /// `Some(Err(_))` means a main document was declared but its URL is
    /// unusable, which fails the launch rather than falling back.
    pub fn main_document_url(&self) -> Option<Result<Url, AppError>> {
        let declared = self.manifest.app.main_document.as_deref()?;
        Some(self.resolve(declared))
    }

    /// Entry page used when there is no main document: `start_url`, then
    /// `local_path`, then the first default index page present in the package.
    pub fn entry_page_url(&self) -> Option<Url> {
        if let Some(start_url) = self.manifest.app.start_url.as_deref() {
            match self.resolve(start_url) {
                Ok(url) => return Some(url),
                Err(e) => warn!(app_id = %self.id, error = %e, "Ignoring invalid start_url"),
            }
        }

        if let Some(local_path) = self.manifest.app.local_path.as_deref() {
            match self.resource_url(local_path) {
                Ok(url) => return Some(url),
                Err(e) => warn!(app_id = %self.id, error = %e, "Ignoring invalid local_path"),
            }
        }

        let page = DEFAULT_ENTRY_PAGES
            .iter()
            .find(|page| self.path.join(page).is_file())?;
        debug!(app_id = %self.id, page = %page, "Using default entry page");
        self.resource_url(page).ok()
    }

    fn resolve(&self, value: &str) -> Result<Url, AppError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(AppError::invalid_url("empty URL"));
        }
        match Url::parse(value) {
            Ok(url) => match url.scheme() {
                "http" | "https" | "file" | APP_SCHEME => Ok(url),
                other => Err(AppError::invalid_url(format!(
                    "unsupported scheme '{}' in '{}'",
                    other, value
                ))),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => self.resource_url(value),
            Err(e) => Err(e.into()),
        }
    }
}
