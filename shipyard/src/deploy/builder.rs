//! Toolchain detection and builds for Go and Rust projects

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::{run_tool, AppBuilder, AppKind, BuildResult};
use crate::errors::{PlatformError, ResultExt};
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

const STATIC_DIRS: [&str; 5] = ["static", "public", "assets", "dist", "www"];
const SKIP_DIRS: [&str; 3] = ["target", "vendor", "node_modules"];
const LISTEN_MARKERS: [&str; 4] = ["ListenAndServe(\"", "Listen(\"", "bind(\"", "listen(\""];

/// Builder options
#[derive(Debug, Clone)]
pub struct Options {
    pub go_binary: String,
    pub cargo_binary: String,

    /// Parent of every build output (`<builds>/<build id>/<build id>`)
    pub output_dir: PathBuf,

    pub build_timeout: Duration,

    /// Extra environment for build commands
    pub env: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            go_binary: "go".to_string(),
            cargo_binary: "cargo".to_string(),
            output_dir: PathBuf::from("builds"),
            build_timeout: Duration::from_secs(10 * 60),
            env: BTreeMap::new(),
        }
    }
}

/// Builds Go (`go.mod`) and Rust (`Cargo.toml`) projects
pub struct ToolchainBuilder {
    options: Options,
}

impl ToolchainBuilder {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    async fn build_go(&self, source_dir: &Path, binary_path: &Path) -> Result<(), PlatformError> {
        let main_dir = find_go_main_dir(source_dir).await?.ok_or_else(|| {
            PlatformError::ValidationError("no Go main package found".to_string())
        })?;
        debug!(main_dir = %main_dir.display(), "Building Go main package");

        let mut command = Command::new(&self.options.go_binary);
        command
            .args(["build", "-o"])
            .arg(binary_path)
            .current_dir(&main_dir)
            .envs(&self.options.env)
            .env("CGO_ENABLED", "0");
        run_tool("go build", &mut command, self.options.build_timeout).await?;
        Ok(())
    }

    async fn build_rust(&self, source_dir: &Path, binary_path: &Path) -> Result<(), PlatformError> {
        let mut command = Command::new(&self.options.cargo_binary);
        command
            .args(["build", "--release"])
            .current_dir(source_dir)
            .envs(&self.options.env);
        run_tool("cargo build", &mut command, self.options.build_timeout).await?;

        let package = File::new(source_dir.join("Cargo.toml"))
            .read_string()
            .await
            .map(|manifest| cargo_package_name(&manifest))
            .unwrap_or_default();
        let release = find_release_binary(&source_dir.join("target").join("release"), package.as_deref())
            .await?
            .ok_or_else(|| PlatformError::Internal("could not find Rust release binary".to_string()))?;

        File::new(release)
            .copy_to(&File::new(binary_path))
            .await
            .context("failed to copy Rust binary")
    }
}

#[async_trait]
impl AppBuilder for ToolchainBuilder {
    async fn detect_and_build(&self, source_dir: &Path, build_id: &str) -> Result<BuildResult, PlatformError> {
        let kind = detect_kind(source_dir).await.ok_or_else(|| {
            PlatformError::ValidationError(format!(
                "unsupported application type in {}",
                source_dir.display()
            ))
        })?;
        info!(build_id, %kind, "Detected application type");

        let output_dir = Dir::new(self.options.output_dir.join(build_id));
        output_dir.create().await.context("failed to create output directory")?;
        // build commands run from inside the source tree
        let output_dir = Dir::new(tokio::fs::canonicalize(output_dir.path()).await?);
        let binary = output_dir.file(build_id);

        let built = match kind {
            AppKind::Go => self.build_go(source_dir, binary.path()).await,
            AppKind::Rust => self.build_rust(source_dir, binary.path()).await,
        };
        built.with_context(|| format!("{kind} build failed"))?;

        binary
            .set_executable()
            .await
            .context("failed to make binary executable")?;

        let sources = collect_sources(source_dir.to_path_buf(), 0).await;
        let mut uses_database = false;
        let mut default_port = None;
        for path in &sources {
            let Ok(content) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            uses_database |= content.contains("sqlite");
            if default_port.is_none() && is_code(path) {
                default_port = extract_port(&content);
            }
        }
        let static_dir = detect_static_dir(source_dir).await;

        let result = BuildResult {
            kind,
            binary_path: binary.path().to_path_buf(),
            default_port,
            uses_database,
            static_dir,
        };
        info!(
            build_id,
            %kind,
            port = ?result.default_port,
            uses_database = result.uses_database,
            has_static = result.static_dir.is_some(),
            "Application built successfully"
        );
        Ok(result)
    }
}

async fn detect_kind(dir: &Path) -> Option<AppKind> {
    if tokio::fs::metadata(dir.join("go.mod")).await.is_ok() {
        Some(AppKind::Go)
    } else if tokio::fs::metadata(dir.join("Cargo.toml")).await.is_ok() {
        Some(AppKind::Rust)
    } else {
        None
    }
}

async fn detect_static_dir(dir: &Path) -> Option<PathBuf> {
    for name in STATIC_DIRS {
        let candidate = dir.join(name);
        if Dir::new(&candidate).exists().await {
            return Some(candidate);
        }
    }
    None
}

fn is_code(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("go" | "rs"))
}

fn is_scanned(path: &Path) -> bool {
    is_code(path)
        || matches!(
            path.file_name().and_then(|n| n.to_str()),
            Some("go.mod" | "Cargo.toml")
        )
}

/// Source files worth scanning, skipping hidden and build directories
fn collect_sources(dir: PathBuf, depth: usize) -> BoxFuture<'static, Vec<PathBuf>> {
    async move {
        let mut found = Vec::new();
        if depth > 8 {
            return found;
        }
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return found;
        };
        let mut subdirs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_str()) {
                    subdirs.push(path);
                }
            } else if is_scanned(&path) {
                found.push(path);
            }
        }
        found.sort();
        subdirs.sort();
        for subdir in subdirs {
            found.extend(collect_sources(subdir, depth + 1).await);
        }
        found
    }
    .boxed()
}

/// Directory of the first `main.go` declaring `package main`
async fn find_go_main_dir(source_dir: &Path) -> Result<Option<PathBuf>, PlatformError> {
    for path in collect_sources(source_dir.to_path_buf(), 0).await {
        if path.file_name().and_then(|n| n.to_str()) != Some("main.go") {
            continue;
        }
        let content = tokio::fs::read_to_string(&path).await?;
        if content.contains("package main") {
            return Ok(path.parent().map(Path::to_path_buf));
        }
    }
    Ok(None)
}

/// `name` of the `[package]` table in a Cargo manifest
fn cargo_package_name(manifest: &str) -> Option<String> {
    let mut in_package = false;
    for line in manifest.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_package = line == "[package]";
            continue;
        }
        if !in_package {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "name" {
                return Some(value.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

async fn find_release_binary(release_dir: &Path, package: Option<&str>) -> Result<Option<PathBuf>, PlatformError> {
    if let Some(package) = package {
        let named = release_dir.join(package);
        if tokio::fs::metadata(&named).await.is_ok() {
            return Ok(Some(named));
        }
    }

    let mut entries = tokio::fs::read_dir(release_dir)
        .await
        .context("failed to read release directory")?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() && is_executable(&meta) && entry.path().extension().is_none() {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Port literal from a listen call or a `port = N` assignment
fn extract_port(content: &str) -> Option<u16> {
    for marker in LISTEN_MARKERS {
        let Some(idx) = content.find(marker) else {
            continue;
        };
        let literal = content[idx + marker.len()..].split('"').next().unwrap_or_default();
        if let Some(port) = literal.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
            if port > 0 {
                return Some(port);
            }
        }
    }

    for line in content.lines() {
        let lower = line.to_ascii_lowercase();
        let Some(pos) = lower.find("port") else {
            continue;
        };
        let after = &line[pos..];
        let Some(eq) = after.find('=') else {
            continue;
        };
        let value = after[eq + 1..]
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ':'));
        let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(port) = digits.parse::<u16>() {
            if port > 0 {
                return Some(port);
            }
        }
    }
    None
}
