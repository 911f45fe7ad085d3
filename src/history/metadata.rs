//! Chain metadata.

use crate::error::{ChainError, Result};
use crate::graph::{compute_graph_hash, Graph};
use crate::types::RecordSummary;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Component, Path};
use std::process::{Command, Stdio};
use tracing::debug;

/// Catalog entry describing one recorded chain.
///
/// Fields the catalog carries beyond the known ones are kept verbatim in
/// `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainMetadata {
    pub identifier: String,
    /// Path of the archive on the machine that recorded it.
    pub filename: String,
    /// Unix seconds.
    pub start_timestamp: i64,
    /// Unix seconds.
    pub end_timestamp: i64,
    /// Hex SHA-256 from [`compute_graph_hash`].
    pub graph_hash: String,
    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "loose_bool"
    )]
    pub git_repo_clean: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Base URL of the catalog this entry was read from.
    #[serde(skip)]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// SQLite has no boolean type; accept `0`/`1` as well as `true`/`false`.
fn loose_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<bool>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().unwrap_or(0.0) != 0.0)),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a boolean, got {other}"
        ))),
    }
}

impl ChainMetadata {
    /// Describe a finished recording of `graph` stored at `archive`.
    ///
    /// The identifier defaults to the archive's file stem until a server
    /// assigns one.
    pub fn from_recording(summary: &RecordSummary, archive: &Path, graph: &Graph) -> Result<Self> {
        let filename = std::fs::canonicalize(archive)?;
        let identifier = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut extra = BTreeMap::new();
        extra.insert("shasum256".to_string(), Value::String(archive_digest(archive)?));
        extra.insert(
            "partition_chain_version".to_string(),
            Value::String(env!("CARGO_PKG_VERSION").to_string()),
        );
        extra.insert("steps".to_string(), Value::from(summary.steps));

        let mut metadata = Self {
            identifier,
            filename: filename.to_string_lossy().into_owned(),
            start_timestamp: summary.start_timestamp,
            end_timestamp: summary.end_timestamp,
            graph_hash: compute_graph_hash(graph).to_hex(),
            user: current_user(),
            git_commit: None,
            git_repo_clean: None,
            ip: None,
            server_timestamp: None,
            user_agent: None,
            url: None,
            extra,
        };
        if let Ok(dir) = std::env::current_dir() {
            metadata.capture_git(&dir);
        }
        Ok(metadata)
    }

    /// Record the HEAD commit of the git repository containing `dir`, and
    /// whether its working tree is clean (no changes, no untracked files).
    ///
    /// Both fields are left unset when `dir` is not inside a repository or
    /// git is unavailable.
    pub fn capture_git(&mut self, dir: &Path) {
        let commit = run_git(dir, &["rev-parse", "HEAD"]);
        let status = run_git(dir, &["status", "--porcelain"]);
        match (commit, status) {
            (Some(commit), Some(status)) => {
                self.git_commit = Some(commit.trim().to_string());
                self.git_repo_clean = Some(status.trim().is_empty());
            }
            _ => {
                debug!(dir = %dir.display(), "no git repository, provenance not recorded");
                self.git_commit = None;
                self.git_repo_clean = None;
            }
        }
    }

    /// Fail unless `graph` is the graph this chain was recorded on.
    pub fn verify_graph(&self, graph: &Graph) -> Result<()> {
        let got = compute_graph_hash(graph).to_hex();
        if got.eq_ignore_ascii_case(self.graph_hash.trim()) {
            Ok(())
        } else {
            Err(ChainError::GraphMismatch {
                expected: self.graph_hash.clone(),
                got,
            })
        }
    }

    /// Local file name for the cached archive, `<identifier>.chain`.
    ///
    /// Fails unless the identifier is a single plain path component, so a
    /// catalog entry cannot direct the cache outside its directory.
    pub fn archive_file_name(&self) -> Result<String> {
        let mut components = Path::new(&self.identifier).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name.to_str() == Some(self.identifier.as_str()) => {
                Ok(format!("{}.chain", self.identifier))
            }
            _ => Err(ChainError::Config(format!(
                "chain identifier {:?} is not a plain file name",
                self.identifier
            ))),
        }
    }

    /// Where the archive can be downloaded from.
    pub fn archive_url(&self) -> Result<String> {
        let base = self.url.as_deref().ok_or_else(|| {
            ChainError::Config(format!("chain {} has no catalog url", self.identifier))
        })?;
        let separator = if base.ends_with('/') { "" } else { "/" };
        Ok(format!("{base}{separator}{}", self.identifier))
    }
}

/// Hex SHA-256 of a file's contents.
pub fn archive_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn run_git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
