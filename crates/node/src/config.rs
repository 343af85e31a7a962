use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use flotilla_primitives::{NodeId, RepoId};
use serde::{Deserialize, Serialize};

fn default_rescan_interval() -> u64 {
    60
}

/// Daemon configuration: the node table and the repository table. Loaded
/// from TOML at startup and persisted atomically whenever the introducer
/// flow or repo invalidation changes it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,

    #[serde(default, rename = "repository")]
    pub repos: Vec<RepoConfig>,

    /// Where `save` writes; set by `load` or [`set_path`](Self::set_path).
    #[serde(skip)]
    pub path: Option<Utf8PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub introducer: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: RepoId,
    pub directory: Utf8PathBuf,

    /// Nodes this repository is shared with.
    #[serde(default)]
    pub nodes: Vec<NodeId>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_s: u64,

    #[serde(default)]
    pub ignore_perms: bool,

    /// Non-empty when the repository has been taken out of rotation; holds
    /// the error that caused it.
    #[serde(default)]
    pub invalid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<VersioningConfig>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            id: RepoId::default(),
            directory: Utf8PathBuf::new(),
            nodes: Vec::new(),
            read_only: false,
            rescan_interval_s: default_rescan_interval(),
            ignore_perms: false,
            invalid: String::new(),
            versioning: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VersioningConfig {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: &Utf8Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {path}"))?;
        let mut cfg: Self = toml::from_str(&content).wrap_err_with(|| format!("parsing {path}"))?;
        cfg.path = Some(path.to_owned());

        Ok(cfg)
    }

    pub fn set_path(&mut self, path: Utf8PathBuf) {
        self.path = Some(path);
    }

    /// Serializes to the config path via a sibling temp file and an atomic
    /// rename, so a crash mid-write never leaves a torn config behind.
    pub fn save(&self) -> eyre::Result<()> {
        let Some(path) = &self.path else {
            eyre::bail!("config has no backing path");
        };

        let content = toml::to_string_pretty(self).wrap_err("serializing config")?;

        let dir = path.parent().unwrap_or(Utf8Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".config-")
            .tempfile_in(dir)
            .wrap_err("creating config temp file")?;

        std::io::Write::write_all(&mut tmp, content.as_bytes())
            .wrap_err("writing config temp file")?;
        tmp.as_file().sync_all().wrap_err("syncing config")?;
        let _file = tmp
            .persist(path.as_std_path())
            .wrap_err("replacing config")?;

        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeConfig> {
        self.nodes.iter_mut().find(|n| n.node_id == id)
    }

    pub fn repo(&self, id: &RepoId) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| &r.id == id)
    }

    pub fn repo_mut(&mut self, id: &RepoId) -> Option<&mut RepoConfig> {
        self.repos.iter_mut().find(|r| &r.id == id)
    }

    /// Marks a repository as out of rotation, recording why.
    pub fn invalidate_repo(&mut self, id: &RepoId, reason: &str) {
        if let Some(repo) = self.repo_mut(id) {
            repo.invalid = reason.to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let mut cfg = Config {
            nodes: vec![NodeConfig {
                node_id: NodeId::new([3; 32]),
                name: "attic".to_owned(),
                introducer: true,
            }],
            repos: vec![RepoConfig {
                id: "photos".into(),
                directory: "/data/photos".into(),
                nodes: vec![NodeId::new([3; 32])],
                ..Default::default()
            }],
            path: None,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("config.toml")).unwrap();
        cfg.set_path(path.clone());
        cfg.save().unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.nodes.len(), 1);
        assert!(loaded.nodes[0].introducer);
        assert_eq!(loaded.repos[0].id.as_str(), "photos");
        assert_eq!(loaded.repos[0].rescan_interval_s, 60);
    }

    #[test]
    fn invalidate_repo_records_reason() {
        let mut cfg = Config {
            repos: vec![RepoConfig {
                id: "photos".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        cfg.invalidate_repo(&"photos".into(), "scanner failed");
        assert_eq!(cfg.repo(&"photos".into()).unwrap().invalid, "scanner failed");
    }

    #[test]
    fn lookup_helpers() {
        let cfg = Config {
            nodes: vec![NodeConfig {
                node_id: NodeId::new([9; 32]),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(cfg.node(NodeId::new([9; 32])).is_some());
        assert!(cfg.node(NodeId::new([1; 32])).is_none());
        assert!(cfg.repo(&"absent".into()).is_none());
    }
}
