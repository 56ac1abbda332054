use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name (without extension) looked up in the working directory
pub const CONFIG_FILE_STEM: &str = "agent-worktrees";
/// Environment prefix; nested keys use `__`, e.g.
/// `AGENT_WORKTREES_BACKEND__MAX_CONCURRENT_COMMANDS=8`
pub const ENV_PREFIX: &str = "AGENT_WORKTREES";

/// Main configuration structure for the engine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    pub repository: RepositoryConfig,
    pub backend: BackendConfig,
    pub persistence: PersistenceConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RepositoryConfig {
    /// Shared repository the worktrees are cut from
    pub path: PathBuf,
    /// Directory holding one worktree per (agent, feature); relative paths
    /// are resolved against `path`
    pub worktree_root: PathBuf,
    /// Branch new workspaces start from
    pub base_branch: String,
    /// Branch integration runs merge into
    pub target_branch: String,
    /// Pass `--force` when removing worktrees with local changes
    pub force_remove: bool,
    pub identity: Option<CommitIdentity>,
}

impl RepositoryConfig {
    pub fn resolved_worktree_root(&self) -> PathBuf {
        if self.worktree_root.is_absolute() {
            self.worktree_root.clone()
        } else {
            self.path.join(&self.worktree_root)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Git executable
    pub program: String,
    /// Size of the backend worker pool
    pub max_concurrent_commands: usize,
    /// Per-command timeout
    pub command_timeout_seconds: u64,
}

impl BackendConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Root of the file store
    pub directory: PathBuf,
    /// SQLite URL, used with the `database` feature
    pub database_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub log_level: String,
    /// JSON lines instead of compact text
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig {
                path: PathBuf::from("."),
                worktree_root: PathBuf::from(".worktrees"),
                base_branch: "main".to_string(),
                target_branch: "main".to_string(),
                force_remove: false,
                identity: None,
            },
            backend: BackendConfig {
                program: "git".to_string(),
                max_concurrent_commands: 4,
                command_timeout_seconds: 120,
            },
            persistence: PersistenceConfig {
                backend: PersistenceBackend::Memory,
                directory: PathBuf::from(".agent-worktrees/state"),
                database_url: "sqlite://.agent-worktrees/records.db".to_string(),
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `agent-worktrees.toml` in the working directory
    /// 3. Environment variables (prefixed with AGENT_WORKTREES_)
    pub fn load() -> Result<Self> {
        let file = Path::new(CONFIG_FILE_STEM).with_extension("toml");
        Self::load_from(file.exists().then_some(file.as_path()))
    }

    /// Same layering with an explicit configuration file
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);

        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<EngineConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = EngineConfig::load_env_file();
        EngineConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static EngineConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.repository.base_branch, "main");
        assert_eq!(config.repository.target_branch, "main");
        assert_eq!(config.backend.max_concurrent_commands, 4);
        assert_eq!(config.backend.command_timeout(), Duration::from_secs(120));
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
    }

    #[test]
    fn relative_worktree_root_resolves_against_repository() {
        let mut repo = EngineConfig::default().repository;
        repo.path = PathBuf::from("/srv/repo");
        assert_eq!(repo.resolved_worktree_root(), PathBuf::from("/srv/repo/.worktrees"));

        repo.worktree_root = PathBuf::from("/tmp/wt");
        assert_eq!(repo.resolved_worktree_root(), PathBuf::from("/tmp/wt"));
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-worktrees.toml");
        std::fs::write(
            &path,
            r#"
[repository]
target_branch = "integration"

[repository.identity]
name = "Worktree Bot"
email = "bot@example.com"

[backend]
max_concurrent_commands = 2
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(Some(&path)).unwrap();

        assert_eq!(config.repository.target_branch, "integration");
        assert_eq!(config.repository.base_branch, "main");
        assert_eq!(config.backend.max_concurrent_commands, 2);
        assert_eq!(
            config.repository.identity,
            Some(CommitIdentity {
                name: "Worktree Bot".to_string(),
                email: "bot@example.com".to_string(),
            })
        );
    }

    #[test]
    fn saved_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = EngineConfig::default();
        config.persistence.backend = PersistenceBackend::File;
        config.observability.json = false;

        config.save_to_file(&path).unwrap();
        let loaded = EngineConfig::load_from(Some(&path)).unwrap();

        assert_eq!(loaded.persistence.backend, PersistenceBackend::File);
        assert!(!loaded.observability.json);
    }
}
