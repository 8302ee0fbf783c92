// Toolchain profile management for the grader worker
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How the sandboxed build is launched and bounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub image: String,
    pub command: Vec<String>,
    /// Mount point of the submission inside the container
    pub workspace_mount: String,
    /// Named volume shared by every run for dependency downloads
    pub cache_volume: String,
    pub cache_mount: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    pub timeout_secs: u64,
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
    #[serde(default)]
    pub network_disabled: bool,
}

/// Paths agreed with the challenge template, relative to the project root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectLayout {
    pub test_reports_dir: String,
    pub style_report: String,
    pub hidden_tests_dir: String,
    pub hidden_test_extension: String,
    /// Test identifiers containing this marker are hidden tests
    pub hidden_test_marker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainProfile {
    pub name: String,
    pub sandbox: SandboxSettings,
    pub layout: ProjectLayout,
}

fn default_pids_limit() -> i64 {
    512
}

fn default_pull_timeout() -> u64 {
    60
}

impl ToolchainProfile {
    /// Built-in Maven + Surefire + Checkstyle profile
    pub fn maven() -> Self {
        Self {
            name: "maven".to_string(),
            sandbox: SandboxSettings {
                image: "maven:3.9-eclipse-temurin-21-alpine".to_string(),
                command: [
                    "mvn",
                    "-B",
                    "--no-transfer-progress",
                    "test",
                    "checkstyle:check",
                    "-f",
                    "/workspace/pom.xml",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                workspace_mount: "/workspace".to_string(),
                cache_volume: "grader-m2-cache".to_string(),
                cache_mount: "/root/.m2/repository".to_string(),
                memory_limit_mb: 512,
                cpu_limit: 1.0,
                pids_limit: default_pids_limit(),
                timeout_secs: 300,
                pull_timeout_secs: default_pull_timeout(),
                network_disabled: false,
            },
            layout: ProjectLayout {
                test_reports_dir: "target/surefire-reports".to_string(),
                style_report: "target/checkstyle-result.xml".to_string(),
                hidden_tests_dir: "src/test/java/com/challenge".to_string(),
                hidden_test_extension: "java".to_string(),
                hidden_test_marker: "Hidden".to_string(),
            },
        }
    }

    /// Load a profile from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Toolchain config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let profile: ToolchainProfile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        profile.validate()?;
        Ok(profile)
    }

    /// Load from TOOLCHAIN_CONFIG (default config/toolchain.json),
    /// falling back to the built-in Maven profile, then apply env overrides
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("TOOLCHAIN_CONFIG")
            .unwrap_or_else(|_| "config/toolchain.json".to_string());
        let path = Path::new(&path);

        let mut profile = if path.exists() {
            Self::load(path)?
        } else {
            Self::maven()
        };
        profile.apply_env_overrides();
        profile.validate()?;
        Ok(profile)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(secs) = std::env::var("SANDBOX_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()) {
            self.sandbox.timeout_secs = secs;
        }
        if let Some(mb) = std::env::var("SANDBOX_MEMORY_MB").ok().and_then(|v| v.parse().ok()) {
            self.sandbox.memory_limit_mb = mb;
        }
        if let Some(cpus) = std::env::var("SANDBOX_CPUS").ok().and_then(|v| v.parse().ok()) {
            self.sandbox.cpu_limit = cpus;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.command.is_empty() {
            bail!("Toolchain '{}' has an empty command", self.name);
        }
        if self.sandbox.timeout_secs == 0 {
            bail!("Toolchain '{}' must have a non-zero timeout", self.name);
        }
        if self.sandbox.memory_limit_mb == 0 || self.sandbox.cpu_limit <= 0.0 {
            bail!("Toolchain '{}' must have positive memory and CPU limits", self.name);
        }
        if self.layout.hidden_test_marker.is_empty() {
            bail!("Toolchain '{}' must define a hidden test marker", self.name);
        }
        Ok(())
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.sandbox.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.sandbox.cpu_limit as f64 * 1_000_000_000.0) as i64
    }
}
