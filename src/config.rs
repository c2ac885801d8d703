use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::language::{Language, LanguageOverride};

#[derive(Parser)]
#[command(name = "grader", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Number of sandbox slots shared by all runs (overrides the config file)
    #[arg(long = "slots", short = 's')]
    pub slots: Option<usize>,

    /// Grade a single request file, print the report and exit
    #[arg(long = "run")]
    pub run: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file, falling back to defaults
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Failed to open config file {path}"))?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)
                    .with_context(|| format!("Failed to parse config file {path}"))?
            }
            None => Config::default(),
        };

        if let Some(slots) = self.slots {
            config.engine.slots = slots;
        }
        config.engine.check()?;

        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub languages: HashMap<Language, LanguageOverride>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Millis(pub u64);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KiloBytes(pub u64);

impl KiloBytes {
    pub fn as_bytes(self) -> u64 {
        self.0.saturating_mul(1024)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// `isolate` when it is installed, plain processes otherwise
    #[default]
    Auto,
    Isolate,
    Process,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub slots: usize,
    pub concurrency_limit: usize,
    pub sandbox: SandboxKind,
    pub work_dir: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub max_time_ms: Millis,
    pub max_memory_kb: KiloBytes,
    pub max_test_cases: usize,
    pub max_source_bytes: usize,
    pub max_output_kb: KiloBytes,
    pub compile_time_ms: Millis,
    pub compile_memory_kb: KiloBytes,
    pub sandbox_retries: u32,
    pub process: ProcessConfig,
    pub isolate: IsolateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            concurrency_limit: 4,
            sandbox: SandboxKind::Auto,
            work_dir: None,
            report_dir: None,
            max_time_ms: Millis(10_000),
            max_memory_kb: KiloBytes(1_048_576),
            max_test_cases: 256,
            max_source_bytes: 65_536,
            max_output_kb: KiloBytes(8_192),
            compile_time_ms: Millis(10_000),
            compile_memory_kb: KiloBytes(524_288),
            sandbox_retries: 2,
            process: ProcessConfig::default(),
            isolate: IsolateConfig::default(),
        }
    }
}

impl EngineConfig {
    fn check(&self) -> anyhow::Result<()> {
        if self.slots == 0 {
            anyhow::bail!("The number of sandbox slots must not be 0");
        }
        if self.concurrency_limit == 0 {
            anyhow::bail!("The per-run concurrency limit must not be 0");
        }
        if self.max_time_ms.0 == 0 || self.max_memory_kb.0 == 0 {
            anyhow::bail!("Upper bounds for time and memory must be positive");
        }
        Ok(())
    }

    /// Directory that holds compiled artifacts and per-execution scratch space
    pub fn resolve_work_dir(&self) -> PathBuf {
        use directories::ProjectDirs;

        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        ProjectDirs::from("", "", "grader")
            .map(|dirs| dirs.cache_dir().join("work"))
            .unwrap_or_else(|| std::env::temp_dir().join("grader"))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ProcessConfig {
    /// Run programs in a fresh user + network namespace
    pub isolate_network: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IsolateConfig {
    pub binary: String,
    /// Extra host directories bound into the box for toolchains
    pub dirs: Vec<String>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            binary: "isolate".to_string(),
            dirs: Vec::new(),
        }
    }
}
