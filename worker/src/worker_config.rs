use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use lib_batch::{BudgetConfig, RateGateConfig, RetryPolicy};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/worker.toml");

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Vertex AI region, or `global`.
    pub region: String,
    pub text_model: String,
    /// Models whose name contains `imagen` go to Vertex; anything else to OpenAI.
    pub image_model: String,
    pub image_size: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            region: "us-central1".to_string(),
            text_model: "gemini-2.5-pro".to_string(),
            image_model: "gpt-image-1".to_string(),
            image_size: "1536x1024".to_string(),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_interval_ms: u64,
    pub rpm_limit: usize,
    pub window_secs: u64,
    pub ttl_secs: u64,
    pub lock_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            rpm_limit: 45,
            window_secs: 60,
            ttl_secs: 70,
            lock_timeout_ms: 10_000,
            max_retries: 5,
            initial_backoff_ms: 1500,
            max_jitter_ms: 1000,
        }
    }
}

impl LimitsConfig {
    pub fn gate_config(&self) -> RateGateConfig {
        RateGateConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            rpm_limit: self.rpm_limit,
            window: Duration::from_secs(self.window_secs),
            ttl: Duration::from_secs(self.ttl_secs),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            fallback_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_window_secs: u64,
    pub safety_margin: f64,
    /// Margin for the budget checks inside multi-round tasks.
    pub inner_margin: f64,
    pub first_task_reserve_secs: u64,
    /// Overrides the default lease of `max_window_secs` plus one minute.
    pub claim_lease_secs: Option<u64>,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            max_window_secs: 28 * 60,
            safety_margin: 1.5,
            inner_margin: 2.0,
            first_task_reserve_secs: 5 * 60,
            claim_lease_secs: None,
        }
    }
}

impl BudgetSection {
    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            max_window: Duration::from_secs(self.max_window_secs),
            safety_margin: self.safety_margin,
            first_task_reserve: Duration::from_secs(self.first_task_reserve_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding task lists.
    pub path: PathBuf,
    /// SQLite file holding the rate window shared by every invocation.
    pub ledger_path: PathBuf,
    pub ledger_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/worker.db"),
            ledger_path: PathBuf::from("data/rate.db"),
            ledger_name: "vertex".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
}

/// Row-chunked pipelines: category generation and free prompts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChunkedConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssignConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
    pub chunk_size: usize,
    /// JSON list produced by category generation.
    pub categories: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
    /// Header name of the column rows are grouped by.
    pub group_column: String,
    pub end_marker: String,
    pub max_rounds: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            prompt: String::new(),
            group_column: String::new(),
            end_marker: "続きなし".to_string(),
            max_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RowImagesConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    /// `<OK_Image>` and `<NG_Image>` are replaced by the row's case columns.
    pub prompt: String,
    /// Serial numbers to render, e.g. `1-5, 10`. Empty selects every row.
    pub targets: String,
    pub output_dir: PathBuf,
    /// Images generated per row.
    pub generations: usize,
}

impl Default for RowImagesConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            prompt: String::new(),
            targets: String::new(),
            output_dir: PathBuf::new(),
            generations: 1,
        }
    }
}

/// Targeted rewrites of existing feedback rows.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReviseConfig {
    /// Feedback sheet: number, title, summary, detail, base serials.
    pub feedback: PathBuf,
    /// The raw rows the feedback was built from, keyed by the first column.
    pub source: PathBuf,
    /// Sheet of (feedback number, instruction) rows.
    pub revisions: PathBuf,
    pub output: PathBuf,
    /// Rules every revised feedback must follow.
    pub prompt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IllustrationConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
    /// Columns shown to the model, e.g. `A-C, E`. Empty selects all.
    pub columns: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
    /// Rows with equal values in all of these columns form one group.
    pub group_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelinesConfig {
    pub generate_categories: ChunkedConfig,
    pub assign_categories: AssignConfig,
    pub generate_feedback: FeedbackConfig,
    pub free_prompt: ChunkedConfig,
    pub row_images: RowImagesConfig,
    pub revise_feedback: ReviseConfig,
    pub illustration_prompts: IllustrationConfig,
    pub group_knowledge: KnowledgeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub api: ApiConfig,
    pub limits: LimitsConfig,
    pub budget: BudgetSection,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub log: LogConfig,
    /// Values substituted into `{{ name }}` placeholders of every base prompt.
    pub prompt_vars: BTreeMap<String, String>,
    pub pipelines: PipelinesConfig,
}

impl WorkerConfig {
    /// `WORKER_CONFIG`, else `$APP_DIR/worker.toml`, else the repository's
    /// `config/worker.toml`; then `WORKER__SECTION__KEY` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("WORKER_CONFIG").unwrap_or_else(|_| match env::var("APP_DIR") {
            Ok(dir) => format!("{dir}/worker.toml"),
            Err(_) => DEFAULT_CONFIG_PATH.to_string(),
        });
        Self::from_sources(&path, None)
    }

    /// `env` replaces the process environment when given.
    pub fn from_sources(path: &str, env: Option<config::Map<String, String>>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("WORKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}

impl std::fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Worker Config:\nAPI: {:?}\nLimits: {:?}\nBudget: {:?}\nStorage: {:?}\nSchedule: {:?}\nPrompt vars: {}",
            self.api,
            self.limits,
            self.budget,
            self.storage,
            self.schedule,
            self.prompt_vars.keys().cloned().collect::<Vec<_>>().join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = WorkerConfig::from_sources("/nonexistent/worker.toml", Some(Default::default())).unwrap();
        assert_eq!(cfg.limits.rpm_limit, 45);
        assert_eq!(cfg.budget.max_window_secs, 28 * 60);
        assert_eq!(cfg.pipelines.generate_feedback.end_marker, "続きなし");
        assert_eq!(cfg.schedule.interval_secs, 1800);
        assert_eq!(cfg.budget.claim_lease_secs, None);
        assert_ne!(cfg.storage.path, cfg.storage.ledger_path);
    }

    #[test]
    fn test_file_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            indoc! {r#"
                [limits]
                rpm_limit = 30

                [prompt_vars]
                product = "ブレーキ"

                [pipelines.generate_categories]
                input = "data/input.json"
                chunk_size = 5
                prompt = "Classify {{ product }} reports."
            "#},
        );
        let env = config::Map::from([("WORKER__LIMITS__MIN_INTERVAL_MS".to_string(), "2500".to_string())]);

        let cfg = WorkerConfig::from_sources(&path, Some(env)).unwrap();

        assert_eq!(cfg.limits.rpm_limit, 30);
        assert_eq!(cfg.limits.min_interval_ms, 2500);
        assert_eq!(cfg.prompt_vars["product"], "ブレーキ");
        assert_eq!(cfg.pipelines.generate_categories.chunk_size, 5);
        assert_eq!(cfg.limits.gate_config().min_interval, Duration::from_millis(2500));
    }
}
