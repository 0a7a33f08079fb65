use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::adapters::{
    AnalysisEndpoint, DryrunAnalyzer, DryrunGenerator, GenerationConfig, HttpAnalyzer,
    HttpGenerator, ImageAnalyzer, ImageGenerator,
};

pub const DEFAULT_GENERATE_URL: &str = "http://localhost:8000";
pub const DEFAULT_ANALYZE_URL: &str = "http://localhost:8001";
const DEFAULT_TIMEOUT_S: u64 = 120;
const MIN_TIMEOUT_S: u64 = 5;
const MAX_TIMEOUT_S: u64 = 600;

/// Service locations and generation settings, read from `DASHER_*`
/// environment variables. Unparseable values fall back to defaults and leave
/// a warning behind.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub generate_url: String,
    pub analyze_url: String,
    pub endpoint: AnalysisEndpoint,
    pub generation: GenerationConfig,
    pub timeout: Duration,
    pub dryrun: bool,
    pub warnings: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generate_url: DEFAULT_GENERATE_URL.to_string(),
            analyze_url: DEFAULT_ANALYZE_URL.to_string(),
            endpoint: AnalysisEndpoint::RefinementPlan,
            generation: GenerationConfig::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_S),
            dryrun: false,
            warnings: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = value("DASHER_GENERATE_URL") {
            config.generate_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = value("DASHER_ANALYZE_URL") {
            config.analyze_url = url.trim_end_matches('/').to_string();
        }
        if let Some(raw) = value("DASHER_ANALYZE_ENDPOINT") {
            match AnalysisEndpoint::parse(&raw) {
                Some(endpoint) => config.endpoint = endpoint,
                None => config.warn(format!(
                    "DASHER_ANALYZE_ENDPOINT={raw} is not a known endpoint; using {}",
                    config.endpoint
                )),
            }
        }
        if let Some(raw) = value("DASHER_STEPS") {
            match raw.parse::<u32>() {
                Ok(steps) if steps > 0 => config.generation.steps = steps,
                _ => config.warn(format!("DASHER_STEPS={raw} is not a positive integer")),
            }
        }
        if let Some(raw) = value("DASHER_GUIDANCE") {
            match raw.parse::<f64>() {
                Ok(guidance) if guidance.is_finite() && guidance >= 0.0 => {
                    config.generation.guidance = guidance
                }
                _ => config.warn(format!("DASHER_GUIDANCE={raw} is not a non-negative number")),
            }
        }
        if let Some(raw) = value("DASHER_TIMEOUT_S") {
            match raw.parse::<u64>() {
                Ok(seconds) => {
                    config.timeout =
                        Duration::from_secs(seconds.clamp(MIN_TIMEOUT_S, MAX_TIMEOUT_S))
                }
                Err(_) => config.warn(format!("DASHER_TIMEOUT_S={raw} is not a whole number")),
            }
        }
        config.dryrun = value("DASHER_DRYRUN")
            .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        config
    }

    pub fn generator(&self) -> Result<Arc<dyn ImageGenerator>> {
        if self.dryrun {
            return Ok(Arc::new(DryrunGenerator::default()));
        }
        Ok(Arc::new(HttpGenerator::new(&self.generate_url, self.timeout)?))
    }

    pub fn analyzer(&self) -> Result<Arc<dyn ImageAnalyzer>> {
        self.analyzer_for(self.endpoint)
    }

    pub fn analyzer_for(&self, endpoint: AnalysisEndpoint) -> Result<Arc<dyn ImageAnalyzer>> {
        if self.dryrun {
            return Ok(Arc::new(DryrunAnalyzer::new(endpoint)));
        }
        Ok(Arc::new(HttpAnalyzer::new(
            &self.analyze_url,
            endpoint,
            self.timeout,
        )?))
    }

    fn warn(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}
