//! Dream material and idle detection for the low-priority self-training
//! worker.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const DEFAULT_PROMPTS: [&str; 3] = [
    "describe a surreal landscape",
    "share a quirky dream snippet",
    "what would clouds say if they could speak?",
];

const DEFAULT_RESPONSES: [&str; 3] = [
    "In dreams, the impossible folds into reality.",
    "I wandered through a maze of luminous equations.",
    "Clouds might whisper secrets about changing shapes.",
];

fn default_prompts() -> Vec<String> {
    DEFAULT_PROMPTS.iter().map(|s| s.to_string()).collect()
}

fn default_responses() -> Vec<String> {
    DEFAULT_RESPONSES.iter().map(|s| s.to_string()).collect()
}

/// Prompts and responses the dream worker draws from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamScript {
    #[serde(default = "default_prompts")]
    pub prompts: Vec<String>,
    #[serde(default = "default_responses")]
    pub responses: Vec<String>,
}

impl Default for DreamScript {
    fn default() -> Self {
        Self {
            prompts: default_prompts(),
            responses: default_responses(),
        }
    }
}

impl DreamScript {
    /// Script from the JSON file at `path`, or the built-in one when the file
    /// is missing or unreadable. Empty lists fall back individually.
    pub fn load(path: &Path) -> Self {
        let Ok(bytes) = std::fs::read(path) else {
            return Self::default();
        };
        let mut script = match serde_json::from_slice::<DreamScript>(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "dream script malformed, using built-in");
                return Self::default();
            }
        };
        if script.prompts.is_empty() {
            script.prompts = default_prompts();
        }
        if script.responses.is_empty() {
            script.responses = default_responses();
        }
        script
    }
}

/// `turns` random prompt/response pairs, flattened in speaking order.
pub fn simulate_dialogue(turns: usize, script: &DreamScript, rng: &mut impl Rng) -> Vec<String> {
    let mut dialogue = Vec::with_capacity(turns * 2);
    for _ in 0..turns {
        if let Some(p) = script.prompts.choose(rng) {
            dialogue.push(p.clone());
        }
        if let Some(r) = script.responses.choose(rng) {
            dialogue.push(r.clone());
        }
    }
    dialogue
}

/// Aggregate CPU counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

impl CpuSample {
    /// Parse the `cpu` summary line; idle time includes iowait.
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|f| f.parse().ok())
            .collect::<Option<_>>()?;
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Some(Self {
            idle,
            total: fields.iter().sum(),
        })
    }

    pub fn read() -> Option<Self> {
        std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| Self::parse(&s))
    }
}

/// Idle share of the CPU time elapsed between two samples.
pub fn idle_fraction(before: CpuSample, after: CpuSample) -> Option<f64> {
    let total = after.total.checked_sub(before.total)?;
    let idle = after.idle.checked_sub(before.idle)?;
    (total > 0).then(|| idle as f64 / total as f64)
}

/// Sample `/proc/stat` twice, `interval` apart. `None` where it is
/// unavailable.
pub async fn measure_idle(interval: Duration) -> Option<f64> {
    let before = CpuSample::read()?;
    tokio::time::sleep(interval).await;
    let after = CpuSample::read()?;
    idle_fraction(before, after)
}
