//! Configuration types for the voice agent runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a siphon worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identity and response policy hooks.
    pub agent: AgentPersonaConfig,
    /// Turn-taking and barge-in behaviour.
    pub turn: TurnConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Provider retry policy shared by all stages.
    pub retry: RetryConfig,
    /// Media transport queueing and loss tolerance.
    pub transport: TransportConfig,
    /// Worker liveness settings.
    pub fleet: FleetConfig,
    /// Recording / transcript / metadata persistence.
    pub persistence: PersistenceConfig,
    /// Notes on earlier calls, keyed by caller number.
    pub memory: MemoryConfig,
}

/// Agent identity and the text it falls back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPersonaConfig {
    /// Agent name; workers register under it and only receive calls dispatched to it.
    pub name: String,
    /// System instructions passed to the language model on every request.
    pub system_instructions: String,
    /// Spoken when the language model fails after exhausting retries.
    pub fallback_response: String,
    /// Maximum number of past turns sent to the language model.
    pub max_history_turns: usize,
}

impl Default for AgentPersonaConfig {
    fn default() -> Self {
        Self {
            name: "siphon-agent".to_owned(),
            system_instructions: "You are a helpful voice assistant on a phone call. \
                                  Keep answers to one or two short sentences."
                .to_owned(),
            fallback_response: "Sorry, I didn't catch that. Could you say it again?".to_owned(),
            max_history_turns: 24,
        }
    }
}

/// Turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Whether the caller may interrupt the agent while it is speaking.
    pub allow_interruptions: bool,
    /// Minimum contiguous speech (ms) before the caller takes the floor or barges in.
    ///
    /// Filters out short transients (clicks, breath noise, line pops).
    pub min_interruption_duration_ms: u32,
    /// Silence (ms) after the last speech frame before an utterance is considered finished.
    pub min_endpointing_delay_ms: u32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            min_interruption_duration_ms: 80,
            min_endpointing_delay_ms: 500,
        }
    }
}

impl TurnConfig {
    /// Minimum contiguous speech as a [`Duration`].
    pub fn min_interruption_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.min_interruption_duration_ms))
    }

    /// End-of-turn silence as a [`Duration`].
    pub fn min_endpointing_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.min_endpointing_delay_ms))
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Classifier sensitivity in \[0, 1\].
    ///
    /// Lower values are more sensitive to quiet speech:
    ///   - 0.2: very sensitive (quiet callers, some line noise)
    ///   - 0.5: normal sensitivity (default)
    ///   - 0.8: only loud / close-talking speech
    pub activation_threshold: f32,
    /// Expected sample rate of inbound PCM16 frames in Hz.
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.5,
            sample_rate: 16_000,
        }
    }
}

/// Bounded retry policy for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first.
    pub attempts: u32,
    /// Delay before the first retry in ms; doubles per retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on a single retry delay in ms.
    pub max_backoff_ms: u64,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            jitter: true,
        }
    }
}

/// Media transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Inbound frames buffered between the transport and VAD/STT.
    pub inbound_queue_frames: usize,
    /// Outbound frames buffered between TTS and the transport.
    pub outbound_queue_frames: usize,
    /// Number of recent frames considered when measuring loss.
    pub loss_window_frames: usize,
    /// Loss ratio over a full window above which the call is treated as dead.
    pub max_loss_ratio: f32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbound_queue_frames: 64,
            outbound_queue_frames: 256,
            loss_window_frames: 50,
            max_loss_ratio: 0.5,
        }
    }
}

/// Worker fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Interval between worker heartbeats in ms.
    pub worker_heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats after which a worker is evicted.
    pub worker_eviction_threshold: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            worker_heartbeat_interval_ms: 1_000,
            worker_eviction_threshold: 3,
        }
    }
}

impl FleetConfig {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.worker_heartbeat_interval_ms)
    }

    /// Silence after which a worker is considered dead, in ms.
    pub fn liveness_timeout_ms(&self) -> u64 {
        self.worker_heartbeat_interval_ms
            .saturating_mul(u64::from(self.worker_eviction_threshold))
    }
}

/// Persistence stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Emit raw inbound and outbound audio.
    pub record_audio: bool,
    /// Emit finalized transcript segments.
    pub save_transcription: bool,
    /// Emit call lifecycle and turn transition records.
    pub save_metadata: bool,
    /// Events buffered before the forwarder starts dropping.
    pub queue_depth: usize,
    /// Output directory for the JSONL sink (None = platform data dir).
    pub output_dir: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            record_audio: false,
            save_transcription: false,
            save_metadata: false,
            queue_depth: 1_024,
            output_dir: None,
        }
    }
}

impl PersistenceConfig {
    /// Returns true when at least one stream is enabled.
    pub fn any_enabled(&self) -> bool {
        self.record_audio || self.save_transcription || self.save_metadata
    }

    /// Resolved output directory for file-backed sinks.
    pub fn resolved_output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("siphon")
                .join("calls"),
        }
    }
}

/// Caller memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Recall earlier calls from the same number and remember this one.
    pub enabled: bool,
    /// Notes on earlier calls added to the system instructions.
    pub max_notes_in_prompt: usize,
    /// Notes kept per caller; older ones are pruned.
    pub max_notes_kept: usize,
    /// Upper bound on a single call note, in characters.
    pub summary_max_chars: usize,
    /// Directory for caller profiles (None = platform data dir).
    pub dir: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_notes_in_prompt: 10,
            max_notes_kept: 50,
            summary_max_chars: 150,
            dir: None,
        }
    }
}

impl MemoryConfig {
    /// Resolved directory for file-backed caller memory.
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("siphon")
                .join("callers"),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::SiphonError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SiphonError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/siphon/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("siphon").join("config.toml")
        } else if let Some(config) = dirs::config_dir() {
            config.join("siphon").join("config.toml")
        } else {
            PathBuf::from("/tmp/siphon-config/config.toml")
        }
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`SiphonError::Config`](crate::error::SiphonError::Config) naming the bad field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: &str| Err(crate::error::SiphonError::Config(msg.to_owned()));

        if !(0.0..=1.0).contains(&self.vad.activation_threshold) {
            return invalid("vad.activation_threshold must be within [0, 1]");
        }
        if self.vad.sample_rate == 0 {
            return invalid("vad.sample_rate must be positive");
        }
        if self.fleet.worker_heartbeat_interval_ms == 0 {
            return invalid("fleet.worker_heartbeat_interval_ms must be positive");
        }
        if self.fleet.worker_eviction_threshold == 0 {
            return invalid("fleet.worker_eviction_threshold must be at least 1");
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts must be at least 1");
        }
        if !(self.transport.max_loss_ratio > 0.0 && self.transport.max_loss_ratio <= 1.0) {
            return invalid("transport.max_loss_ratio must be within (0, 1]");
        }
        if self.transport.inbound_queue_frames == 0 || self.transport.outbound_queue_frames == 0 {
            return invalid("transport queue sizes must be positive");
        }
        if self.memory.max_notes_kept < self.memory.max_notes_in_prompt {
            return invalid("memory.max_notes_kept must be at least memory.max_notes_in_prompt");
        }
        if self.memory.summary_max_chars < 8 {
            return invalid("memory.summary_max_chars must be at least 8");
        }
        Ok(())
    }
}
