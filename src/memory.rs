//! Caller memory: short notes on earlier calls, keyed by phone number.
//!
//! When a known caller rings again, the notes are appended to the system
//! instructions so the agent can pick up where the last call left off. A note
//! is written when an answered call ends.
//!
//! Stores sit behind [`CallerMemory`]. [`FileCallerMemory`] keeps one JSON
//! file per caller under a root directory so profiles are easy to inspect and
//! back up; [`InMemoryCallerMemory`] is for tests and single-process setups.

use crate::error::{Result, SiphonError};
use crate::pipeline::messages::{ConversationTurn, Speaker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// What one earlier call was about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallNote {
    /// When the call ended.
    pub at: DateTime<Utc>,
    /// 1-based position among this caller's calls.
    pub call_number: u32,
    /// One-line summary.
    pub summary: String,
}

/// Everything remembered about one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerProfile {
    /// Normalized phone number.
    pub caller: String,
    pub first_call_at: DateTime<Utc>,
    pub last_call_at: DateTime<Utc>,
    /// Answered calls so far, including ones whose notes were pruned.
    pub total_calls: u32,
    /// Oldest first.
    #[serde(default)]
    pub notes: Vec<CallNote>,
}

impl CallerProfile {
    /// A profile with no calls yet.
    pub fn new(caller: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            caller: caller.into(),
            first_call_at: at,
            last_call_at: at,
            total_calls: 0,
            notes: Vec::new(),
        }
    }

    /// Count one more call and keep at most `max_notes` notes.
    pub fn record_call(&mut self, summary: Option<String>, at: DateTime<Utc>, max_notes: usize) {
        self.total_calls = self.total_calls.saturating_add(1);
        self.last_call_at = at;
        if let Some(summary) = summary {
            self.notes.push(CallNote {
                at,
                call_number: self.total_calls,
                summary,
            });
        }
        let excess = self.notes.len().saturating_sub(max_notes);
        self.notes.drain(..excess);
    }

    /// Prompt section describing the most recent `max_notes` calls.
    ///
    /// `None` when there is nothing worth telling the model.
    pub fn prompt_context(&self, max_notes: usize) -> Option<String> {
        if self.total_calls == 0 || self.notes.is_empty() || max_notes == 0 {
            return None;
        }
        let start = self.notes.len().saturating_sub(max_notes);
        let mut lines = vec![
            format!("Previous conversations with this caller (total calls: {}).", self.total_calls),
            format!("Last call was on {}.", self.last_call_at.format(NOTE_TIME_FORMAT)),
            String::new(),
        ];
        for note in &self.notes[start..] {
            lines.push(format!(
                "[{}] Call #{} of {}: {}",
                note.at.format(NOTE_TIME_FORMAT),
                note.call_number,
                self.total_calls,
                note.summary
            ));
        }
        lines.push(String::new());
        lines.push(
            "Use these notes naturally: greet a returning caller as such and refer back \
             only when it helps. Never read the notes out."
                .to_owned(),
        );
        Some(lines.join("\n"))
    }
}

const NOTE_TIME_FORMAT: &str = "%b %d, %Y at %I:%M %p UTC";

/// Storage for caller profiles. Keys are normalized phone numbers.
#[async_trait]
pub trait CallerMemory: Send + Sync {
    /// Profile for `caller`, if one was saved.
    async fn load(&self, caller: &str) -> Result<Option<CallerProfile>>;

    /// Replace the stored profile for `profile.caller`.
    async fn save(&self, profile: &CallerProfile) -> Result<()>;
}

/// Profiles held in process memory.
#[derive(Default)]
pub struct InMemoryCallerMemory {
    profiles: Mutex<HashMap<String, CallerProfile>>,
}

impl InMemoryCallerMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallerMemory for InMemoryCallerMemory {
    async fn load(&self, caller: &str) -> Result<Option<CallerProfile>> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        Ok(profiles.get(caller).cloned())
    }

    async fn save(&self, profile: &CallerProfile) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles.insert(profile.caller.clone(), profile.clone());
        Ok(())
    }
}

/// One `<caller>.json` file per caller under `root`.
#[derive(Debug, Clone)]
pub struct FileCallerMemory {
    root: PathBuf,
}

impl FileCallerMemory {
    /// Create a store rooted at `root`. The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profile_path(&self, caller: &str) -> PathBuf {
        self.root.join(format!("{caller}.json"))
    }
}

#[async_trait]
impl CallerMemory for FileCallerMemory {
    async fn load(&self, caller: &str) -> Result<Option<CallerProfile>> {
        let path = self.profile_path(caller);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let profile = serde_json::from_slice(&body).map_err(|e| {
            SiphonError::Memory(format!("invalid caller profile {}: {e}", path.display()))
        })?;
        Ok(Some(profile))
    }

    async fn save(&self, profile: &CallerProfile) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let body = serde_json::to_vec_pretty(profile)
            .map_err(|e| SiphonError::Memory(format!("failed to serialize caller profile: {e}")))?;
        // Write then rename so a crash never leaves half a profile behind.
        let path = self.profile_path(&profile.caller);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Reduce a phone number to `+` and digits.
///
/// Returns `None` if there are no digits, so junk caller IDs never share a
/// profile.
pub fn normalize_caller(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if raw.trim_start().starts_with('+') {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}

/// One-line summary of what the caller asked for, at most `max_chars` long.
///
/// Returns `None` if the caller said nothing.
pub fn summarize_call(history: &[ConversationTurn], max_chars: usize) -> Option<String> {
    let said: Vec<&str> = history
        .iter()
        .filter(|turn| turn.speaker == Speaker::Caller)
        .map(|turn| turn.text.trim())
        .filter(|text| !text.is_empty())
        .collect();
    if said.is_empty() {
        return None;
    }
    let full = format!("Caller said: {}", said.join(" / "));
    if full.chars().count() <= max_chars {
        return Some(full);
    }
    let mut cut: String = full.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    Some(cut)
}

/// `base` followed by the caller's history, when there is any.
pub fn enhance_instructions(base: &str, profile: Option<&CallerProfile>, max_notes: usize) -> String {
    match profile.and_then(|p| p.prompt_context(max_notes)) {
        Some(context) => format!("{base}\n\n---\n{context}"),
        None => base.to_owned(),
    }
}
