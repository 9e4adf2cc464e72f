//! Per-call transcript log.

use crate::pipeline::messages::TranscriptSegment;

/// Ordered transcript of the caller's speech.
///
/// Holds at most one revisable partial segment. Final segments are appended
/// and never modified afterwards.
#[derive(Debug, Default, Clone)]
pub struct TranscriptLog {
    finalized: Vec<TranscriptSegment>,
    partial: Option<TranscriptSegment>,
}

impl TranscriptLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a segment from the STT stage.
    ///
    /// A partial replaces the previous partial. A final clears the partial and
    /// is appended. Returns `true` if the segment was a new final.
    pub fn apply(&mut self, segment: TranscriptSegment) -> bool {
        if segment.is_final {
            self.partial = None;
            if segment.text.trim().is_empty() {
                return false;
            }
            self.finalized.push(segment);
            true
        } else {
            self.partial = Some(segment);
            false
        }
    }

    /// Finalized segments in arrival order.
    pub fn finalized(&self) -> &[TranscriptSegment] {
        &self.finalized
    }

    /// The current revisable partial, if any.
    pub fn partial(&self) -> Option<&TranscriptSegment> {
        self.partial.as_ref()
    }

    /// Finalized text, one entry per segment.
    pub fn lines(&self) -> Vec<String> {
        self.finalized.iter().map(|s| s.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn partials_are_revised_until_final() {
        let mut log = TranscriptLog::new();
        assert!(!log.apply(TranscriptSegment::partial("I ne", at(0), at(200))));
        assert!(!log.apply(TranscriptSegment::partial("I need a", at(0), at(400))));
        assert_eq!(log.partial().map(|p| p.text.as_str()), Some("I need a"));
        assert!(log.finalized().is_empty());

        assert!(log.apply(TranscriptSegment::final_text("I need a dentist", at(0), at(900))));
        assert!(log.partial().is_none());
        assert_eq!(log.lines(), vec!["I need a dentist".to_owned()]);
    }

    #[test]
    fn finalized_segments_are_append_only() {
        let mut log = TranscriptLog::new();
        log.apply(TranscriptSegment::final_text("hello", at(0), at(300)));
        log.apply(TranscriptSegment::partial("hel", at(400), at(500)));
        log.apply(TranscriptSegment::final_text("help", at(400), at(700)));
        assert_eq!(log.lines(), vec!["hello".to_owned(), "help".to_owned()]);
        assert_eq!(log.finalized()[0].end, at(300));
    }

    #[test]
    fn blank_finals_are_ignored() {
        let mut log = TranscriptLog::new();
        assert!(!log.apply(TranscriptSegment::final_text("  ", at(0), at(100))));
        assert!(log.finalized().is_empty());
    }
}
