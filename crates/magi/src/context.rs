//! Token budget enforcement with importance selection and summarization.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::{ConsensusPhase, ReductionLogEntry, ReductionStrategy};

/// Optional summarization step invoked when importance selection alone does
/// not fit the budget. Implementations may call an LLM.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, context: &str, target_tokens: usize) -> anyhow::Result<String>;
}

/// Result of applying the budget to a context string.
#[derive(Debug, Clone)]
pub struct BudgetResult {
    pub context: String,
    pub summary_applied: bool,
    pub reduced_tokens: usize,
    pub logs: Vec<ReductionLogEntry>,
}

/// Enforces a token ceiling over deliberation context. Estimation is a
/// deterministic language-aware heuristic; identical input always yields the
/// same count.
pub struct TokenBudgetManager {
    max_tokens: usize,
    summarizer: Option<Box<dyn Summarizer>>,
}

impl TokenBudgetManager {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Estimate token count. ASCII text averages about four characters per
    /// token; CJK and other wide scripts about one token per character.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        let mut narrow = 0usize;
        let mut wide = 0usize;
        for ch in text.chars() {
            if is_wide_script(ch) {
                wide += 1;
            } else {
                narrow += 1;
            }
        }
        narrow.div_ceil(4) + wide
    }

    /// Reduce `context` until it fits the budget.
    ///
    /// 1. Pass through when already under budget.
    /// 2. Importance selection: keep segments by score (newest round intact).
    /// 3. If still over, run the summarizer; on summarizer failure fall back
    ///    to head/tail truncation and flag the log entry.
    ///
    /// The returned context is always within the budget.
    pub async fn enforce_budget(&self, context: &str, phase: ConsensusPhase) -> BudgetResult {
        let before = self.estimate_tokens(context);
        if before <= self.max_tokens {
            return BudgetResult {
                context: context.to_string(),
                summary_applied: false,
                reduced_tokens: 0,
                logs: Vec::new(),
            };
        }

        let mut logs = Vec::new();
        let selected = self.select_by_importance(context);
        let mut after = self.estimate_tokens(&selected);
        let mut reduced = selected;
        let mut strategy = ReductionStrategy::PrioritySelectionOnly;
        let mut summary_applied = false;

        if after > self.max_tokens {
            strategy = ReductionStrategy::WithSummary;
            summary_applied = true;
            reduced = match &self.summarizer {
                Some(summarizer) => {
                    match summarizer.summarize(&reduced, self.max_tokens).await {
                        Ok(summary) => summary,
                        Err(err) => {
                            warn!(error = %err, "context.summarizer_failed");
                            self.truncate_head_tail(&reduced)
                        }
                    }
                }
                None => self.truncate_head_tail(&reduced),
            };
            // A summarizer is free-form output; re-check and clamp.
            if self.estimate_tokens(&reduced) > self.max_tokens {
                reduced = self.truncate_head_tail(&reduced);
            }
            after = self.estimate_tokens(&reduced);
        }

        let retain_ratio = if before == 0 {
            1.0
        } else {
            after as f64 / before as f64
        };
        logs.push(ReductionLogEntry {
            phase,
            size_before: before,
            size_after: after,
            retain_ratio,
            summary_applied,
            strategy,
        });
        info!(
            phase = %phase,
            before_tokens = before,
            after_tokens = after,
            retain_ratio = format!("{:.3}", retain_ratio),
            summary_applied,
            "context.reduced"
        );

        BudgetResult {
            context: reduced,
            summary_applied,
            reduced_tokens: before.saturating_sub(after),
            logs,
        }
    }

    /// Score paragraph segments and keep the most important ones in original
    /// order until the budget is filled. Later segments (the most recent
    /// round) score higher so they survive reduction.
    fn select_by_importance(&self, context: &str) -> String {
        let segments: Vec<&str> = context.split("\n\n").collect();
        let total = segments.len();
        let mut scored: Vec<(i64, usize, &str)> = segments
            .iter()
            .enumerate()
            .map(|(idx, segment)| (score_segment(segment, idx, total), idx, *segment))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut picked_indices = Vec::new();
        let mut token_count = 0usize;
        for (_, idx, segment) in &scored {
            let segment_tokens = self.estimate_tokens(segment);
            if token_count + segment_tokens > self.max_tokens {
                continue;
            }
            picked_indices.push(*idx);
            token_count += segment_tokens;
        }

        if picked_indices.is_empty() {
            // Every segment is individually over budget; hand the first to
            // the summarization step unchanged.
            return segments.first().copied().unwrap_or_default().to_string();
        }

        picked_indices.sort_unstable();
        picked_indices
            .iter()
            .map(|&idx| segments[idx])
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Last-resort reduction: keep the head and tail of the text, dropping
    /// the middle.
    fn truncate_head_tail(&self, context: &str) -> String {
        let chars: Vec<char> = context.chars().collect();
        // Conservative bound: one token per character keeps any script under
        // budget; reserve a little room for the elision marker.
        let keep = self.max_tokens.saturating_sub(8).max(2);
        if chars.len() <= keep {
            return context.to_string();
        }
        let head: String = chars[..keep / 2].iter().collect();
        let tail: String = chars[chars.len() - keep / 2..].iter().collect();
        format!("{}\n...\n{}", head, tail)
    }
}

fn is_wide_script(ch: char) -> bool {
    matches!(ch,
        '\u{1100}'..='\u{11FF}'   // Hangul Jamo
        | '\u{2E80}'..='\u{9FFF}' // CJK radicals through unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // Hangul syllables
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility ideographs
        | '\u{FF00}'..='\u{FFEF}' // Full-width forms
        | '\u{20000}'..='\u{2FA1F}' // CJK extension B+
    )
}

fn score_segment(segment: &str, idx: usize, total: usize) -> i64 {
    let mut score: i64 = 1;
    for marker in ["##", "###", "---", "[", "Thinking", "Debate", "Round"] {
        if segment.contains(marker) {
            score += 2;
            break;
        }
    }
    if segment.chars().count() < 120 {
        score += 1;
    }
    // Recency bonus: the final quarter of the context is the newest round.
    if total > 0 && idx * 4 >= total * 3 {
        score += 3;
    }
    score
}
