/// Running token allowance for a conversation.
///
/// The provider bills prompt context against the completion allowance, so as
/// the conversation grows the allowance has to grow with it. The estimate is
/// the historic four-characters-per-token heuristic; it only ever adds to the
/// allowance, never replaces it, so the value is monotonically non-decreasing
/// for the life of a conversation.
#[derive(Debug, Clone, Default)]
pub struct TokenBudget {
    allowance: u32,
}

impl TokenBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the current context into the allowance and return the adjusted
    /// max-token value for the next turn. `base` seeds the allowance on the
    /// first call of a conversation; an empty context adds nothing.
    pub fn grow(&mut self, segments: &[String], base: u32) -> u32 {
        if self.allowance == 0 {
            self.allowance = base;
        }
        self.allowance = self.allowance.saturating_add(estimate_tokens(segments));
        self.allowance
    }

    pub fn current(&self) -> u32 {
        self.allowance
    }

    /// Conversation boundary: the next `grow` reseeds from its base.
    pub fn reset(&mut self) {
        self.allowance = 0;
    }
}

fn estimate_tokens(segments: &[String]) -> u32 {
    let chars: usize = segments.iter().map(|s| s.chars().count()).sum();
    (chars / 4) as u32
}
