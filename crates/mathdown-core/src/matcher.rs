use regex::Regex;

/// An `(opening, closing)` token pair denoting inline or display math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimiterPair {
    pub open: &'static str,
    pub close: &'static str,
}

impl DelimiterPair {
    pub const fn new(open: &'static str, close: &'static str) -> Self {
        Self { open, close }
    }
}

pub const INLINE_DELIMITERS: [DelimiterPair; 2] = [
    DelimiterPair::new("$", "$"),
    DelimiterPair::new("\\(", "\\)"),
];

pub const DISPLAY_DELIMITERS: [DelimiterPair; 2] = [
    DelimiterPair::new("$$", "$$"),
    DelimiterPair::new("\\[", "\\]"),
];

/// A delimited span found in a text run. Offsets are byte offsets into the
/// scanned text; `source` is the full delimited substring, delimiters
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimiterMatch {
    pub start: usize,
    pub end: usize,
    pub source: String,
}

#[derive(Debug, Clone)]
struct CompiledPair {
    pattern: Regex,
}

/// A set of delimiter pairs with their scan patterns compiled up front.
/// Delimiter tokens are escaped, so tokens that happen to be regex
/// metacharacters (`$`, `\(`, ...) match literally.
#[derive(Debug, Clone)]
pub struct DelimiterSet {
    pairs: Vec<CompiledPair>,
}

impl DelimiterSet {
    pub fn new(pairs: &[DelimiterPair]) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let pattern = Regex::new(&format!(
                "{}(.*?){}",
                regex::escape(pair.open),
                regex::escape(pair.close)
            ))?;
            compiled.push(CompiledPair { pattern });
        }
        Ok(Self { pairs: compiled })
    }

    pub fn inline() -> Self {
        Self::new(&INLINE_DELIMITERS).expect("built-in inline delimiters must compile")
    }

    pub fn display() -> Self {
        Self::new(&DISPLAY_DELIMITERS).expect("built-in display delimiters must compile")
    }

    /// Finds the earliest delimited span in `text`.
    ///
    /// Each pair contributes at most its leftmost match; a match whose
    /// content is empty or all-whitespace is discarded, and the pair then
    /// contributes nothing for this text. Among the surviving candidates the
    /// lowest start offset wins; on a tie the earlier pair in declaration
    /// order wins. Pure and deterministic.
    pub fn find_earliest_match(&self, text: &str) -> Option<DelimiterMatch> {
        let mut earliest: Option<DelimiterMatch> = None;

        for pair in &self.pairs {
            let Some(caps) = pair.pattern.captures(text) else {
                continue;
            };
            let (Some(full), Some(content)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if content.as_str().trim().is_empty() {
                continue;
            }
            if earliest
                .as_ref()
                .is_none_or(|found| full.start() < found.start)
            {
                earliest = Some(DelimiterMatch {
                    start: full.start(),
                    end: full.end(),
                    source: full.as_str().to_string(),
                });
            }
        }

        earliest
    }
}
