//! Secret redaction for captured process output and logs.

use std::sync::LazyLock;

use regex::Regex;

/// Marker substituted for every redacted substring.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Minimum length of a named secret value before it is redacted literally.
pub const MIN_SECRET_LEN: usize = 8;

/// A partial line longer than this is flushed without waiting for its newline.
pub const MAX_PENDING_LINE: usize = 16 * 1024;

static SECRET_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(token|secret|passw(or)?d|api[_-]?key|service[_-]?role|anon[_-]?key)")
        .unwrap()
});

// Long runs of token-like characters, regardless of where they came from.
static TOKEN_LIKE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_+-]{32,}").unwrap());

/// Whether an environment key looks like it names a secret.
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEY_REGEX.is_match(key)
}

/// Replaces known secret values and token-like substrings with [`REDACTION_MARKER`].
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    literals: Vec<String>,
}

impl Redactor {
    /// Redactor that redacts the given literal values (values shorter than
    /// [`MIN_SECRET_LEN`] are ignored) plus token-like substrings.
    pub fn new<I, S>(literals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut literals: Vec<String> = literals
            .into_iter()
            .map(Into::into)
            .filter(|v| v.len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a secret containing another secret is replaced whole.
        literals.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        literals.dedup();
        Self { literals }
    }

    /// Redactor built from environment pairs: values under secret-looking keys.
    pub fn from_env<'a, I>(env: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        Self::new(
            env.into_iter()
                .filter(|(key, _)| is_secret_key(key))
                .map(|(_, value)| value.clone()),
        )
    }

    /// Add more literal secrets, keeping longest-first order.
    pub fn with_literals<I, S>(self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(self.literals.into_iter().chain(extra.into_iter().map(Into::into)))
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for literal in &self.literals {
            if out.contains(literal.as_str()) {
                out = out.replace(literal.as_str(), REDACTION_MARKER);
            }
        }
        TOKEN_LIKE_REGEX
            .replace_all(&out, REDACTION_MARKER)
            .into_owned()
    }

    fn longest_literal(&self) -> usize {
        self.literals.first().map_or(0, String::len)
    }

    /// Move `cut` back so that no literal occurrence or token-like run spans
    /// it, and so it lands on a UTF-8 boundary.
    fn safe_cut(&self, bytes: &[u8], mut cut: usize) -> usize {
        loop {
            let before = cut;
            for literal in self.literals.iter().map(String::as_bytes) {
                let from = cut.saturating_sub(literal.len() - 1);
                let to = (cut + literal.len() - 1).min(bytes.len());
                if let Some(pos) = bytes[from..to].windows(literal.len()).position(|w| w == literal) {
                    cut = cut.min(from + pos);
                }
            }
            if cut == before {
                break;
            }
        }
        let is_token = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'-');
        let mut start = cut;
        while start > 0 && start < bytes.len() && is_token(bytes[start - 1]) && is_token(bytes[start]) {
            start -= 1;
        }
        if start > 0 {
            cut = start;
        }
        while cut > 0 && cut < bytes.len() && bytes[cut] & 0xC0 == 0x80 {
            cut -= 1;
        }
        cut
    }
}

/// Redacts one output stream line by line, so a secret split across two
/// pipe reads is still matched whole.
#[derive(Debug)]
pub struct LineRedactor<'a> {
    redactor: &'a Redactor,
    pending: Vec<u8>,
}

impl<'a> LineRedactor<'a> {
    pub fn new(redactor: &'a Redactor) -> Self {
        Self {
            redactor,
            pending: Vec::new(),
        }
    }

    /// Buffer `bytes` and return the redacted text of every completed line.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut cut = self
            .pending
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        if self.pending.len() - cut > MAX_PENDING_LINE {
            // Keep back enough bytes to hold any literal that is still arriving.
            let carry = self.redactor.longest_literal();
            let forced = self.redactor.safe_cut(&self.pending, self.pending.len().saturating_sub(carry));
            cut = cut.max(forced);
        }
        if cut == 0 {
            return String::new();
        }
        let rest = self.pending.split_off(cut);
        let done = std::mem::replace(&mut self.pending, rest);
        self.redactor.redact(&String::from_utf8_lossy(&done))
    }

    /// Redacted text of whatever is still buffered.
    pub fn finish(&mut self) -> String {
        let done = std::mem::take(&mut self.pending);
        if done.is_empty() {
            return String::new();
        }
        self.redactor.redact(&String::from_utf8_lossy(&done))
    }
}
