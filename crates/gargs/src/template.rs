//! Command templates: `{}` and `{N}` placeholders.
//!
//! `{}` expands to the record's first line; `{N}` to the record's N-th
//! token (separator fields with `--sep`, lines with `--nlines`). Any other
//! braces — awk bodies, shell brace expansion — pass through untouched, so
//! `gargs "awk '{print \$1}' {}"` does what it looks like.

/// A parsed command template.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    /// `{}` — the record's first line.
    Record,
    /// `{N}` — the record's N-th token.
    Token(usize),
}

/// Filling failed for one record.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template wants token {{{index}}} but the record has only {available}")]
    TokenOutOfRange { index: usize, available: usize },
}

impl Template {
    /// Parse a template. Never fails: braces that are not `{}` or `{N}`
    /// stay literal.
    pub fn parse(source: &str) -> Self {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            let (before, after) = rest.split_at(open);
            literal.push_str(before);

            if let Some(close) = after.find('}') {
                let inner = &after[1..close];
                let part = if inner.is_empty() {
                    Some(Part::Record)
                } else if inner.bytes().all(|b| b.is_ascii_digit()) {
                    inner.parse().ok().map(Part::Token)
                } else {
                    None
                };
                if let Some(part) = part {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(part);
                    rest = &after[close + 1..];
                    continue;
                }
            }

            // Not a placeholder: keep the brace and carry on after it.
            literal.push('{');
            rest = &after[1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Template { parts }
    }

    /// Materialize one command string for a record.
    pub fn fill(&self, lines: &[String], tokens: &[String]) -> Result<String, TemplateError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Record => {
                    if let Some(first) = lines.first() {
                        out.push_str(first);
                    }
                }
                Part::Token(index) => match tokens.get(*index) {
                    Some(token) => out.push_str(token),
                    None => {
                        return Err(TemplateError::TokenOutOfRange {
                            index: *index,
                            available: tokens.len(),
                        });
                    }
                },
            }
        }
        Ok(out)
    }
}
