//! Lossless text splitting.
//!
//! Budgets are in characters, not bytes. Concatenating the returned spans in
//! order always reproduces the input exactly.

/// One piece of a split text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Char offset of the first character
    pub start: usize,
    /// Char offset one past the last character
    pub end: usize,
    /// Zero-based inclusive line range, when split along lines
    pub lines: Option<(usize, usize)>,
    pub text: String,
}

impl ChunkSpan {
    pub fn char_count(&self) -> usize {
        self.end - self.start
    }
}

/// Split `text` into spans of at most `budget` characters.
///
/// Text with few newlines (fewer than `chars / budget`) is cut into fixed
/// windows. Otherwise whole lines, newline included, are packed greedily and
/// a single line longer than the budget is hard-split.
pub fn split_text(text: &str, budget: usize) -> Vec<ChunkSpan> {
    let budget = budget.max(1);
    let total_chars = text.chars().count();
    if total_chars == 0 {
        return Vec::new();
    }

    let newlines = text.bytes().filter(|b| *b == b'\n').count();
    if newlines.saturating_mul(budget) < total_chars {
        fixed_windows(text, budget, 0, None)
    } else {
        pack_lines(text, budget)
    }
}

fn fixed_windows(text: &str, budget: usize, offset: usize, line: Option<usize>) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut start = offset;
    let mut current = String::new();
    let mut count = 0;

    for c in text.chars() {
        current.push(c);
        count += 1;
        if count == budget {
            spans.push(ChunkSpan {
                start,
                end: start + count,
                lines: line.map(|l| (l, l)),
                text: std::mem::take(&mut current),
            });
            start += count;
            count = 0;
        }
    }
    if count > 0 {
        spans.push(ChunkSpan {
            start,
            end: start + count,
            lines: line.map(|l| (l, l)),
            text: current,
        });
    }
    spans
}

struct Pending {
    text: String,
    start: usize,
    chars: usize,
    first_line: usize,
    last_line: usize,
}

impl Pending {
    fn flush(&mut self, spans: &mut Vec<ChunkSpan>) {
        if self.chars == 0 {
            return;
        }
        spans.push(ChunkSpan {
            start: self.start,
            end: self.start + self.chars,
            lines: Some((self.first_line, self.last_line)),
            text: std::mem::take(&mut self.text),
        });
        self.start += self.chars;
        self.chars = 0;
    }
}

fn pack_lines(text: &str, budget: usize) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut pending = Pending {
        text: String::new(),
        start: 0,
        chars: 0,
        first_line: 0,
        last_line: 0,
    };

    for (index, line) in text.split_inclusive('\n').enumerate() {
        let line_chars = line.chars().count();

        if line_chars > budget {
            pending.flush(&mut spans);
            spans.extend(fixed_windows(line, budget, pending.start, Some(index)));
            pending.start += line_chars;
            continue;
        }

        if pending.chars + line_chars > budget {
            pending.flush(&mut spans);
        }
        if pending.chars == 0 {
            pending.first_line = index;
        }
        pending.text.push_str(line);
        pending.chars += line_chars;
        pending.last_line = index;
    }
    pending.flush(&mut spans);
    spans
}
