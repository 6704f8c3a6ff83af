/// Byte offset → line lookups over one source text.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Offset of the first byte of every line.
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        LineIndex { starts, len: source.len() }
    }

    /// 1-based line containing `offset`.
    pub fn line_of(&self, offset: usize) -> u32 {
        self.starts.partition_point(|&start| start <= offset) as u32
    }

    /// 1-based (line, column) of `offset`; columns count bytes.
    pub fn position(&self, offset: usize) -> (u32, usize) {
        let line = self.line_of(offset);
        let start = self.starts[line as usize - 1];
        (line, offset.saturating_sub(start) + 1)
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// Text of a 1-based line without its terminator.
    pub fn line_text<'s>(&self, source: &'s str, line: u32) -> &'s str {
        let idx = line as usize;
        if idx == 0 || idx > self.starts.len() {
            return "";
        }
        let start = self.starts[idx - 1];
        let end = self.starts.get(idx).map_or(self.len, |&next| next);
        source.get(start..end).unwrap_or("").trim_end_matches(['\n', '\r'])
    }
}
