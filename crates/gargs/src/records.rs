//! Record reader: turns stdin lines into template inputs.

use std::io::{self, BufRead};

use regex::Regex;

/// One unit of work read from the input.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The raw lines making up the record.
    pub lines: Vec<String>,
    /// Template tokens: separator fields with `--sep`, the lines otherwise.
    pub tokens: Vec<String>,
}

/// Read records from `input`, calling `emit` for each one. Stops early when
/// `emit` returns false (the consumer went away).
///
/// With `sep`, every line becomes one record split into tokens. Otherwise
/// lines are grouped `nlines` at a time; the final group may be short.
pub fn read_records(
    input: impl BufRead,
    nlines: usize,
    sep: Option<&Regex>,
    mut emit: impl FnMut(Record) -> bool,
) -> io::Result<()> {
    let nlines = nlines.max(1);
    let mut group: Vec<String> = Vec::with_capacity(nlines);

    for line in input.lines() {
        let line = line?;
        if let Some(re) = sep {
            let tokens: Vec<String> = re.split(&line).map(str::to_string).collect();
            let record = Record {
                lines: vec![line],
                tokens,
            };
            if !emit(record) {
                return Ok(());
            }
        } else {
            group.push(line);
            if group.len() == nlines {
                let lines = std::mem::take(&mut group);
                let record = Record {
                    tokens: lines.clone(),
                    lines,
                };
                if !emit(record) {
                    return Ok(());
                }
            }
        }
    }

    if !group.is_empty() {
        let record = Record {
            tokens: group.clone(),
            lines: group,
        };
        emit(record);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(input: &str, nlines: usize, sep: Option<&Regex>) -> Vec<Record> {
        let mut records = Vec::new();
        read_records(input.as_bytes(), nlines, sep, |r| {
            records.push(r);
            true
        })
        .unwrap();
        records
    }

    #[test]
    fn test_one_line_per_record() {
        let records = collect("a\nb\nc\n", 1, None);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lines, vec!["a"]);
        assert_eq!(records[0].tokens, vec!["a"]);
    }

    #[test]
    fn test_groups_of_two() {
        let records = collect("a\nb\nc\nd\n", 2, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lines, vec!["a", "b"]);
        assert_eq!(records[1].lines, vec!["c", "d"]);
    }

    #[test]
    fn test_short_final_group() {
        let records = collect("a\nb\nc\n", 2, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].lines, vec!["c"]);
    }

    #[test]
    fn test_separator_splits_tokens() {
        let re = Regex::new(r"\s+").unwrap();
        let records = collect("host1  /tmp/x\nhost2 /tmp/y\n", 1, Some(&re));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tokens, vec!["host1", "/tmp/x"]);
        assert_eq!(records[0].lines, vec!["host1  /tmp/x"]);
        assert_eq!(records[1].tokens, vec!["host2", "/tmp/y"]);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let records = collect("a\r\nb\r\n", 1, None);
        assert_eq!(records[0].lines, vec!["a"]);
        assert_eq!(records[1].lines, vec!["b"]);
    }

    #[test]
    fn test_missing_trailing_newline() {
        let records = collect("a\nb", 1, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].lines, vec!["b"]);
    }

    #[test]
    fn test_emit_false_stops_reading() {
        let mut seen = 0;
        read_records("a\nb\nc\n".as_bytes(), 1, None, |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_empty_input() {
        let records = collect("", 1, None);
        assert!(records.is_empty());
    }
}
