//! JSON Lines parsing. Each line is decoded on its own; a bad line is logged
//! and skipped, never fatal for the file.

use crate::domain::model::{json_i64, RawRecord};
use crate::utils::error::Result;
use std::io::BufRead;
use std::ops::ControlFlow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines_read: usize,
    pub records: usize,
    pub blank_lines: usize,
    pub malformed_lines: usize,
}

impl ParseStats {
    fn observe(&mut self, outcome: &LineOutcome) {
        self.lines_read += 1;
        match outcome {
            LineOutcome::Record(_) => self.records += 1,
            LineOutcome::Blank => self.blank_lines += 1,
            LineOutcome::Malformed(_) => self.malformed_lines += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Record(RawRecord),
    Blank,
    Malformed(String),
}

/// Decodes one line. `line_number` is 1-based.
pub fn parse_line(bytes: &[u8], line_number: usize) -> LineOutcome {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return LineOutcome::Malformed(format!("invalid UTF-8: {}", e)),
    };
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return LineOutcome::Blank;
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return LineOutcome::Malformed(format!("invalid JSON: {}", e)),
    };
    let serde_json::Value::Object(mut object) = value else {
        return LineOutcome::Malformed("expected a JSON object".to_string());
    };

    LineOutcome::Record(RawRecord {
        hotel_id: object.get("hotelId").and_then(json_i64),
        platform: object
            .get("platform")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        hotel_name: object
            .get("hotelName")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        comment: object.remove("comment"),
        line_number,
        raw_line: text.to_string(),
    })
}

fn log_malformed(line_number: usize, reason: &str) {
    tracing::warn!("Skipping malformed line {}: {}", line_number, reason);
}

/// Lazy iterator over the records of a blocking reader.
pub struct RecordIter<R> {
    reader: R,
    buf: Vec<u8>,
    line_number: usize,
    stats: ParseStats,
    done: bool,
}

impl<R: BufRead> RecordIter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_number: 0,
            stats: ParseStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }
}

impl<R: BufRead> Iterator for RecordIter<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line_number += 1;
                    let outcome = parse_line(&self.buf, self.line_number);
                    self.stats.observe(&outcome);
                    match outcome {
                        LineOutcome::Record(record) => return Some(Ok(record)),
                        LineOutcome::Blank => {}
                        LineOutcome::Malformed(reason) => log_malformed(self.line_number, &reason),
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

pub fn parse_lines<R: BufRead>(reader: R) -> RecordIter<R> {
    RecordIter::new(reader)
}

/// Parses a whole in-memory file, dropping malformed lines.
pub fn parse_file(bytes: &[u8]) -> Vec<RawRecord> {
    parse_lines(bytes).filter_map(|record| record.ok()).collect()
}

/// Streaming mode: hands records to `on_batch` every `batch_size` records
/// (and once more for the remainder). The callback can stop the read early.
pub fn parse_in_batches<R, F>(reader: R, batch_size: usize, mut on_batch: F) -> Result<ParseStats>
where
    R: BufRead,
    F: FnMut(Vec<RawRecord>) -> ControlFlow<()>,
{
    let batch_size = batch_size.max(1);
    let mut records = parse_lines(reader);
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(record) = records.next() {
        batch.push(record?);
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if on_batch(full).is_break() {
                return Ok(records.stats());
            }
        }
    }
    if !batch.is_empty() {
        let _ = on_batch(batch);
    }
    Ok(records.stats())
}

/// Async counterpart used by the orchestrator on downloaded object bodies.
pub struct RecordStream<R> {
    reader: R,
    batch_size: usize,
    buf: Vec<u8>,
    line_number: usize,
    stats: ParseStats,
    exhausted: bool,
}

impl<R: AsyncBufRead + Unpin> RecordStream<R> {
    pub fn new(reader: R, batch_size: usize) -> Self {
        Self {
            reader,
            batch_size: batch_size.max(1),
            buf: Vec::new(),
            line_number: 0,
            stats: ParseStats::default(),
            exhausted: false,
        }
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Reads until `batch_size` records are collected or the body ends.
    /// Returns `Ok(None)` once nothing is left.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while !self.exhausted && batch.len() < self.batch_size {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                self.exhausted = true;
                break;
            }
            self.line_number += 1;
            let outcome = parse_line(&self.buf, self.line_number);
            self.stats.observe(&outcome);
            match outcome {
                LineOutcome::Record(record) => batch.push(record),
                LineOutcome::Blank => {}
                LineOutcome::Malformed(reason) => log_malformed(self.line_number, &reason),
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGODA_LINE: &str = r#"{"hotelId": 10984, "platform": "Agoda", "hotelName": "Oscar Saigon Hotel", "comment": {"hotelReviewId": 948353737, "providerId": 332, "rating": 6.4, "reviewDate": "2025-04-10T05:37:00+07:00", "reviewComments": "Hotel room is basic and very small."}}"#;

    fn lines(parts: &[&str]) -> String {
        parts.join("\n")
    }

    #[test]
    fn test_invalid_json_line_is_skipped_but_numbering_is_kept() {
        let content = lines(&[AGODA_LINE, "{not json", AGODA_LINE]);

        let records = parse_file(content.as_bytes());

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line_number, 1);
        assert_eq!(records[1].line_number, 3);
        assert_eq!(records[0].hotel_id, Some(10984));
        assert_eq!(records[0].platform.as_deref(), Some("Agoda"));
        assert_eq!(records[0].external_review_id(), Some(948353737));
    }

    #[test]
    fn test_blank_lines_are_not_errors() {
        let content = format!("{}\n\n   \n\r\n{}\n", AGODA_LINE, AGODA_LINE);
        let mut iter = parse_lines(content.as_bytes());
        let records: Vec<_> = iter.by_ref().collect::<Result<Vec<_>>>().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].line_number, 5);
        let stats = iter.stats();
        assert_eq!(stats.blank_lines, 3);
        assert_eq!(stats.malformed_lines, 0);
    }

    #[test]
    fn test_non_object_and_bad_utf8_are_malformed() {
        assert!(matches!(parse_line(b"[1, 2]", 1), LineOutcome::Malformed(_)));
        assert!(matches!(parse_line(b"42", 1), LineOutcome::Malformed(_)));
        assert!(matches!(
            parse_line(&[0xff, 0xfe, b'{', b'}'], 1),
            LineOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_raw_line_is_kept_for_diagnostics() {
        match parse_line(format!("{}\r\n", AGODA_LINE).as_bytes(), 7) {
            LineOutcome::Record(record) => {
                assert_eq!(record.raw_line, AGODA_LINE);
                assert_eq!(record.line_number, 7);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_in_batches_invokes_callback_every_n_records() {
        let content = vec![AGODA_LINE; 250].join("\n");
        let mut sizes = Vec::new();

        let stats = parse_in_batches(content.as_bytes(), 100, |batch| {
            sizes.push(batch.len());
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(stats.records, 250);
    }

    #[test]
    fn test_parse_in_batches_can_stop_early() {
        let content = vec![AGODA_LINE; 250].join("\n");
        let mut calls = 0;

        let stats = parse_in_batches(content.as_bytes(), 100, |_| {
            calls += 1;
            ControlFlow::Break(())
        })
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(stats.records, 100);
    }

    #[tokio::test]
    async fn test_record_stream_batches() {
        let content = lines(&[AGODA_LINE, "oops", AGODA_LINE, AGODA_LINE]);
        let mut stream = RecordStream::new(content.as_bytes(), 2);

        let first = stream.next_batch().await.unwrap().unwrap();
        let second = stream.next_batch().await.unwrap().unwrap();

        assert_eq!(first.iter().map(|r| r.line_number).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(second.len(), 1);
        assert!(stream.next_batch().await.unwrap().is_none());
        assert_eq!(stream.stats().malformed_lines, 1);
    }
}
