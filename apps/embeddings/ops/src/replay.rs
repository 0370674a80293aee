//! Replay of archived interactions through the publisher.
//!
//! The archive is JSON lines, one interaction per line, in the same shape
//! `POST /interactions` accepts. Replayed events get fresh message ids, so
//! replaying the same window twice applies it twice.

use chrono::{DateTime, Utc};
use domain_embeddings::{EventPublisher, NewInteraction};
use eyre::{Result, WrapErr};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};
use validator::Validate;

/// Half-open window `[since, until)`. Both bounds are optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ReplayWindow {
    pub fn is_bounded(&self) -> bool {
        self.since.is_some() || self.until.is_some()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| at >= since) && self.until.is_none_or(|until| at < until)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub read: usize,
    pub published: usize,
    pub outside_window: usize,
    pub invalid: usize,
}

enum Line {
    Blank,
    Invalid(String),
    Event(NewInteraction),
}

fn parse_line(line: &str) -> Line {
    let line = line.trim();
    if line.is_empty() {
        return Line::Blank;
    }
    match serde_json::from_str::<NewInteraction>(line) {
        Ok(event) => match event.validate() {
            Ok(()) => Line::Event(event),
            Err(e) => Line::Invalid(e.to_string()),
        },
        Err(e) => Line::Invalid(e.to_string()),
    }
}

pub struct Replayer {
    publisher: EventPublisher,
    window: ReplayWindow,
    batch_size: usize,
    dry_run: bool,
}

impl Replayer {
    pub fn new(publisher: EventPublisher, window: ReplayWindow) -> Self {
        Self {
            publisher,
            window,
            batch_size: 100,
            dry_run: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Publish every valid archived event inside the window. Malformed
    /// lines are counted and skipped; a broker failure aborts the replay.
    pub async fn replay<R>(&self, reader: R) -> Result<ReplayReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut report = ReplayReport::default();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut lines = reader.lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await.wrap_err("Failed to read archive")? {
            line_no += 1;
            let event = match parse_line(&line) {
                Line::Blank => continue,
                Line::Invalid(reason) => {
                    report.read += 1;
                    report.invalid += 1;
                    warn!(line = line_no, reason = %reason, "Skipping invalid archive line");
                    continue;
                }
                Line::Event(event) => event,
            };
            report.read += 1;

            let in_window = match event.occurred_at {
                Some(at) => self.window.contains(at),
                None => !self.window.is_bounded(),
            };
            if !in_window {
                report.outside_window += 1;
                continue;
            }

            batch.push(event);
            if batch.len() >= self.batch_size {
                report.published += self.flush(&mut batch).await?;
            }
        }
        report.published += self.flush(&mut batch).await?;

        info!(
            read = report.read,
            published = report.published,
            outside_window = report.outside_window,
            invalid = report.invalid,
            dry_run = self.dry_run,
            "Replay finished"
        );
        Ok(report)
    }

    async fn flush(&self, batch: &mut Vec<NewInteraction>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let events = std::mem::take(batch);
        let count = events.len();
        if self.dry_run {
            debug!(count, "Dry run, not publishing batch");
            return Ok(count);
        }

        let published = self
            .publisher
            .publish_batch(events)
            .await
            .wrap_err("Failed to publish replay batch")?;
        Ok(published.len())
    }
}
