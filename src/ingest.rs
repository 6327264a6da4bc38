//! Ingestion coordinator.
//!
//! Reads a comma-delimited `email,password` stream (no header), drops
//! malformed lines and exact repeats, partitions the remaining records and
//! runs one chunk task per partition. Chunk tasks run in a [`JoinSet`],
//! at most `max_parallel_chunks` at a time, each with its own store session.
//!
//! A failed chunk never affects the others. Whether a partial run counts as
//! a failure is the caller's choice, via [`IngestReport::ensure_complete`],
//! which rejects both failed chunks and dropped records.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::{Config, IngestConfig};
use crate::credential::{scheme_from_config, CredentialScheme};
use crate::db;
use crate::error::{IngestError, ParseError};
use crate::models::IngestionRecord;
use crate::partition::partition;
use crate::processor::{ChunkProcessor, ChunkReport};
use crate::store::{SqliteStore, Store};

/// Aggregate counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Non-blank input lines.
    pub records_read: usize,
    pub malformed: usize,
    /// Exact `(email, password)` repeats dropped before partitioning.
    pub duplicates: usize,
    pub unique: usize,
    pub chunks: usize,
    pub inserted: usize,
    pub touched: usize,
    /// Records that could not be stored, e.g. a password that failed to encrypt.
    pub failed_records: usize,
    /// Records re-checked because a concurrent chunk wrote the same email.
    pub rechecked_records: usize,
    pub failed_chunks: usize,
    pub cancelled_chunks: usize,
    pub chunk_errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl IngestReport {
    /// Fail if any chunk failed or any record was dropped.
    pub fn ensure_complete(&self) -> Result<(), IngestError> {
        if self.failed_chunks > 0 || self.failed_records > 0 {
            return Err(IngestError::Incomplete {
                failed_chunks: self.failed_chunks,
                chunks: self.chunks,
                failed_records: self.failed_records,
            });
        }
        Ok(())
    }

    fn absorb(&mut self, chunk: &ChunkReport) {
        self.inserted += chunk.inserted;
        self.touched += chunk.touched;
        self.failed_records += chunk.failed;
        self.rechecked_records += chunk.rechecked;
        if chunk.cancelled {
            self.cancelled_chunks += 1;
        }
    }
}

/// Records parsed from a stream, with line counters.
#[derive(Debug, Default)]
pub struct ParsedInput {
    pub records: Vec<IngestionRecord>,
    pub lines: usize,
    pub malformed: usize,
}

/// Parse one line into a normalized record.
pub fn parse_line(line_no: u64, line: &[u8]) -> Result<IngestionRecord, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line);

    let mut fields = csv::StringRecord::new();
    match reader.read_record(&mut fields) {
        Ok(true) => {}
        Ok(false) => return Err(ParseError::FieldCount { line: line_no, found: 0 }),
        Err(e) => {
            return Err(ParseError::Csv {
                line: line_no,
                reason: e.to_string(),
            })
        }
    }

    if fields.len() != 2 {
        return Err(ParseError::FieldCount {
            line: line_no,
            found: fields.len(),
        });
    }
    let (email, password) = (&fields[0], &fields[1]);
    if email.trim().is_empty() {
        return Err(ParseError::EmptyField {
            line: line_no,
            field: "email",
        });
    }
    if password.trim().is_empty() {
        return Err(ParseError::EmptyField {
            line: line_no,
            field: "password",
        });
    }

    Ok(IngestionRecord::new(email, password))
}

/// Read every line of `reader`. Blank lines are skipped without counting.
pub async fn parse_stream<R>(reader: R) -> Result<ParsedInput, IngestError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut parsed = ParsedInput::default();
    let mut buf = Vec::new();
    let mut line_no = 0u64;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        line_no += 1;

        let line = trim_line_end(&buf);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        parsed.lines += 1;

        match parse_line(line_no, line) {
            Ok(record) => parsed.records.push(record),
            Err(e) => {
                debug!(error = %e, "skipping malformed line");
                parsed.malformed += 1;
            }
        }
    }

    Ok(parsed)
}

fn trim_line_end(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Drop exact repeats, keeping first occurrences in order.
pub fn dedup_records(records: Vec<IngestionRecord>) -> (Vec<IngestionRecord>, usize) {
    let total = records.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<IngestionRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect();
    let dropped = total - unique.len();
    (unique, dropped)
}

/// Runs ingestion against a store.
pub struct Ingestor {
    store: Arc<dyn Store>,
    processor: ChunkProcessor,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        scheme: Arc<dyn CredentialScheme>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            processor: ChunkProcessor::new(scheme),
            config,
        }
    }

    /// Ingest a whole stream.
    pub async fn ingest<R>(&self, reader: R) -> Result<IngestReport, IngestError>
    where
        R: AsyncRead + Unpin,
    {
        self.ingest_with_cancel(reader, CancellationToken::new())
            .await
    }

    /// Ingest a whole stream. Once `cancel` fires, no chunk starts and no
    /// chunk issues a new commit.
    pub async fn ingest_with_cancel<R>(
        &self,
        reader: R,
        cancel: CancellationToken,
    ) -> Result<IngestReport, IngestError>
    where
        R: AsyncRead + Unpin,
    {
        let started = Instant::now();
        let parsed = parse_stream(reader).await?;
        let mut report = self.ingest_records(parsed.records, cancel).await;
        report.records_read = parsed.lines;
        report.malformed = parsed.malformed;
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            records_read = report.records_read,
            malformed = report.malformed,
            duplicates = report.duplicates,
            inserted = report.inserted,
            touched = report.touched,
            failed_chunks = report.failed_chunks,
            elapsed_ms = report.elapsed_ms,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Deduplicate, partition and process already-parsed records.
    pub async fn ingest_records(
        &self,
        records: Vec<IngestionRecord>,
        cancel: CancellationToken,
    ) -> IngestReport {
        let started = Instant::now();
        let mut report = IngestReport {
            records_read: records.len(),
            ..IngestReport::default()
        };

        let (unique, duplicates) = dedup_records(records);
        report.duplicates = duplicates;
        report.unique = unique.len();

        let parts = partition(unique, self.config.max_chunks);
        report.chunks = parts.len();

        let permits = Arc::new(Semaphore::new(self.config.max_parallel_chunks.max(1)));
        let mut tasks = JoinSet::new();

        for (index, chunk) in parts.into_iter().enumerate() {
            let store = self.store.clone();
            let processor = self.processor.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();

            tasks.spawn(
                async move {
                    let records = chunk.len();
                    let cancelled = ChunkReport {
                        records,
                        cancelled: true,
                        ..ChunkReport::default()
                    };

                    let permit = tokio::select! {
                        _ = cancel.cancelled() => None,
                        permit = permits.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return Ok(cancelled);
                    };
                    if cancel.is_cancelled() {
                        return Ok(cancelled);
                    }

                    let mut session = store.session().await.map_err(IngestError::Session)?;
                    processor.process(session.as_mut(), chunk, &cancel).await
                }
                .instrument(info_span!("chunk", index)),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(chunk)) => report.absorb(&chunk),
                Ok(Err(e)) => {
                    error!(error = %e, "chunk failed");
                    report.failed_chunks += 1;
                    report.chunk_errors.push(e.to_string());
                }
                Err(e) => {
                    error!(error = %e, "chunk task panicked");
                    report.failed_chunks += 1;
                    report.chunk_errors.push(e.to_string());
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }
}

/// Build an [`Ingestor`] over the configured SQLite database.
pub async fn ingestor_from_config(config: &Config) -> anyhow::Result<Ingestor> {
    let pool = db::connect(config).await?;
    let scheme = scheme_from_config(&config.credentials)?;
    Ok(Ingestor::new(
        Arc::new(SqliteStore::new(pool)),
        scheme,
        config.ingest.clone(),
    ))
}

/// `leakmon ingest <file|->`: ingest a file or stdin and print a summary.
pub async fn run_ingest(config: &Config, input: &str) -> anyhow::Result<()> {
    let ingestor = ingestor_from_config(config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = if input == "-" {
        ingestor
            .ingest_with_cancel(tokio::io::stdin(), cancel)
            .await?
    } else {
        let file = tokio::fs::File::open(Path::new(input))
            .await
            .with_context(|| format!("Failed to open input file: {}", input))?;
        ingestor.ingest_with_cancel(file, cancel).await?
    };

    println!("ingest {}", input);
    println!("  records read: {}", report.records_read);
    println!("  malformed: {}", report.malformed);
    println!("  duplicates: {}", report.duplicates);
    println!("  chunks: {}", report.chunks);
    println!("  inserted: {}", report.inserted);
    println!("  touched: {}", report.touched);
    if report.failed_records > 0 {
        println!("  failed records: {}", report.failed_records);
    }
    if report.cancelled_chunks > 0 {
        println!("  cancelled chunks: {}", report.cancelled_chunks);
    }
    if report.failed_chunks > 0 {
        println!("  failed chunks: {}", report.failed_chunks);
    }
    println!("  elapsed: {:.2}s", report.elapsed_ms as f64 / 1000.0);

    report.ensure_complete()?;
    println!("ok");
    Ok(())
}
