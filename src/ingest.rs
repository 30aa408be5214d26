use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use thiserror::Error;

use crate::alb_log::{index_mapping, parse_line};
use crate::index::{BulkDocument, IndexError, SearchIndex};
use crate::store::{ReadError, Store};
use crate::utils::Partition;

/// What to do when the newest indexed timestamp cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum HighWaterMarkPolicy {
    /// Log a warning and index the whole partition. Already indexed lines are
    /// written again; their stable ids keep the index free of duplicates.
    #[default]
    FallBack,
    /// Fail the run.
    Abort,
}

pub struct IngestRequest<'a> {
    pub base_prefix: &'a str,
    pub index: &'a str,
    pub partition: Partition,
    pub policy: HighWaterMarkPolicy,
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub objects: usize,
    pub lines: usize,
    /// Lines that did not match the ALB layout or were not UTF-8.
    pub malformed: usize,
    /// Records at or before the high-water mark.
    pub stale: usize,
    pub written: usize,
    pub high_water_mark: Option<DateTime<Utc>>,
    pub high_water_mark_fallback: bool,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("could not create index '{index}': {source}")]
    CreateIndex {
        index: String,
        #[source]
        source: IndexError,
    },
    #[error("could not read the high-water mark of '{index}': {source}")]
    Query {
        index: String,
        #[source]
        source: IndexError,
    },
    #[error("listing '{prefix}' failed: {source}")]
    List {
        prefix: String,
        #[source]
        source: object_store::Error,
    },
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("bulk write of {documents} documents failed: {source}")]
    BulkWrite {
        documents: usize,
        #[source]
        source: IndexError,
    },
}

/// Creates `index` with the ALB mapping unless it already exists.
pub async fn ensure_index(index: &dyn SearchIndex, name: &str) -> Result<bool, IndexError> {
    if index.exists(name).await? {
        log::info!("index '{}' already exists", name);
        return Ok(false);
    }
    index.create(name, &index_mapping()).await?;
    log::info!("index '{}' created", name);
    Ok(true)
}

/// Newest `log.timestamp` in `name`; `None` for an empty or missing index.
pub async fn determine_high_water_mark(
    index: &dyn SearchIndex,
    name: &str,
) -> Result<Option<DateTime<Utc>>, IndexError> {
    index.latest_timestamp(name).await
}

/// Indexes every record of `request.partition` newer than the high-water mark
/// in a single bulk write.
pub async fn ingest(
    store: &Store,
    index: &dyn SearchIndex,
    request: &IngestRequest<'_>,
) -> Result<IngestReport, IngestError> {
    let mut report = IngestReport::default();

    ensure_index(index, request.index)
        .await
        .map_err(|source| IngestError::CreateIndex {
            index: request.index.to_string(),
            source,
        })?;

    match determine_high_water_mark(index, request.index).await {
        Ok(Some(mark)) => {
            log::info!("last indexed log time: {}", mark);
            report.high_water_mark = Some(mark);
        }
        Ok(None) => log::info!("no previous logs found, indexing the whole of {}", request.partition),
        Err(source) => match request.policy {
            HighWaterMarkPolicy::Abort => {
                return Err(IngestError::Query {
                    index: request.index.to_string(),
                    source,
                })
            }
            HighWaterMarkPolicy::FallBack => {
                log::warn!(
                    "could not read the high-water mark of '{}', indexing unfiltered: {}",
                    request.index,
                    source
                );
                report.high_water_mark_fallback = true;
            }
        },
    }

    let prefix = request.partition.prefix(request.base_prefix);
    let mut objects = store.list_objects(&prefix);
    let mut documents = Vec::new();

    while let Some(meta) = objects
        .try_next()
        .await
        .map_err(|source| IngestError::List {
            prefix: prefix.clone(),
            source,
        })?
    {
        log::info!("processing ALB log: {}", meta.location);
        report.objects += 1;

        for line in store.read_gzip_lines(&meta.location).await? {
            let line = line?;
            report.lines += 1;
            let Some(record) = line.ok().and_then(|l| parse_line(&l)) else {
                report.malformed += 1;
                log::debug!("skipping malformed line in {}", meta.location);
                continue;
            };
            if report.high_water_mark.is_some_and(|mark| record.timestamp <= mark) {
                report.stale += 1;
                continue;
            }
            documents.push(BulkDocument {
                index: request.index.to_string(),
                id: Some(record.document_id()),
                source: record.to_document(),
            });
        }
    }

    if report.malformed > 0 {
        log::warn!(
            "skipped {} malformed lines out of {} in {}",
            report.malformed,
            report.lines,
            prefix
        );
    }

    if documents.is_empty() {
        log::info!("nothing new to index in {}", prefix);
        return Ok(report);
    }

    let count = documents.len();
    report.written = index
        .bulk(documents)
        .await
        .map_err(|source| IngestError::BulkWrite {
            documents: count,
            source,
        })?;
    log::info!("indexed {} logs to index {}", report.written, request.index);

    Ok(report)
}
