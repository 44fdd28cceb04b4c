//! Run artifacts: failed-URL list, failed-page sidecar, Parquet snapshots and run reports.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bidscout_core::{BidRecord, FailedPage};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::summary::RunSummary;

pub const FAILED_URLS_FILE: &str = "failed_urls.txt";
pub const FAILED_PAGES_FILE: &str = "failed_pages.json";

fn failed_urls_header(at: DateTime<Utc>) -> String {
    format!(
        "# Failed URLs - Last scraper run: {}\n# One URL per line - these need to be manually checked\n",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Truncate the failed-URL list at run start.
pub async fn reset_failed_urls(output_dir: &Path, at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let path = output_dir.join(FAILED_URLS_FILE);
    fs::write(&path, failed_urls_header(at))
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Rewrite `failed_urls.txt` and the `failed_pages.json` sidecar with every outstanding page.
pub async fn write_failed_pages(output_dir: &Path, at: DateTime<Utc>, pages: &[FailedPage]) -> Result<()> {
    fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let mut text = failed_urls_header(at);
    for page in pages {
        text.push_str(&page.url);
        text.push('\n');
    }
    let urls_path = output_dir.join(FAILED_URLS_FILE);
    fs::write(&urls_path, text)
        .await
        .with_context(|| format!("writing {}", urls_path.display()))?;

    let json_path = output_dir.join(FAILED_PAGES_FILE);
    let bytes = serde_json::to_vec_pretty(pages).context("serializing failed pages")?;
    fs::write(&json_path, bytes)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    info!(count = pages.len(), path = %urls_path.display(), "wrote failed page list");
    Ok(())
}

pub async fn load_failed_pages(path: &Path) -> Result<Vec<FailedPage>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub portal_id: String,
    pub city: Option<String>,
    pub records: usize,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// One Parquet file per portal, or per portal and city for multi-agency portals, plus
/// `manifest.json`. Returns the manifest path.
pub async fn write_snapshots(
    run_dir: &Path,
    run_id: &str,
    records: &[BidRecord],
    multi_agency: &BTreeMap<String, bool>,
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut groups: BTreeMap<(String, Option<String>), Vec<&BidRecord>> = BTreeMap::new();
    for record in records {
        let city = multi_agency
            .get(&record.portal_id)
            .copied()
            .unwrap_or(false)
            .then(|| record.city_bucket().to_string());
        groups
            .entry((record.portal_id.clone(), city))
            .or_default()
            .push(record);
    }

    let mut files = Vec::with_capacity(groups.len());
    for ((portal_id, city), group) in groups {
        let name = match &city {
            Some(city) => format!("{}__{}.parquet", slug(&portal_id), slug(city)),
            None => format!("{}.parquet", slug(&portal_id)),
        };
        let path = snapshot_dir.join(name);
        write_records_parquet(&path, &group)?;
        let (sha256, bytes) = file_digest(&path)?;
        files.push(SnapshotFile {
            portal_id,
            city,
            records: group.len(),
            path: path
                .strip_prefix(run_dir)
                .unwrap_or(&path)
                .display()
                .to_string(),
            sha256,
            bytes,
        });
    }

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id: run_id.to_string(),
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_records_parquet(path: &Path, records: &[&BidRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("portal_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("agency", DataType::Utf8, true),
        ArrowField::new("detail_url", DataType::Utf8, false),
        ArrowField::new("posted_on", DataType::Utf8, true),
        ArrowField::new("due_on", DataType::Utf8, true),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("contact_name", DataType::Utf8, true),
        ArrowField::new("contact_email", DataType::Utf8, true),
        ArrowField::new("contact_phone", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("risk_tag", DataType::Utf8, true),
        ArrowField::new("low_confidence_date", DataType::Boolean, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
    ]));

    let text = |f: fn(&BidRecord) -> Option<&str>| StringArray::from(records.iter().map(|r| f(r)).collect::<Vec<_>>());
    let date = |f: fn(&BidRecord) -> Option<chrono::NaiveDate>| {
        StringArray::from(
            records
                .iter()
                .map(|r| f(r).map(|d| d.format("%Y-%m-%d").to_string()))
                .collect::<Vec<_>>(),
        )
    };
    let fetched_at = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.fetched_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let low_confidence = BooleanArray::from(records.iter().map(|r| r.is_low_confidence()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|r| Some(r.portal_id.as_str()))),
            Arc::new(text(|r| Some(r.title.as_str()))),
            Arc::new(text(|r| r.agency.as_deref())),
            Arc::new(text(|r| Some(r.detail_url.as_str()))),
            Arc::new(date(|r| r.posted_on)),
            Arc::new(date(|r| r.due_on)),
            Arc::new(text(|r| r.description.as_deref())),
            Arc::new(text(|r| r.contact.name.as_deref())),
            Arc::new(text(|r| r.contact.email.as_deref())),
            Arc::new(text(|r| r.contact.phone.as_deref())),
            Arc::new(text(|r| r.category.as_deref())),
            Arc::new(text(|r| r.risk_tag.as_deref())),
            Arc::new(low_confidence),
            Arc::new(fetched_at),
        ],
    )
    .context("building bid record batch")?;
    write_parquet(path, batch)
}

fn file_digest(path: &Path) -> Result<(String, u64)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex::encode(hasher.finalize()), bytes.len() as u64))
}

/// `run_summary.json` and a short `run_brief.md` next to the snapshots.
pub async fn write_run_report(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let totals = &summary.totals;
    let mut brief = format!(
        "# Bid Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Cutoff: {}\n- Records: {}\n- Uploaded: {} ({} failed{})\n- Still-failed pages: {}\n- Recovered pages: {}\n- Excluded by cutoff: {}\n\n## Portals\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.cutoff,
        totals.records,
        totals.uploaded,
        totals.upload_failed,
        if summary.upload.skipped { ", upload skipped" } else { "" },
        totals.failed_pages,
        totals.recovered_pages,
        totals.excluded_by_cutoff,
    );
    for portal in &summary.portals {
        brief.push_str(&format!(
            "- {} ({}): {} - {} records\n",
            portal.display_name, portal.portal_id, portal.status, portal.records
        ));
        for (city, n) in &portal.cities {
            brief.push_str(&format!("  - {city}: {n}\n"));
        }
    }
    let failures = summary.failure_lines();
    if !failures.is_empty() {
        brief.push_str("\n## Failures\n");
        for line in failures {
            brief.push_str(&format!("- {line}\n"));
        }
    }
    fs::write(run_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;
    Ok(())
}
