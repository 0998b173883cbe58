use std::fs::File;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::config::ResultsConfig;
use crate::probe::ProbeResult;

/// Per-source gzip results file writer with wall-clock rotation.
///
/// Lines are appended to a `.tmp` file; once the transaction length
/// elapses the gzip stream is finished and the file renamed into place,
/// so downstream importers only ever see complete files.
pub struct ResultsWriter {
    directory: PathBuf,
    source: IpAddr,
    transaction_length: Duration,
    current: Option<OpenFile>,
}

struct OpenFile {
    encoder: GzEncoder<File>,
    opened_at: Instant,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl ResultsWriter {
    /// Create a writer for one source, or `None` when output is disabled.
    pub fn create(cfg: &ResultsConfig, source: IpAddr) -> Result<Option<Self>> {
        if cfg.directory.is_empty() {
            return Ok(None);
        }

        let directory = PathBuf::from(&cfg.directory);
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("creating results directory {}", directory.display()))?;

        Ok(Some(Self {
            directory,
            source,
            transaction_length: cfg.transaction_length,
            current: None,
        }))
    }

    /// Append one hop probe line, rotating the file when due.
    pub fn record(&mut self, result: &ProbeResult) -> Result<()> {
        self.rotate_if_due()?;

        if self.current.is_none() {
            self.open_new()?;
        }
        let file = self.current.as_mut().context("results file not open")?;

        writeln!(
            file.encoder,
            "{} {} {} {:#04x} {} {} {}",
            result.send_time.format("%Y%m%dT%H%M%S%.6f"),
            result.source,
            result.destination.address,
            result.destination.traffic_class,
            result.destination.identifier,
            result.round,
            result.hop,
        )
        .context("writing results line")?;

        Ok(())
    }

    /// Finish and publish the current file, if any.
    pub fn close(&mut self) -> Result<()> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };

        file.encoder
            .finish()
            .context("finishing results gzip stream")?;
        std::fs::rename(&file.tmp_path, &file.final_path).with_context(|| {
            format!(
                "publishing results file {}",
                file.final_path.display()
            )
        })?;

        debug!(path = %file.final_path.display(), "results file published");

        Ok(())
    }

    fn rotate_if_due(&mut self) -> Result<()> {
        let due = self
            .current
            .as_ref()
            .is_some_and(|file| file.opened_at.elapsed() >= self.transaction_length);

        if due {
            self.close()?;
        }

        Ok(())
    }

    fn open_new(&mut self) -> Result<()> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let source = self.source.to_string().replace(':', "-");
        let final_path = self.directory.join(format!("trace-{source}-{stamp}.gz"));
        let tmp_path = final_path.with_extension("gz.tmp");

        let file = File::create(&tmp_path)
            .with_context(|| format!("creating results file {}", tmp_path.display()))?;

        self.current = Some(OpenFile {
            encoder: GzEncoder::new(file, Compression::default()),
            opened_at: Instant::now(),
            tmp_path,
            final_path,
        });

        Ok(())
    }
}

impl Drop for ResultsWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing results writer");
        }
    }
}
