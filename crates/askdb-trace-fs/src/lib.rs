#![forbid(unsafe_code)]

use std::fs;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use askdb_domain::{Request, RequestId, Trace};
use askdb_trace_core::TraceStore;

/// Traces as pretty-printed JSON files, one `<request_id>.json` per request.
#[derive(Debug, Clone)]
pub struct JsonFileTraceStore {
    dir: PathBuf,
}

impl JsonFileTraceStore {
    #[must_use]
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, request_id: RequestId) -> PathBuf {
        self.dir.join(format!("{request_id}.json"))
    }
}

impl TraceStore for JsonFileTraceStore {
    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create trace dir {}", self.dir.display()))
    }

    fn persist(&self, request: &Request) -> Result<Trace> {
        let trace = Trace::from_request(request);
        let path = self.path_for(trace.request_id);

        // Staged next to the target so the final rename never crosses filesystems.
        let staged = tempfile::Builder::new()
            .prefix(".askdb-trace-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .with_context(|| format!("failed to stage trace in {}", self.dir.display()))?;
        let mut writer = BufWriter::new(staged);
        serde_json::to_writer_pretty(&mut writer, &trace)
            .with_context(|| format!("failed to write trace {}", path.display()))?;
        let staged = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("failed to flush trace {}", path.display()))?;
        staged.as_file().sync_all()?;
        staged
            .persist_noclobber(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to create trace file {}", path.display()))?;

        tracing::debug!(
            request_id = %trace.request_id,
            path = %path.display(),
            steps = trace.total_steps,
            "trace persisted"
        );
        Ok(trace)
    }

    fn retrieve(&self, request_id: RequestId) -> Result<Option<Trace>> {
        let Some(raw) = self.retrieve_raw(request_id)? else {
            return Ok(None);
        };
        let trace = serde_json::from_str(&raw)
            .with_context(|| format!("invalid trace JSON for request {request_id}"))?;
        Ok(Some(trace))
    }

    fn retrieve_raw(&self, request_id: RequestId) -> Result<Option<String>> {
        let path = self.path_for(request_id);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read trace {}", path.display()))
            }
        }
    }

    fn list(&self) -> Result<Vec<RequestId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list trace dir {}", self.dir.display()))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(id) = RequestId::from_str(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
