use chrono::Local;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Sink for the per-statement comparison reports.
pub trait Exporter: Send + Sync {
    fn ship(&self, json: &Value);
}

/// Appends one newline-terminated JSON object per report.
pub struct FileExporter {
    path: PathBuf,
    file: Mutex<File>,
}

impl Exporter for FileExporter {
    fn ship(&self, json: &Value) {
        let mut line = json.to_string();
        line.push('\n');
        let mut file = self.file.lock().unwrap();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("could not write report to '{}': {e}", self.path.display());
        }
    }
}

/// Open the report file for one main/other pair under
/// `{data_dir}/diff/{service}/`.
pub fn build_exporter(
    data_dir: &Path,
    service: &str,
    main: &str,
    other: &str,
) -> std::io::Result<Arc<dyn Exporter>> {
    let dir = data_dir.join("diff").join(service);
    std::fs::create_dir_all(&dir)?;

    let timestamp = Local::now().format("%Y-%m-%d_%H%M%S");
    let path = dir.join(format!("{main}_{other}_{timestamp}.json"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    Ok(Arc::new(FileExporter {
        path,
        file: Mutex::new(file),
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Keeps every shipped report in memory for assertions.
    #[derive(Default)]
    pub struct CollectingExporter {
        pub reports: Mutex<Vec<Value>>,
    }

    impl Exporter for CollectingExporter {
        fn ship(&self, json: &Value) {
            self.reports.lock().unwrap().push(json.clone());
        }
    }

    impl CollectingExporter {
        pub fn take(&self) -> Vec<Value> {
            std::mem::take(&mut self.reports.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_exporter_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = build_exporter(dir.path(), "MyService", "main1", "other1").unwrap();
        exporter.ship(&json!({"id": 1}));
        exporter.ship(&json!({"id": 2}));

        let service_dir = dir.path().join("diff").join("MyService");
        let entry = std::fs::read_dir(&service_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let name = entry.file_name().into_string().unwrap();
        assert!(name.starts_with("main1_other1_"));
        assert!(name.ends_with(".json"));

        let contents = std::fs::read_to_string(entry.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"id\":1}");
    }
}
