use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    config::{NodeConfig, CSV_HEADER},
    storage::{Storage, StorageError},
};

/// Sample value as broadcast to clients and written to the log.
pub fn format_reading(celsius: f32) -> String {
    format!("{celsius:.2}")
}

/// One durable log line. The space before the newline is part of the format.
pub fn format_log_line(timestamp: &str, celsius: f32) -> String {
    format!("{timestamp} - {} °C \n", format_reading(celsius))
}

/// Builds the CSV report from the full text log: header row, then the log with every
/// line separator doubled.
pub fn render_csv(text_log: &str) -> String {
    let body = text_log.replace('\n', "\n\n");
    format!("{CSV_HEADER}\n{body}")
}

/// Outcome of [`DataLog::clear`].
#[derive(Debug, Default)]
pub struct Cleared {
    pub removed: usize,
    pub failures: Vec<StorageError>,
}

/// The durable text log and its derived CSV report.
///
/// Every read-modify-write sequence runs under one lock, so a CSV regeneration from the
/// control loop never interleaves with a web handler clearing the files.
#[derive(Debug)]
pub struct DataLog<S> {
    storage: Mutex<S>,
    text_path: String,
    csv_path: String,
}

impl<S: Storage> DataLog<S> {
    pub fn new(storage: S, text_path: impl Into<String>, csv_path: impl Into<String>) -> Self {
        Self {
            storage: Mutex::new(storage),
            text_path: text_path.into(),
            csv_path: csv_path.into(),
        }
    }

    pub fn from_config(storage: S, config: &NodeConfig) -> Self {
        Self::new(
            storage,
            config.text_log_path.as_str(),
            config.csv_log_path.as_str(),
        )
    }

    pub fn text_path(&self) -> &str {
        &self.text_path
    }

    pub fn csv_path(&self) -> &str {
        &self.csv_path
    }

    pub fn append_line(&self, line: &str) -> Result<(), StorageError> {
        self.lock().append(&self.text_path, line.as_bytes())
    }

    /// Rewrites the CSV report from the current text log. Returns the report size.
    pub fn regenerate_csv(&self) -> Result<usize, StorageError> {
        let mut storage = self.lock();
        let raw = storage.read(&self.text_path)?;
        let csv = render_csv(&String::from_utf8_lossy(&raw));
        storage.write(&self.csv_path, csv.as_bytes())?;
        Ok(csv.len())
    }

    pub fn read_csv(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match self.lock().read(&self.csv_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn read_text(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match self.lock().read(&self.text_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes both files. A failure on one file does not stop removal of the other.
    pub fn clear(&self) -> Cleared {
        let mut storage = self.lock();
        let mut cleared = Cleared::default();
        for path in [&self.text_path, &self.csv_path] {
            if !storage.exists(path) {
                continue;
            }
            match storage.remove(path) {
                Ok(true) => cleared.removed += 1,
                Ok(false) => {}
                Err(err) => cleared.failures.push(err),
            }
        }
        cleared
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{CSV_LOG_PATH, TEXT_LOG_PATH},
        storage::{tests::FailingStorage, MemoryStorage},
    };

    fn data_log() -> DataLog<MemoryStorage> {
        DataLog::new(MemoryStorage::new(), TEXT_LOG_PATH, CSV_LOG_PATH)
    }

    fn csv_string(log: &DataLog<MemoryStorage>) -> String {
        String::from_utf8(log.read_csv().unwrap().unwrap()).unwrap()
    }

    #[test]
    fn log_line_keeps_two_decimals_and_trailing_space() {
        assert_eq!(
            format_log_line("2024-03-01 08:15:00", 23.5),
            "2024-03-01 08:15:00 - 23.50 °C \n"
        );
        assert_eq!(format_reading(-3.456), "-3.46");
    }

    #[test]
    fn csv_doubles_line_separators_under_header() {
        let csv = render_csv("a - 1.00 °C \nb - 2.00 °C \n");
        assert_eq!(csv, "Timestamp,Temperature\na - 1.00 °C \n\nb - 2.00 °C \n\n");
    }

    #[test]
    fn regeneration_is_idempotent() {
        let log = data_log();
        log.append_line(&format_log_line("t1", 20.0)).unwrap();
        log.append_line(&format_log_line("t2", 21.0)).unwrap();

        log.regenerate_csv().unwrap();
        let first = csv_string(&log);
        log.regenerate_csv().unwrap();
        let second = csv_string(&log);

        assert_eq!(first, second);
    }

    #[test]
    fn every_appended_line_reaches_the_report() {
        let log = data_log();
        let lines = [
            format_log_line("2024-01-01 00:00:00", 19.25),
            format_log_line("2024-01-01 00:00:30", 19.5),
            format_log_line("2024-01-01 00:01:00", 19.75),
        ];
        for line in &lines {
            log.append_line(line).unwrap();
        }
        log.regenerate_csv().unwrap();

        let csv = csv_string(&log);
        for line in &lines {
            assert!(csv.contains(&format!("{line}\n")), "missing {line:?}");
        }
    }

    #[test]
    fn regeneration_without_log_fails() {
        let log = data_log();
        assert!(matches!(
            log.regenerate_csv(),
            Err(StorageError::NotFound(_))
        ));
        assert!(log.read_csv().unwrap().is_none());
    }

    #[test]
    fn clear_reports_whether_anything_was_removed() {
        let log = data_log();
        assert_eq!(log.clear().removed, 0);

        log.append_line("x\n").unwrap();
        assert_eq!(log.clear().removed, 1);
        assert!(log.read_text().unwrap().is_none());

        log.append_line("x\n").unwrap();
        log.regenerate_csv().unwrap();
        let cleared = log.clear();
        assert_eq!(cleared.removed, 2);
        assert!(cleared.failures.is_empty());
        assert!(log.read_csv().unwrap().is_none());
    }

    #[test]
    fn clear_keeps_going_after_one_file_fails() {
        let log = DataLog::new(
            FailingStorage::rejecting_removal_of(CSV_LOG_PATH),
            TEXT_LOG_PATH,
            CSV_LOG_PATH,
        );
        log.append_line("x\n").unwrap();
        log.regenerate_csv().unwrap();

        let cleared = log.clear();
        assert_eq!(cleared.removed, 1);
        assert!(matches!(
            cleared.failures.as_slice(),
            [StorageError::Remove { .. }]
        ));
        assert!(log.read_text().unwrap().is_none());
        assert!(log.read_csv().unwrap().is_some());
    }
}
