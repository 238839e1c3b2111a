//! Test data records for data-driven endpoint runs.
//!
//! YAML, JSON and CSV files are supported. A CSV file yields one object per
//! row, keyed by the header row, with every cell as a string.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::definition::Format;
use crate::error::{Error, Result};
use crate::executor::shallow_merge;

/// Loads record files from one directory, caching each file after the first
/// read.
#[derive(Debug)]
pub struct DataLoader {
    data_dir: PathBuf,
    cache: HashMap<String, Vec<Value>>,
}

impl DataLoader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache: HashMap::new(),
        }
    }

    /// Records in `file`, read on first use.
    pub fn load(&mut self, file: &str) -> Result<&[Value]> {
        if !self.cache.contains_key(file) {
            let records = self.read(file)?;
            self.cache.insert(file.to_string(), records);
        }
        Ok(self.cache.get(file).map(Vec::as_slice).unwrap_or_default())
    }

    /// Record `index`, wrapping around the end of the file.
    pub fn get_by_index(&mut self, file: &str, index: usize) -> Result<&Value> {
        let records = self.load(file)?;
        if records.is_empty() {
            return Err(Error::config(format!("test data file '{file}' has no records")));
        }
        Ok(&records[index % records.len()])
    }

    fn read(&self, file: &str) -> Result<Vec<Value>> {
        let path = self.data_dir.join(file);
        let format = DataFormat::from_path(&path).ok_or_else(|| {
            Error::config(format!("unsupported test data format: {}", path.display()))
        })?;
        let content = fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("cannot read test data {}: {e}", path.display()))
        })?;
        let records = match format {
            DataFormat::Csv => csv_records(&content)?,
            DataFormat::Structured(Format::Yaml) => {
                unwrap_records(serde_yaml::from_str(&content)?)
            }
            DataFormat::Structured(Format::Json) => {
                unwrap_records(serde_json::from_str(&content)?)
            }
        };
        debug!(file = %path.display(), records = records.len(), "test data loaded");
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy)]
enum DataFormat {
    Csv,
    Structured(Format),
}

impl DataFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "csv" => Some(DataFormat::Csv),
            _ => Format::from_path(path).map(DataFormat::Structured),
        }
    }
}

/// A top-level list is used as-is, a mapping with a `data` list yields that
/// list, any other mapping is one record.
fn unwrap_records(raw: Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("data".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Rows keyed by the header row. Short rows only carry the columns they
/// have.
fn csv_records(content: &str) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());
    let headers = reader.headers()?.clone();
    reader
        .records()
        .map(|row| {
            let row = row?;
            let record: Map<String, Value> = headers
                .iter()
                .zip(row.iter())
                .map(|(name, cell)| (name.to_string(), Value::String(cell.to_string())))
                .collect();
            Ok(Value::Object(record))
        })
        .collect()
}

/// Overlay a data record onto an endpoint body. Record keys win; a
/// non-object body is replaced by the record.
pub fn merge_record(body: Option<&Value>, record: &Value) -> Value {
    shallow_merge(body, record)
}

/// Label for one data-driven run: the record's `name`, else its index.
pub fn record_label(record: &Value, index: usize) -> String {
    match record.get("name") {
        Some(Value::String(name)) => name.clone(),
        _ => index.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn dir_with(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn loads_lists_data_mappings_and_single_records() {
        let dir = dir_with(&[
            ("list.yaml", "- {name: a}\n- {name: b}\n"),
            ("wrapped.json", r#"{"data": [{"name": "x"}, {"name": "y"}, {"name": "z"}]}"#),
            ("single.yml", "name: only\nrole: admin\n"),
        ]);
        let mut loader = DataLoader::new(dir.path());

        assert_eq!(loader.load("list.yaml").unwrap().len(), 2);
        assert_eq!(loader.load("wrapped.json").unwrap().len(), 3);
        assert_eq!(
            loader.load("single.yml").unwrap(),
            &[json!({"name": "only", "role": "admin"})]
        );
    }

    #[test]
    fn caches_after_first_read() {
        let dir = dir_with(&[("users.yaml", "- {name: a}\n")]);
        let mut loader = DataLoader::new(dir.path());
        loader.load("users.yaml").unwrap();

        fs::remove_file(dir.path().join("users.yaml")).unwrap();
        assert_eq!(loader.load("users.yaml").unwrap().len(), 1);
    }

    #[test]
    fn get_by_index_wraps() {
        let dir = dir_with(&[("users.yaml", "- {name: a}\n- {name: b}\n")]);
        let mut loader = DataLoader::new(dir.path());
        assert_eq!(loader.get_by_index("users.yaml", 3).unwrap()["name"], "b");
        assert_eq!(loader.get_by_index("users.yaml", 4).unwrap()["name"], "a");
    }

    #[test]
    fn csv_rows_become_string_records() {
        let dir = dir_with(&[(
            "users.csv",
            "name, age,role\nalice,30,admin\n\"smith, bob\",41,\ncarol,22\n",
        )]);
        let mut loader = DataLoader::new(dir.path());

        let records = loader.load("users.csv").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            json!({"name": "alice", "age": "30", "role": "admin"})
        );
        assert_eq!(records[1], json!({"name": "smith, bob", "age": "41", "role": ""}));
        assert_eq!(records[2], json!({"name": "carol", "age": "22"}));
        assert_eq!(loader.get_by_index("users.csv", 4).unwrap()["name"], "smith, bob");
    }

    #[test]
    fn header_only_csv_has_no_records() {
        let dir = dir_with(&[("empty.csv", "name,age\n")]);
        let mut loader = DataLoader::new(dir.path());
        assert!(loader.load("empty.csv").unwrap().is_empty());
        assert!(loader.get_by_index("empty.csv", 0).unwrap_err().is_configuration());
    }

    #[test]
    fn missing_and_unsupported_files_are_errors() {
        let dir = dir_with(&[("users.txt", "name\na\n"), ("empty.yaml", "[]\n")]);
        let mut loader = DataLoader::new(dir.path());
        assert!(loader.load("nope.yaml").unwrap_err().is_configuration());
        assert!(loader.load("users.txt").unwrap_err().is_configuration());
        assert!(loader.get_by_index("empty.yaml", 0).is_err());
    }

    #[test]
    fn record_keys_overwrite_body_keys() {
        let body = json!({"name": "default", "role": "user"});
        assert_eq!(
            merge_record(Some(&body), &json!({"name": "alice"})),
            json!({"name": "alice", "role": "user"})
        );
        assert_eq!(merge_record(None, &json!({"a": 1})), json!({"a": 1}));
        assert_eq!(record_label(&json!({"name": "alice"}), 3), "alice");
        assert_eq!(record_label(&json!({"id": 1}), 3), "3");
    }
}
