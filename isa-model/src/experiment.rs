//! Bookkeeping of a single run: an insertion-ordered record of named
//! JSON values saved under a path template.

use log::info;
use matrix_util::common_io::{mkdir_parent, open_buf_reader, open_buf_writer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentRecord {
    entries: Vec<(String, Value)>,
    #[serde(skip)]
    num_saves: usize,
}

impl ExperimentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`; a new key goes to the end
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value)?;
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .get_value(key)
            .ok_or(anyhow::anyhow!("no entry `{}` in experiment record", key))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Fill `{0}` with the current time and `{1}` with the number of
    /// earlier saves, then write JSON (gzipped for `.gz`). Returns the
    /// path written.
    pub fn save(&mut self, template: &str) -> anyhow::Result<String> {
        let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let path = fill_template(template, &stamp.to_string(), self.num_saves);

        mkdir_parent(&path)?;
        let mut writer = open_buf_writer(&path)?;
        serde_json::to_writer(&mut writer, &self.entries)?;
        writer.flush()?;

        self.num_saves += 1;
        info!("saved experiment to {}", path);
        Ok(path)
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(path)?;
        let entries: Vec<(String, Value)> = serde_json::from_reader(reader)?;
        Ok(Self {
            entries,
            num_saves: 0,
        })
    }
}

/// Replace `{0}` with `stamp` and `{1}` with `counter`
pub fn fill_template(template: &str, stamp: &str, counter: usize) -> String {
    template
        .replace("{0}", stamp)
        .replace("{1}", &counter.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_and_overwrites_in_place() -> anyhow::Result<()> {
        let mut rec = ExperimentRecord::new();
        rec.set("zeta", &1)?;
        rec.set("alpha", &"two")?;
        rec.set("zeta", &3)?;

        assert_eq!(rec.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(rec.get::<i64>("zeta")?, 3);
        assert!(rec.get::<i64>("missing").is_err());
        Ok(())
    }

    #[test]
    fn template_placeholders_are_filled() {
        assert_eq!(fill_template("run_{0}_{1}.json", "123", 4), "run_123_4.json");
        assert_eq!(fill_template("plain.json", "123", 4), "plain.json");
    }

    #[test]
    fn gzipped_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let template = dir.path().join("exp_{1}.json.gz");
        let template = template.to_str().ok_or(anyhow::anyhow!("path"))?;

        let mut rec = ExperimentRecord::new();
        rec.set("values", &vec![1.5, 2.5])?;
        let first = rec.save(template)?;
        let second = rec.save(template)?;
        assert!(first.ends_with("exp_0.json.gz"));
        assert!(second.ends_with("exp_1.json.gz"));

        let loaded = ExperimentRecord::load(&second)?;
        assert_eq!(loaded.get::<Vec<f64>>("values")?, vec![1.5, 2.5]);
        Ok(())
    }
}
