use pvi_data::common_io::write_columns_tsv;

/// Named columns of scalar training records, kept in insertion order
#[derive(Clone, Debug, Default)]
pub struct MetricsLog {
    columns: Vec<(String, Vec<f64>)>,
}

impl MetricsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, value: f64) {
        match self.columns.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value),
            None => self.columns.push((key.to_string(), vec![value])),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(k, _)| k.as_str())
    }

    /// number of records in the longest column
    pub fn len(&self) -> usize {
        self.columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all columns as a tab-separated table
    pub fn to_tsv(&self, output_file: &str) -> anyhow::Result<()> {
        let header: Vec<&str> = self.keys().collect();
        let columns: Vec<&[f64]> = self.columns.iter().map(|(_, v)| v.as_slice()).collect();
        write_columns_tsv(&header, &columns, output_file)
    }
}
