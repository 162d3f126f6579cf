//! Encode statistics file
//!
//! Appends one CSV row per finished encode. The file gets its header
//! on first write; fields containing commas are quoted.

use std::io::Write;
use std::path::Path;

const HEADER: &str = "Encoded Date,Relative Path,Original Size,New Size,Percentage,Duration of Encode";

/// One finished-encode record
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow {
    pub encoded_date: String,
    pub relative_path: String,
    pub original_size: String,
    pub new_size: String,
    pub percentage: String,
    pub encode_duration: String,
}

impl StatsRow {
    fn render(&self) -> String {
        [
            &self.encoded_date,
            &self.relative_path,
            &self.original_size,
            &self.new_size,
            &self.percentage,
            &self.encode_duration,
        ]
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",")
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(',') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Append a row, writing the header first when the file is new.
pub fn append_row(path: &Path, row: &StatsRow) -> std::io::Result<()> {
    let is_new = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if is_new {
        writeln!(file, "{HEADER}")?;
    }
    writeln!(file, "{}", row.render())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_row() -> StatsRow {
        StatsRow {
            encoded_date: "2016-02-14 03:22:10".to_string(),
            relative_path: "shows/Some Show/S01E01.mkv".to_string(),
            original_size: "700 MiB".to_string(),
            new_size: "312 MiB".to_string(),
            percentage: "44.57%".to_string(),
            encode_duration: "01:12:45".to_string(),
        }
    }

    #[test]
    fn test_first_write_adds_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stats.csv");
        append_row(&path, &sample_row()).expect("write");

        let contents = std::fs::read_to_string(&path).expect("read back");
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(HEADER));
        assert_eq!(
            lines.next(),
            Some("2016-02-14 03:22:10,shows/Some Show/S01E01.mkv,700 MiB,312 MiB,44.57%,01:12:45")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_second_write_appends_without_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stats.csv");
        append_row(&path, &sample_row()).expect("first write");
        append_row(&path, &sample_row()).expect("second write");

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(contents.lines().count(), 3);
        assert_eq!(contents.matches("Encoded Date").count(), 1);
    }

    #[test]
    fn test_comma_fields_are_quoted() {
        let mut row = sample_row();
        row.relative_path = "films/Crouching, Hidden.mkv".to_string();
        let rendered = row.render();
        assert!(rendered.contains("\"films/Crouching, Hidden.mkv\""));
    }
}
