//! Boundary adapters between foreign plaintext dumps and normalized entry
//! records. The vault core only ever sees [`NewEntryRecord`]s; parsing
//! third-party JSON/CSV shapes stops here.
//!
//! Everything in this crate handles plaintext: callers are expected to be
//! running inside an already-unlocked session and to treat files written
//! here as sensitive rescue artifacts.

use color_eyre::Result;
use color_eyre::eyre::eyre;
use keyvault_vault::{Environment, NewEntryRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(eyre!("Unsupported format: {}. Supported formats: json, csv", s)),
        }
    }
}

#[must_use]
pub fn detect_format_from_extension(path: &Path) -> Option<ExportFormat> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| match ext.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        })
}

/// The normalized plaintext shape of one entry in a dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortableEntry {
    pub service_name: String,
    pub secret: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub rate_limit: Option<String>,
}

impl PortableEntry {
    /// Converts into the record shape the vault API accepts.
    ///
    /// # Errors
    /// An unrecognized `environment` value.
    pub fn into_record(self) -> Result<NewEntryRecord> {
        let environment = match self.environment.as_deref() {
            Some(s) if !s.trim().is_empty() => Environment::from_str(s)?,
            _ => Environment::default(),
        };
        Ok(NewEntryRecord {
            service_name: self.service_name,
            secret: self.secret,
            environment,
            tags: self.tags,
            domains: self.domains,
            notes: self.notes.unwrap_or_default(),
            expires_at: self.expires_at,
            rate_limit: self.rate_limit.unwrap_or_default(),
            favorite: false,
        })
    }
}

/// Case-insensitive duplicate service names, for advisory warnings before an
/// import; duplicates are never rejected.
#[must_use]
pub fn duplicate_warnings(records: &[NewEntryRecord]) -> Vec<String> {
    let mut seen = std::collections::BTreeMap::new();
    let mut warnings = Vec::new();
    for record in records {
        let key = record.service_name.to_lowercase();
        let count = seen.entry(key).or_insert(0usize);
        *count += 1;
        if *count == 2 {
            warnings.push(format!("duplicate service name '{}'", record.service_name));
        }
    }
    warnings
}

/// Writes entries as a plaintext rescue export.
///
/// # Errors
/// I/O and serialization failures.
pub fn export_entries(entries: &[PortableEntry], format: ExportFormat, output_path: &Path) -> Result<()> {
    match format {
        ExportFormat::Json => export_json(entries, output_path),
        ExportFormat::Csv => export_csv(entries, output_path),
    }
}

fn export_json(entries: &[PortableEntry], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(output_path, json)?;
    Ok(())
}

fn export_csv(entries: &[PortableEntry], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(output_path)?;
    writeln!(file, "service_name,secret,environment,tags,domains,notes")?;

    for entry in entries {
        let service_name = escape_csv_field(&entry.service_name);
        let secret = escape_csv_field(&entry.secret);
        let environment = escape_csv_field(entry.environment.as_deref().unwrap_or(""));
        let tags = escape_csv_field(&entry.tags.join(";"));
        let domains = escape_csv_field(&entry.domains.join(";"));
        let notes = escape_csv_field(entry.notes.as_deref().unwrap_or(""));

        writeln!(file, "{service_name},{secret},{environment},{tags},{domains},{notes}")?;
    }
    Ok(())
}

/// Reads a foreign dump into normalized records.
///
/// # Errors
/// Unreadable files, parse failures, and unrecognized environment values.
pub fn import_entries(input_path: &Path, format: ExportFormat) -> Result<Vec<NewEntryRecord>> {
    match format {
        ExportFormat::Json => import_json(input_path),
        ExportFormat::Csv => import_csv(input_path),
    }
}

fn import_json(input_path: &Path) -> Result<Vec<NewEntryRecord>> {
    let content = fs::read_to_string(input_path)?;
    let entries: Vec<PortableEntry> = serde_json::from_str(&content).map_err(|e| eyre!("JSON parse error: {e}"))?;
    entries.into_iter().map(PortableEntry::into_record).collect()
}

// Returns true if the line ends outside of quotes (i.e., unescaped quotes
// are balanced), so multi-line quoted fields can be accumulated.
fn record_complete(line: &str) -> bool {
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes {
                if chars.peek() == Some(&'"') {
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                in_quotes = true;
            }
        }
    }
    !in_quotes
}

fn import_csv(input_path: &Path) -> Result<Vec<NewEntryRecord>> {
    let content = fs::read_to_string(input_path)?;
    let mut lines = content.lines();

    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    if header.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut buf = String::new();
    // Logical record numbering for error reporting: header is line 1.
    let mut current_record_start_line: usize = 2;
    let mut physical_line_index: usize = 1;

    for raw in lines {
        physical_line_index += 1;
        if buf.is_empty() {
            buf.push_str(raw);
            current_record_start_line = physical_line_index;
        } else {
            buf.push('\n');
            buf.push_str(raw);
        }

        if !record_complete(&buf) {
            continue;
        }

        if buf.trim().is_empty() {
            buf.clear();
            continue;
        }

        records.push(parse_csv_record(&buf, current_record_start_line)?);
        buf.clear();
    }

    if !buf.is_empty() {
        if !record_complete(&buf) {
            return Err(eyre!(
                "Invalid CSV format at line {}: unterminated quoted field",
                current_record_start_line
            ));
        }
        records.push(parse_csv_record(&buf, current_record_start_line)?);
    }

    Ok(records)
}

fn parse_csv_record(line: &str, line_number: usize) -> Result<NewEntryRecord> {
    let fields = parse_csv_line(line);
    if fields.len() < 2 {
        return Err(eyre!(
            "Invalid CSV format at line {}: expected at least 2 fields (service_name, secret)",
            line_number
        ));
    }

    let split_list = |field: Option<&String>| -> Vec<String> {
        field
            .map(|f| f.split(';').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    };

    PortableEntry {
        service_name: fields[0].clone(),
        secret: fields[1].clone(),
        environment: fields.get(2).filter(|f| !f.is_empty()).cloned(),
        tags: split_list(fields.get(3)),
        domains: split_list(fields.get(4)),
        notes: fields.get(5).filter(|f| !f.is_empty()).cloned(),
        expires_at: None,
        rate_limit: None,
    }
    .into_record()
    .map_err(|e| eyre!("Invalid CSV record at line {line_number}: {e}"))
}

fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current_field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes {
                    if chars.peek() == Some(&'"') {
                        current_field.push('"');
                        chars.next();
                    } else {
                        in_quotes = false;
                    }
                } else {
                    in_quotes = true;
                }
            }
            ',' if !in_quotes => {
                fields.push(current_field.trim().to_string());
                current_field.clear();
            }
            _ => {
                current_field.push(ch);
            }
        }
    }

    fields.push(current_field.trim().to_string());
    fields
}
