use std::io::{self, Write};

use chrono::SecondsFormat;
use serde::Serialize;

use mtslx_core::record::{FingerprintRecord, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON array written when the run ends
    JsonArray,
    /// One JSON object per line, flushed as records arrive
    JsonLines,
    /// Header row then one row per record
    Delimited { separator: String },
}

/// Which roles reach the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFilter {
    pub include_server: bool,
    pub server_only: bool,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            include_server: true,
            server_only: false,
        }
    }
}

impl RecordFilter {
    pub fn accepts(&self, role: Role) -> bool {
        match role {
            Role::Client => !self.server_only,
            Role::Server => self.include_server || self.server_only,
        }
    }
}

/// Column order of the delimited formats.
pub const COLUMNS: [&str; 8] = [
    "source_ip",
    "source_port",
    "destination_ip",
    "destination_port",
    "type",
    "digest",
    "ja3_digest_raw",
    "timestamp",
];

/// A record as written by every output mode. The digest key is `ja3` or
/// `ja3s` depending on the role.
#[derive(Serialize)]
struct Row<'a> {
    source_ip: String,
    source_port: u16,
    destination_ip: String,
    destination_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    ja3: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ja3s: Option<&'a str>,
    ja3_digest_raw: &'a str,
    timestamp: String,
    #[serde(skip)]
    role: Role,
    #[serde(skip)]
    digest: &'a str,
}

impl<'a> Row<'a> {
    fn new(rec: &'a FingerprintRecord) -> Self {
        let (ja3, ja3s) = match rec.role {
            Role::Client => (Some(rec.digest.as_str()), None),
            Role::Server => (None, Some(rec.digest.as_str())),
        };
        Self {
            source_ip: rec.source_ip.to_string(),
            source_port: rec.source_port,
            destination_ip: rec.destination_ip.to_string(),
            destination_port: rec.destination_port,
            ja3,
            ja3s,
            ja3_digest_raw: &rec.raw,
            timestamp: rec.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            role: rec.role,
            digest: &rec.digest,
        }
    }

    fn cells(&self) -> [String; 8] {
        [
            self.source_ip.clone(),
            self.source_port.to_string(),
            self.destination_ip.clone(),
            self.destination_port.to_string(),
            self.role.label().to_string(),
            self.digest.to_string(),
            self.ja3_digest_raw.to_string(),
            self.timestamp.clone(),
        ]
    }
}

/// Writes records in the configured format.
///
/// Call [`RecordWriter::finish`] once the run is over: the array format
/// writes nothing before it, and a delimited output with no records still
/// needs its header.
pub struct RecordWriter<W: Write> {
    out: W,
    format: OutputFormat,
    filter: RecordFilter,
    buffered: Vec<FingerprintRecord>,
    header_written: bool,
    written: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W, format: OutputFormat, filter: RecordFilter) -> Self {
        Self {
            out,
            format,
            filter,
            buffered: Vec::new(),
            header_written: false,
            written: 0,
        }
    }

    /// Records accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns `false` when the filter dropped the record.
    pub fn write(&mut self, rec: &FingerprintRecord) -> io::Result<bool> {
        if !self.filter.accepts(rec.role) {
            return Ok(false);
        }
        self.written += 1;

        match &self.format {
            OutputFormat::JsonArray => self.buffered.push(rec.clone()),
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.out, &Row::new(rec))?;
                self.out.write_all(b"\n")?;
                self.out.flush()?;
            }
            OutputFormat::Delimited { separator } => {
                let separator = separator.clone();
                self.write_header(&separator)?;
                self.write_cells(&Row::new(rec).cells(), &separator)?;
            }
        }
        Ok(true)
    }

    pub fn finish(mut self) -> io::Result<W> {
        match &self.format {
            OutputFormat::JsonArray => {
                let rows: Vec<Row<'_>> = self.buffered.iter().map(Row::new).collect();
                serde_json::to_writer_pretty(&mut self.out, &rows)?;
                self.out.write_all(b"\n")?;
            }
            OutputFormat::JsonLines => {}
            OutputFormat::Delimited { separator } => {
                let separator = separator.clone();
                self.write_header(&separator)?;
            }
        }
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_header(&mut self, separator: &str) -> io::Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        let header = COLUMNS.map(String::from);
        self.write_cells(&header, separator)
    }

    fn write_cells(&mut self, cells: &[String], separator: &str) -> io::Result<()> {
        let line: Vec<String> = cells.iter().map(|c| quote_cell(c, separator)).collect();
        writeln!(self.out, "{}", line.join(separator))
    }
}

/// Quote a cell that contains the separator, a quote or a line break.
fn quote_cell(cell: &str, separator: &str) -> String {
    if cell.contains(separator) || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
