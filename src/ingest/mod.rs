/// Packet-log ingestion — loads the address map and reads the tabular packet
/// log in bounded batches, normalizing each raw row into a `PacketRecord`.
///
/// Field normalization never rejects a row: missing or non-numeric numeric
/// fields degrade to zero, and the flag label is classified from the raw
/// column value before that default is applied. Source-level failures
/// (unreadable file, bad compression) are fatal and propagate.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::models::{
    classify_flags, FlowscopeError, PacketRecord, Protocol, RecordSource, Result,
};

// ---------------------------------------------------------------------------
// Address map
// ---------------------------------------------------------------------------

/// Reverse mapping from integer-encoded addresses back to their string form.
/// The on-disk format is a JSON object of `address → integer`.
#[derive(Debug, Default)]
pub struct AddressMap {
    from_int: HashMap<i64, String>,
}

impl AddressMap {
    /// Loads the map, degrading to an empty map (with a warning) when the
    /// file is missing or malformed — address columns then pass through
    /// untranslated, which matches how absent mappings behave per entry.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(map) => {
                tracing::info!(file = %path.display(), entries = map.from_int.len(), "address map loaded");
                map
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), "address map unavailable: {e}");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let forward: HashMap<String, i64> = serde_json::from_reader(BufReader::new(file))?;
        let from_int = forward.into_iter().map(|(addr, n)| (n, addr)).collect();
        Ok(Self { from_int })
    }

    /// Translates one address column value: an all-digit value is looked up
    /// as an integer (unmapped integers pass through as their decimal form);
    /// anything else is taken verbatim.
    pub fn translate(&self, raw: &str) -> String {
        let raw = raw.trim();
        if raw.is_empty() {
            return String::new();
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = raw.parse::<i64>() {
                return self
                    .from_int
                    .get(&n)
                    .cloned()
                    .unwrap_or_else(|| n.to_string());
            }
        }
        raw.to_string()
    }

    pub fn len(&self) -> usize {
        self.from_int.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from_int.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

/// Lenient numeric parse: integers directly, floats by truncation, anything
/// else is `None`.
fn parse_i64(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Some(f as i64),
        _ => None,
    }
}

fn parse_port(raw: Option<&str>) -> u16 {
    parse_i64(raw)
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// CSV source
// ---------------------------------------------------------------------------

/// Header positions of the columns the schema defines; absent columns yield
/// defaults for every row.
#[derive(Debug, Default)]
struct ColumnIndex {
    timestamp: Option<usize>,
    src_ip: Option<usize>,
    dst_ip: Option<usize>,
    src_port: Option<usize>,
    dst_port: Option<usize>,
    flags: Option<usize>,
    seq_num: Option<usize>,
    ack_num: Option<usize>,
    length: Option<usize>,
    protocol: Option<usize>,
}

impl ColumnIndex {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        Self {
            timestamp: find("timestamp"),
            src_ip: find("src_ip"),
            dst_ip: find("dst_ip"),
            src_port: find("src_port"),
            dst_port: find("dst_port"),
            flags: find("flags"),
            seq_num: find("seq_num"),
            ack_num: find("ack_num"),
            length: find("length"),
            protocol: find("protocol"),
        }
    }
}

/// Streams a packet-log CSV (plain or gzip-compressed, by extension) as
/// batches of normalized records.
pub struct CsvRecordSource {
    reader: csv::Reader<Box<dyn Read + Send>>,
    columns: ColumnIndex,
    address_map: AddressMap,
    batch_size: usize,
    row: csv::StringRecord,
    done: bool,
}

impl CsvRecordSource {
    pub fn open(path: &Path, address_map: AddressMap, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(FlowscopeError::Config("batch size must be positive".into()));
        }

        let file = File::open(path).map_err(|e| {
            FlowscopeError::Ingest(format!("cannot open {}: {e}", path.display()))
        })?;

        let gzipped = path.extension().is_some_and(|ext| ext == "gz");
        let raw: Box<dyn Read + Send> = if gzipped {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(raw);
        let columns = ColumnIndex::from_headers(reader.headers()?);

        Ok(Self {
            reader,
            columns,
            address_map,
            batch_size,
            row: csv::StringRecord::new(),
            done: false,
        })
    }

    fn field(&self, idx: Option<usize>) -> Option<&str> {
        idx.and_then(|i| self.row.get(i))
    }

    fn normalize_row(&self) -> PacketRecord {
        let raw_flags = parse_i64(self.field(self.columns.flags));
        PacketRecord {
            timestamp: parse_i64(self.field(self.columns.timestamp)).unwrap_or(0),
            src_ip: self
                .address_map
                .translate(self.field(self.columns.src_ip).unwrap_or("")),
            dst_ip: self
                .address_map
                .translate(self.field(self.columns.dst_ip).unwrap_or("")),
            src_port: parse_port(self.field(self.columns.src_port)),
            dst_port: parse_port(self.field(self.columns.dst_port)),
            flags: raw_flags.unwrap_or(0),
            flag_type: classify_flags(raw_flags),
            seq_num: parse_i64(self.field(self.columns.seq_num)).unwrap_or(0),
            ack_num: parse_i64(self.field(self.columns.ack_num)).unwrap_or(0),
            length: parse_i64(self.field(self.columns.length)).unwrap_or(0),
            protocol: Protocol::parse(self.field(self.columns.protocol).unwrap_or("")),
        }
    }
}

impl RecordSource for CsvRecordSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<PacketRecord>>> {
        if self.done {
            return Ok(None);
        }

        let mut batch = Vec::with_capacity(self.batch_size.min(4096));
        while batch.len() < self.batch_size {
            if !self.reader.read_record(&mut self.row)? {
                self.done = true;
                break;
            }
            batch.push(self.normalize_row());
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "timestamp,src_ip,dst_ip,src_port,dst_port,flags,seq_num,ack_num,length,protocol";

    fn write_csv(rows: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packets.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        (dir, path)
    }

    async fn read_all(source: &mut CsvRecordSource) -> Vec<PacketRecord> {
        let mut all = Vec::new();
        while let Some(batch) = source.next_batch().await.unwrap() {
            all.extend(batch);
        }
        all
    }

    #[tokio::test]
    async fn reads_rows_in_bounded_batches() {
        let rows: Vec<String> = (0..5)
            .map(|i| format!("{},10.0.0.1,10.0.0.2,1000,80,16,1,1,0,6", i * 10))
            .collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let (_dir, path) = write_csv(&refs);

        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 2).unwrap();

        assert_eq!(source.next_batch().await.unwrap().unwrap().len(), 2);
        assert_eq!(source.next_batch().await.unwrap().unwrap().len(), 2);
        assert_eq!(source.next_batch().await.unwrap().unwrap().len(), 1);
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn normalizes_well_formed_row() {
        let (_dir, path) =
            write_csv(&["1500,10.0.0.1,10.0.0.2,54321,443,24,100,200,512,6"]);
        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();

        let records = read_all(&mut source).await;
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.timestamp, 1500);
        assert_eq!(r.src_ip, "10.0.0.1");
        assert_eq!(r.dst_ip, "10.0.0.2");
        assert_eq!((r.src_port, r.dst_port), (54321, 443));
        assert_eq!(r.flags, 24);
        assert_eq!(r.flag_type, "PSH+ACK");
        assert_eq!((r.seq_num, r.ack_num), (100, 200));
        assert_eq!(r.length, 512);
        assert!(r.protocol.is_tcp());
    }

    #[tokio::test]
    async fn malformed_numeric_fields_default_to_zero() {
        let (_dir, path) = write_csv(&["abc,10.0.0.1,10.0.0.2,xyz,80,junk,nan,,-,6"]);
        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();

        let records = read_all(&mut source).await;
        let r = &records[0];
        assert_eq!(r.timestamp, 0);
        assert_eq!(r.src_port, 0);
        assert_eq!(r.flags, 0);
        assert_eq!(r.flag_type, "INVALID");
        assert_eq!(r.ack_num, 0);
        assert_eq!(r.length, 0);
    }

    #[tokio::test]
    async fn float_typed_fields_truncate() {
        let (_dir, path) = write_csv(&["1000.9,10.0.0.1,10.0.0.2,1000.0,80,16.0,1,1,99.5,6.0"]);
        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();

        let records = read_all(&mut source).await;
        let r = &records[0];
        assert_eq!(r.timestamp, 1000);
        assert_eq!(r.src_port, 1000);
        assert_eq!(r.flags, 16);
        assert_eq!(r.flag_type, "ACK");
        assert_eq!(r.length, 99);
        assert!(r.protocol.is_tcp());
    }

    #[tokio::test]
    async fn integer_addresses_translate_through_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("ip_map.json");
        std::fs::write(&map_path, r#"{"10.0.0.1": 167772161, "10.0.0.2": 167772162}"#).unwrap();
        let map = AddressMap::load(&map_path);
        assert_eq!(map.len(), 2);

        let csv_path = dir.path().join("packets.csv");
        let mut file = File::create(&csv_path).unwrap();
        writeln!(file, "{HEADER}").unwrap();
        writeln!(file, "0,167772161,167772162,1000,80,2,1,0,0,6").unwrap();
        writeln!(file, "1,99999,10.0.0.7,1000,80,2,1,0,0,6").unwrap();

        let mut source = CsvRecordSource::open(&csv_path, map, 100).unwrap();
        let records = read_all(&mut source).await;

        assert_eq!(records[0].src_ip, "10.0.0.1");
        assert_eq!(records[0].dst_ip, "10.0.0.2");
        // Unmapped integers pass through; dotted strings are untouched
        assert_eq!(records[1].src_ip, "99999");
        assert_eq!(records[1].dst_ip, "10.0.0.7");
    }

    #[tokio::test]
    async fn missing_columns_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "timestamp,src_ip,dst_ip,flags").unwrap();
        writeln!(file, "100,10.0.0.1,10.0.0.2,2").unwrap();

        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();
        let records = read_all(&mut source).await;
        let r = &records[0];
        assert_eq!((r.src_port, r.dst_port), (0, 0));
        assert_eq!((r.seq_num, r.ack_num, r.length), (0, 0, 0));
        assert_eq!(r.protocol, Protocol::Unknown);
        assert_eq!(r.flag_type, "SYN");
    }

    #[tokio::test]
    async fn symbolic_protocol_column_is_recognized() {
        let (_dir, path) = write_csv(&["0,10.0.0.1,10.0.0.2,1000,80,2,1,0,0,TCP"]);
        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();
        let records = read_all(&mut source).await;
        assert!(records[0].protocol.is_tcp());
    }

    #[tokio::test]
    async fn header_only_file_yields_no_batches() {
        let (_dir, path) = write_csv(&[]);
        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gzip_input_is_decompressed_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packets.csv.gz");
        let file = File::create(&path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        writeln!(encoder, "{HEADER}").unwrap();
        writeln!(encoder, "42,10.0.0.1,10.0.0.2,1000,80,2,7,0,0,6").unwrap();
        encoder.finish().unwrap();

        let mut source = CsvRecordSource::open(&path, AddressMap::default(), 100).unwrap();
        let records = read_all(&mut source).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 42);
        assert_eq!(records[0].seq_num, 7);
    }

    #[test]
    fn missing_address_map_degrades_to_empty() {
        let map = AddressMap::load(Path::new("/nonexistent/ip_map.json"));
        assert!(map.is_empty());
        assert_eq!(map.translate("10.0.0.1"), "10.0.0.1");
        assert_eq!(map.translate("12345"), "12345");
        assert_eq!(map.translate(""), "");
    }

    #[test]
    fn opening_a_missing_data_file_is_fatal() {
        let result = CsvRecordSource::open(
            Path::new("/nonexistent/packets.csv"),
            AddressMap::default(),
            100,
        );
        assert!(matches!(result, Err(FlowscopeError::Ingest(_))));
    }
}
