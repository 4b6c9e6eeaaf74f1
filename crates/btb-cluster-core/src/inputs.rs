use crate::config::parse_date;
use crate::stats::Histogram;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum DataError {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::Io { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            DataError::Malformed { path, line, reason } => {
                write!(f, "{}:{}: {}", path.display(), line, reason)
            }
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DataError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn read_lines(path: &Path) -> Result<Vec<(usize, String)>, DataError> {
    let text = fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .enumerate()
        .map(|(idx, raw)| (idx + 1, raw.split('#').next().unwrap_or("").trim().to_string()))
        .filter(|(_, line)| !line.is_empty())
        .collect())
}

fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> DataError {
    DataError::Malformed {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

/// Farm identifiers, one per line.
pub fn read_farm_ids(path: &Path) -> Result<Vec<String>, DataError> {
    Ok(read_lines(path)?.into_iter().map(|(_, line)| line).collect())
}

/// A sett and the farms it connects to, `settId:farm1,farm2,...` per line.
#[derive(Clone, Debug)]
pub struct SettRecord {
    pub name: String,
    pub farms: Vec<String>,
}

pub fn read_setts(path: &Path) -> Result<Vec<SettRecord>, DataError> {
    read_lines(path)?
        .into_iter()
        .map(|(line_no, line)| {
            let (name, farms) = line
                .split_once(':')
                .ok_or_else(|| malformed(path, line_no, "expected settId:farm1,farm2,..."))?;
            Ok(SettRecord {
                name: name.trim().to_string(),
                farms: farms
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// Slaughterhouse dispatch schedule, `date:farm1,farm2,...` per line.
pub fn read_slaughter_moves(
    path: &Path,
    date_format: &str,
) -> Result<Vec<(i32, Vec<String>)>, DataError> {
    read_lines(path)?
        .into_iter()
        .map(|(line_no, line)| {
            let (date, farms) = line
                .split_once(':')
                .ok_or_else(|| malformed(path, line_no, "expected date:farm1,farm2,..."))?;
            let date = parse_date(date.trim(), date_format)
                .ok_or_else(|| malformed(path, line_no, format!("unparseable date {date:?}")))?;
            Ok((
                date,
                farms
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect(),
            ))
        })
        .collect()
}

/// Observed SNP pairwise-distance frequencies, `x:frequency` per line.
pub fn read_observed_distribution(path: &Path) -> Result<Histogram, DataError> {
    let mut hist = Histogram::default();
    for (line_no, line) in read_lines(path)? {
        let (bin, freq) = line
            .split_once(':')
            .ok_or_else(|| malformed(path, line_no, "expected x:frequency"))?;
        let bin: u32 = bin
            .trim()
            .parse()
            .map_err(|_| malformed(path, line_no, format!("unparseable bin {bin:?}")))?;
        let freq: f64 = freq
            .trim()
            .parse()
            .map_err(|_| malformed(path, line_no, format!("unparseable frequency {freq:?}")))?;
        hist.add_count(bin, freq.round() as u64);
    }
    Ok(hist)
}

/// Per-year sampling rates, CSV with `#` comments; year in column 0, rate in
/// column 3.
pub fn read_sampling_rates(path: &Path) -> Result<HashMap<i32, f64>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| match e.into_kind() {
            csv::ErrorKind::Io(source) => DataError::Io {
                path: path.to_path_buf(),
                source,
            },
            _ => malformed(path, 0, "unreadable CSV"),
        })?;

    let mut rates = HashMap::new();
    for (idx, record) in reader.records().enumerate() {
        let line_no = idx + 1;
        let record = record.map_err(|e| malformed(path, line_no, e.to_string()))?;
        if record.len() < 4 {
            return Err(malformed(path, line_no, "expected at least 4 columns"));
        }
        let year: i32 = record[0]
            .parse()
            .map_err(|_| malformed(path, line_no, format!("unparseable year {:?}", &record[0])))?;
        let rate: f64 = record[3]
            .parse()
            .map_err(|_| malformed(path, line_no, format!("unparseable rate {:?}", &record[3])))?;
        rates.insert(year, rate);
    }
    Ok(rates)
}

/// Historical off movements between one pair of farms.
#[derive(Clone, Debug)]
pub struct MovementRecord {
    pub departure: String,
    pub destination: String,
    /// Animals moved in each recorded movement event.
    pub counts: Vec<u32>,
}

/// Movement frequencies, `farmA-farmB count1,count2,...` per line. Moves from
/// a farm to itself are ignored.
pub fn read_movement_frequencies(path: &Path) -> Result<Vec<MovementRecord>, DataError> {
    let mut records = Vec::new();
    for (line_no, line) in read_lines(path)? {
        let (pair, counts) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| malformed(path, line_no, "expected farmA-farmB count1,count2,..."))?;
        let (departure, destination) = pair
            .split_once('-')
            .ok_or_else(|| malformed(path, line_no, format!("unparseable farm pair {pair:?}")))?;
        if departure == destination {
            continue;
        }
        let counts = counts
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| {
                c.parse()
                    .map_err(|_| malformed(path, line_no, format!("unparseable count {c:?}")))
            })
            .collect::<Result<Vec<u32>, DataError>>()?;
        records.push(MovementRecord {
            departure: departure.trim().to_string(),
            destination: destination.trim().to_string(),
            counts,
        });
    }
    Ok(records)
}
