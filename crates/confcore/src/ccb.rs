use std::sync::Arc;

use confcache::ConfLoader;

use crate::conf_object::ConfObject;
use crate::conf_kind::ConfKind;
use crate::error::{Error, Result};

/// The bits and required handling every CCB file must define before it is
/// accepted (Scenario A). A production deployment's exact baseline lives in
/// policy, not code; these are the bits named by the scenario, all
/// requiring `Handling::Block` here as the simplest baseline contract that
/// exercises the "required, missing -> reject" path end to end.
const REQUIRED_BASELINE: &[u32] = &[64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 85, 108, 110, 148, 151, 152];
const REQUIRED_HANDLING: Handling = Handling::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Block,
    Allow,
    Warn,
    DomainTagging,
}

impl Handling {
    fn parse(s: &str) -> Option<Handling> {
        match s {
            "block" => Some(Handling::Block),
            "allow" => Some(Handling::Allow),
            "warn" => Some(Handling::Warn),
            "domaintagging" => Some(Handling::DomainTagging),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CcbEntry {
    pub keyword: String,
    pub bit: u32,
    pub handling: Handling,
    pub masked: bool,
}

/// The category-baseline conf type (§6 "CCB file", Scenario A): the
/// crate's canonical non-segmented exemplar.
#[derive(Debug)]
pub struct Ccb {
    pub entries: Vec<CcbEntry>,
}

impl ConfObject for Ccb {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_name(&self) -> &'static str {
        "ccb"
    }
}

impl Ccb {
    pub fn handling_for(&self, bit: u32) -> Option<Handling> {
        self.entries.iter().find(|e| e.bit == bit).map(|e| e.handling)
    }
}

pub struct CcbKind;

impl ConfKind for CcbKind {
    fn parse(&self, loader: &mut ConfLoader) -> Result<Arc<dyn ConfObject>> {
        parse_ccb(loader).map(|ccb| Arc::new(ccb) as Arc<dyn ConfObject>)
    }
}

fn corrupt(loader: &ConfLoader, msg: impl Into<String>) -> Error {
    Error::Cache(confcache::Error::Corruption { at: format!("{}:{}: {}", loader.path().display(), loader.line(), msg.into()) })
}

fn parse_ccb(loader: &mut ConfLoader) -> Result<Ccb> {
    let header = loader.readline(confcache::CHOMP)?.ok_or_else(|| corrupt(loader, "empty file, expected header"))?;
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("ccb"), Some("2")) => {}
        _ => return Err(corrupt(loader, format!("bad header {:?}, expected \"ccb 2\"", header))),
    }

    let count_line = loader.readline(confcache::CHOMP)?.ok_or_else(|| corrupt(loader, "missing count line"))?;
    let count: usize = count_line
        .strip_prefix("count ")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| corrupt(loader, format!("bad count line {:?}", count_line)))?;

    let mut entries: Vec<CcbEntry> = Vec::with_capacity(count);
    let flags = confcache::CHOMP | confcache::SKIP_EMPTY | confcache::SKIP_COMMENTS;
    while let Some(line) = loader.readline(flags)? {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(corrupt(loader, format!("expected 4 colon-separated fields, got {}", fields.len())));
        }
        let bit: u32 = fields[1].parse().map_err(|_| corrupt(loader, format!("bad bit number {:?}", fields[1])))?;
        let handling = Handling::parse(fields[2]).ok_or_else(|| corrupt(loader, format!("unknown handling {:?}", fields[2])))?;
        let masked = fields[3] != "0";

        if let Some(prev) = entries.last() {
            if bit <= prev.bit {
                return Err(corrupt(loader, format!("bit {} out of order or duplicate after {}", bit, prev.bit)));
            }
        }
        entries.push(CcbEntry { keyword: fields[0].to_owned(), bit, handling, masked });
    }

    if entries.len() != count {
        return Err(corrupt(loader, format!("header declared count {} but found {} records", count, entries.len())));
    }

    for &required_bit in REQUIRED_BASELINE {
        match entries.iter().find(|e| e.bit == required_bit) {
            Some(e) if e.handling == REQUIRED_HANDLING => {}
            Some(e) => {
                return Err(corrupt(loader, format!("category bit {} must have handling {:?}, found {:?}", required_bit, REQUIRED_HANDLING, e.handling)));
            }
            None => {
                return Err(corrupt(loader, format!("category bit {} must have handling {:?}", required_bit, REQUIRED_HANDLING)));
            }
        }
    }

    Ok(Ccb { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        dir.push(format!("confcore-ccb-test-{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_and_parse(contents: &str) -> Result<Ccb> {
        let dir = tempdir();
        let path = dir.join("ccb");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        let mut loader = ConfLoader::open(&path, None, None, 0).unwrap().unwrap();
        parse_ccb(&mut loader)
    }

    #[test]
    fn scenario_a_missing_baseline_is_rejected() {
        let err = write_and_parse("ccb 2\ncount 1\nAlcohol:1:domaintagging:0\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("must have handling"), "unexpected message: {}", msg);
    }

    #[test]
    fn complete_baseline_loads() {
        let mut body = String::from("ccb 2\n");
        let bits = REQUIRED_BASELINE;
        body.push_str(&format!("count {}\n", bits.len()));
        for &bit in bits {
            body.push_str(&format!("kw{}:{}:block:0\n", bit, bit));
        }
        let ccb = write_and_parse(&body).unwrap();
        assert_eq!(ccb.entries.len(), bits.len());
        assert_eq!(ccb.handling_for(64), Some(Handling::Block));
    }

    #[test]
    fn out_of_order_bit_is_rejected() {
        let err = write_and_parse("ccb 2\ncount 2\nb:5:block:0\na:3:block:0\n").unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn bad_header_is_rejected() {
        assert!(write_and_parse("notccb 1\ncount 0\n").is_err());
    }
}
