//! Profiler map emission.
//!
//! The JIT writes `/tmp/perf-<pid>.map` so sampling profilers can attribute
//! generated code. One line per symbol: `<hex addr> <dec size> <symbol>`.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct SymbolRecord {
    pub symbol: String,
    pub addr: u64,
    pub size: u64,
}

/// Derive symbol sizes from addresses.
///
/// Collects every symbol address and every section-end address, stable
/// sorts by address, and assigns each symbol the gap to the next distinct
/// address. Symbols sharing an address share a size. This recovers runtime
/// sizes even where the artifact records none.
pub fn compute_symbol_sizes(symbols: &[(String, u64)], section_ends: &[u64]) -> Vec<SymbolRecord> {
    // (address, index into `symbols`); section ends carry no index
    let mut entries: Vec<(u64, Option<usize>)> = symbols
        .iter()
        .enumerate()
        .map(|(i, (_, addr))| (*addr, Some(i)))
        .collect();
    entries.extend(section_ends.iter().map(|&addr| (addr, None)));
    entries.sort_by_key(|&(addr, _)| addr);

    let mut sizes = vec![0u64; symbols.len()];
    let n = entries.len();
    for i in 0..n.saturating_sub(1) {
        let (addr, sym) = entries[i];
        let Some(sym) = sym else { continue };
        let mut next = i + 1;
        while next < n - 1 && entries[next].0 == addr {
            next += 1;
        }
        sizes[sym] = entries[next].0 - addr;
    }

    symbols
        .iter()
        .zip(sizes)
        .map(|((symbol, addr), size)| SymbolRecord { symbol: symbol.clone(), addr: *addr, size })
        .collect()
}

/// The canonical per-process map path.
pub fn perf_map_path() -> PathBuf {
    PathBuf::from(format!("/tmp/perf-{}.map", std::process::id()))
}

/// Write the map to the canonical per-process path.
pub fn write(records: &[SymbolRecord]) -> Result<PathBuf> {
    let path = perf_map_path();
    write_to(records, &path)?;
    Ok(path)
}

/// Write the map to a temporary file and atomically rename it into place.
/// Entries with zero address or zero size are skipped.
pub fn write_to(records: &[SymbolRecord], path: &std::path::Path) -> Result<()> {
    let dir = path.parent().expect("perf map path has a parent");
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
    for rec in records {
        if rec.size == 0 || rec.addr == 0 {
            continue;
        }
        writeln!(tmp, "{:x} {} {}", rec.addr, rec.size, rec.symbol)?;
    }
    tmp.persist(path)
        .with_context(|| format!("cannot rename perf map into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_gaps_to_next_address() {
        let symbols = vec![
            ("a".to_string(), 0x1000),
            ("b".to_string(), 0x1040),
            ("c".to_string(), 0x10a0),
        ];
        let ends = vec![0x1100];
        let recs = compute_symbol_sizes(&symbols, &ends);
        assert_eq!(recs[0].size, 0x40);
        assert_eq!(recs[1].size, 0x60);
        assert_eq!(recs[2].size, 0x60);
    }

    #[test]
    fn aliased_symbols_share_a_size() {
        let symbols = vec![
            ("a".to_string(), 0x1000),
            ("alias_of_a".to_string(), 0x1000),
            ("b".to_string(), 0x1080),
        ];
        let ends = vec![0x1100];
        let recs = compute_symbol_sizes(&symbols, &ends);
        assert_eq!(recs[0].size, 0x80);
        assert_eq!(recs[1].size, 0x80);
        assert_eq!(recs[2].size, 0x80);
    }

    #[test]
    fn map_skips_empty_entries() {
        let records = vec![
            SymbolRecord { symbol: "live".to_string(), addr: 0x2000, size: 0x10 },
            SymbolRecord { symbol: "empty".to_string(), addr: 0x3000, size: 0 },
            SymbolRecord { symbol: "null".to_string(), addr: 0, size: 0x10 },
        ];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.map");
        write_to(&records, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "2000 16 live\n");
        assert!(perf_map_path().to_string_lossy().starts_with("/tmp/perf-"));
    }
}
