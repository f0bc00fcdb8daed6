//! Durable ledger store: one file per billing cycle.
//!
//! The live cycle is kept in memory and flushed to `ssledger_<cycle>.json`
//! on every write. On rollover the live file is renamed with a `.pending`
//! suffix and a fresh file starts. Recovery scans the directory and resumes
//! from the highest cycle found, preferring a live file over pending ones.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::{LedgerStore, SsLedger, StoreError};

const FILE_PREFIX: &str = "ssledger_";
const FILE_SUFFIX: &str = ".json";
const PENDING_SUFFIX: &str = ".json.pending";

pub struct FileLedgerStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    curr_cycle: i64,
    entries: HashMap<String, SsLedger>,
}

fn parse_cycle(name: &str) -> Option<(i64, bool)> {
    let rest = name.strip_prefix(FILE_PREFIX)?;
    if let Some(cycle) = rest.strip_suffix(PENDING_SUFFIX) {
        return cycle.parse().ok().map(|c| (c, true));
    }
    let cycle = rest.strip_suffix(FILE_SUFFIX)?;
    cycle.parse().ok().map(|c| (c, false))
}

fn read_entries(path: &Path) -> Result<Vec<SsLedger>, StoreError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn write_entries(path: &Path, entries: &[SsLedger]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec(entries)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl FileLedgerStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut live: Option<i64> = None;
        let mut max_pending: Option<i64> = None;
        for dirent in fs::read_dir(&root)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_cycle(name) {
                Some((cycle, true)) => max_pending = Some(max_pending.unwrap_or(cycle).max(cycle)),
                Some((cycle, false)) => live = Some(live.unwrap_or(cycle).max(cycle)),
                None => {}
            }
        }

        // A crash between rename and the first write of the new cycle leaves
        // only pending files behind; resume one cycle past the newest.
        let curr_cycle = match (live, max_pending) {
            (Some(c), _) => c,
            (None, Some(p)) => p + 1,
            (None, None) => 1,
        };

        let mut entries = HashMap::new();
        let live_path = root.join(format!("{FILE_PREFIX}{curr_cycle}{FILE_SUFFIX}"));
        if live_path.exists() {
            for entry in read_entries(&live_path)? {
                entries.insert(entry.partner.clone(), entry);
            }
        }
        debug!(cycle = curr_cycle, entries = entries.len(), root = %root.display(),
            "opened ledger store");

        Ok(Self {
            root,
            inner: Mutex::new(Inner {
                curr_cycle,
                entries,
            }),
        })
    }

    fn live_path(&self, cycle: i64) -> PathBuf {
        self.root.join(format!("{FILE_PREFIX}{cycle}{FILE_SUFFIX}"))
    }

    fn pending_path(&self, cycle: i64) -> PathBuf {
        self.root
            .join(format!("{FILE_PREFIX}{cycle}{PENDING_SUFFIX}"))
    }

    fn flush(&self, inner: &Inner) -> Result<(), StoreError> {
        let entries: Vec<SsLedger> = inner.entries.values().cloned().collect();
        write_entries(&self.live_path(inner.curr_cycle), &entries)
    }

    fn pending_cycles(&self) -> Result<Vec<i64>, StoreError> {
        let mut cycles = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((cycle, true)) = parse_cycle(name) {
                cycles.push(cycle);
            }
        }
        cycles.sort_unstable();
        Ok(cycles)
    }
}

impl LedgerStore for FileLedgerStore {
    fn get(&self, val: &mut SsLedger) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        match inner.entries.get(&val.partner) {
            Some(entry) => {
                *val = entry.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn store(&self, val: &SsLedger) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.entries.insert(val.partner.clone(), val.clone());
        self.flush(&inner)
    }

    fn list(&self) -> Result<Vec<SsLedger>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.entries.values().cloned().collect())
    }

    fn update(&self, new_cycle: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.flush(&inner)?;
        let live = self.live_path(inner.curr_cycle);
        if live.exists() {
            fs::rename(&live, self.pending_path(inner.curr_cycle))?;
        }
        inner.curr_cycle = new_cycle;
        inner.entries.clear();
        self.flush(&inner)
    }

    fn billing_cycle(&self) -> i64 {
        self.inner.lock().curr_cycle
    }

    fn get_pending(&self) -> Result<BTreeMap<i64, Vec<SsLedger>>, StoreError> {
        let _guard = self.inner.lock();
        let mut out = BTreeMap::new();
        for cycle in self.pending_cycles()? {
            let entries = read_entries(&self.pending_path(cycle))?;
            if !entries.is_empty() {
                out.insert(cycle, entries);
            }
        }
        Ok(out)
    }

    fn clear_pending(&self, cycles: &[i64]) -> Result<Vec<i64>, StoreError> {
        let _guard = self.inner.lock();
        let mut cleared = Vec::new();
        for &cycle in cycles {
            let path = self.pending_path(cycle);
            if path.exists() {
                fs::remove_file(&path)?;
                cleared.push(cycle);
            }
        }
        Ok(cleared)
    }

    fn close(&self) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        self.flush(&inner)
    }
}
