//! Persistent log of discovered dependencies (depfile and /showIncludes
//! results), so later builds can dirty-check against headers without
//! rerunning the compiler.  Keyed by output path; entries carry the output
//! mtime they were recorded at, so a stale entry is detectable.

use crate::disk::MTime;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};

#[derive(Clone, Debug)]
pub struct DepsEntry {
    /// Output mtime at record time; an output newer than this means the
    /// recorded deps may be out of date.
    pub mtime: i64,
    pub deps: Vec<String>,
}

pub struct DepsLog {
    path: String,
    entries: HashMap<String, DepsEntry>,
    w: Option<BufWriter<File>>,
}

impl DepsLog {
    pub fn open(path: impl Into<String>) -> anyhow::Result<DepsLog> {
        let path = path.into();
        let mut entries = HashMap::new();
        match File::open(&path) {
            Ok(f) => {
                for line in BufReader::new(f).lines() {
                    let line = match line {
                        Ok(l) => l,
                        Err(_) => break,
                    };
                    let mut fields = line.split('\t');
                    let mtime: i64 = match fields.next().and_then(|s| s.parse().ok()) {
                        Some(t) => t,
                        None => continue,
                    };
                    let output = match fields.next() {
                        Some(o) => o.to_string(),
                        None => continue,
                    };
                    let deps: Vec<String> = fields.map(str::to_string).collect();
                    entries.insert(output, DepsEntry { mtime, deps });
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(anyhow::anyhow!("open {}: {}", path, err)),
        }
        Ok(DepsLog {
            path,
            entries,
            w: None,
        })
    }

    pub fn get_deps(&self, output: &str) -> Option<&DepsEntry> {
        self.entries.get(output)
    }

    pub fn record_deps(
        &mut self,
        output: &str,
        mtime: MTime,
        deps: &[String],
    ) -> std::io::Result<()> {
        let mtime = match mtime {
            MTime::Stamp(t) => t,
            _ => 0,
        };
        if let Some(entry) = self.entries.get(output) {
            if entry.mtime == mtime && entry.deps == deps {
                return Ok(());
            }
        }
        if self.w.is_none() {
            let f = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.path)?;
            self.w = Some(BufWriter::new(f));
        }
        let w = self.w.as_mut().unwrap();
        write!(w, "{}\t{}", mtime, output)?;
        for dep in deps {
            write!(w, "\t{}", dep)?;
        }
        writeln!(w)?;
        w.flush()?;
        self.entries.insert(
            output.to_string(),
            DepsEntry {
                mtime,
                deps: deps.to_vec(),
            },
        );
        Ok(())
    }
}
