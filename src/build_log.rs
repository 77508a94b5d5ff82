//! Persistent log of executed commands, used to decide whether an edge needs
//! to rerun: command changes, restat-cleaned mtimes, and timing all live
//! here.  One record per output per command execution; on load, the last
//! record for an output wins.

use crate::disk::MTime;
use crate::graph::{EdgeId, Graph};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, BufWriter, Write};

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub start_ms: i64,
    pub end_ms: i64,
    /// The mtime recorded for the output; 0 when unknown.  For restat edges
    /// this is the logical start time, not the on-disk time.
    pub mtime: i64,
    pub command_hash: u64,
}

pub fn hash_command(cmd: &str) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    cmd.hash(&mut h);
    h.finish()
}

pub struct BuildLog {
    path: String,
    entries: HashMap<String, LogEntry>,
    w: Option<BufWriter<File>>,
}

impl BuildLog {
    /// Open a build log, loading any prior records.  Unparseable lines are
    /// skipped so a truncated log never blocks a build.
    pub fn open(path: impl Into<String>) -> anyhow::Result<BuildLog> {
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
                    let parsed = (|| {
                        let start_ms: i64 = fields.next()?.parse().ok()?;
                        let end_ms: i64 = fields.next()?.parse().ok()?;
                        let mtime: i64 = fields.next()?.parse().ok()?;
                        let output = fields.next()?.to_string();
                        let command_hash = u64::from_str_radix(fields.next()?, 16).ok()?;
                        Some((
                            output,
                            LogEntry {
                                start_ms,
                                end_ms,
                                mtime,
                                command_hash,
                            },
                        ))
                    })();
                    if let Some((output, entry)) = parsed {
                        entries.insert(output, entry);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(anyhow::anyhow!("open {}: {}", path, err)),
        }
        Ok(BuildLog {
            path,
            entries,
            w: None,
        })
    }

    pub fn lookup_by_output(&self, path: &str) -> Option<&LogEntry> {
        self.entries.get(path)
    }

    fn open_for_write(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        if self.w.is_none() {
            let f = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.path)?;
            self.w = Some(BufWriter::new(f));
        }
        Ok(self.w.as_mut().unwrap())
    }

    /// Record one executed edge, one line per output.
    pub fn record_command(
        &mut self,
        graph: &Graph,
        id: EdgeId,
        start_ms: i64,
        end_ms: i64,
        mtime: MTime,
    ) -> std::io::Result<()> {
        let edge = graph.edge(id);
        let command_hash = hash_command(edge.cmdline.as_deref().unwrap_or(""));
        let mtime = match mtime {
            MTime::Stamp(t) => t,
            _ => 0,
        };
        let outputs: Vec<String> = edge
            .outs
            .iter()
            .map(|&o| graph.node(o).path.clone())
            .collect();
        let w = self.open_for_write()?;
        for output in &outputs {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{:x}",
                start_ms, end_ms, mtime, output, command_hash
            )?;
        }
        w.flush()?;
        for output in outputs {
            self.entries.insert(
                output,
                LogEntry {
                    start_ms,
                    end_ms,
                    mtime,
                    command_hash,
                },
            );
        }
        Ok(())
    }

    /// Close the underlying file.  Called before a generator edge runs so it
    /// may rotate or rewrite the log; the next record reopens it.
    pub fn close(&mut self) {
        if let Some(mut w) = self.w.take() {
            let _ = w.flush();
        }
    }
}
