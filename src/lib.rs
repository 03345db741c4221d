//! RepliKV - A minimal replicated key-value transaction simulator
//!
//! This is an educational implementation demonstrating core distributed
//! database concepts:
//! - Strict two-phase locking with lock promotion
//! - Available-copies replication across ten logical sites
//! - Multi-version snapshot reads for read-only transactions
//! - Site failure, recovery and commit-time validation
//! - Wait-for graph deadlock detection
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Script Driver                           │
//! │        (operation file, one logical tick per line)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Transaction Coordinator                     │
//! │   (tick loop, wait-for graph, deadlock, commit/abort)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Manager                           │
//! │     (available-copies routing, snapshots, lock release)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Sites 1 .. 10                            │
//! │      (variables, lock tables, readiness, fail/recover)      │
//! └─────────────────────────────────────────────────────────────┘

use std::fs;
use std::path::PathBuf;

use log::info;

pub mod data;
pub mod error;
pub mod parser;
pub mod txn;
pub mod types;

use crate::error::Result;
use crate::txn::TransactionManager;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing operation scripts
    pub input_dir: PathBuf,
    /// Script filename within the input directory
    pub input: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./input/"),
            input: "input1".to_string(),
        }
    }
}

impl Config {
    /// Full path of the configured script.
    pub fn script_path(&self) -> PathBuf {
        self.input_dir.join(&self.input)
    }
}

/// The simulator: a coordinator fed by a script.
pub struct Simulator {
    tm: TransactionManager,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Simulator {
            tm: TransactionManager::new(),
        }
    }

    /// Coordinator state, for inspection after a run.
    pub fn coordinator(&self) -> &TransactionManager {
        &self.tm
    }

    /// Run a script given as text. Returns every output line: dump output
    /// in script order followed by the final summary.
    pub fn run_script(&mut self, text: &str) -> Result<Vec<String>> {
        let ops = parser::parse_script(text)?;
        let mut output = Vec::new();
        for line in &ops {
            let lines = self.tm.step(&line.op)?;
            output.extend(lines);
        }
        output.extend(self.tm.final_report());
        Ok(output)
    }

    /// Run a script file.
    pub fn run_file(&mut self, path: &std::path::Path) -> Result<Vec<String>> {
        info!("running script {:?}", path);
        let text = fs::read_to_string(path)?;
        self.run_script(&text)
    }
}
