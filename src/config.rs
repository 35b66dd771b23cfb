//! Settings for one invocation, passed explicitly to the loader, the
//! scheduler and the cleaner.

use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;

/// Environment variable overriding the default parallelism.
pub const NUM_PROCESS_ENV: &str = "KILN_NUM_PROCESS";

#[derive(Debug, Clone)]
pub struct Config {
    /// Declarative task file.
    pub task_file: PathBuf,
    /// Build state log.
    pub db_path: PathBuf,
    /// Number of nodes run at once.
    pub parallelism: usize,
    /// Print actions as they run.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            task_file: PathBuf::from("kiln.json"),
            db_path: PathBuf::from(".kiln_db"),
            parallelism: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            verbose: false,
        }
    }
}

fn parse_parallelism(val: &str) -> anyhow::Result<usize> {
    match val.parse::<usize>() {
        Ok(0) => Err(anyhow!("parallelism must be at least 1")),
        Ok(n) => Ok(n),
        Err(err) => Err(anyhow!("invalid parallelism {:?}: {}", val, err)),
    }
}

impl Config {
    /// Defaults, overridden by the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        if let Ok(val) = std::env::var(NUM_PROCESS_ENV) {
            config.parallelism =
                parse_parallelism(&val).with_context(|| format!("${}", NUM_PROCESS_ENV))?;
        }
        Ok(config)
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> anyhow::Result<Self> {
        if parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        self.parallelism = parallelism;
        Ok(self)
    }
}
