pub mod jobs;

use std::path::{Path, PathBuf};

/// Where the job ledger database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
}

pub fn resolve_ledger_config(data_root: &Path) -> LedgerConfig {
    let db_path = std::env::var("ARTGEN_DB").ok();
    select_ledger_config(db_path.as_deref(), data_root)
}

fn select_ledger_config(db_path: Option<&str>, data_root: &Path) -> LedgerConfig {
    let raw = db_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| String::from("jobs.db"));
    let candidate = PathBuf::from(raw);
    let db_path = if candidate.is_absolute() {
        candidate
    } else {
        data_root.join(candidate)
    };
    LedgerConfig { db_path }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_under_the_data_root() {
        let cfg = select_ledger_config(None, Path::new("/var/lib/artgen"));
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/artgen/jobs.db"));
    }

    #[test]
    fn absolute_override_wins() {
        let cfg = select_ledger_config(Some("/data/ledger.db"), Path::new("/var/lib/artgen"));
        assert_eq!(cfg.db_path, PathBuf::from("/data/ledger.db"));
    }

    #[test]
    fn blank_override_is_ignored() {
        let cfg = select_ledger_config(Some("   "), Path::new("/var/lib/artgen"));
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/artgen/jobs.db"));
    }
}
