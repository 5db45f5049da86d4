use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::CommandSpec;
use crate::types::ScanKind;

/// How to launch the tool behind one scan kind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    /// Program the script is handed to, e.g. `bash`. Without one the script is executed directly.
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Script path; relative paths are looked up in the run's working directory.
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandEntry {
    pub fn bash(script: impl Into<String>) -> Self {
        Self {
            interpreter: Some("bash".into()),
            script: script.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandTableError {
    #[error("failed to read command table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid command table {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("command table has no entry for {0}")]
    MissingKind(ScanKind),
}

/// Mapping from every concrete scan kind to the command that runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    entries: BTreeMap<ScanKind, CommandEntry>,
}

impl CommandTable {
    /// Build a table; every concrete kind must be present.
    pub fn new(entries: BTreeMap<ScanKind, CommandEntry>) -> Result<Self, CommandTableError> {
        if let Some(missing) = ScanKind::ALL_ORDERED
            .into_iter()
            .find(|k| !entries.contains_key(k))
        {
            return Err(CommandTableError::MissingKind(missing));
        }
        Ok(Self { entries })
    }

    /// The stock scan scripts, run through `bash`.
    pub fn default_scripts() -> Self {
        let entries = [
            (ScanKind::TrivySbom, "1_run_trivy_sbom.sh"),
            (ScanKind::TrivyImage, "2_run_trivy_image.sh"),
            (ScanKind::Nmap, "3_run_nmap.sh"),
            (ScanKind::KubeBench, "4_run_kube_bench.sh"),
            (ScanKind::TrivyCluster, "5_run_trivy_cluster.sh"),
            (ScanKind::Kyverno, "6_run_kyverno.sh"),
        ]
        .into_iter()
        .map(|(k, s)| (k, CommandEntry::bash(s)))
        .collect();
        Self { entries }
    }

    /// Parse a JSON object of `kind -> entry`.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        let entries: BTreeMap<ScanKind, CommandEntry> = serde_json::from_str(s)?;
        Self::new(entries).map_err(serde::de::Error::custom)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, CommandTableError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CommandTableError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: BTreeMap<ScanKind, CommandEntry> =
            serde_json::from_str(&content).map_err(|source| CommandTableError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(entries)
    }

    pub fn entry(&self, kind: ScanKind) -> Option<&CommandEntry> {
        self.entries.get(&kind)
    }

    /// Resolve `kind` into a runnable command inside `workdir`.
    pub fn resolve(&self, kind: ScanKind, workdir: &Path) -> Option<CommandSpec> {
        let entry = self.entries.get(&kind)?;
        let script = Path::new(&entry.script);
        let script = if script.is_absolute() {
            script.to_path_buf()
        } else {
            workdir.join(script)
        };
        let script = script.to_string_lossy().into_owned();

        let cmd = match &entry.interpreter {
            Some(interp) => CommandSpec::new(interp.clone()).arg(script),
            None => CommandSpec::new(script),
        };
        Some(cmd.args(entry.args.iter().cloned()).current_dir(workdir))
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::default_scripts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_every_kind() {
        let table = CommandTable::default_scripts();
        for kind in ScanKind::ALL_ORDERED {
            assert!(table.entry(kind).is_some(), "missing {kind}");
        }
    }

    #[test]
    fn relative_script_resolves_against_workdir() {
        let table = CommandTable::default_scripts();
        let cmd = table
            .resolve(ScanKind::Kyverno, Path::new("/app"))
            .unwrap();
        assert_eq!(cmd.program, "bash");
        assert_eq!(cmd.args, vec!["/app/6_run_kyverno.sh".to_string()]);
        assert_eq!(cmd.cwd.as_deref(), Some(Path::new("/app")));
    }

    #[test]
    fn absolute_script_without_interpreter_runs_directly() {
        let mut entries = BTreeMap::new();
        for kind in ScanKind::ALL_ORDERED {
            entries.insert(
                kind,
                CommandEntry {
                    interpreter: None,
                    script: "/opt/scan.sh".into(),
                    args: vec!["--quiet".into()],
                },
            );
        }
        let table = CommandTable::new(entries).unwrap();
        let cmd = table.resolve(ScanKind::Nmap, Path::new("/work")).unwrap();
        assert_eq!(cmd.program, "/opt/scan.sh");
        assert_eq!(cmd.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn incomplete_table_is_rejected() {
        let err = CommandTable::from_json_str(r#"{"nmap":{"script":"nmap.sh"}}"#).unwrap_err();
        assert!(err.to_string().contains("no entry"));
    }
}
