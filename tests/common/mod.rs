#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secscan_rs::commands::{CommandEntry, CommandTable};
use secscan_rs::hub::{BroadcastHub, RunEvent};
use secscan_rs::orchestrator::{Orchestrator, RunSettings};
use secscan_rs::store::{FsReportStore, ReportStore};
use secscan_rs::types::ScanKind;
use tokio::sync::mpsc;

/// Write one `sh` script per scan kind into `dir`; kinds not in `bodies` just echo their name.
pub fn write_scripts(dir: &Path, bodies: &[(ScanKind, &str)]) -> CommandTable {
    let mut entries = BTreeMap::new();
    for kind in ScanKind::ALL_ORDERED {
        let body = bodies
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, b)| b.to_string())
            .unwrap_or_else(|| format!("echo {kind} ok"));
        let name = format!("{kind}.sh");
        fs::write(dir.join(&name), body).expect("write script");
        entries.insert(
            kind,
            CommandEntry {
                interpreter: Some("sh".into()),
                script: name,
                args: Vec::new(),
            },
        );
    }
    CommandTable::new(entries).expect("complete table")
}

pub fn orchestrator(workdir: &Path, reports: &Path, table: CommandTable) -> Orchestrator {
    orchestrator_with_store(workdir, Arc::new(FsReportStore::new(reports)), table)
}

pub fn orchestrator_with_store(
    workdir: &Path,
    store: Arc<dyn ReportStore>,
    table: CommandTable,
) -> Orchestrator {
    Orchestrator::new(BroadcastHub::new(), store, table, RunSettings::new(workdir))
}

/// Receive until the end-of-stream marker (inclusive).
pub async fn collect_run(rx: &mut mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("run finished in time")
            .expect("channel open");
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Concatenated `Output` text per step, in step order.
pub fn outputs_per_step(events: &[RunEvent]) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    for e in events {
        match e {
            RunEvent::StepStarted { .. } => steps.push(String::new()),
            RunEvent::Output { text } => steps
                .last_mut()
                .expect("output inside a step")
                .push_str(text),
            _ => {}
        }
    }
    steps
}
