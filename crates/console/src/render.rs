use std::io::Write;

use serde_json::Value;
use tokio::sync::watch;
use workbench_agent::collab::{CoverageEstimate, Station};
use workbench_agent::events::{
    CHARTS_SHOW, CHARTS_SHOW_BATCH, LOG_APPEND, WorkbenchBus, WorkbenchEvent,
};
use workbench_agent::{MessageStatus, Role, Transcript};
use workbench_bus::Subscription;

/// Prints the assistant side of the conversation incrementally.
///
/// User messages are not echoed; the operator typed them.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    generation: u64,
    // Messages fully printed.
    cursor: usize,
    // Bytes of `messages[cursor]` already printed, once its prefix is out.
    offset: Option<usize>,
}

impl TranscriptPrinter {
    pub fn render(&mut self, transcript: &Transcript) -> String {
        let mut output = String::new();
        if transcript.generation != self.generation {
            if self.offset.is_some() {
                output.push('\n');
            }
            *self = Self {
                generation: transcript.generation,
                ..Self::default()
            };
            output.push_str("-- conversation cleared --\n");
        }

        let messages = &transcript.messages;
        while let Some(message) = messages.get(self.cursor) {
            if message.role == Role::User {
                self.cursor += 1;
                continue;
            }

            let offset = match self.offset {
                Some(offset) => offset,
                None => {
                    output.push_str(match message.status {
                        MessageStatus::Failed => "agent! ",
                        _ => "agent> ",
                    });
                    0
                }
            };
            if let Some(fresh) = message.content.get(offset..) {
                output.push_str(fresh);
            }
            self.offset = Some(message.content.len());

            if matches!(message.status, MessageStatus::Streaming(_)) {
                break;
            }
            if message.status == MessageStatus::Cancelled {
                output.push_str(" [cancelled]");
            }
            output.push('\n');
            if let Some(suggest) = &message.meta.suggest {
                output.push_str(&format!("  hint: {suggest}\n"));
            }
            self.cursor += 1;
            self.offset = None;
        }

        output
    }
}

/// Follows the controller's transcript until the controller is gone.
pub async fn follow_transcript(mut snapshots: watch::Receiver<Transcript>) {
    let mut printer = TranscriptPrinter::default();
    loop {
        let output = printer.render(&snapshots.borrow_and_update());
        if !output.is_empty() {
            let mut stdout = std::io::stdout().lock();
            if let Err(error) = stdout
                .write_all(output.as_bytes())
                .and_then(|()| stdout.flush())
            {
                tracing::warn!(error = %error, "failed to write transcript");
            }
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

/// One-line panel rendering of a bus event.
pub fn describe(event: &WorkbenchEvent) -> Option<String> {
    match event {
        WorkbenchEvent::LogAppend(entry) => Some(format!("[{}] {}", entry.channel, entry.message)),
        WorkbenchEvent::ChartsShow(display) => {
            let series = display
                .specs
                .as_ref()
                .map(Vec::len)
                .or_else(|| display.spec.as_ref().map(trace_count))
                .unwrap_or(0);
            Some(format!("[chart] {} ({series} series)", display.title))
        }
        WorkbenchEvent::ChartsShowBatch(batch) => Some(format!(
            "[charts] {} ({} charts)",
            batch.title,
            batch.items.len()
        )),
        WorkbenchEvent::ChatAskStation(_) | WorkbenchEvent::StationSelected(_) => None,
    }
}

fn trace_count(spec: &Value) -> usize {
    spec.get("data").and_then(Value::as_array).map_or(0, Vec::len)
}

/// Subscribes the log and chart panels.
pub fn attach_panels(bus: &WorkbenchBus) -> Vec<Subscription> {
    [LOG_APPEND, CHARTS_SHOW, CHARTS_SHOW_BATCH]
        .into_iter()
        .map(|topic| {
            bus.on(topic, |event: &WorkbenchEvent| {
                if let Some(line) = describe(event) {
                    println!("\n{line}");
                }
            })
        })
        .collect()
}

pub fn station_line(station: &Station) -> String {
    let mut line = format!("{:<12} {}", station.id, station.label());
    for detail in [&station.city, &station.vendor, &station.band, &station.status]
        .into_iter()
        .flatten()
    {
        line.push_str(" | ");
        line.push_str(detail);
    }
    line
}

pub fn coverage_line(estimate: &CoverageEstimate) -> String {
    let mut line = format!(
        "{} covers ~{:.0} m",
        estimate.station.label(),
        estimate.radius_m
    );
    if let Some(address) = &estimate.address {
        line.push_str(&format!(" around {address}"));
    }
    line
}
