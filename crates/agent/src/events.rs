use serde::Serialize;
use serde_json::Value;
use workbench_bus::{Bus, Topic};
use workbench_stream::ChartItem;

use crate::collab::Station;

pub const LOG_APPEND: &str = "log:append";
pub const CHARTS_SHOW: &str = "charts:show";
pub const CHARTS_SHOW_BATCH: &str = "charts:show-batch";
pub const CHAT_ASK_STATION: &str = "chat:ask-station";
pub const STATION_SELECTED: &str = "station:selected";

/// Log channel for reasoning summaries and untagged backend logs.
pub const THINK_CHANNEL: &str = "think";
pub const ROUTER_CHANNEL: &str = "router";
pub const CMD_CHANNEL: &str = "cmd";

pub const DEFAULT_CHART_TITLE: &str = "AI generated chart";
pub const DEFAULT_BATCH_TITLE: &str = "Chart overview";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub channel: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartDisplay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specs: Option<Vec<Value>>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartBatch {
    pub items: Vec<ChartItem>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationQuestion {
    pub station: Station,
    pub question: String,
}

/// Every event carried on the workbench bus.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkbenchEvent {
    LogAppend(LogEntry),
    ChartsShow(ChartDisplay),
    ChartsShowBatch(ChartBatch),
    /// A panel asks the chat to discuss a station.
    ChatAskStation(StationQuestion),
    StationSelected(Station),
}

pub type WorkbenchBus = Bus<WorkbenchEvent>;

impl WorkbenchEvent {
    pub fn log(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LogAppend(LogEntry {
            channel: channel.into(),
            message: message.into(),
        })
    }

    pub fn chart(spec: Value, specs: Option<Vec<Value>>, title: Option<String>) -> Self {
        Self::ChartsShow(ChartDisplay {
            spec: (!spec.is_null()).then_some(spec),
            specs,
            title: title_or(title, DEFAULT_CHART_TITLE),
        })
    }

    pub fn chart_batch(items: Vec<ChartItem>, title: Option<String>) -> Self {
        Self::ChartsShowBatch(ChartBatch {
            items,
            title: title_or(title, DEFAULT_BATCH_TITLE),
        })
    }

    pub fn ask_station(station: Station, question: impl Into<String>) -> Self {
        Self::ChatAskStation(StationQuestion {
            station,
            question: question.into(),
        })
    }
}

impl Topic for WorkbenchEvent {
    fn topic(&self) -> &str {
        match self {
            Self::LogAppend(_) => LOG_APPEND,
            Self::ChartsShow(_) => CHARTS_SHOW,
            Self::ChartsShowBatch(_) => CHARTS_SHOW_BATCH,
            Self::ChatAskStation(_) => CHAT_ASK_STATION,
            Self::StationSelected(_) => STATION_SELECTED,
        }
    }
}

fn title_or(title: Option<String>, fallback: &str) -> String {
    title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn topics_match_channel_names() {
        assert_eq!(WorkbenchEvent::log(CMD_CHANNEL, "x").topic(), LOG_APPEND);
        assert_eq!(
            WorkbenchEvent::chart(json!({}), None, None).topic(),
            CHARTS_SHOW
        );
        assert_eq!(
            WorkbenchEvent::chart_batch(Vec::new(), None).topic(),
            CHARTS_SHOW_BATCH
        );
        assert_eq!(
            WorkbenchEvent::ask_station(Station::new("A", "a"), "q").topic(),
            CHAT_ASK_STATION
        );
        assert_eq!(
            WorkbenchEvent::StationSelected(Station::new("A", "a")).topic(),
            STATION_SELECTED
        );
    }

    #[test]
    fn chart_titles_fall_back_to_defaults() {
        let WorkbenchEvent::ChartsShow(display) =
            WorkbenchEvent::chart(Value::Null, None, Some(" ".into()))
        else {
            panic!("expected charts:show");
        };
        assert_eq!(display.title, DEFAULT_CHART_TITLE);
        assert_eq!(display.spec, None);

        let WorkbenchEvent::ChartsShowBatch(batch) =
            WorkbenchEvent::chart_batch(Vec::new(), Some("Load by hour".into()))
        else {
            panic!("expected charts:show-batch");
        };
        assert_eq!(batch.title, "Load by hour");
    }
}
