use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded `data:` payload of the chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Marks the stream opening; carries nothing.
    Start,
    Token {
        #[serde(default, deserialize_with = "null_as_empty")]
        delta: String,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, deserialize_with = "null_as_empty")]
        message: String,
    },
    Tool(ToolInvocation),
    /// Terminal event.
    End,
}

/// Out-of-band tool payloads, discriminated by the `tool` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolInvocation {
    Plotly {
        #[serde(default)]
        spec: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        specs: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    PlotlyBatch {
        #[serde(default, deserialize_with = "items_or_empty")]
        items: Vec<ChartItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Tool kinds this client does not render.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub spec: Value,
}

impl StreamEvent {
    pub fn token(delta: impl Into<String>) -> Self {
        Self::Token {
            delta: delta.into(),
        }
    }

    pub fn log(channel: Option<&str>, message: impl Into<String>) -> Self {
        Self::Log {
            channel: channel.map(str::to_string),
            message: message.into(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// A non-array `items` degrades to an empty batch instead of failing the frame.
fn items_or_empty<'de, D>(deserializer: D) -> Result<Vec<ChartItem>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(entries) => Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect()),
        _ => Ok(Vec::new()),
    }
}
