use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static PLOTLY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```plotly\s*(.*?)```").expect("plotly block pattern is valid")
});

/// Finds the first fenced `plotly` block in finished answer text and parses
/// its body as a chart spec.
///
/// Later blocks are ignored; a body that is not valid JSON yields `None`.
pub fn recover_plotly_spec(text: &str) -> Option<Value> {
    let body = PLOTLY_BLOCK.captures(text)?.get(1)?.as_str();
    match serde_json::from_str(body.trim()) {
        Ok(spec) => Some(spec),
        Err(error) => {
            tracing::debug!(error = %error, "ignoring unparsable plotly block");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn recovers_spec_from_tagged_block() {
        let text = "Here is the chart:\n```plotly\n{\"data\":[],\"layout\":{}}\n```\nDone.";
        assert_eq!(
            recover_plotly_spec(text),
            Some(json!({"data": [], "layout": {}}))
        );
    }

    #[test]
    fn tag_is_case_insensitive_and_body_may_share_the_line() {
        assert_eq!(
            recover_plotly_spec("```PLOTLY {\"data\":[1]}```"),
            Some(json!({"data": [1]}))
        );
    }

    #[test]
    fn no_block_means_no_spec() {
        assert_eq!(recover_plotly_spec("plain answer, no charts"), None);
        assert_eq!(recover_plotly_spec("```json\n{\"data\":[]}\n```"), None);
    }

    #[test]
    fn malformed_body_is_ignored() {
        assert_eq!(recover_plotly_spec("```plotly\n{data: oops}\n```"), None);
    }

    #[test]
    fn first_block_wins() {
        let text = "```plotly\n{\"n\":1}\n``` and ```plotly\n{\"n\":2}\n```";
        assert_eq!(recover_plotly_spec(text), Some(json!({"n": 1})));
    }

    #[test]
    fn unterminated_block_is_not_recovered() {
        assert_eq!(recover_plotly_spec("```plotly\n{\"data\":[]}"), None);
    }
}
