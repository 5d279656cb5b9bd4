/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Free text (including `/clear`) forwarded to the chat controller.
    Chat(String),
    Stations(String),
    Search(String),
    Coverage(String),
    Ask { station_id: String, question: String },
    Select(String),
    Help,
    Quit,
    Usage(&'static str),
}

pub const HELP: &str = "\
commands:
  <text>                     ask the agent
  /clear                     reset the conversation
  /stations <city>           list base stations in a city
  /search <query>            similarity search over stations
  /coverage <station id>     estimate a station's coverage
  /ask <station id> <text>   ask the agent about a station
  /select <station id>       mark a station as selected
  /help                      show this help
  /quit                      exit";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Chat(line.to_string());
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        match name.to_ascii_lowercase().as_str() {
            "quit" | "exit" => Self::Quit,
            "help" => Self::Help,
            "stations" => required(argument, Self::Stations, "usage: /stations <city>"),
            "search" => required(argument, Self::Search, "usage: /search <query>"),
            "coverage" => required(argument, Self::Coverage, "usage: /coverage <station id>"),
            "select" => required(argument, Self::Select, "usage: /select <station id>"),
            "ask" => match argument.split_once(char::is_whitespace) {
                Some((station_id, question)) if !question.trim().is_empty() => Self::Ask {
                    station_id: station_id.to_string(),
                    question: question.trim().to_string(),
                },
                _ => Self::Usage("usage: /ask <station id> <question>"),
            },
            _ => Self::Chat(line.to_string()),
        }
    }
}

fn required(argument: &str, build: fn(String) -> Command, usage: &'static str) -> Command {
    if argument.is_empty() {
        Command::Usage(usage)
    } else {
        build(argument.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_and_clear_go_to_chat() {
        assert_eq!(
            Command::parse("  show stations in Beijing "),
            Command::Chat("show stations in Beijing".to_string())
        );
        assert_eq!(
            Command::parse("/clear"),
            Command::Chat("/clear".to_string())
        );
        assert_eq!(
            Command::parse("/unknown thing"),
            Command::Chat("/unknown thing".to_string())
        );
    }

    #[test]
    fn parses_station_commands() {
        assert_eq!(
            Command::parse("/stations Beijing"),
            Command::Stations("Beijing".to_string())
        );
        assert_eq!(
            Command::parse("/SEARCH  high load 5G "),
            Command::Search("high load 5G".to_string())
        );
        assert_eq!(
            Command::parse("/ask BJ-001 what is the coverage?"),
            Command::Ask {
                station_id: "BJ-001".to_string(),
                question: "what is the coverage?".to_string(),
            }
        );
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }

    #[test]
    fn missing_arguments_yield_usage() {
        assert!(matches!(Command::parse("/coverage"), Command::Usage(_)));
        assert!(matches!(Command::parse("/ask BJ-001"), Command::Usage(_)));
        assert!(matches!(Command::parse("/select   "), Command::Usage(_)));
    }
}
