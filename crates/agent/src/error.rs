use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AgentError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },

    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    SendRequest {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("{url} answered {status} on `{stage}`: {body}"))]
    ResponseStatus {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[snafu(display("backend returned no stream body on `{stage}`"))]
    MissingBody { stage: &'static str },

    #[snafu(display("failed to read stream chunk on `{stage}`: {source}"))]
    ReadChunk {
        stage: &'static str,
        source: reqwest::Error,
    },

    #[snafu(display("failed to decode response from {url} on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("{url} rejected the request on `{stage}`: {message}"))]
    Rejected {
        stage: &'static str,
        url: String,
        message: String,
    },

    /// Failure reported by a non-HTTP transport.
    #[snafu(display("transport failed on `{stage}`: {message}"))]
    Transport {
        stage: &'static str,
        message: String,
    },
}

pub type AgentResult<T> = Result<T, AgentError>;
