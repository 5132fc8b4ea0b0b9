use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tenderlens::config::init_tracing;
use tenderlens::poller::PolledStatus;
use tenderlens::{poll_until_ready, PollConfig, SessionStatus};

#[derive(Parser, Debug)]
#[command(
    name = "tenderlens-chat",
    about = "Drive a tenderlens analysis session from the terminal"
)]
struct ChatCli {
    /// Base URL of tenderlens-api
    #[arg(
        long,
        env = "TENDERLENS_API_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    api_url: String,

    /// Caller id sent as x-user-id
    #[arg(long, env = "TENDERLENS_USER_ID", default_value_t = 1)]
    user_id: i64,

    /// HTTP timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Milliseconds between status polls
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Status polls before giving up
    #[arg(long, default_value_t = 30)]
    poll_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session for a tender and wait until it is ready.
    Init {
        #[arg(long)]
        tender_id: i64,
        /// Return immediately instead of waiting for READY
        #[arg(long, default_value_t = false)]
        no_wait: bool,
    },
    /// Show a session's status.
    Status {
        #[arg(long)]
        session: String,
    },
    /// Wait for a session to become READY.
    Wait {
        #[arg(long)]
        session: String,
    },
    /// Print the structured tender overview.
    Overview {
        #[arg(long)]
        session: String,
    },
    /// Print risk insights.
    Insights {
        #[arg(long)]
        session: String,
    },
    /// Summarize named sections.
    Sections {
        #[arg(long)]
        session: String,
        #[arg(long = "section", required = true)]
        sections: Vec<String>,
    },
    /// Ask a free-form question about the tender.
    Ask {
        #[arg(long)]
        session: String,
        #[arg(long)]
        question: String,
    },
}

#[derive(Debug, Deserialize)]
struct InitReply {
    session_id: String,
    status: SessionStatus,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: SessionStatus,
    error_message: Option<String>,
    #[serde(default)]
    chunks_embedded: u64,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    answer: String,
    #[serde(default)]
    sources: Vec<ChatSource>,
}

#[derive(Debug, Deserialize)]
struct ChatSource {
    text: String,
    page: Option<i32>,
    section: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
    message: String,
}

struct ApiClient {
    http: Client,
    base: String,
    user_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = ChatCli::parse();
    let client = ApiClient::new(&cli.api_url, cli.user_id, cli.timeout_secs)?;
    let poll = PollConfig {
        interval: Duration::from_millis(cli.poll_interval_ms),
        max_attempts: cli.poll_attempts,
    };

    match cli.command {
        Command::Init { tender_id, no_wait } => {
            let reply: InitReply = client
                .post("/v1/sessions", json!({ "tender_id": tender_id }))
                .await?;
            println!("Session {} ({}): {}", reply.session_id, reply.status, reply.message);
            if !no_wait {
                wait_ready(&client, &reply.session_id, poll).await?;
            }
        }
        Command::Status { session } => {
            let status = client.status(&session).await?;
            println!("Status: {}", status.status);
            println!("Chunks embedded: {}", status.chunks_embedded);
            if let Some(message) = status.error_message {
                println!("Error: {message}");
            }
        }
        Command::Wait { session } => wait_ready(&client, &session, poll).await?,
        Command::Overview { session } => {
            let reply: Value = client
                .post("/v1/analysis/overview", json!({ "session_id": session }))
                .await?;
            print_json(&reply["overview"])?;
        }
        Command::Insights { session } => {
            let reply: Value = client
                .post("/v1/analysis/insights", json!({ "session_id": session }))
                .await?;
            print_json(&reply["insights"])?;
        }
        Command::Sections { session, sections } => {
            let reply: Value = client
                .post(
                    "/v1/analysis/sections",
                    json!({ "session_id": session, "sections": sections }),
                )
                .await?;
            print_json(&reply["sections"])?;
        }
        Command::Ask { session, question } => {
            let reply: ChatReply = client
                .post(
                    "/v1/chat",
                    json!({ "session_id": session, "question": question }),
                )
                .await?;
            println!("{}\n", reply.answer.trim());
            if !reply.sources.is_empty() {
                println!("Sources:");
                for (idx, source) in reply.sources.iter().enumerate() {
                    let page = source
                        .page
                        .map(|p| format!(" (page {p})"))
                        .unwrap_or_default();
                    let section = source.section.as_deref().unwrap_or("general");
                    println!("[{}] {section}{page}: {}", idx + 1, source.text);
                }
            }
        }
    }
    Ok(())
}

async fn wait_ready(client: &ApiClient, session_id: &str, poll: PollConfig) -> Result<()> {
    println!("Waiting for embeddings...");
    let ready = poll_until_ready(
        move || async move {
            let status = client.status(session_id).await?;
            Ok::<_, anyhow::Error>(PolledStatus {
                status: status.status,
                error_message: status.error_message,
            })
        },
        poll,
    )
    .await
    .map_err(|err| anyhow!("{err}"))?;
    println!("Session {session_id} is {}.", ready.status);
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl ApiClient {
    fn new(base: &str, user_id: i64, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .user_agent("tenderlens-chat/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            user_id,
        })
    }

    async fn status(&self, session_id: &str) -> Result<StatusReply> {
        let response = self
            .http
            .get(format!("{}/v1/sessions/{session_id}", self.base))
            .send()
            .await
            .context("status request failed")?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .header("x-user-id", self.user_id)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.context("failed to read response")?;
    if !status.is_success() {
        match serde_json::from_str::<ErrorReply>(&body) {
            Ok(err) => bail!("{} ({}): {}", status, err.error, err.message),
            Err(_) => bail!("{status}: {body}"),
        }
    }
    serde_json::from_str(&body).with_context(|| format!("unexpected response body: {body}"))
}
