use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use ferroid_pubsub::{DeliveryOrder, RpcConfig};

/// How the in-memory broker orders each pulled batch.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reorder {
    /// Publish order.
    Fifo,
    /// Every batch reversed.
    Reversed,
    /// Every batch randomly permuted.
    Shuffled,
}

impl From<Reorder> for DeliveryOrder {
    fn from(value: Reorder) -> Self {
        match value {
            Reorder::Fifo => Self::Fifo,
            Reorder::Reversed => Self::Reversed,
            Reorder::Shuffled => Self::Shuffled,
        }
    }
}

/// Runtime configuration for the `ferroid-pubsub-echo` binary.
///
/// Every value can be passed as a CLI flag or through the environment
/// (including a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ferroid-pubsub-echo",
    version,
    about = "Runs an echo RPC client and server over an in-memory pub/sub broker"
)]
pub struct CliArgs {
    /// Project that scopes topic and subscription names.
    ///
    /// Environment variable: `PROJECT_ID`
    #[arg(long, env = "PROJECT_ID", default_value_t = String::from("local"))]
    pub project_id: String,

    /// Topic the client publishes requests to.
    ///
    /// Environment variable: `REQUEST_TOPIC`
    #[arg(long, env = "REQUEST_TOPIC", default_value_t = String::from("requests"))]
    pub request_topic: String,

    /// Topic the server publishes responses to.
    ///
    /// Environment variable: `RESPONSE_TOPIC`
    #[arg(long, env = "RESPONSE_TOPIC", default_value_t = String::from("responses"))]
    pub response_topic: String,

    /// Subscription shared by servers on the request topic.
    ///
    /// Environment variable: `SERVER_SUBSCRIPTION`
    #[arg(long, env = "SERVER_SUBSCRIPTION", default_value_t = String::from("echo-workers"))]
    pub server_subscription: String,

    /// Number of single-result requests to send.
    ///
    /// Environment variable: `NUM_REQUESTS`
    #[arg(long, env = "NUM_REQUESTS", default_value_t = 10)]
    pub requests: usize,

    /// Number of pieces the server splits the payload into when streaming.
    ///
    /// Environment variable: `STREAM_CHUNKS`
    #[arg(long, env = "STREAM_CHUNKS", default_value_t = 4)]
    pub stream_chunks: usize,

    /// Payload sent with every request.
    ///
    /// Environment variable: `PAYLOAD`
    #[arg(long, env = "PAYLOAD", default_value_t = String::from("ping"))]
    pub payload: String,

    /// Delivery order of the in-memory broker.
    ///
    /// Environment variable: `REORDER`
    #[arg(long, env = "REORDER", value_enum, default_value_t = Reorder::Shuffled)]
    pub reorder: Reorder,

    /// Maximum number of messages each endpoint processes concurrently.
    ///
    /// Environment variable: `CONCURRENCY_LIMIT`
    #[arg(long, env = "CONCURRENCY_LIMIT", default_value_t = 100)]
    pub concurrency_limit: usize,

    /// Target period of the consumer poll loop, in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// Longest time a response waits before being published, in
    /// milliseconds.
    ///
    /// Environment variable: `PUBLISH_MAX_WAIT_MS`
    #[arg(long, env = "PUBLISH_MAX_WAIT_MS", default_value_t = 100)]
    pub publish_max_wait_ms: u64,

    /// Wait for a single result, and per stream item, in milliseconds.
    ///
    /// Environment variable: `TIMEOUT_MS`
    #[arg(long, env = "TIMEOUT_MS", default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// How long shutdown waits for in-flight handlers, in milliseconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value_t = 3_000)]
    pub shutdown_timeout_ms: u64,
}

/// Fully qualified names are derived by the endpoints from these.
#[derive(Debug, Clone)]
pub struct Topics {
    pub request: String,
    pub response: String,
    pub server_subscription: String,
}

#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub rpc: RpcConfig,
    pub project_id: String,
    pub topics: Topics,
    pub requests: usize,
    pub stream_chunks: usize,
    pub payload: String,
    pub reorder: DeliveryOrder,
}

impl TryFrom<CliArgs> for EchoConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.project_id.is_empty() {
            bail!("PROJECT_ID must not be empty");
        }

        if args.request_topic == args.response_topic {
            bail!(
                "REQUEST_TOPIC and RESPONSE_TOPIC must differ (both are {:?})",
                args.request_topic
            );
        }

        if args.stream_chunks == 0 {
            bail!("STREAM_CHUNKS must be greater than 0");
        }

        if args.payload.is_empty() {
            bail!("PAYLOAD must not be empty");
        }

        let rpc = RpcConfig {
            concurrency_limit: args.concurrency_limit,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            publish_max_wait: Duration::from_millis(args.publish_max_wait_ms),
            default_timeout: Duration::from_millis(args.timeout_ms),
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
            ..RpcConfig::default()
        };
        rpc.validate()?;

        Ok(Self {
            rpc,
            project_id: args.project_id,
            topics: Topics {
                request: args.request_topic,
                response: args.response_topic,
                server_subscription: args.server_subscription,
            },
            requests: args.requests,
            stream_chunks: args.stream_chunks,
            payload: args.payload,
            reorder: args.reorder.into(),
        })
    }
}
