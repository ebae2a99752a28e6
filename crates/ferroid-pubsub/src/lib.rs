#![doc = include_str!("../README.md")]

pub mod broker;
pub mod cache;
mod common;
pub mod config;
pub mod rpc;
pub mod stream;
pub mod worker;

pub use broker::{
    Broker, DeliveryOrder, Filter, InMemoryBroker, RetryPolicy, RetryingBroker,
    SubscriptionConfig,
};
pub use common::*;
pub use config::RpcConfig;
pub use rpc::{Endpoint, Processor, RpcClient, RpcServer, subscription_path, topic_path};
pub use stream::{OrderedStream, StreamWriter, ordered_stream};
// Public re-export so downstream crates can access `ferroid` via
// `ferroid_pubsub::ferroid`
pub use ferroid;
