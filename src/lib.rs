//! Relays Kubernetes events to a Kafka topic.
//!
//! The cluster retains `Event` objects only briefly; this crate watches
//! them, optionally filters and reshapes them, and publishes the result as
//! durable, keyed Kafka records. Three stages connected by fixed-capacity
//! ring buffers: [`watcher::Watcher`] ingests from the apiserver,
//! [`processor::Processor`] filters and shapes payloads,
//! [`exporter::Exporter`] publishes. [`manager::Manager`] wires the stages
//! together and stops everything on the first fatal failure.

pub mod buffer;
pub mod config;
pub mod event;
pub mod exporter;
pub mod filter;
pub mod manager;
pub mod payload;
pub mod processor;
pub mod template;
pub mod watcher;
