//! Encoding of job arguments and results.
//!
//! The queue treats payloads and results as opaque bytes; producers and
//! workers must agree on a [`Serializer`]. JSON is the default, MessagePack is
//! available behind the `msgpack` feature for smaller records.

use crate::{Result, job::JobPayload};
use serde_json::Value;
use std::{fmt::Debug, sync::Arc};

pub trait Serializer: Send + Sync + Debug {
    fn encode(&self, payload: &JobPayload) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<JobPayload>;

    fn encode_result(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode_result(&self, bytes: &[u8]) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, payload: &JobPayload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<JobPayload> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_result(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(feature = "msgpack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

#[cfg(feature = "msgpack")]
impl Serializer for MsgPackSerializer {
    fn encode(&self, payload: &JobPayload) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(payload)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<JobPayload> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn encode_result(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

pub fn default_serializer() -> Arc<dyn Serializer> {
    Arc::new(JsonSerializer)
}
