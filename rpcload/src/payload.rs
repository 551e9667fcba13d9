//! Request payloads.
//!
//! Payload text is resolved against the method's input message and encoded
//! once before the run, so the hot loop only clones shared buffers. JSON
//! arrays sent to unary or server-streaming methods become a table of one
//! message per element.

use core::str::{self, Utf8Error};
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use prost_reflect::DynamicMessage;
use serde_json::Value;
use thiserror::Error;

use crate::descriptor::MethodDescriptor;

#[derive(Debug, Error)]
pub enum Error {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload array element {0} is not an object")]
    NotAnObject(usize),
    #[error("payload array is empty")]
    EmptyArray,
    #[error("invalid binary payload: {0}")]
    Binary(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Messages sent with every call.
    ///
    /// More than one only for client-streaming methods given an array.
    Fixed(Arc<[Bytes]>),
    /// One message per element of the original array, picked round-robin.
    Table(Arc<[Bytes]>),
}

impl Payload {
    /// Prepares the payload for the given method.
    ///
    /// Every message the payload can produce is validated against the input
    /// message descriptor. An empty payload is the default message.
    pub fn new(data: &[u8], binary: bool, method: &MethodDescriptor) -> Result<Self, Error> {
        if binary {
            DynamicMessage::decode(method.input(), data)?;
            return Ok(Self::Fixed([Bytes::copy_from_slice(data)].into()));
        }

        let text = str::from_utf8(data)?.trim();
        if text.is_empty() {
            let msg = DynamicMessage::new(method.input()).encode_to_vec();
            return Ok(Self::Fixed([Bytes::from(msg)].into()));
        }

        if !text.starts_with('[') {
            let msg = encode(method, &serde_json::from_str(text)?)?;
            return Ok(Self::Fixed([msg].into()));
        }

        let items: Vec<Value> = serde_json::from_str(text)?;
        if items.is_empty() {
            return Err(Error::EmptyArray);
        }

        let mut messages = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            if !item.is_object() {
                return Err(Error::NotAnObject(idx));
            }
            messages.push(encode(method, item)?);
        }

        if method.is_client_streaming() {
            return Ok(Self::Fixed(messages.into()));
        }

        log::debug!("split payload array into {} messages", messages.len());

        Ok(Self::Table(messages.into()))
    }

    /// Returns the encoded request messages for the call with the given
    /// counter value.
    pub fn messages(&self, k: u64) -> Vec<Bytes> {
        match self {
            Self::Fixed(messages) => messages.to_vec(),
            Self::Table(table) if table.is_empty() => Vec::new(),
            Self::Table(table) => {
                let idx = (k % table.len() as u64) as usize;
                vec![table[idx].clone()]
            }
        }
    }
}

fn encode(method: &MethodDescriptor, v: &Value) -> Result<Bytes, Error> {
    let msg = DynamicMessage::deserialize(method.input(), v)?;

    Ok(msg.encode_to_vec().into())
}
