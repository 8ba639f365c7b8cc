//! Shared type ↔ kind-ID table.
//!
//! Both ends of a connection must build their registries from identically
//! ordered lists: the fixed core control kinds first, then the caller's
//! domain kinds. There is no type-name negotiation on the wire — a mismatch
//! surfaces as a decode error on the receiving side, never as a crash.
//!
//! Dispatch is an explicit strategy table: each registered type contributes a
//! monomorphized decode function erased behind a common signature.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::protocol::{LogLevel, WorkRequest};

/// Anything that can travel over the channel once registered.
pub trait Message: Serialize + DeserializeOwned + Send + fmt::Debug + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + fmt::Debug + 'static {}

/// Registry and framing failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message type {0} is not registered")]
    UnregisteredType(&'static str),
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("failed to decode {type_name} (kind {kind}): {source}")]
    Decode {
        kind: u32,
        type_name: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        source: serde_json::Error,
    },
}

/// A decoded inbound message, typed by its registry kind.
pub struct Inbound {
    kind: u32,
    type_name: &'static str,
    payload: Box<dyn Any + Send>,
}

impl Inbound {
    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.payload.is::<T>()
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Take the payload as `T`, or get `self` back unchanged.
    pub fn into_message<T: 'static>(self) -> Result<T, Inbound> {
        match self.payload.downcast::<T>() {
            Ok(message) => Ok(*message),
            Err(payload) => Err(Inbound {
                kind: self.kind,
                type_name: self.type_name,
                payload,
            }),
        }
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish()
    }
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>, serde_json::Error>;
type RequestLevelFn = fn(&Inbound) -> Option<LogLevel>;

struct MessageVtable {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
    request_level: Option<RequestLevelFn>,
}

fn decode_as<T: Message>(payload: &[u8]) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    serde_json::from_slice::<T>(payload).map(|message| Box::new(message) as Box<dyn Any + Send>)
}

fn level_of<T: WorkRequest + 'static>(inbound: &Inbound) -> Option<LogLevel> {
    inbound.get::<T>().map(|request| request.parameters().log_level)
}

/// Ordered, append-only type table. Kind IDs are assigned sequentially in
/// registration order and never reused.
pub struct MessageRegistry {
    kinds: Vec<MessageVtable>,
    by_type: HashMap<TypeId, u32>,
}

impl MessageRegistry {
    /// Empty registry. Most callers want [`MessageRegistry::with_core`] (or
    /// [`crate::bridge::protocol::standard_registry`]) instead.
    pub fn new() -> Self {
        Self {
            kinds: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Registry with the four control kinds in their reserved slots.
    pub fn with_core() -> Self {
        use super::protocol::{AboutToStop, LogEntry, Parameters, Stop};

        let mut registry = Self::new();
        registry.register_request::<Parameters>();
        registry.register::<LogEntry>();
        registry.register::<AboutToStop>();
        registry.register::<Stop>();
        registry
    }

    /// Append a message type; returns its kind ID. Registering the same type
    /// twice is a no-op returning the existing ID.
    pub fn register<T: Message>(&mut self) -> u32 {
        self.insert::<T>(None)
    }

    /// Append a work-request type, recording how to read the embedded
    /// log-level parameter.
    pub fn register_request<T: Message + WorkRequest>(&mut self) -> u32 {
        self.insert::<T>(Some(level_of::<T>))
    }

    fn insert<T: Message>(&mut self, request_level: Option<RequestLevelFn>) -> u32 {
        let type_id = TypeId::of::<T>();
        if let Some(kind) = self.by_type.get(&type_id) {
            return *kind;
        }
        let kind = self.kinds.len() as u32;
        self.kinds.push(MessageVtable {
            type_id,
            type_name: std::any::type_name::<T>(),
            decode: decode_as::<T>,
            request_level,
        });
        self.by_type.insert(type_id, kind);
        kind
    }

    pub fn kind_of<T: 'static>(&self) -> Option<u32> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn type_name(&self, kind: u32) -> Option<&'static str> {
        self.kinds.get(kind as usize).map(|vt| vt.type_name)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Decode a frame payload into the type registered for `kind`.
    pub fn decode(&self, kind: u32, payload: &[u8]) -> Result<Inbound, ProtocolError> {
        let vtable = self
            .kinds
            .get(kind as usize)
            .ok_or(ProtocolError::UnknownKind(kind))?;
        let message = (vtable.decode)(payload).map_err(|source| ProtocolError::Decode {
            kind,
            type_name: vtable.type_name,
            source,
        })?;
        Ok(Inbound {
            kind,
            type_name: vtable.type_name,
            payload: message,
        })
    }

    /// The embedded log-level parameter of an inbound work request, if its
    /// type was registered with one.
    pub fn request_level(&self, inbound: &Inbound) -> Option<LogLevel> {
        self.kinds
            .get(inbound.kind as usize)
            .and_then(|vt| vt.request_level)
            .and_then(|extract| extract(inbound))
    }

    #[cfg(test)]
    fn type_id_of_kind(&self, kind: u32) -> Option<TypeId> {
        self.kinds.get(kind as usize).map(|vt| vt.type_id)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::with_core()
    }
}
