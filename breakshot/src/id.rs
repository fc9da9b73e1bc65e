// Copyright 2020 Joyent, Inc.

//! Compound identifiers for instances, applications, nodes, resources and
//! tasks.
//!
//! Every identifier is a fixed-order tuple of UUID components drawn from the
//! same four fields: instance, application, resource and task. A `NodeId` is
//! exactly (instance, application) and a `TaskId` is exactly (instance,
//! application, resource, task). Identifiers serialize to a canonical byte
//! form:
//!
//! | prefix | ordinal | uuid (16 bytes) | ordinal | uuid (16 bytes) | ... |
//! |--------|---------|-----------------|---------|-----------------|-----|
//! | `0x01` | `0x00`  | instance        | `0x01`  | application     | ... |
//!
//! and to an encoded string, which is the URL-safe unpadded base64 of those
//! bytes. Equality and hashing only consider the declared components, so an
//! identifier compares equal no matter whether it was parsed from bytes, from
//! a string or put together with an [`IdBuilder`].

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use crate::error::Error;

const PREFIX_BYTE: u8 = 1;
const COMPONENT_LEN: usize = 17;
const FIELD_COUNT: usize = 4;

/// The fields that may appear in a compound identifier, in canonical order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Field {
    Instance = 0,
    Application = 1,
    Resource = 2,
    Task = 3,
}

impl Field {
    fn from_ordinal(ordinal: u8) -> Option<Field> {
        match ordinal {
            0 => Some(Field::Instance),
            1 => Some(Field::Application),
            2 => Some(Field::Resource),
            3 => Some(Field::Task),
            _ => None,
        }
    }
}

type Components = [Option<Uuid>; FIELD_COUNT];

/// Behavior common to all compound identifiers.
pub trait CompoundId: Sized {
    /// The fields making up this identifier, in canonical order.
    const FIELDS: &'static [Field];

    #[doc(hidden)]
    fn from_uuids(uuids: &[Uuid]) -> Self;

    /// The UUID components of this identifier, in the order of `FIELDS`.
    fn uuids(&self) -> &[Uuid];

    /// The canonical byte form, computed once.
    fn canonical_bytes(&self) -> &[u8];

    /// Build an identifier from a full component table. Exactly the declared
    /// fields must be present.
    fn from_components(components: &Components) -> Result<Self, Error> {
        let mut uuids = Vec::with_capacity(Self::FIELDS.len());
        for (ordinal, component) in components.iter().enumerate() {
            let declared = Self::FIELDS.iter().any(|f| *f as usize == ordinal);
            match (declared, component) {
                (true, Some(uuid)) => uuids.push(*uuid),
                (true, None) => {
                    return Err(Error::InvalidId(format!(
                        "missing component {:?}",
                        Field::from_ordinal(ordinal as u8)
                    )));
                }
                (false, Some(_)) => {
                    return Err(Error::InvalidId(format!(
                        "unexpected component {:?}",
                        Field::from_ordinal(ordinal as u8)
                    )));
                }
                (false, None) => (),
            }
        }
        Ok(Self::from_uuids(&uuids))
    }

    /// Parse an identifier from its canonical bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_components(&decode_components(bytes)?)
    }

    /// Parse an identifier from its encoded string.
    fn from_encoded(encoded: &str) -> Result<Self, Error> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::InvalidId(format!("{}: {}", encoded, e)))?;
        Self::from_bytes(&bytes)
    }
}

fn decode_components(bytes: &[u8]) -> Result<Components, Error> {
    let mut components: Components = [None; FIELD_COUNT];

    match bytes.first() {
        None => return Err(Error::InvalidId("empty identifier".into())),
        Some(&PREFIX_BYTE) => (),
        Some(other) => {
            return Err(Error::InvalidId(format!(
                "invalid prefix byte {}",
                other
            )));
        }
    }

    let body = &bytes[1..];
    if body.len() % COMPONENT_LEN != 0 {
        return Err(Error::InvalidId(format!(
            "truncated identifier ({} bytes)",
            bytes.len()
        )));
    }

    for chunk in body.chunks(COMPONENT_LEN) {
        let field = Field::from_ordinal(chunk[0]).ok_or_else(|| {
            Error::InvalidId(format!("invalid field ordinal {}", chunk[0]))
        })?;
        let slot = &mut components[field as usize];
        if slot.is_some() {
            return Err(Error::InvalidId(format!(
                "duplicate component {:?}",
                field
            )));
        }
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&chunk[1..]);
        *slot = Some(Uuid::from_bytes(raw));
    }

    Ok(components)
}

fn encode(fields: &[Field], uuids: &[Uuid]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + fields.len() * COMPONENT_LEN);
    bytes.push(PREFIX_BYTE);
    for (field, uuid) in fields.iter().zip(uuids) {
        bytes.push(*field as u8);
        bytes.extend_from_slice(uuid.as_bytes());
    }
    bytes
}

/// Lazily computed representations of an identifier. Ignored by equality
/// and ordering.
#[derive(Clone, Default)]
struct Cached {
    bytes: OnceLock<Vec<u8>>,
    encoded: OnceLock<String>,
    hash: OnceLock<u64>,
}

macro_rules! compound_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, [$($field:ident),+]) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            uuids: [Uuid; $len],
            cached: Cached,
        }

        impl CompoundId for $name {
            const FIELDS: &'static [Field] = &[$(Field::$field),+];

            fn from_uuids(uuids: &[Uuid]) -> Self {
                let mut array = [Uuid::nil(); $len];
                array.copy_from_slice(uuids);
                $name {
                    uuids: array,
                    cached: Cached::default(),
                }
            }

            fn uuids(&self) -> &[Uuid] {
                &self.uuids
            }

            fn canonical_bytes(&self) -> &[u8] {
                self.as_bytes()
            }
        }

        impl $name {
            /// The canonical byte form of this identifier.
            pub fn as_bytes(&self) -> &[u8] {
                self.cached
                    .bytes
                    .get_or_init(|| encode(Self::FIELDS, &self.uuids))
            }

            /// The encoded string form of this identifier.
            pub fn as_encoded(&self) -> &str {
                self.cached
                    .encoded
                    .get_or_init(|| URL_SAFE_NO_PAD.encode(self.as_bytes()))
            }

            fn hash_value(&self) -> u64 {
                *self.cached.hash.get_or_init(|| {
                    let mut hasher = DefaultHasher::new();
                    self.uuids.hash(&mut hasher);
                    hasher.finish()
                })
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &$name) -> bool {
                self.uuids == other.uuids
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_u64(self.hash_value());
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &$name) -> Ordering {
                self.uuids.cmp(&other.uuids)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &$name) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_encoded())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.uuids).finish()
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_encoded(s)
            }
        }
    };
}

compound_id!(
    /// Identifies one running process participating in the cluster.
    InstanceId,
    1,
    [Instance]
);

compound_id!(
    /// Identifies an application independently of the instances hosting it.
    ApplicationId,
    1,
    [Application]
);

compound_id!(
    /// Identifies a node: one application hosted by one instance.
    NodeId,
    2,
    [Instance, Application]
);

compound_id!(
    /// Identifies a resource living on a node.
    ResourceId,
    3,
    [Instance, Application, Resource]
);

compound_id!(
    /// Identifies a task running against a resource.
    TaskId,
    4,
    [Instance, Application, Resource, Task]
);

impl InstanceId {
    pub fn new_random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_uuids(&[uuid])
    }

    pub fn uuid(&self) -> Uuid {
        self.uuids[0]
    }
}

impl ApplicationId {
    pub fn new_random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_uuids(&[uuid])
    }

    pub fn uuid(&self) -> Uuid {
        self.uuids[0]
    }
}

impl NodeId {
    pub fn new(instance: &InstanceId, application: &ApplicationId) -> Self {
        Self::from_uuids(&[instance.uuid(), application.uuid()])
    }

    /// The node that represents the instance itself rather than any hosted
    /// application.
    pub fn master(instance: &InstanceId) -> Self {
        Self::from_uuids(&[instance.uuid(), Uuid::nil()])
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId::from_uuid(self.uuids[0])
    }

    pub fn application_id(&self) -> ApplicationId {
        ApplicationId::from_uuid(self.uuids[1])
    }

    pub fn is_master(&self) -> bool {
        self.uuids[1].is_nil()
    }
}

impl ResourceId {
    pub fn new(node: &NodeId, resource: Uuid) -> Self {
        Self::from_uuids(&[node.uuids[0], node.uuids[1], resource])
    }

    pub fn new_random(node: &NodeId) -> Self {
        Self::new(node, Uuid::new_v4())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_uuids(&self.uuids[..2])
    }
}

impl TaskId {
    pub fn new(resource: &ResourceId, task: Uuid) -> Self {
        let u = &resource.uuids;
        Self::from_uuids(&[u[0], u[1], u[2], task])
    }

    pub fn new_random(resource: &ResourceId) -> Self {
        Self::new(resource, Uuid::new_v4())
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::from_uuids(&self.uuids[..3])
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_uuids(&self.uuids[..2])
    }
}

/// Assembles any compound identifier field by field.
#[derive(Clone, Debug, Default)]
pub struct IdBuilder {
    components: Components,
}

impl IdBuilder {
    pub fn new() -> Self {
        IdBuilder::default()
    }

    pub fn with(mut self, field: Field, uuid: Uuid) -> Self {
        self.components[field as usize] = Some(uuid);
        self
    }

    pub fn without(mut self, field: Field) -> Self {
        self.components[field as usize] = None;
        self
    }

    /// Start from the components of an existing identifier.
    pub fn from_id<T: CompoundId>(id: &T) -> Self {
        T::FIELDS
            .iter()
            .zip(id.uuids())
            .fold(IdBuilder::new(), |b, (f, u)| b.with(*f, *u))
    }

    pub fn build<T: CompoundId>(&self) -> Result<T, Error> {
        T::from_components(&self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn node_id_equal_across_constructions() {
        let instance = InstanceId::new_random();
        let application = ApplicationId::new_random();

        let direct = NodeId::new(&instance, &application);
        let from_bytes = NodeId::from_bytes(direct.as_bytes()).unwrap();
        let from_string: NodeId = direct.as_encoded().parse().unwrap();
        let built: NodeId = IdBuilder::new()
            .with(Field::Application, application.uuid())
            .with(Field::Instance, instance.uuid())
            .build()
            .unwrap();

        assert_eq!(direct, from_bytes);
        assert_eq!(direct, from_string);
        assert_eq!(direct, built);

        let set: HashSet<NodeId> =
            vec![direct, from_bytes, from_string, built].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn canonical_layout() {
        let instance = InstanceId::new_random();
        let node = NodeId::master(&instance);
        let bytes = node.as_bytes();

        assert_eq!(bytes.len(), 1 + 2 * COMPONENT_LEN);
        assert_eq!(bytes[0], PREFIX_BYTE);
        assert_eq!(bytes[1], Field::Instance as u8);
        assert_eq!(&bytes[2..18], instance.uuid().as_bytes());
        assert_eq!(bytes[18], Field::Application as u8);
        assert!(node.is_master());
    }

    #[test]
    fn prefix_subsets() {
        let node = NodeId::new(
            &InstanceId::new_random(),
            &ApplicationId::new_random(),
        );
        let resource = ResourceId::new_random(&node);
        let task = TaskId::new_random(&resource);

        assert_eq!(task.resource_id(), resource);
        assert_eq!(task.node_id(), node);
        assert_eq!(resource.node_id(), node);
        assert_eq!(node.instance_id().uuid(), task.uuids()[0]);
    }

    #[test]
    fn rejects_mismatched_components() {
        let node = NodeId::new(
            &InstanceId::new_random(),
            &ApplicationId::new_random(),
        );
        let task = TaskId::new_random(&ResourceId::new_random(&node));

        assert!(NodeId::from_bytes(task.as_bytes()).is_err());
        assert!(TaskId::from_bytes(node.as_bytes()).is_err());
        assert!(InstanceId::from_bytes(&[]).is_err());
        assert!(InstanceId::from_bytes(&[2]).is_err());
        assert!(NodeId::from_bytes(&node.as_bytes()[..20]).is_err());
        assert!("not-an-id".parse::<NodeId>().is_err());

        let narrowed: NodeId = IdBuilder::from_id(&task)
            .without(Field::Resource)
            .without(Field::Task)
            .build()
            .unwrap();
        assert_eq!(narrowed, node);
    }

    #[test]
    fn duplicate_components_rejected() {
        let instance = InstanceId::new_random();
        let mut bytes = instance.as_bytes().to_vec();
        bytes.extend_from_slice(&instance.as_bytes()[1..]);
        assert!(InstanceId::from_bytes(&bytes).is_err());
    }
}
