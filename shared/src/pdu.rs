//! DIS Entity State PDU (IEEE 1278.1, protocol version 6).
//!
//! Only the fields the relay needs to produce and summarise are modelled.
//! Everything is big-endian on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 6;
pub const PDU_TYPE_ENTITY_STATE: u8 = 1;
pub const PROTOCOL_FAMILY_ENTITY_INFORMATION: u8 = 1;

/// Size of the common PDU header
pub const HEADER_LEN: usize = 12;
/// Byte offset of the 16-bit length field inside the header
pub const LENGTH_OFFSET: usize = 8;
/// Entity State PDU length without articulation parameters
pub const ENTITY_STATE_LEN: usize = 144;
pub const ARTICULATION_PARAMETER_LEN: usize = 16;
/// The record count is a single byte on the wire
pub const MAX_ARTICULATION_PARAMETERS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated PDU: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unsupported PDU type {0}")]
    UnsupportedPduType(u8),

    #[error("bad PDU length field {0}")]
    BadLength(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{0} articulation parameters, at most 255 fit in one PDU")]
    TooManyArticulationParameters(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityId {
    pub site: u16,
    pub application: u16,
    pub entity: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityType {
    pub kind: u8,
    pub domain: u8,
    pub country: u16,
    pub category: u8,
    pub subcategory: u8,
    pub specific: u8,
    pub extra: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3F32 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3F64 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Orientation {
    pub psi: f32,
    pub theta: f32,
    pub phi: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeadReckoning {
    pub algorithm: u8,
    pub other_parameters: [u8; 15],
    pub linear_acceleration: Vector3F32,
    pub angular_velocity: Vector3F32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marking {
    pub character_set: u8,
    pub characters: [u8; 11],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStatePdu {
    pub exercise_id: u8,
    pub timestamp: u32,
    pub entity_id: EntityId,
    pub force_id: u8,
    pub entity_type: EntityType,
    pub alternative_entity_type: EntityType,
    pub linear_velocity: Vector3F32,
    pub location: Vector3F64,
    pub orientation: Orientation,
    pub appearance: u32,
    pub dead_reckoning: DeadReckoning,
    pub marking: Marking,
    pub capabilities: u32,
    /// Raw 16-byte articulation records, carried through untouched
    pub articulation_parameters: Vec<[u8; ARTICULATION_PARAMETER_LEN]>,
}

impl EntityStatePdu {
    /// The PDU produced by the operator "send" action.
    pub fn sample(timestamp: u32) -> Self {
        Self {
            exercise_id: 1,
            timestamp,
            entity_id: EntityId {
                site: 1,
                application: 1,
                entity: 2,
            },
            location: Vector3F64 {
                x: 1.0,
                y: 1.0,
                z: 1.0,
            },
            ..Self::default()
        }
    }

    pub fn encoded_len(&self) -> usize {
        ENTITY_STATE_LEN + self.articulation_parameters.len() * ARTICULATION_PARAMETER_LEN
    }

    pub fn marshal(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.marshal_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Nothing is written when the PDU cannot be encoded.
    pub fn marshal_into(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let count = self.articulation_parameters.len();
        let articulation_count = u8::try_from(count)
            .map_err(|_| EncodeError::TooManyArticulationParameters(count))?;
        // 144 + 255 * 16 always fits the length field
        let length = self.encoded_len() as u16;

        buf.reserve(self.encoded_len());

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.exercise_id);
        buf.put_u8(PDU_TYPE_ENTITY_STATE);
        buf.put_u8(PROTOCOL_FAMILY_ENTITY_INFORMATION);
        buf.put_u32(self.timestamp);
        buf.put_u16(length);
        buf.put_u16(0);

        buf.put_u16(self.entity_id.site);
        buf.put_u16(self.entity_id.application);
        buf.put_u16(self.entity_id.entity);
        buf.put_u8(self.force_id);
        buf.put_u8(articulation_count);
        put_entity_type(buf, &self.entity_type);
        put_entity_type(buf, &self.alternative_entity_type);
        put_vec3f32(buf, &self.linear_velocity);
        buf.put_f64(self.location.x);
        buf.put_f64(self.location.y);
        buf.put_f64(self.location.z);
        buf.put_f32(self.orientation.psi);
        buf.put_f32(self.orientation.theta);
        buf.put_f32(self.orientation.phi);
        buf.put_u32(self.appearance);

        buf.put_u8(self.dead_reckoning.algorithm);
        buf.put_slice(&self.dead_reckoning.other_parameters);
        put_vec3f32(buf, &self.dead_reckoning.linear_acceleration);
        put_vec3f32(buf, &self.dead_reckoning.angular_velocity);

        buf.put_u8(self.marking.character_set);
        buf.put_slice(&self.marking.characters);
        buf.put_u32(self.capabilities);

        for parameter in &self.articulation_parameters {
            buf.put_slice(parameter);
        }
        Ok(())
    }

    /// Decode one complete PDU. Trailing bytes past the declared length are ignored.
    pub fn unmarshal(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let pdu_type = data[2];
        if pdu_type != PDU_TYPE_ENTITY_STATE {
            return Err(DecodeError::UnsupportedPduType(pdu_type));
        }

        let declared = u16::from_be_bytes([data[LENGTH_OFFSET], data[LENGTH_OFFSET + 1]]);
        let declared_len = usize::from(declared);
        if declared_len < ENTITY_STATE_LEN
            || (declared_len - ENTITY_STATE_LEN) % ARTICULATION_PARAMETER_LEN != 0
        {
            return Err(DecodeError::BadLength(declared));
        }
        if data.len() < declared_len {
            return Err(DecodeError::Truncated {
                expected: declared_len,
                actual: data.len(),
            });
        }

        let mut buf = &data[..declared_len];
        buf.advance(1); // protocol version
        let exercise_id = buf.get_u8();
        buf.advance(2); // type, family
        let timestamp = buf.get_u32();
        buf.advance(4); // length, padding

        let entity_id = EntityId {
            site: buf.get_u16(),
            application: buf.get_u16(),
            entity: buf.get_u16(),
        };
        let force_id = buf.get_u8();
        let articulation_count = usize::from(buf.get_u8());
        if ENTITY_STATE_LEN + articulation_count * ARTICULATION_PARAMETER_LEN != declared_len {
            return Err(DecodeError::BadLength(declared));
        }

        let entity_type = get_entity_type(&mut buf);
        let alternative_entity_type = get_entity_type(&mut buf);
        let linear_velocity = get_vec3f32(&mut buf);
        let location = Vector3F64 {
            x: buf.get_f64(),
            y: buf.get_f64(),
            z: buf.get_f64(),
        };
        let orientation = Orientation {
            psi: buf.get_f32(),
            theta: buf.get_f32(),
            phi: buf.get_f32(),
        };
        let appearance = buf.get_u32();

        let algorithm = buf.get_u8();
        let mut other_parameters = [0u8; 15];
        buf.copy_to_slice(&mut other_parameters);
        let dead_reckoning = DeadReckoning {
            algorithm,
            other_parameters,
            linear_acceleration: get_vec3f32(&mut buf),
            angular_velocity: get_vec3f32(&mut buf),
        };

        let character_set = buf.get_u8();
        let mut characters = [0u8; 11];
        buf.copy_to_slice(&mut characters);
        let capabilities = buf.get_u32();

        let articulation_parameters = (0..articulation_count)
            .map(|_| {
                let mut record = [0u8; ARTICULATION_PARAMETER_LEN];
                buf.copy_to_slice(&mut record);
                record
            })
            .collect();

        Ok(Self {
            exercise_id,
            timestamp,
            entity_id,
            force_id,
            entity_type,
            alternative_entity_type,
            linear_velocity,
            location,
            orientation,
            appearance,
            dead_reckoning,
            marking: Marking {
                character_set,
                characters,
            },
            capabilities,
            articulation_parameters,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "Entity State - Entity Category: {}, Location: ({}, {}, {})",
            self.entity_type.category, self.location.x, self.location.y, self.location.z
        )
    }
}

fn put_entity_type(buf: &mut BytesMut, t: &EntityType) {
    buf.put_u8(t.kind);
    buf.put_u8(t.domain);
    buf.put_u16(t.country);
    buf.put_u8(t.category);
    buf.put_u8(t.subcategory);
    buf.put_u8(t.specific);
    buf.put_u8(t.extra);
}

fn get_entity_type(buf: &mut &[u8]) -> EntityType {
    EntityType {
        kind: buf.get_u8(),
        domain: buf.get_u8(),
        country: buf.get_u16(),
        category: buf.get_u8(),
        subcategory: buf.get_u8(),
        specific: buf.get_u8(),
        extra: buf.get_u8(),
    }
}

fn put_vec3f32(buf: &mut BytesMut, v: &Vector3F32) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
    buf.put_f32(v.z);
}

fn get_vec3f32(buf: &mut &[u8]) -> Vector3F32 {
    Vector3F32 {
        x: buf.get_f32(),
        y: buf.get_f32(),
        z: buf.get_f32(),
    }
}
