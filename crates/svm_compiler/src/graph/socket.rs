//! Socket types, constant values and link endpoints.
use std::hash::{Hash, Hasher};

use glam::Vec3;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::graph::variant::VariantSet;
use crate::graph::NodeId;

/// Data type carried by a socket.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketType {
    Float,
    Int,
    Color,
    Vector,
    Normal,
    Point,
    Closure,
}

impl SocketType {
    /// Number of stack cells a value of this type occupies. Closures live outside the stack.
    pub fn stack_size(self) -> usize {
        match self {
            SocketType::Float | SocketType::Int => 1,
            SocketType::Color | SocketType::Vector | SocketType::Normal | SocketType::Point => 3,
            SocketType::Closure => 0,
        }
    }

    /// Whether a link from `self` into an input of type `other` is representable.
    ///
    /// Scalars link to scalars and the vector-like types link to each other; closures only
    /// link to closures.
    pub fn links_to(self, other: SocketType) -> bool {
        self.stack_size() == other.stack_size()
    }
}

/// Constant held by an unlinked input.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum SocketValue {
    #[default]
    None,
    Float(f32),
    Int(i32),
    Vector(Vec3),
}

impl SocketValue {
    pub fn as_float(&self) -> f32 {
        match *self {
            SocketValue::Float(v) => v,
            SocketValue::Int(v) => v as f32,
            SocketValue::Vector(v) => v.x,
            SocketValue::None => 0.0,
        }
    }

    pub fn as_vec3(&self) -> Vec3 {
        match *self {
            SocketValue::Vector(v) => v,
            SocketValue::Float(v) => Vec3::splat(v),
            SocketValue::Int(v) => Vec3::splat(v as f32),
            SocketValue::None => Vec3::ZERO,
        }
    }

    /// Whether this constant can be stored in an input of type `ty`.
    pub fn fits(&self, ty: SocketType) -> bool {
        match self {
            SocketValue::None => true,
            SocketValue::Float(_) | SocketValue::Int(_) => ty.stack_size() == 1,
            SocketValue::Vector(_) => ty.stack_size() == 3,
        }
    }

    pub(crate) fn hash_bits<H: Hasher>(&self, state: &mut H) {
        match *self {
            SocketValue::None => 0u8.hash(state),
            SocketValue::Float(v) => {
                1u8.hash(state);
                v.to_bits().hash(state);
            }
            SocketValue::Int(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            SocketValue::Vector(v) => {
                3u8.hash(state);
                v.x.to_bits().hash(state);
                v.y.to_bits().hash(state);
                v.z.to_bits().hash(state);
            }
        }
    }
}

/// Producer end of a link: output `socket` of `node`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub node: NodeId,
    pub socket: usize,
}

/// Consumer end of a link: input `socket` of `node`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputRef {
    pub node: NodeId,
    pub socket: usize,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderInput {
    pub name: String,
    pub ty: SocketType,
    /// Constant used when the input is unlinked or skipped.
    pub value: SocketValue,
    pub link: Option<OutputRef>,
    /// Variants in which this input behaves as unlinked.
    #[cfg_attr(feature = "serde", serde(default))]
    pub skip: VariantSet,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderOutput {
    pub name: String,
    pub ty: SocketType,
    /// Every input currently fed by this output.
    pub links: Vec<InputRef>,
}
