// Core types shared across the support network.
//
// Defines world-space geometry (`Vec3`, `Rotation`, `Transform`), the opaque
// integer handles collaborators hold (`StructureId`, `NodeId`, `TemplateId`),
// and `SupportKey`, the (structure, support point) pair a node registers.
// All types derive `Serialize` and `Deserialize` so templates, commands and
// config can be expressed as JSON data.
//
// Handles are plain counters issued by `SupportNetwork` and never reused
// within one network, so a stale handle resolves to "not found" instead of
// aliasing a newer entity.
//
// **Critical constraint: determinism.** Geometry is `f32` arithmetic in a
// fixed operation order. Handles are sequential, never random.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

// ---------------------------------------------------------------------------
// Spatial types
// ---------------------------------------------------------------------------

/// A position or offset in world (or structure-local) space.
///
/// Right-handed, Y up:
/// - X: east  (positive) / west  (negative)
/// - Y: up    (positive) / down  (negative)
/// - Z: south (positive) / north (negative)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const X: Self = Self::new(1.0, 0.0, 0.0);
    pub const Y: Self = Self::new(0.0, 1.0, 0.0);
    pub const Z: Self = Self::new(0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Squared Euclidean distance. Used for all nearest-node comparisons so
    /// no square root is taken on the hot path.
    pub fn distance_squared(self, other: Self) -> f32 {
        (self - other).length_squared()
    }

    pub fn distance(self, other: Self) -> f32 {
        self.distance_squared(other).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Component-wise minimum.
    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// Clamp each component into `[lo, hi]`.
    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        self.max(lo).min(hi)
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// A unit quaternion describing a structure's orientation.
///
/// Stored as `(w, x, y, z)`. Constructors always normalize, so `rotate()`
/// never has to. The fields are public and deserializable, so a value built
/// elsewhere may not be a unit quaternion; placement checks
/// `is_normalized()` and rejects anything else.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Rotation {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Rotation {
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Rotation of `radians` around `axis` (right-hand rule). A zero-length
    /// axis yields the identity.
    pub fn from_axis_angle(axis: Vec3, radians: f32) -> Self {
        let len = axis.length();
        if len == 0.0 || !len.is_finite() {
            return Self::IDENTITY;
        }
        let axis = axis * (1.0 / len);
        let (s, c) = (radians * 0.5).sin_cos();
        Self {
            w: c,
            x: axis.x * s,
            y: axis.y * s,
            z: axis.z * s,
        }
        .normalized()
    }

    /// Rotation around the vertical axis. Most placed pieces only yaw.
    pub fn from_yaw(radians: f32) -> Self {
        Self::from_axis_angle(Vec3::Y, radians)
    }

    fn normalized(self) -> Self {
        let n = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if n == 0.0 || !n.is_finite() {
            return Self::IDENTITY;
        }
        Self {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    pub fn inverse(self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn is_finite(self) -> bool {
        self.w.is_finite() && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Whether this is a unit quaternion, within float noise.
    pub fn is_normalized(self) -> bool {
        let n = self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z;
        (n - 1.0).abs() <= Self::NORM_TOLERANCE
    }

    const NORM_TOLERANCE: f32 = 1e-4;

    /// Rotate a vector: `v' = v + 2w(q × v) + 2(q × (q × v))`.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let q = Vec3::new(self.x, self.y, self.z);
        let t = q.cross(v) * 2.0;
        v + t * self.w + q.cross(t)
    }
}

/// World placement of a structure: rotate the local point, then translate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Rotation,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Rotation) -> Self {
        Self { position, rotation }
    }

    /// Map a structure-local point into world space.
    pub fn to_world(&self, local: Vec3) -> Vec3 {
        self.position + self.rotation.rotate(local)
    }

    /// Map a world point into structure-local space.
    pub fn to_local(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse().rotate(world - self.position)
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

handle!(/// Handle to a placed structure instance.
StructureId);
handle!(/// Handle to a support node (one aggregation point in world space).
NodeId);
handle!(/// Handle to an interned structure template.
TemplateId);

/// What a node registers: one support point of one structure.
///
/// Keyed per point rather than per structure because two points of the same
/// structure can resolve to the same node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SupportKey {
    pub structure: StructureId,
    pub point: usize,
}

impl SupportKey {
    pub const fn new(structure: StructureId, point: usize) -> Self {
        Self { structure, point }
    }
}

impl fmt::Display for SupportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.structure, self.point)
    }
}
