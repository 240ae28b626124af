//! Fixed-size geometric value types
//!
//! These are passed by value in a single slot and must match the engine's
//! memory layout exactly (single-precision build).

use bytemuck::{Pod, Zeroable};

/// 2D float vector
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vector2 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
}

/// 2D integer vector
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Vector2i {
    /// X component
    pub x: i32,
    /// Y component
    pub y: i32,
}

/// 3D float vector
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vector3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

/// 3D integer vector
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Vector3i {
    /// X component
    pub x: i32,
    /// Y component
    pub y: i32,
    /// Z component
    pub z: i32,
}

/// 4D float vector
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vector4 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// W component
    pub w: f32,
}

/// RGBA color
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Color {
    /// Red
    pub r: f32,
    /// Green
    pub g: f32,
    /// Blue
    pub b: f32,
    /// Alpha
    pub a: f32,
}

/// Axis-aligned 2D rectangle
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Rect2 {
    /// Top-left corner
    pub position: Vector2,
    /// Width and height
    pub size: Vector2,
}

/// Rotation quaternion
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Quaternion {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// W component
    pub w: f32,
}

/// Plane in Hessian normal form
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Plane {
    /// Unit normal
    pub normal: Vector3,
    /// Distance from the origin
    pub d: f32,
}

impl Vector2 {
    /// Create a vector
    pub const fn new(x: f32, y: f32) -> Self {
        Vector2 { x, y }
    }
}

impl Vector2i {
    /// Create a vector
    pub const fn new(x: i32, y: i32) -> Self {
        Vector2i { x, y }
    }
}

impl Vector3 {
    /// Create a vector
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Vector3 { x, y, z }
    }
}

impl Vector3i {
    /// Create a vector
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Vector3i { x, y, z }
    }
}

impl Vector4 {
    /// Create a vector
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Vector4 { x, y, z, w }
    }
}

impl Color {
    /// Opaque white
    pub const WHITE: Color = Color::rgba(1.0, 1.0, 1.0, 1.0);
    /// Opaque black
    pub const BLACK: Color = Color::rgba(0.0, 0.0, 0.0, 1.0);

    /// Create a color from components
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Color { r, g, b, a }
    }
}

impl Rect2 {
    /// Create a rectangle
    pub const fn new(position: Vector2, size: Vector2) -> Self {
        Rect2 { position, size }
    }
}

impl Quaternion {
    /// No rotation
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}

impl Plane {
    /// Create a plane
    pub const fn new(normal: Vector3, d: f32) -> Self {
        Plane { normal, d }
    }
}
