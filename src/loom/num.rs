use std::{
    any::TypeId,
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{LazyLock, RwLock},
};

use bytemuck::Pod;
use derive_more::Display;
use half::f16;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::tensor::Tensor;

/// Compact runtime identifier of an element type.
pub type TypeToken = u8;

/// Upper bound of the token space. Tokens range over `0..MAX_TOKEN`.
pub const MAX_TOKEN: TypeToken = 255;

/// Number of native compute types. Native tokens are exactly `0..NUM_NATIVE_TYPES`.
pub const NUM_NATIVE_TYPES: usize = 4;

/// Names of the native compute types, in token order.
pub const NATIVE_TYPES: [&str; NUM_NATIVE_TYPES] = ["f32", "f64", "i32", "u32"];

/// How a registered type may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeKind {
    /// Enumerated at compile time; dispatched through dense tables.
    Native,
    /// Dispatched through the registry.
    Compute,
    /// Can be stored and moved, but not dispatched on.
    Storage,
}

macro_rules! impl_bytemuck {
    ($ty:ty) => {
        unsafe impl ::bytemuck::Zeroable for $ty {}
        unsafe impl ::bytemuck::Pod for $ty {}
    };
}

pub(crate) use impl_bytemuck;

/// An element type that can live inside a tensor.
pub trait Scalar: Sized + Pod + Zero + Debug + Send + Sync + 'static {}

impl Scalar for f32 {}
impl Scalar for f64 {}
impl Scalar for i32 {}
impl Scalar for u32 {}
impl Scalar for f16 {}
impl Scalar for u8 {}

pub trait Zero {
    fn zero() -> Self;
}

impl Zero for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f64 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for i32 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u32 {
    fn zero() -> Self {
        0
    }
}

impl Zero for f16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for u8 {
    fn zero() -> Self {
        0
    }
}

/// Value conversion between compute types, going through `f64`.
///
/// Float to integer conversions saturate, and NaN maps to zero.
pub trait Cast: Scalar {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;

    #[inline]
    fn cast<U: Cast>(self) -> U {
        U::from_f64(self.to_f64())
    }
}

macro_rules! impl_cast {
    ($($ty:ty),+) => {
        $(
            impl Cast for $ty {
                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )+
    };
}

impl_cast!(f32, f64, i32, u32);

impl Cast for f16 {
    #[inline]
    fn to_f64(self) -> f64 {
        self.to_f64()
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

/// Runtime description of an element type.
///
/// Two infos compare equal iff they carry the same token.
#[derive(Debug, Clone, Copy, Display)]
#[display("{name}")]
pub struct TypeInfo {
    token: TypeToken,
    size: usize,
    name: &'static str,
    type_id: TypeId,
    tensor_type_id: TypeId,
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for TypeInfo {}

impl Hash for TypeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl TypeInfo {
    /// Returns the info of `T`, registering it as a storage type if it is not known yet.
    ///
    /// # Panics
    /// Panics if all [`MAX_TOKEN`] tokens are in use.
    pub fn of<T: Scalar>() -> Self {
        let id = TypeId::of::<T>();
        if let Some(info) = TYPE_REGISTRY
            .read()
            .expect("failed to lock type registry")
            .get(id)
        {
            return info;
        }
        TYPE_REGISTRY
            .write()
            .expect("failed to lock type registry")
            .insert::<T>(TypeKind::Storage)
    }

    /// Returns the info of a registered token.
    pub fn from_token(token: TypeToken) -> Option<Self> {
        let registry = TYPE_REGISTRY.read().expect("failed to lock type registry");
        registry.entries.get(token as usize).map(|entry| entry.info)
    }

    #[inline]
    pub fn token(&self) -> TypeToken {
        self.token
    }

    /// Size in bytes of one element.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The [`TypeId`] of the element type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The [`TypeId`] of `Tensor<T>` for this element type `T`.
    #[inline]
    pub fn tensor_type_id(&self) -> TypeId {
        self.tensor_type_id
    }

    /// Current kind of the type. Storage types may later be promoted to compute types.
    pub fn kind(&self) -> TypeKind {
        let registry = TYPE_REGISTRY.read().expect("failed to lock type registry");
        registry
            .entries
            .get(self.token as usize)
            .map(|entry| entry.kind)
            .unwrap_or(TypeKind::Storage)
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        is_native(self.token)
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        self.kind() != TypeKind::Storage
    }

    /// Checks if this is the info of `T`.
    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

/// Anything that knows its runtime element type.
pub trait HasTypeInfo {
    fn type_info(&self) -> TypeInfo;
}

impl HasTypeInfo for TypeInfo {
    #[inline]
    fn type_info(&self) -> TypeInfo {
        *self
    }
}

/// Returns the token of a value exposing (or being) a [`TypeInfo`].
#[inline]
pub fn get_type_token(x: &(impl HasTypeInfo + ?Sized)) -> TypeToken {
    x.type_info().token
}

/// Returns the token of `T`.
#[inline]
pub fn type_token<T: Scalar>() -> TypeToken {
    TypeInfo::of::<T>().token
}

/// Checks if the token belongs to a native compute type.
#[inline]
pub const fn is_native(token: TypeToken) -> bool {
    (token as usize) < NUM_NATIVE_TYPES
}

/// Registers `T` as a compute type usable with registry dispatch, promoting it if it was
/// previously known as a storage type. Native types are left untouched.
///
/// # Panics
/// Panics if all [`MAX_TOKEN`] tokens are in use.
pub fn register_compute_type<T: Scalar>() -> TypeInfo {
    let mut registry = TYPE_REGISTRY.write().expect("failed to lock type registry");
    let info = match registry.get(TypeId::of::<T>()) {
        Some(info) => info,
        None => registry.insert::<T>(TypeKind::Compute),
    };
    let entry = &mut registry.entries[info.token as usize];
    if entry.kind == TypeKind::Storage {
        log::debug!("promote type {} (token {}) to compute", info.name, info.token);
        entry.kind = TypeKind::Compute;
    }
    info
}

#[derive(Debug, Clone, Copy)]
struct TypeEntry {
    info: TypeInfo,
    kind: TypeKind,
}

#[derive(Debug, Default)]
struct TypeRegistry {
    entries: Vec<TypeEntry>,
    tokens: HashMap<TypeId, TypeToken>,
}

impl TypeRegistry {
    fn get(&self, id: TypeId) -> Option<TypeInfo> {
        let token = self.tokens.get(&id)?;
        self.entries.get(*token as usize).map(|entry| entry.info)
    }

    fn insert<T: Scalar>(&mut self, kind: TypeKind) -> TypeInfo {
        // another thread may have won the race for the write lock
        if let Some(info) = self.get(TypeId::of::<T>()) {
            return info;
        }

        let token = self.entries.len();
        assert!(
            token < MAX_TOKEN as usize,
            "type registry is full: cannot register {}",
            std::any::type_name::<T>()
        );
        let token = token as TypeToken;

        let info = TypeInfo {
            token,
            size: size_of::<T>(),
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            tensor_type_id: TypeId::of::<Tensor<T>>(),
        };
        self.entries.push(TypeEntry { info, kind });
        self.tokens.insert(info.type_id, token);
        log::debug!("register type {} as {kind} with token {token}", info.name);
        info
    }
}

static TYPE_REGISTRY: LazyLock<RwLock<TypeRegistry>> = LazyLock::new(|| {
    let mut registry = TypeRegistry::default();
    // native types must take the first tokens, in the order of `NATIVE_TYPES`
    registry.insert::<f32>(TypeKind::Native);
    registry.insert::<f64>(TypeKind::Native);
    registry.insert::<i32>(TypeKind::Native);
    registry.insert::<u32>(TypeKind::Native);
    registry.insert::<f16>(TypeKind::Compute);
    registry.insert::<u8>(TypeKind::Storage);
    RwLock::new(registry)
});
