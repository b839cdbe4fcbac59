use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::DispatchError;
use crate::loom::num::{MAX_TOKEN, NUM_NATIVE_TYPES, TypeInfo, TypeToken, is_native};

const fn ceil_log2(n: u64) -> u32 {
    match n {
        0 | 1 => 0,
        n => u64::BITS - (n - 1).leading_zeros(),
    }
}

const KEY_BITS: u32 = u64::BITS;
const ARITY_BITS: u32 = 8;

/// Bits taken by each token in a [`NativeDispatchKey`].
pub const BITS_PER_NATIVE_TYPE: u32 = ceil_log2(NUM_NATIVE_TYPES as u64);
/// Bits taken by each token in a [`DispatchKey`].
pub const BITS_PER_TYPE: u32 = ceil_log2(MAX_TOKEN as u64 - 1);
/// Maximum number of types a [`NativeDispatchKey`] may encode.
pub const MAX_NATIVE_DISPATCH_TYPES: usize = (KEY_BITS / BITS_PER_NATIVE_TYPE) as usize;
/// Maximum number of types a [`DispatchKey`] may encode.
pub const MAX_DISPATCH_TYPES: usize = ((KEY_BITS - ARITY_BITS) / BITS_PER_TYPE) as usize;

/// Dense key of `N` native types: the most significant token comes first, with no arity field.
///
/// The key of a tuple is its index in the table built by
/// [`native_dispatch_table!`](crate::native_dispatch_table). Keys of different arity are
/// different types, so they can never be compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0:#x}")]
pub struct NativeDispatchKey<const N: usize>(u64);

impl<const N: usize> NativeDispatchKey<N> {
    /// Packs `N` native tokens.
    ///
    /// Requesting more than [`MAX_NATIVE_DISPATCH_TYPES`] tokens fails to build.
    pub fn from_tokens(tokens: [TypeToken; N]) -> Self {
        const {
            assert!(
                N <= MAX_NATIVE_DISPATCH_TYPES,
                "too many types for a native dispatch key"
            )
        };
        debug_assert!(tokens.iter().all(|&token| is_native(token)));
        let key = tokens.iter().fold(0u64, |key, &token| {
            (key << BITS_PER_NATIVE_TYPE) | token as u64
        });
        Self(key)
    }

    /// Packs the tokens of `N` types, which must all be native.
    pub fn from_types(types: &[TypeInfo; N]) -> Result<Self, DispatchError> {
        match types.iter().find(|info| !info.is_native()) {
            Some(&info) => Err(DispatchError::NonNativeType(info)),
            None => Ok(Self::from_tokens(types.map(|info| info.token()))),
        }
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Position of the kernel in a dense dispatch table.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn tokens(self) -> [TypeToken; N] {
        let mask = (1u64 << BITS_PER_NATIVE_TYPE) - 1;
        std::array::from_fn(|index| {
            let shift = (N - 1 - index) as u32 * BITS_PER_NATIVE_TYPE;
            ((self.0 >> shift) & mask) as TypeToken
        })
    }

    /// Re-encodes the key into a general one.
    pub fn to_general(self) -> DispatchKey {
        DispatchKey::new(self.tokens())
    }
}

/// General key of up to [`MAX_DISPATCH_TYPES`] tokens, with the arity in the top byte.
///
/// Keys of any arity can share a single map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0:#018x}")]
pub struct DispatchKey(u64);

impl DispatchKey {
    const ARITY_SHIFT: u32 = KEY_BITS - ARITY_BITS;

    /// Packs a fixed number of tokens.
    ///
    /// Requesting more than [`MAX_DISPATCH_TYPES`] tokens fails to build.
    pub fn new<const N: usize>(tokens: [TypeToken; N]) -> Self {
        const {
            assert!(
                N <= MAX_DISPATCH_TYPES,
                "too many types for a dispatch key"
            )
        };
        Self::pack(&tokens)
    }

    /// Packs a runtime number of tokens.
    pub fn from_tokens(tokens: &[TypeToken]) -> Result<Self, DispatchError> {
        match tokens.len() {
            count if count > MAX_DISPATCH_TYPES => Err(DispatchError::TooManyTypes {
                count,
                max: MAX_DISPATCH_TYPES,
            }),
            _ => Ok(Self::pack(tokens)),
        }
    }

    /// Packs the tokens of some types.
    pub fn from_types(types: &[TypeInfo]) -> Result<Self, DispatchError> {
        let tokens: Vec<_> = types.iter().map(TypeInfo::token).collect();
        Self::from_tokens(&tokens)
    }

    fn pack(tokens: &[TypeToken]) -> Self {
        let key = tokens
            .iter()
            .fold(0u64, |key, &token| (key << BITS_PER_TYPE) | token as u64);
        Self(key | (tokens.len() as u64) << Self::ARITY_SHIFT)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of tokens in the key.
    #[inline]
    pub fn arity(self) -> usize {
        (self.0 >> Self::ARITY_SHIFT) as usize
    }

    pub fn tokens(self) -> Vec<TypeToken> {
        let n = self.arity();
        let mask = (1u64 << BITS_PER_TYPE) - 1;
        (0..n)
            .map(|index| {
                let shift = (n - 1 - index) as u32 * BITS_PER_TYPE;
                ((self.0 >> shift) & mask) as TypeToken
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(BITS_PER_NATIVE_TYPE, 2);
        assert_eq!(BITS_PER_TYPE, 8);
        assert_eq!(MAX_NATIVE_DISPATCH_TYPES, 32);
        assert_eq!(MAX_DISPATCH_TYPES, 7);
    }

    #[test]
    fn test_general_key_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let mut rng = fastrand::Rng::with_seed(42);
        for n in 0..=MAX_DISPATCH_TYPES {
            for _ in 0..16 {
                let tokens: Vec<TypeToken> =
                    (0..n).map(|_| rng.u8(..MAX_TOKEN)).collect();
                let key = DispatchKey::from_tokens(&tokens)?;
                assert_eq!(key.arity(), n);
                assert_eq!(key.tokens(), tokens);
            }
        }

        let tokens = [0; MAX_DISPATCH_TYPES + 1];
        assert!(matches!(
            DispatchKey::from_tokens(&tokens),
            Err(DispatchError::TooManyTypes { count: 8, max: 7 })
        ));
        Ok(())
    }

    #[test]
    fn test_general_key_arity() {
        // all-zero tuples of different length stay distinct
        let keys: Vec<_> = (1..=MAX_DISPATCH_TYPES)
            .map(|n| DispatchKey::from_tokens(&vec![0; n]))
            .collect::<Result<_, _>>()
            .expect("valid key");
        assert!(keys.iter().all_unique());
    }

    #[test]
    fn test_native_key() {
        let key = NativeDispatchKey::from_tokens([1, 3]);
        assert_eq!(key.index(), 0b0111);
        assert_eq!(key.tokens(), [1, 3]);
        assert_eq!(key.to_general(), DispatchKey::new([1, 3]));

        let key = NativeDispatchKey::from_tokens([3, 0, 2]);
        assert_eq!(key.index(), 3 * 16 + 2);
        assert_eq!(key.tokens(), [3, 0, 2]);
    }

    #[test]
    fn test_native_pair_keys_distinct() {
        let keys: Vec<_> = (0..NUM_NATIVE_TYPES as TypeToken)
            .cartesian_product(0..NUM_NATIVE_TYPES as TypeToken)
            .map(|(a, b)| NativeDispatchKey::from_tokens([a, b]))
            .collect();
        assert_eq!(keys.len(), 16);
        assert!(keys.iter().all_unique());
        // dense: the keys cover exactly the table indices
        let mut indices: Vec<_> = keys.iter().map(|key| key.index()).collect();
        indices.sort();
        assert_eq!(indices, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_native_key_from_types() {
        use half::f16;

        let types = [TypeInfo::of::<f64>(), TypeInfo::of::<u32>()];
        let key = NativeDispatchKey::from_types(&types).expect("native types");
        assert_eq!(key.tokens(), [1, 3]);

        let types = [TypeInfo::of::<f32>(), TypeInfo::of::<f16>()];
        assert!(matches!(
            NativeDispatchKey::from_types(&types),
            Err(DispatchError::NonNativeType(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() -> Result<(), Box<dyn std::error::Error>> {
        let key = DispatchKey::new([4, 0, 5]);
        let json = serde_json::to_string(&key)?;
        assert_eq!(serde_json::from_str::<DispatchKey>(&json)?, key);

        let key = NativeDispatchKey::from_tokens([2, 1]);
        let json = serde_json::to_string(&key)?;
        assert_eq!(serde_json::from_str::<NativeDispatchKey<2>>(&json)?, key);
        Ok(())
    }
}
