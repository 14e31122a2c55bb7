use sha2::{Digest, Sha256};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0; 32]);

            #[inline]
            pub const fn as_array(&self) -> &[u8; 32] {
                &self.0
            }

            #[inline]
            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }
        }

        impl From<[u8; 32]> for $name {
            #[inline]
            fn from(value: [u8; 32]) -> Self {
                Self(value)
            }
        }

        impl AsRef<[u8]> for $name {
            #[inline]
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let len = f.precision().unwrap_or(32).min(32);
                f.write_str(&hex::encode(&self.0[..len]))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

define_id! {
    /// Network identity of a validator.
    ValidatorId
}

define_id! {
    /// SHA-256 of a serialized proposer block.
    BlockId
}

define_id! {
    /// Identifier of a state summary.
    SummaryId
}

impl BlockId {
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl SummaryId {
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}
