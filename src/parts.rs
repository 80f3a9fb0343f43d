//! Split values into array data and static configuration.
//!
//! Problems and states decompose into the arrays they carry and the scalar
//! settings that describe how to read them. The configuration half is always
//! serde-serialisable on its own, so it can be stored or compared while the
//! arrays travel separately.

/// Symmetric decomposition into `(data, config)` and back.
///
/// `Self::from_parts(x.to_parts())` must rebuild a value equal to `x`.
pub trait Parts: Sized {
    type Data;
    type Config;

    fn to_parts(&self) -> (Self::Data, Self::Config);

    fn from_parts(data: Self::Data, config: Self::Config) -> Self;
}
