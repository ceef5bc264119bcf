//! Hooks for encoding UDF arguments without this crate depending on any
//! particular serialization format.

/// Implemented by callers to turn their own argument types into the raw byte
/// blob a background scan's UDF trio expects.
pub trait UdfArgEncoder {
    fn encode_udf_args(&self) -> Vec<u8>;
}

impl UdfArgEncoder for Vec<u8> {
    fn encode_udf_args(&self) -> Vec<u8> {
        self.clone()
    }
}
