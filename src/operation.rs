use crate::error::EngineError;
use crate::models::DType;

/// Trait for array elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + Send
    + Sync
    + std::fmt::Debug
    + num_traits::AsPrimitive<f64>
    + zerocopy::AsBytes
    + zerocopy::FromBytes
    + 'static
{
}

/// Blanket implementation of Element.
impl<T> Element for T where
    T: Clone
        + Copy
        + PartialOrd
        + Send
        + Sync
        + std::fmt::Debug
        + num_traits::AsPrimitive<f64>
        + zerocopy::AsBytes
        + zerocopy::FromBytes
        + 'static
{
}

/// Maps a Rust numeric type to its [DType].
pub trait HasDType: Element {
    const DTYPE: DType;
}

macro_rules! impl_has_dtype {
    ($($t:ty => $dtype:ident),* $(,)?) => {
        $(
            impl HasDType for $t {
                const DTYPE: DType = DType::$dtype;
            }
        )*
    };
}

impl_has_dtype!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
);

/// Trait for operations on numerical data of a type only known at runtime.
///
/// This trait provides an entry point into the type system based on the runtime `dtype` value.
/// The operation carries its own inputs; [dispatch] picks the concrete element type.
pub trait TypedOperation {
    type Output;

    fn execute_t<T: Element>(self) -> Result<Self::Output, EngineError>;
}

/// Execute the operation.
///
/// This function dispatches to `execute_t` based on the `dtype`.
pub fn dispatch<O: TypedOperation>(dtype: DType, operation: O) -> Result<O::Output, EngineError> {
    // Convert runtime data type into concrete types.
    match dtype {
        DType::Int8 => operation.execute_t::<i8>(),
        DType::Int16 => operation.execute_t::<i16>(),
        DType::Int32 => operation.execute_t::<i32>(),
        DType::Int64 => operation.execute_t::<i64>(),
        DType::Uint8 => operation.execute_t::<u8>(),
        DType::Uint16 => operation.execute_t::<u16>(),
        DType::Uint32 => operation.execute_t::<u32>(),
        DType::Uint64 => operation.execute_t::<u64>(),
        DType::Float32 => operation.execute_t::<f32>(),
        DType::Float64 => operation.execute_t::<f64>(),
    }
}
