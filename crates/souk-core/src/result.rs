//! Result type aliases for Souk.

use crate::SoukError;

/// A specialized `Result` type for Souk operations.
pub type SoukResult<T> = Result<T, SoukError>;
