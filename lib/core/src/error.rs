//! Error handling foundation for dealflow.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each crate defines its own domain-specific error types in their own
//! error modules; the control surface wraps them in a `Report` so callers
//! can attach context as errors propagate.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_works() {
        let ok: Result<u64> = Ok(7);
        assert_eq!(ok.expect("should be ok"), 7);
    }
}
