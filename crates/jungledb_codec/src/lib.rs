//! # JungleDB Codec
//!
//! Record values, key paths and canonical binary encoding for JungleDB.
//!
//! This crate provides:
//! - [`Value`] - the dynamic, tree-shaped record type stored in object
//!   stores, with a total order so values can serve as secondary keys
//! - [`KeyPath`] - attribute paths used to extract secondary keys from
//!   records
//! - A deterministic binary encoding ([`to_canonical_bytes`] /
//!   [`from_canonical_bytes`]) and the [`Codec`] trait used by persistent
//!   backend adapters
//!
//! ## Canonical encoding rules
//!
//! - Map keys are sorted
//! - Integers use the shortest encoding
//! - No floats
//! - Strings must be UTF-8
//! - No indefinite-length items

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod decoder;
mod encoder;
mod error;
mod keypath;
mod value;

pub use codec::{BinaryCodec, Codec};
pub use decoder::from_canonical_bytes;
pub use encoder::to_canonical_bytes;
pub use error::{CodecError, CodecResult};
pub use keypath::KeyPath;
pub use value::Value;
